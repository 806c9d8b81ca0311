// ==========================================
// 工厂健康监控系统 - 产能规划器
// ==========================================
// 职责: 档位 → 并发准入上限
// 红线: 纯函数, 每次准入决策重新计算, 不跨档位变化缓存
// ==========================================

use crate::config::EngineConfig;
use crate::domain::factory::Factory;
use crate::domain::types::FactoryBand;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityPlanner {
    operational_ceiling: u32,
    degraded_ceiling: u32,
}

impl CapacityPlanner {
    pub fn new(operational_ceiling: u32, degraded_ceiling: u32) -> Self {
        Self {
            operational_ceiling,
            degraded_ceiling,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.operational_ceiling, config.degraded_ceiling)
    }

    /// 档位对应的上限: OPERATIONAL → 满额, DEGRADED → 降额, CRITICAL/DOWN → 0
    pub fn capacity(&self, band: FactoryBand) -> u32 {
        match band {
            FactoryBand::Operational => self.operational_ceiling,
            FactoryBand::Degraded => self.degraded_ceiling,
            FactoryBand::Critical | FactoryBand::Down => 0,
        }
    }

    /// 实际准入上限（恢复门控关闭时为 0）
    pub fn admission_capacity(&self, factory: &Factory) -> u32 {
        if factory.admission_enabled {
            self.capacity(factory.band)
        } else {
            0
        }
    }

    pub fn available(&self, factory: &Factory) -> u32 {
        factory.available_slots(self.admission_capacity(factory))
    }

    /// 可接收新分配: 档位非 CRITICAL/DOWN 且有剩余槽位
    pub fn is_eligible(&self, factory: &Factory) -> bool {
        !factory.band.requires_reschedule() && self.available(factory) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_capacity_by_band() {
        let p = CapacityPlanner::from_config(&EngineConfig::default());
        assert_eq!(p.capacity(FactoryBand::Operational), 5);
        assert_eq!(p.capacity(FactoryBand::Degraded), 1);
        assert_eq!(p.capacity(FactoryBand::Critical), 0);
        assert_eq!(p.capacity(FactoryBand::Down), 0);
    }

    #[test]
    fn test_admission_gate_and_load() {
        let p = CapacityPlanner::new(5, 1);
        let mut f = Factory::provisioned("F1", Utc::now());
        f.load = 4;
        assert_eq!(p.available(&f), 1);
        assert!(p.is_eligible(&f));

        f.admission_enabled = false;
        assert_eq!(p.available(&f), 0);
        assert!(!p.is_eligible(&f));

        f.admission_enabled = true;
        f.band = FactoryBand::Degraded;
        assert_eq!(p.available(&f), 0); // load 4 > 降额 1
    }
}

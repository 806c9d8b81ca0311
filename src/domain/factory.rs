// ==========================================
// 工厂健康监控系统 - 工厂领域模型
// ==========================================
// 健康字段由 Aggregator 派生; load 只由分配引擎/迁移引擎修改
// ==========================================

use crate::domain::types::{FactoryBand, SensorStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ==========================================
// Factory - 工厂（持久化行）
// ==========================================
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Factory {
    pub factory_id: String,

    // ===== 健康（派生, 非权威） =====
    pub health_percentage: f64,
    pub band: FactoryBand,

    // ===== 负载 =====
    pub load: u32, // 当前占用的活动分配数

    // ===== 恢复门控 =====
    pub admission_enabled: bool, // 跌入 CRITICAL/DOWN 后关闭, 连续确认 OPERATIONAL 后恢复
    pub recovery_streak: u32,

    pub updated_at: DateTime<Utc>,
}

impl Factory {
    /// 新开通工厂: 默认 OPERATIONAL, 可准入
    pub fn provisioned(factory_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            factory_id: factory_id.to_string(),
            health_percentage: 100.0,
            band: FactoryBand::Operational,
            load: 0,
            admission_enabled: true,
            recovery_streak: 0,
            updated_at: now,
        }
    }

    /// 在给定容量上限下的剩余槽位
    pub fn available_slots(&self, capacity: u32) -> u32 {
        capacity.saturating_sub(self.load)
    }
}

// ==========================================
// FactoryHealth - 聚合结果
// ==========================================
// 纯函数输出: 相同传感器状态集合 → 相同结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactoryHealth {
    pub factory_id: String,
    pub total_sensors: u32,
    pub ok_sensors: u32,
    pub warning_sensors: u32,
    pub failed_sensors: u32,
    pub eligible_sensors: u32, // OK 且未标记风险
    pub health_percentage: f64,
    pub band: FactoryBand,
}

impl FactoryHealth {
    pub fn count_for(&self, status: SensorStatus) -> u32 {
        match status {
            SensorStatus::Ok => self.ok_sensors,
            SensorStatus::Warning => self.warning_sensors,
            SensorStatus::Failed => self.failed_sensors,
        }
    }
}

// ==========================================
// FactoryStatusView - 状态查询视图
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactoryStatusView {
    pub factory_id: String,
    pub health_percentage: f64,
    pub band: FactoryBand,
    pub capacity: u32,
    pub load: u32,
    pub admission_enabled: bool,
}

/// 档位迁移
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandChange {
    pub from: FactoryBand,
    pub to: FactoryBand,
}

impl BandChange {
    /// 进入 CRITICAL/DOWN（从非迁移档位）
    pub fn enters_reschedule_zone(&self) -> bool {
        self.to.requires_reschedule() && !self.from.requires_reschedule()
    }

    pub fn is_worsening(&self) -> bool {
        self.to > self.from
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_slots_saturates() {
        let mut f = Factory::provisioned("F1", Utc::now());
        f.load = 3;
        assert_eq!(f.available_slots(5), 2);
        assert_eq!(f.available_slots(1), 0);
        assert_eq!(f.available_slots(0), 0);
    }

    #[test]
    fn test_band_change_zone() {
        let c = BandChange {
            from: FactoryBand::Degraded,
            to: FactoryBand::Critical,
        };
        assert!(c.enters_reschedule_zone());
        assert!(c.is_worsening());

        let c = BandChange {
            from: FactoryBand::Critical,
            to: FactoryBand::Down,
        };
        assert!(!c.enters_reschedule_zone());
        assert!(c.is_worsening());
    }
}

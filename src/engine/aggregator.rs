// ==========================================
// 工厂健康监控系统 - 工厂健康聚合引擎
// ==========================================
// 职责: 由传感器状态集合派生 health_percentage 与档位
// 红线: compute 是纯函数, 不含隐藏计数器
// 副作用: recompute 写回健康字段, 档位变化时追加 HealthEvent
// ==========================================

use crate::db::run_with_retry;
use crate::domain::factory::{BandChange, FactoryHealth};
use crate::domain::health_event::HealthEvent;
use crate::domain::sensor::Sensor;
use crate::domain::types::{FactoryBand, ReasonCode, SensorStatus};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::repositories::EngineRepositories;
use chrono::{DateTime, Utc};
use tracing::info;

/// 聚合结果
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateResult {
    pub health: FactoryHealth,
    pub band_change: Option<BandChange>,
}

// ==========================================
// HealthAggregator - 健康聚合器
// ==========================================
pub struct HealthAggregator {
    repos: EngineRepositories,
}

impl HealthAggregator {
    pub fn new(repos: EngineRepositories) -> Self {
        Self { repos }
    }

    /// 计算工厂健康（纯函数）
    ///
    /// 规则:
    /// - health_percentage = 100 * OK数 / 总数 (无传感器按 0)
    /// - 档位由固定阈值映射
    /// - 可用生产传感器 (OK 且未标记风险) 为 0 时档位为 DOWN
    pub fn compute<'a>(factory_id: &str, sensors: impl IntoIterator<Item = &'a Sensor>) -> FactoryHealth {
        let mut total = 0u32;
        let mut ok = 0u32;
        let mut warning = 0u32;
        let mut failed = 0u32;
        let mut eligible = 0u32;

        for s in sensors {
            total += 1;
            match s.status {
                SensorStatus::Ok => ok += 1,
                SensorStatus::Warning => warning += 1,
                SensorStatus::Failed => failed += 1,
            }
            if s.is_eligible_producer() {
                eligible += 1;
            }
        }

        let health_percentage = if total == 0 {
            0.0
        } else {
            100.0 * ok as f64 / total as f64
        };
        let band = if eligible == 0 {
            FactoryBand::Down
        } else {
            FactoryBand::from_percentage(health_percentage)
        };

        FactoryHealth {
            factory_id: factory_id.to_string(),
            total_sensors: total,
            ok_sensors: ok,
            warning_sensors: warning,
            failed_sensors: failed,
            eligible_sensors: eligible,
            health_percentage,
            band,
        }
    }

    /// 重新聚合并写回
    ///
    /// # 返回
    /// - band_change: 档位变化时为 Some, 已追加 BAND_CHANGED 事件
    pub fn recompute<'a>(
        &self,
        factory_id: &str,
        sensors: impl IntoIterator<Item = &'a Sensor>,
        now: DateTime<Utc>,
    ) -> EngineResult<AggregateResult> {
        let health = Self::compute(factory_id, sensors);
        let factory = self
            .repos
            .factory_repo
            .find_by_id(factory_id)?
            .ok_or_else(|| EngineError::UnknownFactory(factory_id.to_string()))?;

        let policy = self.repos.tx_policy;
        run_with_retry(&policy, || {
            self.repos.factory_repo.update_health(
                factory_id,
                health.health_percentage,
                health.band,
                now,
            )
        })?;

        let band_change = if factory.band != health.band {
            let change = BandChange {
                from: factory.band,
                to: health.band,
            };
            let event = HealthEvent::factory(
                factory_id,
                Some(change.from.to_string()),
                change.to,
                ReasonCode::BandChanged,
                health.health_percentage,
                now,
            );
            run_with_retry(&policy, || self.repos.event_log_repo.append_health_event(&event))?;
            info!(
                factory_id = %factory_id,
                from = %change.from,
                to = %change.to,
                health_percentage = health.health_percentage,
                "工厂档位变化"
            );
            Some(change)
        } else {
            None
        };

        Ok(AggregateResult { health, band_change })
    }
}

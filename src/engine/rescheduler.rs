// ==========================================
// 工厂健康监控系统 - 工厂级迁移引擎
// ==========================================
// 职责: 工厂进入 CRITICAL/DOWN 时把活动分配迁往其他工厂
// 红线: 一个分配 = 一个事务; 单个分配失败不阻塞其余分配
// 红线: 找不到目标的分配留在原工厂, 下一次扫描重试
// 恢复: 连续 recovery_confirmations 个扫描周期 OPERATIONAL 才重新开放准入
// ==========================================

use crate::config::EngineConfig;
use crate::domain::factory::BandChange;
use crate::domain::health_event::{FailoverEvent, HealthEvent};
use crate::domain::types::{FactoryBand, ReasonCode};
use crate::engine::assignment::{compact_queue, rank_candidates};
use crate::engine::capacity::CapacityPlanner;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::repositories::EngineRepositories;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

/// 迁移触发来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescheduleTrigger {
    /// 档位跌入 CRITICAL/DOWN
    BandChange,
    /// 定时扫描重试
    Sweep,
}

/// 单个分配的迁移记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migration {
    pub assignment_id: String,
    pub order_id: String,
    pub from_factory: String,
    pub to_factory: String,
    pub queue_position: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RescheduleReport {
    pub factory_id: String,
    pub migrated: Vec<Migration>,
    pub deferred: Vec<String>, // assignment_id
}

impl RescheduleReport {
    pub fn is_complete(&self) -> bool {
        self.deferred.is_empty()
    }
}

/// 恢复门控的一次观察结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryUpdate {
    pub admission_enabled: bool,
    pub recovery_streak: u32,
    /// 本周期刚刚重新开放准入
    pub confirmed: bool,
}

enum MigrationStep {
    Moved(Migration),
    Deferred,
    Gone,
}

pub struct Rescheduler {
    repos: EngineRepositories,
    planner: CapacityPlanner,
    recovery_confirmations: u32,
}

impl Rescheduler {
    pub fn new(repos: EngineRepositories, config: &EngineConfig) -> Self {
        Self {
            repos,
            planner: CapacityPlanner::from_config(config),
            recovery_confirmations: config.recovery_confirmations.max(1),
        }
    }

    /// 档位变化处理
    ///
    /// - 进入 CRITICAL/DOWN: 关闭准入, 清零恢复计数, 迁移全部活动分配
    /// - 进入其他非 OPERATIONAL 档位: 清零恢复计数
    pub fn on_band_change(
        &self,
        factory_id: &str,
        change: BandChange,
        health_percentage: f64,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<RescheduleReport>> {
        if change.to.requires_reschedule() {
            self.repos.in_tx(|tx| {
                let factory = tx
                    .factory(factory_id)?
                    .ok_or_else(|| EngineError::UnknownFactory(factory_id.to_string()))?;
                tx.update_admission(factory_id, false, 0, now)?;
                if factory.admission_enabled {
                    tx.append_health_event(&HealthEvent::factory(
                        factory_id,
                        Some(change.from.to_string()),
                        change.to,
                        ReasonCode::AdmissionSuspended,
                        health_percentage,
                        now,
                    ))?;
                }
                Ok(())
            })?;
            info!(factory_id = %factory_id, band = %change.to, "工厂准入已暂停，开始迁移");
            return self
                .reschedule(factory_id, RescheduleTrigger::BandChange, now)
                .map(Some);
        }

        if change.to != FactoryBand::Operational {
            self.reset_streak(factory_id, now)?;
        }
        Ok(None)
    }

    /// 迁移工厂内全部活动分配
    ///
    /// # 说明
    /// - 每个分配独立事务
    /// - 存储不可用直接返回错误, 其余错误记为 deferred
    #[instrument(skip(self, now))]
    pub fn reschedule(
        &self,
        factory_id: &str,
        trigger: RescheduleTrigger,
        now: DateTime<Utc>,
    ) -> EngineResult<RescheduleReport> {
        let mut report = RescheduleReport {
            factory_id: factory_id.to_string(),
            ..Default::default()
        };

        let active = self.repos.order_repo.list_active_by_factory(factory_id)?;
        for a in active {
            match self.migrate_one(factory_id, &a.assignment_id, trigger, now) {
                Ok(MigrationStep::Moved(m)) => {
                    info!(
                        assignment_id = %m.assignment_id,
                        from = %m.from_factory,
                        to = %m.to_factory,
                        queue_position = m.queue_position,
                        "分配已迁移"
                    );
                    report.migrated.push(m);
                }
                Ok(MigrationStep::Deferred) => report.deferred.push(a.assignment_id),
                Ok(MigrationStep::Gone) => {}
                Err(e) if e.is_store_unavailable() => return Err(e),
                Err(e) => {
                    warn!(assignment_id = %a.assignment_id, error = %e, "分配迁移失败，下次扫描重试");
                    report.deferred.push(a.assignment_id);
                }
            }
        }

        if !report.deferred.is_empty() {
            warn!(
                factory_id = %factory_id,
                deferred = report.deferred.len(),
                migrated = report.migrated.len(),
                "部分分配无可用目标工厂，延后迁移"
            );
        }
        Ok(report)
    }

    fn migrate_one(
        &self,
        source: &str,
        assignment_id: &str,
        trigger: RescheduleTrigger,
        now: DateTime<Utc>,
    ) -> EngineResult<MigrationStep> {
        self.repos.in_tx(|tx| {
            // 事务内重读, 扫描期间可能已完成/取消/迁走
            let mut a = match tx.assignment(assignment_id)? {
                Some(a) if a.status.is_active() && a.factory_id == source => a,
                _ => return Ok(MigrationStep::Gone),
            };

            let factories = tx.factories()?;
            let mut target = None;
            for candidate in rank_candidates(&self.planner, &factories, Some(source)) {
                let capacity = self.planner.admission_capacity(candidate);
                if tx.reserve_slot(&candidate.factory_id, capacity, now)? {
                    target = Some(candidate.factory_id.clone());
                    break;
                }
            }

            let Some(target) = target else {
                if trigger == RescheduleTrigger::BandChange {
                    tx.append_failover_event(
                        &FailoverEvent::new(source, ReasonCode::MigrationDeferred, now)
                            .with_assignment(&a.order_id, &a.assignment_id)
                            .with_sensors(a.sensor_id.as_deref(), None)
                            .with_detail("no eligible destination factory"),
                    )?;
                } else {
                    debug!(assignment_id = %assignment_id, "扫描重试: 仍无目标工厂");
                }
                return Ok(MigrationStep::Deferred);
            };

            tx.release_slot(source, now)?;
            let queue_position = tx.count_active(&target)? + 1;
            let old_sensor = a.sensor_id.take();
            let sensor_id = if queue_position == 1 {
                tx.first_eligible_sensor(&target, None)?
            } else {
                None
            };
            a.factory_id = target.clone();
            a.queue_position = queue_position;
            a.blocked = queue_position == 1 && sensor_id.is_none();
            a.sensor_id = sensor_id;
            a.updated_at = now;
            tx.update_assignment(&a)?;

            tx.append_failover_event(
                &FailoverEvent::new(source, ReasonCode::Migrated, now)
                    .with_assignment(&a.order_id, &a.assignment_id)
                    .with_target(&target)
                    .with_sensors(old_sensor.as_deref(), a.sensor_id.as_deref()),
            )?;
            compact_queue(tx, source, now)?;

            Ok(MigrationStep::Moved(Migration {
                assignment_id: a.assignment_id.clone(),
                order_id: a.order_id.clone(),
                from_factory: source.to_string(),
                to_factory: target,
                queue_position,
            }))
        })
    }

    /// 恢复门控: 每个扫描周期调用一次
    ///
    /// OPERATIONAL 且准入关闭 → 计数 +1, 达到阈值重新开放;
    /// 非 OPERATIONAL → 计数清零
    pub fn observe_cycle(
        &self,
        factory_id: &str,
        band: FactoryBand,
        health_percentage: f64,
        now: DateTime<Utc>,
    ) -> EngineResult<RecoveryUpdate> {
        let confirmations = self.recovery_confirmations;
        let update = self.repos.in_tx(|tx| {
            let factory = tx
                .factory(factory_id)?
                .ok_or_else(|| EngineError::UnknownFactory(factory_id.to_string()))?;

            if band != FactoryBand::Operational {
                if factory.recovery_streak > 0 {
                    tx.update_admission(factory_id, factory.admission_enabled, 0, now)?;
                }
                return Ok(RecoveryUpdate {
                    admission_enabled: factory.admission_enabled,
                    recovery_streak: 0,
                    confirmed: false,
                });
            }

            if factory.admission_enabled {
                return Ok(RecoveryUpdate {
                    admission_enabled: true,
                    recovery_streak: factory.recovery_streak,
                    confirmed: false,
                });
            }

            let streak = factory.recovery_streak + 1;
            if streak >= confirmations {
                tx.update_admission(factory_id, true, 0, now)?;
                tx.append_health_event(&HealthEvent::factory(
                    factory_id,
                    None,
                    band,
                    ReasonCode::RecoveryConfirmed,
                    health_percentage,
                    now,
                ))?;
                return Ok(RecoveryUpdate {
                    admission_enabled: true,
                    recovery_streak: 0,
                    confirmed: true,
                });
            }

            tx.update_admission(factory_id, false, streak, now)?;
            Ok(RecoveryUpdate {
                admission_enabled: false,
                recovery_streak: streak,
                confirmed: false,
            })
        })?;

        if update.confirmed {
            info!(factory_id = %factory_id, confirmations, "工厂恢复已确认，重新开放准入");
        } else if !update.admission_enabled {
            debug!(factory_id = %factory_id, streak = update.recovery_streak, "恢复确认计数");
        }
        Ok(update)
    }

    fn reset_streak(&self, factory_id: &str, now: DateTime<Utc>) -> EngineResult<()> {
        self.repos.in_tx(|tx| {
            if let Some(f) = tx.factory(factory_id)? {
                if f.recovery_streak > 0 {
                    tx.update_admission(factory_id, f.admission_enabled, 0, now)?;
                }
            }
            Ok(())
        })
    }
}

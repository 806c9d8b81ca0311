// ==========================================
// 工厂健康监控系统 - 传感器级替换引擎
// ==========================================
// 职责: 生产传感器失效/风险时, 在同一工厂内替换为最小序号的可用传感器
// 红线: 替换不改变 completed_quantity, 已完成进度不回退
// 红线: 无可用传感器 → 分配挂起 (blocked), 不丢弃
// 前置: 调用方须先把 Tracker 状态写回 sensors 镜像
// ==========================================

use crate::domain::health_event::FailoverEvent;
use crate::domain::types::ReasonCode;
use crate::engine::error::EngineResult;
use crate::engine::repositories::EngineRepositories;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

/// 单个分配的替换结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RerouteOutcome {
    Replaced {
        assignment_id: String,
        order_id: String,
        from_sensor: Option<String>,
        to_sensor: String,
    },
    Blocked {
        assignment_id: String,
        order_id: String,
        from_sensor: Option<String>,
    },
}

impl RerouteOutcome {
    pub fn assignment_id(&self) -> &str {
        match self {
            RerouteOutcome::Replaced { assignment_id, .. } | RerouteOutcome::Blocked { assignment_id, .. } => {
                assignment_id
            }
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, RerouteOutcome::Blocked { .. })
    }
}

pub struct SensorFailover {
    repos: EngineRepositories,
}

impl SensorFailover {
    pub fn new(repos: EngineRepositories) -> Self {
        Self { repos }
    }

    /// 替换使用 failed_sensor 的全部活动分配（单事务）
    #[instrument(skip(self))]
    pub fn reroute(&self, factory_id: &str, failed_sensor: &str, now: DateTime<Utc>) -> EngineResult<Vec<RerouteOutcome>> {
        let outcomes = self.repos.in_tx(|tx| {
            let mut outcomes = Vec::new();
            let affected = tx
                .active_assignments(factory_id)?
                .into_iter()
                .filter(|a| a.sensor_id.as_deref() == Some(failed_sensor));

            for mut a in affected {
                let replacement = tx.first_eligible_sensor(factory_id, Some(failed_sensor))?;
                a.updated_at = now;
                match replacement {
                    Some(to_sensor) => {
                        a.sensor_id = Some(to_sensor.clone());
                        a.blocked = false;
                        tx.update_assignment(&a)?;
                        tx.append_failover_event(
                            &FailoverEvent::new(factory_id, ReasonCode::SensorReplaced, now)
                                .with_assignment(&a.order_id, &a.assignment_id)
                                .with_sensors(Some(failed_sensor), Some(&to_sensor)),
                        )?;
                        outcomes.push(RerouteOutcome::Replaced {
                            assignment_id: a.assignment_id,
                            order_id: a.order_id,
                            from_sensor: Some(failed_sensor.to_string()),
                            to_sensor,
                        });
                    }
                    None => {
                        a.sensor_id = None;
                        a.blocked = true;
                        tx.update_assignment(&a)?;
                        tx.append_failover_event(
                            &FailoverEvent::new(factory_id, ReasonCode::SensorExhausted, now)
                                .with_assignment(&a.order_id, &a.assignment_id)
                                .with_sensors(Some(failed_sensor), None)
                                .with_detail("no eligible sensor left in factory"),
                        )?;
                        outcomes.push(RerouteOutcome::Blocked {
                            assignment_id: a.assignment_id,
                            order_id: a.order_id,
                            from_sensor: Some(failed_sensor.to_string()),
                        });
                    }
                }
            }
            Ok(outcomes)
        })?;

        for outcome in &outcomes {
            match outcome {
                RerouteOutcome::Replaced { assignment_id, to_sensor, .. } => info!(
                    factory_id = %factory_id,
                    assignment_id = %assignment_id,
                    from = %failed_sensor,
                    to = %to_sensor,
                    "生产传感器已替换"
                ),
                RerouteOutcome::Blocked { assignment_id, .. } => warn!(
                    factory_id = %factory_id,
                    assignment_id = %assignment_id,
                    sensor_id = %failed_sensor,
                    "工厂内无可用传感器，分配挂起"
                ),
            }
        }
        Ok(outcomes)
    }

    /// 为挂起的队首分配重新寻找生产传感器
    pub fn resume_blocked(&self, factory_id: &str, now: DateTime<Utc>) -> EngineResult<Vec<RerouteOutcome>> {
        let outcomes = self.repos.in_tx(|tx| {
            let mut outcomes = Vec::new();
            for mut a in tx.active_assignments(factory_id)? {
                if !a.blocked {
                    continue;
                }
                let Some(to_sensor) = tx.first_eligible_sensor(factory_id, None)? else {
                    break;
                };
                a.sensor_id = Some(to_sensor.clone());
                a.blocked = false;
                a.updated_at = now;
                tx.update_assignment(&a)?;
                tx.append_failover_event(
                    &FailoverEvent::new(factory_id, ReasonCode::SensorReplaced, now)
                        .with_assignment(&a.order_id, &a.assignment_id)
                        .with_sensors(None, Some(&to_sensor))
                        .with_detail("resumed"),
                )?;
                outcomes.push(RerouteOutcome::Replaced {
                    assignment_id: a.assignment_id,
                    order_id: a.order_id,
                    from_sensor: None,
                    to_sensor,
                });
            }
            Ok(outcomes)
        })?;

        if !outcomes.is_empty() {
            info!(factory_id = %factory_id, resumed = outcomes.len(), "挂起分配已恢复生产");
        }
        Ok(outcomes)
    }
}

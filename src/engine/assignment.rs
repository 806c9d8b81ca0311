// ==========================================
// 工厂健康监控系统 - 订单分配引擎
// ==========================================
// 职责: 新订单准入/拆分、生产进度推进、订单取消
// 红线: 一次准入 = 一个事务, 要么全部预留要么全部回滚
// 红线: "无产能" 返回 Pending, 不是错误
// ==========================================
// 排序规则: 负载升序 → 健康度降序 → factory_id
// 拆分规则: 每个工厂最多一片, 每片不超过 unit_cap
// ==========================================

use crate::config::EngineConfig;
use crate::domain::factory::Factory;
use crate::domain::order::{derive_order_status, Assignment, NewOrder, Order};
use crate::domain::types::{AssignmentStatus, OrderStatus};
use crate::engine::capacity::CapacityPlanner;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::repositories::EngineRepositories;
use crate::repository::StoreTx;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

// ==========================================
// 准入结果
// ==========================================

/// 订单保持 pending 的原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PendingReason {
    /// 没有任何可准入工厂
    NoEligibleFactory,
    /// 可准入工厂的分片总量不足以覆盖订单数量
    InsufficientCapacity { shortfall: u32 },
    /// 指定工厂当前不可准入
    FactoryIneligible { factory_id: String },
    /// 提交阶段容量冲突, 重排次数耗尽
    ConflictRetriesExhausted,
}

impl fmt::Display for PendingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingReason::NoEligibleFactory => write!(f, "没有可准入的工厂"),
            PendingReason::InsufficientCapacity { shortfall } => {
                write!(f, "可用产能不足, 缺口 {}", shortfall)
            }
            PendingReason::FactoryIneligible { factory_id } => {
                write!(f, "工厂 {} 当前不可准入", factory_id)
            }
            PendingReason::ConflictRetriesExhausted => write!(f, "容量冲突重试耗尽"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdmissionOutcome {
    Assigned { assignments: Vec<Assignment> },
    Pending { reason: PendingReason },
}

impl AdmissionOutcome {
    pub fn is_assigned(&self) -> bool {
        matches!(self, AdmissionOutcome::Assigned { .. })
    }

    pub fn assignments(&self) -> &[Assignment] {
        match self {
            AdmissionOutcome::Assigned { assignments } => assignments,
            AdmissionOutcome::Pending { .. } => &[],
        }
    }
}

/// 进度推进结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressOutcome {
    pub assignment: Assignment,
    pub completed: bool,
    pub order_status: OrderStatus,
}

// ==========================================
// 排序与拆分（纯函数）
// ==========================================

/// 按准入优先级排序可准入工厂
///
/// # 参数
/// - exclude: 排除的工厂（迁移时排除源工厂）
pub fn rank_candidates<'a>(
    planner: &CapacityPlanner,
    factories: &'a [Factory],
    exclude: Option<&str>,
) -> Vec<&'a Factory> {
    let mut ranked: Vec<&Factory> = factories
        .iter()
        .filter(|f| exclude.map_or(true, |ex| f.factory_id != ex))
        .filter(|f| planner.is_eligible(f))
        .collect();
    ranked.sort_by(|a, b| {
        a.load
            .cmp(&b.load)
            .then_with(|| b.health_percentage.total_cmp(&a.health_percentage))
            .then_with(|| a.factory_id.cmp(&b.factory_id))
    });
    ranked
}

/// 将数量按 unit_cap 拆分到排序后的工厂, 每个工厂一片
///
/// # 返回
/// - Ok(plan): (factory_id, 数量) 列表, 数量之和等于 quantity
/// - Err(shortfall): 工厂用尽仍有剩余
pub fn plan_split(quantity: u32, ranked: &[&Factory], unit_cap: u32) -> Result<Vec<(String, u32)>, u32> {
    let cap = unit_cap.max(1);
    let mut remaining = quantity;
    let mut plan = Vec::new();
    for f in ranked {
        if remaining == 0 {
            break;
        }
        let chunk = remaining.min(cap);
        plan.push((f.factory_id.clone(), chunk));
        remaining -= chunk;
    }
    if remaining > 0 {
        Err(remaining)
    } else {
        Ok(plan)
    }
}

// ==========================================
// 事务内共用步骤
// ==========================================

/// 重新编排工厂队列: 位置从 1 连续编号, 队首缺传感器时补齐
pub(crate) fn compact_queue(tx: &StoreTx<'_>, factory_id: &str, now: DateTime<Utc>) -> EngineResult<()> {
    let active = tx.active_assignments(factory_id)?;
    for (i, mut a) in active.into_iter().enumerate() {
        let position = i as u32 + 1;
        let mut changed = a.queue_position != position;
        a.queue_position = position;
        if position == 1 && a.sensor_id.is_none() {
            a.sensor_id = tx.first_eligible_sensor(factory_id, None)?;
            a.blocked = a.sensor_id.is_none();
            changed = true;
        }
        if changed {
            a.updated_at = now;
            tx.update_assignment(&a)?;
        }
    }
    Ok(())
}

/// 由分配集合推进订单状态（只前进, 终态不变）
pub(crate) fn refresh_order_status(tx: &StoreTx<'_>, order_id: &str, now: DateTime<Utc>) -> EngineResult<OrderStatus> {
    let order = tx
        .order(order_id)?
        .ok_or_else(|| EngineError::UnknownOrder(order_id.to_string()))?;
    if order.status.is_terminal() {
        return Ok(order.status);
    }
    let derived = derive_order_status(&tx.assignments_for_order(order_id)?);
    if derived.progress_rank() > order.status.progress_rank() {
        tx.update_order_status(order_id, derived, now)?;
        return Ok(derived);
    }
    Ok(order.status)
}

// ==========================================
// AssignmentEngine - 订单分配引擎
// ==========================================
pub struct AssignmentEngine {
    repos: EngineRepositories,
    planner: CapacityPlanner,
    unit_cap: u32,
    admission_attempts: u32,
}

impl AssignmentEngine {
    pub fn new(repos: EngineRepositories, config: &EngineConfig) -> Self {
        Self {
            repos,
            planner: CapacityPlanner::from_config(config),
            unit_cap: config.unit_cap,
            admission_attempts: config.admission_attempts.max(1),
        }
    }

    /// 创建订单（pending）
    pub fn create_order(&self, request: &NewOrder, now: DateTime<Utc>) -> EngineResult<Order> {
        request.validate().map_err(EngineError::InvalidInput)?;
        let order = Order {
            order_id: Uuid::new_v4().to_string(),
            product_type: request.product_type.trim().to_string(),
            quantity: request.quantity,
            priority: request.priority,
            deadline: request.deadline,
            status: OrderStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        self.repos.in_tx(|tx| {
            tx.insert_order(&order)?;
            Ok(())
        })?;
        info!(order_id = %order.order_id, quantity = order.quantity, "订单已创建");
        Ok(order)
    }

    /// 准入订单
    ///
    /// # 参数
    /// - order_id: 订单ID（必须为 pending）
    /// - factory_id: 指定工厂; None 表示由引擎选择
    ///
    /// # 返回
    /// - Assigned: 全部数量已在同一事务内预留
    /// - Pending: 无产能 / 指定工厂不可准入 / 冲突重试耗尽
    pub fn admit(
        &self,
        order_id: &str,
        factory_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> EngineResult<AdmissionOutcome> {
        self.admit_with_view(order_id, factory_id, None, now)
    }

    /// 以调用方持有的工厂快照完成首轮排序
    ///
    /// 快照可能已过期: 提交阶段在事务内复核, 冲突后重新读取工厂列表再排序。
    #[instrument(skip(self, view), fields(attempts = self.admission_attempts))]
    pub fn admit_with_view(
        &self,
        order_id: &str,
        factory_id: Option<&str>,
        mut view: Option<Vec<Factory>>,
        now: DateTime<Utc>,
    ) -> EngineResult<AdmissionOutcome> {
        let order = self
            .repos
            .order_repo
            .find_order(order_id)?
            .ok_or_else(|| EngineError::UnknownOrder(order_id.to_string()))?;
        if order.status != OrderStatus::Pending {
            return Err(EngineError::InvalidStateTransition {
                from: order.status.to_string(),
                to: OrderStatus::Assigned.to_string(),
            });
        }

        for attempt in 1..=self.admission_attempts {
            // 排序阶段读快照, 提交阶段在事务内复核
            let factories = match view.take() {
                Some(factories) => factories,
                None => self.repos.factory_repo.list_all()?,
            };
            let plan = match self.plan(&order, &factories, factory_id)? {
                Ok(plan) => plan,
                Err(reason) => {
                    info!(order_id = %order_id, reason = %reason, "订单保持 pending");
                    return Ok(AdmissionOutcome::Pending { reason });
                }
            };

            match self.commit(&order, &plan, now) {
                Ok(assignments) => {
                    info!(
                        order_id = %order_id,
                        slices = assignments.len(),
                        factories = ?plan.iter().map(|(f, _)| f.as_str()).collect::<Vec<_>>(),
                        "订单已分配"
                    );
                    return Ok(AdmissionOutcome::Assigned { assignments });
                }
                Err(EngineError::CapacityConflict { factory_id: conflicted }) => {
                    warn!(
                        order_id = %order_id,
                        factory_id = %conflicted,
                        attempt,
                        "提交时容量冲突，重新排序"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Ok(AdmissionOutcome::Pending {
            reason: PendingReason::ConflictRetriesExhausted,
        })
    }

    /// 生成拆分方案
    fn plan(
        &self,
        order: &Order,
        factories: &[Factory],
        explicit: Option<&str>,
    ) -> EngineResult<Result<Vec<(String, u32)>, PendingReason>> {
        if let Some(fid) = explicit {
            let factory = factories
                .iter()
                .find(|f| f.factory_id == fid)
                .ok_or_else(|| EngineError::UnknownFactory(fid.to_string()))?;
            if !self.planner.is_eligible(factory) {
                return Ok(Err(PendingReason::FactoryIneligible {
                    factory_id: fid.to_string(),
                }));
            }
            // 指定工厂: 整单落在该工厂
            return Ok(Ok(vec![(fid.to_string(), order.quantity)]));
        }

        let ranked = rank_candidates(&self.planner, factories, None);
        if ranked.is_empty() {
            return Ok(Err(PendingReason::NoEligibleFactory));
        }
        Ok(plan_split(order.quantity, &ranked, self.unit_cap)
            .map_err(|shortfall| PendingReason::InsufficientCapacity { shortfall }))
    }

    /// 事务内预留并写入分配
    fn commit(&self, order: &Order, plan: &[(String, u32)], now: DateTime<Utc>) -> EngineResult<Vec<Assignment>> {
        self.repos.in_tx(|tx| {
            let current = tx
                .order(&order.order_id)?
                .ok_or_else(|| EngineError::UnknownOrder(order.order_id.clone()))?;
            if current.status != OrderStatus::Pending {
                return Err(EngineError::InvalidStateTransition {
                    from: current.status.to_string(),
                    to: OrderStatus::Assigned.to_string(),
                });
            }

            let mut created = Vec::with_capacity(plan.len());
            for (factory_id, quantity) in plan {
                let factory = tx
                    .factory(factory_id)?
                    .ok_or_else(|| EngineError::UnknownFactory(factory_id.clone()))?;
                let capacity = self.planner.admission_capacity(&factory);
                if factory.band.requires_reschedule() || !tx.reserve_slot(factory_id, capacity, now)? {
                    return Err(EngineError::CapacityConflict {
                        factory_id: factory_id.clone(),
                    });
                }

                let queue_position = tx.count_active(factory_id)? + 1;
                let sensor_id = if queue_position == 1 {
                    tx.first_eligible_sensor(factory_id, None)?
                } else {
                    None
                };
                let assignment = Assignment {
                    assignment_id: Uuid::new_v4().to_string(),
                    order_id: order.order_id.clone(),
                    factory_id: factory_id.clone(),
                    blocked: queue_position == 1 && sensor_id.is_none(),
                    sensor_id,
                    assigned_quantity: *quantity,
                    completed_quantity: 0,
                    queue_position,
                    status: AssignmentStatus::Assigned,
                    created_at: now,
                    updated_at: now,
                };
                tx.insert_assignment(&assignment)?;
                created.push(assignment);
            }

            tx.update_order_status(&order.order_id, OrderStatus::Assigned, now)?;
            Ok(created)
        })
    }

    /// 依次尝试准入所有 pending 订单（优先级降序）
    pub fn admit_pending(&self, now: DateTime<Utc>) -> EngineResult<Vec<(String, AdmissionOutcome)>> {
        let pending = self.repos.order_repo.list_pending()?;
        let mut results = Vec::with_capacity(pending.len());
        let mut factories = self.repos.factory_repo.list_all()?;
        for order in pending {
            let outcome = self.admit_with_view(&order.order_id, None, Some(factories.clone()), now)?;
            for a in outcome.assignments() {
                if let Some(f) = factories.iter_mut().find(|f| f.factory_id == a.factory_id) {
                    f.load += 1;
                }
            }
            // 全部工厂不可准入时后续订单无需再试
            let stop = matches!(
                outcome,
                AdmissionOutcome::Pending {
                    reason: PendingReason::NoEligibleFactory
                }
            );
            results.push((order.order_id, outcome));
            if stop {
                break;
            }
        }
        Ok(results)
    }

    /// 推进生产进度
    ///
    /// # 说明
    /// - completed_quantity 不超过 assigned_quantity
    /// - 完成时释放负载、压缩队列, 下一个队首获得生产传感器
    #[instrument(skip(self))]
    pub fn record_progress(&self, assignment_id: &str, units: u32, now: DateTime<Utc>) -> EngineResult<ProgressOutcome> {
        self.repos.in_tx(|tx| {
            let mut a = tx
                .assignment(assignment_id)?
                .ok_or_else(|| EngineError::UnknownAssignment(assignment_id.to_string()))?;
            if !a.status.is_active() {
                return Err(EngineError::InvalidStateTransition {
                    from: a.status.to_string(),
                    to: AssignmentStatus::InProgress.to_string(),
                });
            }

            a.completed_quantity = a
                .completed_quantity
                .saturating_add(units)
                .min(a.assigned_quantity);
            let completed = a.completed_quantity == a.assigned_quantity;
            a.status = if completed {
                AssignmentStatus::Completed
            } else {
                AssignmentStatus::InProgress
            };
            a.updated_at = now;
            tx.update_assignment(&a)?;

            if completed {
                tx.release_slot(&a.factory_id, now)?;
                compact_queue(tx, &a.factory_id, now)?;
                debug!(assignment_id = %assignment_id, factory_id = %a.factory_id, "分配已完成");
            }

            let order_status = refresh_order_status(tx, &a.order_id, now)?;
            Ok(ProgressOutcome {
                assignment: a,
                completed,
                order_status,
            })
        })
    }

    /// 取消订单: 非终态分配全部取消并释放负载
    #[instrument(skip(self))]
    pub fn cancel_order(&self, order_id: &str, now: DateTime<Utc>) -> EngineResult<Order> {
        let order = self.repos.in_tx(|tx| {
            let mut order = tx
                .order(order_id)?
                .ok_or_else(|| EngineError::UnknownOrder(order_id.to_string()))?;
            if order.status.is_terminal() {
                return Err(EngineError::InvalidStateTransition {
                    from: order.status.to_string(),
                    to: OrderStatus::Cancelled.to_string(),
                });
            }

            let mut touched = BTreeSet::new();
            for mut a in tx.assignments_for_order(order_id)? {
                if !a.status.is_active() {
                    continue;
                }
                a.status = AssignmentStatus::Cancelled;
                a.updated_at = now;
                tx.update_assignment(&a)?;
                tx.release_slot(&a.factory_id, now)?;
                touched.insert(a.factory_id);
            }
            for factory_id in &touched {
                compact_queue(tx, factory_id, now)?;
            }

            tx.update_order_status(order_id, OrderStatus::Cancelled, now)?;
            order.status = OrderStatus::Cancelled;
            order.updated_at = now;
            Ok(order)
        })?;
        info!(order_id = %order_id, "订单已取消");
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory(id: &str, load: u32, health: f64) -> Factory {
        let mut f = Factory::provisioned(id, Utc::now());
        f.load = load;
        f.health_percentage = health;
        f.band = crate::domain::types::FactoryBand::from_percentage(health);
        f
    }

    #[test]
    fn test_rank_by_load_then_health() {
        let planner = CapacityPlanner::new(5, 1);
        let factories = vec![
            factory("F1", 2, 100.0),
            factory("F2", 1, 85.0),
            factory("F3", 1, 95.0),
            factory("F4", 0, 40.0), // CRITICAL, 不可准入
        ];
        let ranked: Vec<&str> = rank_candidates(&planner, &factories, None)
            .iter()
            .map(|f| f.factory_id.as_str())
            .collect();
        assert_eq!(ranked, vec!["F3", "F2", "F1"]);

        let ranked: Vec<&str> = rank_candidates(&planner, &factories, Some("F3"))
            .iter()
            .map(|f| f.factory_id.as_str())
            .collect();
        assert_eq!(ranked, vec!["F2", "F1"]);
    }

    #[test]
    fn test_split_1200_over_two_factories() {
        let factories = vec![factory("F1", 0, 100.0), factory("F2", 0, 90.0), factory("F3", 0, 80.0)];
        let ranked: Vec<&Factory> = factories.iter().collect();
        let plan = plan_split(1200, &ranked, 1000).unwrap();
        assert_eq!(plan, vec![("F1".to_string(), 1000), ("F2".to_string(), 200)]);
    }

    #[test]
    fn test_split_shortfall() {
        let factories = vec![factory("F1", 0, 100.0)];
        let ranked: Vec<&Factory> = factories.iter().collect();
        assert_eq!(plan_split(1500, &ranked, 1000), Err(500));
        assert_eq!(plan_split(10, &[], 1000), Err(10));
    }
}

// ==========================================
// 工厂健康监控系统 - 存储事务
// ==========================================
// 红线: 订单/分配/工厂负载的写入只通过 StoreTx
// 规则: 一次准入/迁移/替换决策 = 一个事务; 不嵌套, 不跨事务持有状态
// 重试: 整个闭包在 BUSY/LOCKED 时按 RetryPolicy 重新执行
// ==========================================

use crate::db::{run_with_retry, RetryPolicy, TransientError};
use crate::domain::factory::Factory;
use crate::domain::health_event::{FailoverEvent, HealthEvent};
use crate::domain::order::{Assignment, Order};
use crate::domain::sensor::Sensor;
use crate::domain::types::OrderStatus;
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::{event_log_repo, factory_repo, order_repo, sensor_repo};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::sync::{Arc, Mutex};

/// 事务句柄
///
/// 闭包返回 Err 时事务随 StoreTx 一起 drop 并回滚。
pub struct StoreTx<'c> {
    tx: Transaction<'c>,
}

impl<'c> StoreTx<'c> {
    fn commit(self) -> RepositoryResult<()> {
        self.tx
            .commit()
            .map_err(RepositoryError::from)
    }

    // ===== 工厂 =====

    pub fn factory(&self, factory_id: &str) -> RepositoryResult<Option<Factory>> {
        factory_repo::find(&self.tx, factory_id)
    }

    pub fn factories(&self) -> RepositoryResult<Vec<Factory>> {
        factory_repo::list(&self.tx)
    }

    /// 条件占用槽位, 已满返回 false
    pub fn reserve_slot(&self, factory_id: &str, capacity: u32, now: DateTime<Utc>) -> RepositoryResult<bool> {
        factory_repo::reserve_slot(&self.tx, factory_id, capacity, now)
    }

    pub fn release_slot(&self, factory_id: &str, now: DateTime<Utc>) -> RepositoryResult<()> {
        factory_repo::release_slot(&self.tx, factory_id, now)
    }

    pub fn update_admission(
        &self,
        factory_id: &str,
        admission_enabled: bool,
        recovery_streak: u32,
        now: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        factory_repo::update_admission(&self.tx, factory_id, admission_enabled, recovery_streak, now)
    }

    // ===== 开通 =====

    pub fn insert_factory_if_absent(&self, factory: &Factory) -> RepositoryResult<bool> {
        factory_repo::insert_if_absent(&self.tx, factory)
    }

    pub fn insert_sensor_if_absent(&self, sensor: &Sensor) -> RepositoryResult<bool> {
        sensor_repo::insert_if_absent(&self.tx, sensor)
    }

    pub fn next_sensor_seq_no(&self, factory_id: &str) -> RepositoryResult<i64> {
        sensor_repo::next_seq_no(&self.tx, factory_id)
    }

    // ===== 传感器（只读） =====

    pub fn first_eligible_sensor(
        &self,
        factory_id: &str,
        exclude_sensor_id: Option<&str>,
    ) -> RepositoryResult<Option<String>> {
        sensor_repo::first_eligible(&self.tx, factory_id, exclude_sensor_id)
    }

    // ===== 订单 =====

    pub fn insert_order(&self, order: &Order) -> RepositoryResult<()> {
        order_repo::insert_order(&self.tx, order)
    }

    pub fn order(&self, order_id: &str) -> RepositoryResult<Option<Order>> {
        order_repo::find_order(&self.tx, order_id)
    }

    pub fn update_order_status(&self, order_id: &str, status: OrderStatus, now: DateTime<Utc>) -> RepositoryResult<()> {
        order_repo::update_order_status(&self.tx, order_id, status, now)
    }

    // ===== 分配 =====

    pub fn insert_assignment(&self, assignment: &Assignment) -> RepositoryResult<()> {
        order_repo::insert_assignment(&self.tx, assignment)
    }

    pub fn update_assignment(&self, assignment: &Assignment) -> RepositoryResult<()> {
        order_repo::update_assignment(&self.tx, assignment)
    }

    pub fn assignment(&self, assignment_id: &str) -> RepositoryResult<Option<Assignment>> {
        order_repo::find_assignment(&self.tx, assignment_id)
    }

    pub fn assignments_for_order(&self, order_id: &str) -> RepositoryResult<Vec<Assignment>> {
        order_repo::list_assignments_by_order(&self.tx, order_id)
    }

    pub fn active_assignments(&self, factory_id: &str) -> RepositoryResult<Vec<Assignment>> {
        order_repo::list_active_by_factory(&self.tx, factory_id)
    }

    pub fn count_active(&self, factory_id: &str) -> RepositoryResult<u32> {
        order_repo::count_active_by_factory(&self.tx, factory_id)
    }

    // ===== 审计 =====

    pub fn append_health_event(&self, event: &HealthEvent) -> RepositoryResult<()> {
        event_log_repo::insert_health_event(&self.tx, event)
    }

    pub fn append_failover_event(&self, event: &FailoverEvent) -> RepositoryResult<()> {
        event_log_repo::insert_failover_event(&self.tx, event)
    }
}

/// 在单个事务内执行闭包, 瞬时冲突时整体重试
///
/// # 参数
/// - conn: 共享连接
/// - policy: 重试策略
/// - op: 决策闭包; 返回 Err 则回滚
///
/// # 返回
/// - 闭包结果（已提交）
pub fn run_store_tx<T, E, F>(conn: &Arc<Mutex<Connection>>, policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    E: From<RepositoryError> + TransientError + std::fmt::Display,
    F: FnMut(&StoreTx<'_>) -> Result<T, E>,
{
    run_with_retry(policy, || {
        let mut guard = conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))?;
        let tx = guard
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(RepositoryError::from)?;
        let store = StoreTx { tx };
        let out = op(&store)?;
        store.commit()?;
        Ok(out)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{configure_sqlite_connection, init_schema};
    use std::time::Duration;

    fn setup() -> Arc<Mutex<Connection>> {
        let conn = Connection::open_in_memory().unwrap();
        configure_sqlite_connection(&conn).unwrap();
        init_schema(&conn).unwrap();
        factory_repo::insert_if_absent(&conn, &Factory::provisioned("F1", Utc::now())).unwrap();
        Arc::new(Mutex::new(conn))
    }

    #[test]
    fn test_error_rolls_back() {
        let conn = setup();
        let policy = RetryPolicy::new(1, Duration::from_millis(1));
        let now = Utc::now();

        let result: Result<(), RepositoryError> = run_store_tx(&conn, &policy, |tx| {
            assert!(tx.reserve_slot("F1", 5, now)?);
            Err(RepositoryError::ValidationError("abort".to_string()))
        });
        assert!(result.is_err());

        let guard = conn.lock().unwrap();
        assert_eq!(factory_repo::find(&guard, "F1").unwrap().unwrap().load, 0);
    }

    #[test]
    fn test_commit_persists() {
        let conn = setup();
        let policy = RetryPolicy::default();
        let now = Utc::now();

        let reserved: bool = run_store_tx::<_, RepositoryError, _>(&conn, &policy, |tx| {
            tx.reserve_slot("F1", 5, now)
        })
        .unwrap();
        assert!(reserved);

        let guard = conn.lock().unwrap();
        assert_eq!(factory_repo::find(&guard, "F1").unwrap().unwrap().load, 1);
    }
}

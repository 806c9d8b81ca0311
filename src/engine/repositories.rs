// ==========================================
// 工厂健康监控系统 - 引擎层仓储聚合
// ==========================================
// 职责: 聚合监控引擎所需的所有 Repository 与共享连接
// 说明: 写事务通过 conn + tx_policy 交给 run_store_tx
// ==========================================

use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use crate::db::RetryPolicy;
use crate::repository::{
    run_store_tx, EventLogRepository, FactoryRepository, OrderRepository, SensorRepository,
    StoreTx,
};
use crate::engine::error::EngineResult;

/// 监控引擎仓储集合
///
/// 所有仓储共享同一个 `Arc<Mutex<Connection>>`。
#[derive(Clone)]
pub struct EngineRepositories {
    /// 共享连接（事务入口）
    pub conn: Arc<Mutex<Connection>>,
    /// 工厂仓储
    pub factory_repo: Arc<FactoryRepository>,
    /// 传感器镜像仓储
    pub sensor_repo: Arc<SensorRepository>,
    /// 订单/分配仓储
    pub order_repo: Arc<OrderRepository>,
    /// 审计事件仓储
    pub event_log_repo: Arc<EventLogRepository>,
    /// 瞬时冲突重试策略
    pub tx_policy: RetryPolicy,
}

impl EngineRepositories {
    /// 从共享连接创建仓储集合
    pub fn from_connection(conn: Arc<Mutex<Connection>>, tx_policy: RetryPolicy) -> Self {
        Self {
            factory_repo: Arc::new(FactoryRepository::from_connection(conn.clone())),
            sensor_repo: Arc::new(SensorRepository::from_connection(conn.clone())),
            order_repo: Arc::new(OrderRepository::from_connection(conn.clone())),
            event_log_repo: Arc::new(EventLogRepository::from_connection(conn.clone())),
            conn,
            tx_policy,
        }
    }

    /// 在单个存储事务内执行决策
    pub fn in_tx<T, F>(&self, op: F) -> EngineResult<T>
    where
        F: FnMut(&StoreTx<'_>) -> EngineResult<T>,
    {
        run_store_tx(&self.conn, &self.tx_policy, op)
    }
}

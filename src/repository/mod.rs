// ==========================================
// 工厂健康监控系统 - 数据仓储层
// ==========================================
// 红线: Repository 不含业务逻辑
// ==========================================
// 职责: 提供数据访问接口,屏蔽数据库细节
// 约束: 所有查询使用参数化,防止 SQL 注入
// ==========================================

pub mod error;
pub mod event_log_repo;
pub mod factory_repo;
pub mod order_repo;
pub mod sensor_repo;
pub mod tx;

mod sql_utils;

// 重导出核心仓储
pub use error::{RepositoryError, RepositoryResult};
pub use event_log_repo::EventLogRepository;
pub use factory_repo::FactoryRepository;
pub use order_repo::OrderRepository;
pub use sensor_repo::SensorRepository;
pub use tx::{run_store_tx, StoreTx};

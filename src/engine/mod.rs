// ==========================================
// 工厂健康监控系统 - 引擎层
// ==========================================
// 职责: 实现监控与调度规则, 不拼 SQL
// 红线: 订单/分配/负载的写入只经 StoreTx, 一次决策一个事务
// 红线: 所有状态迁移必须输出 reason
// ==========================================

pub mod aggregator;
pub mod assignment;
pub mod capacity;
pub mod core;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod repositories;
pub mod rescheduler;
pub mod sensor_failover;
pub mod tracker;
pub mod work_snapshot;

// 重导出核心引擎
pub use aggregator::{AggregateResult, HealthAggregator};
pub use assignment::{
    plan_split, rank_candidates, AdmissionOutcome, AssignmentEngine, PendingReason, ProgressOutcome,
};
pub use capacity::CapacityPlanner;
pub use self::core::EngineCore;
pub use error::{EngineError, EngineResult};
pub use events::{
    report_with_retry, FactoryStatusReport, NoOpStatusReporter, OptionalStatusReporter,
    StatusReporter,
};
pub use orchestrator::{FactoryMonitor, MonitorOutcome};
pub use repositories::EngineRepositories;
pub use rescheduler::{Migration, RecoveryUpdate, RescheduleReport, RescheduleTrigger, Rescheduler};
pub use sensor_failover::{RerouteOutcome, SensorFailover};
pub use tracker::{SensorTracker, SensorTransition, TrackerUpdate};
pub use work_snapshot::{WorkSlice, WorkSnapshot, WorkSnapshotPublisher};

// ==========================================
// 工厂健康监控系统 - 核心库
// ==========================================
// 技术栈: tokio + Rust + SQLite
// 系统定位: 传感器健康 → 工厂健康度 → 订单准入/替换/迁移
// ==========================================

// ==========================================
// 模块声明
// ==========================================

// 领域层 - 实体与类型
pub mod domain;

// 数据仓储层 - 数据访问
pub mod repository;

// 引擎层 - 监控与调度规则
pub mod engine;

// 配置层 - 系统配置
pub mod config;

// 数据库基础设施（连接初始化/PRAGMA 统一/事务重试）
pub mod db;

// 日志系统
pub mod logging;

// API 层 - 业务接口
pub mod api;

// 运行时 - 每工厂 worker 与扫描定时器
pub mod runtime;

// ==========================================
// 重导出核心类型
// ==========================================

// 领域类型
pub use domain::types::{
    AssignmentStatus, FactoryBand, OrderStatus, ReasonCode, SensorStatus, SensorType,
};

// 领域实体
pub use domain::{
    Assignment, Factory, FactoryHealth, FactoryProvision, FailoverEvent, HealthEvent, NewOrder,
    Order, Sensor, SensorEvent, SensorSpec,
};

// 引擎
pub use engine::{
    AdmissionOutcome, AssignmentEngine, CapacityPlanner, EngineCore, FactoryMonitor,
    HealthAggregator, PendingReason, Rescheduler, SensorFailover, SensorTracker,
    WorkSnapshotPublisher,
};

// API
pub use api::{ApiError, ApiResult, FactoryApi, OrderApi};

// 运行时
pub use runtime::{EngineHandle, EngineRuntime};

// ==========================================
// 常量定义
// ==========================================

// 系统版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// 系统名称
pub const APP_NAME: &str = "工厂健康监控系统";

// 数据库版本
pub const DB_VERSION: &str = "v1";

// ==========================================
// 工厂健康监控系统 - 领域模型层
// ==========================================
// 职责: 定义领域实体、封闭状态类型、入站事件
// 红线: 不含数据访问逻辑,不含引擎逻辑
// ==========================================

pub mod event;
pub mod factory;
pub mod health_event;
pub mod order;
pub mod sensor;
pub mod types;

// 重导出核心类型
pub use event::{EventParseError, EventPayload, RawEventMessage, SensorEvent};
pub use factory::{BandChange, Factory, FactoryHealth, FactoryStatusView};
pub use health_event::{FailoverEvent, HealthEvent, HealthSubject};
pub use order::{derive_order_status, Assignment, NewOrder, Order, OrderDetail};
pub use sensor::{
    FactoryProvision, ReadingClass, Sensor, SensorReading, SensorSpec, SensorStatusView, SensorSummary,
    SensorThresholds,
};
pub use types::{
    AssignmentStatus, FactoryBand, OrderStatus, ParseEnumError, ReasonCode, SensorStatus,
    SensorType,
};

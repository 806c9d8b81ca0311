// ==========================================
// 工厂健康监控系统 - API 层
// ==========================================
// 职责: 提供业务 API 接口, 供外部适配层调用
// ==========================================

pub mod error;
pub mod factory_api;
pub mod order_api;

// 重导出核心类型
pub use error::{ApiError, ApiResult};
pub use factory_api::FactoryApi;
pub use order_api::{OrderApi, OrderSubmission};

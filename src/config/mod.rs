// ==========================================
// 工厂健康监控系统 - 配置层
// ==========================================
// 职责: 系统配置管理,默认值 + config_kv 覆写
// 存储: config_kv 表
// ==========================================

pub mod config_manager;
pub mod engine_config;

// 重导出核心配置管理器
pub use config_manager::{config_keys, ConfigManager, ConfigResult};
pub use engine_config::EngineConfig;

// ==========================================
// 工厂健康监控系统 - 引擎层错误类型
// ==========================================
// 约定: "无产能" 不是错误, 以 AdmissionOutcome::Pending 返回
// 只有存储不可用对整个引擎是致命的
// ==========================================

use crate::db::TransientError;
use crate::repository::error::RepositoryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("未知工厂: {0}")]
    UnknownFactory(String),

    #[error("未知订单: {0}")]
    UnknownOrder(String),

    #[error("未知分配: {0}")]
    UnknownAssignment(String),

    #[error("未知传感器: {0}")]
    UnknownSensor(String),

    /// 提交时发现目标工厂已满, 触发重新排序
    #[error("容量冲突: factory_id={factory_id}")]
    CapacityConflict { factory_id: String },

    #[error("输入非法: {0}")]
    InvalidInput(String),

    #[error("无效的状态转换: from={from} to={to}")]
    InvalidStateTransition { from: String, to: String },

    /// 工厂 worker 已停止或队列已关闭
    #[error("工厂 worker 不可用: {0}")]
    WorkerUnavailable(String),
}

impl EngineError {
    /// 存储不可用（致命）
    pub fn is_store_unavailable(&self) -> bool {
        match self {
            EngineError::Repository(e) => e.is_store_unavailable(),
            _ => false,
        }
    }
}

impl TransientError for EngineError {
    fn is_transient(&self) -> bool {
        matches!(self, EngineError::Repository(e) if e.is_transient())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

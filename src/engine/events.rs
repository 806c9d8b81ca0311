// ==========================================
// 工厂健康监控系统 - 对端状态上报
// ==========================================
// 职责: 定义档位变化上报 trait，实现依赖倒置
// 说明: 引擎只依赖 StatusReporter, 传输由运行时注入
// 红线: 上报失败只记录告警, 不回滚本地档位变化, 不阻塞事件处理
// ==========================================

use crate::db::RetryPolicy;
use crate::domain::factory::BandChange;
use crate::domain::types::FactoryBand;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

// ==========================================
// 上报内容
// ==========================================

/// 工厂状态上报
///
/// 对端据此决定自身的准入
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactoryStatusReport {
    pub factory_id: String,
    pub band: FactoryBand,
    pub previous_band: FactoryBand,
    pub health_percentage: f64,
    /// "recovered" / 档位小写名
    pub reason: String,
    pub reported_at: DateTime<Utc>,
}

impl FactoryStatusReport {
    pub fn from_change(factory_id: &str, change: BandChange, health_percentage: f64, now: DateTime<Utc>) -> Self {
        let reason = if change.to == FactoryBand::Operational {
            "recovered".to_string()
        } else {
            change.to.as_str().to_ascii_lowercase()
        };
        Self {
            factory_id: factory_id.to_string(),
            band: change.to,
            previous_band: change.from,
            health_percentage,
            reason,
            reported_at: now,
        }
    }
}

// ==========================================
// 上报 Trait
// ==========================================

/// 对端状态上报者
///
/// # 实现说明
/// - 单次调用不重试, 重试与超时由 `report_with_retry` 统一处理
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report_status(&self, report: &FactoryStatusReport) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// 空操作上报者
///
/// 用于未配置对端的部署与单元测试
#[derive(Debug, Clone, Default)]
pub struct NoOpStatusReporter;

#[async_trait]
impl StatusReporter for NoOpStatusReporter {
    async fn report_status(&self, report: &FactoryStatusReport) -> Result<(), Box<dyn Error + Send + Sync>> {
        tracing::debug!(
            "NoOpStatusReporter: 跳过状态上报 - factory_id={}, band={}",
            report.factory_id,
            report.band
        );
        Ok(())
    }
}

/// 可选的上报者包装
///
/// 简化 Option<Arc<dyn StatusReporter>> 的使用
#[derive(Clone, Default)]
pub struct OptionalStatusReporter {
    inner: Option<Arc<dyn StatusReporter>>,
}

impl OptionalStatusReporter {
    pub fn with_reporter(reporter: Arc<dyn StatusReporter>) -> Self {
        Self { inner: Some(reporter) }
    }

    pub fn none() -> Self {
        Self { inner: None }
    }

    pub fn is_configured(&self) -> bool {
        self.inner.is_some()
    }

    /// 带重试的上报; 未配置时直接返回 true
    pub async fn report(&self, report: &FactoryStatusReport, policy: RetryPolicy, timeout: Duration) -> bool {
        match &self.inner {
            Some(reporter) => report_with_retry(reporter.as_ref(), report, policy, timeout).await,
            None => {
                tracing::debug!(
                    "OptionalStatusReporter: 未配置上报者，跳过 - factory_id={}",
                    report.factory_id
                );
                true
            }
        }
    }
}

/// 按退避策略上报, 每次调用带超时
///
/// # 返回
/// - true: 对端已确认
/// - false: 重试耗尽（已记录告警, 调用方继续）
pub async fn report_with_retry(
    reporter: &dyn StatusReporter,
    report: &FactoryStatusReport,
    policy: RetryPolicy,
    timeout: Duration,
) -> bool {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        let failure = match tokio::time::timeout(timeout, reporter.report_status(report)).await {
            Ok(Ok(())) => {
                tracing::debug!(factory_id = %report.factory_id, band = %report.band, attempt, "状态上报成功");
                return true;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("超时 {:?}", timeout),
        };

        if attempt < attempts {
            let delay = policy.delay_for(attempt);
            tracing::debug!(
                factory_id = %report.factory_id,
                attempt,
                error = %failure,
                delay_ms = delay.as_millis() as u64,
                "状态上报失败，退避重试"
            );
            tokio::time::sleep(delay).await;
        } else {
            tracing::warn!(
                factory_id = %report.factory_id,
                band = %report.band,
                attempts,
                error = %failure,
                "对端不可达，放弃状态上报"
            );
        }
    }
    false
}

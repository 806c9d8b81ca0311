// ==========================================
// 工厂健康监控系统 - 单工厂 worker
// ==========================================
// 职责: 串行消费本工厂的命令队列
// 约束: 同一工厂的事件按入队顺序处理; 不同工厂之间无顺序保证
// 说明: FactoryMonitor 为同步实现, 经 spawn_blocking 执行后归还所有权
// ==========================================

use crate::config::EngineConfig;
use crate::domain::event::SensorEvent;
use crate::domain::sensor::{FactoryProvision, Sensor};
use crate::domain::types::SensorStatus;
use crate::engine::assignment::ProgressOutcome;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::events::{FactoryStatusReport, OptionalStatusReporter};
use crate::engine::orchestrator::{FactoryMonitor, MonitorOutcome};
use crate::repository::RepositoryError;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// 发往工厂 worker 的命令
#[derive(Debug)]
pub enum FactoryCommand {
    /// 入站传感器事件
    Event(SensorEvent),
    /// 定时扫描
    Sweep(DateTime<Utc>),
    /// 人工覆写
    Override {
        sensor_id: String,
        status: SensorStatus,
        hold_secs: i64,
        now: DateTime<Utc>,
        reply: oneshot::Sender<EngineResult<MonitorOutcome>>,
    },
    /// 生产进度
    Progress {
        assignment_id: String,
        units: u32,
        now: DateTime<Utc>,
        reply: oneshot::Sender<EngineResult<ProgressOutcome>>,
    },
    /// 开通/追加传感器
    Provision {
        request: FactoryProvision,
        now: DateTime<Utc>,
        reply: oneshot::Sender<EngineResult<Vec<Sensor>>>,
    },
    Shutdown,
}

impl FactoryCommand {
    fn kind(&self) -> &'static str {
        match self {
            FactoryCommand::Event(_) => "event",
            FactoryCommand::Sweep(_) => "sweep",
            FactoryCommand::Override { .. } => "override",
            FactoryCommand::Progress { .. } => "progress",
            FactoryCommand::Provision { .. } => "provision",
            FactoryCommand::Shutdown => "shutdown",
        }
    }
}

/// worker 主循环
///
/// # 返回
/// - Ok: 收到 Shutdown 或队列关闭
/// - Err: 存储不可用（致命）
pub(crate) async fn run_worker(
    mut monitor: FactoryMonitor,
    mut rx: mpsc::Receiver<FactoryCommand>,
    reporter: OptionalStatusReporter,
    config: Arc<EngineConfig>,
) -> EngineResult<()> {
    let factory_id = monitor.factory_id().to_string();
    info!(factory_id = %factory_id, "工厂 worker 已启动");

    while let Some(cmd) = rx.recv().await {
        if matches!(cmd, FactoryCommand::Shutdown) {
            break;
        }
        let kind = cmd.kind();

        let joined = tokio::task::spawn_blocking(move || {
            let result = process(&mut monitor, cmd);
            (monitor, result)
        })
        .await;
        let result = match joined {
            Ok((returned, result)) => {
                monitor = returned;
                result
            }
            Err(e) => {
                error!(factory_id = %factory_id, error = %e, "worker 任务执行失败");
                return Err(EngineError::WorkerUnavailable(factory_id));
            }
        };

        match result {
            Ok(Some(outcome)) => {
                if let (Some(change), Some(health)) = (outcome.band_change, outcome.health.as_ref()) {
                    let report =
                        FactoryStatusReport::from_change(&factory_id, change, health.health_percentage, Utc::now());
                    spawn_report(reporter.clone(), report, &config);
                }
            }
            Ok(None) => {}
            Err(e) if e.is_store_unavailable() => {
                error!(factory_id = %factory_id, kind, error = %e, "存储不可用，worker 停止");
                return Err(e);
            }
            Err(e) => warn!(factory_id = %factory_id, kind, error = %e, "命令处理失败"),
        }
    }

    info!(factory_id = %factory_id, "工厂 worker 已停止");
    Ok(())
}

fn process(monitor: &mut FactoryMonitor, cmd: FactoryCommand) -> EngineResult<Option<MonitorOutcome>> {
    match cmd {
        FactoryCommand::Event(event) => monitor.handle_event(&event).map(Some),
        FactoryCommand::Sweep(now) => monitor.sweep(now).map(Some),
        FactoryCommand::Override {
            sensor_id,
            status,
            hold_secs,
            now,
            reply,
        } => {
            let result = monitor.override_sensor(&sensor_id, status, hold_secs, now);
            let outcome = result.as_ref().ok().cloned();
            let fatal = match &result {
                Err(e) if e.is_store_unavailable() => Some(e.to_string()),
                _ => None,
            };
            if reply.send(result).is_err() {
                debug!(sensor_id = %sensor_id, "覆写调用方已放弃等待");
            }
            if let Some(msg) = fatal {
                return Err(RepositoryError::DatabaseConnectionError(msg).into());
            }
            Ok(outcome)
        }
        FactoryCommand::Progress {
            assignment_id,
            units,
            now,
            reply,
        } => {
            let result = monitor.core().record_progress(&assignment_id, units, now);
            if reply.send(result).is_err() {
                debug!(assignment_id = %assignment_id, "进度调用方已放弃等待");
            }
            Ok(None)
        }
        FactoryCommand::Provision { request, now, reply } => {
            let result = monitor.core().provision_factory(&request, now);
            let synced = match &result {
                Ok(_) => monitor.sync_provisioned(now).map(Some),
                Err(_) => Ok(None),
            };
            let fatal = match &result {
                Err(e) if e.is_store_unavailable() => Some(e.to_string()),
                _ => None,
            };
            if reply.send(result).is_err() {
                debug!(factory_id = %request.factory_id, "开通调用方已放弃等待");
            }
            if let Some(msg) = fatal {
                return Err(RepositoryError::DatabaseConnectionError(msg).into());
            }
            synced
        }
        FactoryCommand::Shutdown => Ok(None),
    }
}

/// 异步上报档位变化, 不阻塞 worker
fn spawn_report(reporter: OptionalStatusReporter, report: FactoryStatusReport, config: &EngineConfig) {
    if !reporter.is_configured() {
        return;
    }
    let policy = config.peer_retry_policy();
    let timeout = config.peer_timeout();
    tokio::spawn(async move {
        reporter.report(&report, policy, timeout).await;
    });
}

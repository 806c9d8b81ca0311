// ==========================================
// 工厂健康监控系统 - 运行时
// ==========================================
// 职责: 每个工厂一个 tokio 任务 + 有界命令队列, 外加扫描定时器
// 约束: 扫描定时器只投递 Sweep 命令, 不直接修改任何状态
// ==========================================

pub mod worker;

pub use worker::FactoryCommand;

use crate::config::EngineConfig;
use crate::domain::event::SensorEvent;
use crate::domain::sensor::{FactoryProvision, Sensor};
use crate::domain::types::SensorStatus;
use crate::engine::assignment::ProgressOutcome;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::events::OptionalStatusReporter;
use crate::engine::orchestrator::{FactoryMonitor, MonitorOutcome};
use crate::engine::EngineCore;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// 工厂 → 命令队列; 运行期间开通的工厂追加到此表, 定时器共享同一份
type SenderMap = Arc<RwLock<HashMap<String, mpsc::Sender<FactoryCommand>>>>;

// ==========================================
// EngineRuntime - 运行时启动器
// ==========================================
pub struct EngineRuntime;

impl EngineRuntime {
    /// 为所有已开通工厂启动 worker 与扫描定时器
    ///
    /// 须在 tokio 运行时内调用。
    pub fn start(core: Arc<EngineCore>, reporter: OptionalStatusReporter) -> EngineResult<EngineHandle> {
        let config = core.config().clone();
        let factories = core.repos().factory_repo.list_all()?;

        let mut map = HashMap::new();
        let mut workers = Vec::with_capacity(factories.len());
        for factory in &factories {
            let monitor = FactoryMonitor::load(core.clone(), &factory.factory_id)?;
            let (tx, worker) = spawn_worker(monitor, &reporter, &config);
            workers.push(worker);
            map.insert(factory.factory_id.clone(), tx);
        }
        let factory_count = map.len();
        let senders: SenderMap = Arc::new(RwLock::new(map));

        let ticker = spawn_sweep_ticker(senders.clone(), config.sweep_period());
        info!(
            factories = factory_count,
            sweep_period_ms = config.sweep_period_ms,
            peer_configured = reporter.is_configured(),
            "监控运行时已启动"
        );

        Ok(EngineHandle {
            core,
            reporter,
            senders,
            workers,
            ticker,
        })
    }
}

fn spawn_worker(
    monitor: FactoryMonitor,
    reporter: &OptionalStatusReporter,
    config: &Arc<EngineConfig>,
) -> (mpsc::Sender<FactoryCommand>, JoinHandle<EngineResult<()>>) {
    let (tx, rx) = mpsc::channel(config.worker_queue_depth.max(1));
    let worker = tokio::spawn(worker::run_worker(monitor, rx, reporter.clone(), config.clone()));
    (tx, worker)
}

fn spawn_sweep_ticker(senders: SenderMap, period: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        // 首个扫描在一个周期之后, 启动时不立即判定超时
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let now = Utc::now();
            let guard = senders.read().await;
            for (factory_id, tx) in guard.iter() {
                // 队列满时跳过本轮, 不阻塞其他工厂
                match tx.try_send(FactoryCommand::Sweep(now)) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(factory_id = %factory_id, "队列已满，跳过本轮扫描");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(factory_id = %factory_id, "worker 已停止，跳过扫描");
                    }
                }
            }
        }
    })
}

// ==========================================
// EngineHandle - 运行时句柄
// ==========================================
pub struct EngineHandle {
    core: Arc<EngineCore>,
    reporter: OptionalStatusReporter,
    senders: SenderMap,
    workers: Vec<JoinHandle<EngineResult<()>>>,
    ticker: JoinHandle<()>,
}

impl EngineHandle {
    pub fn core(&self) -> &Arc<EngineCore> {
        &self.core
    }

    /// 已启动 worker 的工厂（排序）
    pub async fn factories(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.senders.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// 投递入站事件; 未知工厂记录告警并丢弃
    ///
    /// # 返回
    /// - true: 已入队
    pub async fn submit_event(&self, event: SensorEvent) -> bool {
        let Some(tx) = self.senders.read().await.get(&event.factory_id).cloned() else {
            warn!(factory_id = %event.factory_id, kind = event.kind(), "未知工厂，丢弃事件");
            return false;
        };
        let factory_id = event.factory_id.clone();
        if tx.send(FactoryCommand::Event(event)).await.is_err() {
            warn!(factory_id = %factory_id, "worker 已停止，丢弃事件");
            return false;
        }
        true
    }

    /// 立即向所有工厂投递一次扫描
    pub async fn sweep_all(&self, now: DateTime<Utc>) {
        let senders: Vec<(String, mpsc::Sender<FactoryCommand>)> = self
            .senders
            .read()
            .await
            .iter()
            .map(|(id, tx)| (id.clone(), tx.clone()))
            .collect();
        for (factory_id, tx) in senders {
            if tx.send(FactoryCommand::Sweep(now)).await.is_err() {
                warn!(factory_id = %factory_id, "worker 已停止，跳过扫描");
            }
        }
    }

    /// 开通工厂或追加传感器
    ///
    /// # 说明
    /// - 已有 worker 的工厂: 经该 worker 串行执行, 跟踪器随即纳入新传感器
    /// - 新工厂: 开通后启动 worker, 之后的事件与扫描即可路由
    pub async fn provision_factory(
        &mut self,
        request: FactoryProvision,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<Sensor>> {
        let factory_id = request.factory_id.trim().to_string();
        let existing = self.senders.read().await.get(&factory_id).cloned();
        if let Some(tx) = existing {
            let (reply, rx) = oneshot::channel();
            tx.send(FactoryCommand::Provision { request, now, reply })
                .await
                .map_err(|_| EngineError::WorkerUnavailable(factory_id.clone()))?;
            return rx
                .await
                .map_err(|_| EngineError::WorkerUnavailable(factory_id))?;
        }

        let core = self.core.clone();
        let (sensors, monitor) = tokio::task::spawn_blocking(move || {
            let sensors = core.provision_factory(&request, now)?;
            let monitor = FactoryMonitor::load(core, request.factory_id.trim())?;
            Ok::<_, EngineError>((sensors, monitor))
        })
        .await
        .map_err(|e| EngineError::WorkerUnavailable(e.to_string()))??;

        let config = self.core.config().clone();
        let (tx, worker) = spawn_worker(monitor, &self.reporter, &config);
        self.workers.push(worker);
        self.senders.write().await.insert(factory_id.clone(), tx);
        info!(factory_id = %factory_id, sensors = sensors.len(), "运行期间开通工厂，worker 已启动");
        Ok(sensors)
    }

    /// 人工覆写传感器状态（经该工厂 worker 串行执行）
    pub async fn override_sensor(
        &self,
        factory_id: &str,
        sensor_id: &str,
        status: SensorStatus,
        hold_secs: i64,
        now: DateTime<Utc>,
    ) -> EngineResult<MonitorOutcome> {
        let tx = self.sender(factory_id).await?;
        let (reply, rx) = oneshot::channel();
        tx.send(FactoryCommand::Override {
            sensor_id: sensor_id.to_string(),
            status,
            hold_secs,
            now,
            reply,
        })
        .await
        .map_err(|_| EngineError::WorkerUnavailable(factory_id.to_string()))?;
        rx.await
            .map_err(|_| EngineError::WorkerUnavailable(factory_id.to_string()))?
    }

    /// 记录生产进度（路由到分配所在工厂的 worker）
    pub async fn record_progress(&self, assignment_id: &str, units: u32, now: DateTime<Utc>) -> EngineResult<ProgressOutcome> {
        let assignment = self
            .core
            .repos()
            .order_repo
            .find_assignment(assignment_id)?
            .ok_or_else(|| EngineError::UnknownAssignment(assignment_id.to_string()))?;
        let tx = self.sender(&assignment.factory_id).await?;
        let (reply, rx) = oneshot::channel();
        tx.send(FactoryCommand::Progress {
            assignment_id: assignment_id.to_string(),
            units,
            now,
            reply,
        })
        .await
        .map_err(|_| EngineError::WorkerUnavailable(assignment.factory_id.clone()))?;
        rx.await
            .map_err(|_| EngineError::WorkerUnavailable(assignment.factory_id.clone()))?
    }

    /// 停止定时器与全部 worker, 等待队列中已有命令处理完毕
    ///
    /// # 返回
    /// - 首个 worker 致命错误（如有）
    pub async fn shutdown(self) -> EngineResult<()> {
        self.ticker.abort();
        let senders = std::mem::take(&mut *self.senders.write().await);
        for (factory_id, tx) in &senders {
            if tx.send(FactoryCommand::Shutdown).await.is_err() {
                debug!(factory_id = %factory_id, "worker 已提前停止");
            }
        }
        drop(senders);

        let mut first_error = None;
        for joined in futures::future::join_all(self.workers).await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(error = %e, "worker 以错误退出");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    warn!(error = %e, "worker 任务异常结束");
                    first_error.get_or_insert(EngineError::WorkerUnavailable(e.to_string()));
                }
            }
        }
        info!("监控运行时已停止");
        first_error.map_or(Ok(()), Err)
    }

    async fn sender(&self, factory_id: &str) -> EngineResult<mpsc::Sender<FactoryCommand>> {
        self.senders
            .read()
            .await
            .get(factory_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownFactory(factory_id.to_string()))
    }
}

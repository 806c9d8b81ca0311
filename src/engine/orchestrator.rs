// ==========================================
// 工厂健康监控系统 - 单工厂监控编排
// ==========================================
// 用途: 协调各引擎对一次事件/扫描的处理顺序
// 顺序: Tracker → 写回传感器镜像 → Aggregator → 传感器替换 → 档位处理/迁移 → 工作快照
// 所有权: 一个工厂一个 FactoryMonitor, 由该工厂的 worker 独占
// ==========================================

use crate::db::run_with_retry;
use crate::domain::event::{EventPayload, SensorEvent};
use crate::domain::factory::{BandChange, FactoryHealth};
use crate::domain::health_event::HealthEvent;
use crate::domain::sensor::Sensor;
use crate::domain::types::SensorStatus;
use crate::engine::assignment::{AdmissionOutcome, ProgressOutcome};
use crate::engine::core::EngineCore;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::rescheduler::{RecoveryUpdate, RescheduleReport, RescheduleTrigger};
use crate::engine::sensor_failover::RerouteOutcome;
use crate::engine::tracker::{SensorTracker, SensorTransition, TrackerUpdate};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

// ==========================================
// MonitorOutcome - 单次处理结果
// ==========================================

#[derive(Debug, Clone, Default)]
pub struct MonitorOutcome {
    // Tracker 输出
    pub transitions: Vec<SensorTransition>,

    // Aggregator 输出
    pub health: Option<FactoryHealth>,
    pub band_change: Option<BandChange>,

    // 替换 / 迁移 输出
    pub rerouted: Vec<RerouteOutcome>,
    pub reschedule: Option<RescheduleReport>,

    // 扫描周期输出
    pub recovery: Option<RecoveryUpdate>,

    // 生产进度
    pub progress: Option<ProgressOutcome>,
    pub admitted: Vec<(String, AdmissionOutcome)>,
}

impl MonitorOutcome {
    pub fn has_changes(&self) -> bool {
        !self.transitions.is_empty()
            || self.band_change.is_some()
            || !self.rerouted.is_empty()
            || self.reschedule.is_some()
            || self.progress.is_some()
    }
}

// ==========================================
// FactoryMonitor - 单工厂监控器
// ==========================================

pub struct FactoryMonitor {
    core: Arc<EngineCore>,
    tracker: SensorTracker,
}

impl FactoryMonitor {
    /// 从传感器镜像加载跟踪器
    pub fn load(core: Arc<EngineCore>, factory_id: &str) -> EngineResult<Self> {
        let repos = core.repos();
        if repos.factory_repo.find_by_id(factory_id)?.is_none() {
            return Err(EngineError::UnknownFactory(factory_id.to_string()));
        }
        let sensors = repos.sensor_repo.list_by_factory(factory_id)?;
        debug!(factory_id = %factory_id, sensors = sensors.len(), "监控器已加载");
        let tracker = SensorTracker::new(factory_id, sensors, core.config().clone());
        Ok(Self { core, tracker })
    }

    pub fn factory_id(&self) -> &str {
        self.tracker.factory_id()
    }

    pub fn core(&self) -> &Arc<EngineCore> {
        &self.core
    }

    pub fn tracker(&self) -> &SensorTracker {
        &self.tracker
    }

    /// 加入运行期间新开通的传感器
    ///
    /// # 返回
    /// - 新加入跟踪的传感器数
    pub fn refresh_sensors(&mut self) -> EngineResult<usize> {
        let sensors = self.core.repos().sensor_repo.list_by_factory(self.factory_id())?;
        let added = sensors
            .into_iter()
            .map(|s| self.tracker.register(s))
            .filter(|added| *added)
            .count();
        if added > 0 {
            info!(
                factory_id = %self.factory_id(),
                added,
                total = self.tracker.snapshot().len(),
                "新开通传感器已加入跟踪"
            );
        }
        Ok(added)
    }

    /// 开通完成后同步跟踪器并重新聚合
    pub fn sync_provisioned(&mut self, now: DateTime<Utc>) -> EngineResult<MonitorOutcome> {
        self.refresh_sensors()?;
        self.apply(TrackerUpdate::default(), now, true)
    }

    /// 处理单条入站事件
    pub fn handle_event(&mut self, event: &SensorEvent) -> EngineResult<MonitorOutcome> {
        let now = event.timestamp;
        if let Some(sensor_id) = event.sensor_id.as_deref() {
            if self.tracker.sensor(sensor_id).is_none() {
                self.refresh_sensors()?;
            }
        }
        let update = self.tracker.ingest(event);
        let mut outcome = self.apply(update, now, false)?;

        // 生产读数: 由队首分配的生产传感器推进进度
        if let (EventPayload::Reading { units_produced: Some(units), .. }, Some(sensor_id)) =
            (&event.payload, event.sensor_id.as_deref())
        {
            if *units > 0 {
                outcome.progress = self.record_sensor_progress(sensor_id, *units, now)?;
            }
        }
        Ok(outcome)
    }

    /// 定时扫描: 心跳超时 + 恢复门控 + 延后迁移重试
    pub fn sweep(&mut self, now: DateTime<Utc>) -> EngineResult<MonitorOutcome> {
        self.refresh_sensors()?;
        let update = self.tracker.sweep_timeouts(now);
        let mut outcome = self.apply(update, now, true)?;

        let Some(health) = outcome.health.clone() else {
            return Ok(outcome);
        };
        let recovery = self
            .core
            .rescheduler()
            .observe_cycle(self.factory_id(), health.band, health.health_percentage, now)?;
        if recovery.confirmed {
            outcome.admitted = self.core.admit_pending(now)?;
        }
        outcome.recovery = Some(recovery);

        // 档位变化时 apply 已迁移过, 此处只重试延后的分配
        if health.band.requires_reschedule() && outcome.reschedule.is_none() {
            let has_active = !self
                .core
                .repos()
                .order_repo
                .list_active_by_factory(self.factory_id())?
                .is_empty();
            if has_active {
                let report = self
                    .core
                    .rescheduler()
                    .reschedule(self.factory_id(), RescheduleTrigger::Sweep, now)?;
                if !report.migrated.is_empty() {
                    self.core.refresh_snapshot(now);
                }
                outcome.reschedule = Some(report);
            }
        }
        Ok(outcome)
    }

    /// 人工覆写传感器状态
    ///
    /// # 参数
    /// - status: WARNING / FAILED
    /// - hold_secs: 保持时长（秒）
    pub fn override_sensor(
        &mut self,
        sensor_id: &str,
        status: SensorStatus,
        hold_secs: i64,
        now: DateTime<Utc>,
    ) -> EngineResult<MonitorOutcome> {
        if self.tracker.sensor(sensor_id).is_none() {
            return Err(EngineError::UnknownSensor(sensor_id.to_string()));
        }
        if hold_secs <= 0 {
            return Err(EngineError::InvalidInput("hold_secs 必须大于 0".to_string()));
        }
        let hold_until = now + Duration::seconds(hold_secs);
        let update = self
            .tracker
            .override_status(sensor_id, status, hold_until, now)
            .ok_or_else(|| EngineError::InvalidInput(format!("不允许覆写为 {}", status)))?;
        info!(
            factory_id = %self.factory_id(),
            sensor_id = %sensor_id,
            status = %status,
            hold_until = %hold_until,
            "传感器状态已人工覆写"
        );
        self.apply(update, now, false)
    }

    // ==========================================
    // 内部步骤
    // ==========================================

    fn apply(&mut self, update: TrackerUpdate, now: DateTime<Utc>, force_aggregate: bool) -> EngineResult<MonitorOutcome> {
        let factory_id = self.tracker.factory_id().to_string();
        let repos = self.core.repos().clone();
        let mut outcome = MonitorOutcome::default();

        // 步骤1: 写回传感器镜像（替换引擎读取镜像, 须先于替换）
        if !update.touched.is_empty() {
            let touched: Vec<&Sensor> = update
                .touched
                .iter()
                .filter_map(|id| self.tracker.sensor(id))
                .collect();
            run_with_retry(&repos.tx_policy, || repos.sensor_repo.save_states(&touched))?;
        }

        // 步骤2: 传感器迁移审计
        if update.has_transitions() {
            let events: Vec<HealthEvent> = update
                .transitions
                .iter()
                .map(|t| HealthEvent::sensor(&factory_id, &t.sensor_id, t.from, t.to, t.reason, t.occurred_at))
                .collect();
            run_with_retry(&repos.tx_policy, || repos.event_log_repo.append_health_events(&events))?;
        }

        // 步骤3: 重新聚合
        if update.has_transitions() || force_aggregate {
            let result = self
                .core
                .aggregator()
                .recompute(&factory_id, self.tracker.snapshot(), now)?;
            outcome.health = Some(result.health);
            outcome.band_change = result.band_change;
        }

        // 步骤4: 生产传感器替换
        for sensor_id in &update.failover_sensors {
            match self.core.failover().reroute(&factory_id, sensor_id, now) {
                Ok(list) => outcome.rerouted.extend(list),
                Err(e) if e.is_store_unavailable() => return Err(e),
                Err(e) => warn!(factory_id = %factory_id, sensor_id = %sensor_id, error = %e, "传感器替换失败"),
            }
        }
        if update.transitions.iter().any(|t| t.to == SensorStatus::Ok) {
            outcome.rerouted.extend(self.core.failover().resume_blocked(&factory_id, now)?);
        }

        // 步骤5: 档位变化
        if let (Some(change), Some(health)) = (outcome.band_change, outcome.health.as_ref()) {
            outcome.reschedule = self.core.rescheduler().on_band_change(
                &factory_id,
                change,
                health.health_percentage,
                now,
            )?;
            if !change.is_worsening() {
                outcome.admitted = self.core.admit_pending(now)?;
            }
        }

        outcome.transitions = update.transitions;

        // 步骤6: 工作快照
        if !outcome.rerouted.is_empty() || outcome.reschedule.is_some() {
            self.core.refresh_snapshot(now);
        }
        Ok(outcome)
    }

    /// 读数携带产量时, 推进该传感器正在生产的分配
    fn record_sensor_progress(
        &self,
        sensor_id: &str,
        units: u32,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<ProgressOutcome>> {
        let head = self
            .core
            .repos()
            .order_repo
            .list_active_by_factory(self.factory_id())?
            .into_iter()
            .find(|a| a.is_producing() && a.sensor_id.as_deref() == Some(sensor_id));
        let Some(head) = head else {
            debug!(factory_id = %self.factory_id(), sensor_id = %sensor_id, "产量读数无对应生产分配");
            return Ok(None);
        };
        self.core
            .record_progress(&head.assignment_id, units, now)
            .map(Some)
    }
}

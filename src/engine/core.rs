// ==========================================
// 工厂健康监控系统 - 引擎核心
// ==========================================
// 职责: 持有仓储/配置/各子引擎, 提供跨工厂的订单与查询操作
// 说明: 传感器事件处理在 FactoryMonitor 中, 按工厂串行执行
// ==========================================

use crate::config::EngineConfig;
use crate::domain::factory::{Factory, FactoryStatusView};
use crate::domain::health_event::{FailoverEvent, HealthEvent};
use crate::domain::order::{NewOrder, Order, OrderDetail};
use crate::domain::sensor::{FactoryProvision, Sensor, SensorSummary};
use crate::engine::aggregator::HealthAggregator;
use crate::engine::assignment::{AdmissionOutcome, AssignmentEngine, ProgressOutcome};
use crate::engine::capacity::CapacityPlanner;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::repositories::EngineRepositories;
use crate::engine::rescheduler::Rescheduler;
use crate::engine::sensor_failover::SensorFailover;
use crate::engine::work_snapshot::WorkSnapshotPublisher;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

// ==========================================
// EngineCore - 引擎核心
// ==========================================
pub struct EngineCore {
    repos: EngineRepositories,
    config: Arc<EngineConfig>,
    planner: CapacityPlanner,
    aggregator: HealthAggregator,
    assignment: AssignmentEngine,
    failover: SensorFailover,
    rescheduler: Rescheduler,
    snapshot: WorkSnapshotPublisher,
}

impl EngineCore {
    /// 创建引擎核心
    ///
    /// # 参数
    /// - conn: 已完成 schema 初始化的共享连接
    /// - config: 引擎配置
    pub fn new(conn: Arc<Mutex<Connection>>, config: EngineConfig) -> Self {
        let repos = EngineRepositories::from_connection(conn, config.tx_retry_policy());
        let snapshot_path = config.snapshot_path.as_ref().map(PathBuf::from);
        Self {
            planner: CapacityPlanner::from_config(&config),
            aggregator: HealthAggregator::new(repos.clone()),
            assignment: AssignmentEngine::new(repos.clone(), &config),
            failover: SensorFailover::new(repos.clone()),
            rescheduler: Rescheduler::new(repos.clone(), &config),
            snapshot: WorkSnapshotPublisher::new(repos.order_repo.clone(), snapshot_path),
            config: Arc::new(config),
            repos,
        }
    }

    pub fn repos(&self) -> &EngineRepositories {
        &self.repos
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    pub fn planner(&self) -> &CapacityPlanner {
        &self.planner
    }

    pub fn aggregator(&self) -> &HealthAggregator {
        &self.aggregator
    }

    pub fn assignment(&self) -> &AssignmentEngine {
        &self.assignment
    }

    pub fn failover(&self) -> &SensorFailover {
        &self.failover
    }

    pub fn rescheduler(&self) -> &Rescheduler {
        &self.rescheduler
    }

    pub fn snapshot(&self) -> &WorkSnapshotPublisher {
        &self.snapshot
    }

    // ==========================================
    // 开通
    // ==========================================

    /// 开通工厂及其传感器（幂等, 已存在的工厂/传感器保持不变）
    ///
    /// # 返回
    /// - 工厂当前全部传感器（按 seq_no）
    pub fn provision_factory(&self, request: &FactoryProvision, now: DateTime<Utc>) -> EngineResult<Vec<Sensor>> {
        let factory_id = request.factory_id.trim();
        if factory_id.is_empty() {
            return Err(EngineError::InvalidInput("factory_id 不能为空".to_string()));
        }
        if request.sensors.iter().any(|s| s.sensor_id.trim().is_empty()) {
            return Err(EngineError::InvalidInput("sensor_id 不能为空".to_string()));
        }

        let (created, added) = self.repos.in_tx(|tx| {
            let created = tx.insert_factory_if_absent(&Factory::provisioned(factory_id, now))?;
            let mut added = 0usize;
            for spec in &request.sensors {
                let seq_no = tx.next_sensor_seq_no(factory_id)?;
                let sensor = Sensor::new(spec.sensor_id.trim(), factory_id, spec.sensor_type, seq_no);
                if tx.insert_sensor_if_absent(&sensor)? {
                    added += 1;
                }
            }
            if created {
                info!(factory_id = %factory_id, "工厂已开通");
            }
            Ok((created, added))
        })?;

        let sensors = self.repos.sensor_repo.list_by_factory(factory_id)?;
        if created || added > 0 {
            // 健康度由传感器集合派生, 开通后立即聚合
            let result = self.aggregator.recompute(factory_id, &sensors, now)?;
            if let Some(change) = result.band_change {
                self.rescheduler
                    .on_band_change(factory_id, change, result.health.health_percentage, now)?;
                if !change.is_worsening() {
                    self.admit_pending(now)?;
                }
            }
        }
        info!(factory_id = %factory_id, added, total = sensors.len(), "传感器开通完成");
        Ok(sensors)
    }

    // ==========================================
    // 订单
    // ==========================================

    pub fn create_order(&self, request: &NewOrder, now: DateTime<Utc>) -> EngineResult<Order> {
        self.assignment.create_order(request, now)
    }

    /// 准入订单; factory_id 为 None 时由引擎选择工厂并按需拆分
    pub fn assign_order(
        &self,
        order_id: &str,
        factory_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> EngineResult<AdmissionOutcome> {
        let outcome = self.assignment.admit(order_id, factory_id, now)?;
        if outcome.is_assigned() {
            self.refresh_snapshot(now);
        }
        Ok(outcome)
    }

    /// 创建并立即尝试准入
    pub fn submit_order(
        &self,
        request: &NewOrder,
        factory_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> EngineResult<(Order, AdmissionOutcome)> {
        let order = self.create_order(request, now)?;
        let outcome = self.assign_order(&order.order_id, factory_id, now)?;
        Ok((order, outcome))
    }

    /// 产能释放后重试 pending 订单
    pub fn admit_pending(&self, now: DateTime<Utc>) -> EngineResult<Vec<(String, AdmissionOutcome)>> {
        let results = self.assignment.admit_pending(now)?;
        if results.iter().any(|(_, o)| o.is_assigned()) {
            self.refresh_snapshot(now);
        }
        Ok(results)
    }

    pub fn record_progress(&self, assignment_id: &str, units: u32, now: DateTime<Utc>) -> EngineResult<ProgressOutcome> {
        let outcome = self.assignment.record_progress(assignment_id, units, now)?;
        if outcome.completed {
            self.admit_pending(now)?;
        }
        self.refresh_snapshot(now);
        Ok(outcome)
    }

    pub fn cancel_order(&self, order_id: &str, now: DateTime<Utc>) -> EngineResult<Order> {
        let order = self.assignment.cancel_order(order_id, now)?;
        self.admit_pending(now)?;
        self.refresh_snapshot(now);
        Ok(order)
    }

    // ==========================================
    // 查询
    // ==========================================

    pub fn get_order(&self, order_id: &str) -> EngineResult<OrderDetail> {
        let order = self
            .repos
            .order_repo
            .find_order(order_id)?
            .ok_or_else(|| EngineError::UnknownOrder(order_id.to_string()))?;
        let assignments = self.repos.order_repo.list_assignments_by_order(order_id)?;
        Ok(OrderDetail { order, assignments })
    }

    pub fn get_factory_status(&self, factory_id: &str) -> EngineResult<FactoryStatusView> {
        let factory = self
            .repos
            .factory_repo
            .find_by_id(factory_id)?
            .ok_or_else(|| EngineError::UnknownFactory(factory_id.to_string()))?;
        Ok(self.status_view(&factory))
    }

    pub fn list_factory_status(&self) -> EngineResult<Vec<FactoryStatusView>> {
        let factories = self.repos.factory_repo.list_all()?;
        Ok(factories.iter().map(|f| self.status_view(f)).collect())
    }

    pub fn get_factory_sensors(&self, factory_id: &str) -> EngineResult<SensorSummary> {
        if self.repos.factory_repo.find_by_id(factory_id)?.is_none() {
            return Err(EngineError::UnknownFactory(factory_id.to_string()));
        }
        let sensors = self.repos.sensor_repo.list_by_factory(factory_id)?;
        Ok(SensorSummary::from_sensors(factory_id, &sensors))
    }

    pub fn health_events(&self, factory_id: &str, limit: usize) -> EngineResult<Vec<HealthEvent>> {
        Ok(self.repos.event_log_repo.list_health_events(factory_id, limit)?)
    }

    pub fn failover_events(&self, factory_id: &str, limit: usize) -> EngineResult<Vec<FailoverEvent>> {
        Ok(self.repos.event_log_repo.list_failover_events(factory_id, limit)?)
    }

    /// 重建工作快照; 失败只记录告警
    pub fn refresh_snapshot(&self, now: DateTime<Utc>) {
        if let Err(e) = self.snapshot.refresh(now) {
            warn!(error = %e, "工作快照刷新失败");
        }
    }

    fn status_view(&self, factory: &Factory) -> FactoryStatusView {
        FactoryStatusView {
            factory_id: factory.factory_id.clone(),
            health_percentage: factory.health_percentage,
            band: factory.band,
            capacity: self.planner.admission_capacity(factory),
            load: factory.load,
            admission_enabled: factory.admission_enabled,
        }
    }
}

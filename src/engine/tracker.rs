// ==========================================
// 工厂健康监控系统 - 传感器健康跟踪引擎
// ==========================================
// 职责: 单工厂传感器状态机, 由事件流与超时扫描驱动
// 所有权: 每个工厂一个 SensorTracker, 由该工厂的 worker 独占持有
// ==========================================
// 规则:
// 1) 读数在 nominal 区间 → OK, 临界计数清零
// 2) 读数在临界带 → WARNING, 连续 N 次 → FAILED
// 3) 读数越限 / 心跳超时 / 上报失效 → FAILED
// 4) FAILED 只能经冷却期后的正常读数或 restart 恢复
// 5) 早于最近一次迁移时间的事件不改变状态
// ==========================================

use crate::config::EngineConfig;
use crate::domain::event::{EventPayload, SensorEvent};
use crate::domain::sensor::{ReadingClass, Sensor, SensorReading};
use crate::domain::types::{ReasonCode, SensorStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// 单次传感器状态迁移
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorTransition {
    pub sensor_id: String,
    pub from: SensorStatus,
    pub to: SensorStatus,
    pub reason: ReasonCode,
    pub occurred_at: DateTime<Utc>,
}

/// 一次 ingest / sweep 的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackerUpdate {
    pub transitions: Vec<SensorTransition>,
    /// 需要触发传感器级替换的传感器（失效 / 持续临界 / 风险标记）
    pub failover_sensors: Vec<String>,
    /// 本次被修改的传感器（需写回镜像）
    pub touched: Vec<String>,
}

impl TrackerUpdate {
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty() && self.touched.is_empty()
    }

    pub fn has_transitions(&self) -> bool {
        !self.transitions.is_empty()
    }

    fn touch(&mut self, sensor_id: &str) {
        if !self.touched.iter().any(|s| s == sensor_id) {
            self.touched.push(sensor_id.to_string());
        }
    }

    fn flag_failover(&mut self, sensor_id: &str) {
        if !self.failover_sensors.iter().any(|s| s == sensor_id) {
            self.failover_sensors.push(sensor_id.to_string());
        }
    }
}

// ==========================================
// SensorTracker - 传感器健康跟踪器
// ==========================================
pub struct SensorTracker {
    factory_id: String,
    sensors: BTreeMap<String, Sensor>,
    config: Arc<EngineConfig>,
}

impl SensorTracker {
    pub fn new(factory_id: &str, sensors: Vec<Sensor>, config: Arc<EngineConfig>) -> Self {
        Self {
            factory_id: factory_id.to_string(),
            sensors: sensors
                .into_iter()
                .map(|s| (s.sensor_id.clone(), s))
                .collect(),
            config,
        }
    }

    pub fn factory_id(&self) -> &str {
        &self.factory_id
    }

    pub fn sensor(&self, sensor_id: &str) -> Option<&Sensor> {
        self.sensors.get(sensor_id)
    }

    /// 当前传感器状态快照（按 seq_no 排序）
    pub fn snapshot(&self) -> Vec<&Sensor> {
        let mut list: Vec<&Sensor> = self.sensors.values().collect();
        list.sort_by_key(|s| s.seq_no);
        list
    }

    /// 新开通的传感器加入跟踪; 已跟踪的传感器保持现有状态
    ///
    /// # 返回
    /// - true: 新加入
    pub fn register(&mut self, sensor: Sensor) -> bool {
        if self.sensors.contains_key(&sensor.sensor_id) {
            return false;
        }
        self.sensors.insert(sensor.sensor_id.clone(), sensor);
        true
    }

    // ==========================================
    // 事件入口
    // ==========================================

    /// 处理单条入站事件
    ///
    /// # 返回
    /// - TrackerUpdate: 迁移列表 + 需替换的传感器; 未知传感器返回空结果
    pub fn ingest(&mut self, event: &SensorEvent) -> TrackerUpdate {
        if event.factory_id != self.factory_id {
            warn!(
                factory_id = %self.factory_id,
                event_factory_id = %event.factory_id,
                "事件工厂不匹配，忽略"
            );
            return TrackerUpdate::default();
        }

        let sensor_id = match (&event.payload, event.sensor_id.as_deref()) {
            (EventPayload::Restart, None) => return self.restart_factory(event.timestamp),
            (_, Some(id)) => id,
            (_, None) => {
                warn!(factory_id = %self.factory_id, kind = event.kind(), "事件缺少 sensor_id，忽略");
                return TrackerUpdate::default();
            }
        };

        let config = Arc::clone(&self.config);
        let sensor = match self.sensors.get_mut(sensor_id) {
            Some(s) => s,
            None => {
                warn!(
                    factory_id = %self.factory_id,
                    sensor_id = %sensor_id,
                    kind = event.kind(),
                    "未知传感器，忽略事件"
                );
                return TrackerUpdate::default();
            }
        };

        let mut update = TrackerUpdate::default();
        let ts = event.timestamp;
        sensor.touch(ts);
        update.touch(sensor_id);

        // 早于最近一次状态迁移的事件只刷新 last_seen
        if sensor.status_since.map_or(false, |since| ts < since) {
            debug!(
                factory_id = %sensor.factory_id,
                sensor_id = %sensor_id,
                event_ts = %ts,
                "乱序事件，不改变状态"
            );
            return update;
        }

        match &event.payload {
            EventPayload::Heartbeat => {}
            EventPayload::Reading { value, .. } => {
                apply_reading(sensor, *value, ts, &config, &mut update);
            }
            EventPayload::SensorFailure { .. } => {
                if sensor.status != SensorStatus::Failed {
                    fail(sensor, ReasonCode::ReportedFailure, ts, &mut update);
                }
                update.flag_failover(sensor_id);
            }
            EventPayload::SensorAtRisk => {
                sensor.at_risk = true;
                if sensor.status == SensorStatus::Ok {
                    transition(sensor, SensorStatus::Warning, ReasonCode::AtRisk, ts, &mut update);
                }
                update.flag_failover(sensor_id);
            }
            EventPayload::Restart => {
                restart(sensor, ts, &mut update);
            }
        }

        update
    }

    /// restart 未指定传感器: 重启工厂内全部异常传感器
    fn restart_factory(&mut self, ts: DateTime<Utc>) -> TrackerUpdate {
        let mut update = TrackerUpdate::default();
        for sensor in self.sensors.values_mut() {
            if sensor.status == SensorStatus::Ok && !sensor.at_risk {
                continue;
            }
            if sensor.status_since.map_or(false, |since| ts < since) {
                continue;
            }
            sensor.touch(ts);
            update.touch(&sensor.sensor_id);
            restart(sensor, ts, &mut update);
        }
        update
    }

    /// 人工覆写传感器状态并保持至 hold_until
    ///
    /// # 参数
    /// - status: 只允许 WARNING / FAILED
    ///
    /// # 返回
    /// - None: 传感器未知或状态非法
    pub fn override_status(
        &mut self,
        sensor_id: &str,
        status: SensorStatus,
        hold_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<TrackerUpdate> {
        if status == SensorStatus::Ok {
            warn!(sensor_id = %sensor_id, "人工覆写不允许强制为 OK，请使用 restart");
            return None;
        }
        let sensor = match self.sensors.get_mut(sensor_id) {
            Some(s) => s,
            None => {
                warn!(factory_id = %self.factory_id, sensor_id = %sensor_id, "未知传感器，忽略覆写");
                return None;
            }
        };

        let mut update = TrackerUpdate::default();
        update.touch(sensor_id);
        sensor.hold_until = Some(hold_until);
        if sensor.status != status {
            if status == SensorStatus::Failed {
                sensor.failed_at = Some(now);
            }
            transition(sensor, status, ReasonCode::ManualOverride, now, &mut update);
        }
        update.flag_failover(sensor_id);
        Some(update)
    }

    // ==========================================
    // 超时扫描
    // ==========================================

    /// 将超过心跳超时的传感器标记为 FAILED
    ///
    /// 从未上报过的传感器不参与超时判定。
    /// 扫描只标记状态, 迁移由调用方经同一路径交给聚合/替换处理。
    pub fn sweep_timeouts(&mut self, now: DateTime<Utc>) -> TrackerUpdate {
        let timeout = self.config.sensor_timeout();
        let mut update = TrackerUpdate::default();

        for sensor in self.sensors.values_mut() {
            if sensor.status == SensorStatus::Failed {
                continue;
            }
            let last_seen = match sensor.last_seen {
                Some(ts) => ts,
                None => continue,
            };
            if now - last_seen > timeout {
                update.touch(&sensor.sensor_id);
                fail(sensor, ReasonCode::HeartbeatTimeout, now, &mut update);
                update.flag_failover(&sensor.sensor_id);
            }
        }

        if update.has_transitions() {
            debug!(
                factory_id = %self.factory_id,
                timed_out = update.transitions.len(),
                "心跳超时扫描完成"
            );
        }
        update
    }
}

// ==========================================
// 状态迁移规则
// ==========================================

fn transition(
    sensor: &mut Sensor,
    to: SensorStatus,
    reason: ReasonCode,
    ts: DateTime<Utc>,
    update: &mut TrackerUpdate,
) {
    let from = sensor.status;
    if from == to {
        return;
    }
    sensor.status = to;
    sensor.status_reason = Some(reason);
    sensor.status_since = Some(ts);
    debug!(
        factory_id = %sensor.factory_id,
        sensor_id = %sensor.sensor_id,
        from = %from,
        to = %to,
        reason = %reason,
        "传感器状态迁移"
    );
    update.transitions.push(SensorTransition {
        sensor_id: sensor.sensor_id.clone(),
        from,
        to,
        reason,
        occurred_at: ts,
    });
}

fn fail(sensor: &mut Sensor, reason: ReasonCode, ts: DateTime<Utc>, update: &mut TrackerUpdate) {
    sensor.failed_at = Some(ts);
    transition(sensor, SensorStatus::Failed, reason, ts, update);
}

fn restart(sensor: &mut Sensor, ts: DateTime<Utc>, update: &mut TrackerUpdate) {
    sensor.consecutive_warnings = 0;
    sensor.at_risk = false;
    sensor.hold_until = None;
    sensor.failed_at = None;
    transition(sensor, SensorStatus::Ok, ReasonCode::Restart, ts, update);
}

fn apply_reading(
    sensor: &mut Sensor,
    value: f64,
    ts: DateTime<Utc>,
    config: &EngineConfig,
    update: &mut TrackerUpdate,
) {
    sensor.push_reading(SensorReading { value, timestamp: ts }, config.reading_window);
    let class = config.thresholds_for(sensor.sensor_type).classify(value);
    let held = sensor.is_held(ts);

    match class {
        ReadingClass::Nominal => {
            sensor.consecutive_warnings = 0;
            if held || sensor.at_risk {
                return;
            }
            match sensor.status {
                SensorStatus::Ok => {}
                SensorStatus::Warning => {
                    transition(sensor, SensorStatus::Ok, ReasonCode::ReadingNominal, ts, update);
                }
                SensorStatus::Failed => {
                    let cooled = sensor
                        .failed_at
                        .map_or(true, |at| ts - at >= config.sensor_cooldown());
                    if cooled {
                        sensor.failed_at = None;
                        transition(sensor, SensorStatus::Ok, ReasonCode::CooldownRecovered, ts, update);
                    }
                }
            }
        }
        ReadingClass::NearThreshold => {
            sensor.consecutive_warnings = sensor.consecutive_warnings.saturating_add(1);
            if sensor.status == SensorStatus::Failed {
                return;
            }
            if sensor.consecutive_warnings >= config.consecutive_warning_limit {
                fail(sensor, ReasonCode::ConsecutiveWarnings, ts, update);
                update.flag_failover(&sensor.sensor_id);
                return;
            }
            transition(sensor, SensorStatus::Warning, ReasonCode::NearThreshold, ts, update);
            if sensor.consecutive_warnings == config.sustained_warning_run {
                update.flag_failover(&sensor.sensor_id);
            }
        }
        ReadingClass::OutOfRange => {
            sensor.consecutive_warnings = 0;
            if sensor.status != SensorStatus::Failed {
                fail(sensor, ReasonCode::OutOfRange, ts, update);
            }
            update.flag_failover(&sensor.sensor_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::SensorType;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn tracker() -> SensorTracker {
        let sensors = vec![
            Sensor::new("T1", "F1", SensorType::Temperature, 1),
            Sensor::new("L1", "F1", SensorType::Level, 2),
            Sensor::new("Q1", "F1", SensorType::Quality, 3),
        ];
        SensorTracker::new("F1", sensors, Arc::new(EngineConfig::default()))
    }

    fn status(tr: &SensorTracker, id: &str) -> SensorStatus {
        tr.sensor(id).unwrap().status
    }

    #[test]
    fn test_near_threshold_then_consecutive_failure() {
        let mut tr = tracker();
        // 温度 nominal 2-8, margin 2
        let u = tr.ingest(&SensorEvent::reading("F1", "T1", 9.0, t(1)));
        assert_eq!(status(&tr, "T1"), SensorStatus::Warning);
        assert_eq!(u.transitions.len(), 1);
        assert!(u.failover_sensors.is_empty());

        let u = tr.ingest(&SensorEvent::reading("F1", "T1", 9.5, t(2)));
        assert_eq!(status(&tr, "T1"), SensorStatus::Warning);
        assert_eq!(u.failover_sensors, vec!["T1".to_string()]); // 持续临界

        let u = tr.ingest(&SensorEvent::reading("F1", "T1", 9.1, t(3)));
        assert_eq!(status(&tr, "T1"), SensorStatus::Failed);
        assert_eq!(u.transitions[0].reason, ReasonCode::ConsecutiveWarnings);
    }

    #[test]
    fn test_nominal_resets_warning() {
        let mut tr = tracker();
        tr.ingest(&SensorEvent::reading("F1", "T1", 9.0, t(1)));
        tr.ingest(&SensorEvent::reading("F1", "T1", 5.0, t(2)));
        assert_eq!(status(&tr, "T1"), SensorStatus::Ok);
        assert_eq!(tr.sensor("T1").unwrap().consecutive_warnings, 0);
    }

    #[test]
    fn test_failed_needs_cooldown() {
        let mut tr = tracker();
        tr.ingest(&SensorEvent::reading("F1", "T1", 20.0, t(0)));
        assert_eq!(status(&tr, "T1"), SensorStatus::Failed);

        // 一次正常读数不足以恢复
        tr.ingest(&SensorEvent::reading("F1", "T1", 5.0, t(5)));
        assert_eq!(status(&tr, "T1"), SensorStatus::Failed);

        // 冷却 30s 后的正常读数恢复
        let u = tr.ingest(&SensorEvent::reading("F1", "T1", 5.0, t(31)));
        assert_eq!(status(&tr, "T1"), SensorStatus::Ok);
        assert_eq!(u.transitions[0].reason, ReasonCode::CooldownRecovered);
    }

    #[test]
    fn test_restart_recovers_immediately() {
        let mut tr = tracker();
        tr.ingest(&SensorEvent::failure("F1", "T1", t(0)));
        let u = tr.ingest(&SensorEvent::restart("F1", Some("T1"), t(1)));
        assert_eq!(status(&tr, "T1"), SensorStatus::Ok);
        assert_eq!(u.transitions[0].reason, ReasonCode::Restart);
    }

    #[test]
    fn test_factory_wide_restart() {
        let mut tr = tracker();
        tr.ingest(&SensorEvent::failure("F1", "T1", t(0)));
        tr.ingest(&SensorEvent::at_risk("F1", "L1", t(0)));
        let u = tr.ingest(&SensorEvent::restart("F1", None, t(1)));
        assert_eq!(u.transitions.len(), 2);
        assert!(tr.snapshot().iter().all(|s| s.status == SensorStatus::Ok && !s.at_risk));
    }

    #[test]
    fn test_stale_event_does_not_regress() {
        let mut tr = tracker();
        tr.ingest(&SensorEvent::failure("F1", "T1", t(10)));
        tr.ingest(&SensorEvent::restart("F1", Some("T1"), t(20)));
        // 早于 restart 的失效事件迟到
        let u = tr.ingest(&SensorEvent::reading("F1", "T1", 50.0, t(15)));
        assert!(u.transitions.is_empty());
        assert_eq!(status(&tr, "T1"), SensorStatus::Ok);
        assert_eq!(tr.sensor("T1").unwrap().last_seen, Some(t(20)));
    }

    #[test]
    fn test_unknown_sensor_ignored() {
        let mut tr = tracker();
        let u = tr.ingest(&SensorEvent::reading("F1", "NOPE", 5.0, t(1)));
        assert!(u.is_empty());
    }

    #[test]
    fn test_sweep_skips_never_seen() {
        let mut tr = tracker();
        tr.ingest(&SensorEvent::heartbeat("F1", "T1", t(0)));
        let u = tr.sweep_timeouts(t(6));
        assert_eq!(u.transitions.len(), 1);
        assert_eq!(u.transitions[0].reason, ReasonCode::HeartbeatTimeout);
        assert_eq!(status(&tr, "T1"), SensorStatus::Failed);
        assert_eq!(status(&tr, "L1"), SensorStatus::Ok);

        // 恰好 5s 不超时
        tr.ingest(&SensorEvent::heartbeat("F1", "L1", t(10)));
        assert!(tr.sweep_timeouts(t(15)).transitions.is_empty());
    }

    #[test]
    fn test_heartbeat_does_not_recover() {
        let mut tr = tracker();
        tr.ingest(&SensorEvent::failure("F1", "T1", t(0)));
        tr.ingest(&SensorEvent::heartbeat("F1", "T1", t(100)));
        assert_eq!(status(&tr, "T1"), SensorStatus::Failed);
    }

    #[test]
    fn test_override_holds_status() {
        let mut tr = tracker();
        let u = tr
            .override_status("L1", SensorStatus::Warning, t(60), t(0))
            .unwrap();
        assert_eq!(u.transitions[0].reason, ReasonCode::ManualOverride);

        // 保持期内正常读数不能解除
        tr.ingest(&SensorEvent::reading("F1", "L1", 95.0, t(10)));
        assert_eq!(status(&tr, "L1"), SensorStatus::Warning);

        // 保持期后解除
        tr.ingest(&SensorEvent::reading("F1", "L1", 95.0, t(61)));
        assert_eq!(status(&tr, "L1"), SensorStatus::Ok);

        assert!(tr.override_status("L1", SensorStatus::Ok, t(90), t(70)).is_none());
    }

    #[test]
    fn test_at_risk_blocks_nominal_recovery() {
        let mut tr = tracker();
        tr.ingest(&SensorEvent::at_risk("F1", "Q1", t(0)));
        tr.ingest(&SensorEvent::reading("F1", "Q1", 90.0, t(1)));
        let s = tr.sensor("Q1").unwrap();
        assert_eq!(s.status, SensorStatus::Warning);
        assert!(s.at_risk);
    }

    #[test]
    fn test_register_keeps_tracked_state() {
        let mut tr = tracker();
        tr.ingest(&SensorEvent::failure("F1", "T1", t(0)));

        assert!(!tr.register(Sensor::new("T1", "F1", SensorType::Temperature, 1)));
        assert_eq!(status(&tr, "T1"), SensorStatus::Failed);

        assert!(tr.register(Sensor::new("L2", "F1", SensorType::Level, 4)));
        let u = tr.ingest(&SensorEvent::failure("F1", "L2", t(1)));
        assert_eq!(u.transitions.len(), 1);
        let order: Vec<&str> = tr.snapshot().iter().map(|s| s.sensor_id.as_str()).collect();
        assert_eq!(order, vec!["T1", "L1", "Q1", "L2"]);
    }
}

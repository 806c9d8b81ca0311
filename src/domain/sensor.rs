// ==========================================
// 工厂健康监控系统 - 传感器领域模型
// ==========================================
// 生命周期: 工厂开通时创建; 只由 Tracker 在事件/超时扫描时修改; 不删除
// ==========================================

use crate::domain::types::{ReasonCode, SensorStatus, SensorType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

// ==========================================
// SensorThresholds - 读数阈值
// ==========================================
// nominal 区间内 → 正常
// nominal 外 warning_margin 以内 → 临界
// 更远 → 越限
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorThresholds {
    pub nominal_min: f64,
    pub nominal_max: f64,
    pub warning_margin: f64,
}

/// 单次读数分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingClass {
    Nominal,
    NearThreshold,
    OutOfRange,
}

impl SensorThresholds {
    pub fn new(nominal_min: f64, nominal_max: f64, warning_margin: f64) -> Self {
        Self {
            nominal_min,
            nominal_max,
            warning_margin,
        }
    }

    /// 各类型默认阈值
    pub fn default_for(sensor_type: SensorType) -> Self {
        match sensor_type {
            // 摄氏度
            SensorType::Temperature => Self::new(2.0, 8.0, 2.0),
            // 灌装液位百分比
            SensorType::Level => Self::new(90.0, 100.0, 5.0),
            // 质检评分
            SensorType::Quality => Self::new(70.0, 100.0, 10.0),
        }
    }

    pub fn classify(&self, value: f64) -> ReadingClass {
        if !value.is_finite() {
            return ReadingClass::OutOfRange;
        }
        if value >= self.nominal_min && value <= self.nominal_max {
            return ReadingClass::Nominal;
        }
        let distance = if value < self.nominal_min {
            self.nominal_min - value
        } else {
            value - self.nominal_max
        };
        if distance <= self.warning_margin {
            ReadingClass::NearThreshold
        } else {
            ReadingClass::OutOfRange
        }
    }

    pub fn is_valid(&self) -> bool {
        self.nominal_min.is_finite()
            && self.nominal_max.is_finite()
            && self.warning_margin.is_finite()
            && self.nominal_min <= self.nominal_max
            && self.warning_margin >= 0.0
    }
}

/// 单条读数
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

// ==========================================
// Sensor - 传感器
// ==========================================
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sensor {
    // ===== 身份 =====
    pub sensor_id: String,
    pub factory_id: String,
    pub sensor_type: SensorType,
    pub seq_no: i64, // 工厂内序号, 替换时取最小可用

    // ===== 状态 =====
    pub status: SensorStatus,
    pub status_reason: Option<ReasonCode>,
    pub status_since: Option<DateTime<Utc>>, // 最近一次状态迁移的事件时间
    pub failed_at: Option<DateTime<Utc>>,
    pub at_risk: bool,
    pub hold_until: Option<DateTime<Utc>>, // 人工覆写的保持截止时间

    // ===== 读数窗口 =====
    pub recent_readings: VecDeque<SensorReading>,
    pub consecutive_warnings: u32,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Sensor {
    pub fn new(sensor_id: &str, factory_id: &str, sensor_type: SensorType, seq_no: i64) -> Self {
        Self {
            sensor_id: sensor_id.to_string(),
            factory_id: factory_id.to_string(),
            sensor_type,
            seq_no,
            status: SensorStatus::Ok,
            status_reason: None,
            status_since: None,
            failed_at: None,
            at_risk: false,
            hold_until: None,
            recent_readings: VecDeque::new(),
            consecutive_warnings: 0,
            last_seen: None,
        }
    }

    /// 可作为替换生产传感器: OK 且未标记风险
    pub fn is_eligible_producer(&self) -> bool {
        self.status == SensorStatus::Ok && !self.at_risk
    }

    /// 记录读数到滚动窗口
    pub fn push_reading(&mut self, reading: SensorReading, window: usize) {
        self.recent_readings.push_back(reading);
        while self.recent_readings.len() > window.max(1) {
            self.recent_readings.pop_front();
        }
    }

    /// last_seen 只前进不回退
    pub fn touch(&mut self, ts: DateTime<Utc>) {
        if self.last_seen.map_or(true, |seen| ts > seen) {
            self.last_seen = Some(ts);
        }
    }

    /// 人工覆写是否仍在保持期
    pub fn is_held(&self, now: DateTime<Utc>) -> bool {
        self.hold_until.map_or(false, |until| now < until)
    }
}

// ==========================================
// 开通与查询
// ==========================================

/// 开通传感器规格
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorSpec {
    pub sensor_id: String,
    pub sensor_type: SensorType,
}

/// 工厂开通请求（传感器序号按列表顺序分配）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactoryProvision {
    pub factory_id: String,
    pub sensors: Vec<SensorSpec>,
}

/// 单个传感器状态视图
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorStatusView {
    pub sensor_id: String,
    pub sensor_type: SensorType,
    pub seq_no: i64,
    pub status: SensorStatus,
    pub status_reason: Option<ReasonCode>,
    pub at_risk: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

impl From<&Sensor> for SensorStatusView {
    fn from(s: &Sensor) -> Self {
        Self {
            sensor_id: s.sensor_id.clone(),
            sensor_type: s.sensor_type,
            seq_no: s.seq_no,
            status: s.status,
            status_reason: s.status_reason,
            at_risk: s.at_risk,
            last_seen: s.last_seen,
        }
    }
}

/// 工厂传感器汇总
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSummary {
    pub factory_id: String,
    pub total: u32,
    pub ok: u32,
    pub warning: u32,
    pub failed: u32,
    pub at_risk: Vec<String>,
    pub sensors: Vec<SensorStatusView>,
}

impl SensorSummary {
    pub fn from_sensors(factory_id: &str, sensors: &[Sensor]) -> Self {
        let count = |status: SensorStatus| sensors.iter().filter(|s| s.status == status).count() as u32;
        Self {
            factory_id: factory_id.to_string(),
            total: sensors.len() as u32,
            ok: count(SensorStatus::Ok),
            warning: count(SensorStatus::Warning),
            failed: count(SensorStatus::Failed),
            at_risk: sensors
                .iter()
                .filter(|s| s.at_risk)
                .map(|s| s.sensor_id.clone())
                .collect(),
            sensors: sensors.iter().map(SensorStatusView::from).collect(),
        }
    }
}

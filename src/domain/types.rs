// ==========================================
// 工厂健康监控系统 - 领域类型定义
// ==========================================
// 职责: 传感器/工厂/订单/分配的封闭状态类型
// 约束: 字符串状态只在传输边界解析一次,内部一律使用枚举
// ==========================================

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// 状态字符串解析失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("无法识别的{kind}取值: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

// ==========================================
// 传感器类型 (Sensor Type)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorType {
    Temperature, // 温度
    Level,       // 液位
    Quality,     // 质检
}

impl SensorType {
    pub const ALL: [SensorType; 3] = [SensorType::Temperature, SensorType::Level, SensorType::Quality];

    pub fn as_str(&self) -> &'static str {
        match self {
            SensorType::Temperature => "temperature",
            SensorType::Level => "level",
            SensorType::Quality => "quality",
        }
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "temperature" | "temp" => Ok(SensorType::Temperature),
            "level" => Ok(SensorType::Level),
            "quality" => Ok(SensorType::Quality),
            _ => Err(ParseEnumError::new("传感器类型", s)),
        }
    }
}

// ==========================================
// 传感器状态 (Sensor Status)
// ==========================================
// 顺序: Ok < Warning < Failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SensorStatus {
    Ok,      // 正常
    Warning, // 临界
    Failed,  // 失效
}

impl SensorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorStatus::Ok => "OK",
            SensorStatus::Warning => "WARNING",
            SensorStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SensorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OK" => Ok(SensorStatus::Ok),
            "WARNING" => Ok(SensorStatus::Warning),
            "FAILED" => Ok(SensorStatus::Failed),
            _ => Err(ParseEnumError::new("传感器状态", s)),
        }
    }
}

// ==========================================
// 工厂健康档位 (Factory Band)
// ==========================================
// 阈值: >=80 OPERATIONAL, 50-79 DEGRADED, 20-49 CRITICAL, <20 DOWN
// 顺序按严重程度: Operational < Degraded < Critical < Down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FactoryBand {
    Operational,
    Degraded,
    Critical,
    Down,
}

impl FactoryBand {
    pub const OPERATIONAL_MIN: f64 = 80.0;
    pub const DEGRADED_MIN: f64 = 50.0;
    pub const CRITICAL_MIN: f64 = 20.0;

    /// 由健康百分比映射档位（纯函数）
    pub fn from_percentage(health_percentage: f64) -> Self {
        if health_percentage >= Self::OPERATIONAL_MIN {
            FactoryBand::Operational
        } else if health_percentage >= Self::DEGRADED_MIN {
            FactoryBand::Degraded
        } else if health_percentage >= Self::CRITICAL_MIN {
            FactoryBand::Critical
        } else {
            FactoryBand::Down
        }
    }

    /// CRITICAL/DOWN 档位触发工厂级迁移
    pub fn requires_reschedule(&self) -> bool {
        matches!(self, FactoryBand::Critical | FactoryBand::Down)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FactoryBand::Operational => "OPERATIONAL",
            FactoryBand::Degraded => "DEGRADED",
            FactoryBand::Critical => "CRITICAL",
            FactoryBand::Down => "DOWN",
        }
    }
}

impl fmt::Display for FactoryBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FactoryBand {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OPERATIONAL" => Ok(FactoryBand::Operational),
            "DEGRADED" => Ok(FactoryBand::Degraded),
            "CRITICAL" => Ok(FactoryBand::Critical),
            "DOWN" => Ok(FactoryBand::Down),
            _ => Err(ParseEnumError::new("工厂档位", s)),
        }
    }
}

// ==========================================
// 订单状态 (Order Status)
// ==========================================
// 单调: pending → assigned → in_progress → completed
// cancelled 可由任一非终态到达
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }

    /// 推进序号（用于单调性校验, cancelled 不参与）
    pub fn progress_rank(&self) -> u8 {
        match self {
            OrderStatus::Pending => 0,
            OrderStatus::Assigned => 1,
            OrderStatus::InProgress => 2,
            OrderStatus::Completed => 3,
            OrderStatus::Cancelled => u8::MAX,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Assigned => "assigned",
            OrderStatus::InProgress => "in_progress",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(OrderStatus::Pending),
            "assigned" => Ok(OrderStatus::Assigned),
            "in_progress" => Ok(OrderStatus::InProgress),
            "completed" => Ok(OrderStatus::Completed),
            "cancelled" => Ok(OrderStatus::Cancelled),
            _ => Err(ParseEnumError::new("订单状态", s)),
        }
    }
}

// ==========================================
// 分配状态 (Assignment Status)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Assigned,
    InProgress,
    Completed,
    Cancelled,
}

impl AssignmentStatus {
    /// assigned / in_progress 占用工厂负载
    pub fn is_active(&self) -> bool {
        matches!(self, AssignmentStatus::Assigned | AssignmentStatus::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStatus::Assigned => "assigned",
            AssignmentStatus::InProgress => "in_progress",
            AssignmentStatus::Completed => "completed",
            AssignmentStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssignmentStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "assigned" => Ok(AssignmentStatus::Assigned),
            "in_progress" => Ok(AssignmentStatus::InProgress),
            "completed" => Ok(AssignmentStatus::Completed),
            "cancelled" => Ok(AssignmentStatus::Cancelled),
            _ => Err(ParseEnumError::new("分配状态", s)),
        }
    }
}

// ==========================================
// 原因代码 (Reason Code)
// ==========================================
// 健康事件/迁移事件共用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    // ===== 传感器状态迁移 =====
    ReadingNominal,
    NearThreshold,
    OutOfRange,
    ConsecutiveWarnings,
    HeartbeatTimeout,
    ReportedFailure,
    AtRisk,
    Restart,
    CooldownRecovered,
    ManualOverride,
    // ===== 工厂档位 =====
    BandChanged,
    AdmissionSuspended,
    RecoveryConfirmed,
    // ===== 迁移/替换 =====
    SensorReplaced,
    SensorExhausted,
    Migrated,
    MigrationDeferred,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::ReadingNominal => "READING_NOMINAL",
            ReasonCode::NearThreshold => "NEAR_THRESHOLD",
            ReasonCode::OutOfRange => "OUT_OF_RANGE",
            ReasonCode::ConsecutiveWarnings => "CONSECUTIVE_WARNINGS",
            ReasonCode::HeartbeatTimeout => "HEARTBEAT_TIMEOUT",
            ReasonCode::ReportedFailure => "REPORTED_FAILURE",
            ReasonCode::AtRisk => "AT_RISK",
            ReasonCode::Restart => "RESTART",
            ReasonCode::CooldownRecovered => "COOLDOWN_RECOVERED",
            ReasonCode::ManualOverride => "MANUAL_OVERRIDE",
            ReasonCode::BandChanged => "BAND_CHANGED",
            ReasonCode::AdmissionSuspended => "ADMISSION_SUSPENDED",
            ReasonCode::RecoveryConfirmed => "RECOVERY_CONFIRMED",
            ReasonCode::SensorReplaced => "SENSOR_REPLACED",
            ReasonCode::SensorExhausted => "SENSOR_EXHAUSTED",
            ReasonCode::Migrated => "MIGRATED",
            ReasonCode::MigrationDeferred => "MIGRATION_DEFERRED",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReasonCode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = match s.trim() {
            "READING_NOMINAL" => ReasonCode::ReadingNominal,
            "NEAR_THRESHOLD" => ReasonCode::NearThreshold,
            "OUT_OF_RANGE" => ReasonCode::OutOfRange,
            "CONSECUTIVE_WARNINGS" => ReasonCode::ConsecutiveWarnings,
            "HEARTBEAT_TIMEOUT" => ReasonCode::HeartbeatTimeout,
            "REPORTED_FAILURE" => ReasonCode::ReportedFailure,
            "AT_RISK" => ReasonCode::AtRisk,
            "RESTART" => ReasonCode::Restart,
            "COOLDOWN_RECOVERED" => ReasonCode::CooldownRecovered,
            "MANUAL_OVERRIDE" => ReasonCode::ManualOverride,
            "BAND_CHANGED" => ReasonCode::BandChanged,
            "ADMISSION_SUSPENDED" => ReasonCode::AdmissionSuspended,
            "RECOVERY_CONFIRMED" => ReasonCode::RecoveryConfirmed,
            "SENSOR_REPLACED" => ReasonCode::SensorReplaced,
            "SENSOR_EXHAUSTED" => ReasonCode::SensorExhausted,
            "MIGRATED" => ReasonCode::Migrated,
            "MIGRATION_DEFERRED" => ReasonCode::MigrationDeferred,
            _ => return Err(ParseEnumError::new("原因代码", s)),
        };
        Ok(code)
    }
}

// ==========================================
// 工厂健康监控系统 - 审计事件领域模型
// ==========================================
// 只追加, 创建后不可修改
// 用途: 可观测性 + "恢复需要连续 N 次健康确认" 规则
// ==========================================

use crate::domain::types::ReasonCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// 健康事件主体
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthSubject {
    Sensor,
    Factory,
}

impl HealthSubject {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthSubject::Sensor => "SENSOR",
            HealthSubject::Factory => "FACTORY",
        }
    }
}

impl fmt::Display for HealthSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthSubject {
    type Err = crate::domain::types::ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SENSOR" => Ok(HealthSubject::Sensor),
            "FACTORY" => Ok(HealthSubject::Factory),
            _ => Err(crate::domain::types::ParseEnumError {
                kind: "事件主体",
                value: s.to_string(),
            }),
        }
    }
}

// ==========================================
// HealthEvent - 传感器状态/工厂档位迁移
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthEvent {
    pub event_id: String,
    pub factory_id: String,
    pub sensor_id: Option<String>,
    pub subject: HealthSubject,
    pub from_state: Option<String>,
    pub to_state: String,
    pub reason: ReasonCode,
    pub health_percentage: Option<f64>,
    pub occurred_at: DateTime<Utc>,
}

impl HealthEvent {
    /// 传感器状态迁移事件
    pub fn sensor(
        factory_id: &str,
        sensor_id: &str,
        from: impl ToString,
        to: impl ToString,
        reason: ReasonCode,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            factory_id: factory_id.to_string(),
            sensor_id: Some(sensor_id.to_string()),
            subject: HealthSubject::Sensor,
            from_state: Some(from.to_string()),
            to_state: to.to_string(),
            reason,
            health_percentage: None,
            occurred_at,
        }
    }

    /// 工厂档位事件
    pub fn factory(
        factory_id: &str,
        from: Option<String>,
        to: impl ToString,
        reason: ReasonCode,
        health_percentage: f64,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            factory_id: factory_id.to_string(),
            sensor_id: None,
            subject: HealthSubject::Factory,
            from_state: from,
            to_state: to.to_string(),
            reason,
            health_percentage: Some(health_percentage),
            occurred_at,
        }
    }
}

// ==========================================
// FailoverEvent - 迁移/替换动作
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverEvent {
    pub event_id: String,
    pub factory_id: String, // 源工厂
    pub target_factory_id: Option<String>,
    pub order_id: Option<String>,
    pub assignment_id: Option<String>,
    pub sensor_id: Option<String>,
    pub replacement_sensor_id: Option<String>,
    pub reason: ReasonCode,
    pub detail: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl FailoverEvent {
    pub fn new(factory_id: &str, reason: ReasonCode, occurred_at: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            factory_id: factory_id.to_string(),
            target_factory_id: None,
            order_id: None,
            assignment_id: None,
            sensor_id: None,
            replacement_sensor_id: None,
            reason,
            detail: None,
            occurred_at,
        }
    }

    pub fn with_assignment(mut self, order_id: &str, assignment_id: &str) -> Self {
        self.order_id = Some(order_id.to_string());
        self.assignment_id = Some(assignment_id.to_string());
        self
    }

    pub fn with_target(mut self, target_factory_id: &str) -> Self {
        self.target_factory_id = Some(target_factory_id.to_string());
        self
    }

    pub fn with_sensors(mut self, sensor_id: Option<&str>, replacement: Option<&str>) -> Self {
        self.sensor_id = sensor_id.map(str::to_string);
        self.replacement_sensor_id = replacement.map(str::to_string);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

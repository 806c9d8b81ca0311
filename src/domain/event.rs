// ==========================================
// 工厂健康监控系统 - 入站传感器事件
// ==========================================
// 传输层消息在此一次性校验为封闭枚举, 畸形消息返回 EventParseError
// 消息类型: heartbeat / reading / sensor-failure / sensor-at-risk / restart
// ==========================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 入站消息解析错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EventParseError {
    #[error("消息不是合法 JSON: {0}")]
    InvalidJson(String),

    #[error("未知消息类型: {0}")]
    UnknownType(String),

    #[error("缺少字段: {0}")]
    MissingField(&'static str),

    #[error("字段取值非法 (field={field}): {message}")]
    InvalidField { field: &'static str, message: String },
}

// ==========================================
// RawEventMessage - 传输层原始消息
// ==========================================
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawEventMessage {
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub factory_id: Option<String>,
    pub sensor_id: Option<String>,
    pub value: Option<f64>,
    pub units_produced: Option<u32>,
    pub reason: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

// ==========================================
// SensorEvent - 校验后的事件
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    Heartbeat,
    Reading {
        value: f64,
        units_produced: Option<u32>,
    },
    SensorFailure {
        reason: Option<String>,
    },
    SensorAtRisk,
    Restart,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorEvent {
    pub factory_id: String,
    /// restart 可省略, 表示重启工厂内全部异常传感器
    pub sensor_id: Option<String>,
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
}

impl SensorEvent {
    pub fn heartbeat(factory_id: &str, sensor_id: &str, timestamp: DateTime<Utc>) -> Self {
        Self::with_payload(factory_id, Some(sensor_id), EventPayload::Heartbeat, timestamp)
    }

    pub fn reading(factory_id: &str, sensor_id: &str, value: f64, timestamp: DateTime<Utc>) -> Self {
        Self::with_payload(
            factory_id,
            Some(sensor_id),
            EventPayload::Reading {
                value,
                units_produced: None,
            },
            timestamp,
        )
    }

    pub fn production(
        factory_id: &str,
        sensor_id: &str,
        value: f64,
        units_produced: u32,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self::with_payload(
            factory_id,
            Some(sensor_id),
            EventPayload::Reading {
                value,
                units_produced: Some(units_produced),
            },
            timestamp,
        )
    }

    pub fn failure(factory_id: &str, sensor_id: &str, timestamp: DateTime<Utc>) -> Self {
        Self::with_payload(
            factory_id,
            Some(sensor_id),
            EventPayload::SensorFailure { reason: None },
            timestamp,
        )
    }

    pub fn at_risk(factory_id: &str, sensor_id: &str, timestamp: DateTime<Utc>) -> Self {
        Self::with_payload(factory_id, Some(sensor_id), EventPayload::SensorAtRisk, timestamp)
    }

    pub fn restart(factory_id: &str, sensor_id: Option<&str>, timestamp: DateTime<Utc>) -> Self {
        Self::with_payload(factory_id, sensor_id, EventPayload::Restart, timestamp)
    }

    fn with_payload(
        factory_id: &str,
        sensor_id: Option<&str>,
        payload: EventPayload,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            factory_id: factory_id.to_string(),
            sensor_id: sensor_id.map(str::to_string),
            payload,
            timestamp,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self.payload {
            EventPayload::Heartbeat => "heartbeat",
            EventPayload::Reading { .. } => "reading",
            EventPayload::SensorFailure { .. } => "sensor-failure",
            EventPayload::SensorAtRisk => "sensor-at-risk",
            EventPayload::Restart => "restart",
        }
    }

    /// 从 JSON 文本解析
    pub fn parse_json(text: &str) -> Result<Self, EventParseError> {
        let raw: RawEventMessage =
            serde_json::from_str(text).map_err(|e| EventParseError::InvalidJson(e.to_string()))?;
        Self::try_from(raw)
    }
}

fn non_empty(value: Option<String>, field: &'static str) -> Result<String, EventParseError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        Some(_) => Err(EventParseError::InvalidField {
            field,
            message: "不能为空".to_string(),
        }),
        None => Err(EventParseError::MissingField(field)),
    }
}

impl TryFrom<RawEventMessage> for SensorEvent {
    type Error = EventParseError;

    fn try_from(raw: RawEventMessage) -> Result<Self, Self::Error> {
        let event_type = non_empty(raw.event_type, "type")?;
        let factory_id = non_empty(raw.factory_id, "factory_id")?;
        let timestamp = raw.timestamp.ok_or(EventParseError::MissingField("timestamp"))?;

        let payload = match event_type.to_ascii_lowercase().replace('_', "-").as_str() {
            "heartbeat" => EventPayload::Heartbeat,
            "reading" => {
                let value = raw.value.ok_or(EventParseError::MissingField("value"))?;
                if !value.is_finite() {
                    return Err(EventParseError::InvalidField {
                        field: "value",
                        message: format!("非有限数值: {}", value),
                    });
                }
                EventPayload::Reading {
                    value,
                    units_produced: raw.units_produced,
                }
            }
            "sensor-failure" => EventPayload::SensorFailure { reason: raw.reason },
            "sensor-at-risk" => EventPayload::SensorAtRisk,
            "restart" => EventPayload::Restart,
            other => return Err(EventParseError::UnknownType(other.to_string())),
        };

        let sensor_id = match payload {
            EventPayload::Restart => raw
                .sensor_id
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            _ => Some(non_empty(raw.sensor_id, "sensor_id")?),
        };

        Ok(Self {
            factory_id,
            sensor_id,
            payload,
            timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reading() {
        let e = SensorEvent::parse_json(
            r#"{"type":"reading","factory_id":"F1","sensor_id":"S1-1","value":5.5,"units_produced":1,"timestamp":"2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(e.factory_id, "F1");
        assert_eq!(e.sensor_id.as_deref(), Some("S1-1"));
        assert_eq!(
            e.payload,
            EventPayload::Reading {
                value: 5.5,
                units_produced: Some(1)
            }
        );
    }

    #[test]
    fn test_restart_without_sensor() {
        let e = SensorEvent::parse_json(
            r#"{"type":"restart","factory_id":"F2","timestamp":"2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(e.payload, EventPayload::Restart);
        assert!(e.sensor_id.is_none());
    }

    #[test]
    fn test_malformed_messages() {
        assert!(matches!(
            SensorEvent::parse_json("not json"),
            Err(EventParseError::InvalidJson(_))
        ));
        assert_eq!(
            SensorEvent::parse_json(
                r#"{"type":"reading","factory_id":"F1","sensor_id":"S1","timestamp":"2026-01-01T00:00:00Z"}"#
            ),
            Err(EventParseError::MissingField("value"))
        );
        assert_eq!(
            SensorEvent::parse_json(
                r#"{"type":"vibration","factory_id":"F1","sensor_id":"S1","timestamp":"2026-01-01T00:00:00Z"}"#
            ),
            Err(EventParseError::UnknownType("vibration".to_string()))
        );
        assert_eq!(
            SensorEvent::parse_json(r#"{"type":"heartbeat","factory_id":"F1","timestamp":"2026-01-01T00:00:00Z"}"#),
            Err(EventParseError::MissingField("sensor_id"))
        );
    }

    #[test]
    fn test_type_aliases() {
        let e = SensorEvent::parse_json(
            r#"{"type":"SENSOR_AT_RISK","factory_id":"F1","sensor_id":"S1","timestamp":"2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(e.kind(), "sensor-at-risk");
    }
}

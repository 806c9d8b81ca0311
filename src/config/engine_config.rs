// ==========================================
// 工厂健康监控系统 - 引擎配置
// ==========================================
// 默认值在此集中定义, config_kv 中的 global 配置覆盖默认值
// ==========================================

use crate::db::RetryPolicy;
use crate::domain::sensor::SensorThresholds;
use crate::domain::types::SensorType;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 引擎运行参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // ===== 传感器跟踪 =====
    pub sensor_timeout_secs: i64,
    pub sensor_cooldown_secs: i64,
    pub consecutive_warning_limit: u32,
    pub sustained_warning_run: u32,
    pub reading_window: usize,

    // ===== 产能 =====
    pub operational_ceiling: u32,
    pub degraded_ceiling: u32,
    pub unit_cap: u32, // 单工厂单次分配上限

    // ===== 准入与事务 =====
    pub admission_attempts: u32,
    pub tx_retry_attempts: u32,
    pub tx_retry_base_ms: u64,

    // ===== 恢复门控 =====
    pub recovery_confirmations: u32,

    // ===== 对端通知 =====
    pub peer_retry_attempts: u32,
    pub peer_retry_base_ms: u64,
    pub peer_timeout_ms: u64,

    // ===== 运行时 =====
    pub sweep_period_ms: u64,
    pub worker_queue_depth: usize,
    pub snapshot_path: Option<String>,

    // ===== 阈值 =====
    pub temperature_thresholds: SensorThresholds,
    pub level_thresholds: SensorThresholds,
    pub quality_thresholds: SensorThresholds,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sensor_timeout_secs: 5,
            sensor_cooldown_secs: 30,
            consecutive_warning_limit: 3,
            sustained_warning_run: 2,
            reading_window: 10,
            operational_ceiling: 5,
            degraded_ceiling: 1,
            unit_cap: 1000,
            admission_attempts: 3,
            tx_retry_attempts: 3,
            tx_retry_base_ms: 50,
            recovery_confirmations: 5,
            peer_retry_attempts: 3,
            peer_retry_base_ms: 500,
            peer_timeout_ms: 10_000,
            sweep_period_ms: 1_000,
            worker_queue_depth: 256,
            snapshot_path: None,
            temperature_thresholds: SensorThresholds::default_for(SensorType::Temperature),
            level_thresholds: SensorThresholds::default_for(SensorType::Level),
            quality_thresholds: SensorThresholds::default_for(SensorType::Quality),
        }
    }
}

impl EngineConfig {
    pub fn thresholds_for(&self, sensor_type: SensorType) -> &SensorThresholds {
        match sensor_type {
            SensorType::Temperature => &self.temperature_thresholds,
            SensorType::Level => &self.level_thresholds,
            SensorType::Quality => &self.quality_thresholds,
        }
    }

    pub fn set_thresholds(&mut self, sensor_type: SensorType, thresholds: SensorThresholds) {
        match sensor_type {
            SensorType::Temperature => self.temperature_thresholds = thresholds,
            SensorType::Level => self.level_thresholds = thresholds,
            SensorType::Quality => self.quality_thresholds = thresholds,
        }
    }

    pub fn sensor_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.sensor_timeout_secs)
    }

    pub fn sensor_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.sensor_cooldown_secs)
    }

    pub fn tx_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.tx_retry_attempts,
            Duration::from_millis(self.tx_retry_base_ms),
        )
    }

    pub fn peer_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.peer_retry_attempts,
            Duration::from_millis(self.peer_retry_base_ms),
        )
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn sweep_period(&self) -> Duration {
        Duration::from_millis(self.sweep_period_ms.max(1))
    }
}

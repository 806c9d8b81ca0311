// ==========================================
// 工厂健康监控系统 - 配置管理器
// ==========================================
// 职责: 配置加载、查询、覆写管理
// 存储: config_kv 表 (key-value + scope)
// ==========================================

use crate::config::engine_config::EngineConfig;
use crate::db::open_sqlite_connection;
use crate::domain::sensor::SensorThresholds;
use crate::domain::types::SensorType;
use rusqlite::{params, Connection};
use serde_json::json;
use std::collections::HashMap;
use std::error::Error;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// 配置层 Result
pub type ConfigResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

// ==========================================
// ConfigManager - 配置管理器
// ==========================================
pub struct ConfigManager {
    conn: Arc<Mutex<Connection>>,
}

impl ConfigManager {
    /// 创建新的 ConfigManager 实例
    ///
    /// # 参数
    /// - db_path: 数据库文件路径
    pub fn new(db_path: &str) -> ConfigResult<Self> {
        let conn = open_sqlite_connection(db_path)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 从已有连接创建 ConfigManager
    ///
    /// 说明：为保证连接行为一致，会对传入连接再次应用统一 PRAGMA（幂等）。
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> ConfigResult<Self> {
        {
            let conn_guard = conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;
            crate::db::configure_sqlite_connection(&conn_guard)?;
        }

        Ok(Self { conn })
    }

    /// 从 config_kv 表读取配置值（scope_id='global'）
    ///
    /// # 返回
    /// - Some(String): 配置值
    /// - None: 配置不存在
    fn get_config_value(&self, key: &str) -> ConfigResult<Option<String>> {
        let conn = self.conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;

        let result = conn.query_row(
            "SELECT value FROM config_kv WHERE scope_id = 'global' AND key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Box::new(e)),
        }
    }

    /// 读取 global scope 的配置值（公开方法，供其他模块复用）
    pub fn get_global_config_value(&self, key: &str) -> ConfigResult<Option<String>> {
        self.get_config_value(key)
    }

    /// 写入 global scope 配置（UPSERT）
    pub fn set_global_config_value(&self, key: &str, value: &str) -> ConfigResult<()> {
        let conn = self.conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;
        conn.execute(
            "INSERT INTO config_kv (scope_id, key, value, updated_at)
             VALUES ('global', ?1, ?2, datetime('now'))
             ON CONFLICT(scope_id, key) DO UPDATE SET value = ?2, updated_at = datetime('now')",
            params![key, value],
        )?;
        Ok(())
    }

    /// 获取所有配置的快照（JSON格式）
    pub fn get_config_snapshot(&self) -> ConfigResult<String> {
        let conn = self.conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;

        let mut stmt = conn.prepare(
            "SELECT key, value FROM config_kv WHERE scope_id = 'global' ORDER BY key"
        )?;

        let mut config_map: HashMap<String, String> = HashMap::new();
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
            ))
        })?;

        for row in rows {
            let (key, value) = row?;
            config_map.insert(key, value);
        }

        let json_value = json!(config_map);
        Ok(serde_json::to_string(&json_value)?)
    }

    /// 读取数值配置, 格式错误时告警并回退默认值
    fn parse_or<T: FromStr + Copy + std::fmt::Display>(&self, key: &str, default: T) -> ConfigResult<T> {
        match self.get_config_value(key)? {
            None => Ok(default),
            Some(raw) => match raw.trim().parse::<T>() {
                Ok(v) => Ok(v),
                Err(_) => {
                    warn!(
                        config_key = key,
                        raw_value = %raw,
                        default = %default,
                        "配置格式错误，使用默认值"
                    );
                    Ok(default)
                }
            },
        }
    }

    /// 加载引擎配置（默认值 + config_kv 覆写）
    ///
    /// # 说明
    /// - 缺失的键保留默认值
    /// - 格式错误的键告警后保留默认值, 不阻断启动
    pub fn load_engine_config(&self) -> ConfigResult<EngineConfig> {
        let d = EngineConfig::default();
        let mut c = EngineConfig {
            sensor_timeout_secs: self.parse_or(config_keys::SENSOR_TIMEOUT_SECS, d.sensor_timeout_secs)?,
            sensor_cooldown_secs: self.parse_or(config_keys::SENSOR_COOLDOWN_SECS, d.sensor_cooldown_secs)?,
            consecutive_warning_limit: self
                .parse_or(config_keys::CONSECUTIVE_WARNING_LIMIT, d.consecutive_warning_limit)?,
            sustained_warning_run: self.parse_or(config_keys::SUSTAINED_WARNING_RUN, d.sustained_warning_run)?,
            reading_window: self.parse_or(config_keys::READING_WINDOW, d.reading_window)?,
            operational_ceiling: self.parse_or(config_keys::OPERATIONAL_CEILING, d.operational_ceiling)?,
            degraded_ceiling: self.parse_or(config_keys::DEGRADED_CEILING, d.degraded_ceiling)?,
            unit_cap: self.parse_or(config_keys::UNIT_CAP, d.unit_cap)?,
            admission_attempts: self.parse_or(config_keys::ADMISSION_ATTEMPTS, d.admission_attempts)?,
            tx_retry_attempts: self.parse_or(config_keys::TX_RETRY_ATTEMPTS, d.tx_retry_attempts)?,
            tx_retry_base_ms: self.parse_or(config_keys::TX_RETRY_BASE_MS, d.tx_retry_base_ms)?,
            recovery_confirmations: self
                .parse_or(config_keys::RECOVERY_CONFIRMATIONS, d.recovery_confirmations)?,
            peer_retry_attempts: self.parse_or(config_keys::PEER_RETRY_ATTEMPTS, d.peer_retry_attempts)?,
            peer_retry_base_ms: self.parse_or(config_keys::PEER_RETRY_BASE_MS, d.peer_retry_base_ms)?,
            peer_timeout_ms: self.parse_or(config_keys::PEER_TIMEOUT_MS, d.peer_timeout_ms)?,
            sweep_period_ms: self.parse_or(config_keys::SWEEP_PERIOD_MS, d.sweep_period_ms)?,
            worker_queue_depth: self.parse_or(config_keys::WORKER_QUEUE_DEPTH, d.worker_queue_depth)?,
            snapshot_path: self
                .get_config_value(config_keys::SNAPSHOT_PATH)?
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            ..d
        };

        if c.unit_cap == 0 {
            warn!(config_key = config_keys::UNIT_CAP, "unit_cap 不能为 0，使用默认值");
            c.unit_cap = EngineConfig::default().unit_cap;
        }

        for sensor_type in SensorType::ALL {
            let key = config_keys::thresholds_key(sensor_type);
            let raw = match self.get_config_value(&key)? {
                Some(v) => v,
                None => continue,
            };
            match serde_json::from_str::<SensorThresholds>(&raw) {
                Ok(t) if t.is_valid() => c.set_thresholds(sensor_type, t),
                _ => warn!(
                    config_key = %key,
                    raw_value = %raw,
                    "传感器阈值配置格式错误，使用默认阈值"
                ),
            }
        }

        Ok(c)
    }
}

// ==========================================
// 配置键常量
// ==========================================
pub mod config_keys {
    use crate::domain::types::SensorType;

    // 传感器跟踪
    pub const SENSOR_TIMEOUT_SECS: &str = "sensor_timeout_secs";
    pub const SENSOR_COOLDOWN_SECS: &str = "sensor_cooldown_secs";
    pub const CONSECUTIVE_WARNING_LIMIT: &str = "consecutive_warning_limit";
    pub const SUSTAINED_WARNING_RUN: &str = "sustained_warning_run";
    pub const READING_WINDOW: &str = "reading_window";

    // 产能
    pub const OPERATIONAL_CEILING: &str = "operational_ceiling";
    pub const DEGRADED_CEILING: &str = "degraded_ceiling";
    pub const UNIT_CAP: &str = "unit_cap";

    // 准入与事务
    pub const ADMISSION_ATTEMPTS: &str = "admission_attempts";
    pub const TX_RETRY_ATTEMPTS: &str = "tx_retry_attempts";
    pub const TX_RETRY_BASE_MS: &str = "tx_retry_base_ms";

    // 恢复门控
    pub const RECOVERY_CONFIRMATIONS: &str = "recovery_confirmations";

    // 对端通知
    pub const PEER_RETRY_ATTEMPTS: &str = "peer_retry_attempts";
    pub const PEER_RETRY_BASE_MS: &str = "peer_retry_base_ms";
    pub const PEER_TIMEOUT_MS: &str = "peer_timeout_ms";

    // 运行时
    pub const SWEEP_PERIOD_MS: &str = "sweep_period_ms";
    pub const WORKER_QUEUE_DEPTH: &str = "worker_queue_depth";
    pub const SNAPSHOT_PATH: &str = "snapshot_path";

    /// 传感器阈值 (JSON): sensor_thresholds/{type}
    pub fn thresholds_key(sensor_type: SensorType) -> String {
        format!("sensor_thresholds/{}", sensor_type.as_str())
    }
}

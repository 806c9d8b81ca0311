// ==========================================
// 工厂健康监控系统 - SQLite 连接与 schema
// ==========================================
// 目标:
// - 统一所有 Connection::open 的 PRAGMA 行为 (foreign_keys / busy_timeout)
// - schema 幂等初始化
// - 瞬时冲突 (BUSY/LOCKED) 的有界指数退避重试
// ==========================================

use crate::repository::error::{RepositoryError, RepositoryResult};
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// 默认 busy_timeout（毫秒）
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// 当前代码所期望的 schema_version
pub const CURRENT_SCHEMA_VERSION: i64 = 1;

/// 配置 SQLite 连接的统一 PRAGMA
///
/// 说明：
/// - foreign_keys 需要“每个连接”单独开启
/// - busy_timeout 需要“每个连接”单独配置
pub fn configure_sqlite_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))?;
    Ok(())
}

/// 打开 SQLite 连接并应用统一配置
pub fn open_sqlite_connection(db_path: &str) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;
    configure_sqlite_connection(&conn)?;
    Ok(conn)
}

/// 打开共享连接并初始化 schema
pub fn open_shared_connection(db_path: &str) -> RepositoryResult<Arc<Mutex<Connection>>> {
    let conn = open_sqlite_connection(db_path)
        .map_err(|e| RepositoryError::DatabaseConnectionError(format!("{}: {}", db_path, e)))?;
    init_schema(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// 读取 schema_version（若表不存在则返回 None）
pub fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<i64>> {
    let has_table: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version' LIMIT 1",
            [],
            |_row| Ok(true),
        )
        .optional()?
        .unwrap_or(false);

    if !has_table {
        return Ok(None);
    }

    let v: Option<i64> = conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
    Ok(v)
}

/// 初始化 schema（幂等）
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [CURRENT_SCHEMA_VERSION],
    )?;

    if let Some(v) = read_schema_version(conn)? {
        if v != CURRENT_SCHEMA_VERSION {
            warn!(
                found = v,
                expected = CURRENT_SCHEMA_VERSION,
                "schema_version 与代码期望不一致"
            );
        }
    }
    Ok(())
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS config_scope (
    scope_id TEXT PRIMARY KEY,
    scope_type TEXT NOT NULL,
    scope_key TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(scope_type, scope_key)
);

INSERT OR IGNORE INTO config_scope (scope_id, scope_type, scope_key)
VALUES ('global', 'GLOBAL', 'global');

CREATE TABLE IF NOT EXISTS config_kv (
    scope_id TEXT NOT NULL REFERENCES config_scope(scope_id) ON DELETE CASCADE,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (scope_id, key)
);

CREATE TABLE IF NOT EXISTS factories (
    factory_id TEXT PRIMARY KEY,
    health_percentage REAL NOT NULL DEFAULT 100.0,
    band TEXT NOT NULL DEFAULT 'OPERATIONAL',
    load INTEGER NOT NULL DEFAULT 0 CHECK (load >= 0),
    admission_enabled INTEGER NOT NULL DEFAULT 1,
    recovery_streak INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sensors (
    sensor_id TEXT PRIMARY KEY,
    factory_id TEXT NOT NULL REFERENCES factories(factory_id),
    sensor_type TEXT NOT NULL,
    seq_no INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'OK',
    status_reason TEXT,
    status_since TEXT,
    failed_at TEXT,
    at_risk INTEGER NOT NULL DEFAULT 0,
    hold_until TEXT,
    consecutive_warnings INTEGER NOT NULL DEFAULT 0,
    last_seen TEXT,
    UNIQUE(factory_id, seq_no)
);

CREATE TABLE IF NOT EXISTS orders (
    order_id TEXT PRIMARY KEY,
    product_type TEXT NOT NULL,
    quantity INTEGER NOT NULL CHECK (quantity > 0),
    priority INTEGER NOT NULL DEFAULT 0,
    deadline TEXT,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS assignments (
    assignment_id TEXT PRIMARY KEY,
    order_id TEXT NOT NULL REFERENCES orders(order_id),
    factory_id TEXT NOT NULL REFERENCES factories(factory_id),
    sensor_id TEXT,
    assigned_quantity INTEGER NOT NULL CHECK (assigned_quantity > 0),
    completed_quantity INTEGER NOT NULL DEFAULT 0,
    queue_position INTEGER NOT NULL,
    status TEXT NOT NULL,
    blocked INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    CHECK (completed_quantity >= 0 AND completed_quantity <= assigned_quantity)
);

CREATE INDEX IF NOT EXISTS idx_assignments_order ON assignments(order_id);
CREATE INDEX IF NOT EXISTS idx_assignments_factory_status ON assignments(factory_id, status);

CREATE TABLE IF NOT EXISTS health_events (
    event_id TEXT PRIMARY KEY,
    factory_id TEXT NOT NULL,
    sensor_id TEXT,
    subject TEXT NOT NULL,
    from_state TEXT,
    to_state TEXT NOT NULL,
    reason TEXT NOT NULL,
    health_percentage REAL,
    occurred_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_health_events_factory ON health_events(factory_id, occurred_at);

CREATE TABLE IF NOT EXISTS failover_events (
    event_id TEXT PRIMARY KEY,
    factory_id TEXT NOT NULL,
    target_factory_id TEXT,
    order_id TEXT,
    assignment_id TEXT,
    sensor_id TEXT,
    replacement_sensor_id TEXT,
    reason TEXT NOT NULL,
    detail TEXT,
    occurred_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_failover_events_factory ON failover_events(factory_id, occurred_at);
"#;

// ==========================================
// 事务重试
// ==========================================

/// 可区分瞬时冲突的错误
pub trait TransientError {
    fn is_transient(&self) -> bool;
}

impl TransientError for RepositoryError {
    fn is_transient(&self) -> bool {
        RepositoryError::is_transient(self)
    }
}

/// 有界指数退避策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// 第 attempt 次失败后的等待时长 (attempt 从 1 开始): base * 2^(attempt-1)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << shift)
    }
}

/// 执行操作, 仅对瞬时冲突进行有界重试
///
/// # 参数
/// - policy: 重试策略
/// - op: 每次尝试执行的闭包（须自行获取/释放连接锁）
///
/// # 返回
/// - 首次成功的结果, 或最后一次错误
pub fn run_with_retry<T, E, F>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    E: TransientError + std::fmt::Display,
    F: FnMut() -> Result<T, E>,
{
    let mut attempt = 1;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "瞬时冲突, 退避重试");
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => {
                if e.is_transient() {
                    warn!(attempts = attempt, error = %e, "瞬时冲突重试耗尽");
                }
                return Err(e);
            }
        }
    }
}

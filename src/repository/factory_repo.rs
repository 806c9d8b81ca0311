// ==========================================
// 工厂健康监控系统 - 工厂数据仓储
// ==========================================
// 红线: Repository 不含业务逻辑
// 约束: load 的增减只在 StoreTx 内调用 (见 repository::tx)
// ==========================================

use crate::domain::factory::Factory;
use crate::domain::types::FactoryBand;
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::sql_utils::{enum_column, u32_column};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex};

const FACTORY_COLUMNS: &str = "factory_id, health_percentage, band, load, admission_enabled, recovery_streak, updated_at";

fn map_factory(row: &Row<'_>) -> rusqlite::Result<Factory> {
    Ok(Factory {
        factory_id: row.get(0)?,
        health_percentage: row.get(1)?,
        band: enum_column(row, 2)?,
        load: u32_column(row, 3)?,
        admission_enabled: row.get::<_, i64>(4)? != 0,
        recovery_streak: u32_column(row, 5)?,
        updated_at: row.get(6)?,
    })
}

// ==========================================
// 连接级 SQL (Repository 与 StoreTx 共用)
// ==========================================

pub(crate) fn insert_if_absent(conn: &Connection, factory: &Factory) -> RepositoryResult<bool> {
    let affected = conn.execute(
        r#"
        INSERT OR IGNORE INTO factories
            (factory_id, health_percentage, band, load, admission_enabled, recovery_streak, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            factory.factory_id,
            factory.health_percentage,
            factory.band.as_str(),
            factory.load as i64,
            factory.admission_enabled as i64,
            factory.recovery_streak as i64,
            factory.updated_at,
        ],
    )?;
    Ok(affected > 0)
}

pub(crate) fn find(conn: &Connection, factory_id: &str) -> RepositoryResult<Option<Factory>> {
    let sql = format!("SELECT {} FROM factories WHERE factory_id = ?1", FACTORY_COLUMNS);
    let factory = conn
        .query_row(&sql, params![factory_id], map_factory)
        .optional()?;
    Ok(factory)
}

pub(crate) fn list(conn: &Connection) -> RepositoryResult<Vec<Factory>> {
    let sql = format!("SELECT {} FROM factories ORDER BY factory_id", FACTORY_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let factories = stmt
        .query_map([], map_factory)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(factories)
}

pub(crate) fn update_health(
    conn: &Connection,
    factory_id: &str,
    health_percentage: f64,
    band: FactoryBand,
    now: DateTime<Utc>,
) -> RepositoryResult<()> {
    let affected = conn.execute(
        "UPDATE factories SET health_percentage = ?2, band = ?3, updated_at = ?4 WHERE factory_id = ?1",
        params![factory_id, health_percentage, band.as_str(), now],
    )?;
    if affected == 0 {
        return Err(RepositoryError::not_found("Factory", factory_id));
    }
    Ok(())
}

pub(crate) fn update_admission(
    conn: &Connection,
    factory_id: &str,
    admission_enabled: bool,
    recovery_streak: u32,
    now: DateTime<Utc>,
) -> RepositoryResult<()> {
    let affected = conn.execute(
        "UPDATE factories SET admission_enabled = ?2, recovery_streak = ?3, updated_at = ?4 WHERE factory_id = ?1",
        params![factory_id, admission_enabled as i64, recovery_streak as i64, now],
    )?;
    if affected == 0 {
        return Err(RepositoryError::not_found("Factory", factory_id));
    }
    Ok(())
}

/// 条件占用一个槽位: 仅当 load < capacity 时 +1
///
/// # 返回
/// - true: 占用成功
/// - false: 已满（调用方视为容量冲突）
pub(crate) fn reserve_slot(
    conn: &Connection,
    factory_id: &str,
    capacity: u32,
    now: DateTime<Utc>,
) -> RepositoryResult<bool> {
    let affected = conn.execute(
        "UPDATE factories SET load = load + 1, updated_at = ?3 WHERE factory_id = ?1 AND load < ?2",
        params![factory_id, capacity as i64, now],
    )?;
    Ok(affected > 0)
}

/// 释放一个槽位（不低于 0）
pub(crate) fn release_slot(conn: &Connection, factory_id: &str, now: DateTime<Utc>) -> RepositoryResult<()> {
    conn.execute(
        "UPDATE factories SET load = MAX(load - 1, 0), updated_at = ?2 WHERE factory_id = ?1",
        params![factory_id, now],
    )?;
    Ok(())
}

// ==========================================
// FactoryRepository - 工厂仓储
// ==========================================

/// 工厂仓储
/// 职责: 管理 factories 表的读取与健康字段写入
pub struct FactoryRepository {
    conn: Arc<Mutex<Connection>>,
}

impl FactoryRepository {
    /// 从已有连接创建仓储实例
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// 获取数据库连接
    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    /// 开通工厂（已存在则忽略）
    ///
    /// # 返回
    /// - Ok(true): 新建
    /// - Ok(false): 已存在
    pub fn insert_if_absent(&self, factory: &Factory) -> RepositoryResult<bool> {
        let conn = self.get_conn()?;
        insert_if_absent(&conn, factory)
    }

    pub fn find_by_id(&self, factory_id: &str) -> RepositoryResult<Option<Factory>> {
        let conn = self.get_conn()?;
        find(&conn, factory_id)
    }

    /// 查询工厂, 不存在时返回 NotFound
    pub fn get(&self, factory_id: &str) -> RepositoryResult<Factory> {
        self.find_by_id(factory_id)?
            .ok_or_else(|| RepositoryError::not_found("Factory", factory_id))
    }

    pub fn list_all(&self) -> RepositoryResult<Vec<Factory>> {
        let conn = self.get_conn()?;
        list(&conn)
    }

    /// 写入健康派生字段（Aggregator 专用）
    pub fn update_health(
        &self,
        factory_id: &str,
        health_percentage: f64,
        band: FactoryBand,
        now: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        update_health(&conn, factory_id, health_percentage, band, now)
    }

    /// 写入准入门控字段（Rescheduler 专用）
    pub fn update_admission(
        &self,
        factory_id: &str,
        admission_enabled: bool,
        recovery_streak: u32,
        now: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        update_admission(&conn, factory_id, admission_enabled, recovery_streak, now)
    }
}

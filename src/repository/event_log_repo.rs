// ==========================================
// 工厂健康监控系统 - 审计事件数据仓储
// ==========================================
// 红线: 只追加, 不提供 UPDATE/DELETE
// ==========================================

use crate::domain::health_event::{FailoverEvent, HealthEvent};
use crate::domain::types::ReasonCode;
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::sql_utils::enum_column;
use rusqlite::{params, Connection, Row};
use std::sync::{Arc, Mutex};

fn map_health_event(row: &Row<'_>) -> rusqlite::Result<HealthEvent> {
    Ok(HealthEvent {
        event_id: row.get(0)?,
        factory_id: row.get(1)?,
        sensor_id: row.get(2)?,
        subject: enum_column(row, 3)?,
        from_state: row.get(4)?,
        to_state: row.get(5)?,
        reason: enum_column(row, 6)?,
        health_percentage: row.get(7)?,
        occurred_at: row.get(8)?,
    })
}

fn map_failover_event(row: &Row<'_>) -> rusqlite::Result<FailoverEvent> {
    Ok(FailoverEvent {
        event_id: row.get(0)?,
        factory_id: row.get(1)?,
        target_factory_id: row.get(2)?,
        order_id: row.get(3)?,
        assignment_id: row.get(4)?,
        sensor_id: row.get(5)?,
        replacement_sensor_id: row.get(6)?,
        reason: enum_column(row, 7)?,
        detail: row.get(8)?,
        occurred_at: row.get(9)?,
    })
}

pub(crate) fn insert_health_event(conn: &Connection, e: &HealthEvent) -> RepositoryResult<()> {
    conn.execute(
        r#"
        INSERT INTO health_events
            (event_id, factory_id, sensor_id, subject, from_state, to_state, reason,
             health_percentage, occurred_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
        params![
            e.event_id,
            e.factory_id,
            e.sensor_id,
            e.subject.as_str(),
            e.from_state,
            e.to_state,
            e.reason.as_str(),
            e.health_percentage,
            e.occurred_at,
        ],
    )?;
    Ok(())
}

pub(crate) fn insert_failover_event(conn: &Connection, e: &FailoverEvent) -> RepositoryResult<()> {
    conn.execute(
        r#"
        INSERT INTO failover_events
            (event_id, factory_id, target_factory_id, order_id, assignment_id, sensor_id,
             replacement_sensor_id, reason, detail, occurred_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
        params![
            e.event_id,
            e.factory_id,
            e.target_factory_id,
            e.order_id,
            e.assignment_id,
            e.sensor_id,
            e.replacement_sensor_id,
            e.reason.as_str(),
            e.detail,
            e.occurred_at,
        ],
    )?;
    Ok(())
}

// ==========================================
// EventLogRepository - 审计事件仓储
// ==========================================
pub struct EventLogRepository {
    conn: Arc<Mutex<Connection>>,
}

impl EventLogRepository {
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    /// 追加健康事件
    pub fn append_health_event(&self, event: &HealthEvent) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        insert_health_event(&conn, event)
    }

    /// 批量追加健康事件（同一事务）
    pub fn append_health_events(&self, events: &[HealthEvent]) -> RepositoryResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut conn = self.get_conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;
        for event in events {
            insert_health_event(&tx, event)?;
        }
        tx.commit()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;
        Ok(())
    }

    pub fn append_failover_event(&self, event: &FailoverEvent) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        insert_failover_event(&conn, event)
    }

    /// 查询工厂健康事件（最新在前）
    ///
    /// # 参数
    /// - factory_id: 工厂ID
    /// - limit: 最大条数
    pub fn list_health_events(&self, factory_id: &str, limit: usize) -> RepositoryResult<Vec<HealthEvent>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT event_id, factory_id, sensor_id, subject, from_state, to_state, reason,
                   health_percentage, occurred_at
            FROM health_events
            WHERE factory_id = ?1
            ORDER BY occurred_at DESC, rowid DESC
            LIMIT ?2
            "#,
        )?;
        let events = stmt
            .query_map(params![factory_id, limit as i64], map_health_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// 查询工厂迁移/替换事件（最新在前）
    pub fn list_failover_events(&self, factory_id: &str, limit: usize) -> RepositoryResult<Vec<FailoverEvent>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT event_id, factory_id, target_factory_id, order_id, assignment_id, sensor_id,
                   replacement_sensor_id, reason, detail, occurred_at
            FROM failover_events
            WHERE factory_id = ?1
            ORDER BY occurred_at DESC, rowid DESC
            LIMIT ?2
            "#,
        )?;
        let events = stmt
            .query_map(params![factory_id, limit as i64], map_failover_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// 按原因统计工厂迁移事件数
    pub fn count_failover_events(&self, factory_id: &str, reason: ReasonCode) -> RepositoryResult<u64> {
        let conn = self.get_conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM failover_events WHERE factory_id = ?1 AND reason = ?2",
            params![factory_id, reason.as_str()],
            |row| row.get(0),
        )?;
        Ok(n.max(0) as u64)
    }
}

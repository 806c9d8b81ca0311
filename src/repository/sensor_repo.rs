// ==========================================
// 工厂健康监控系统 - 传感器数据仓储
// ==========================================
// 红线: Repository 不含业务逻辑
// 说明: 权威状态在 Tracker 内存中, 本表是其镜像, 只由 Tracker 写入
// 读数窗口不落库
// ==========================================

use crate::domain::sensor::Sensor;
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::sql_utils::{enum_column, optional_enum_column, u32_column};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

const SENSOR_COLUMNS: &str = r#"
    sensor_id, factory_id, sensor_type, seq_no, status, status_reason, status_since,
    failed_at, at_risk, hold_until, consecutive_warnings, last_seen
"#;

fn map_sensor(row: &Row<'_>) -> rusqlite::Result<Sensor> {
    Ok(Sensor {
        sensor_id: row.get(0)?,
        factory_id: row.get(1)?,
        sensor_type: enum_column(row, 2)?,
        seq_no: row.get(3)?,
        status: enum_column(row, 4)?,
        status_reason: optional_enum_column(row, 5)?,
        status_since: row.get(6)?,
        failed_at: row.get(7)?,
        at_risk: row.get::<_, i64>(8)? != 0,
        hold_until: row.get(9)?,
        recent_readings: VecDeque::new(),
        consecutive_warnings: u32_column(row, 10)?,
        last_seen: row.get(11)?,
    })
}

// ==========================================
// 连接级 SQL
// ==========================================

pub(crate) fn insert_if_absent(conn: &Connection, sensor: &Sensor) -> RepositoryResult<bool> {
    let affected = conn.execute(
        r#"
        INSERT OR IGNORE INTO sensors
            (sensor_id, factory_id, sensor_type, seq_no, status, status_reason, status_since,
             failed_at, at_risk, hold_until, consecutive_warnings, last_seen)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
        params![
            sensor.sensor_id,
            sensor.factory_id,
            sensor.sensor_type.as_str(),
            sensor.seq_no,
            sensor.status.as_str(),
            sensor.status_reason.map(|r| r.as_str()),
            sensor.status_since,
            sensor.failed_at,
            sensor.at_risk as i64,
            sensor.hold_until,
            sensor.consecutive_warnings as i64,
            sensor.last_seen,
        ],
    )?;
    Ok(affected > 0)
}

pub(crate) fn list_by_factory(conn: &Connection, factory_id: &str) -> RepositoryResult<Vec<Sensor>> {
    let sql = format!(
        "SELECT {} FROM sensors WHERE factory_id = ?1 ORDER BY seq_no",
        SENSOR_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let sensors = stmt
        .query_map(params![factory_id], map_sensor)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(sensors)
}

/// 写回状态镜像
pub(crate) fn save_state(conn: &Connection, sensor: &Sensor) -> RepositoryResult<()> {
    let affected = conn.execute(
        r#"
        UPDATE sensors SET
            status = ?2, status_reason = ?3, status_since = ?4, failed_at = ?5,
            at_risk = ?6, hold_until = ?7, consecutive_warnings = ?8, last_seen = ?9
        WHERE sensor_id = ?1
        "#,
        params![
            sensor.sensor_id,
            sensor.status.as_str(),
            sensor.status_reason.map(|r| r.as_str()),
            sensor.status_since,
            sensor.failed_at,
            sensor.at_risk as i64,
            sensor.hold_until,
            sensor.consecutive_warnings as i64,
            sensor.last_seen,
        ],
    )?;
    if affected == 0 {
        return Err(RepositoryError::not_found("Sensor", &sensor.sensor_id));
    }
    Ok(())
}

/// 工厂内序号最小的可用传感器（OK 且未标记风险）
pub(crate) fn first_eligible(
    conn: &Connection,
    factory_id: &str,
    exclude_sensor_id: Option<&str>,
) -> RepositoryResult<Option<String>> {
    let sensor_id = conn
        .query_row(
            r#"
            SELECT sensor_id FROM sensors
            WHERE factory_id = ?1 AND status = 'OK' AND at_risk = 0
              AND (?2 IS NULL OR sensor_id <> ?2)
            ORDER BY seq_no
            LIMIT 1
            "#,
            params![factory_id, exclude_sensor_id],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(sensor_id)
}

pub(crate) fn next_seq_no(conn: &Connection, factory_id: &str) -> RepositoryResult<i64> {
    let max: Option<i64> = conn.query_row(
        "SELECT MAX(seq_no) FROM sensors WHERE factory_id = ?1",
        params![factory_id],
        |row| row.get(0),
    )?;
    Ok(max.unwrap_or(0) + 1)
}

// ==========================================
// SensorRepository - 传感器仓储
// ==========================================
pub struct SensorRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SensorRepository {
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    pub fn insert_if_absent(&self, sensor: &Sensor) -> RepositoryResult<bool> {
        let conn = self.get_conn()?;
        insert_if_absent(&conn, sensor)
    }

    /// 按工厂列出传感器（seq_no 升序）
    pub fn list_by_factory(&self, factory_id: &str) -> RepositoryResult<Vec<Sensor>> {
        let conn = self.get_conn()?;
        list_by_factory(&conn, factory_id)
    }

    pub fn find_by_id(&self, sensor_id: &str) -> RepositoryResult<Option<Sensor>> {
        let conn = self.get_conn()?;
        let sql = format!("SELECT {} FROM sensors WHERE sensor_id = ?1", SENSOR_COLUMNS);
        let sensor = conn
            .query_row(&sql, params![sensor_id], map_sensor)
            .optional()?;
        Ok(sensor)
    }

    /// 批量写回状态镜像（同一事务）
    pub fn save_states(&self, sensors: &[&Sensor]) -> RepositoryResult<()> {
        if sensors.is_empty() {
            return Ok(());
        }
        let mut conn = self.get_conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;
        for sensor in sensors {
            save_state(&tx, sensor)?;
        }
        tx.commit()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;
        Ok(())
    }

    pub fn next_seq_no(&self, factory_id: &str) -> RepositoryResult<i64> {
        let conn = self.get_conn()?;
        next_seq_no(&conn, factory_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{configure_sqlite_connection, init_schema};
    use crate::domain::factory::Factory;
    use crate::domain::types::{SensorStatus, SensorType};
    use crate::repository::factory_repo;
    use chrono::Utc;

    fn setup() -> (Arc<Mutex<Connection>>, SensorRepository) {
        let conn = Connection::open_in_memory().unwrap();
        configure_sqlite_connection(&conn).unwrap();
        init_schema(&conn).unwrap();
        factory_repo::insert_if_absent(&conn, &Factory::provisioned("F1", Utc::now())).unwrap();
        let conn = Arc::new(Mutex::new(conn));
        (conn.clone(), SensorRepository::from_connection(conn))
    }

    #[test]
    fn test_first_eligible_skips_failed_and_at_risk() {
        let (conn, repo) = setup();
        let mut s1 = Sensor::new("S1", "F1", SensorType::Temperature, 1);
        let mut s2 = Sensor::new("S2", "F1", SensorType::Level, 2);
        let s3 = Sensor::new("S3", "F1", SensorType::Quality, 3);
        for s in [&s1, &s2, &s3] {
            repo.insert_if_absent(s).unwrap();
        }
        s1.status = SensorStatus::Failed;
        s2.at_risk = true;
        repo.save_states(&[&s1, &s2]).unwrap();

        let guard = conn.lock().unwrap();
        assert_eq!(first_eligible(&guard, "F1", None).unwrap().as_deref(), Some("S3"));
        assert_eq!(first_eligible(&guard, "F1", Some("S3")).unwrap(), None);
    }

    #[test]
    fn test_state_round_trip() {
        let (_conn, repo) = setup();
        let mut s = Sensor::new("S1", "F1", SensorType::Temperature, 1);
        repo.insert_if_absent(&s).unwrap();
        s.status = SensorStatus::Warning;
        s.consecutive_warnings = 2;
        s.last_seen = Some(Utc::now());
        repo.save_states(&[&s]).unwrap();

        let loaded = repo.find_by_id("S1").unwrap().unwrap();
        assert_eq!(loaded.status, SensorStatus::Warning);
        assert_eq!(loaded.consecutive_warnings, 2);
        assert!(loaded.last_seen.is_some());
        assert_eq!(repo.next_seq_no("F1").unwrap(), 2);
    }
}

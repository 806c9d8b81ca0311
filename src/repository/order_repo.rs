// ==========================================
// 工厂健康监控系统 - 订单/分配数据仓储
// ==========================================
// 红线: Repository 不含业务逻辑
// 约束: 写操作只通过 StoreTx 暴露给引擎; 本仓储对外只读
// ==========================================

use crate::domain::order::{Assignment, Order};
use crate::domain::types::{AssignmentStatus, OrderStatus};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::sql_utils::{enum_column, u32_column};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex};

const ORDER_COLUMNS: &str =
    "order_id, product_type, quantity, priority, deadline, status, created_at, updated_at";

const ASSIGNMENT_COLUMNS: &str = r#"
    assignment_id, order_id, factory_id, sensor_id, assigned_quantity, completed_quantity,
    queue_position, status, blocked, created_at, updated_at
"#;

fn map_order(row: &Row<'_>) -> rusqlite::Result<Order> {
    Ok(Order {
        order_id: row.get(0)?,
        product_type: row.get(1)?,
        quantity: u32_column(row, 2)?,
        priority: row.get(3)?,
        deadline: row.get(4)?,
        status: enum_column(row, 5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn map_assignment(row: &Row<'_>) -> rusqlite::Result<Assignment> {
    Ok(Assignment {
        assignment_id: row.get(0)?,
        order_id: row.get(1)?,
        factory_id: row.get(2)?,
        sensor_id: row.get(3)?,
        assigned_quantity: u32_column(row, 4)?,
        completed_quantity: u32_column(row, 5)?,
        queue_position: u32_column(row, 6)?,
        status: enum_column(row, 7)?,
        blocked: row.get::<_, i64>(8)? != 0,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

// ==========================================
// 连接级 SQL - 订单
// ==========================================

pub(crate) fn insert_order(conn: &Connection, order: &Order) -> RepositoryResult<()> {
    conn.execute(
        r#"
        INSERT INTO orders
            (order_id, product_type, quantity, priority, deadline, status, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        params![
            order.order_id,
            order.product_type,
            order.quantity as i64,
            order.priority,
            order.deadline,
            order.status.as_str(),
            order.created_at,
            order.updated_at,
        ],
    )?;
    Ok(())
}

pub(crate) fn find_order(conn: &Connection, order_id: &str) -> RepositoryResult<Option<Order>> {
    let sql = format!("SELECT {} FROM orders WHERE order_id = ?1", ORDER_COLUMNS);
    let order = conn.query_row(&sql, params![order_id], map_order).optional()?;
    Ok(order)
}

pub(crate) fn update_order_status(
    conn: &Connection,
    order_id: &str,
    status: OrderStatus,
    now: DateTime<Utc>,
) -> RepositoryResult<()> {
    let affected = conn.execute(
        "UPDATE orders SET status = ?2, updated_at = ?3 WHERE order_id = ?1",
        params![order_id, status.as_str(), now],
    )?;
    if affected == 0 {
        return Err(RepositoryError::not_found("Order", order_id));
    }
    Ok(())
}

pub(crate) fn list_orders_by_status(conn: &Connection, status: OrderStatus) -> RepositoryResult<Vec<Order>> {
    let sql = format!(
        "SELECT {} FROM orders WHERE status = ?1 ORDER BY priority DESC, created_at, order_id",
        ORDER_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let orders = stmt
        .query_map(params![status.as_str()], map_order)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(orders)
}

// ==========================================
// 连接级 SQL - 分配
// ==========================================

pub(crate) fn insert_assignment(conn: &Connection, a: &Assignment) -> RepositoryResult<()> {
    conn.execute(
        r#"
        INSERT INTO assignments
            (assignment_id, order_id, factory_id, sensor_id, assigned_quantity, completed_quantity,
             queue_position, status, blocked, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
        params![
            a.assignment_id,
            a.order_id,
            a.factory_id,
            a.sensor_id,
            a.assigned_quantity as i64,
            a.completed_quantity as i64,
            a.queue_position as i64,
            a.status.as_str(),
            a.blocked as i64,
            a.created_at,
            a.updated_at,
        ],
    )?;
    Ok(())
}

/// 整行写回（assignment_id / order_id / created_at 不变）
pub(crate) fn update_assignment(conn: &Connection, a: &Assignment) -> RepositoryResult<()> {
    let affected = conn.execute(
        r#"
        UPDATE assignments SET
            factory_id = ?2, sensor_id = ?3, assigned_quantity = ?4, completed_quantity = ?5,
            queue_position = ?6, status = ?7, blocked = ?8, updated_at = ?9
        WHERE assignment_id = ?1
        "#,
        params![
            a.assignment_id,
            a.factory_id,
            a.sensor_id,
            a.assigned_quantity as i64,
            a.completed_quantity as i64,
            a.queue_position as i64,
            a.status.as_str(),
            a.blocked as i64,
            a.updated_at,
        ],
    )?;
    if affected == 0 {
        return Err(RepositoryError::not_found("Assignment", &a.assignment_id));
    }
    Ok(())
}

pub(crate) fn find_assignment(conn: &Connection, assignment_id: &str) -> RepositoryResult<Option<Assignment>> {
    let sql = format!(
        "SELECT {} FROM assignments WHERE assignment_id = ?1",
        ASSIGNMENT_COLUMNS
    );
    let a = conn
        .query_row(&sql, params![assignment_id], map_assignment)
        .optional()?;
    Ok(a)
}

pub(crate) fn list_assignments_by_order(conn: &Connection, order_id: &str) -> RepositoryResult<Vec<Assignment>> {
    let sql = format!(
        "SELECT {} FROM assignments WHERE order_id = ?1 ORDER BY created_at, assignment_id",
        ASSIGNMENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let list = stmt
        .query_map(params![order_id], map_assignment)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(list)
}

/// 工厂上的活动分配（queue_position 升序）
pub(crate) fn list_active_by_factory(conn: &Connection, factory_id: &str) -> RepositoryResult<Vec<Assignment>> {
    let sql = format!(
        r#"
        SELECT {} FROM assignments
        WHERE factory_id = ?1 AND status IN (?2, ?3)
        ORDER BY queue_position, created_at
        "#,
        ASSIGNMENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let list = stmt
        .query_map(
            params![
                factory_id,
                AssignmentStatus::Assigned.as_str(),
                AssignmentStatus::InProgress.as_str()
            ],
            map_assignment,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(list)
}

pub(crate) fn count_active_by_factory(conn: &Connection, factory_id: &str) -> RepositoryResult<u32> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM assignments WHERE factory_id = ?1 AND status IN (?2, ?3)",
        params![
            factory_id,
            AssignmentStatus::Assigned.as_str(),
            AssignmentStatus::InProgress.as_str()
        ],
        |row| row.get(0),
    )?;
    Ok(n.max(0) as u32)
}

// ==========================================
// OrderRepository - 订单仓储（只读查询）
// ==========================================
pub struct OrderRepository {
    conn: Arc<Mutex<Connection>>,
}

impl OrderRepository {
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    pub fn find_order(&self, order_id: &str) -> RepositoryResult<Option<Order>> {
        let conn = self.get_conn()?;
        find_order(&conn, order_id)
    }

    /// 待分配订单（priority 降序, 创建时间升序）
    pub fn list_pending(&self) -> RepositoryResult<Vec<Order>> {
        let conn = self.get_conn()?;
        list_orders_by_status(&conn, OrderStatus::Pending)
    }

    pub fn find_assignment(&self, assignment_id: &str) -> RepositoryResult<Option<Assignment>> {
        let conn = self.get_conn()?;
        find_assignment(&conn, assignment_id)
    }

    pub fn list_assignments_by_order(&self, order_id: &str) -> RepositoryResult<Vec<Assignment>> {
        let conn = self.get_conn()?;
        list_assignments_by_order(&conn, order_id)
    }

    pub fn list_active_by_factory(&self, factory_id: &str) -> RepositoryResult<Vec<Assignment>> {
        let conn = self.get_conn()?;
        list_active_by_factory(&conn, factory_id)
    }

    /// 各工厂队首活动分配及其产品类型（工作快照用）
    pub fn list_factory_heads(&self) -> RepositoryResult<Vec<(Assignment, String)>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT a.assignment_id, a.order_id, a.factory_id, a.sensor_id, a.assigned_quantity,
                   a.completed_quantity, a.queue_position, a.status, a.blocked, a.created_at,
                   a.updated_at, o.product_type
            FROM assignments a
            JOIN orders o ON o.order_id = a.order_id
            WHERE a.queue_position = 1 AND a.status IN (?1, ?2)
            ORDER BY a.factory_id
            "#,
        )?;
        let list = stmt
            .query_map(
                params![
                    AssignmentStatus::Assigned.as_str(),
                    AssignmentStatus::InProgress.as_str()
                ],
                |row| Ok((map_assignment(row)?, row.get::<_, String>(11)?)),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(list)
    }

    /// 所有工厂的活动分配总量（用于数量守恒校验）
    pub fn total_active_quantity(&self) -> RepositoryResult<u64> {
        let conn = self.get_conn()?;
        let total: Option<i64> = conn.query_row(
            "SELECT SUM(assigned_quantity) FROM assignments WHERE status IN (?1, ?2)",
            params![
                AssignmentStatus::Assigned.as_str(),
                AssignmentStatus::InProgress.as_str()
            ],
            |row| row.get(0),
        )?;
        Ok(total.unwrap_or(0).max(0) as u64)
    }
}

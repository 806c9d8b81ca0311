// ==========================================
// 工厂健康监控系统 - 订单与分配领域模型
// ==========================================
// 不变量: 订单离开 pending 后, 各分配 assigned_quantity 之和 == 订单 quantity
// ==========================================

use crate::domain::types::{AssignmentStatus, OrderStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ==========================================
// Order - 生产订单
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub product_type: String,
    pub quantity: u32,
    pub priority: i32, // 数值越大越优先
    pub deadline: Option<DateTime<Utc>>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 创建订单请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOrder {
    pub product_type: String,
    pub quantity: u32,
    pub deadline: Option<DateTime<Utc>>,
    pub priority: i32,
}

impl NewOrder {
    /// 输入校验, 返回首个问题描述
    pub fn validate(&self) -> Result<(), String> {
        if self.product_type.trim().is_empty() {
            return Err("product_type 不能为空".to_string());
        }
        if self.quantity == 0 {
            return Err("quantity 必须大于 0".to_string());
        }
        Ok(())
    }
}

// ==========================================
// Assignment - 订单分片到工厂的分配
// ==========================================
// queue_position: 1 = 正在生产, >1 = 排队
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub assignment_id: String,
    pub order_id: String,
    pub factory_id: String,
    pub sensor_id: Option<String>, // 当前生产传感器
    pub assigned_quantity: u32,
    pub completed_quantity: u32,
    pub queue_position: u32,
    pub status: AssignmentStatus,
    pub blocked: bool, // 无可用替换传感器时挂起, 不丢弃
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Assignment {
    pub fn remaining_quantity(&self) -> u32 {
        self.assigned_quantity.saturating_sub(self.completed_quantity)
    }

    pub fn is_producing(&self) -> bool {
        self.status.is_active() && self.queue_position == 1
    }
}

/// 订单详情（订单 + 分配）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderDetail {
    pub order: Order,
    pub assignments: Vec<Assignment>,
}

impl OrderDetail {
    /// 未取消分配的数量合计
    pub fn assigned_total(&self) -> u32 {
        self.assignments
            .iter()
            .filter(|a| a.status != AssignmentStatus::Cancelled)
            .map(|a| a.assigned_quantity)
            .sum()
    }
}

/// 由分配集合推导订单状态
///
/// 规则:
/// - 无有效分配 → pending
/// - 全部完成 → completed
/// - 任一分配已开工/有进度 → in_progress
/// - 否则 → assigned
pub fn derive_order_status(assignments: &[Assignment]) -> OrderStatus {
    let live: Vec<&Assignment> = assignments
        .iter()
        .filter(|a| a.status != AssignmentStatus::Cancelled)
        .collect();

    if live.is_empty() {
        return OrderStatus::Pending;
    }
    if live.iter().all(|a| a.status == AssignmentStatus::Completed) {
        return OrderStatus::Completed;
    }
    let started = live.iter().any(|a| {
        a.status == AssignmentStatus::InProgress
            || a.status == AssignmentStatus::Completed
            || a.completed_quantity > 0
    });
    if started {
        OrderStatus::InProgress
    } else {
        OrderStatus::Assigned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(status: AssignmentStatus, assigned: u32, completed: u32) -> Assignment {
        let now = Utc::now();
        Assignment {
            assignment_id: "A".to_string(),
            order_id: "O".to_string(),
            factory_id: "F1".to_string(),
            sensor_id: Some("S1-1".to_string()),
            assigned_quantity: assigned,
            completed_quantity: completed,
            queue_position: 1,
            status,
            blocked: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_derive_order_status() {
        assert_eq!(derive_order_status(&[]), OrderStatus::Pending);
        assert_eq!(
            derive_order_status(&[assignment(AssignmentStatus::Assigned, 10, 0)]),
            OrderStatus::Assigned
        );
        assert_eq!(
            derive_order_status(&[
                assignment(AssignmentStatus::Completed, 10, 10),
                assignment(AssignmentStatus::Assigned, 10, 0),
            ]),
            OrderStatus::InProgress
        );
        assert_eq!(
            derive_order_status(&[
                assignment(AssignmentStatus::Completed, 10, 10),
                assignment(AssignmentStatus::Cancelled, 5, 0),
            ]),
            OrderStatus::Completed
        );
    }

    #[test]
    fn test_new_order_validation() {
        let mut o = NewOrder {
            product_type: "Cola".to_string(),
            quantity: 10,
            deadline: None,
            priority: 0,
        };
        assert!(o.validate().is_ok());
        o.quantity = 0;
        assert!(o.validate().is_err());
        o.quantity = 1;
        o.product_type = "  ".to_string();
        assert!(o.validate().is_err());
    }
}

// ==========================================
// 工厂健康监控系统 - 订单 API
// ==========================================
// 职责: 订单创建/准入/进度/取消/查询
// 说明: 准入结果区分 assigned 与 pending(原因), 内部错误走 ApiError
// ==========================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::error::{require_id, ApiError, ApiResult};
use crate::domain::order::{NewOrder, Order, OrderDetail};
use crate::engine::{AdmissionOutcome, EngineCore, ProgressOutcome};

/// 创建订单响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSubmission {
    pub order: Order,
    pub admission: AdmissionOutcome,
}

// ==========================================
// OrderApi - 订单 API
// ==========================================
pub struct OrderApi {
    core: Arc<EngineCore>,
}

impl OrderApi {
    pub fn new(core: Arc<EngineCore>) -> Self {
        Self { core }
    }

    /// 创建订单并立即尝试准入
    ///
    /// # 参数
    /// - request: 订单请求
    /// - factory_id: 指定工厂（可选）
    pub fn create_order(
        &self,
        request: NewOrder,
        factory_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> ApiResult<OrderSubmission> {
        request.validate().map_err(ApiError::InvalidInput)?;
        let factory_id = factory_id.map(|f| require_id("factory_id", f)).transpose()?;
        let (order, admission) = self.core.submit_order(&request, factory_id, now)?;
        Ok(OrderSubmission { order, admission })
    }

    /// 对已有 pending 订单再次准入
    pub fn assign_order(
        &self,
        order_id: &str,
        factory_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> ApiResult<AdmissionOutcome> {
        let order_id = require_id("order_id", order_id)?;
        let factory_id = factory_id.map(|f| require_id("factory_id", f)).transpose()?;
        Ok(self.core.assign_order(order_id, factory_id, now)?)
    }

    pub fn admit_pending(&self, now: DateTime<Utc>) -> ApiResult<Vec<(String, AdmissionOutcome)>> {
        Ok(self.core.admit_pending(now)?)
    }

    pub fn get_order(&self, order_id: &str) -> ApiResult<OrderDetail> {
        let order_id = require_id("order_id", order_id)?;
        Ok(self.core.get_order(order_id)?)
    }

    pub fn record_progress(&self, assignment_id: &str, units: u32, now: DateTime<Utc>) -> ApiResult<ProgressOutcome> {
        let assignment_id = require_id("assignment_id", assignment_id)?;
        if units == 0 {
            return Err(ApiError::InvalidInput("units 必须大于 0".to_string()));
        }
        Ok(self.core.record_progress(assignment_id, units, now)?)
    }

    pub fn cancel_order(&self, order_id: &str, now: DateTime<Utc>) -> ApiResult<Order> {
        let order_id = require_id("order_id", order_id)?;
        Ok(self.core.cancel_order(order_id, now)?)
    }
}

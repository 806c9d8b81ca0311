// ==========================================
// 工厂健康监控系统 - 工厂 API
// ==========================================
// 职责: 工厂开通、状态/传感器/事件历史查询
// 说明: 传感器状态写入只经各工厂 worker, 本 API 只读镜像
// ==========================================

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::api::error::{require_id, ApiError, ApiResult};
use crate::domain::factory::FactoryStatusView;
use crate::domain::health_event::{FailoverEvent, HealthEvent};
use crate::domain::sensor::{FactoryProvision, Sensor, SensorSummary};
use crate::engine::EngineCore;

/// 事件历史默认条数
pub const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 1000;

// ==========================================
// FactoryApi - 工厂 API
// ==========================================
pub struct FactoryApi {
    core: Arc<EngineCore>,
}

impl FactoryApi {
    pub fn new(core: Arc<EngineCore>) -> Self {
        Self { core }
    }

    /// 开通工厂（幂等）
    pub fn provision_factory(&self, request: &FactoryProvision, now: DateTime<Utc>) -> ApiResult<Vec<Sensor>> {
        require_id("factory_id", &request.factory_id)?;
        let mut seen = std::collections::HashSet::new();
        for spec in &request.sensors {
            if !seen.insert(spec.sensor_id.trim()) {
                return Err(ApiError::InvalidInput(format!("传感器ID重复: {}", spec.sensor_id)));
            }
        }
        Ok(self.core.provision_factory(request, now)?)
    }

    pub fn get_factory_status(&self, factory_id: &str) -> ApiResult<FactoryStatusView> {
        let factory_id = require_id("factory_id", factory_id)?;
        Ok(self.core.get_factory_status(factory_id)?)
    }

    pub fn list_factory_status(&self) -> ApiResult<Vec<FactoryStatusView>> {
        Ok(self.core.list_factory_status()?)
    }

    pub fn get_factory_sensors(&self, factory_id: &str) -> ApiResult<SensorSummary> {
        let factory_id = require_id("factory_id", factory_id)?;
        Ok(self.core.get_factory_sensors(factory_id)?)
    }

    /// 健康事件历史（新→旧）
    pub fn health_events(&self, factory_id: &str, limit: Option<usize>) -> ApiResult<Vec<HealthEvent>> {
        let factory_id = require_id("factory_id", factory_id)?;
        Ok(self.core.health_events(factory_id, clamp_limit(limit))?)
    }

    /// 迁移/替换事件历史（新→旧）
    pub fn failover_events(&self, factory_id: &str, limit: Option<usize>) -> ApiResult<Vec<FailoverEvent>> {
        let factory_id = require_id("factory_id", factory_id)?;
        Ok(self.core.failover_events(factory_id, clamp_limit(limit))?)
    }
}

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT)
}

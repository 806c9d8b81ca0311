// ==========================================
// 工厂健康监控系统 - 当前工作快照
// ==========================================
// 职责: 发布每个工厂正在生产的分配 (队首)
// 通道: tokio::sync::watch, 订阅方只看到最新值
// 可选: snapshot_path 配置时同时写 JSON 文件 (临时文件 + rename)
// ==========================================

use crate::engine::error::EngineResult;
use crate::repository::OrderRepository;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// 单个工厂的当前生产分片
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkSlice {
    pub order_id: String,
    pub assignment_id: String,
    pub product_type: String,
    pub sensor_id: Option<String>,
    pub assigned_quantity: u32,
    pub completed_quantity: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkSnapshot {
    /// factory_id → 队首分片
    pub factories: BTreeMap<String, WorkSlice>,
    pub generated_at: Option<DateTime<Utc>>,
}

pub struct WorkSnapshotPublisher {
    order_repo: Arc<OrderRepository>,
    sender: watch::Sender<WorkSnapshot>,
    path: Option<PathBuf>,
}

impl WorkSnapshotPublisher {
    pub fn new(order_repo: Arc<OrderRepository>, path: Option<PathBuf>) -> Self {
        let (sender, _rx) = watch::channel(WorkSnapshot::default());
        Self {
            order_repo,
            sender,
            path,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkSnapshot> {
        self.sender.subscribe()
    }

    pub fn current(&self) -> WorkSnapshot {
        self.sender.borrow().clone()
    }

    /// 从存储重建快照并发布
    pub fn refresh(&self, now: DateTime<Utc>) -> EngineResult<WorkSnapshot> {
        let factories = self
            .order_repo
            .list_factory_heads()?
            .into_iter()
            .map(|(a, product_type)| {
                (
                    a.factory_id.clone(),
                    WorkSlice {
                        order_id: a.order_id,
                        assignment_id: a.assignment_id,
                        product_type,
                        sensor_id: a.sensor_id,
                        assigned_quantity: a.assigned_quantity,
                        completed_quantity: a.completed_quantity,
                    },
                )
            })
            .collect::<BTreeMap<_, _>>();

        let changed = self.sender.borrow().factories != factories;
        let snapshot = WorkSnapshot {
            factories,
            generated_at: Some(now),
        };
        if !changed {
            return Ok(snapshot);
        }

        self.sender.send_replace(snapshot.clone());
        debug!(factories = snapshot.factories.len(), "工作快照已更新");

        if let Some(path) = &self.path {
            // 文件只是旁路产物, 写失败不影响引擎
            if let Err(e) = write_atomic(path, &snapshot) {
                warn!(path = %path.display(), error = %e, "工作快照文件写入失败");
            }
        }
        Ok(snapshot)
    }
}

fn write_atomic(path: &Path, snapshot: &WorkSnapshot) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(&snapshot.factories)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

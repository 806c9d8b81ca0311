// ==========================================
// 工厂健康监控系统 - 主入口
// ==========================================
// 流程: 日志 → 数据库 → 配置 → 引擎 → 开通 → 运行时 → 事件接入
// 事件接入: 标准输入 JSON 行, 每行一条传感器消息
// ==========================================

use anyhow::{Context, Result};
use chrono::Utc;
use factory_mms::api::FactoryApi;
use factory_mms::config::ConfigManager;
use factory_mms::domain::{FactoryProvision, SensorEvent};
use factory_mms::engine::{EngineCore, OptionalStatusReporter};
use factory_mms::runtime::EngineRuntime;
use factory_mms::{db, logging};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tracing::{debug, info, warn};

/// 数据库路径环境变量
const DB_PATH_ENV: &str = "FACTORY_MMS_DB_PATH";

/// 开通清单环境变量（JSON: FactoryProvision 数组）
const PROVISION_ENV: &str = "FACTORY_MMS_PROVISION";

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    info!("==================================================");
    info!("{} - 系统版本: {}", factory_mms::APP_NAME, factory_mms::VERSION);
    info!("==================================================");

    let db_path = default_db_path();
    info!(db_path = %db_path, "使用数据库");
    let conn = db::open_shared_connection(&db_path)?;

    let config = ConfigManager::from_connection(conn.clone())
        .and_then(|m| m.load_engine_config())
        .map_err(|e| anyhow::anyhow!(e))
        .context("加载引擎配置失败")?;
    debug!(?config, "引擎配置");

    let core = Arc::new(EngineCore::new(conn, config));
    provision_from_env(&core)?;

    let handle = EngineRuntime::start(core, OptionalStatusReporter::none())?;
    info!(factories = ?handle.factories().await, "开始接收传感器事件");

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(text)) => {
                    let text = text.trim();
                    if text.is_empty() {
                        continue;
                    }
                    match SensorEvent::parse_json(text) {
                        Ok(event) => {
                            handle.submit_event(event).await;
                        }
                        Err(e) => warn!(error = %e, "入站消息格式错误，已丢弃"),
                    }
                }
                Ok(None) => {
                    info!("事件输入结束");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "读取事件输入失败");
                    break;
                }
            },
            _ = &mut shutdown => {
                info!("收到中断信号");
                break;
            }
        }
    }

    handle.shutdown().await?;
    Ok(())
}

/// 默认数据库路径
///
/// 优先使用环境变量, 否则为 用户本地数据目录/factory-mms/mms.db
fn default_db_path() -> String {
    if let Ok(path) = std::env::var(DB_PATH_ENV) {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let mut path = PathBuf::from("./mms.db");
    if let Some(data_dir) = dirs::data_local_dir() {
        let dir = data_dir.join("factory-mms");
        // 目录创建失败时回退到当前目录
        if std::fs::create_dir_all(&dir).is_ok() {
            path = dir.join("mms.db");
        }
    }
    path.to_string_lossy().to_string()
}

/// 按开通清单开通工厂（幂等）
fn provision_from_env(core: &Arc<EngineCore>) -> Result<()> {
    let Ok(path) = std::env::var(PROVISION_ENV) else {
        return Ok(());
    };
    let raw = std::fs::read_to_string(path.trim())
        .with_context(|| format!("读取开通清单失败: {}", path))?;
    let requests: Vec<FactoryProvision> =
        serde_json::from_str(&raw).with_context(|| format!("开通清单格式错误: {}", path))?;

    let api = FactoryApi::new(core.clone());
    let now = Utc::now();
    for request in &requests {
        let sensors = api.provision_factory(request, now)?;
        info!(factory_id = %request.factory_id, sensors = sensors.len(), "工厂开通完成");
    }
    Ok(())
}

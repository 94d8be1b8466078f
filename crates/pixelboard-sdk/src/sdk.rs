//! Pixelboard SDK 入口
//!
//! 组装本地存储、远端网关、同步引擎与调度器，对外提供工作区级别的操作。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::PixelboardConfig;
use crate::error::{PixelboardError, Result};
use crate::events::{EventBus, SyncEvent};
use crate::storage::entities::{new_entity_id, EntityKind, EntityRecord, Settings, Workspace};
use crate::storage::{LocalChange, StorageManager};
use crate::sync::{
    FlushOutcome, HttpRemoteGateway, ReconcileReport, RemoteGateway, SyncEngine, SyncScheduler,
};
use crate::version::version_string;
use crate::workspace::WorkspaceSession;

pub struct PixelboardSDK {
    config: PixelboardConfig,
    storage: Arc<StorageManager>,
    engine: Arc<SyncEngine>,
    scheduler: Arc<SyncScheduler>,
    sessions: Mutex<HashMap<String, Arc<WorkspaceSession>>>,
}

impl PixelboardSDK {
    /// 使用 HTTP 网关初始化
    pub async fn initialize(config: PixelboardConfig) -> Result<Self> {
        let gateway = HttpRemoteGateway::from_config(&config)?;
        Self::with_gateway(config, Arc::new(gateway)).await
    }

    /// 使用自定义网关初始化（如 `InMemoryGateway`）
    pub async fn with_gateway(config: PixelboardConfig, gateway: Arc<dyn RemoteGateway>) -> Result<Self> {
        config.validate()?;
        info!("Pixelboard SDK 初始化: {}", version_string());

        let storage = if config.memory_only {
            StorageManager::open_in_memory().await?
        } else {
            StorageManager::open(&config.data_dir).await?
        };
        let storage = Arc::new(storage);

        let engine = Arc::new(SyncEngine::new(
            storage.clone(),
            gateway,
            EventBus::default(),
            config.sync.prune_on_pull,
        ));
        let scheduler = SyncScheduler::new(engine.clone(), config.sync.clone());

        // 上次退出时未推送的修改
        let pending = storage.operation_log().count().await?;
        if pending > 0 {
            info!("发现 {} 条未推送的本地修改", pending);
            scheduler.schedule_flush();
        }

        Ok(Self {
            config,
            storage,
            engine,
            scheduler,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &PixelboardConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn scheduler(&self) -> &Arc<SyncScheduler> {
        &self.scheduler
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.engine.events().subscribe()
    }

    /// 本地新建工作区（离线可用）
    pub async fn create_workspace(&self, name: &str, settings: Settings) -> Result<Workspace> {
        if name.trim().is_empty() {
            return Err(PixelboardError::InvalidArgument("工作区名称不能为空".to_string()));
        }
        let workspace = Workspace {
            id: new_entity_id(),
            name: name.to_string(),
            settings,
            updated_at: 0,
        };
        self.storage
            .record_change(LocalChange::create(EntityRecord::Workspace(workspace.clone())))
            .await?;
        self.scheduler.schedule_flush();
        info!("新建工作区 {} ({})", workspace.name, workspace.id);
        self.storage
            .entity_store()
            .get_workspace(&workspace.id)
            .await?
            .ok_or_else(|| PixelboardError::NotFound(format!("工作区 {}", workspace.id)))
    }

    pub async fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        self.storage.entity_store().list_workspaces().await
    }

    /// 删除工作区及其下所有实体
    pub async fn delete_workspace(&self, workspace_id: &str) -> Result<()> {
        let session = self.sessions.lock().remove(workspace_id);
        if let Some(session) = session {
            session.close().await;
        }

        let store = self.storage.entity_store();
        let mut changes = Vec::new();
        for kind in EntityKind::WORKSPACE_SCOPED {
            for record in store.list(kind, workspace_id).await? {
                changes.push(LocalChange::delete(kind, record.id()));
            }
        }
        changes.push(LocalChange::delete(EntityKind::Workspace, workspace_id));
        self.storage.record_changes(changes).await?;

        if let Err(e) = self.engine.state_store().forget_workspace(workspace_id).await {
            warn!("清理工作区同步记录失败 {}: {}", workspace_id, e);
        }
        self.scheduler.schedule_flush();
        info!("已删除工作区 {}", workspace_id);
        Ok(())
    }

    /// 打开工作区：本地数据立即可用，随后开始定时拉取
    pub async fn open_workspace(&self, workspace_id: &str) -> Result<Arc<WorkspaceSession>> {
        let existing = self.sessions.lock().get(workspace_id).cloned();
        if let Some(session) = existing {
            return Ok(session);
        }
        let session =
            WorkspaceSession::load(self.storage.clone(), self.scheduler.clone(), workspace_id).await?;
        self.sessions
            .lock()
            .insert(workspace_id.to_string(), session.clone());
        Ok(session)
    }

    pub async fn close_workspace(&self, workspace_id: &str) {
        let session = self.sessions.lock().remove(workspace_id);
        if let Some(session) = session {
            session.close().await;
        }
    }

    /// 跳过防抖立即推送（如网络恢复时）
    pub async fn flush_now(&self) -> Result<FlushOutcome> {
        self.scheduler.flush_now().await
    }

    /// 立即拉取一次
    pub async fn reconcile(&self, workspace_id: &str) -> Result<ReconcileReport> {
        self.engine.reconcile(workspace_id).await
    }

    pub async fn pending_count(&self) -> Result<u64> {
        self.storage.operation_log().count().await
    }

    /// 关闭所有工作区并做最后一次推送
    pub async fn shutdown(&self) -> Result<FlushOutcome> {
        let sessions: Vec<Arc<WorkspaceSession>> =
            self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await;
        }
        let outcome = self.scheduler.shutdown().await?;
        if let Err(e) = self.storage.kv_store().flush().await {
            warn!("KV 落盘失败: {}", e);
        }
        info!("Pixelboard SDK 已关闭");
        Ok(outcome)
    }
}

//! 实体存储 - UI 的唯一数据源
//!
//! 只负责持久化，不含任何同步逻辑；跨类型的写入顺序由待同步日志保证。

use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::storage::dao::{
    BackgroundImageDao, CanvasBoardDao, LayerOrderDao, ReferenceLayerDao, TransactionManager,
    WorkspaceDao,
};
use crate::storage::entities::{
    BackgroundImage, CanvasBoard, EntityKind, EntityRecord, LayerOrderEntry, ReferenceLayer,
    Workspace,
};

#[derive(Debug, Clone)]
pub struct EntityStore {
    conn: Arc<Mutex<Connection>>,
}

impl EntityStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    pub async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<EntityRecord>> {
        let conn = self.conn.lock().await;
        get_record(&conn, kind, id)
    }

    pub async fn put(&self, record: &EntityRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        put_record(&conn, record)
    }

    /// 同一事务内批量写入
    pub async fn put_many(&self, records: &[EntityRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().await;
        TransactionManager::new(&conn).execute(|c| {
            for record in records {
                put_record(c, record)?;
            }
            Ok(())
        })
    }

    pub async fn delete(&self, kind: EntityKind, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        delete_record(&conn, kind, id)
    }

    /// 某工作区下指定类型的全部记录；`Workspace` 类型返回该工作区本身
    pub async fn list(&self, kind: EntityKind, workspace_id: &str) -> Result<Vec<EntityRecord>> {
        let conn = self.conn.lock().await;
        list_records(&conn, kind, workspace_id)
    }

    pub async fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        let conn = self.conn.lock().await;
        WorkspaceDao::new(&conn).list()
    }

    pub async fn get_workspace(&self, id: &str) -> Result<Option<Workspace>> {
        let conn = self.conn.lock().await;
        WorkspaceDao::new(&conn).get(id)
    }

    pub async fn list_boards(&self, workspace_id: &str) -> Result<Vec<CanvasBoard>> {
        let conn = self.conn.lock().await;
        CanvasBoardDao::new(&conn).list_by_workspace(workspace_id)
    }

    pub async fn list_references(&self, workspace_id: &str) -> Result<Vec<ReferenceLayer>> {
        let conn = self.conn.lock().await;
        ReferenceLayerDao::new(&conn).list_by_workspace(workspace_id)
    }

    pub async fn list_background_images(&self, workspace_id: &str) -> Result<Vec<BackgroundImage>> {
        let conn = self.conn.lock().await;
        BackgroundImageDao::new(&conn).list_by_workspace(workspace_id)
    }

    pub async fn list_layer_order(&self, workspace_id: &str) -> Result<Vec<LayerOrderEntry>> {
        let conn = self.conn.lock().await;
        LayerOrderDao::new(&conn).list_by_workspace(workspace_id)
    }
}

pub(crate) fn get_record(conn: &Connection, kind: EntityKind, id: &str) -> Result<Option<EntityRecord>> {
    let record = match kind {
        EntityKind::Workspace => WorkspaceDao::new(conn).get(id)?.map(EntityRecord::Workspace),
        EntityKind::CanvasBoard => CanvasBoardDao::new(conn).get(id)?.map(EntityRecord::CanvasBoard),
        EntityKind::ReferenceLayer => {
            ReferenceLayerDao::new(conn).get(id)?.map(EntityRecord::ReferenceLayer)
        }
        EntityKind::BackgroundImage => {
            BackgroundImageDao::new(conn).get(id)?.map(EntityRecord::BackgroundImage)
        }
        EntityKind::LayerOrder => LayerOrderDao::new(conn).get(id)?.map(EntityRecord::LayerOrder),
    };
    Ok(record)
}

pub(crate) fn put_record(conn: &Connection, record: &EntityRecord) -> Result<()> {
    match record {
        EntityRecord::Workspace(r) => WorkspaceDao::new(conn).upsert(r),
        EntityRecord::CanvasBoard(r) => CanvasBoardDao::new(conn).upsert(r),
        EntityRecord::ReferenceLayer(r) => ReferenceLayerDao::new(conn).upsert(r),
        EntityRecord::BackgroundImage(r) => BackgroundImageDao::new(conn).upsert(r),
        EntityRecord::LayerOrder(r) => LayerOrderDao::new(conn).upsert(r),
    }
}

pub(crate) fn delete_record(conn: &Connection, kind: EntityKind, id: &str) -> Result<()> {
    match kind {
        EntityKind::Workspace => WorkspaceDao::new(conn).delete(id),
        EntityKind::CanvasBoard => CanvasBoardDao::new(conn).delete(id),
        EntityKind::ReferenceLayer => ReferenceLayerDao::new(conn).delete(id),
        EntityKind::BackgroundImage => BackgroundImageDao::new(conn).delete(id),
        EntityKind::LayerOrder => LayerOrderDao::new(conn).delete(id),
    }
}

pub(crate) fn list_records(
    conn: &Connection,
    kind: EntityKind,
    workspace_id: &str,
) -> Result<Vec<EntityRecord>> {
    let records = match kind {
        EntityKind::Workspace => WorkspaceDao::new(conn)
            .get(workspace_id)?
            .map(EntityRecord::Workspace)
            .into_iter()
            .collect(),
        EntityKind::CanvasBoard => CanvasBoardDao::new(conn)
            .list_by_workspace(workspace_id)?
            .into_iter()
            .map(EntityRecord::CanvasBoard)
            .collect(),
        EntityKind::ReferenceLayer => ReferenceLayerDao::new(conn)
            .list_by_workspace(workspace_id)?
            .into_iter()
            .map(EntityRecord::ReferenceLayer)
            .collect(),
        EntityKind::BackgroundImage => BackgroundImageDao::new(conn)
            .list_by_workspace(workspace_id)?
            .into_iter()
            .map(EntityRecord::BackgroundImage)
            .collect(),
        EntityKind::LayerOrder => LayerOrderDao::new(conn)
            .list_by_workspace(workspace_id)?
            .into_iter()
            .map(EntityRecord::LayerOrder)
            .collect(),
    };
    Ok(records)
}

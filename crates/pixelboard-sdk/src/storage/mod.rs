//! 本地存储层
//!
//! - `EntityStore`：SQLite 中的实体表（UI 的唯一数据源）
//! - `OperationLog`：同库的待同步日志
//! - `KvStore`：sled，存放同步簿记
//!
//! 本地写入与日志追加在同一个事务里完成，要么都落盘要么都不落盘。

pub mod entities;
pub mod migrate;
pub mod kv;
pub mod dao;
pub mod entity_store;
pub mod queue;

pub use entity_store::EntityStore;
pub use kv::KvStore;
pub use queue::{DrainSnapshot, OperationLog};

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{PixelboardError, Result};
use crate::storage::dao::{PendingOperationDao, TransactionManager};
use crate::storage::entities::{EntityKind, EntityRecord, PendingOperation, SyncAction};
use crate::utils::{now_millis, MonotonicClock};

/// 本地库文件名
pub const DB_FILE_NAME: &str = "pixelboard.db";

/// 一次本地变更
#[derive(Debug, Clone)]
pub enum LocalChange {
    /// 写入记录并追加 create / update
    Upsert { record: EntityRecord, action: SyncAction },
    /// 删除记录并追加 delete
    Delete { kind: EntityKind, id: String },
}

impl LocalChange {
    pub fn create(record: EntityRecord) -> Self {
        LocalChange::Upsert { record, action: SyncAction::Create }
    }

    pub fn update(record: EntityRecord) -> Self {
        LocalChange::Upsert { record, action: SyncAction::Update }
    }

    pub fn delete(kind: EntityKind, id: impl Into<String>) -> Self {
        LocalChange::Delete { kind, id: id.into() }
    }
}

/// 一次远端快照的应用结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub applied: usize,
    pub skipped_dirty: usize,
    pub pruned: usize,
}

#[derive(Debug)]
pub struct StorageManager {
    data_dir: Option<PathBuf>,
    conn: Arc<Mutex<Connection>>,
    kv: Arc<KvStore>,
    clock: Arc<MonotonicClock>,
    entity_store: EntityStore,
    operation_log: OperationLog,
}

impl StorageManager {
    /// 打开（或创建）`{data_dir}/pixelboard.db` 与 `{data_dir}/kv`
    pub async fn open(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|e| PixelboardError::IO(format!("创建数据目录失败: {}", e)))?;

        let db_path = data_dir.join(DB_FILE_NAME);
        let mut conn = Connection::open(&db_path)
            .map_err(|e| PixelboardError::Database(format!("打开数据库失败: {}", e)))?;
        migrate::init_db(&mut conn)?;

        let kv = KvStore::new(data_dir).await?;
        info!("本地存储已打开: {}", db_path.display());
        Self::from_parts(conn, kv, Some(data_dir.to_path_buf()))
    }

    /// 纯内存模式（离线演示、测试）
    pub async fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()
            .map_err(|e| PixelboardError::Database(format!("打开内存数据库失败: {}", e)))?;
        migrate::init_db(&mut conn)?;
        let kv = KvStore::temporary()?;
        Self::from_parts(conn, kv, None)
    }

    fn from_parts(conn: Connection, kv: KvStore, data_dir: Option<PathBuf>) -> Result<Self> {
        // 重启后时钟从已落库日志的最大时间戳继续
        let clock = Arc::new(MonotonicClock::new());
        if let Some(ts) = PendingOperationDao::new(&conn).max_timestamp()? {
            clock.observe(ts);
        }

        let conn = Arc::new(Mutex::new(conn));
        Ok(Self {
            data_dir,
            entity_store: EntityStore::new(conn.clone()),
            operation_log: OperationLog::new(conn.clone(), clock.clone()),
            conn,
            kv: Arc::new(kv),
            clock,
        })
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    pub fn entity_store(&self) -> &EntityStore {
        &self.entity_store
    }

    pub fn operation_log(&self) -> &OperationLog {
        &self.operation_log
    }

    pub fn kv_store(&self) -> Arc<KvStore> {
        self.kv.clone()
    }

    /// 写穿：实体写入 + 日志追加，在同一事务中完成
    pub async fn record_change(&self, change: LocalChange) -> Result<PendingOperation> {
        let mut ops = self.record_changes(vec![change]).await?;
        ops.pop()
            .ok_or_else(|| PixelboardError::Database("写入后未生成待同步记录".to_string()))
    }

    /// 批量写穿（如交换两个图层的排序），全部成功或全部回滚
    pub async fn record_changes(&self, changes: Vec<LocalChange>) -> Result<Vec<PendingOperation>> {
        let conn = self.conn.lock().await;
        TransactionManager::new(&conn).execute(|c| {
            let mut ops = Vec::with_capacity(changes.len());
            for change in changes {
                let op = match change {
                    LocalChange::Upsert { mut record, action } => {
                        touch(&mut record);
                        entity_store::put_record(c, &record)?;
                        let snapshot = record.to_json()?;
                        queue::operation_log::append(
                            c,
                            &self.clock,
                            record.kind(),
                            record.id(),
                            action,
                            Some(snapshot),
                            self.clock.next(),
                        )?
                    }
                    LocalChange::Delete { kind, id } => {
                        entity_store::delete_record(c, kind, &id)?;
                        queue::operation_log::append(
                            c,
                            &self.clock,
                            kind,
                            &id,
                            SyncAction::Delete,
                            None,
                            self.clock.next(),
                        )?
                    }
                };
                ops.push(op);
            }
            Ok(ops)
        })
    }

    /// 应用远端快照：脏实体整条跳过，其余按 id 覆盖
    ///
    /// 脏集合的读取与写入在同一把锁、同一事务内，期间不会插入新的本地修改。
    /// `dirty_at_fetch` 是拉取远端之前的脏集合，与应用时的脏集合取并集：
    /// 两者之间推送完成的实体，本地版本比这份快照新。
    /// `prune_missing` 为真时，删除远端已不存在且不脏的本地记录（工作区本身除外）。
    pub async fn apply_remote(
        &self,
        kind: EntityKind,
        workspace_id: &str,
        records: Vec<EntityRecord>,
        dirty_at_fetch: &HashSet<String>,
        prune_missing: bool,
    ) -> Result<ApplyOutcome> {
        let conn = self.conn.lock().await;
        TransactionManager::new(&conn).execute(|c| {
            let mut dirty: HashSet<String> = PendingOperationDao::new(c)
                .distinct_entity_ids(Some(kind))?
                .into_iter()
                .collect();
            dirty.extend(dirty_at_fetch.iter().cloned());
            let mut outcome = ApplyOutcome::default();
            let mut remote_ids = HashSet::with_capacity(records.len());

            for record in &records {
                if record.kind() != kind {
                    continue;
                }
                remote_ids.insert(record.id().to_string());
                if dirty.contains(record.id()) {
                    debug!("跳过脏实体 {}:{}", kind, record.id());
                    outcome.skipped_dirty += 1;
                    continue;
                }
                entity_store::put_record(c, record)?;
                outcome.applied += 1;
            }

            if prune_missing && kind != EntityKind::Workspace {
                for local in entity_store::list_records(c, kind, workspace_id)? {
                    let id = local.id();
                    if !remote_ids.contains(id) && !dirty.contains(id) {
                        entity_store::delete_record(c, kind, id)?;
                        outcome.pruned += 1;
                    }
                }
            }
            Ok(outcome)
        })
    }
}

fn touch(record: &mut EntityRecord) {
    let now = now_millis();
    match record {
        EntityRecord::Workspace(r) => r.updated_at = now,
        EntityRecord::CanvasBoard(r) => r.updated_at = now,
        EntityRecord::ReferenceLayer(r) => r.updated_at = now,
        EntityRecord::BackgroundImage(r) => r.updated_at = now,
        EntityRecord::LayerOrder(r) => r.updated_at = now,
    }
}

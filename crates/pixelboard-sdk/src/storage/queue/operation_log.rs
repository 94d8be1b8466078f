//! 待同步日志 - 与实体存储同库的持久化追加队列
//!
//! 约束：
//! - 调用方只能追加；只有同步引擎在远端确认成功后才会删除
//! - 同一实体可以同时有多条记录（create + 多次 update），由折叠算法处理
//! - `drain` 返回不可变快照，删除时只删快照高水位以内的记录，
//!   快照之后新追加的同 id 记录会保留到下一轮

use std::collections::HashSet;
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::storage::dao::PendingOperationDao;
use crate::storage::entities::{new_entity_id, EntityKind, PendingOperation, SyncAction};
use crate::utils::MonotonicClock;

/// 一次 drain 的快照
#[derive(Debug, Clone, Default)]
pub struct DrainSnapshot {
    /// 按 timestamp 升序
    pub operations: Vec<PendingOperation>,
    /// 快照内最大 seq
    pub high_water_seq: i64,
}

impl DrainSnapshot {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }
}

#[derive(Debug, Clone)]
pub struct OperationLog {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<MonotonicClock>,
}

impl OperationLog {
    pub fn new(conn: Arc<Mutex<Connection>>, clock: Arc<MonotonicClock>) -> Self {
        Self { conn, clock }
    }

    /// 以单调时钟取时间戳并追加
    pub async fn enqueue(
        &self,
        kind: EntityKind,
        entity_id: &str,
        action: SyncAction,
        payload: Option<serde_json::Value>,
    ) -> Result<PendingOperation> {
        let timestamp = self.clock.next();
        self.enqueue_at(kind, entity_id, action, payload, timestamp).await
    }

    /// 指定时间戳追加
    pub async fn enqueue_at(
        &self,
        kind: EntityKind,
        entity_id: &str,
        action: SyncAction,
        payload: Option<serde_json::Value>,
        timestamp: i64,
    ) -> Result<PendingOperation> {
        let conn = self.conn.lock().await;
        append(&conn, &self.clock, kind, entity_id, action, payload, timestamp)
    }

    pub async fn drain(&self) -> Result<DrainSnapshot> {
        let conn = self.conn.lock().await;
        let operations = PendingOperationDao::new(&conn).list_ordered()?;
        let high_water_seq = operations.iter().map(|op| op.seq).max().unwrap_or(0);
        Ok(DrainSnapshot { operations, high_water_seq })
    }

    /// 删除这些实体在 `up_to_seq` 以内的记录
    pub async fn remove_by_entity_ids(&self, entity_ids: &[String], up_to_seq: i64) -> Result<usize> {
        if entity_ids.is_empty() {
            return Ok(0);
        }
        let conn = self.conn.lock().await;
        let removed = PendingOperationDao::new(&conn).delete_by_entity_ids(entity_ids, up_to_seq)?;
        debug!("待同步日志已移除 {} 条（{} 个实体）", removed, entity_ids.len());
        Ok(removed)
    }

    pub async fn count(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        PendingOperationDao::new(&conn).count()
    }

    /// 脏实体 id 集合
    pub async fn dirty_ids(&self, kind: Option<EntityKind>) -> Result<HashSet<String>> {
        let conn = self.conn.lock().await;
        let ids = PendingOperationDao::new(&conn).distinct_entity_ids(kind)?;
        Ok(ids.into_iter().collect())
    }
}

/// 在调用方持有的连接（或事务）上追加一条记录
pub(crate) fn append(
    conn: &Connection,
    clock: &MonotonicClock,
    kind: EntityKind,
    entity_id: &str,
    action: SyncAction,
    payload: Option<serde_json::Value>,
    timestamp: i64,
) -> Result<PendingOperation> {
    clock.observe(timestamp);
    let mut op = PendingOperation {
        seq: 0,
        id: new_entity_id(),
        entity_kind: kind,
        entity_id: entity_id.to_string(),
        action,
        payload,
        timestamp,
    };
    op.seq = PendingOperationDao::new(conn).insert(&op)?;
    Ok(op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::dao::test_connection;

    fn log() -> OperationLog {
        OperationLog::new(
            Arc::new(Mutex::new(test_connection())),
            Arc::new(MonotonicClock::new()),
        )
    }

    #[tokio::test]
    async fn drain_is_sorted_by_timestamp() {
        let log = log();
        log.enqueue_at(EntityKind::CanvasBoard, "b1", SyncAction::Update, None, 30).await.unwrap();
        log.enqueue_at(EntityKind::CanvasBoard, "b1", SyncAction::Create, None, 10).await.unwrap();
        log.enqueue_at(EntityKind::LayerOrder, "lo1", SyncAction::Create, None, 20).await.unwrap();

        let snapshot = log.drain().await.unwrap();
        let timestamps: Vec<_> = snapshot.operations.iter().map(|o| o.timestamp).collect();
        assert_eq!(timestamps, vec![10, 20, 30]);
        assert_eq!(snapshot.len(), 3);
        assert_eq!(log.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn remove_keeps_records_appended_after_drain() {
        let log = log();
        log.enqueue(EntityKind::CanvasBoard, "b1", SyncAction::Create, None).await.unwrap();
        log.enqueue(EntityKind::CanvasBoard, "b2", SyncAction::Create, None).await.unwrap();
        let snapshot = log.drain().await.unwrap();

        // drain 之后同一实体又被修改
        log.enqueue(EntityKind::CanvasBoard, "b1", SyncAction::Update, None).await.unwrap();

        let removed = log
            .remove_by_entity_ids(&["b1".to_string(), "b2".to_string()], snapshot.high_water_seq)
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let rest = log.drain().await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest.operations[0].entity_id, "b1");
        assert_eq!(rest.operations[0].action, SyncAction::Update);
    }

    #[tokio::test]
    async fn dirty_ids_filter_by_kind() {
        let log = log();
        log.enqueue(EntityKind::CanvasBoard, "b1", SyncAction::Create, None).await.unwrap();
        log.enqueue(EntityKind::CanvasBoard, "b1", SyncAction::Update, None).await.unwrap();
        log.enqueue(EntityKind::ReferenceLayer, "r1", SyncAction::Delete, None).await.unwrap();

        let boards = log.dirty_ids(Some(EntityKind::CanvasBoard)).await.unwrap();
        assert_eq!(boards.len(), 1);
        assert!(boards.contains("b1"));
        assert_eq!(log.dirty_ids(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn enqueue_timestamps_strictly_increase() {
        let log = log();
        let a = log.enqueue(EntityKind::CanvasBoard, "b1", SyncAction::Create, None).await.unwrap();
        let b = log.enqueue(EntityKind::CanvasBoard, "b1", SyncAction::Update, None).await.unwrap();
        assert!(b.timestamp > a.timestamp);
        assert!(b.seq > a.seq);
    }
}

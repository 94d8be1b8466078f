//! 同步事件 - 推送/拉取完成后通过 broadcast 通知视图层
//!
//! 订阅者只拿到结果摘要；实体数据仍然从本地存储读取。

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::storage::entities::{EntityKind, SyncAction};
use crate::storage::queue::SyncFailureReason;
use crate::utils::now_millis;

/// 默认广播容量
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// 一个失败批次（某类型的 upsert 或 delete）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedBatch {
    pub kind: EntityKind,
    /// `Update` 表示 upsert 批次，`Delete` 表示删除批次
    pub action: SyncAction,
    pub entity_ids: Vec<String>,
    pub reason: SyncFailureReason,
    pub error: String,
}

/// 一次推送的结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlushReport {
    /// 本次快照中的日志条数
    pub drained: usize,
    /// 远端确认 upsert 的实体数
    pub upserted: usize,
    /// 远端确认删除的实体数
    pub deleted: usize,
    /// 本地已不存在、无需推送即视为完成的实体数
    pub resolved_locally: usize,
    pub failed_batches: Vec<FailedBatch>,
    /// 推送结束后日志中剩余的条数
    pub remaining: u64,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.failed_batches.is_empty()
    }

    pub fn has_remaining(&self) -> bool {
        self.remaining > 0
    }

    /// 第一个失败批次的原因，用于退避
    pub fn failure_reason(&self) -> Option<&SyncFailureReason> {
        self.failed_batches.first().map(|b| &b.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    FlushCompleted {
        report: FlushReport,
        timestamp: i64,
    },
    ReconcileCompleted {
        workspace_id: String,
        applied: usize,
        skipped_dirty: usize,
        timestamp: i64,
    },
    /// 某类型拉取失败（其余类型照常应用）
    ReconcileFailed {
        workspace_id: String,
        kind: EntityKind,
        error: String,
        timestamp: i64,
    },
}

impl SyncEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::FlushCompleted { .. } => "flush_completed",
            SyncEvent::ReconcileCompleted { .. } => "reconcile_completed",
            SyncEvent::ReconcileFailed { .. } => "reconcile_failed",
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            SyncEvent::FlushCompleted { timestamp, .. }
            | SyncEvent::ReconcileCompleted { timestamp, .. }
            | SyncEvent::ReconcileFailed { timestamp, .. } => *timestamp,
        }
    }

    /// 与指定工作区相关（推送事件与所有工作区相关）
    pub fn concerns_workspace(&self, id: &str) -> bool {
        match self {
            SyncEvent::FlushCompleted { .. } => true,
            SyncEvent::ReconcileCompleted { workspace_id, .. }
            | SyncEvent::ReconcileFailed { workspace_id, .. } => workspace_id == id,
        }
    }

    pub(crate) fn flush_completed(report: FlushReport) -> Self {
        SyncEvent::FlushCompleted { report, timestamp: now_millis() }
    }

    pub(crate) fn reconcile_completed(workspace_id: &str, applied: usize, skipped_dirty: usize) -> Self {
        SyncEvent::ReconcileCompleted {
            workspace_id: workspace_id.to_string(),
            applied,
            skipped_dirty,
            timestamp: now_millis(),
        }
    }

    pub(crate) fn reconcile_failed(workspace_id: &str, kind: EntityKind, error: String) -> Self {
        SyncEvent::ReconcileFailed {
            workspace_id: workspace_id.to_string(),
            kind,
            error,
            timestamp: now_millis(),
        }
    }
}

/// 事件总线
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn emit(&self, event: SyncEvent) {
        // 无订阅者时 send 失败属正常场景（无 UI 的后台实例）
        if let Err(e) = self.sender.send(event) {
            debug!("事件无订阅者: {}", e.0.event_type());
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

//! 同步引擎 - 推送（flush）与拉取（reconcile）
//!
//! - 推送：drain 快照 → 折叠 → 按类型并发批量 upsert / delete → 只删除远端确认成功的日志
//! - 拉取：按类型拉取远端快照，跳过脏实体，其余整条覆盖；从不触碰待同步日志
//! - 远端错误在这里吞掉并记录日志；只有本地存储错误会返回给调用方
//!
//! 引擎本身不重试、不计时，节奏全部由 `SyncScheduler` 负责。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::{PixelboardError, Result};
use crate::events::{EventBus, FailedBatch, FlushReport, SyncEvent};
use crate::storage::entities::{EntityKind, EntityRecord, SyncAction};
use crate::storage::queue::SyncFailureReason;
use crate::storage::StorageManager;
use crate::sync::collapse::collapse;
use crate::sync::gateway::RemoteGateway;
use crate::sync::state_store::SyncStateStore;
use crate::utils::now_millis;

/// 一次推送请求的结果
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    Completed(FlushReport),
    /// 已有推送在进行，本次未执行
    AlreadyRunning,
}

impl FlushOutcome {
    pub fn report(&self) -> Option<&FlushReport> {
        match self {
            FlushOutcome::Completed(report) => Some(report),
            FlushOutcome::AlreadyRunning => None,
        }
    }
}

/// 一次拉取的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub workspace_id: String,
    pub applied: usize,
    pub skipped_dirty: usize,
    pub pruned: usize,
    pub failed_kinds: Vec<EntityKind>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failed_kinds.is_empty()
    }
}

enum BatchJob {
    Upsert { kind: EntityKind, ids: Vec<String>, records: Vec<EntityRecord> },
    Delete { kind: EntityKind, ids: Vec<String> },
}

struct BatchResult {
    kind: EntityKind,
    action: SyncAction,
    ids: Vec<String>,
    result: Result<()>,
}

/// 推送互斥标志；drop 时释放并唤醒等待者
struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
    idle: &'a Notify,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
        self.idle.notify_waiters();
    }
}

pub struct SyncEngine {
    storage: Arc<StorageManager>,
    gateway: Arc<dyn RemoteGateway>,
    events: EventBus,
    state: SyncStateStore,
    prune_on_pull: bool,
    in_flight: AtomicBool,
    idle: Notify,
    flush_runs: AtomicU64,
    reconcile_runs: AtomicU64,
}

impl SyncEngine {
    pub fn new(
        storage: Arc<StorageManager>,
        gateway: Arc<dyn RemoteGateway>,
        events: EventBus,
        prune_on_pull: bool,
    ) -> Self {
        let state = SyncStateStore::new(storage.kv_store());
        Self {
            storage,
            gateway,
            events,
            state,
            prune_on_pull,
            in_flight: AtomicBool::new(false),
            idle: Notify::new(),
            flush_runs: AtomicU64::new(0),
            reconcile_runs: AtomicU64::new(0),
        }
    }

    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn state_store(&self) -> &SyncStateStore {
        &self.state
    }

    pub fn is_flushing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// 实际执行过的推送次数（不含被互斥跳过的请求）
    pub fn flush_runs(&self) -> u64 {
        self.flush_runs.load(Ordering::Relaxed)
    }

    pub fn reconcile_runs(&self) -> u64 {
        self.reconcile_runs.load(Ordering::Relaxed)
    }

    /// 等待当前推送结束
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_flushing() {
                return;
            }
            notified.await;
        }
    }

    /// 推送一次
    ///
    /// 日志为空时是空操作。某个批次失败不影响其他批次，失败批次的日志留待下一轮。
    pub async fn flush(&self) -> Result<FlushOutcome> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("推送进行中，忽略本次请求");
            return Ok(FlushOutcome::AlreadyRunning);
        }
        let _guard = InFlightGuard { flag: &self.in_flight, idle: &self.idle };
        self.flush_runs.fetch_add(1, Ordering::Relaxed);

        let log = self.storage.operation_log();
        let snapshot = log.drain().await?;
        if snapshot.is_empty() {
            debug!("待同步日志为空，无需推送");
            return Ok(FlushOutcome::Completed(FlushReport::default()));
        }

        let collapsed = collapse(&snapshot.operations);
        info!(
            "开始推送: {} 条日志折叠为 {} 个实体，{} 个类型",
            snapshot.len(),
            collapsed.effective.len(),
            collapsed.batches.len()
        );

        let mut report = FlushReport { drained: snapshot.len(), ..Default::default() };
        let mut jobs = Vec::new();
        for (kind, batch) in &collapsed.batches {
            if !batch.upserts.is_empty() {
                let (records, missing) = self.load_current(*kind, &batch.upserts).await?;
                if !missing.is_empty() {
                    // 本地已不存在，没有可推送的内容
                    debug!("{} 个 {} 实体本地已不存在，直接视为完成", missing.len(), kind);
                    report.resolved_locally += log
                        .remove_by_entity_ids(&missing, snapshot.high_water_seq)
                        .await
                        .map(|_| missing.len())?;
                }
                if !records.is_empty() {
                    let ids = records.iter().map(|r| r.id().to_string()).collect();
                    jobs.push(BatchJob::Upsert { kind: *kind, ids, records });
                }
            }
            if !batch.deletes.is_empty() {
                jobs.push(BatchJob::Delete { kind: *kind, ids: batch.deletes.clone() });
            }
        }

        let results = join_all(jobs.into_iter().map(|job| self.run_batch(job))).await;

        for batch in results {
            match batch.result {
                Ok(()) => {
                    log.remove_by_entity_ids(&batch.ids, snapshot.high_water_seq).await?;
                    if batch.action.is_delete() {
                        report.deleted += batch.ids.len();
                    } else {
                        report.upserted += batch.ids.len();
                    }
                }
                Err(e) => {
                    warn!(
                        "推送批次失败 {} {} ({} 个实体): {}",
                        batch.kind,
                        batch.action,
                        batch.ids.len(),
                        e
                    );
                    report.failed_batches.push(FailedBatch {
                        kind: batch.kind,
                        action: batch.action,
                        entity_ids: batch.ids,
                        reason: SyncFailureReason::from(&e),
                        error: e.to_string(),
                    });
                }
            }
        }

        report.remaining = log.count().await?;
        if report.is_clean() {
            if let Err(e) = self.state.record_flush(now_millis()).await {
                warn!("记录推送时间失败: {}", e);
            }
        }

        info!(
            "推送完成: upsert {}，delete {}，失败批次 {}，剩余日志 {}",
            report.upserted,
            report.deleted,
            report.failed_batches.len(),
            report.remaining
        );
        self.events.emit(SyncEvent::flush_completed(report.clone()));
        Ok(FlushOutcome::Completed(report))
    }

    /// 读取 upsert 批次中每个实体的当前本地记录；返回 (记录, 本地已不存在的 id)
    async fn load_current(
        &self,
        kind: EntityKind,
        ids: &[String],
    ) -> Result<(Vec<EntityRecord>, Vec<String>)> {
        let store = self.storage.entity_store();
        let mut records = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        for id in ids {
            match store.get(kind, id).await? {
                Some(record) => records.push(record),
                None => missing.push(id.clone()),
            }
        }
        Ok((records, missing))
    }

    async fn run_batch(&self, job: BatchJob) -> BatchResult {
        match job {
            BatchJob::Upsert { kind, ids, records } => {
                debug!("upsert {}: {} 条", kind, records.len());
                let result = self.gateway.bulk_upsert(kind, records).await;
                BatchResult { kind, action: SyncAction::Update, ids, result }
            }
            BatchJob::Delete { kind, ids } => {
                debug!("delete {}: {} 条", kind, ids.len());
                let result = self.gateway.bulk_delete(kind, ids.clone()).await;
                BatchResult { kind, action: SyncAction::Delete, ids, result }
            }
        }
    }

    /// 拉取某工作区的远端快照并合并到本地
    ///
    /// 单个类型拉取失败只记录日志并发出 `ReconcileFailed`，其余类型照常应用。
    pub async fn reconcile(&self, workspace_id: &str) -> Result<ReconcileReport> {
        if workspace_id.is_empty() {
            return Err(PixelboardError::InvalidArgument("workspace_id 不能为空".to_string()));
        }
        self.reconcile_runs.fetch_add(1, Ordering::Relaxed);

        let kinds: Vec<EntityKind> = std::iter::once(EntityKind::Workspace)
            .chain(EntityKind::WORKSPACE_SCOPED)
            .collect();
        // 拉取开始时的脏集合：远端快照比这些本地修改旧，即使它们在应用前已推送完成
        let dirty_at_fetch = self.storage.operation_log().dirty_ids(None).await?;
        let fetched = join_all(kinds.iter().map(|kind| self.gateway.list(*kind, workspace_id))).await;

        let mut report = ReconcileReport { workspace_id: workspace_id.to_string(), ..Default::default() };
        let kind_count = kinds.len();
        for (kind, result) in kinds.into_iter().zip(fetched) {
            match result {
                Ok(records) => {
                    let outcome = self
                        .storage
                        .apply_remote(kind, workspace_id, records, &dirty_at_fetch, self.prune_on_pull)
                        .await?;
                    if outcome.skipped_dirty > 0 {
                        debug!("拉取 {} 跳过 {} 个脏实体", kind, outcome.skipped_dirty);
                    }
                    report.applied += outcome.applied;
                    report.skipped_dirty += outcome.skipped_dirty;
                    report.pruned += outcome.pruned;
                }
                Err(e) => {
                    warn!("拉取 {} 失败 (workspace={}): {}", kind, workspace_id, e);
                    report.failed_kinds.push(kind);
                    self.events
                        .emit(SyncEvent::reconcile_failed(workspace_id, kind, e.to_string()));
                }
            }
        }

        if report.is_clean() {
            if let Err(e) = self.state.record_pull(workspace_id, now_millis()).await {
                warn!("记录拉取时间失败: {}", e);
            }
        } else if report.failed_kinds.len() == kind_count {
            error!("工作区 {} 拉取全部失败，保留本地数据", workspace_id);
            return Ok(report);
        }

        info!(
            "拉取完成 workspace={}: 应用 {}，跳过脏实体 {}，清理 {}",
            workspace_id, report.applied, report.skipped_dirty, report.pruned
        );
        self.events.emit(SyncEvent::reconcile_completed(
            workspace_id,
            report.applied,
            report.skipped_dirty,
        ));
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entities::{CanvasBoard, Workspace};
    use crate::storage::LocalChange;
    use crate::sync::memory_gateway::InMemoryGateway;

    fn board(id: &str, x: f64) -> EntityRecord {
        EntityRecord::CanvasBoard(CanvasBoard {
            id: id.into(),
            workspace_id: "w1".into(),
            name: "Board".into(),
            width: 800.0,
            height: 600.0,
            x,
            y: 0.0,
            settings: Default::default(),
            sort_order: 1,
            updated_at: 0,
        })
    }

    async fn engine() -> (Arc<StorageManager>, Arc<InMemoryGateway>, SyncEngine) {
        let storage = Arc::new(StorageManager::open_in_memory().await.unwrap());
        let gateway = Arc::new(InMemoryGateway::new());
        let engine = SyncEngine::new(storage.clone(), gateway.clone(), EventBus::default(), false);
        (storage, gateway, engine)
    }

    fn board_x(record: Option<EntityRecord>) -> f64 {
        match record {
            Some(EntityRecord::CanvasBoard(b)) => b.x,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_flush_is_noop() {
        let (_, gateway, engine) = engine().await;
        let outcome = engine.flush().await.unwrap();
        assert_eq!(outcome, FlushOutcome::Completed(FlushReport::default()));
        assert!(gateway.upsert_calls().is_empty());
        assert_eq!(engine.flush_runs(), 1);
    }

    #[tokio::test]
    async fn flush_pushes_current_record_and_clears_log() {
        let (storage, gateway, engine) = engine().await;
        storage.record_change(LocalChange::create(board("b1", 0.0))).await.unwrap();
        for x in [10.0, 20.0, 30.0] {
            storage.record_change(LocalChange::update(board("b1", x))).await.unwrap();
        }

        let outcome = engine.flush().await.unwrap();
        let report = outcome.report().unwrap();
        assert_eq!(report.drained, 4);
        assert_eq!(report.upserted, 1);
        assert_eq!(report.remaining, 0);

        let calls = gateway.upsert_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(board_x(calls[0].records.first().cloned()), 30.0);
        assert!(engine.state_store().last_flush().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_kind_keeps_its_log_records() {
        let (storage, gateway, engine) = engine().await;
        gateway.fail_kind(EntityKind::CanvasBoard, true);
        storage.record_change(LocalChange::create(board("b1", 0.0))).await.unwrap();
        storage
            .record_change(LocalChange::create(EntityRecord::Workspace(Workspace {
                id: "w1".into(),
                name: "W".into(),
                settings: Default::default(),
                updated_at: 0,
            })))
            .await
            .unwrap();

        let outcome = engine.flush().await.unwrap();
        let report = outcome.report().unwrap();
        assert_eq!(report.upserted, 1);
        assert_eq!(report.failed_batches.len(), 1);
        assert_eq!(report.failed_batches[0].kind, EntityKind::CanvasBoard);
        assert_eq!(report.failed_batches[0].reason, SyncFailureReason::ServerError(500));
        assert_eq!(report.remaining, 1);

        let dirty = storage.operation_log().dirty_ids(None).await.unwrap();
        assert!(dirty.contains("b1"));
        assert!(!dirty.contains("w1"));
    }

    #[tokio::test]
    async fn create_then_delete_never_upserts() {
        let (storage, gateway, engine) = engine().await;
        storage.record_change(LocalChange::create(board("b1", 0.0))).await.unwrap();
        storage
            .record_change(LocalChange::delete(EntityKind::CanvasBoard, "b1"))
            .await
            .unwrap();

        let report = engine.flush().await.unwrap().report().cloned().unwrap();
        assert_eq!(report.deleted, 1);
        assert!(gateway.upsert_calls().is_empty());
        assert_eq!(gateway.delete_calls().len(), 1);
        assert_eq!(report.remaining, 0);
    }

    #[tokio::test]
    async fn concurrent_flush_is_skipped() {
        let (storage, gateway, engine) = engine().await;
        gateway.set_latency(Some(std::time::Duration::from_millis(50)));
        storage.record_change(LocalChange::create(board("b1", 0.0))).await.unwrap();

        let (a, b) = tokio::join!(engine.flush(), engine.flush());
        let outcomes = [a.unwrap(), b.unwrap()];
        assert_eq!(
            outcomes.iter().filter(|o| **o == FlushOutcome::AlreadyRunning).count(),
            1
        );
        assert_eq!(engine.flush_runs(), 1);
        assert_eq!(gateway.upsert_calls().len(), 1);
    }

    #[tokio::test]
    async fn reconcile_skips_dirty_entities() {
        let (storage, gateway, engine) = engine().await;
        storage.record_change(LocalChange::create(board("b1", 1.0))).await.unwrap();
        gateway.insert_remote(board("b1", 99.0));
        gateway.insert_remote(board("b2", 5.0));

        let report = engine.reconcile("w1").await.unwrap();
        assert_eq!(report.skipped_dirty, 1);
        assert_eq!(report.applied, 1);

        let store = storage.entity_store();
        assert_eq!(board_x(store.get(EntityKind::CanvasBoard, "b1").await.unwrap()), 1.0);
        assert_eq!(board_x(store.get(EntityKind::CanvasBoard, "b2").await.unwrap()), 5.0);
        assert_eq!(storage.operation_log().count().await.unwrap(), 1);
        assert!(engine.state_store().last_pull("w1").await.unwrap().is_some());
    }

    /// `list` 返回预先截取的旧快照，并在返回前等待放行
    struct StaleListGateway {
        inner: Arc<InMemoryGateway>,
        stale_boards: Vec<EntityRecord>,
        entered: Notify,
        release: Notify,
    }

    #[async_trait::async_trait]
    impl RemoteGateway for StaleListGateway {
        async fn bulk_upsert(&self, kind: EntityKind, records: Vec<EntityRecord>) -> Result<()> {
            self.inner.bulk_upsert(kind, records).await
        }

        async fn bulk_delete(&self, kind: EntityKind, ids: Vec<String>) -> Result<()> {
            self.inner.bulk_delete(kind, ids).await
        }

        async fn list(&self, kind: EntityKind, workspace_id: &str) -> Result<Vec<EntityRecord>> {
            if kind != EntityKind::CanvasBoard {
                return self.inner.list(kind, workspace_id).await;
            }
            self.entered.notify_one();
            self.release.notified().await;
            Ok(self.stale_boards.clone())
        }
    }

    #[tokio::test]
    async fn reconcile_overlapping_flush_keeps_pushed_edit() {
        let storage = Arc::new(StorageManager::open_in_memory().await.unwrap());
        let inner = Arc::new(InMemoryGateway::new());
        inner.insert_remote(board("b1", 1.0));
        let gateway = Arc::new(StaleListGateway {
            inner: inner.clone(),
            stale_boards: vec![board("b1", 1.0)],
            entered: Notify::new(),
            release: Notify::new(),
        });
        let engine = Arc::new(SyncEngine::new(
            storage.clone(),
            gateway.clone(),
            EventBus::default(),
            false,
        ));

        storage.entity_store().put(&board("b1", 1.0)).await.unwrap();
        storage.record_change(LocalChange::update(board("b1", 2.0))).await.unwrap();

        let pull = tokio::spawn({
            let engine = engine.clone();
            async move { engine.reconcile("w1").await }
        });
        gateway.entered.notified().await;

        // 拉取已取到旧快照，此时推送完成并清空日志
        let report = engine.flush().await.unwrap().report().cloned().unwrap();
        assert_eq!(report.remaining, 0);
        assert_eq!(board_x(inner.remote_record(EntityKind::CanvasBoard, "b1")), 2.0);

        gateway.release.notify_one();
        let pulled = pull.await.unwrap().unwrap();
        assert_eq!(pulled.skipped_dirty, 1);
        assert_eq!(pulled.applied, 0);
        assert_eq!(
            board_x(storage.entity_store().get(EntityKind::CanvasBoard, "b1").await.unwrap()),
            2.0
        );
    }

    #[tokio::test]
    async fn reconcile_failure_is_swallowed() {
        let (storage, gateway, engine) = engine().await;
        storage.entity_store().put(&board("b1", 1.0)).await.unwrap();
        gateway.set_offline(true);
        let mut rx = engine.events().subscribe();

        let report = engine.reconcile("w1").await.unwrap();
        assert_eq!(report.failed_kinds.len(), EntityKind::ALL.len());
        assert_eq!(board_x(storage.entity_store().get(EntityKind::CanvasBoard, "b1").await.unwrap()), 1.0);
        assert_eq!(rx.recv().await.unwrap().event_type(), "reconcile_failed");
    }
}

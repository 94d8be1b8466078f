//! 同步调度 - 防抖推送与定时拉取
//!
//! 两类计时器都是显式的可取消句柄（`CancellationToken` + tokio 任务），
//! 全部基于 `tokio::time`，测试中可以用 `pause()` / `advance()` 推进虚拟时间。
//!
//! - 防抖推送：每次本地修改调用 `schedule_flush`，窗口内的重复调用只触发一次推送
//! - 推送结束后日志仍非空则再排一次；连续失败按 `RetryPolicy` 退避，但不短于防抖窗口
//! - 定时拉取：打开工作区时立即拉取一次，之后按固定间隔拉取，关闭时停止

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::error::Result;
use crate::storage::queue::SyncFailureReason;
use crate::sync::sync_engine::{FlushOutcome, SyncEngine};

struct PullLoop {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct SyncScheduler {
    engine: Arc<SyncEngine>,
    config: SyncConfig,
    /// 当前待触发的推送计时器
    flush_timer: Mutex<Option<CancellationToken>>,
    pull_loops: Mutex<HashMap<String, PullLoop>>,
    failure_streak: AtomicU32,
    shutdown: CancellationToken,
}

impl SyncScheduler {
    pub fn new(engine: Arc<SyncEngine>, config: SyncConfig) -> Arc<Self> {
        Arc::new(Self {
            engine,
            config,
            flush_timer: Mutex::new(None),
            pull_loops: Mutex::new(HashMap::new()),
            failure_streak: AtomicU32::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn failure_streak(&self) -> u32 {
        self.failure_streak.load(Ordering::Relaxed)
    }

    fn debounce(&self) -> Duration {
        Duration::from_millis(self.config.flush_debounce_ms)
    }

    /// 安排一次防抖推送；窗口内再次调用会重新计时
    pub fn schedule_flush(self: &Arc<Self>) {
        self.arm_flush_timer(self.debounce());
    }

    fn arm_flush_timer(self: &Arc<Self>, delay: Duration) {
        if self.is_shut_down() {
            debug!("调度器已关闭，忽略推送请求");
            return;
        }
        let token = self.shutdown.child_token();
        if let Some(previous) = self.flush_timer.lock().replace(token.clone()) {
            previous.cancel();
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    // 计时器一旦触发，推送就不再受取消影响
                    let _ = this.run_flush_cycle().await;
                }
            }
        });
        debug!("推送计时器已设置: {:?}", delay);
    }

    fn cancel_flush_timer(&self) {
        if let Some(token) = self.flush_timer.lock().take() {
            token.cancel();
        }
    }

    /// 跳过防抖窗口立即推送
    pub async fn flush_now(self: &Arc<Self>) -> Result<FlushOutcome> {
        self.cancel_flush_timer();
        self.run_flush_cycle().await
    }

    /// 执行一次推送并决定是否需要下一轮
    async fn run_flush_cycle(self: &Arc<Self>) -> Result<FlushOutcome> {
        let result = self.engine.flush().await;
        match &result {
            Ok(FlushOutcome::AlreadyRunning) => {
                // 进行中的推送可能没有经过调度器，补排一次确保后续检查
                self.schedule_flush();
            }
            Ok(FlushOutcome::Completed(report)) => {
                let streak = if report.is_clean() {
                    self.failure_streak.store(0, Ordering::Relaxed);
                    0
                } else {
                    self.failure_streak.fetch_add(1, Ordering::Relaxed) + 1
                };
                if report.has_remaining() {
                    let reason = report
                        .failure_reason()
                        .cloned()
                        .unwrap_or(SyncFailureReason::NetworkUnavailable);
                    self.schedule_follow_up(streak, &reason);
                }
            }
            Err(e) => {
                error!("推送失败（本地存储）: {}", e);
                let streak = self.failure_streak.fetch_add(1, Ordering::Relaxed) + 1;
                self.schedule_follow_up(streak, &SyncFailureReason::from(e));
            }
        }
        result
    }

    fn schedule_follow_up(self: &Arc<Self>, streak: u32, reason: &SyncFailureReason) {
        let backoff = self.config.retry.delay_for(streak, reason).unwrap_or_default();
        let delay = backoff.max(self.debounce());
        if streak > 0 {
            warn!("连续推送失败 {} 次，{:?} 后重试", streak, delay);
        }
        self.arm_flush_timer(delay);
    }

    /// 开始定时拉取某工作区（立即拉取一次）；重复调用会替换旧的循环
    pub fn start_pull_loop(self: &Arc<Self>, workspace_id: &str) {
        if self.is_shut_down() {
            return;
        }
        let token = self.shutdown.child_token();
        let interval = Duration::from_millis(self.config.pull_interval_ms);
        let engine = Arc::clone(&self.engine);
        let ws = workspace_id.to_string();
        let loop_token = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                // 关闭工作区时放弃进行中的拉取；拉取不触碰日志，可以安全丢弃
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    result = engine.reconcile(&ws) => {
                        if let Err(e) = result {
                            error!("拉取失败（本地存储）workspace={}: {}", ws, e);
                        }
                    }
                }
            }
            debug!("定时拉取已停止: {}", ws);
        });

        let previous = self
            .pull_loops
            .lock()
            .insert(workspace_id.to_string(), PullLoop { token, handle });
        if let Some(previous) = previous {
            previous.token.cancel();
        }
        info!("定时拉取已启动: {} (间隔 {:?})", workspace_id, interval);
    }

    /// 停止某工作区的定时拉取，并等待循环退出
    pub async fn stop_pull_loop(&self, workspace_id: &str) {
        let pull_loop = self.pull_loops.lock().remove(workspace_id);
        if let Some(pull_loop) = pull_loop {
            pull_loop.token.cancel();
            if let Err(e) = pull_loop.handle.await {
                warn!("定时拉取任务异常退出 {}: {}", workspace_id, e);
            }
        }
    }

    pub fn is_pulling(&self, workspace_id: &str) -> bool {
        self.pull_loops.lock().contains_key(workspace_id)
    }

    /// 停止所有计时器，等待进行中的推送结束后再做最后一次推送
    pub async fn shutdown(&self) -> Result<FlushOutcome> {
        info!("同步调度器关闭中");
        self.shutdown.cancel();
        self.cancel_flush_timer();

        let loops: Vec<(String, PullLoop)> = self.pull_loops.lock().drain().collect();
        for (ws, pull_loop) in loops {
            pull_loop.token.cancel();
            if let Err(e) = pull_loop.handle.await {
                warn!("定时拉取任务异常退出 {}: {}", ws, e);
            }
        }

        self.engine.wait_idle().await;
        self.engine.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::storage::entities::{CanvasBoard, EntityKind, EntityRecord};
    use crate::storage::queue::RetryPolicy;
    use crate::storage::{LocalChange, StorageManager};
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

    async fn setup(config: SyncConfig) -> (Arc<StorageManager>, Arc<InMemoryGateway>, Arc<SyncScheduler>) {
        let storage = Arc::new(StorageManager::open_in_memory().await.unwrap());
        let gateway = Arc::new(InMemoryGateway::new());
        let engine = Arc::new(SyncEngine::new(
            storage.clone(),
            gateway.clone(),
            EventBus::default(),
            false,
        ));
        (storage, gateway, SyncScheduler::new(engine, config))
    }

    fn fast_config() -> SyncConfig {
        SyncConfig {
            flush_debounce_ms: 1_000,
            pull_interval_ms: 60_000,
            retry: RetryPolicy {
                base_delay_ms: 1_000,
                max_delay_ms: 8_000,
                backoff_factor: 2.0,
                jitter_factor: 0.0,
            },
            prune_on_pull: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_coalesces_rapid_calls() {
        let (storage, gateway, scheduler) = setup(fast_config()).await;
        for i in 0..10 {
            storage.record_change(LocalChange::update(board("b1", i as f64))).await.unwrap();
            scheduler.schedule_flush();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(scheduler.engine().flush_runs(), 0);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(scheduler.engine().flush_runs(), 1);
        assert_eq!(gateway.upsert_calls().len(), 1);
        assert_eq!(storage.operation_log().count().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_flush_retries_with_backoff_until_drained() {
        let (storage, gateway, scheduler) = setup(fast_config()).await;
        gateway.set_offline(true);
        storage.record_change(LocalChange::create(board("b1", 0.0))).await.unwrap();
        scheduler.schedule_flush();

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(scheduler.engine().flush_runs(), 1);
        assert_eq!(scheduler.failure_streak(), 1);

        // 第二次失败后的退避是 2s
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(scheduler.engine().flush_runs(), 2);
        assert_eq!(scheduler.failure_streak(), 2);

        gateway.set_offline(false);
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(scheduler.engine().flush_runs(), 3);
        assert_eq!(scheduler.failure_streak(), 0);
        assert_eq!(storage.operation_log().count().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pull_loop_runs_immediately_then_on_interval() {
        let (_storage, gateway, scheduler) = setup(fast_config()).await;
        scheduler.start_pull_loop("w1");
        tokio::time::sleep(Duration::from_millis(10)).await;
        let first = scheduler.engine().reconcile_runs();
        assert_eq!(first, 1);

        tokio::time::sleep(Duration::from_millis(60_000)).await;
        assert_eq!(scheduler.engine().reconcile_runs(), 2);
        assert!(gateway.list_calls() >= 2 * 5);

        scheduler.stop_pull_loop("w1").await;
        assert!(!scheduler.is_pulling("w1"));
        tokio::time::sleep(Duration::from_millis(120_000)).await;
        assert_eq!(scheduler.engine().reconcile_runs(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_and_stops_timers() {
        let (storage, gateway, scheduler) = setup(fast_config()).await;
        scheduler.start_pull_loop("w1");
        storage.record_change(LocalChange::create(board("b1", 0.0))).await.unwrap();
        scheduler.schedule_flush();

        let outcome = scheduler.shutdown().await.unwrap();
        assert_eq!(outcome.report().unwrap().upserted, 1);
        assert_eq!(gateway.remote_count(EntityKind::CanvasBoard), 1);
        assert!(!scheduler.is_pulling("w1"));

        let runs = scheduler.engine().flush_runs();
        scheduler.schedule_flush();
        tokio::time::sleep(Duration::from_millis(5_000)).await;
        assert_eq!(scheduler.engine().flush_runs(), runs);
    }
}

//! 端到端同步行为：离线编辑、防抖、折叠、拉取跳过脏实体、重启后继续推送

use std::sync::Arc;
use std::time::Duration;

use pixelboard_sdk::{
    CanvasBoard, CommandOutcome, EntityKind, EntityRecord, InMemoryGateway, LayerPatch, NewBoard,
    PixelboardConfig, PixelboardSDK, Settings, SyncEvent, WorkspaceCommand, WorkspaceSession,
};
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

async fn setup() -> (PixelboardSDK, Arc<InMemoryGateway>) {
    init_tracing();
    let gateway = Arc::new(InMemoryGateway::new());
    let config = PixelboardConfig::builder().memory_only(true).build().unwrap();
    let sdk = PixelboardSDK::with_gateway(config, gateway.clone()).await.unwrap();
    (sdk, gateway)
}

fn new_board(name: &str) -> WorkspaceCommand {
    WorkspaceCommand::CreateBoard(NewBoard {
        name: name.into(),
        width: 1920.0,
        height: 1080.0,
        x: 0.0,
        y: 0.0,
        settings: Settings::new(),
    })
}

async fn create_board(session: &WorkspaceSession, name: &str) -> String {
    match session.dispatch(new_board(name)).await.unwrap() {
        CommandOutcome::Created(id) => id,
        other => panic!("unexpected outcome: {:?}", other),
    }
}

async fn move_board(session: &WorkspaceSession, id: &str, x: f64) {
    session
        .dispatch(WorkspaceCommand::UpdateBoard {
            id: id.to_string(),
            patch: LayerPatch::position(x, 0.0),
        })
        .await
        .unwrap();
}

fn remote_board(gateway: &InMemoryGateway, id: &str) -> Option<CanvasBoard> {
    match gateway.remote_record(EntityKind::CanvasBoard, id) {
        Some(EntityRecord::CanvasBoard(board)) => Some(board),
        _ => None,
    }
}

fn board_upserts(gateway: &InMemoryGateway) -> usize {
    gateway
        .upsert_calls()
        .iter()
        .filter(|c| c.kind == EntityKind::CanvasBoard)
        .count()
}

#[tokio::test(start_paused = true)]
async fn offline_edits_reach_remote_as_one_upsert() {
    let (sdk, gateway) = setup().await;
    gateway.set_offline(true);

    let ws = sdk.create_workspace("Poster", Settings::new()).await.unwrap();
    let session = sdk.open_workspace(&ws.id).await.unwrap();
    let board_id = create_board(&session, "A4").await;
    for x in [10.0, 20.0, 30.0] {
        move_board(&session, &board_id, x).await;
    }

    // 防抖触发一次，离线失败，日志保留
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(sdk.engine().flush_runs() >= 1);
    assert!(sdk.pending_count().await.unwrap() > 0);
    assert_eq!(gateway.remote_count(EntityKind::CanvasBoard), 0);

    gateway.set_offline(false);
    let outcome = sdk.flush_now().await.unwrap();
    let report = outcome.report().unwrap();
    assert!(report.is_clean());
    assert_eq!(report.remaining, 0);

    assert_eq!(board_upserts(&gateway), 1);
    assert_eq!(gateway.upsert_count_for(&board_id), 1);
    assert_eq!(remote_board(&gateway, &board_id).unwrap().x, 30.0);
    assert_eq!(sdk.pending_count().await.unwrap(), 0);
    sdk.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn rapid_edits_debounce_into_single_flush() {
    let (sdk, gateway) = setup().await;
    let ws = sdk.create_workspace("Poster", Settings::new()).await.unwrap();
    let session = sdk.open_workspace(&ws.id).await.unwrap();
    let board_id = create_board(&session, "A4").await;
    sdk.flush_now().await.unwrap();

    gateway.reset_calls();
    let runs_before = sdk.engine().flush_runs();
    for i in 0..50 {
        move_board(&session, &board_id, i as f64).await;
        tokio::time::advance(Duration::from_millis(10)).await;
    }
    assert_eq!(sdk.engine().flush_runs(), runs_before);

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(sdk.engine().flush_runs(), runs_before + 1);
    assert_eq!(gateway.upsert_count_for(&board_id), 1);
    assert_eq!(remote_board(&gateway, &board_id).unwrap().x, 49.0);
    assert_eq!(sdk.pending_count().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn create_then_delete_never_upserts() {
    let (sdk, gateway) = setup().await;
    let ws = sdk.create_workspace("Poster", Settings::new()).await.unwrap();
    let session = sdk.open_workspace(&ws.id).await.unwrap();

    let board_id = create_board(&session, "Scratch").await;
    session
        .dispatch(WorkspaceCommand::DeleteBoard { id: board_id.clone() })
        .await
        .unwrap();
    sdk.flush_now().await.unwrap();

    assert_eq!(gateway.upsert_count_for(&board_id), 0);
    assert!(remote_board(&gateway, &board_id).is_none());
    assert!(session.snapshot().board(&board_id).is_none());
    assert_eq!(sdk.pending_count().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn pull_keeps_unpushed_local_edits() {
    let (sdk, gateway) = setup().await;
    let ws = sdk.create_workspace("Poster", Settings::new()).await.unwrap();
    let session = sdk.open_workspace(&ws.id).await.unwrap();
    let board_id = create_board(&session, "A4").await;
    sdk.flush_now().await.unwrap();

    // 本地未推送的修改
    move_board(&session, &board_id, 42.0).await;

    // 另一台设备改了同一个画板
    let mut other = remote_board(&gateway, &board_id).unwrap();
    other.x = 999.0;
    gateway.insert_remote(EntityRecord::CanvasBoard(other.clone()));

    let report = sdk.reconcile(&ws.id).await.unwrap();
    assert!(report.skipped_dirty >= 1);
    assert_eq!(session.snapshot().board(&board_id).unwrap().x, 42.0);

    // 推送后本地版本覆盖远端
    sdk.flush_now().await.unwrap();
    assert_eq!(remote_board(&gateway, &board_id).unwrap().x, 42.0);

    // 不再脏，之后的远端修改会被接受
    other.x = 7.0;
    gateway.insert_remote(EntityRecord::CanvasBoard(other));
    let report = sdk.reconcile(&ws.id).await.unwrap();
    assert_eq!(report.skipped_dirty, 0);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(session.snapshot().board(&board_id).unwrap().x, 7.0);
}

#[tokio::test(start_paused = true)]
async fn pruning_pull_drops_clean_remote_deletions() {
    init_tracing();
    let gateway = Arc::new(InMemoryGateway::new());
    let config = PixelboardConfig::builder()
        .memory_only(true)
        .prune_on_pull(true)
        .build()
        .unwrap();
    let sdk = PixelboardSDK::with_gateway(config, gateway.clone()).await.unwrap();
    let ws = sdk.create_workspace("Poster", Settings::new()).await.unwrap();
    let session = sdk.open_workspace(&ws.id).await.unwrap();
    let kept = create_board(&session, "Kept").await;
    let gone = create_board(&session, "Gone").await;
    sdk.flush_now().await.unwrap();

    // 另一台设备删除了两个画板，本地仍在编辑其中一个
    gateway.remove_remote(EntityKind::CanvasBoard, &kept);
    gateway.remove_remote(EntityKind::CanvasBoard, &gone);
    move_board(&session, &kept, 64.0).await;

    let report = sdk.reconcile(&ws.id).await.unwrap();
    assert_eq!(report.pruned, 1);

    let store = sdk.storage().entity_store();
    assert!(store.get(EntityKind::CanvasBoard, &gone).await.unwrap().is_none());
    assert!(store.get(EntityKind::CanvasBoard, &kept).await.unwrap().is_some());
    assert!(store.get(EntityKind::Workspace, &ws.id).await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn session_refreshes_after_pull() {
    let (sdk, gateway) = setup().await;
    let ws = sdk.create_workspace("Poster", Settings::new()).await.unwrap();
    sdk.flush_now().await.unwrap();
    let session = sdk.open_workspace(&ws.id).await.unwrap();
    let mut events = sdk.subscribe_events();

    gateway.insert_remote(EntityRecord::CanvasBoard(CanvasBoard {
        id: "remote-board".into(),
        workspace_id: ws.id.clone(),
        name: "From tablet".into(),
        width: 800.0,
        height: 600.0,
        x: 5.0,
        y: 5.0,
        settings: Settings::new(),
        sort_order: 1,
        updated_at: 0,
    }));
    sdk.reconcile(&ws.id).await.unwrap();

    loop {
        match events.recv().await.unwrap() {
            SyncEvent::ReconcileCompleted { workspace_id, .. } if workspace_id == ws.id => break,
            _ => {}
        }
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    let state = session.snapshot();
    assert_eq!(state.board("remote-board").unwrap().name, "From tablet");
}

#[tokio::test(start_paused = true)]
async fn opening_workspace_backfills_layer_order() {
    let (sdk, gateway) = setup().await;
    let ws = sdk.create_workspace("Poster", Settings::new()).await.unwrap();
    sdk.flush_now().await.unwrap();

    // 旧客户端写入的画板没有排序项
    gateway.insert_remote(EntityRecord::CanvasBoard(CanvasBoard {
        id: "legacy-board".into(),
        workspace_id: ws.id.clone(),
        name: "Legacy".into(),
        width: 800.0,
        height: 600.0,
        x: 0.0,
        y: 0.0,
        settings: Settings::new(),
        sort_order: 3,
        updated_at: 0,
    }));
    sdk.reconcile(&ws.id).await.unwrap();
    assert_eq!(sdk.pending_count().await.unwrap(), 0);

    let session = sdk.open_workspace(&ws.id).await.unwrap();
    assert!(session.snapshot().layer_entry("legacy-board").is_some());
    assert_eq!(session.sorted_layer_ids(), vec!["legacy-board".to_string()]);
    assert!(sdk.pending_count().await.unwrap() > 0);

    sdk.flush_now().await.unwrap();
    assert_eq!(gateway.remote_count(EntityKind::LayerOrder), 1);
}

#[tokio::test(start_paused = true)]
async fn repeated_flush_is_idempotent() {
    let (sdk, gateway) = setup().await;
    let ws = sdk.create_workspace("Poster", Settings::new()).await.unwrap();
    let session = sdk.open_workspace(&ws.id).await.unwrap();
    let board_id = create_board(&session, "A4").await;
    sdk.flush_now().await.unwrap();
    move_board(&session, &board_id, 12.0).await;
    sdk.flush_now().await.unwrap();

    assert_eq!(gateway.remote_count(EntityKind::CanvasBoard), 1);
    assert_eq!(gateway.upsert_count_for(&board_id), 2);

    gateway.reset_calls();
    let outcome = sdk.flush_now().await.unwrap();
    assert_eq!(outcome.report().unwrap().drained, 0);
    assert!(gateway.upsert_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_pushes_pending_edits() {
    let (sdk, gateway) = setup().await;
    let ws = sdk.create_workspace("Poster", Settings::new()).await.unwrap();
    let session = sdk.open_workspace(&ws.id).await.unwrap();
    let board_id = create_board(&session, "A4").await;

    sdk.shutdown().await.unwrap();
    assert!(remote_board(&gateway, &board_id).is_some());
    assert_eq!(sdk.pending_count().await.unwrap(), 0);
    assert!(sdk.scheduler().is_shut_down());
    assert!(!sdk.scheduler().is_pulling(&ws.id));
}

#[tokio::test]
async fn pending_log_survives_restart() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let ws_id = {
        let gateway = Arc::new(InMemoryGateway::new());
        gateway.set_offline(true);
        let config = PixelboardConfig::builder().data_dir(dir.path()).build().unwrap();
        let sdk = PixelboardSDK::with_gateway(config, gateway).await.unwrap();
        let ws = sdk.create_workspace("Offline", Settings::new()).await.unwrap();
        sdk.shutdown().await.unwrap();
        assert_eq!(sdk.pending_count().await.unwrap(), 1);
        ws.id
    };
    // 让已取消的计时器任务退出并释放存储
    tokio::time::sleep(Duration::from_millis(100)).await;

    let gateway = Arc::new(InMemoryGateway::new());
    let config = PixelboardConfig::builder().data_dir(dir.path()).build().unwrap();
    let sdk = PixelboardSDK::with_gateway(config, gateway.clone()).await.unwrap();
    assert_eq!(sdk.pending_count().await.unwrap(), 1);
    assert_eq!(sdk.list_workspaces().await.unwrap()[0].id, ws_id);

    sdk.flush_now().await.unwrap();
    assert!(gateway.remote_record(EntityKind::Workspace, &ws_id).is_some());
    assert_eq!(sdk.pending_count().await.unwrap(), 0);
}

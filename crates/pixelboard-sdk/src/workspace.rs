//! 工作区视图模型 - 显式状态容器
//!
//! 内存状态只能通过 `WorkspaceCommand` 修改。每条命令：
//! 1. 先改内存状态（立即可见）
//! 2. 写穿到本地实体存储，并在同一事务里追加待同步日志
//! 3. 安排一次防抖推送
//!
//! 本地写入失败时内存状态回滚，错误返回给调用方；远端失败永远不会出现在这里。

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PixelboardError, Result};
use crate::events::SyncEvent;
use crate::storage::entities::{
    new_entity_id, BackgroundImage, CanvasBoard, EntityKind, EntityRecord, LayerKind,
    LayerOrderEntry, ReferenceLayer, Settings, Workspace,
};
use crate::storage::{LocalChange, StorageManager};
use crate::sync::SyncScheduler;

/// 工作区 settings 中相机位姿的 key
pub const CAMERA_SETTINGS_KEY: &str = "camera";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkspaceState {
    pub workspace: Option<Workspace>,
    /// 按 sort_order 降序
    pub boards: Vec<CanvasBoard>,
    /// 按 sort_order 降序
    pub references: Vec<ReferenceLayer>,
    pub background_images: Vec<BackgroundImage>,
    /// 按 sort_order 降序
    pub layer_order: Vec<LayerOrderEntry>,
    /// 当前选中的图层 id
    pub selection: Vec<String>,
}

impl WorkspaceState {
    pub fn board(&self, id: &str) -> Option<&CanvasBoard> {
        self.boards.iter().find(|b| b.id == id)
    }

    pub fn reference(&self, id: &str) -> Option<&ReferenceLayer> {
        self.references.iter().find(|r| r.id == id)
    }

    pub fn background_image(&self, id: &str) -> Option<&BackgroundImage> {
        self.background_images.iter().find(|i| i.id == id)
    }

    /// 某画板上的背景图，按 sort_order 降序
    pub fn images_on_board(&self, board_id: &str) -> Vec<&BackgroundImage> {
        let mut images: Vec<&BackgroundImage> = self
            .background_images
            .iter()
            .filter(|i| i.board_id == board_id)
            .collect();
        images.sort_by(|a, b| b.sort_order.cmp(&a.sort_order));
        images
    }

    pub fn layer_entry(&self, layer_id: &str) -> Option<&LayerOrderEntry> {
        self.layer_order.iter().find(|e| e.layer_id == layer_id)
    }

    /// 图层 id，最上层在前
    pub fn sorted_layer_ids(&self) -> Vec<String> {
        let mut entries: Vec<&LayerOrderEntry> = self.layer_order.iter().collect();
        entries.sort_by(|a, b| b.sort_order.cmp(&a.sort_order));
        entries.into_iter().map(|e| e.layer_id.clone()).collect()
    }

    /// 图层排序值；没有排序项时为 0
    pub fn layer_sort_order(&self, layer_id: &str) -> i64 {
        self.layer_entry(layer_id).map_or(0, |e| e.sort_order)
    }

    pub fn camera(&self) -> Option<&Value> {
        self.workspace.as_ref()?.settings.get(CAMERA_SETTINGS_KEY)
    }

    fn layer_ids(&self) -> impl Iterator<Item = String> + '_ {
        self.boards
            .iter()
            .map(|b| b.id.clone())
            .chain(self.references.iter().map(|r| r.id.clone()))
            .chain(self.background_images.iter().map(|i| i.id.clone()))
    }

    fn max_layer_sort(&self) -> i64 {
        self.layer_order.iter().map(|e| e.sort_order).max().unwrap_or(0)
    }

    fn sort_layers(&mut self) {
        self.layer_order.sort_by(|a, b| b.sort_order.cmp(&a.sort_order));
    }
}

/// 画板、参考图层、背景图共用的局部更新
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayerPatch {
    pub name: Option<String>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    /// 按 key 合并进已有 settings
    pub settings: Option<Settings>,
    pub sort_order: Option<i64>,
}

impl LayerPatch {
    pub fn position(x: f64, y: f64) -> Self {
        Self { x: Some(x), y: Some(y), ..Default::default() }
    }

    pub fn size(width: f64, height: f64) -> Self {
        Self { width: Some(width), height: Some(height), ..Default::default() }
    }
}

fn merge_settings(target: &mut Settings, patch: &Option<Settings>) {
    if let Some(patch) = patch {
        for (k, v) in patch {
            target.insert(k.clone(), v.clone());
        }
    }
}

macro_rules! apply_geometry {
    ($patch:expr, $target:expr) => {{
        let p = $patch;
        let t = $target;
        if let Some(v) = p.width { t.width = v; }
        if let Some(v) = p.height { t.height = v; }
        if let Some(v) = p.x { t.x = v; }
        if let Some(v) = p.y { t.y = v; }
        if let Some(v) = p.sort_order { t.sort_order = v; }
        merge_settings(&mut t.settings, &p.settings);
    }};
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewBoard {
    pub name: String,
    pub width: f64,
    pub height: f64,
    pub x: f64,
    pub y: f64,
    pub settings: Settings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewReference {
    pub reference_id: String,
    pub view: String,
    pub name: String,
    pub width: f64,
    pub height: f64,
    /// 放在视口中心
    pub x: f64,
    pub y: f64,
    pub settings: Settings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewBackgroundImage {
    pub board_id: String,
    pub image_url: String,
    pub natural_width: f64,
    pub natural_height: f64,
    /// 缺省为原始尺寸
    pub width: Option<f64>,
    pub height: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkspaceCommand {
    Rename { name: String },
    /// 合并工作区 settings
    UpdateSettings { settings: Settings },
    /// 记录最后的相机位姿
    SaveCamera { camera: Value },
    CreateBoard(NewBoard),
    UpdateBoard { id: String, patch: LayerPatch },
    DeleteBoard { id: String },
    CreateReference(NewReference),
    UpdateReference { id: String, patch: LayerPatch },
    DeleteReference { id: String },
    /// 把 `active_id` 移到 `over_id` 的位置，重排参考图层
    ReorderReferences { active_id: String, over_id: String },
    CreateBackgroundImage(NewBackgroundImage),
    UpdateBackgroundImage { id: String, patch: LayerPatch },
    DeleteBackgroundImage { id: String },
    /// 为图层设置排序值（没有排序项则新建）
    SetLayerOrder { layer_id: String, layer_kind: LayerKind, sort_order: i64 },
    /// 交换两个图层的排序值
    ReorderLayers { from_layer_id: String, to_layer_id: String },
    /// `None` 清空选择；`multi` 为真时切换该 id 的选中状态
    Select { id: Option<String>, multi: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// 新建实体的 id
    Created(String),
    Applied,
    /// 目标不存在，未做任何修改
    Ignored,
}

/// 在内存状态上执行命令，返回需要写穿的本地变更
fn apply_command(
    state: &mut WorkspaceState,
    workspace_id: &str,
    command: WorkspaceCommand,
) -> Result<(CommandOutcome, Vec<LocalChange>)> {
    use WorkspaceCommand::*;

    let ignored = Ok((CommandOutcome::Ignored, Vec::new()));
    match command {
        Rename { name } => {
            let Some(ws) = state.workspace.as_mut() else { return ignored };
            ws.name = name;
            Ok((CommandOutcome::Applied, vec![LocalChange::update(EntityRecord::Workspace(ws.clone()))]))
        }
        UpdateSettings { settings } => {
            let Some(ws) = state.workspace.as_mut() else { return ignored };
            merge_settings(&mut ws.settings, &Some(settings));
            Ok((CommandOutcome::Applied, vec![LocalChange::update(EntityRecord::Workspace(ws.clone()))]))
        }
        SaveCamera { camera } => {
            let Some(ws) = state.workspace.as_mut() else { return ignored };
            ws.settings.insert(CAMERA_SETTINGS_KEY.to_string(), camera);
            Ok((CommandOutcome::Applied, vec![LocalChange::update(EntityRecord::Workspace(ws.clone()))]))
        }

        CreateBoard(new) => {
            if new.width <= 0.0 || new.height <= 0.0 {
                return Err(PixelboardError::InvalidArgument("画板尺寸必须大于 0".to_string()));
            }
            let board = CanvasBoard {
                id: new_entity_id(),
                workspace_id: workspace_id.to_string(),
                name: new.name,
                width: new.width,
                height: new.height,
                x: new.x,
                y: new.y,
                settings: new.settings,
                sort_order: state.boards.iter().map(|b| b.sort_order).max().unwrap_or(0) + 1,
                updated_at: 0,
            };
            let entry = new_layer_entry(state, workspace_id, &board.id, LayerKind::Board);
            let id = board.id.clone();
            state.boards.insert(0, board.clone());
            Ok((
                CommandOutcome::Created(id),
                vec![
                    LocalChange::create(EntityRecord::CanvasBoard(board)),
                    LocalChange::create(EntityRecord::LayerOrder(entry)),
                ],
            ))
        }
        UpdateBoard { id, patch } => {
            let Some(board) = state.boards.iter_mut().find(|b| b.id == id) else { return ignored };
            if let Some(name) = &patch.name {
                board.name = name.clone();
            }
            apply_geometry!(&patch, &mut *board);
            let record = EntityRecord::CanvasBoard(board.clone());
            if patch.sort_order.is_some() {
                state.boards.sort_by(|a, b| b.sort_order.cmp(&a.sort_order));
            }
            Ok((CommandOutcome::Applied, vec![LocalChange::update(record)]))
        }
        DeleteBoard { id } => {
            if state.board(&id).is_none() {
                return ignored;
            }
            state.boards.retain(|b| b.id != id);
            let mut changes = vec![LocalChange::delete(EntityKind::CanvasBoard, id.clone())];
            // 画板上的背景图一并删除
            let image_ids: Vec<String> = state
                .background_images
                .iter()
                .filter(|i| i.board_id == id)
                .map(|i| i.id.clone())
                .collect();
            for image_id in &image_ids {
                changes.extend(remove_layer_entry(state, image_id));
                changes.push(LocalChange::delete(EntityKind::BackgroundImage, image_id.clone()));
            }
            state.background_images.retain(|i| i.board_id != id);
            changes.extend(remove_layer_entry(state, &id));
            deselect(state, std::iter::once(&id).chain(image_ids.iter()));
            Ok((CommandOutcome::Applied, changes))
        }

        CreateReference(new) => {
            let reference = ReferenceLayer {
                id: new_entity_id(),
                workspace_id: workspace_id.to_string(),
                reference_id: new.reference_id,
                view: new.view,
                name: new.name,
                width: new.width,
                height: new.height,
                x: new.x,
                y: new.y,
                settings: new.settings,
                sort_order: state.references.iter().map(|r| r.sort_order).max().unwrap_or(0) + 1,
                updated_at: 0,
            };
            let entry = new_layer_entry(state, workspace_id, &reference.id, LayerKind::Reference);
            let id = reference.id.clone();
            state.references.insert(0, reference.clone());
            Ok((
                CommandOutcome::Created(id),
                vec![
                    LocalChange::create(EntityRecord::ReferenceLayer(reference)),
                    LocalChange::create(EntityRecord::LayerOrder(entry)),
                ],
            ))
        }
        UpdateReference { id, patch } => {
            let Some(reference) = state.references.iter_mut().find(|r| r.id == id) else { return ignored };
            if let Some(name) = &patch.name {
                reference.name = name.clone();
            }
            apply_geometry!(&patch, &mut *reference);
            let record = EntityRecord::ReferenceLayer(reference.clone());
            if patch.sort_order.is_some() {
                state.references.sort_by(|a, b| b.sort_order.cmp(&a.sort_order));
            }
            Ok((CommandOutcome::Applied, vec![LocalChange::update(record)]))
        }
        DeleteReference { id } => {
            if state.reference(&id).is_none() {
                return ignored;
            }
            state.references.retain(|r| r.id != id);
            let mut changes = vec![LocalChange::delete(EntityKind::ReferenceLayer, id.clone())];
            changes.extend(remove_layer_entry(state, &id));
            deselect(state, std::iter::once(&id));
            Ok((CommandOutcome::Applied, changes))
        }
        ReorderReferences { active_id, over_id } => {
            let from = state.references.iter().position(|r| r.id == active_id);
            let to = state.references.iter().position(|r| r.id == over_id);
            let (Some(from), Some(to)) = (from, to) else { return ignored };
            let moved = state.references.remove(from);
            state.references.insert(to, moved);

            let len = state.references.len() as i64;
            let mut changes = Vec::new();
            for (index, reference) in state.references.iter_mut().enumerate() {
                let rank = len - 1 - index as i64;
                if reference.sort_order != rank {
                    reference.sort_order = rank;
                    changes.push(LocalChange::update(EntityRecord::ReferenceLayer(reference.clone())));
                }
            }
            Ok((CommandOutcome::Applied, changes))
        }

        CreateBackgroundImage(new) => {
            if state.board(&new.board_id).is_none() {
                return Err(PixelboardError::NotFound(format!("画板 {}", new.board_id)));
            }
            let width = new.width.filter(|w| *w > 0.0).unwrap_or(new.natural_width);
            let height = new.height.filter(|h| *h > 0.0).unwrap_or(new.natural_height);
            let sort_order = state
                .background_images
                .iter()
                .filter(|i| i.board_id == new.board_id)
                .map(|i| i.sort_order)
                .max()
                .unwrap_or(0)
                + 1;
            let image = BackgroundImage {
                id: new_entity_id(),
                workspace_id: workspace_id.to_string(),
                board_id: new.board_id,
                image_url: new.image_url,
                natural_width: new.natural_width,
                natural_height: new.natural_height,
                width,
                height,
                x: 0.0,
                y: 0.0,
                settings: default_image_settings(),
                sort_order,
                updated_at: 0,
            };
            let id = image.id.clone();
            state.background_images.push(image.clone());
            Ok((
                CommandOutcome::Created(id),
                vec![LocalChange::create(EntityRecord::BackgroundImage(image))],
            ))
        }
        UpdateBackgroundImage { id, patch } => {
            let Some(image) = state.background_images.iter_mut().find(|i| i.id == id) else { return ignored };
            apply_geometry!(&patch, &mut *image);
            Ok((
                CommandOutcome::Applied,
                vec![LocalChange::update(EntityRecord::BackgroundImage(image.clone()))],
            ))
        }
        DeleteBackgroundImage { id } => {
            if state.background_image(&id).is_none() {
                return ignored;
            }
            state.background_images.retain(|i| i.id != id);
            let mut changes = vec![LocalChange::delete(EntityKind::BackgroundImage, id.clone())];
            changes.extend(remove_layer_entry(state, &id));
            deselect(state, std::iter::once(&id));
            Ok((CommandOutcome::Applied, changes))
        }

        SetLayerOrder { layer_id, layer_kind, sort_order } => {
            let existing = state.layer_order.iter().position(|e| e.layer_id == layer_id);
            let change = match existing {
                Some(pos) => {
                    let entry = &mut state.layer_order[pos];
                    entry.sort_order = sort_order;
                    LocalChange::update(EntityRecord::LayerOrder(entry.clone()))
                }
                None => {
                    let entry = LayerOrderEntry {
                        id: new_entity_id(),
                        workspace_id: workspace_id.to_string(),
                        layer_id,
                        layer_kind,
                        sort_order,
                        updated_at: 0,
                    };
                    state.layer_order.push(entry.clone());
                    LocalChange::create(EntityRecord::LayerOrder(entry))
                }
            };
            state.sort_layers();
            Ok((CommandOutcome::Applied, vec![change]))
        }
        ReorderLayers { from_layer_id, to_layer_id } => {
            let from = state.layer_order.iter().position(|e| e.layer_id == from_layer_id);
            let to = state.layer_order.iter().position(|e| e.layer_id == to_layer_id);
            let (Some(from), Some(to)) = (from, to) else { return ignored };
            if from == to {
                return ignored;
            }
            let from_rank = state.layer_order[from].sort_order;
            let to_rank = state.layer_order[to].sort_order;
            state.layer_order[from].sort_order = to_rank;
            state.layer_order[to].sort_order = from_rank;
            let changes = vec![
                LocalChange::update(EntityRecord::LayerOrder(state.layer_order[from].clone())),
                LocalChange::update(EntityRecord::LayerOrder(state.layer_order[to].clone())),
            ];
            state.sort_layers();
            Ok((CommandOutcome::Applied, changes))
        }

        Select { id, multi } => {
            match id {
                None => state.selection.clear(),
                Some(id) if multi => {
                    if let Some(pos) = state.selection.iter().position(|s| *s == id) {
                        state.selection.remove(pos);
                    } else {
                        state.selection.push(id);
                    }
                }
                Some(id) => state.selection = vec![id],
            }
            Ok((CommandOutcome::Applied, Vec::new()))
        }
    }
}

/// 新图层放在最上面
fn new_layer_entry(
    state: &mut WorkspaceState,
    workspace_id: &str,
    layer_id: &str,
    layer_kind: LayerKind,
) -> LayerOrderEntry {
    let entry = LayerOrderEntry {
        id: new_entity_id(),
        workspace_id: workspace_id.to_string(),
        layer_id: layer_id.to_string(),
        layer_kind,
        sort_order: state.max_layer_sort() + 1,
        updated_at: 0,
    };
    state.layer_order.push(entry.clone());
    state.sort_layers();
    entry
}

fn remove_layer_entry(state: &mut WorkspaceState, layer_id: &str) -> Option<LocalChange> {
    let pos = state.layer_order.iter().position(|e| e.layer_id == layer_id)?;
    let entry = state.layer_order.remove(pos);
    Some(LocalChange::delete(EntityKind::LayerOrder, entry.id))
}

fn deselect<'a>(state: &mut WorkspaceState, ids: impl Iterator<Item = &'a String>) {
    let ids: HashSet<&String> = ids.collect();
    state.selection.retain(|s| !ids.contains(s));
}

fn default_image_settings() -> Settings {
    match json!({ "opacity": 1, "linkDimensions": true, "fit": "custom", "clip": true }) {
        Value::Object(map) => map,
        _ => Settings::new(),
    }
}

/// 给缺少排序项的画板与参考图层补上排序项，追加在当前最大值之后
fn backfill_layer_order(state: &mut WorkspaceState, workspace_id: &str) -> Vec<LocalChange> {
    let existing: HashSet<String> = state.layer_order.iter().map(|e| e.layer_id.clone()).collect();
    let missing: Vec<(String, LayerKind)> = state
        .boards
        .iter()
        .map(|b| (b.id.clone(), LayerKind::Board))
        .chain(state.references.iter().map(|r| (r.id.clone(), LayerKind::Reference)))
        .filter(|(id, _)| !existing.contains(id))
        .collect();

    missing
        .into_iter()
        .map(|(layer_id, kind)| {
            let entry = new_layer_entry(state, workspace_id, &layer_id, kind);
            LocalChange::create(EntityRecord::LayerOrder(entry))
        })
        .collect()
}

async fn read_state(storage: &StorageManager, workspace_id: &str) -> Result<WorkspaceState> {
    let store = storage.entity_store();
    let mut state = WorkspaceState {
        workspace: store.get_workspace(workspace_id).await?,
        boards: store.list_boards(workspace_id).await?,
        references: store.list_references(workspace_id).await?,
        background_images: store.list_background_images(workspace_id).await?,
        layer_order: store.list_layer_order(workspace_id).await?,
        selection: Vec::new(),
    };
    state.sort_layers();
    Ok(state)
}

/// 一个打开的工作区
pub struct WorkspaceSession {
    workspace_id: String,
    state: RwLock<WorkspaceState>,
    /// 串行化命令与刷新，保证回滚不会覆盖其他命令的结果
    dispatch_lock: Mutex<()>,
    storage: Arc<StorageManager>,
    scheduler: Arc<SyncScheduler>,
    listener: CancellationToken,
}

impl WorkspaceSession {
    /// 先读本地（立即可用），补齐图层排序，再启动拉取
    pub async fn load(
        storage: Arc<StorageManager>,
        scheduler: Arc<SyncScheduler>,
        workspace_id: &str,
    ) -> Result<Arc<Self>> {
        if workspace_id.is_empty() {
            return Err(PixelboardError::InvalidArgument("workspace_id 不能为空".to_string()));
        }
        let mut state = read_state(&storage, workspace_id).await?;
        let backfill = backfill_layer_order(&mut state, workspace_id);
        if !backfill.is_empty() {
            info!("工作区 {} 补齐 {} 个图层排序项", workspace_id, backfill.len());
            storage.record_changes(backfill).await?;
            scheduler.schedule_flush();
        }

        let session = Arc::new(Self {
            workspace_id: workspace_id.to_string(),
            state: RwLock::new(state),
            dispatch_lock: Mutex::new(()),
            storage,
            scheduler,
            listener: CancellationToken::new(),
        });
        session.spawn_refresh_listener();
        session.scheduler.start_pull_loop(workspace_id);
        info!("工作区已打开: {}", workspace_id);
        Ok(session)
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    /// 当前状态的快照
    pub fn snapshot(&self) -> WorkspaceState {
        self.state.read().clone()
    }

    pub fn sorted_layer_ids(&self) -> Vec<String> {
        self.state.read().sorted_layer_ids()
    }

    pub fn layer_sort_order(&self, layer_id: &str) -> i64 {
        self.state.read().layer_sort_order(layer_id)
    }

    pub async fn dispatch(&self, command: WorkspaceCommand) -> Result<CommandOutcome> {
        let _serial = self.dispatch_lock.lock().await;

        let (previous, outcome, changes) = {
            let mut state = self.state.write();
            let previous = state.clone();
            let (outcome, changes) = apply_command(&mut state, &self.workspace_id, command)?;
            (previous, outcome, changes)
        };
        if changes.is_empty() {
            return Ok(outcome);
        }

        if let Err(e) = self.storage.record_changes(changes).await {
            warn!("本地写入失败，回滚内存状态: {}", e);
            *self.state.write() = previous;
            return Err(e);
        }
        self.scheduler.schedule_flush();
        Ok(outcome)
    }

    /// 从本地存储重新读取（拉取完成后调用），保留当前选择
    pub async fn refresh(&self) -> Result<()> {
        let _serial = self.dispatch_lock.lock().await;
        let mut fresh = read_state(&self.storage, &self.workspace_id).await?;
        let mut state = self.state.write();
        let live: HashSet<String> = fresh.layer_ids().collect();
        fresh.selection = state.selection.iter().filter(|id| live.contains(*id)).cloned().collect();
        *state = fresh;
        debug!("工作区 {} 已从本地刷新", self.workspace_id);
        Ok(())
    }

    fn spawn_refresh_listener(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let token = self.listener.clone();
        let workspace_id = self.workspace_id.clone();
        let mut rx = self.scheduler.engine().events().subscribe();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = rx.recv() => event,
                };
                match event {
                    Ok(SyncEvent::ReconcileCompleted { workspace_id: ws, .. }) if ws == workspace_id => {
                        let Some(session) = weak.upgrade() else { break };
                        if let Err(e) = session.refresh().await {
                            warn!("拉取后刷新工作区失败 {}: {}", workspace_id, e);
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => debug!("事件接收落后 {} 条", n),
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    /// 关闭工作区：停止定时拉取与刷新监听；未推送的修改仍留在日志里
    pub async fn close(&self) {
        self.listener.cancel();
        self.scheduler.stop_pull_loop(&self.workspace_id).await;
        info!("工作区已关闭: {}", self.workspace_id);
    }
}

//! 数据实体定义 - 对应本地表结构，同时也是与远端交换的行格式
//!
//! 所有实体 id 由客户端生成（UUID v4），本地与远端使用同一 id，
//! 因此 upsert 在远端是幂等的，离线创建也无需等待服务端分配主键。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{PixelboardError, Result};

/// 任意设置项（颜色、透明度、物理单位、相机位姿等），以 JSON 文本落库
pub type Settings = serde_json::Map<String, serde_json::Value>;

/// 生成新的实体 id
pub fn new_entity_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 实体类型（受控枚举，新增需与远端表同步升级）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Workspace,
    CanvasBoard,
    ReferenceLayer,
    BackgroundImage,
    LayerOrder,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Workspace,
        EntityKind::CanvasBoard,
        EntityKind::ReferenceLayer,
        EntityKind::BackgroundImage,
        EntityKind::LayerOrder,
    ];

    /// 挂在某个工作区下、按工作区拉取的类型
    pub const WORKSPACE_SCOPED: [EntityKind; 4] = [
        EntityKind::CanvasBoard,
        EntityKind::ReferenceLayer,
        EntityKind::BackgroundImage,
        EntityKind::LayerOrder,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Workspace => "workspace",
            Self::CanvasBoard => "canvas_board",
            Self::ReferenceLayer => "reference_layer",
            Self::BackgroundImage => "background_image",
            Self::LayerOrder => "layer_order",
        }
    }
}

impl FromStr for EntityKind {
    type Err = PixelboardError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "workspace" => Ok(Self::Workspace),
            "canvas_board" => Ok(Self::CanvasBoard),
            "reference_layer" => Ok(Self::ReferenceLayer),
            "background_image" => Ok(Self::BackgroundImage),
            "layer_order" => Ok(Self::LayerOrder),
            other => Err(PixelboardError::InvalidArgument(format!("未知实体类型: {}", other))),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 待同步操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Create,
    Update,
    Delete,
}

impl SyncAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn is_delete(self) -> bool {
        matches!(self, Self::Delete)
    }
}

impl FromStr for SyncAction {
    type Err = PixelboardError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(PixelboardError::InvalidArgument(format!("未知操作类型: {}", other))),
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// layer_order 中被引用图层的类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Board,
    Reference,
    Image,
}

impl LayerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Board => "board",
            Self::Reference => "reference",
            Self::Image => "image",
        }
    }
}

impl FromStr for LayerKind {
    type Err = PixelboardError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "board" => Ok(Self::Board),
            "reference" => Ok(Self::Reference),
            "image" => Ok(Self::Image),
            other => Err(PixelboardError::InvalidArgument(format!("未知图层类型: {}", other))),
        }
    }
}

/// 工作区 - 对应 workspace 表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    /// 含最近一次相机位姿（`camera`）
    #[serde(default)]
    pub settings: Settings,
    #[serde(default, with = "crate::utils::time::rfc3339_millis")]
    pub updated_at: i64,
}

/// 画板 - 对应 canvas_board 表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasBoard {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub width: f64,
    pub height: f64,
    pub x: f64,
    pub y: f64,
    /// 颜色、透明度、物理尺寸、分辨率
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub sort_order: i64,
    #[serde(default, with = "crate::utils::time::rfc3339_millis")]
    pub updated_at: i64,
}

/// 参考图层 - 对应 reference_layer 表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceLayer {
    pub id: String,
    pub workspace_id: String,
    /// 参考库条目 id
    pub reference_id: String,
    /// 视图变体（front / side / ...）
    #[serde(default)]
    pub view: String,
    pub name: String,
    pub width: f64,
    pub height: f64,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub sort_order: i64,
    #[serde(default, with = "crate::utils::time::rfc3339_millis")]
    pub updated_at: i64,
}

/// 背景图 - 对应 background_image 表，归属于某个画板
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundImage {
    pub id: String,
    pub workspace_id: String,
    pub board_id: String,
    pub image_url: String,
    pub natural_width: f64,
    pub natural_height: f64,
    pub width: f64,
    pub height: f64,
    /// 相对画板的偏移
    pub x: f64,
    pub y: f64,
    /// opacity / fit / clip / tile
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub sort_order: i64,
    #[serde(default, with = "crate::utils::time::rfc3339_millis")]
    pub updated_at: i64,
}

/// 图层排序项 - 对应 layer_order 表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerOrderEntry {
    pub id: String,
    pub workspace_id: String,
    pub layer_id: String,
    pub layer_kind: LayerKind,
    /// 越大越靠上
    pub sort_order: i64,
    #[serde(default, with = "crate::utils::time::rfc3339_millis")]
    pub updated_at: i64,
}

/// 待同步操作 - 对应 pending_operation 表
///
/// 只追加、不原地修改；顺序仅由 `timestamp`（再以 `seq` 打破平局）决定。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// 本地自增序号
    pub seq: i64,
    pub id: String,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub action: SyncAction,
    /// 可选快照，仅用于诊断
    pub payload: Option<serde_json::Value>,
    pub timestamp: i64,
}

/// 任意类型实体的统一包装，供 EntityStore 与远端网关使用
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EntityRecord {
    Workspace(Workspace),
    CanvasBoard(CanvasBoard),
    ReferenceLayer(ReferenceLayer),
    BackgroundImage(BackgroundImage),
    LayerOrder(LayerOrderEntry),
}

impl EntityRecord {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Workspace(_) => EntityKind::Workspace,
            Self::CanvasBoard(_) => EntityKind::CanvasBoard,
            Self::ReferenceLayer(_) => EntityKind::ReferenceLayer,
            Self::BackgroundImage(_) => EntityKind::BackgroundImage,
            Self::LayerOrder(_) => EntityKind::LayerOrder,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Workspace(r) => &r.id,
            Self::CanvasBoard(r) => &r.id,
            Self::ReferenceLayer(r) => &r.id,
            Self::BackgroundImage(r) => &r.id,
            Self::LayerOrder(r) => &r.id,
        }
    }

    /// 所属工作区；工作区本身返回自己的 id
    pub fn workspace_id(&self) -> &str {
        match self {
            Self::Workspace(r) => &r.id,
            Self::CanvasBoard(r) => &r.workspace_id,
            Self::ReferenceLayer(r) => &r.workspace_id,
            Self::BackgroundImage(r) => &r.workspace_id,
            Self::LayerOrder(r) => &r.workspace_id,
        }
    }

    /// 按实体类型解析远端返回的一行
    pub fn from_json(kind: EntityKind, value: serde_json::Value) -> Result<Self> {
        let record = match kind {
            EntityKind::Workspace => Self::Workspace(serde_json::from_value(value)?),
            EntityKind::CanvasBoard => Self::CanvasBoard(serde_json::from_value(value)?),
            EntityKind::ReferenceLayer => Self::ReferenceLayer(serde_json::from_value(value)?),
            EntityKind::BackgroundImage => Self::BackgroundImage(serde_json::from_value(value)?),
            EntityKind::LayerOrder => Self::LayerOrder(serde_json::from_value(value)?),
        };
        Ok(record)
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

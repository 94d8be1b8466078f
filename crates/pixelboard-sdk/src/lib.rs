//! Pixelboard SDK - 本地优先的画布工作区同步引擎
//!
//! 本 SDK 提供：
//! - 💾 本地存储：SQLite 实体表 + 持久化待同步日志，离线可用
//! - 🔁 推送：日志折叠、按实体类型批量 upsert / delete、防抖与退避重试
//! - 📥 拉取：定时对账，跳过仍有本地未推送修改的实体
//! - 🧠 视图模型：`WorkspaceSession` 通过命令修改状态，写穿本地存储
//! - ⚙️ 事件系统：推送与拉取结果通过 broadcast 通知
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use pixelboard_sdk::{LayerPatch, NewBoard, PixelboardConfig, PixelboardSDK, Settings, WorkspaceCommand};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PixelboardConfig::builder()
//!         .data_dir("/path/to/data")
//!         .api_base_url("https://example.supabase.co/rest/v1")
//!         .api_key("anon-key")
//!         .build()?;
//!
//!     let sdk = PixelboardSDK::initialize(config).await?;
//!     let workspace = sdk.create_workspace("海报", Settings::new()).await?;
//!     let session = sdk.open_workspace(&workspace.id).await?;
//!
//!     session
//!         .dispatch(WorkspaceCommand::CreateBoard(NewBoard {
//!             name: "A4".into(),
//!             width: 2480.0,
//!             height: 3508.0,
//!             x: 0.0,
//!             y: 0.0,
//!             settings: Settings::new(),
//!         }))
//!         .await?;
//!
//!     let board_id = session.snapshot().boards[0].id.clone();
//!     session
//!         .dispatch(WorkspaceCommand::UpdateBoard {
//!             id: board_id,
//!             patch: LayerPatch::position(120.0, 80.0),
//!         })
//!         .await?;
//!
//!     sdk.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod sdk;
pub mod storage;
pub mod sync;
pub mod utils;
pub mod version;
pub mod workspace;

pub use config::{HttpClientConfig, PixelboardConfig, PixelboardConfigBuilder, SyncConfig};
pub use error::{PixelboardError, Result};
pub use events::{EventBus, FailedBatch, FlushReport, SyncEvent};
pub use sdk::PixelboardSDK;
pub use storage::entities::{
    BackgroundImage, CanvasBoard, EntityKind, EntityRecord, LayerKind, LayerOrderEntry,
    PendingOperation, ReferenceLayer, Settings, SyncAction, Workspace,
};
pub use storage::queue::{RetryPolicy, SyncFailureReason};
pub use storage::{ApplyOutcome, LocalChange, StorageManager};
pub use sync::{
    FlushOutcome, HttpRemoteGateway, InMemoryGateway, ReconcileReport, RemoteGateway, SyncEngine,
    SyncScheduler,
};
pub use version::{version_string, SDK_VERSION};
pub use workspace::{
    CommandOutcome, LayerPatch, NewBackgroundImage, NewBoard, NewReference, WorkspaceCommand,
    WorkspaceSession, WorkspaceState,
};

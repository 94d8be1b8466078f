//! 同步模块
//!
//! - `collapse`：待同步日志折叠
//! - `gateway`：远端接口；`http_gateway` / `memory_gateway` 两种实现
//! - `sync_engine`：推送与拉取
//! - `scheduler`：防抖推送、退避重试、定时拉取
//! - `state_store`：同步簿记

pub mod collapse;
pub mod gateway;
pub mod http_gateway;
pub mod memory_gateway;
pub mod scheduler;
pub mod state_store;
pub mod sync_engine;

pub use collapse::{collapse, CollapsedOps, EffectiveOperation, KindBatch};
pub use gateway::RemoteGateway;
pub use http_gateway::HttpRemoteGateway;
pub use memory_gateway::InMemoryGateway;
pub use scheduler::SyncScheduler;
pub use state_store::SyncStateStore;
pub use sync_engine::{FlushOutcome, ReconcileReport, SyncEngine};

//! 待同步操作队列
//!
//! - `OperationLog`：持久化、只追加的待同步日志
//! - `RetryPolicy`：连续推送失败时的退避策略

pub mod operation_log;
pub mod retry_policy;

pub use operation_log::{DrainSnapshot, OperationLog};
pub use retry_policy::{RetryPolicy, SyncFailureReason};

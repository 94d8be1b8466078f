//! SDK 错误类型
//!
//! 分类：
//! - 本地存储失败（SQLite / sled / IO / Migration）：直接返回给调用方，不能静默重试
//! - 远端不可用（Transport / Remote / Unauthorized）：在同步引擎边界吞掉并记录日志，等待下一轮重试
//! - 批次部分失败不是错误，体现在 `FlushReport` 中

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PixelboardError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("KV store error: {0}")]
    KvStore(String),

    #[error("IO error: {0}")]
    IO(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Config error: {0}")]
    Config(String),

    /// 网络层错误（连接失败、超时等）
    #[error("Transport error: {0}")]
    Transport(String),

    /// 远端返回非成功状态
    #[error("Remote error [{status}]: {message}")]
    Remote { status: u16, message: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

impl From<serde_json::Error> for PixelboardError {
    fn from(error: serde_json::Error) -> Self {
        PixelboardError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for PixelboardError {
    fn from(error: std::io::Error) -> Self {
        PixelboardError::IO(error.to_string())
    }
}

impl From<sled::Error> for PixelboardError {
    fn from(error: sled::Error) -> Self {
        PixelboardError::KvStore(error.to_string())
    }
}

impl From<reqwest::Error> for PixelboardError {
    fn from(error: reqwest::Error) -> Self {
        match error.status() {
            Some(status) if status.as_u16() == 401 || status.as_u16() == 403 => {
                PixelboardError::Unauthorized(error.to_string())
            }
            Some(status) => PixelboardError::Remote {
                status: status.as_u16(),
                message: error.to_string(),
            },
            None => PixelboardError::Transport(error.to_string()),
        }
    }
}

impl PixelboardError {
    /// 本地持久化层损坏或耗尽，必须立即上报
    pub fn is_local_storage_failure(&self) -> bool {
        matches!(
            self,
            PixelboardError::Sqlite(_)
                | PixelboardError::Database(_)
                | PixelboardError::Migration(_)
                | PixelboardError::KvStore(_)
                | PixelboardError::IO(_)
        )
    }

    /// 远端相关错误，由同步引擎吞掉并等待重试
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            PixelboardError::Transport(_)
                | PixelboardError::Remote { .. }
                | PixelboardError::Unauthorized(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PixelboardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_local_and_remote_errors() {
        assert!(PixelboardError::Database("disk full".into()).is_local_storage_failure());
        assert!(PixelboardError::KvStore("lock".into()).is_local_storage_failure());
        assert!(!PixelboardError::Database("x".into()).is_remote());

        let remote = PixelboardError::Remote { status: 503, message: "busy".into() };
        assert!(remote.is_remote());
        assert!(!remote.is_local_storage_failure());
        assert!(PixelboardError::Transport("timeout".into()).is_remote());
        assert!(PixelboardError::Unauthorized("no token".into()).is_remote());
    }

    #[test]
    fn remote_error_display_includes_status() {
        let err = PixelboardError::Remote { status: 500, message: "boom".into() };
        assert_eq!(err.to_string(), "Remote error [500]: boom");
    }
}

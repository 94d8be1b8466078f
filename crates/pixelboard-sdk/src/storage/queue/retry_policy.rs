use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PixelboardError;

/// 推送失败原因分类
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SyncFailureReason {
    /// 网络不可用 / 超时
    NetworkUnavailable,
    /// 服务端错误
    ServerError(u16),
    /// 未认证，等待会话恢复
    Unauthorized,
    /// 本地存储故障，推送本身无法继续
    LocalStorage,
    Unknown(String),
}

impl SyncFailureReason {
    /// 延迟倍数
    pub fn delay_multiplier(&self) -> f64 {
        match self {
            SyncFailureReason::NetworkUnavailable => 1.0,
            SyncFailureReason::ServerError(code) if *code == 429 => 3.0,
            SyncFailureReason::ServerError(_) => 1.5,
            SyncFailureReason::Unauthorized => 2.0,
            SyncFailureReason::LocalStorage => 4.0,
            SyncFailureReason::Unknown(_) => 1.0,
        }
    }
}

impl From<&PixelboardError> for SyncFailureReason {
    fn from(error: &PixelboardError) -> Self {
        match error {
            PixelboardError::Transport(_) => SyncFailureReason::NetworkUnavailable,
            PixelboardError::Remote { status, .. } => SyncFailureReason::ServerError(*status),
            PixelboardError::Unauthorized(_) => SyncFailureReason::Unauthorized,
            e if e.is_local_storage_failure() => SyncFailureReason::LocalStorage,
            e => SyncFailureReason::Unknown(e.to_string()),
        }
    }
}

/// 连续失败时的退避策略
///
/// 待同步日志永远不会因为失败而丢弃，所以这里没有最大重试次数，只有最大延迟。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 随机抖动因子 (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 3_000,
            max_delay_ms: 5 * 60 * 1000,
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// 第 `consecutive_failures` 次连续失败后的等待时间；0 次失败返回 None
    pub fn delay_for(&self, consecutive_failures: u32, reason: &SyncFailureReason) -> Option<Duration> {
        if consecutive_failures == 0 {
            return None;
        }
        let exp = (consecutive_failures - 1).min(32) as f64;
        let base = self.base_delay_ms as f64 * self.backoff_factor.powf(exp);
        let adjusted = base * reason.delay_multiplier();
        let capped = adjusted.min(self.max_delay_ms as f64);

        let jitter = if self.jitter_factor > 0.0 {
            capped * self.jitter_factor * (rand::random::<f64>() - 0.5)
        } else {
            0.0
        };
        let delay_ms = (capped + jitter).clamp(0.0, self.max_delay_ms as f64);
        Some(Duration::from_millis(delay_ms as u64))
    }
}

//! SDK 配置

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PixelboardError, Result};
use crate::storage::queue::RetryPolicy;

/// HTTP 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpClientConfig {
    /// 连接超时（秒）
    pub connect_timeout_secs: Option<u64>,
    /// 请求超时（秒）
    pub request_timeout_secs: Option<u64>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: Some(10),
            request_timeout_secs: Some(30),
        }
    }
}

/// 同步节奏配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConfig {
    /// 推送防抖窗口（毫秒）
    pub flush_debounce_ms: u64,
    /// 打开工作区期间的定时拉取间隔（毫秒）
    pub pull_interval_ms: u64,
    /// 连续推送失败时的退避
    pub retry: RetryPolicy,
    /// 拉取时删除远端已不存在、且本地没有待同步修改的记录
    pub prune_on_pull: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            flush_debounce_ms: 3_000,
            pull_interval_ms: 5 * 60 * 1000,
            retry: RetryPolicy::default(),
            prune_on_pull: false,
        }
    }
}

/// Pixelboard SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PixelboardConfig {
    /// 数据存储目录（pixelboard.db 与 kv/ 都在这里）
    pub data_dir: PathBuf,
    /// 只使用内存存储（不落盘），用于演示与测试
    pub memory_only: bool,
    /// 远端 REST 接口根地址
    pub api_base_url: String,
    /// 网关要求的 apikey 头
    pub api_key: Option<String>,
    /// 用户会话令牌，由外部认证模块提供
    pub access_token: Option<String>,
    pub sync: SyncConfig,
    pub http: HttpClientConfig,
}

impl Default for PixelboardConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./pixelboard_data"),
            memory_only: false,
            api_base_url: "http://localhost:54321/rest/v1".to_string(),
            api_key: None,
            access_token: None,
            sync: SyncConfig::default(),
            http: HttpClientConfig::default(),
        }
    }
}

impl PixelboardConfig {
    pub fn builder() -> PixelboardConfigBuilder {
        PixelboardConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if !self.memory_only && self.data_dir.as_os_str().is_empty() {
            return Err(PixelboardError::Config("数据目录不能为空".to_string()));
        }
        if self.api_base_url.trim().is_empty() {
            return Err(PixelboardError::Config("api_base_url 不能为空".to_string()));
        }
        if self.sync.flush_debounce_ms == 0 {
            return Err(PixelboardError::Config("flush_debounce_ms 必须大于 0".to_string()));
        }
        if self.sync.pull_interval_ms == 0 {
            return Err(PixelboardError::Config("pull_interval_ms 必须大于 0".to_string()));
        }
        let retry = &self.sync.retry;
        if retry.backoff_factor < 1.0 || !(0.0..=1.0).contains(&retry.jitter_factor) {
            return Err(PixelboardError::Config("退避参数不合法".to_string()));
        }
        Ok(())
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct PixelboardConfigBuilder {
    config: PixelboardConfig,
}

impl PixelboardConfigBuilder {
    pub fn new() -> Self {
        Self { config: PixelboardConfig::default() }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn memory_only(mut self, enabled: bool) -> Self {
        self.config.memory_only = enabled;
        self
    }

    pub fn api_base_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.api_base_url = url.into();
        self
    }

    pub fn api_key<S: Into<String>>(mut self, key: S) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn access_token<S: Into<String>>(mut self, token: S) -> Self {
        self.config.access_token = Some(token.into());
        self
    }

    pub fn flush_debounce_ms(mut self, ms: u64) -> Self {
        self.config.sync.flush_debounce_ms = ms;
        self
    }

    pub fn pull_interval_ms(mut self, ms: u64) -> Self {
        self.config.sync.pull_interval_ms = ms;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.sync.retry = policy;
        self
    }

    pub fn prune_on_pull(mut self, enabled: bool) -> Self {
        self.config.sync.prune_on_pull = enabled;
        self
    }

    pub fn http_client_config(mut self, config: HttpClientConfig) -> Self {
        self.config.http = config;
        self
    }

    pub fn build(self) -> Result<PixelboardConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

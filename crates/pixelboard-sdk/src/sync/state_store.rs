//! 同步簿记 - 最近一次成功推送/拉取的时间
//!
//! Key 格式：`sync_state:last_flush`、`sync_state:last_pull:{workspace_id}`

use std::sync::Arc;

use crate::error::Result;
use crate::storage::kv::KvStore;

const PREFIX: &str = "sync_state";

#[derive(Debug, Clone)]
pub struct SyncStateStore {
    kv: Arc<KvStore>,
}

impl SyncStateStore {
    pub fn new(kv: Arc<KvStore>) -> Self {
        Self { kv }
    }

    fn flush_key() -> String {
        format!("{}:last_flush", PREFIX)
    }

    fn pull_key(workspace_id: &str) -> String {
        format!("{}:last_pull:{}", PREFIX, workspace_id)
    }

    pub async fn record_flush(&self, timestamp: i64) -> Result<()> {
        self.kv.set(Self::flush_key().as_str(), &timestamp).await
    }

    pub async fn last_flush(&self) -> Result<Option<i64>> {
        self.kv.get::<&str, i64>(Self::flush_key().as_str()).await
    }

    pub async fn record_pull(&self, workspace_id: &str, timestamp: i64) -> Result<()> {
        self.kv.set(Self::pull_key(workspace_id).as_str(), &timestamp).await
    }

    pub async fn last_pull(&self, workspace_id: &str) -> Result<Option<i64>> {
        self.kv.get::<&str, i64>(Self::pull_key(workspace_id).as_str()).await
    }

    /// 删除工作区后清理它的拉取记录
    pub async fn forget_workspace(&self, workspace_id: &str) -> Result<()> {
        self.kv.delete(Self::pull_key(workspace_id).as_str()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_format() {
        assert_eq!(SyncStateStore::flush_key(), "sync_state:last_flush");
        assert_eq!(SyncStateStore::pull_key("w1"), "sync_state:last_pull:w1");
    }

    #[tokio::test]
    async fn records_timestamps() {
        let store = SyncStateStore::new(Arc::new(KvStore::temporary().unwrap()));
        assert_eq!(store.last_pull("w1").await.unwrap(), None);

        store.record_pull("w1", 100).await.unwrap();
        store.record_flush(200).await.unwrap();
        assert_eq!(store.last_pull("w1").await.unwrap(), Some(100));
        assert_eq!(store.last_pull("w2").await.unwrap(), None);
        assert_eq!(store.last_flush().await.unwrap(), Some(200));

        store.forget_workspace("w1").await.unwrap();
        assert_eq!(store.last_pull("w1").await.unwrap(), None);
    }
}

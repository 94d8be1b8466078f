//! KV 存储模块 - 基于 sled 的键值存储
//!
//! 存放同步簿记（上次拉取/推送时间等），不存放实体本身。

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::debug;

use crate::error::{PixelboardError, Result};

const SYNC_TREE: &str = "sync_meta";

#[derive(Debug, Clone)]
pub struct KvStore {
    db: Db,
    tree: Tree,
}

impl KvStore {
    /// 打开 `{base_path}/kv`
    pub async fn new(base_path: &Path) -> Result<Self> {
        let kv_path = base_path.join("kv");
        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| PixelboardError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        // 上一个实例可能刚释放文件锁，带退避重试
        const MAX_OPEN_RETRIES: u32 = 5;
        const RETRY_DELAY_MS: u64 = 100;
        let mut attempt = 0;
        let db = loop {
            match sled::open(&kv_path) {
                Ok(db) => break db,
                Err(e) => {
                    let msg = e.to_string();
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    attempt += 1;
                    if !is_lock || attempt >= MAX_OPEN_RETRIES {
                        return Err(PixelboardError::KvStore(format!("打开 sled 数据库失败: {}", e)));
                    }
                    debug!("sled 被占用，第 {} 次重试", attempt);
                    tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS << attempt)).await;
                }
            }
        };
        Self::from_db(db)
    }

    /// 临时库（关闭即删除），用于内存模式与测试
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self> {
        let tree = db.open_tree(SYNC_TREE)?;
        Ok(Self { db, tree })
    }

    pub async fn set<K, V>(&self, key: K, value: &V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| PixelboardError::Serialization(format!("序列化值失败: {}", e)))?;
        self.tree.insert(key, bytes)?;
        Ok(())
    }

    pub async fn get<K, V>(&self, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: for<'de> Deserialize<'de>,
    {
        match self.tree.get(key)? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| PixelboardError::Serialization(format!("反序列化值失败: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn delete<K>(&self, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        Ok(self.tree.remove(key)?.is_some())
    }

    pub async fn scan_prefix<V>(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, V)>>
    where
        V: for<'de> Deserialize<'de>,
    {
        let mut results = Vec::new();
        for item in self.tree.scan_prefix(prefix) {
            let (key, bytes) = item?;
            let value = serde_json::from_slice(&bytes)
                .map_err(|e| PixelboardError::Serialization(format!("反序列化值失败: {}", e)))?;
            results.push((key.to_vec(), value));
        }
        Ok(results)
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn basic_operations() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path()).await.unwrap();

        store.set("last_pull:w1", &42i64).await.unwrap();
        let v: Option<i64> = store.get("last_pull:w1").await.unwrap();
        assert_eq!(v, Some(42));

        assert!(store.delete("last_pull:w1").await.unwrap());
        let v: Option<i64> = store.get("last_pull:w1").await.unwrap();
        assert!(v.is_none());
    }

    #[tokio::test]
    async fn scan_prefix_returns_matching_keys() {
        let store = KvStore::temporary().unwrap();
        store.set("a:1", &1i64).await.unwrap();
        store.set("a:2", &2i64).await.unwrap();
        store.set("b:1", &3i64).await.unwrap();

        let results: Vec<(Vec<u8>, i64)> = store.scan_prefix(b"a:").await.unwrap();
        assert_eq!(results.len(), 2);
    }
}

//! 进程内远端 - 离线演示与测试用
//!
//! 支持按类型注入失败、整体离线、模拟延迟，并记录每次调用。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{PixelboardError, Result};
use crate::storage::entities::{EntityKind, EntityRecord};
use crate::sync::gateway::RemoteGateway;

/// 一次批量调用
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertCall {
    pub kind: EntityKind,
    pub records: Vec<EntityRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteCall {
    pub kind: EntityKind,
    pub ids: Vec<String>,
}

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<EntityKind, BTreeMap<String, EntityRecord>>,
    offline: bool,
    failing: HashSet<EntityKind>,
    latency: Option<Duration>,
    upsert_calls: Vec<UpsertCall>,
    delete_calls: Vec<DeleteCall>,
    list_calls: usize,
}

#[derive(Debug, Default)]
pub struct InMemoryGateway {
    inner: Mutex<Inner>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// 离线时所有调用返回 Transport 错误
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().offline = offline;
    }

    /// 让某类型的所有调用返回 500
    pub fn fail_kind(&self, kind: EntityKind, failing: bool) {
        let mut inner = self.inner.lock();
        if failing {
            inner.failing.insert(kind);
        } else {
            inner.failing.remove(&kind);
        }
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.inner.lock().latency = latency;
    }

    /// 直接写入远端（模拟其他设备的修改）
    pub fn insert_remote(&self, record: EntityRecord) {
        let mut inner = self.inner.lock();
        inner
            .tables
            .entry(record.kind())
            .or_default()
            .insert(record.id().to_string(), record);
    }

    pub fn remove_remote(&self, kind: EntityKind, id: &str) {
        if let Some(table) = self.inner.lock().tables.get_mut(&kind) {
            table.remove(id);
        }
    }

    pub fn remote_record(&self, kind: EntityKind, id: &str) -> Option<EntityRecord> {
        self.inner.lock().tables.get(&kind).and_then(|t| t.get(id).cloned())
    }

    pub fn remote_count(&self, kind: EntityKind) -> usize {
        self.inner.lock().tables.get(&kind).map_or(0, |t| t.len())
    }

    pub fn upsert_calls(&self) -> Vec<UpsertCall> {
        self.inner.lock().upsert_calls.clone()
    }

    pub fn delete_calls(&self) -> Vec<DeleteCall> {
        self.inner.lock().delete_calls.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.inner.lock().list_calls
    }

    /// 某实体出现在多少次 upsert 调用里
    pub fn upsert_count_for(&self, id: &str) -> usize {
        self.inner
            .lock()
            .upsert_calls
            .iter()
            .filter(|c| c.records.iter().any(|r| r.id() == id))
            .count()
    }

    pub fn reset_calls(&self) {
        let mut inner = self.inner.lock();
        inner.upsert_calls.clear();
        inner.delete_calls.clear();
        inner.list_calls = 0;
    }

    /// 检查可用性；返回本次调用需要模拟的延迟
    fn check(&self, kind: EntityKind) -> Result<Option<Duration>> {
        let inner = self.inner.lock();
        if inner.offline {
            return Err(PixelboardError::Transport("in-memory gateway offline".to_string()));
        }
        if inner.failing.contains(&kind) {
            return Err(PixelboardError::Remote {
                status: 500,
                message: format!("injected failure for {}", kind),
            });
        }
        Ok(inner.latency)
    }
}

async fn simulate(latency: Option<Duration>) {
    if let Some(d) = latency {
        tokio::time::sleep(d).await;
    }
}

#[async_trait]
impl RemoteGateway for InMemoryGateway {
    async fn bulk_upsert(&self, kind: EntityKind, records: Vec<EntityRecord>) -> Result<()> {
        simulate(self.check(kind)?).await;
        let mut inner = self.inner.lock();
        inner.upsert_calls.push(UpsertCall { kind, records: records.clone() });
        let table = inner.tables.entry(kind).or_default();
        for record in records {
            table.insert(record.id().to_string(), record);
        }
        debug!("in-memory upsert {}: {} 条", kind, table.len());
        Ok(())
    }

    async fn bulk_delete(&self, kind: EntityKind, ids: Vec<String>) -> Result<()> {
        simulate(self.check(kind)?).await;
        let mut inner = self.inner.lock();
        inner.delete_calls.push(DeleteCall { kind, ids: ids.clone() });
        if let Some(table) = inner.tables.get_mut(&kind) {
            for id in &ids {
                table.remove(id);
            }
        }
        Ok(())
    }

    async fn list(&self, kind: EntityKind, workspace_id: &str) -> Result<Vec<EntityRecord>> {
        simulate(self.check(kind)?).await;
        let mut inner = self.inner.lock();
        inner.list_calls += 1;
        let records = inner
            .tables
            .get(&kind)
            .map(|t| {
                t.values()
                    .filter(|r| r.workspace_id() == workspace_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(records)
    }
}

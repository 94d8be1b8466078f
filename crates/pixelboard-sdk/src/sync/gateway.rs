//! 远端网关接口
//!
//! 每个实体类型对应远端一张表；upsert 以客户端生成的 id 为准（insert-or-replace）。
//! 认证由外部模块负责，网关只携带令牌。

use async_trait::async_trait;

use crate::error::Result;
use crate::storage::entities::{EntityKind, EntityRecord, Workspace};

#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// 批量 upsert，同一 id 重复提交结果相同
    async fn bulk_upsert(&self, kind: EntityKind, records: Vec<EntityRecord>) -> Result<()>;

    /// 批量删除；远端不存在的 id 视为成功
    async fn bulk_delete(&self, kind: EntityKind, ids: Vec<String>) -> Result<()>;

    /// 某工作区下该类型的全部记录；`Workspace` 类型返回该工作区本身
    async fn list(&self, kind: EntityKind, workspace_id: &str) -> Result<Vec<EntityRecord>>;

    async fn get_workspace(&self, workspace_id: &str) -> Result<Option<Workspace>> {
        let records = self.list(EntityKind::Workspace, workspace_id).await?;
        Ok(records.into_iter().find_map(|r| match r {
            EntityRecord::Workspace(ws) => Some(ws),
            _ => None,
        }))
    }
}

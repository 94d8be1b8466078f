//! 待同步日志 DAO - pending_operation 表

use rusqlite::{params, params_from_iter, Connection, Row};

use super::parse_column;
use crate::error::Result;
use crate::storage::entities::{EntityKind, PendingOperation};

const COLUMNS: &str = "seq, id, entity_kind, entity_id, action, payload, timestamp";

/// 单条 SQL 中 IN 列表的上限，低于 SQLite 默认变量上限
const IN_CHUNK: usize = 500;

pub struct PendingOperationDao<'a> {
    conn: &'a Connection,
}

impl<'a> PendingOperationDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// 追加一条记录，返回本地 seq
    pub fn insert(&self, op: &PendingOperation) -> Result<i64> {
        let payload = match &op.payload {
            Some(v) => Some(serde_json::to_string(v)?),
            None => None,
        };
        self.conn.execute(
            "INSERT INTO pending_operation (id, entity_kind, entity_id, action, payload, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                op.id,
                op.entity_kind.as_str(),
                op.entity_id,
                op.action.as_str(),
                payload,
                op.timestamp
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// 全部记录，按 timestamp 升序，同一时间戳按 seq
    pub fn list_ordered(&self) -> Result<Vec<PendingOperation>> {
        let sql = format!(
            "SELECT {} FROM pending_operation ORDER BY timestamp ASC, seq ASC",
            COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_operation)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// 删除给定实体 id 中 seq <= max_seq 的记录，返回删除条数
    pub fn delete_by_entity_ids(&self, entity_ids: &[String], max_seq: i64) -> Result<usize> {
        let mut removed = 0usize;
        for chunk in entity_ids.chunks(IN_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "DELETE FROM pending_operation WHERE seq <= ? AND entity_id IN ({})",
                placeholders
            );
            let mut values: Vec<rusqlite::types::Value> = Vec::with_capacity(chunk.len() + 1);
            values.push(max_seq.into());
            values.extend(chunk.iter().map(|id| id.clone().into()));
            removed += self.conn.execute(&sql, params_from_iter(values))?;
        }
        Ok(removed)
    }

    pub fn count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM pending_operation", [], |r| r.get(0))?;
        Ok(n as u64)
    }

    /// 仍有未同步记录的实体 id（可按类型过滤）
    pub fn distinct_entity_ids(&self, kind: Option<EntityKind>) -> Result<Vec<String>> {
        let ids = match kind {
            Some(kind) => {
                let mut stmt = self.conn.prepare(
                    "SELECT DISTINCT entity_id FROM pending_operation WHERE entity_kind = ?1",
                )?;
                let rows = stmt.query_map(params![kind.as_str()], |r| r.get::<_, String>(0))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = self
                    .conn
                    .prepare("SELECT DISTINCT entity_id FROM pending_operation")?;
                let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(ids)
    }

    pub fn max_timestamp(&self) -> Result<Option<i64>> {
        let ts: Option<i64> = self
            .conn
            .query_row("SELECT MAX(timestamp) FROM pending_operation", [], |r| r.get(0))?;
        Ok(ts)
    }
}

fn row_to_operation(row: &Row<'_>) -> rusqlite::Result<PendingOperation> {
    let payload: Option<String> = row.get(5)?;
    let payload = match payload {
        Some(text) => Some(serde_json::from_str(&text).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?),
        None => None,
    };
    Ok(PendingOperation {
        seq: row.get(0)?,
        id: row.get(1)?,
        entity_kind: parse_column(2, row.get(2)?)?,
        entity_id: row.get(3)?,
        action: parse_column(4, row.get(4)?)?,
        payload,
        timestamp: row.get(6)?,
    })
}

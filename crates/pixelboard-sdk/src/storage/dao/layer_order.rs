//! 图层排序 DAO - layer_order 表

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::parse_column;
use crate::error::Result;
use crate::storage::entities::LayerOrderEntry;

const COLUMNS: &str = "id, workspace_id, layer_id, layer_kind, sort_order, updated_at";

pub struct LayerOrderDao<'a> {
    conn: &'a Connection,
}

impl<'a> LayerOrderDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, id: &str) -> Result<Option<LayerOrderEntry>> {
        let sql = format!("SELECT {} FROM layer_order WHERE id = ?1", COLUMNS);
        Ok(self.conn.query_row(&sql, params![id], row_to_entry).optional()?)
    }

    pub fn upsert(&self, e: &LayerOrderEntry) -> Result<()> {
        let sql = r#"
            INSERT INTO layer_order (id, workspace_id, layer_id, layer_kind, sort_order, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                workspace_id = excluded.workspace_id,
                layer_id = excluded.layer_id,
                layer_kind = excluded.layer_kind,
                sort_order = excluded.sort_order,
                updated_at = excluded.updated_at
        "#;
        self.conn.execute(
            sql,
            params![
                e.id,
                e.workspace_id,
                e.layer_id,
                e.layer_kind.as_str(),
                e.sort_order,
                e.updated_at
            ],
        )?;
        Ok(())
    }

    pub fn list_by_workspace(&self, workspace_id: &str) -> Result<Vec<LayerOrderEntry>> {
        let sql = format!(
            "SELECT {} FROM layer_order WHERE workspace_id = ?1 ORDER BY sort_order DESC",
            COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![workspace_id], row_to_entry)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// 当前最大 sort_order；空表返回 0
    pub fn max_sort_order(&self, workspace_id: &str) -> Result<i64> {
        let max: Option<i64> = self.conn.query_row(
            "SELECT MAX(sort_order) FROM layer_order WHERE workspace_id = ?1",
            params![workspace_id],
            |r| r.get(0),
        )?;
        Ok(max.unwrap_or(0))
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        self.conn.execute("DELETE FROM layer_order WHERE id = ?1", params![id])?;
        Ok(())
    }
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<LayerOrderEntry> {
    Ok(LayerOrderEntry {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        layer_id: row.get(2)?,
        layer_kind: parse_column(3, row.get(3)?)?,
        sort_order: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

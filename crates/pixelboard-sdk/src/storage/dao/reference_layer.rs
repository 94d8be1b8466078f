//! 参考图层 DAO - reference_layer 表

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{settings_from_sql, settings_to_sql};
use crate::error::Result;
use crate::storage::entities::ReferenceLayer;

const COLUMNS: &str =
    "id, workspace_id, reference_id, view, name, width, height, x, y, settings, sort_order, updated_at";

const UPSERT_SQL: &str = r#"
    INSERT INTO reference_layer (
        id, workspace_id, reference_id, view, name, width, height, x, y, settings, sort_order, updated_at
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
    ON CONFLICT(id) DO UPDATE SET
        workspace_id = excluded.workspace_id,
        reference_id = excluded.reference_id,
        view = excluded.view,
        name = excluded.name,
        width = excluded.width,
        height = excluded.height,
        x = excluded.x,
        y = excluded.y,
        settings = excluded.settings,
        sort_order = excluded.sort_order,
        updated_at = excluded.updated_at
"#;

pub struct ReferenceLayerDao<'a> {
    conn: &'a Connection,
}

impl<'a> ReferenceLayerDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, id: &str) -> Result<Option<ReferenceLayer>> {
        let sql = format!("SELECT {} FROM reference_layer WHERE id = ?1", COLUMNS);
        Ok(self.conn.query_row(&sql, params![id], row_to_reference).optional()?)
    }

    pub fn upsert(&self, r: &ReferenceLayer) -> Result<()> {
        self.conn.execute(
            UPSERT_SQL,
            params![
                r.id,
                r.workspace_id,
                r.reference_id,
                r.view,
                r.name,
                r.width,
                r.height,
                r.x,
                r.y,
                settings_to_sql(&r.settings)?,
                r.sort_order,
                r.updated_at
            ],
        )?;
        Ok(())
    }

    pub fn list_by_workspace(&self, workspace_id: &str) -> Result<Vec<ReferenceLayer>> {
        let sql = format!(
            "SELECT {} FROM reference_layer WHERE workspace_id = ?1 ORDER BY sort_order DESC",
            COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![workspace_id], row_to_reference)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        self.conn.execute("DELETE FROM reference_layer WHERE id = ?1", params![id])?;
        Ok(())
    }
}

fn row_to_reference(row: &Row<'_>) -> rusqlite::Result<ReferenceLayer> {
    Ok(ReferenceLayer {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        reference_id: row.get(2)?,
        view: row.get(3)?,
        name: row.get(4)?,
        width: row.get(5)?,
        height: row.get(6)?,
        x: row.get(7)?,
        y: row.get(8)?,
        settings: settings_from_sql(9, row.get(9)?)?,
        sort_order: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

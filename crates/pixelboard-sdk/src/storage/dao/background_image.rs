//! 背景图 DAO - background_image 表

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{settings_from_sql, settings_to_sql};
use crate::error::Result;
use crate::storage::entities::BackgroundImage;

const COLUMNS: &str = "id, workspace_id, board_id, image_url, natural_width, natural_height, \
                       width, height, x, y, settings, sort_order, updated_at";

const UPSERT_SQL: &str = r#"
    INSERT INTO background_image (
        id, workspace_id, board_id, image_url, natural_width, natural_height,
        width, height, x, y, settings, sort_order, updated_at
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
    ON CONFLICT(id) DO UPDATE SET
        workspace_id = excluded.workspace_id,
        board_id = excluded.board_id,
        image_url = excluded.image_url,
        natural_width = excluded.natural_width,
        natural_height = excluded.natural_height,
        width = excluded.width,
        height = excluded.height,
        x = excluded.x,
        y = excluded.y,
        settings = excluded.settings,
        sort_order = excluded.sort_order,
        updated_at = excluded.updated_at
"#;

pub struct BackgroundImageDao<'a> {
    conn: &'a Connection,
}

impl<'a> BackgroundImageDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, id: &str) -> Result<Option<BackgroundImage>> {
        let sql = format!("SELECT {} FROM background_image WHERE id = ?1", COLUMNS);
        Ok(self.conn.query_row(&sql, params![id], row_to_image).optional()?)
    }

    pub fn upsert(&self, i: &BackgroundImage) -> Result<()> {
        self.conn.execute(
            UPSERT_SQL,
            params![
                i.id,
                i.workspace_id,
                i.board_id,
                i.image_url,
                i.natural_width,
                i.natural_height,
                i.width,
                i.height,
                i.x,
                i.y,
                settings_to_sql(&i.settings)?,
                i.sort_order,
                i.updated_at
            ],
        )?;
        Ok(())
    }

    /// 按画板分组，组内按 sort_order 降序
    pub fn list_by_workspace(&self, workspace_id: &str) -> Result<Vec<BackgroundImage>> {
        let sql = format!(
            "SELECT {} FROM background_image WHERE workspace_id = ?1 ORDER BY board_id ASC, sort_order DESC",
            COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![workspace_id], row_to_image)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        self.conn.execute("DELETE FROM background_image WHERE id = ?1", params![id])?;
        Ok(())
    }
}

fn row_to_image(row: &Row<'_>) -> rusqlite::Result<BackgroundImage> {
    Ok(BackgroundImage {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        board_id: row.get(2)?,
        image_url: row.get(3)?,
        natural_width: row.get(4)?,
        natural_height: row.get(5)?,
        width: row.get(6)?,
        height: row.get(7)?,
        x: row.get(8)?,
        y: row.get(9)?,
        settings: settings_from_sql(10, row.get(10)?)?,
        sort_order: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

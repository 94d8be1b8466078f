//! 画板 DAO - canvas_board 表

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{settings_from_sql, settings_to_sql};
use crate::error::Result;
use crate::storage::entities::CanvasBoard;

const COLUMNS: &str = "id, workspace_id, name, width, height, x, y, settings, sort_order, updated_at";

const UPSERT_SQL: &str = r#"
    INSERT INTO canvas_board (id, workspace_id, name, width, height, x, y, settings, sort_order, updated_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
    ON CONFLICT(id) DO UPDATE SET
        workspace_id = excluded.workspace_id,
        name = excluded.name,
        width = excluded.width,
        height = excluded.height,
        x = excluded.x,
        y = excluded.y,
        settings = excluded.settings,
        sort_order = excluded.sort_order,
        updated_at = excluded.updated_at
"#;

pub struct CanvasBoardDao<'a> {
    conn: &'a Connection,
}

impl<'a> CanvasBoardDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, id: &str) -> Result<Option<CanvasBoard>> {
        let sql = format!("SELECT {} FROM canvas_board WHERE id = ?1", COLUMNS);
        Ok(self.conn.query_row(&sql, params![id], row_to_board).optional()?)
    }

    pub fn upsert(&self, b: &CanvasBoard) -> Result<()> {
        self.conn.execute(
            UPSERT_SQL,
            params![
                b.id,
                b.workspace_id,
                b.name,
                b.width,
                b.height,
                b.x,
                b.y,
                settings_to_sql(&b.settings)?,
                b.sort_order,
                b.updated_at
            ],
        )?;
        Ok(())
    }

    /// 按 sort_order 降序（上层在前）
    pub fn list_by_workspace(&self, workspace_id: &str) -> Result<Vec<CanvasBoard>> {
        let sql = format!(
            "SELECT {} FROM canvas_board WHERE workspace_id = ?1 ORDER BY sort_order DESC",
            COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![workspace_id], row_to_board)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        self.conn.execute("DELETE FROM canvas_board WHERE id = ?1", params![id])?;
        Ok(())
    }
}

fn row_to_board(row: &Row<'_>) -> rusqlite::Result<CanvasBoard> {
    Ok(CanvasBoard {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        name: row.get(2)?,
        width: row.get(3)?,
        height: row.get(4)?,
        x: row.get(5)?,
        y: row.get(6)?,
        settings: settings_from_sql(7, row.get(7)?)?,
        sort_order: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::dao::test_connection;

    fn board(id: &str, sort_order: i64) -> CanvasBoard {
        CanvasBoard {
            id: id.into(),
            workspace_id: "w1".into(),
            name: format!("Board {}", id),
            width: 1920.0,
            height: 1080.0,
            x: 0.0,
            y: 0.0,
            settings: Default::default(),
            sort_order,
            updated_at: 0,
        }
    }

    #[test]
    fn list_orders_by_rank_descending() {
        let conn = test_connection();
        let dao = CanvasBoardDao::new(&conn);
        for b in [board("a", 1), board("b", 3), board("c", 2)] {
            dao.upsert(&b).unwrap();
        }

        let ids: Vec<_> = dao
            .list_by_workspace("w1")
            .unwrap()
            .into_iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
        assert!(dao.list_by_workspace("other").unwrap().is_empty());
    }

    #[test]
    fn upsert_replaces_whole_record() {
        let conn = test_connection();
        let dao = CanvasBoardDao::new(&conn);
        dao.upsert(&board("a", 1)).unwrap();

        let mut moved = board("a", 1);
        moved.x = 150.0;
        moved.y = -40.0;
        dao.upsert(&moved).unwrap();

        assert_eq!(dao.get("a").unwrap().unwrap(), moved);
        dao.delete("a").unwrap();
        assert!(dao.get("a").unwrap().is_none());
    }
}

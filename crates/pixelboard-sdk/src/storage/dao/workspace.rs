//! 工作区 DAO - workspace 表

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{settings_from_sql, settings_to_sql};
use crate::error::Result;
use crate::storage::entities::Workspace;

const COLUMNS: &str = "id, name, settings, updated_at";

pub struct WorkspaceDao<'a> {
    conn: &'a Connection,
}

impl<'a> WorkspaceDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, id: &str) -> Result<Option<Workspace>> {
        let sql = format!("SELECT {} FROM workspace WHERE id = ?1", COLUMNS);
        let ws = self
            .conn
            .query_row(&sql, params![id], row_to_workspace)
            .optional()?;
        Ok(ws)
    }

    pub fn upsert(&self, ws: &Workspace) -> Result<()> {
        let sql = r#"
            INSERT INTO workspace (id, name, settings, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                settings = excluded.settings,
                updated_at = excluded.updated_at
        "#;
        self.conn.execute(
            sql,
            params![ws.id, ws.name, settings_to_sql(&ws.settings)?, ws.updated_at],
        )?;
        Ok(())
    }

    /// 最近修改的在前
    pub fn list(&self) -> Result<Vec<Workspace>> {
        let sql = format!("SELECT {} FROM workspace ORDER BY updated_at DESC", COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_workspace)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        self.conn.execute("DELETE FROM workspace WHERE id = ?1", params![id])?;
        Ok(())
    }
}

fn row_to_workspace(row: &Row<'_>) -> rusqlite::Result<Workspace> {
    Ok(Workspace {
        id: row.get(0)?,
        name: row.get(1)?,
        settings: settings_from_sql(2, row.get(2)?)?,
        updated_at: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::dao::test_connection;
    use serde_json::json;

    #[test]
    fn upsert_get_and_list() {
        let conn = test_connection();
        let dao = WorkspaceDao::new(&conn);

        let mut ws = Workspace {
            id: "w1".into(),
            name: "Moodboard".into(),
            settings: Default::default(),
            updated_at: 10,
        };
        dao.upsert(&ws).unwrap();
        ws.settings.insert("camera".into(), json!({"x": 1, "y": 2, "zoom": 1.5}));
        ws.updated_at = 20;
        dao.upsert(&ws).unwrap();

        let loaded = dao.get("w1").unwrap().unwrap();
        assert_eq!(loaded, ws);
        assert_eq!(dao.list().unwrap().len(), 1);

        dao.delete("w1").unwrap();
        assert!(dao.get("w1").unwrap().is_none());
    }
}

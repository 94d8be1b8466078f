//! 数据访问层 (DAO) - 每张表一个模块，借用同一个 `&Connection`

pub mod workspace;
pub mod canvas_board;
pub mod reference_layer;
pub mod background_image;
pub mod layer_order;
pub mod pending_operation;

pub use workspace::WorkspaceDao;
pub use canvas_board::CanvasBoardDao;
pub use reference_layer::ReferenceLayerDao;
pub use background_image::BackgroundImageDao;
pub use layer_order::LayerOrderDao;
pub use pending_operation::PendingOperationDao;

use rusqlite::types::Type;
use rusqlite::Connection;

use crate::error::{PixelboardError, Result};
use crate::storage::entities::Settings;

/// 事务管理器 - 跨表写入（实体 + 待同步日志）放在同一事务里
pub struct TransactionManager<'a> {
    conn: &'a Connection,
}

impl<'a> TransactionManager<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn execute<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(|e| PixelboardError::Database(format!("开始事务失败: {}", e)))?;

        let result = f(self.conn)?;

        tx.commit()
            .map_err(|e| PixelboardError::Database(format!("提交事务失败: {}", e)))?;

        Ok(result)
    }
}

pub(crate) fn settings_to_sql(settings: &Settings) -> Result<String> {
    Ok(serde_json::to_string(settings)?)
}

pub(crate) fn settings_from_sql(idx: usize, text: String) -> rusqlite::Result<Settings> {
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// 把枚举解析错误转成 rusqlite 行映射错误
pub(crate) fn parse_column<T>(idx: usize, text: String) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = PixelboardError>,
{
    text.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[cfg(test)]
pub(crate) fn test_connection() -> Connection {
    let mut conn = Connection::open_in_memory().unwrap();
    crate::storage::migrate::init_db(&mut conn).unwrap();
    conn
}

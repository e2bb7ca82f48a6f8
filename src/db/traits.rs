// Database Types
// Result values and the error type shared by every backend driver

use serde::{Deserialize, Serialize};

use crate::db::native::NativeError;

/// Common database error type
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// Native handle allocation or connect failure.
    #[error("Connection failed: {0}")]
    ConnectionError(NativeError),

    #[error("Not connected")]
    NotConnected,

    /// The database never acquired its environment handle.
    #[error("No environment handle available")]
    NoEnvironment,

    #[error("Statement has not been prepared")]
    NotPrepared,

    #[error(transparent)]
    Native(#[from] NativeError),

    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Column information from query results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub ordinal_position: i32,
}

/// Cell value in a result set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    DateTime(String),
    Binary(Vec<u8>),
}

/// Fully materialized result of a query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Vec<CellValue>>,
    pub row_count: usize,
    pub execution_time_ms: u64,
}

impl QueryResult {
    pub fn new(columns: Vec<ColumnInfo>, rows: Vec<Vec<CellValue>>) -> Self {
        Self {
            row_count: rows.len(),
            columns,
            rows,
            execution_time_ms: 0,
        }
    }

    /// Position of the column called `name`, ignoring case.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }
}

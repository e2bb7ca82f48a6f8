// Database Module
// Databases, connections and the native clients behind them

pub mod config;
pub mod connection;
pub mod connection_string;
pub mod database;
pub mod drivers;
pub mod native;
pub mod traits;

pub use config::{ConnectionParams, DataSourceConfig, DataSources};
pub use connection::{Connection, ConnectionState, Query, Statement};
pub use database::{Database, OdbcDatabase};
pub use drivers::{MssqlModule, SqliteModule};
pub use traits::{CellValue, ColumnInfo, DatabaseError, QueryResult};

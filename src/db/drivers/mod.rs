// Database Drivers
// Driver modules for each supported backend

pub mod mssql;
pub mod sqlite;

pub use mssql::MssqlModule;
pub use sqlite::SqliteModule;

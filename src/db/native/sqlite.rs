// SQLite Native Client
// Handle-based client for SQLite database files via rusqlite

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::types::ValueRef;
use rusqlite::{Connection as RusqliteConnection, OpenFlags};

use super::{EnvAttribute, HandleTable, HandleType, NativeApi, NativeError, RawHandle, ReturnCode};
use crate::db::config::DataSources;
use crate::db::connection_string::ConnectionString;
use crate::db::traits::{CellValue, ColumnInfo, QueryResult};
use crate::lock;

struct ConnSlot {
    connection: Option<RusqliteConnection>,
}

type SharedConn = Arc<Mutex<ConnSlot>>;

#[derive(Clone)]
struct StmtSlot {
    connection: SharedConn,
    sql: Option<String>,
}

/// Native API over SQLite.
///
/// A DSN names a file data source; an unknown DSN is taken as a path, so
/// `DSN=:memory:` opens a private in-memory database. Credentials are
/// accepted and ignored.
pub struct SqliteApi {
    sources: DataSources,
    environments: HandleTable<Option<u32>>,
    connections: HandleTable<SharedConn>,
    statements: HandleTable<StmtSlot>,
}

impl SqliteApi {
    pub fn new(sources: DataSources) -> Self {
        Self {
            sources,
            environments: HandleTable::new(),
            connections: HandleTable::new(),
            statements: HandleTable::new(),
        }
    }

    fn connection(&self, operation: &'static str, conn: RawHandle) -> Result<SharedConn, NativeError> {
        self.connections
            .get(conn)
            .ok_or_else(|| NativeError::invalid_handle(operation, HandleType::Connection, conn))
    }

    fn statement(&self, operation: &'static str, stmt: RawHandle) -> Result<StmtSlot, NativeError> {
        self.statements
            .get(stmt)
            .ok_or_else(|| NativeError::invalid_handle(operation, HandleType::Statement, stmt))
    }

    fn resolve_path(&self, dsn: &str) -> PathBuf {
        self.sources
            .get(dsn)
            .and_then(|source| source.path.clone())
            .unwrap_or_else(|| PathBuf::from(dsn))
    }

    fn open_connection(path: &Path) -> rusqlite::Result<RusqliteConnection> {
        RusqliteConnection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE)
    }
}

fn first_result(conn: &RusqliteConnection, sql: &str) -> rusqlite::Result<QueryResult> {
    let mut stmt = conn.prepare(sql)?;

    let columns: Vec<ColumnInfo> = stmt
        .column_names()
        .iter()
        .enumerate()
        .map(|(idx, name)| ColumnInfo {
            name: name.to_string(),
            data_type: "any".to_string(), // SQLite is dynamically typed
            ordinal_position: idx as i32,
        })
        .collect();

    let mut values = Vec::new();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let cells = (0..columns.len())
            .map(|idx| row.get_ref(idx).map(cell_value))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        values.push(cells);
    }

    Ok(QueryResult::new(columns, values))
}

fn cell_value(value: ValueRef<'_>) -> CellValue {
    match value {
        ValueRef::Null => CellValue::Null,
        ValueRef::Integer(v) => CellValue::Int(v),
        ValueRef::Real(v) => CellValue::Float(v),
        ValueRef::Text(bytes) => CellValue::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => CellValue::Binary(bytes.to_vec()),
    }
}

impl NativeApi for SqliteApi {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn alloc_environment(&self) -> Result<RawHandle, NativeError> {
        Ok(self.environments.insert(None))
    }

    fn set_environment_attribute(&self, env: RawHandle, attribute: EnvAttribute) -> Result<(), NativeError> {
        let EnvAttribute::ProtocolVersion(version) = attribute;
        self.environments
            .with(env, |slot| *slot = Some(version))
            .ok_or_else(|| NativeError::invalid_handle("SQLSetEnvAttr", HandleType::Environment, env))
    }

    fn alloc_connection(&self, env: RawHandle) -> Result<RawHandle, NativeError> {
        let version = self
            .environments
            .get(env)
            .ok_or_else(|| NativeError::invalid_handle("SQLAllocHandle", HandleType::Environment, env))?;
        if version.is_none() {
            return Err(NativeError::new(
                "SQLAllocHandle",
                HandleType::Environment,
                env,
                "Function sequence error: protocol version not set",
            ));
        }

        Ok(self
            .connections
            .insert(Arc::new(Mutex::new(ConnSlot { connection: None }))))
    }

    fn driver_connect(&self, conn: RawHandle, connection_string: &str) -> Result<(), NativeError> {
        let fail = |message: String| NativeError::new("SQLDriverConnect", HandleType::Connection, conn, message);
        let shared = self.connection("SQLDriverConnect", conn)?;

        let parsed = ConnectionString::parse(connection_string);
        let dsn = parsed
            .get("DSN")
            .filter(|dsn| !dsn.is_empty())
            .ok_or_else(|| fail("Data source name not specified".to_string()))?;
        let path = self.resolve_path(dsn);

        let mut slot = lock::lock(&shared);
        if slot.connection.is_some() {
            return Err(fail("Connection name in use".to_string()));
        }

        let connection = Self::open_connection(&path)
            .map_err(|e| fail(format!("Failed to open SQLite database: {}", e)))?;
        tracing::debug!(handle = %conn, path = %path.display(), "Opened SQLite database");
        slot.connection = Some(connection);
        Ok(())
    }

    fn disconnect(&self, conn: RawHandle) -> Result<(), NativeError> {
        let shared = self.connection("SQLDisconnect", conn)?;
        let connection = lock::lock(&shared).connection.take().ok_or_else(|| {
            NativeError::new("SQLDisconnect", HandleType::Connection, conn, "Connection not open")
        })?;

        connection
            .close()
            .map_err(|(_, e)| NativeError::new("SQLDisconnect", HandleType::Connection, conn, e.to_string()))
    }

    fn alloc_statement(&self, conn: RawHandle) -> Result<RawHandle, NativeError> {
        let shared = self.connection("SQLAllocHandle", conn)?;
        if lock::lock(&shared).connection.is_none() {
            return Err(NativeError::new(
                "SQLAllocHandle",
                HandleType::Connection,
                conn,
                "Connection not open",
            ));
        }

        Ok(self.statements.insert(StmtSlot {
            connection: shared,
            sql: None,
        }))
    }

    /// Compiles `sql` to surface syntax errors now; it is compiled again on execute.
    fn prepare(&self, stmt: RawHandle, sql: &str) -> Result<(), NativeError> {
        let fail = |message: String| NativeError::new("SQLPrepare", HandleType::Statement, stmt, message);
        let slot = self.statement("SQLPrepare", stmt)?;
        {
            let guard = lock::lock(&slot.connection);
            let connection = guard
                .connection
                .as_ref()
                .ok_or_else(|| fail("Connection not open".to_string()))?;
            connection.prepare(sql).map_err(|e| fail(e.to_string()))?;
        }

        self.statements
            .with(stmt, |slot| slot.sql = Some(sql.to_string()))
            .ok_or_else(|| NativeError::invalid_handle("SQLPrepare", HandleType::Statement, stmt))
    }

    fn execute(&self, stmt: RawHandle) -> Result<u64, NativeError> {
        let fail = |message: String| NativeError::new("SQLExecute", HandleType::Statement, stmt, message);
        let slot = self.statement("SQLExecute", stmt)?;
        let sql = slot
            .sql
            .ok_or_else(|| fail("Function sequence error: statement not prepared".to_string()))?;

        let guard = lock::lock(&slot.connection);
        let connection = guard
            .connection
            .as_ref()
            .ok_or_else(|| fail("Connection not open".to_string()))?;
        let changed = connection.execute(&sql, []).map_err(|e| fail(e.to_string()))?;
        Ok(changed as u64)
    }

    fn exec_direct(&self, conn: RawHandle, sql: &str) -> Result<QueryResult, NativeError> {
        let fail = |message: String| NativeError::new("SQLExecDirect", HandleType::Connection, conn, message);
        let shared = self.connection("SQLExecDirect", conn)?;

        let guard = lock::lock(&shared);
        let connection = guard
            .connection
            .as_ref()
            .ok_or_else(|| fail("Connection not open".to_string()))?;
        first_result(connection, sql).map_err(|e| fail(e.to_string()))
    }

    fn free_handle(&self, handle_type: HandleType, handle: RawHandle) -> ReturnCode {
        let freed = match handle_type {
            HandleType::Environment => self.environments.remove(handle).is_some(),
            HandleType::Connection => self.connections.remove(handle).is_some(),
            HandleType::Statement => self.statements.remove(handle).is_some(),
        };

        if freed {
            ReturnCode::SUCCESS
        } else {
            ReturnCode::INVALID_HANDLE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::config::DataSourceConfig;
    use crate::db::native::PROTOCOL_VERSION_3;

    fn connected(api: &SqliteApi, connection_string: &str) -> (RawHandle, RawHandle) {
        let env = api.alloc_environment().unwrap();
        api.set_environment_attribute(env, EnvAttribute::ProtocolVersion(PROTOCOL_VERSION_3))
            .unwrap();
        let conn = api.alloc_connection(env).unwrap();
        api.driver_connect(conn, connection_string).unwrap();
        (env, conn)
    }

    #[test]
    fn test_in_memory_round_trip() {
        let api = SqliteApi::new(DataSources::new());
        let (_, conn) = connected(&api, "DSN=:memory:;UID=sa;PWD=pw");

        let stmt = api.alloc_statement(conn).unwrap();
        api.prepare(stmt, "CREATE TABLE t (id INTEGER, name TEXT, score REAL, data BLOB)").unwrap();
        api.execute(stmt).unwrap();

        let insert = api.alloc_statement(conn).unwrap();
        api.prepare(insert, "INSERT INTO t VALUES (1, 'a', 1.5, x'0102'), (2, NULL, NULL, NULL)").unwrap();
        assert_eq!(api.execute(insert).unwrap(), 2);

        let result = api.exec_direct(conn, "SELECT id, name, score, data FROM t ORDER BY id").unwrap();
        assert_eq!(result.row_count, 2);
        assert_eq!(result.columns[1].name, "name");
        assert_eq!(
            result.rows[0],
            vec![
                CellValue::Int(1),
                CellValue::String("a".to_string()),
                CellValue::Float(1.5),
                CellValue::Binary(vec![1, 2]),
            ]
        );
        assert_eq!(result.rows[1][1], CellValue::Null);
    }

    #[test]
    fn test_prepare_reports_syntax_errors() {
        let api = SqliteApi::new(DataSources::new());
        let (_, conn) = connected(&api, "DSN=:memory:;INTEGRATED SECURITY=true;Trusted_Connection=yes");
        let stmt = api.alloc_statement(conn).unwrap();

        let err = api.prepare(stmt, "SELEC nonsense").unwrap_err();
        assert_eq!(err.operation, "SQLPrepare");
        assert!(api.execute(stmt).unwrap_err().message.contains("not prepared"));
    }

    #[test]
    fn test_named_data_source_resolves_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let api = SqliteApi::new(DataSources::new().with(DataSourceConfig::file("Cache", &path)));

        let (_, conn) = connected(&api, "DSN=cache;UID=;PWD=");
        api.exec_direct(conn, "CREATE TABLE t (x INTEGER)").unwrap();
        api.disconnect(conn).unwrap();

        assert!(path.exists());
    }

    #[test]
    fn test_disconnected_handle_rejects_work() {
        let api = SqliteApi::new(DataSources::new());
        let (_, conn) = connected(&api, "DSN=:memory:");
        api.disconnect(conn).unwrap();

        assert!(api.alloc_statement(conn).is_err());
        assert!(api.exec_direct(conn, "SELECT 1").is_err());
        assert!(api.disconnect(conn).is_err());
    }

    #[test]
    fn test_missing_dsn() {
        let api = SqliteApi::new(DataSources::new());
        let env = api.alloc_environment().unwrap();
        api.set_environment_attribute(env, EnvAttribute::ProtocolVersion(PROTOCOL_VERSION_3))
            .unwrap();
        let conn = api.alloc_connection(env).unwrap();

        assert!(api.driver_connect(conn, "UID=sa;PWD=pw").is_err());
    }

    #[test]
    fn test_connection_requires_protocol_version() {
        let api = SqliteApi::new(DataSources::new());
        let env = api.alloc_environment().unwrap();
        assert!(api.alloc_connection(env).is_err());
        assert_eq!(api.free_handle(HandleType::Environment, env), ReturnCode::SUCCESS);
        assert_eq!(api.free_handle(HandleType::Environment, env), ReturnCode::INVALID_HANDLE);
    }
}

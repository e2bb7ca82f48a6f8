// TDS Native Client
// Handle-based client for MS-SQL servers, driving tiberius on a runtime
// owned by each environment handle.

use std::borrow::Cow;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use tiberius::{AuthMethod, Client, ColumnType, Config, EncryptionLevel, Row};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use super::{EnvAttribute, HandleTable, HandleType, NativeApi, NativeError, RawHandle, ReturnCode};
use crate::db::config::{DataSourceConfig, DataSources};
use crate::db::connection_string::ConnectionString;
use crate::db::traits::{CellValue, ColumnInfo, QueryResult};
use crate::lock;

type TdsClient = Client<Compat<TcpStream>>;

/// SQL Server error number for an expired login password.
const PASSWORD_EXPIRED: u32 = 18488;

struct EnvSlot {
    runtime: Arc<Runtime>,
    protocol_version: Option<u32>,
}

struct ConnSlot {
    runtime: Arc<Runtime>,
    client: Option<TdsClient>,
}

type SharedConn = Arc<Mutex<ConnSlot>>;

#[derive(Clone)]
struct StmtSlot {
    connection: SharedConn,
    sql: Option<String>,
}

/// Native API over the TDS wire protocol.
///
/// Data source names resolve through [`DataSources`] to a host, port and
/// database. Only SQL Server authentication is available; integrated
/// security is refused at connect time.
pub struct TdsApi {
    sources: DataSources,
    environments: HandleTable<EnvSlot>,
    connections: HandleTable<SharedConn>,
    statements: HandleTable<StmtSlot>,
}

impl TdsApi {
    pub fn new(sources: DataSources) -> Self {
        Self {
            sources,
            environments: HandleTable::new(),
            connections: HandleTable::new(),
            statements: HandleTable::new(),
        }
    }

    pub fn sources(&self) -> &DataSources {
        &self.sources
    }

    fn connection(&self, operation: &'static str, conn: RawHandle) -> Result<SharedConn, NativeError> {
        self.connections
            .get(conn)
            .ok_or_else(|| NativeError::invalid_handle(operation, HandleType::Connection, conn))
    }

    /// Resolve the connection string to a tiberius config plus the address to dial.
    fn resolve(&self, conn: RawHandle, connection_string: &str) -> Result<(Config, String), NativeError> {
        let fail = |message: String| NativeError::new("SQLDriverConnect", HandleType::Connection, conn, message);
        let parsed = ConnectionString::parse(connection_string);

        if parsed.flag("INTEGRATED SECURITY") || parsed.flag("Trusted_Connection") {
            return Err(fail("Integrated security is not supported by the TDS client".to_string()));
        }

        let dsn = parsed
            .get("DSN")
            .ok_or_else(|| fail("Data source name not specified".to_string()))?;
        let source = self
            .sources
            .get(dsn)
            .ok_or_else(|| fail(format!("Data source name not found: {}", dsn)))?;
        let username = parsed
            .get("UID")
            .ok_or_else(|| fail("Username required for MS-SQL".to_string()))?;
        let password = parsed.get("PWD").unwrap_or("");

        let config = tiberius_config(source, username, password).map_err(fail)?;
        let addr = config.get_addr();
        Ok((config, addr))
    }
}

/// Build a tiberius config for a server data source.
pub fn tiberius_config(source: &DataSourceConfig, username: &str, password: &str) -> Result<Config, String> {
    let host = source
        .host
        .as_deref()
        .ok_or_else(|| format!("Host required for MS-SQL data source {}", source.name))?;

    let mut config = Config::new();
    config.host(host);
    config.port(source.get_port());
    if let Some(database) = source.database.as_deref() {
        config.database(database);
    }
    config.authentication(AuthMethod::sql_server(username, password));

    if source.trust_certificate {
        config.trust_cert();
    }

    config.encryption(if source.encrypt {
        EncryptionLevel::Required
    } else {
        EncryptionLevel::Off
    });

    Ok(config)
}

fn describe(err: &tiberius::error::Error) -> String {
    if let tiberius::error::Error::Server(e) = err {
        if e.code() == PASSWORD_EXPIRED {
            return format!("Password expired: {}", e.message());
        }
    }
    err.to_string()
}

async fn connect(config: Config, addr: &str) -> Result<TdsClient, String> {
    let tcp = TcpStream::connect(addr)
        .await
        .map_err(|e| format!("Failed to reach {}: {}", addr, e))?;
    tcp.set_nodelay(true)
        .map_err(|e| format!("Failed to configure socket: {}", e))?;

    Client::connect(config, tcp.compat_write())
        .await
        .map_err(|e| describe(&e))
}

async fn first_result(client: &mut TdsClient, sql: &str) -> Result<QueryResult, tiberius::error::Error> {
    let rows = client.simple_query(sql).await?.into_first_result().await?;

    let columns: Vec<ColumnInfo> = rows
        .first()
        .map(|row| {
            row.columns()
                .iter()
                .enumerate()
                .map(|(idx, col)| ColumnInfo {
                    name: col.name().to_string(),
                    data_type: sql_type_name(col.column_type()).into_owned(),
                    ordinal_position: idx as i32,
                })
                .collect()
        })
        .unwrap_or_default();

    let values = rows
        .iter()
        .map(|row| (0..columns.len()).map(|idx| cell_value_from_row(row, idx)).collect())
        .collect();

    Ok(QueryResult::new(columns, values))
}

impl NativeApi for TdsApi {
    fn name(&self) -> &str {
        "tds"
    }

    fn alloc_environment(&self) -> Result<RawHandle, NativeError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| {
                NativeError::new(
                    "SQLAllocHandle",
                    HandleType::Environment,
                    RawHandle::NULL,
                    format!("Failed to start I/O runtime: {}", e),
                )
            })?;

        Ok(self.environments.insert(EnvSlot {
            runtime: Arc::new(runtime),
            protocol_version: None,
        }))
    }

    fn set_environment_attribute(&self, env: RawHandle, attribute: EnvAttribute) -> Result<(), NativeError> {
        let EnvAttribute::ProtocolVersion(version) = attribute;
        self.environments
            .with(env, |slot| slot.protocol_version = Some(version))
            .ok_or_else(|| NativeError::invalid_handle("SQLSetEnvAttr", HandleType::Environment, env))
    }

    fn alloc_connection(&self, env: RawHandle) -> Result<RawHandle, NativeError> {
        let (runtime, version) = self
            .environments
            .with(env, |slot| (Arc::clone(&slot.runtime), slot.protocol_version))
            .ok_or_else(|| NativeError::invalid_handle("SQLAllocHandle", HandleType::Environment, env))?;

        if version.is_none() {
            return Err(NativeError::new(
                "SQLAllocHandle",
                HandleType::Environment,
                env,
                "Function sequence error: protocol version not set",
            ));
        }

        Ok(self.connections.insert(Arc::new(Mutex::new(ConnSlot {
            runtime,
            client: None,
        }))))
    }

    fn driver_connect(&self, conn: RawHandle, connection_string: &str) -> Result<(), NativeError> {
        let shared = self.connection("SQLDriverConnect", conn)?;
        let (config, addr) = self.resolve(conn, connection_string)?;

        let mut slot = lock::lock(&shared);
        if slot.client.is_some() {
            return Err(NativeError::new(
                "SQLDriverConnect",
                HandleType::Connection,
                conn,
                "Connection name in use",
            ));
        }

        tracing::debug!(handle = %conn, addr = %addr, "Opening TDS connection");
        let client = slot
            .runtime
            .block_on(connect(config, &addr))
            .map_err(|message| NativeError::new("SQLDriverConnect", HandleType::Connection, conn, message))?;
        slot.client = Some(client);
        Ok(())
    }

    fn disconnect(&self, conn: RawHandle) -> Result<(), NativeError> {
        let shared = self.connection("SQLDisconnect", conn)?;
        let mut slot = lock::lock(&shared);
        let client = slot.client.take().ok_or_else(|| {
            NativeError::new("SQLDisconnect", HandleType::Connection, conn, "Connection not open")
        })?;

        slot.runtime
            .block_on(client.close())
            .map_err(|e| NativeError::new("SQLDisconnect", HandleType::Connection, conn, describe(&e)))
    }

    fn alloc_statement(&self, conn: RawHandle) -> Result<RawHandle, NativeError> {
        let shared = self.connection("SQLAllocHandle", conn)?;
        if lock::lock(&shared).client.is_none() {
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

    /// Records the text; the server sees it at execute time.
    fn prepare(&self, stmt: RawHandle, sql: &str) -> Result<(), NativeError> {
        self.statements
            .with(stmt, |slot| slot.sql = Some(sql.to_string()))
            .ok_or_else(|| NativeError::invalid_handle("SQLPrepare", HandleType::Statement, stmt))
    }

    fn execute(&self, stmt: RawHandle) -> Result<u64, NativeError> {
        let fail = |message: String| NativeError::new("SQLExecute", HandleType::Statement, stmt, message);
        let slot = self
            .statements
            .get(stmt)
            .ok_or_else(|| NativeError::invalid_handle("SQLExecute", HandleType::Statement, stmt))?;
        let sql = slot
            .sql
            .ok_or_else(|| fail("Function sequence error: statement not prepared".to_string()))?;

        let mut conn = lock::lock(&slot.connection);
        let runtime = Arc::clone(&conn.runtime);
        let client = conn
            .client
            .as_mut()
            .ok_or_else(|| fail("Connection not open".to_string()))?;

        let result = runtime
            .block_on(client.execute(sql.as_str(), &[]))
            .map_err(|e| fail(describe(&e)))?;
        Ok(result.total())
    }

    fn exec_direct(&self, conn: RawHandle, sql: &str) -> Result<QueryResult, NativeError> {
        let fail = |message: String| NativeError::new("SQLExecDirect", HandleType::Connection, conn, message);
        let shared = self.connection("SQLExecDirect", conn)?;

        let mut slot = lock::lock(&shared);
        let runtime = Arc::clone(&slot.runtime);
        let client = slot
            .client
            .as_mut()
            .ok_or_else(|| fail("Connection not open".to_string()))?;

        runtime
            .block_on(first_result(client, sql))
            .map_err(|e| fail(describe(&e)))
    }

    fn free_handle(&self, handle_type: HandleType, handle: RawHandle) -> ReturnCode {
        let freed = match handle_type {
            HandleType::Environment => self.environments.remove(handle).is_some(),
            HandleType::Statement => self.statements.remove(handle).is_some(),
            HandleType::Connection => match self.connections.remove(handle) {
                Some(shared) => {
                    let mut slot = lock::lock(&shared);
                    if let Some(client) = slot.client.take() {
                        tracing::warn!(handle = %handle, "Freeing a connected handle; closing it");
                        if let Err(e) = slot.runtime.block_on(client.close()) {
                            tracing::warn!(handle = %handle, error = %e, "Close failed");
                        }
                    }
                    true
                }
                None => false,
            },
        };

        if freed {
            ReturnCode::SUCCESS
        } else {
            ReturnCode::INVALID_HANDLE
        }
    }
}

/// Convert Tiberius ColumnType to string
/// SQL Server type name for a result column. Variable-width wire types
/// (`Intn`, `Floatn`, `Bitn`) carry no size, so they map to the base name.
fn sql_type_name(col_type: ColumnType) -> Cow<'static, str> {
    let name = match col_type {
        ColumnType::Null => "null",
        ColumnType::Bit | ColumnType::Bitn => "bit",
        ColumnType::Int1 => "tinyint",
        ColumnType::Int2 => "smallint",
        ColumnType::Int4 | ColumnType::Intn => "int",
        ColumnType::Int8 => "bigint",
        ColumnType::Float4 => "real",
        ColumnType::Float8 | ColumnType::Floatn => "float",
        ColumnType::Money => "money",
        ColumnType::Money4 => "smallmoney",
        ColumnType::Decimaln => "decimal",
        ColumnType::Numericn => "numeric",
        ColumnType::BigChar => "char",
        ColumnType::BigVarChar => "varchar",
        ColumnType::NChar => "nchar",
        ColumnType::NVarchar => "nvarchar",
        ColumnType::Text => "text",
        ColumnType::NText => "ntext",
        ColumnType::BigBinary => "binary",
        ColumnType::BigVarBin => "varbinary",
        ColumnType::Image => "image",
        ColumnType::Datetime4 => "smalldatetime",
        ColumnType::Datetime | ColumnType::Datetimen => "datetime",
        ColumnType::Datetime2 => "datetime2",
        ColumnType::Daten => "date",
        ColumnType::Timen => "time",
        ColumnType::DatetimeOffsetn => "datetimeoffset",
        ColumnType::Guid => "uniqueidentifier",
        ColumnType::Xml => "xml",
        ColumnType::SSVariant => "sql_variant",
        other => return Cow::Owned(format!("{:?}", other).to_lowercase()),
    };
    Cow::Borrowed(name)
}

fn cell_value_from_row(row: &Row, idx: usize) -> CellValue {
    let col_type = row
        .columns()
        .get(idx)
        .map(|c| c.column_type())
        .unwrap_or(ColumnType::Null);

    let value = match col_type {
        ColumnType::Null => None,

        ColumnType::Int1 => row.try_get::<u8, _>(idx).ok().flatten().map(|v| CellValue::Int(v as i64)),
        ColumnType::Int2 => row.try_get::<i16, _>(idx).ok().flatten().map(|v| CellValue::Int(v as i64)),
        ColumnType::Int4 => row.try_get::<i32, _>(idx).ok().flatten().map(|v| CellValue::Int(v as i64)),
        ColumnType::Int8 => row.try_get::<i64, _>(idx).ok().flatten().map(CellValue::Int),
        ColumnType::Intn => row
            .try_get::<i64, _>(idx)
            .ok()
            .flatten()
            .map(CellValue::Int)
            .or_else(|| row.try_get::<i32, _>(idx).ok().flatten().map(|v| CellValue::Int(v as i64)))
            .or_else(|| row.try_get::<i16, _>(idx).ok().flatten().map(|v| CellValue::Int(v as i64)))
            .or_else(|| row.try_get::<u8, _>(idx).ok().flatten().map(|v| CellValue::Int(v as i64))),

        ColumnType::Float4 => row.try_get::<f32, _>(idx).ok().flatten().map(|v| CellValue::Float(v as f64)),
        ColumnType::Float8 | ColumnType::Money | ColumnType::Money4 => {
            row.try_get::<f64, _>(idx).ok().flatten().map(CellValue::Float)
        }
        ColumnType::Floatn => row
            .try_get::<f64, _>(idx)
            .ok()
            .flatten()
            .map(CellValue::Float)
            .or_else(|| row.try_get::<f32, _>(idx).ok().flatten().map(|v| CellValue::Float(v as f64))),

        ColumnType::Decimaln | ColumnType::Numericn => row
            .try_get::<tiberius::numeric::Numeric, _>(idx)
            .ok()
            .flatten()
            .map(|n| CellValue::Float(f64::from(n))),

        ColumnType::Bit | ColumnType::Bitn => row.try_get::<bool, _>(idx).ok().flatten().map(CellValue::Bool),

        ColumnType::BigVarChar
        | ColumnType::BigChar
        | ColumnType::NVarchar
        | ColumnType::NChar
        | ColumnType::Text
        | ColumnType::NText => row
            .try_get::<&str, _>(idx)
            .ok()
            .flatten()
            .map(|s| CellValue::String(s.to_string())),

        ColumnType::Datetime | ColumnType::Datetime2 | ColumnType::Datetimen | ColumnType::Datetime4 => row
            .try_get::<NaiveDateTime, _>(idx)
            .ok()
            .flatten()
            .map(|dt| CellValue::DateTime(dt.to_string())),
        ColumnType::DatetimeOffsetn => row
            .try_get::<DateTime<Utc>, _>(idx)
            .ok()
            .flatten()
            .map(|dt| CellValue::DateTime(dt.to_rfc3339())),
        ColumnType::Daten => row
            .try_get::<NaiveDate, _>(idx)
            .ok()
            .flatten()
            .map(|d| CellValue::DateTime(d.to_string())),
        ColumnType::Timen => row
            .try_get::<NaiveTime, _>(idx)
            .ok()
            .flatten()
            .map(|t| CellValue::DateTime(t.to_string())),

        ColumnType::BigVarBin | ColumnType::BigBinary | ColumnType::Image => row
            .try_get::<&[u8], _>(idx)
            .ok()
            .flatten()
            .map(|b| CellValue::Binary(b.to_vec())),

        ColumnType::Guid => row
            .try_get::<tiberius::Uuid, _>(idx)
            .ok()
            .flatten()
            .map(|u| CellValue::String(u.to_string())),

        ColumnType::Xml => row
            .try_get::<&tiberius::xml::XmlData, _>(idx)
            .ok()
            .flatten()
            .map(|xml| CellValue::String(xml.to_owned().into_string())),

        _ => None,
    };

    value.unwrap_or(CellValue::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::native::PROTOCOL_VERSION_3;

    fn api() -> TdsApi {
        TdsApi::new(
            DataSources::new()
                .with(DataSourceConfig::server("Sales", "db.local", 1433, "sales"))
                .with(DataSourceConfig::file("Cache", "/tmp/cache.db")),
        )
    }

    fn connection_handle(api: &TdsApi) -> (RawHandle, RawHandle) {
        let env = api.alloc_environment().unwrap();
        api.set_environment_attribute(env, EnvAttribute::ProtocolVersion(PROTOCOL_VERSION_3))
            .unwrap();
        let conn = api.alloc_connection(env).unwrap();
        (env, conn)
    }

    #[test]
    fn test_sql_type_names() {
        assert_eq!(sql_type_name(ColumnType::Intn), "int");
        assert_eq!(sql_type_name(ColumnType::Money4), "smallmoney");
        assert_eq!(sql_type_name(ColumnType::BigVarChar), "varchar");
        assert_eq!(sql_type_name(ColumnType::NVarchar), "nvarchar");
        assert_eq!(sql_type_name(ColumnType::Datetime2), "datetime2");
        assert_eq!(sql_type_name(ColumnType::Udt), "udt");
    }

    #[test]
    fn test_config_from_data_source() {
        let source = DataSourceConfig::server("Sales", "db.local", 1444, "sales");
        let config = tiberius_config(&source, "sa", "pw").unwrap();
        assert_eq!(config.get_addr(), "db.local:1444");

        assert!(tiberius_config(&DataSourceConfig::file("Cache", "/tmp/c.db"), "sa", "pw").is_err());
    }

    #[test]
    fn test_connection_requires_protocol_version() {
        let api = api();
        let env = api.alloc_environment().unwrap();

        let err = api.alloc_connection(env).unwrap_err();
        assert!(err.message.contains("protocol version"));

        assert_eq!(api.free_handle(HandleType::Environment, env), ReturnCode::SUCCESS);
    }

    #[test]
    fn test_integrated_security_refused() {
        let api = api();
        let (_, conn) = connection_handle(&api);

        let err = api
            .driver_connect(conn, "DSN=Sales;INTEGRATED SECURITY=true;Trusted_Connection=yes")
            .unwrap_err();
        assert_eq!(err.operation, "SQLDriverConnect");
        assert!(err.message.contains("Integrated security"));
    }

    #[test]
    fn test_unknown_data_source() {
        let api = api();
        let (_, conn) = connection_handle(&api);

        let err = api.driver_connect(conn, "DSN=Nowhere;UID=sa;PWD=pw").unwrap_err();
        assert!(err.message.contains("Nowhere"));

        let err = api.driver_connect(conn, "DSN=Cache;UID=sa;PWD=pw").unwrap_err();
        assert!(err.message.contains("Host required"));
    }

    #[test]
    fn test_unconnected_handle_rejects_work() {
        let api = api();
        let (_, conn) = connection_handle(&api);

        assert!(api.alloc_statement(conn).is_err());
        assert!(api.exec_direct(conn, "SELECT 1").is_err());
        assert!(api.disconnect(conn).is_err());
    }

    #[test]
    fn test_free_handles() {
        let api = api();
        let (env, conn) = connection_handle(&api);

        assert_eq!(api.free_handle(HandleType::Connection, conn), ReturnCode::SUCCESS);
        assert_eq!(api.free_handle(HandleType::Connection, conn), ReturnCode::INVALID_HANDLE);
        assert_eq!(api.free_handle(HandleType::Statement, env), ReturnCode::INVALID_HANDLE);
        assert_eq!(api.free_handle(HandleType::Environment, env), ReturnCode::SUCCESS);
        assert!(api.environments.is_empty());
        assert!(api.connections.is_empty());
    }

    #[test]
    fn test_wrong_handle_kind() {
        let api = api();
        let (env, _) = connection_handle(&api);

        let err = api.driver_connect(env, "DSN=Sales;UID=sa;PWD=pw").unwrap_err();
        assert_eq!(err.return_code, ReturnCode::INVALID_HANDLE);
    }
}

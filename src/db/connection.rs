// Connections
// One live native connection per Connection, plus the statements and
// queries built from it.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::config::ConnectionParams;
use crate::db::connection_string;
use crate::db::native::{Environment, Handle, NativeApi, NativeError};
use crate::db::traits::{DatabaseError, QueryResult};
use crate::lock;

/// Lifecycle of a [`Connection`]. There is no way back to `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected, or the connect attempt failed.
    Disconnected,
    Connected,
    /// Explicitly disconnected; terminal.
    Closed,
}

struct Session {
    state: ConnectionState,
    handle: Option<Handle>,
    connected_at: Option<DateTime<Utc>>,
    last_error: Option<NativeError>,
}

struct ConnectionInner {
    id: Uuid,
    connection_string: String,
    // Declared before `environment` so the connection handle is freed first.
    session: Mutex<Session>,
    environment: Arc<Environment>,
}

impl ConnectionInner {
    fn session(&self) -> MutexGuard<'_, Session> {
        lock::lock(&self.session)
    }

    fn api(&self) -> &Arc<dyn NativeApi> {
        self.environment.api()
    }

    /// Lock the session, failing unless it is connected.
    fn connected_session(&self) -> Result<MutexGuard<'_, Session>, DatabaseError> {
        let session = self.session();
        if session.state != ConnectionState::Connected {
            return Err(DatabaseError::NotConnected);
        }
        Ok(session)
    }

    fn do_connect(&self) {
        let mut session = self.session();
        let handle = match self.environment.handle().alloc_connection() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(connection_id = %self.id, error = %e, "Failed to allocate connection handle");
                session.last_error = Some(e);
                return;
            }
        };

        let result = self.api().driver_connect(handle.raw(), &self.connection_string);
        // The handle stays owned by this connection whether or not connect succeeded.
        let raw = handle.raw();
        session.handle = Some(handle);
        match result {
            Ok(()) => {
                session.state = ConnectionState::Connected;
                session.connected_at = Some(Utc::now());
                tracing::info!(
                    connection_id = %self.id,
                    backend = self.api().name(),
                    handle = %raw,
                    "Connected"
                );
            }
            Err(e) => {
                tracing::warn!(
                    connection_id = %self.id,
                    connection_string = %connection_string::mask_password(&self.connection_string),
                    error = %e,
                    "Connect failed"
                );
                session.last_error = Some(e);
            }
        }
    }

    fn do_disconnect(&self, session: &mut Session) -> Result<(), NativeError> {
        if session.state == ConnectionState::Closed {
            return Ok(());
        }
        let was_connected = session.state == ConnectionState::Connected;
        session.state = ConnectionState::Closed;

        if let (true, Some(handle)) = (was_connected, session.handle.as_ref()) {
            self.api().disconnect(handle.raw())?;
            tracing::info!(connection_id = %self.id, "Disconnected");
        }
        Ok(())
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        let mut session = lock::lock(&self.session);
        if let Err(e) = self.do_disconnect(&mut session) {
            tracing::warn!(connection_id = %self.id, error = %e, "Disconnect failed during teardown");
        }
        // Release the connection handle while the environment is still held.
        session.handle = None;
    }
}

/// A connection opened under a shared environment handle.
///
/// Connecting happens at construction; on failure the connection exists but
/// reports [`DatabaseError::NotConnected`] for every operation. Statements
/// and queries keep the connection alive, and the connection keeps the
/// environment alive.
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn open(environment: Arc<Environment>, params: &ConnectionParams) -> Self {
        let inner = Arc::new(ConnectionInner {
            id: Uuid::new_v4(),
            connection_string: connection_string::build(params),
            session: Mutex::new(Session {
                state: ConnectionState::Disconnected,
                handle: None,
                connected_at: None,
                last_error: None,
            }),
            environment,
        });
        inner.do_connect();
        Self { inner }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// The connection string handed to the native driver.
    pub fn connection_string(&self) -> &str {
        &self.inner.connection_string
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.session().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.inner.session().connected_at
    }

    /// The native error from the failed connect, if any.
    pub fn last_error(&self) -> Option<NativeError> {
        self.inner.session().last_error.clone()
    }

    /// Disconnect for good. Statements still holding the connection keep
    /// its handle allocated until they are dropped.
    pub fn disconnect(&self) -> Result<(), DatabaseError> {
        let mut session = self.inner.session();
        self.inner.do_disconnect(&mut session)?;
        Ok(())
    }

    /// Allocate a statement on this connection.
    pub fn create_statement(&self) -> Result<Statement, DatabaseError> {
        let session = self.inner.connected_session()?;
        let handle = match session.handle.as_ref() {
            Some(handle) => handle.alloc_statement()?,
            None => return Err(DatabaseError::NotConnected),
        };
        drop(session);

        Ok(Statement {
            handle,
            sql: None,
            connection: Arc::clone(&self.inner),
        })
    }

    pub fn create_query(&self) -> Result<Query, DatabaseError> {
        drop(self.inner.connected_session()?);
        Ok(Query {
            connection: Arc::clone(&self.inner),
        })
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field(
                "connection_string",
                &connection_string::mask_password(&self.inner.connection_string),
            )
            .field("state", &self.state())
            .finish()
    }
}

/// A prepared statement bound to a connection.
pub struct Statement {
    // Freed before the connection reference is released.
    handle: Handle,
    sql: Option<String>,
    connection: Arc<ConnectionInner>,
}

impl Statement {
    pub fn prepare(&mut self, sql: &str) -> Result<(), DatabaseError> {
        let _session = self.connection.connected_session()?;
        self.connection.api().prepare(self.handle.raw(), sql)?;
        self.sql = Some(sql.to_string());
        Ok(())
    }

    /// Execute the prepared statement, returning rows affected.
    pub fn execute(&mut self) -> Result<u64, DatabaseError> {
        let _session = self.connection.connected_session()?;
        let sql = self.sql.as_deref().ok_or(DatabaseError::NotPrepared)?;
        tracing::debug!(connection_id = %self.connection.id, sql, "Executing statement");
        Ok(self.connection.api().execute(self.handle.raw())?)
    }

    pub fn sql(&self) -> Option<&str> {
        self.sql.as_deref()
    }
}

impl fmt::Debug for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Statement")
            .field("connection_id", &self.connection.id)
            .field("handle", &self.handle.raw())
            .field("sql", &self.sql)
            .finish()
    }
}

/// Runs ad hoc SQL on a connection and materializes the first result set.
pub struct Query {
    connection: Arc<ConnectionInner>,
}

impl Query {
    pub fn execute(&self, sql: &str) -> Result<QueryResult, DatabaseError> {
        let session = self.connection.connected_session()?;
        let handle = session.handle.as_ref().ok_or(DatabaseError::NotConnected)?;

        let start = Instant::now();
        tracing::debug!(connection_id = %self.connection.id, sql, "Executing query");
        let mut result = self.connection.api().exec_direct(handle.raw(), sql)?;
        result.execution_time_ms = start.elapsed().as_millis() as u64;
        Ok(result)
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("connection_id", &self.connection.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::native::mock::{Call, Faults, MockNativeApi};
    use crate::db::native::HandleType;
    use crate::db::traits::CellValue;

    fn environment(mock: &Arc<MockNativeApi>) -> Arc<Environment> {
        let api: Arc<dyn NativeApi> = mock.clone();
        Environment::open(&api).unwrap()
    }

    #[test]
    fn test_connect_with_username() {
        let mock = MockNativeApi::new();
        let conn = Connection::open(environment(&mock), &ConnectionParams::new("Sales", "sa", "pw"));

        assert!(conn.is_connected());
        assert!(conn.connected_at().is_some());
        assert_eq!(mock.connection_strings(), vec!["DSN=Sales;UID=sa;PWD=pw".to_string()]);
        assert!(!conn.connection_string().contains("INTEGRATED SECURITY"));
    }

    #[test]
    fn test_connect_integrated() {
        let mock = MockNativeApi::new();
        let conn = Connection::open(environment(&mock), &ConnectionParams::integrated("Sales"));

        assert!(conn.connection_string().contains("INTEGRATED SECURITY=true"));
        assert!(!conn.connection_string().contains("UID="));
    }

    #[test]
    fn test_failed_connect_reports_not_connected() {
        let mock = MockNativeApi::with_faults(Faults {
            driver_connect: true,
            ..Faults::default()
        });
        let conn = Connection::open(environment(&mock), &ConnectionParams::new("Sales", "sa", "pw"));

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.last_error().is_some());
        // The handle is still owned by the connection.
        assert_eq!(mock.live(HandleType::Connection), 1);

        assert!(matches!(conn.create_statement(), Err(DatabaseError::NotConnected)));
        assert!(matches!(conn.create_query(), Err(DatabaseError::NotConnected)));
        assert!(!mock.calls().iter().any(|c| matches!(c, Call::AllocStatement | Call::Prepare(_))));

        drop(conn);
        assert_eq!(mock.live(HandleType::Connection), 0);
        assert!(!mock.calls().contains(&Call::Disconnect));
    }

    #[test]
    fn test_failed_handle_allocation() {
        let mock = MockNativeApi::with_faults(Faults {
            alloc_connection: true,
            ..Faults::default()
        });
        let conn = Connection::open(environment(&mock), &ConnectionParams::new("Sales", "sa", "pw"));

        assert!(!conn.is_connected());
        assert!(mock.connection_strings().is_empty());
        assert_eq!(mock.live(HandleType::Connection), 0);
    }

    #[test]
    fn test_statement_prepare_and_execute() {
        let mock = MockNativeApi::new();
        let conn = Connection::open(environment(&mock), &ConnectionParams::new("Sales", "sa", "pw"));

        let mut stmt = conn.create_statement().unwrap();
        assert!(matches!(stmt.execute(), Err(DatabaseError::NotPrepared)));

        stmt.prepare("UPDATE t SET x = 1").unwrap();
        assert_eq!(stmt.execute().unwrap(), 1);
        assert_eq!(stmt.sql(), Some("UPDATE t SET x = 1"));
        assert!(mock.calls().contains(&Call::Prepare("UPDATE t SET x = 1".to_string())));
    }

    #[test]
    fn test_query_execute() {
        let mock = MockNativeApi::new();
        let conn = Connection::open(environment(&mock), &ConnectionParams::new("Sales", "sa", "pw"));

        let result = conn.create_query().unwrap().execute("SELECT 1").unwrap();
        assert_eq!(result.rows, vec![vec![CellValue::Int(1)]]);
    }

    #[test]
    fn test_disconnect_is_terminal() {
        let mock = MockNativeApi::new();
        let conn = Connection::open(environment(&mock), &ConnectionParams::new("Sales", "sa", "pw"));
        let query = conn.create_query().unwrap();

        conn.disconnect().unwrap();
        conn.disconnect().unwrap();

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(query.execute("SELECT 1"), Err(DatabaseError::NotConnected)));
        assert!(matches!(conn.create_statement(), Err(DatabaseError::NotConnected)));
        assert_eq!(mock.calls().iter().filter(|c| **c == Call::Disconnect).count(), 1);
    }

    #[test]
    fn test_statement_keeps_connection_alive() {
        let mock = MockNativeApi::new();
        let conn = Connection::open(environment(&mock), &ConnectionParams::new("Sales", "sa", "pw"));
        let mut stmt = conn.create_statement().unwrap();

        drop(conn);
        assert_eq!(mock.live(HandleType::Connection), 1);
        assert_eq!(mock.live(HandleType::Environment), 1);
        stmt.prepare("SELECT 1").unwrap();

        drop(stmt);
        assert_eq!(mock.live_handles(), 0);
    }

    #[test]
    fn test_teardown_order() {
        let mock = MockNativeApi::new();
        let conn = Connection::open(environment(&mock), &ConnectionParams::new("Sales", "sa", "pw"));
        drop(conn.create_statement().unwrap());
        drop(conn);

        let frees: Vec<Call> = mock
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Disconnect | Call::Free(_)))
            .collect();
        assert_eq!(
            frees,
            vec![
                Call::Free(HandleType::Statement),
                Call::Disconnect,
                Call::Free(HandleType::Connection),
                Call::Free(HandleType::Environment),
            ]
        );
    }
}

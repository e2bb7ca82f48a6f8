// Databases
// Driver-level database objects that own the environment handle

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::db::config::ConnectionParams;
use crate::db::connection::Connection;
use crate::db::native::{Environment, NativeApi, NativeError};
use crate::db::traits::DatabaseError;
use crate::registry::{DriverObject, ObjectTypeId};

/// Database trait - every backend database object implements this
pub trait Database: DriverObject {
    /// Object type this database was registered under.
    fn object_type(&self) -> &ObjectTypeId;

    fn has_environment(&self) -> bool;

    /// Open a connection under this database's environment.
    ///
    /// Fails only when there is no environment handle. A connect failure
    /// still returns the connection, reporting not-connected.
    fn create_connection(&self, params: &ConnectionParams) -> Result<Connection, DatabaseError>;

    /// Like [`create_connection`](Self::create_connection), but a failed
    /// connect is returned as [`DatabaseError::ConnectionError`].
    fn connect(&self, params: &ConnectionParams) -> Result<Connection, DatabaseError> {
        let connection = self.create_connection(params)?;
        if connection.is_connected() {
            return Ok(connection);
        }
        Err(connection
            .last_error()
            .map(DatabaseError::ConnectionError)
            .unwrap_or(DatabaseError::NotConnected))
    }
}

/// A database over any handle-based native client.
///
/// Acquires one environment handle at construction. If that fails the
/// database stays without one and every connection attempt fails fast.
pub struct OdbcDatabase {
    object_type: ObjectTypeId,
    api: Arc<dyn NativeApi>,
    environment: Option<Arc<Environment>>,
    environment_error: Option<NativeError>,
}

impl OdbcDatabase {
    pub fn new(object_type: impl Into<ObjectTypeId>, api: Arc<dyn NativeApi>) -> Self {
        let object_type = object_type.into();
        let (environment, environment_error) = match Environment::open(&api) {
            Ok(environment) => (Some(environment), None),
            Err(e) => {
                tracing::warn!(
                    object_type = %object_type,
                    backend = api.name(),
                    error = %e,
                    "Failed to acquire environment handle"
                );
                (None, Some(e))
            }
        };

        Self {
            object_type,
            api,
            environment,
            environment_error,
        }
    }

    pub fn backend(&self) -> &str {
        self.api.name()
    }

    /// Why the environment handle could not be acquired, if it could not.
    pub fn environment_error(&self) -> Option<&NativeError> {
        self.environment_error.as_ref()
    }
}

impl Database for OdbcDatabase {
    fn object_type(&self) -> &ObjectTypeId {
        &self.object_type
    }

    fn has_environment(&self) -> bool {
        self.environment.is_some()
    }

    fn create_connection(&self, params: &ConnectionParams) -> Result<Connection, DatabaseError> {
        params.validate()?;
        let environment = self.environment.as_ref().ok_or(DatabaseError::NoEnvironment)?;
        Ok(Connection::open(Arc::clone(environment), params))
    }
}

impl DriverObject for OdbcDatabase {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }

    fn into_database(self: Box<Self>) -> Option<Box<dyn Database>> {
        Some(self)
    }
}

impl fmt::Debug for OdbcDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OdbcDatabase")
            .field("object_type", &self.object_type)
            .field("backend", &self.backend())
            .field("has_environment", &self.has_environment())
            .finish()
    }
}

// Native Client Layer
// The handle-based call surface a vendor client library exposes, modeled
// after the ODBC environment/connection/statement handle hierarchy.

mod handle;
pub mod sqlite;
pub mod tds;

#[cfg(test)]
pub(crate) mod mock;

pub use handle::{Environment, Handle};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::db::traits::QueryResult;
use crate::lock;

/// Required environment protocol version (ODBC 3.x behavior).
pub const PROTOCOL_VERSION_3: u32 = 3;

/// Opaque native handle value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHandle(u64);

impl RawHandle {
    pub const NULL: RawHandle = RawHandle(0);

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleType {
    Environment,
    Connection,
    Statement,
}

impl fmt::Display for HandleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HandleType::Environment => "environment",
            HandleType::Connection => "connection",
            HandleType::Statement => "statement",
        })
    }
}

/// Native return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnCode(pub i16);

impl ReturnCode {
    pub const SUCCESS: ReturnCode = ReturnCode(0);
    pub const SUCCESS_WITH_INFO: ReturnCode = ReturnCode(1);
    pub const NO_DATA: ReturnCode = ReturnCode(100);
    pub const ERROR: ReturnCode = ReturnCode(-1);
    pub const INVALID_HANDLE: ReturnCode = ReturnCode(-2);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS || self == Self::SUCCESS_WITH_INFO
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::SUCCESS => f.write_str("SUCCESS"),
            Self::SUCCESS_WITH_INFO => f.write_str("SUCCESS_WITH_INFO"),
            Self::NO_DATA => f.write_str("NO_DATA"),
            Self::ERROR => f.write_str("ERROR"),
            Self::INVALID_HANDLE => f.write_str("INVALID_HANDLE"),
            ReturnCode(code) => write!(f, "{}", code),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvAttribute {
    ProtocolVersion(u32),
}

/// A failed native call, with the handle needed to fetch its diagnostics.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{operation} returned {return_code} on {handle_type} handle {handle}: {message}")]
pub struct NativeError {
    pub operation: &'static str,
    pub return_code: ReturnCode,
    pub handle_type: HandleType,
    pub handle: RawHandle,
    pub message: String,
}

impl NativeError {
    pub fn new(
        operation: &'static str,
        handle_type: HandleType,
        handle: RawHandle,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            return_code: ReturnCode::ERROR,
            handle_type,
            handle,
            message: message.into(),
        }
    }

    pub fn invalid_handle(operation: &'static str, handle_type: HandleType, handle: RawHandle) -> Self {
        Self {
            return_code: ReturnCode::INVALID_HANDLE,
            ..Self::new(operation, handle_type, handle, "invalid handle")
        }
    }
}

/// Handle-based native client API.
///
/// Calls are synchronous and block on the vendor library; any timeout is the
/// backend's own. Every allocated handle must be passed back to
/// [`free_handle`](Self::free_handle) exactly once, which [`Handle`] does on drop.
pub trait NativeApi: Send + Sync {
    /// Backend name, used in logs.
    fn name(&self) -> &str;

    fn alloc_environment(&self) -> Result<RawHandle, NativeError>;

    fn set_environment_attribute(
        &self,
        env: RawHandle,
        attribute: EnvAttribute,
    ) -> Result<(), NativeError>;

    fn alloc_connection(&self, env: RawHandle) -> Result<RawHandle, NativeError>;

    fn driver_connect(&self, conn: RawHandle, connection_string: &str) -> Result<(), NativeError>;

    fn disconnect(&self, conn: RawHandle) -> Result<(), NativeError>;

    fn alloc_statement(&self, conn: RawHandle) -> Result<RawHandle, NativeError>;

    fn prepare(&self, stmt: RawHandle, sql: &str) -> Result<(), NativeError>;

    /// Execute a prepared statement, returning rows affected.
    fn execute(&self, stmt: RawHandle) -> Result<u64, NativeError>;

    /// Run `sql` on the connection and materialize its first result set.
    fn exec_direct(&self, conn: RawHandle, sql: &str) -> Result<QueryResult, NativeError>;

    fn free_handle(&self, handle_type: HandleType, handle: RawHandle) -> ReturnCode;
}

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Slab of backend state keyed by raw handle, for native API implementations.
///
/// Handle values are unique across every table in the process.
pub struct HandleTable<T> {
    slots: Mutex<HashMap<RawHandle, T>>,
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, value: T) -> RawHandle {
        let handle = RawHandle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed));
        lock::lock(&self.slots).insert(handle, value);
        handle
    }

    pub fn remove(&self, handle: RawHandle) -> Option<T> {
        lock::lock(&self.slots).remove(&handle)
    }

    pub fn contains(&self, handle: RawHandle) -> bool {
        lock::lock(&self.slots).contains_key(&handle)
    }

    /// Run `f` on the slot for `handle` under the table lock.
    pub fn with<R>(&self, handle: RawHandle, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        lock::lock(&self.slots).get_mut(&handle).map(f)
    }

    pub fn len(&self) -> usize {
        lock::lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> HandleTable<T> {
    pub fn get(&self, handle: RawHandle) -> Option<T> {
        lock::lock(&self.slots).get(&handle).cloned()
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

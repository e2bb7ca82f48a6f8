// Recording native API with fault injection, for tests

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::{EnvAttribute, HandleType, NativeApi, NativeError, RawHandle, ReturnCode};
use crate::db::traits::{CellValue, ColumnInfo, QueryResult};
use crate::lock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    AllocEnvironment,
    SetEnvironmentAttribute,
    AllocConnection,
    DriverConnect(String),
    Disconnect,
    AllocStatement,
    Prepare(String),
    Execute,
    ExecDirect(String),
    Free(HandleType),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Faults {
    pub alloc_environment: bool,
    pub set_environment_attribute: bool,
    pub alloc_connection: bool,
    pub driver_connect: bool,
}

pub struct MockNativeApi {
    faults: Faults,
    next: AtomicU64,
    calls: Mutex<Vec<Call>>,
    live: Mutex<HashMap<RawHandle, HandleType>>,
    connected: Mutex<HashSet<RawHandle>>,
}

impl MockNativeApi {
    pub fn new() -> Arc<Self> {
        Self::with_faults(Faults::default())
    }

    pub fn with_faults(faults: Faults) -> Arc<Self> {
        Arc::new(Self {
            faults,
            next: AtomicU64::new(0x100),
            calls: Mutex::new(Vec::new()),
            live: Mutex::new(HashMap::new()),
            connected: Mutex::new(HashSet::new()),
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        lock::lock(&self.calls).clone()
    }

    pub fn live_handles(&self) -> usize {
        lock::lock(&self.live).len()
    }

    pub fn live(&self, handle_type: HandleType) -> usize {
        lock::lock(&self.live)
            .values()
            .filter(|t| **t == handle_type)
            .count()
    }

    pub fn connection_strings(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::DriverConnect(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        lock::lock(&self.calls).push(call);
    }

    fn alloc(&self, handle_type: HandleType) -> RawHandle {
        let raw = RawHandle::from_raw(self.next.fetch_add(1, Ordering::Relaxed));
        lock::lock(&self.live).insert(raw, handle_type);
        raw
    }

    fn check(&self, operation: &'static str, handle_type: HandleType, raw: RawHandle) -> Result<(), NativeError> {
        match lock::lock(&self.live).get(&raw) {
            Some(t) if *t == handle_type => Ok(()),
            _ => Err(NativeError::invalid_handle(operation, handle_type, raw)),
        }
    }
}

impl NativeApi for MockNativeApi {
    fn name(&self) -> &str {
        "mock"
    }

    fn alloc_environment(&self) -> Result<RawHandle, NativeError> {
        self.record(Call::AllocEnvironment);
        if self.faults.alloc_environment {
            return Err(NativeError::new("SQLAllocHandle", HandleType::Environment, RawHandle::NULL, "out of memory"));
        }
        Ok(self.alloc(HandleType::Environment))
    }

    fn set_environment_attribute(&self, env: RawHandle, _attribute: EnvAttribute) -> Result<(), NativeError> {
        self.record(Call::SetEnvironmentAttribute);
        self.check("SQLSetEnvAttr", HandleType::Environment, env)?;
        if self.faults.set_environment_attribute {
            return Err(NativeError::new("SQLSetEnvAttr", HandleType::Environment, env, "optional feature not implemented"));
        }
        Ok(())
    }

    fn alloc_connection(&self, env: RawHandle) -> Result<RawHandle, NativeError> {
        self.record(Call::AllocConnection);
        self.check("SQLAllocHandle", HandleType::Environment, env)?;
        if self.faults.alloc_connection {
            return Err(NativeError::new("SQLAllocHandle", HandleType::Environment, env, "connection limit reached"));
        }
        Ok(self.alloc(HandleType::Connection))
    }

    fn driver_connect(&self, conn: RawHandle, connection_string: &str) -> Result<(), NativeError> {
        self.record(Call::DriverConnect(connection_string.to_string()));
        self.check("SQLDriverConnect", HandleType::Connection, conn)?;
        if self.faults.driver_connect {
            return Err(NativeError::new("SQLDriverConnect", HandleType::Connection, conn, "login failed"));
        }
        lock::lock(&self.connected).insert(conn);
        Ok(())
    }

    fn disconnect(&self, conn: RawHandle) -> Result<(), NativeError> {
        self.record(Call::Disconnect);
        self.check("SQLDisconnect", HandleType::Connection, conn)?;
        lock::lock(&self.connected).remove(&conn);
        Ok(())
    }

    fn alloc_statement(&self, conn: RawHandle) -> Result<RawHandle, NativeError> {
        self.record(Call::AllocStatement);
        self.check("SQLAllocHandle", HandleType::Connection, conn)?;
        if !lock::lock(&self.connected).contains(&conn) {
            return Err(NativeError::new("SQLAllocHandle", HandleType::Connection, conn, "connection not open"));
        }
        Ok(self.alloc(HandleType::Statement))
    }

    fn prepare(&self, stmt: RawHandle, sql: &str) -> Result<(), NativeError> {
        self.record(Call::Prepare(sql.to_string()));
        self.check("SQLPrepare", HandleType::Statement, stmt)
    }

    fn execute(&self, stmt: RawHandle) -> Result<u64, NativeError> {
        self.record(Call::Execute);
        self.check("SQLExecute", HandleType::Statement, stmt)?;
        Ok(1)
    }

    fn exec_direct(&self, conn: RawHandle, sql: &str) -> Result<QueryResult, NativeError> {
        self.record(Call::ExecDirect(sql.to_string()));
        self.check("SQLExecDirect", HandleType::Connection, conn)?;
        Ok(QueryResult::new(
            vec![ColumnInfo {
                name: "value".to_string(),
                data_type: "int".to_string(),
                ordinal_position: 0,
            }],
            vec![vec![CellValue::Int(1)]],
        ))
    }

    fn free_handle(&self, handle_type: HandleType, handle: RawHandle) -> ReturnCode {
        self.record(Call::Free(handle_type));
        match lock::lock(&self.live).remove(&handle) {
            Some(t) if t == handle_type => ReturnCode::SUCCESS,
            _ => ReturnCode::INVALID_HANDLE,
        }
    }
}

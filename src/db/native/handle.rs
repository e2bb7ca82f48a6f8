// Native Handle Ownership
// RAII wrappers that release native handles on every exit path

use std::fmt;
use std::sync::Arc;

use super::{EnvAttribute, HandleType, NativeApi, NativeError, RawHandle, PROTOCOL_VERSION_3};

/// Owns one allocated native handle and frees it on drop.
pub struct Handle {
    api: Arc<dyn NativeApi>,
    handle_type: HandleType,
    raw: RawHandle,
}

impl Handle {
    fn allocated(api: Arc<dyn NativeApi>, handle_type: HandleType, raw: RawHandle) -> Self {
        tracing::debug!(backend = api.name(), %handle_type, handle = %raw, "Handle allocated");
        Self {
            api,
            handle_type,
            raw,
        }
    }

    pub fn alloc_environment(api: &Arc<dyn NativeApi>) -> Result<Self, NativeError> {
        let raw = api.alloc_environment()?;
        Ok(Self::allocated(Arc::clone(api), HandleType::Environment, raw))
    }

    /// Allocate a connection handle scoped to this environment handle.
    pub fn alloc_connection(&self) -> Result<Self, NativeError> {
        let raw = self.api.alloc_connection(self.raw)?;
        Ok(Self::allocated(Arc::clone(&self.api), HandleType::Connection, raw))
    }

    /// Allocate a statement handle scoped to this connection handle.
    pub fn alloc_statement(&self) -> Result<Self, NativeError> {
        let raw = self.api.alloc_statement(self.raw)?;
        Ok(Self::allocated(Arc::clone(&self.api), HandleType::Statement, raw))
    }

    pub fn raw(&self) -> RawHandle {
        self.raw
    }

    pub fn handle_type(&self) -> HandleType {
        self.handle_type
    }

    pub fn api(&self) -> &Arc<dyn NativeApi> {
        &self.api
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("backend", &self.api.name())
            .field("handle_type", &self.handle_type)
            .field("raw", &self.raw)
            .finish()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        let rc = self.api.free_handle(self.handle_type, self.raw);
        if rc.is_success() {
            tracing::debug!(handle_type = %self.handle_type, handle = %self.raw, "Handle released");
        } else {
            tracing::warn!(
                handle_type = %self.handle_type,
                handle = %self.raw,
                return_code = %rc,
                "Failed to release handle"
            );
        }
    }
}

/// An environment handle configured for protocol version 3.
///
/// Shared by `Arc` with every connection opened under it, so it is released
/// only after the last of them.
#[derive(Debug)]
pub struct Environment {
    handle: Handle,
}

impl Environment {
    /// Allocate and configure an environment handle.
    ///
    /// If setting the protocol version fails the allocated handle is
    /// released before returning.
    pub fn open(api: &Arc<dyn NativeApi>) -> Result<Arc<Self>, NativeError> {
        let handle = Handle::alloc_environment(api)?;
        api.set_environment_attribute(
            handle.raw(),
            EnvAttribute::ProtocolVersion(PROTOCOL_VERSION_3),
        )?;
        Ok(Arc::new(Self { handle }))
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn api(&self) -> &Arc<dyn NativeApi> {
        self.handle.api()
    }
}

// Registry Errors
// Structural failures raised while registering or resolving driver objects

use thiserror::Error;

/// Errors raised by [`DriverFactory`](super::DriverFactory) and
/// [`FactoryManager`](super::FactoryManager).
///
/// `NullPointer` and `DuplicateItem` point at a registration bug and are
/// never retried. `ItemNotFound` is the uniform lookup miss.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Null pointer: {0}")]
    NullPointer(String),

    #[error("Duplicate item: {0}")]
    DuplicateItem(String),

    #[error("Item not found: {0}")]
    ItemNotFound(String),

    #[error("Object type '{0}' is claimed but has no creator function")]
    MissingCreator(String),

    #[error("Factory '{0}' has not been initialized")]
    NotInitialized(String),

    #[error("Object type '{0}' does not construct a database")]
    NotADatabase(String),
}

// plugdb
// Pluggable database drivers: driver modules register factories with a
// registry, and applications create databases and connections by name.

pub mod db;
pub mod plugin;
pub mod registry;

mod lock;

pub use db::{
    Connection, ConnectionParams, Database, DatabaseError, MssqlModule, Query, QueryResult,
    SqliteModule, Statement,
};
pub use plugin::{DriverModule, Plugin, PluginError, PluginManager};
pub use registry::{DriverDescriptor, DriverFactory, FactoryManager, RegistryError};

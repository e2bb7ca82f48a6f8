// SQLite Driver
// Registers the SQLite database object, backed by rusqlite

use std::sync::Arc;

use crate::db::config::DataSources;
use crate::db::database::OdbcDatabase;
use crate::db::native::sqlite::SqliteApi;
use crate::db::native::NativeApi;
use crate::db::traits::DatabaseError;
use crate::plugin::{DriverModule, Plugin};
use crate::registry::{DriverDescriptor, FactoryManager, Instance};

pub const MODULE_NAME: &str = "sqlite";
pub const FACTORY_TYPE: &str = "Factory.Database.Sqlite";
pub const OBJECT_TYPE: &str = "Database.Odbc.Sqlite";

pub fn descriptor(api: Arc<dyn NativeApi>) -> DriverDescriptor {
    DriverDescriptor::new(FACTORY_TYPE).provide(OBJECT_TYPE, move || -> Instance {
        Box::new(OdbcDatabase::new(OBJECT_TYPE, Arc::clone(&api)))
    })
}

/// Driver module for SQLite files. Unknown DSNs are opened as paths.
#[derive(Debug, Clone, Default)]
pub struct SqliteModule {
    sources: DataSources,
}

impl SqliteModule {
    pub fn new(sources: DataSources) -> Self {
        Self { sources }
    }

    pub fn from_default_config() -> Result<Self, DatabaseError> {
        Ok(Self::new(DataSources::load_default()?))
    }
}

impl DriverModule for SqliteModule {
    fn name(&self) -> &str {
        MODULE_NAME
    }

    fn start(&self, factories: Arc<FactoryManager>) -> Plugin {
        let api: Arc<dyn NativeApi> = Arc::new(SqliteApi::new(self.sources.clone()));
        Plugin::new(MODULE_NAME, descriptor(api), factories)
    }
}

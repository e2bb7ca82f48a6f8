// MS-SQL Driver
// Registers the MS-SQL database object, backed by the TDS native client

use std::sync::Arc;

use crate::db::config::DataSources;
use crate::db::database::OdbcDatabase;
use crate::db::native::tds::TdsApi;
use crate::db::native::NativeApi;
use crate::db::traits::DatabaseError;
use crate::plugin::{DriverModule, Plugin, PluginError, PluginHooks};
use crate::registry::{DriverDescriptor, FactoryManager, Instance};

pub const MODULE_NAME: &str = "mssql";
pub const FACTORY_TYPE: &str = "Factory.Database";
pub const OBJECT_TYPE: &str = "Database.Odbc.MsSql";

/// Descriptor for the MS-SQL factory over `api`.
pub fn descriptor(api: Arc<dyn NativeApi>) -> DriverDescriptor {
    DriverDescriptor::new(FACTORY_TYPE).provide(OBJECT_TYPE, move || -> Instance {
        Box::new(OdbcDatabase::new(OBJECT_TYPE, Arc::clone(&api)))
    })
}

/// Driver module for MS-SQL servers.
#[derive(Debug, Clone, Default)]
pub struct MssqlModule {
    sources: DataSources,
}

impl MssqlModule {
    pub fn new(sources: DataSources) -> Self {
        Self { sources }
    }

    /// Module serving the data sources from the default config file.
    pub fn from_default_config() -> Result<Self, DatabaseError> {
        Ok(Self::new(DataSources::load_default()?))
    }
}

impl DriverModule for MssqlModule {
    fn name(&self) -> &str {
        MODULE_NAME
    }

    fn start(&self, factories: Arc<FactoryManager>) -> Plugin {
        let api: Arc<dyn NativeApi> = Arc::new(TdsApi::new(self.sources.clone()));
        Plugin::new(MODULE_NAME, descriptor(api), factories).with_hooks(MssqlHooks {
            sources: self.sources.clone(),
        })
    }
}

struct MssqlHooks {
    sources: DataSources,
}

impl PluginHooks for MssqlHooks {
    fn initialize(&mut self) -> Result<(), PluginError> {
        let unusable: Vec<&str> = self
            .sources
            .names()
            .into_iter()
            .filter(|name| self.sources.get(name).is_some_and(|s| s.host.is_none()))
            .collect();
        if !unusable.is_empty() {
            tracing::warn!(data_sources = ?unusable, "Data sources without a host cannot be used by MS-SQL");
        }
        tracing::info!(data_sources = self.sources.len(), "MS-SQL driver ready");
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), PluginError> {
        tracing::info!("MS-SQL driver stopped");
        Ok(())
    }
}

// Driver Plugins
// Install/uninstall lifecycle around exactly one driver factory

mod manager;

pub use manager::{DriverModule, PluginManager};

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::registry::{DriverDescriptor, DriverFactory, FactoryManager, FactoryTypeId, RegistryError};

/// Errors raised by the plugin lifecycle.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Plugin hook failed: {0}")]
    Hook(String),
}

/// Backend-specific setup and teardown that needs the wider host to be up.
///
/// Runs separately from install/uninstall, which only touch registration.
pub trait PluginHooks: Send {
    fn initialize(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), PluginError> {
        Ok(())
    }
}

struct NoHooks;

impl PluginHooks for NoHooks {}

/// Owns one [`DriverFactory`] and registers it with a [`FactoryManager`].
pub struct Plugin {
    name: String,
    factory: Arc<DriverFactory>,
    manager: Arc<FactoryManager>,
    hooks: Box<dyn PluginHooks>,
    installed: bool,
}

impl Plugin {
    pub fn new(
        name: impl Into<String>,
        descriptor: DriverDescriptor,
        manager: Arc<FactoryManager>,
    ) -> Self {
        Self {
            name: name.into(),
            factory: Arc::new(DriverFactory::new(descriptor)),
            manager,
            hooks: Box::new(NoHooks),
            installed: false,
        }
    }

    pub fn with_hooks(mut self, hooks: impl PluginHooks + 'static) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn factory_type(&self) -> &FactoryTypeId {
        self.factory.factory_type()
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }

    /// Initialize the factory and add it to the manager.
    ///
    /// No-op when already installed. On failure the manager is unchanged.
    pub fn install(&mut self) -> Result<(), PluginError> {
        if self.installed {
            tracing::debug!(plugin = %self.name, "Plugin already installed");
            return Ok(());
        }

        self.factory.initialize()?;
        self.manager.add_factory(&self.factory)?;
        self.installed = true;

        tracing::info!(plugin = %self.name, factory = %self.factory_type(), "Plugin installed");
        Ok(())
    }

    /// Remove the factory from the manager. No-op when not installed.
    pub fn uninstall(&mut self) -> Result<(), PluginError> {
        if !self.installed {
            return Ok(());
        }

        self.manager.remove_factory(&self.factory)?;
        self.installed = false;

        tracing::info!(plugin = %self.name, factory = %self.factory_type(), "Plugin uninstalled");
        Ok(())
    }

    pub fn initialize(&mut self) -> Result<(), PluginError> {
        self.hooks.initialize()
    }

    pub fn shutdown(&mut self) -> Result<(), PluginError> {
        self.hooks.shutdown()
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("factory", &self.factory)
            .field("installed", &self.installed)
            .finish_non_exhaustive()
    }
}

impl Drop for Plugin {
    fn drop(&mut self) {
        if !self.installed {
            return;
        }
        tracing::warn!(plugin = %self.name, "Plugin dropped while installed");
        if let Err(e) = self.manager.remove_factory(&self.factory) {
            tracing::warn!(plugin = %self.name, error = %e, "Failed to remove factory on drop");
        }
    }
}

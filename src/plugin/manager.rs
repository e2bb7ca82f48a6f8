// Plugin Manager
// Process-wide table of loaded driver modules and their plugins

use std::fmt;
use std::sync::{Arc, Mutex};

use super::{Plugin, PluginError};
use crate::lock;
use crate::registry::{FactoryManager, RegistryError};

/// Entry point of a driver module, called by the host's loader.
pub trait DriverModule {
    /// Stable module name, used as the key in [`PluginManager`].
    fn name(&self) -> &str;

    /// Construct the module's single plugin against `factories`.
    fn start(&self, factories: Arc<FactoryManager>) -> Plugin;
}

/// Loads driver modules, keeping their plugins installed until unloaded.
pub struct PluginManager {
    factories: Arc<FactoryManager>,
    /// Plugins keyed by the name of the module that started them.
    plugins: Mutex<Vec<(String, Plugin)>>,
}

impl PluginManager {
    pub fn new(factories: Arc<FactoryManager>) -> Self {
        Self {
            factories,
            plugins: Mutex::new(Vec::new()),
        }
    }

    pub fn factories(&self) -> &Arc<FactoryManager> {
        &self.factories
    }

    /// Start a module, then install and initialize its plugin.
    ///
    /// A module is loaded at most once. If any step fails the plugin is
    /// uninstalled again and dropped.
    pub fn load(&self, module: &dyn DriverModule) -> Result<(), PluginError> {
        let mut plugins = lock::lock(&self.plugins);
        let name = module.name().to_string();
        if plugins.iter().any(|(loaded, _)| *loaded == name) {
            return Err(RegistryError::DuplicateItem(format!("plugin '{}'", name)).into());
        }

        let mut plugin = module.start(Arc::clone(&self.factories));
        plugin.install()?;
        if let Err(e) = plugin.initialize() {
            tracing::warn!(plugin = %plugin.name(), error = %e, "Plugin initialization failed");
            plugin.uninstall()?;
            return Err(e);
        }

        tracing::info!(module = %name, plugin = %plugin.name(), "Plugin loaded");
        plugins.push((name, plugin));
        Ok(())
    }

    /// Shut down, uninstall and drop the plugin loaded by module `name`.
    pub fn unload(&self, name: &str) -> Result<(), PluginError> {
        let plugin = {
            let mut plugins = lock::lock(&self.plugins);
            let index = plugins
                .iter()
                .position(|(loaded, _)| loaded == name)
                .ok_or_else(|| RegistryError::ItemNotFound(format!("plugin '{}'", name)))?;
            plugins.remove(index).1
        };
        Self::stop(plugin)
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        lock::lock(&self.plugins)
            .iter()
            .any(|(loaded, _)| loaded == name)
    }

    /// Loaded module names in load order.
    pub fn loaded(&self) -> Vec<String> {
        lock::lock(&self.plugins)
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn stop(mut plugin: Plugin) -> Result<(), PluginError> {
        let shutdown = plugin.shutdown();
        if let Err(e) = &shutdown {
            tracing::warn!(plugin = %plugin.name(), error = %e, "Plugin shutdown failed");
        }
        plugin.uninstall()?;
        tracing::info!(plugin = %plugin.name(), "Plugin unloaded");
        shutdown
    }
}

impl fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginManager")
            .field("factories", &self.factories)
            .field("plugins", &self.loaded())
            .finish()
    }
}

impl Drop for PluginManager {
    fn drop(&mut self) {
        let plugins = std::mem::take(&mut *lock::lock(&self.plugins));
        for (name, plugin) in plugins.into_iter().rev() {
            if let Err(e) = Self::stop(plugin) {
                tracing::warn!(plugin = %name, error = %e, "Failed to unload plugin");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::PluginHooks;
    use crate::registry::{DriverDescriptor, DriverObject, Instance};
    use std::any::Any;

    struct Thing;

    impl DriverObject for Thing {
        fn as_any(&self) -> &dyn Any {
            self
        }

        fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
            self
        }
    }

    struct FailingHooks;

    impl PluginHooks for FailingHooks {
        fn initialize(&mut self) -> Result<(), PluginError> {
            Err(PluginError::Hook("host not ready".to_string()))
        }
    }

    struct ThingModule {
        name: &'static str,
        plugin_name: &'static str,
        fail_initialize: bool,
    }

    impl DriverModule for ThingModule {
        fn name(&self) -> &str {
            self.name
        }

        fn start(&self, factories: Arc<FactoryManager>) -> Plugin {
            let descriptor = DriverDescriptor::new(format!("Factory.{}", self.name))
                .provide(format!("Thing.{}", self.name), || -> Instance { Box::new(Thing) });
            let plugin = Plugin::new(self.plugin_name, descriptor, factories);
            if self.fail_initialize {
                plugin.with_hooks(FailingHooks)
            } else {
                plugin
            }
        }
    }

    fn module(name: &'static str) -> ThingModule {
        ThingModule {
            name,
            plugin_name: name,
            fail_initialize: false,
        }
    }

    #[test]
    fn test_module_name_keys_the_table() {
        let plugins = PluginManager::new(Arc::new(FactoryManager::new()));
        let renamed = ThingModule {
            name: "module-a",
            plugin_name: "plugin-a",
            fail_initialize: false,
        };
        plugins.load(&renamed).unwrap();

        assert!(plugins.is_loaded("module-a"));
        assert!(!plugins.is_loaded("plugin-a"));
        assert_eq!(plugins.loaded(), vec!["module-a".to_string()]);
        assert!(matches!(
            plugins.load(&renamed),
            Err(PluginError::Registry(RegistryError::DuplicateItem(_)))
        ));
        assert!(matches!(
            plugins.unload("plugin-a"),
            Err(PluginError::Registry(RegistryError::ItemNotFound(_)))
        ));

        plugins.unload("module-a").unwrap();
        assert!(plugins.loaded().is_empty());
        assert!(plugins.factories().create_instance("Thing.module-a").is_err());
    }

    #[test]
    fn test_load_and_unload() {
        let plugins = PluginManager::new(Arc::new(FactoryManager::new()));
        plugins.load(&module("a")).unwrap();

        assert!(plugins.is_loaded("a"));
        assert!(plugins.factories().create_instance("Thing.a").is_ok());

        plugins.unload("a").unwrap();
        assert!(!plugins.is_loaded("a"));
        assert!(plugins.factories().create_instance("Thing.a").is_err());
    }

    #[test]
    fn test_load_twice_rejected() {
        let plugins = PluginManager::new(Arc::new(FactoryManager::new()));
        plugins.load(&module("a")).unwrap();

        assert!(matches!(
            plugins.load(&module("a")),
            Err(PluginError::Registry(RegistryError::DuplicateItem(_)))
        ));
        assert_eq!(plugins.loaded(), vec!["a".to_string()]);
    }

    #[test]
    fn test_unload_unknown() {
        let plugins = PluginManager::new(Arc::new(FactoryManager::new()));
        assert!(matches!(
            plugins.unload("missing"),
            Err(PluginError::Registry(RegistryError::ItemNotFound(_)))
        ));
    }

    #[test]
    fn test_failed_initialize_rolls_back() {
        let plugins = PluginManager::new(Arc::new(FactoryManager::new()));
        let failing = ThingModule {
            name: "bad",
            plugin_name: "bad",
            fail_initialize: true,
        };

        assert!(matches!(plugins.load(&failing), Err(PluginError::Hook(_))));
        assert!(!plugins.is_loaded("bad"));
        assert!(plugins.factories().factory_types().is_empty());
    }

    #[test]
    fn test_drop_unloads_everything() {
        let factories = Arc::new(FactoryManager::new());
        {
            let plugins = PluginManager::new(Arc::clone(&factories));
            plugins.load(&module("a")).unwrap();
            plugins.load(&module("b")).unwrap();
            assert_eq!(factories.factory_types().len(), 2);
        }
        assert!(factories.factory_types().is_empty());
        assert!(factories.object_index().is_empty());
    }
}

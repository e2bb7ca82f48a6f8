// Factory Manager
// Registry of installed driver factories plus a flat object-type index

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock, Weak};

use super::{DriverFactory, FactoryTypeId, Instance, ObjectTypeId, RegistryError};
use crate::db::Database;
use crate::lock;

struct FactoryEntry {
    /// Non-owning: the plugin that installed the factory owns it.
    factory: Weak<DriverFactory>,
    claims: Vec<ObjectTypeId>,
    sequence: u64,
}

#[derive(Default)]
struct Indexes {
    factories: HashMap<FactoryTypeId, FactoryEntry>,
    objects: HashMap<ObjectTypeId, FactoryTypeId>,
    next_sequence: u64,
}

impl Indexes {
    /// The live factory registered as `factory_type`.
    fn factory(&self, factory_type: &str) -> Result<Arc<DriverFactory>, RegistryError> {
        let entry = self.factories.get(factory_type).ok_or_else(|| {
            RegistryError::ItemNotFound(format!("factory type '{}'", factory_type))
        })?;
        entry.factory.upgrade().ok_or_else(|| {
            RegistryError::NullPointer(format!("factory '{}' was dropped", factory_type))
        })
    }

    /// Most recently added live factory claiming `object_type`.
    fn latest_claimant(&self, object_type: &ObjectTypeId) -> Option<FactoryTypeId> {
        self.factories
            .iter()
            .filter(|(_, entry)| entry.factory.strong_count() > 0 && entry.claims.contains(object_type))
            .max_by_key(|(_, entry)| entry.sequence)
            .map(|(factory_type, _)| factory_type.clone())
    }

    /// Drop the entry for `factory_type` and every association still pointing at it.
    fn detach(&mut self, factory_type: &FactoryTypeId) {
        let Some(entry) = self.factories.remove(factory_type) else {
            return;
        };
        for object_type in entry.claims {
            if self.objects.get(&object_type) != Some(factory_type) {
                continue;
            }
            match self.latest_claimant(&object_type) {
                Some(owner) => {
                    tracing::debug!(object_type = %object_type, owner = %owner, "Object type restored");
                    self.objects.insert(object_type, owner);
                }
                None => {
                    self.objects.remove(&object_type);
                }
            }
        }
    }
}

/// Registry of every installed [`DriverFactory`].
///
/// One lock guards both the factory table and the object index so the two
/// are always observed in step. Construct one per process and share it by
/// `Arc` with plugins and consumers.
#[derive(Default)]
pub struct FactoryManager {
    inner: RwLock<Indexes>,
}

impl FactoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an initialized factory and index every object type it claims.
    ///
    /// A claimed id already owned by another factory is reassigned to this
    /// one. A second live factory with the same type is rejected; an entry
    /// whose factory was dropped is cleared and replaced.
    pub fn add_factory(&self, factory: &Arc<DriverFactory>) -> Result<(), RegistryError> {
        let factory_type = factory.factory_type().clone();
        if !factory.is_initialized() {
            return Err(RegistryError::NotInitialized(factory_type.to_string()));
        }
        let claims = factory.object_types();

        let mut guard = lock::write(&self.inner);
        let indexes = &mut *guard;
        let stale = match indexes.factories.get(&factory_type) {
            Some(entry) if entry.factory.strong_count() > 0 => {
                return Err(RegistryError::DuplicateItem(format!(
                    "factory type '{}'",
                    factory_type
                )));
            }
            Some(_) => true,
            None => false,
        };
        if stale {
            // The previous owner dropped it without removing it first.
            tracing::warn!(factory = %factory_type, "Replacing dropped factory");
            indexes.detach(&factory_type);
        }

        for object_type in &claims {
            if let Some(previous) = indexes
                .objects
                .insert(object_type.clone(), factory_type.clone())
            {
                tracing::warn!(
                    object_type = %object_type,
                    previous = %previous,
                    factory = %factory_type,
                    "Object type reassigned"
                );
            }
        }

        let sequence = indexes.next_sequence;
        indexes.next_sequence += 1;
        indexes.factories.insert(
            factory_type.clone(),
            FactoryEntry {
                factory: Arc::downgrade(factory),
                claims,
                sequence,
            },
        );

        tracing::info!(factory = %factory_type, "Factory added");
        Ok(())
    }

    /// Remove a factory and the object-type associations that still point at it.
    ///
    /// An id this factory had taken over from another installed factory goes
    /// back to the most recent remaining claimant.
    pub fn remove_factory(&self, factory: &Arc<DriverFactory>) -> Result<(), RegistryError> {
        let factory_type = factory.factory_type();

        let mut guard = lock::write(&self.inner);
        let indexes = &mut *guard;
        let registered = indexes
            .factories
            .get(factory_type)
            .is_some_and(|entry| Weak::ptr_eq(&entry.factory, &Arc::downgrade(factory)));
        if !registered {
            return Err(RegistryError::ItemNotFound(format!(
                "factory '{}' is not registered",
                factory_type
            )));
        }

        indexes.detach(factory_type);

        tracing::info!(factory = %factory_type, "Factory removed");
        Ok(())
    }

    /// Construct `object_type` from the named factory.
    ///
    /// The creator runs after the lock is released, so it may call back
    /// into the manager. The factory stays alive until it returns.
    pub fn create_instance_from(
        &self,
        factory_type: &str,
        object_type: &str,
    ) -> Result<Instance, RegistryError> {
        let factory = lock::read(&self.inner).factory(factory_type)?;
        factory.create_instance(object_type)
    }

    /// Construct `object_type` from whichever factory owns it.
    pub fn create_instance(&self, object_type: &str) -> Result<Instance, RegistryError> {
        let factory = {
            let indexes = lock::read(&self.inner);
            let factory_type = indexes.objects.get(object_type).ok_or_else(|| {
                RegistryError::ItemNotFound(format!("object type '{}'", object_type))
            })?;
            indexes.factory(factory_type.as_str())?
        };
        factory.create_instance(object_type)
    }

    /// Construct `object_type` and view it as a [`Database`].
    pub fn create_database(&self, object_type: &str) -> Result<Box<dyn Database>, RegistryError> {
        self.create_instance(object_type)?
            .into_database()
            .ok_or_else(|| RegistryError::NotADatabase(object_type.to_string()))
    }

    pub fn owner_of(&self, object_type: &str) -> Option<FactoryTypeId> {
        lock::read(&self.inner).objects.get(object_type).cloned()
    }

    pub fn contains_object_type(&self, object_type: &str) -> bool {
        lock::read(&self.inner).objects.contains_key(object_type)
    }

    pub fn contains_factory(&self, factory_type: &str) -> bool {
        lock::read(&self.inner).factories.contains_key(factory_type)
    }

    /// Installed factory types, sorted.
    pub fn factory_types(&self) -> Vec<FactoryTypeId> {
        let mut types: Vec<_> = lock::read(&self.inner).factories.keys().cloned().collect();
        types.sort();
        types
    }

    /// Snapshot of the object-type index.
    pub fn object_index(&self) -> BTreeMap<ObjectTypeId, FactoryTypeId> {
        lock::read(&self.inner)
            .objects
            .iter()
            .map(|(object_type, factory_type)| (object_type.clone(), factory_type.clone()))
            .collect()
    }
}

impl fmt::Debug for FactoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let indexes = lock::read(&self.inner);
        f.debug_struct("FactoryManager")
            .field("factories", &indexes.factories.len())
            .field("object_types", &indexes.objects.len())
            .finish()
    }
}

// Driver Factory
// Per-backend table of object-type ids to zero-argument constructors

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};

use super::{FactoryTypeId, Instance, ObjectTypeId, RegistryError};
use crate::lock;

/// Zero-argument constructor producing one new backend object.
pub type CreatorFunction = Arc<dyn Fn() -> Instance + Send + Sync>;

/// Everything a backend supplies to describe its factory: the services it
/// can construct and the object types it claims in the global index.
#[derive(Clone)]
pub struct DriverDescriptor {
    factory_type: FactoryTypeId,
    services: Vec<(ObjectTypeId, CreatorFunction)>,
    object_types: Vec<ObjectTypeId>,
}

impl DriverDescriptor {
    pub fn new(factory_type: impl Into<FactoryTypeId>) -> Self {
        Self {
            factory_type: factory_type.into(),
            services: Vec::new(),
            object_types: Vec::new(),
        }
    }

    /// Add a creator function without claiming its id.
    pub fn service<F>(mut self, object_type: impl Into<ObjectTypeId>, creator: F) -> Self
    where
        F: Fn() -> Instance + Send + Sync + 'static,
    {
        self.services.push((object_type.into(), Arc::new(creator)));
        self
    }

    /// Claim an id so the manager can resolve it without a factory type.
    pub fn object_type(mut self, object_type: impl Into<ObjectTypeId>) -> Self {
        self.object_types.push(object_type.into());
        self
    }

    /// Register a creator function and claim its id.
    pub fn provide<F>(self, object_type: impl Into<ObjectTypeId>, creator: F) -> Self
    where
        F: Fn() -> Instance + Send + Sync + 'static,
    {
        let object_type = object_type.into();
        self.service(object_type.clone(), creator)
            .object_type(object_type)
    }

    pub fn factory_type(&self) -> &FactoryTypeId {
        &self.factory_type
    }
}

impl fmt::Debug for DriverDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverDescriptor")
            .field("factory_type", &self.factory_type)
            .field(
                "services",
                &self.services.iter().map(|(id, _)| id).collect::<Vec<_>>(),
            )
            .field("object_types", &self.object_types)
            .finish()
    }
}

#[derive(Default)]
struct FactoryState {
    creators: HashMap<ObjectTypeId, CreatorFunction>,
    object_types: Vec<ObjectTypeId>,
    initialized: bool,
}

impl FactoryState {
    fn register_creator_function(
        &mut self,
        object_type: ObjectTypeId,
        creator: CreatorFunction,
    ) -> Result<(), RegistryError> {
        match self.creators.entry(object_type) {
            Entry::Occupied(entry) => Err(RegistryError::DuplicateItem(format!(
                "creator function for '{}'",
                entry.key()
            ))),
            Entry::Vacant(entry) => {
                entry.insert(creator);
                Ok(())
            }
        }
    }

    fn register_object_types(&mut self, object_types: &[ObjectTypeId]) -> Result<(), RegistryError> {
        let mut seen = HashSet::new();
        for object_type in object_types {
            if !seen.insert(object_type) {
                return Err(RegistryError::DuplicateItem(format!(
                    "object type '{}'",
                    object_type
                )));
            }
            if !self.creators.contains_key(object_type) {
                return Err(RegistryError::MissingCreator(object_type.to_string()));
            }
        }
        self.object_types = object_types.to_vec();
        Ok(())
    }
}

/// Constructs instances of one backend's types from their identifiers.
///
/// [`initialize`](Self::initialize) applies the descriptor; afterwards every
/// claimed id has exactly one creator and the claimed list is frozen.
pub struct DriverFactory {
    descriptor: DriverDescriptor,
    state: RwLock<FactoryState>,
}

impl DriverFactory {
    pub fn new(descriptor: DriverDescriptor) -> Self {
        Self {
            descriptor,
            state: RwLock::new(FactoryState::default()),
        }
    }

    pub fn factory_type(&self) -> &FactoryTypeId {
        &self.descriptor.factory_type
    }

    pub fn is_initialized(&self) -> bool {
        lock::read(&self.state).initialized
    }

    /// Register the descriptor's services, then its claimed object types.
    ///
    /// Either the whole descriptor is applied or nothing is. Calling this on
    /// an initialized factory does nothing.
    pub fn initialize(&self) -> Result<(), RegistryError> {
        let mut state = lock::write(&self.state);
        if state.initialized {
            return Ok(());
        }

        let mut staged = FactoryState {
            creators: state.creators.clone(),
            ..FactoryState::default()
        };
        for (object_type, creator) in &self.descriptor.services {
            staged.register_creator_function(object_type.clone(), Arc::clone(creator))?;
        }
        staged.register_object_types(&self.descriptor.object_types)?;
        staged.initialized = true;

        *state = staged;
        tracing::debug!(
            factory = %self.factory_type(),
            object_types = state.object_types.len(),
            "Factory initialized"
        );
        Ok(())
    }

    /// Register a creator for `object_type` outside the descriptor.
    pub fn register_creator_function<F>(
        &self,
        object_type: impl Into<ObjectTypeId>,
        creator: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn() -> Instance + Send + Sync + 'static,
    {
        lock::write(&self.state).register_creator_function(object_type.into(), Arc::new(creator))
    }

    /// Construct a new instance of `object_type`.
    pub fn create_instance(&self, object_type: &str) -> Result<Instance, RegistryError> {
        self.try_create_instance(object_type).ok_or_else(|| {
            RegistryError::ItemNotFound(format!(
                "object type '{}' in factory '{}'",
                object_type,
                self.factory_type()
            ))
        })
    }

    /// Probe for `object_type`, returning `None` when it is unknown.
    pub fn try_create_instance(&self, object_type: &str) -> Option<Instance> {
        let creator = lock::read(&self.state).creators.get(object_type).cloned()?;
        Some(creator())
    }

    /// Ids this factory claims; empty until initialized.
    pub fn object_types(&self) -> Vec<ObjectTypeId> {
        lock::read(&self.state).object_types.clone()
    }

    pub fn has_creator(&self, object_type: &str) -> bool {
        lock::read(&self.state).creators.contains_key(object_type)
    }
}

impl fmt::Debug for DriverFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverFactory")
            .field("factory_type", self.factory_type())
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

// Object Registry
// Maps symbolic identifiers to constructors so applications can obtain a
// backend object by name without linking against its concrete type.

mod error;
mod factory;
mod manager;

pub use error::RegistryError;
pub use factory::{CreatorFunction, DriverDescriptor, DriverFactory};
pub use manager::FactoryManager;

use std::any::Any;
use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::db::Database;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Names a creatable kind, e.g. `"Database.Odbc.MsSql"`.
    ObjectTypeId
);

string_id!(
    /// Names a driver factory, e.g. `"Factory.Database"`.
    FactoryTypeId
);

/// A backend object produced by a creator function.
pub trait DriverObject: Any + Send + Sync {
    /// Allow downcasting for driver-specific operations
    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;

    /// Converts into a [`Database`] when the object is one.
    fn into_database(self: Box<Self>) -> Option<Box<dyn Database>> {
        None
    }
}

/// Owned result of a successful `create_instance` call.
pub type Instance = Box<dyn DriverObject>;

/// Recovers the concrete type of an instance, `None` on mismatch.
pub fn downcast<T: DriverObject>(instance: Instance) -> Option<Box<T>> {
    instance.into_any().downcast::<T>().ok()
}

//! Collaborators the queue depends on but does not own.
//!
//! Identifier generation, component lookup, the default organization and the
//! clock are all injected so tests can pin them down.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::{Component, Organization};

/// Generates globally unique task identifiers.
pub trait UuidFactory: Send + Sync {
    fn new_uuid(&self) -> String;
}

/// Random v4 uuids.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidV4Factory;

impl UuidFactory for UuidV4Factory {
    fn new_uuid(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Resolves the component a task is attached to.
pub trait ComponentResolver: Send + Sync {
    fn find_by_uuid(&self, uuid: &str) -> Result<Option<Component>>;
}

/// Resolver that knows no components.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoComponents;

impl ComponentResolver for NoComponents {
    fn find_by_uuid(&self, _uuid: &str) -> Result<Option<Component>> {
        Ok(None)
    }
}

/// Components held in memory, keyed by uuid.
#[derive(Debug, Default)]
pub struct InMemoryComponents {
    components: RwLock<HashMap<String, Component>>,
}

impl InMemoryComponents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, component: Component) -> Result<()> {
        let mut components = self
            .components
            .write()
            .map_err(|_| Error::Other("component registry lock poisoned".to_string()))?;
        components.insert(component.uuid.clone(), component);
        Ok(())
    }
}

impl ComponentResolver for InMemoryComponents {
    fn find_by_uuid(&self, uuid: &str) -> Result<Option<Component>> {
        let components = self
            .components
            .read()
            .map_err(|_| Error::Other("component registry lock poisoned".to_string()))?;
        Ok(components.get(uuid).cloned())
    }
}

/// Supplies the organization used when a task has no resolvable component.
pub trait DefaultOrganizationProvider: Send + Sync {
    fn get(&self) -> Organization;
}

/// A fixed default organization.
#[derive(Debug, Clone)]
pub struct StaticOrganization(pub Organization);

impl StaticOrganization {
    pub fn new(uuid: impl Into<String>, key: impl Into<String>, name: impl Into<String>) -> Self {
        Self(Organization {
            uuid: uuid.into(),
            key: key.into(),
            name: name.into(),
        })
    }
}

impl Default for StaticOrganization {
    fn default() -> Self {
        Self::new("AVdefault-organization", "default-organization", "Default Organization")
    }
}

impl DefaultOrganizationProvider for StaticOrganization {
    fn get(&self) -> Organization {
        self.0.clone()
    }
}

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += by;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        // A poisoned lock still holds a valid timestamp.
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

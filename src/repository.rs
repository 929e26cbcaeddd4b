//! Instance registry behind an injectable repository seam.
//!
//! Services receive an `Arc<dyn InstanceRepository>` instead of reaching for
//! module-level state, so the in-memory registry can be swapped for a
//! persistent backend without touching the services. The bundled
//! [`InMemoryInstanceRepository`] is a mutexed map; concurrent mutation of
//! one id is last-write-wins (no distributed locking by design).

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use uuid::Uuid;

use crate::error::Error;
use crate::instance::Instance;

/// Storage operations required by the instance and command services.
pub trait InstanceRepository: Send + Sync {
    /// Stores a new instance record.
    ///
    /// # Errors
    ///
    /// Returns [`Error`] when the backing store rejects the write.
    fn insert(&self, instance: Instance) -> Result<(), Error>;

    /// Fetches an instance by caller-visible id.
    ///
    /// # Errors
    ///
    /// Returns [`Error`] when the backing store fails; an absent record is
    /// `Ok(None)`, not an error.
    fn get(&self, id: Uuid) -> Result<Option<Instance>, Error>;

    /// Fetches an instance by name.
    ///
    /// # Errors
    ///
    /// Returns [`Error`] when the backing store fails.
    fn find_by_name(&self, name: &str) -> Result<Option<Instance>, Error>;

    /// Lists all stored instances.
    ///
    /// # Errors
    ///
    /// Returns [`Error`] when the backing store fails.
    fn list(&self) -> Result<Vec<Instance>, Error>;

    /// Replaces the stored record matching the instance's id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when no record exists for the id.
    fn update(&self, instance: Instance) -> Result<(), Error>;

    /// Removes and returns the record for the id, when one exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error`] when the backing store fails.
    fn remove(&self, id: Uuid) -> Result<Option<Instance>, Error>;
}

/// Resolves a caller-supplied key that may be an instance id or a name.
///
/// # Errors
///
/// Returns [`Error`] when the repository lookup fails.
pub fn resolve(
    repository: &dyn InstanceRepository,
    key: &str,
) -> Result<Option<Instance>, Error> {
    if let Ok(id) = key.parse::<Uuid>() {
        return repository.get(id);
    }
    repository.find_by_name(key)
}

/// Mutexed in-memory registry, the default store for a single process.
#[derive(Debug, Default)]
pub struct InMemoryInstanceRepository {
    entries: Mutex<HashMap<Uuid, Instance>>,
}

impl InMemoryInstanceRepository {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Instance>> {
        // A poisoned lock means a panic elsewhere; the map itself is still
        // coherent for last-write-wins semantics.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl InstanceRepository for InMemoryInstanceRepository {
    fn insert(&self, instance: Instance) -> Result<(), Error> {
        self.entries().insert(instance.id, instance);
        Ok(())
    }

    fn get(&self, id: Uuid) -> Result<Option<Instance>, Error> {
        Ok(self.entries().get(&id).cloned())
    }

    fn find_by_name(&self, name: &str) -> Result<Option<Instance>, Error> {
        Ok(self
            .entries()
            .values()
            .find(|instance| instance.name == name)
            .cloned())
    }

    fn list(&self) -> Result<Vec<Instance>, Error> {
        let mut instances: Vec<Instance> = self.entries().values().cloned().collect();
        instances.sort_by(|lhs, rhs| lhs.created_at.cmp(&rhs.created_at));
        Ok(instances)
    }

    fn update(&self, instance: Instance) -> Result<(), Error> {
        let mut entries = self.entries();
        if !entries.contains_key(&instance.id) {
            return Err(Error::not_found("instance", instance.id.to_string()));
        }
        entries.insert(instance.id, instance);
        Ok(())
    }

    fn remove(&self, id: Uuid) -> Result<Option<Instance>, Error> {
        Ok(self.entries().remove(&id))
    }
}

//! Per-session registry of cancellable resources.
//!
//! Every outstanding operation, subscription and lock request of a client
//! session is stored here under an opaque id together with the closure that
//! undoes it. Deleting an entry cancels the operation; tearing the table down
//! cancels everything the session still owns.

use crate::error::{HubError, HubResult};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Undo action for a resource. Runs at most once, outside the table lock.
pub type Dealloc = Box<dyn FnOnce() -> HubResult<()> + Send>;

struct Entry<V> {
    value: V,
    dealloc: Dealloc,
}

pub struct ResourceTable<V> {
    entries: Mutex<HashMap<String, Entry<V>>>,
}

impl<V: Clone> ResourceTable<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register a resource. A colliding id leaves the existing entry alone,
    /// runs the new `dealloc` and fails `DuplicateResource`.
    pub fn add(
        &self,
        id: impl Into<String>,
        value: V,
        dealloc: impl FnOnce() -> HubResult<()> + Send + 'static,
    ) -> HubResult<()> {
        let id = id.into();
        let rejected: Dealloc = {
            let mut entries = self.entries.lock();
            if !entries.contains_key(&id) {
                entries.insert(
                    id,
                    Entry {
                        value,
                        dealloc: Box::new(dealloc),
                    },
                );
                return Ok(());
            }
            Box::new(dealloc)
        };
        if let Err(e) = rejected() {
            tracing::warn!(resource = %id, error = %e, "dealloc of rejected resource failed");
        }
        Err(HubError::DuplicateResource { id })
    }

    pub fn has(&self, id: &str) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub fn get(&self, id: &str) -> HubResult<V> {
        self.entries
            .lock()
            .get(id)
            .map(|e| e.value.clone())
            .ok_or_else(|| HubError::unknown_resource(id))
    }

    /// Remove a resource, running its dealloc unless `skip_dealloc` is set.
    /// The entry is gone even when the dealloc fails.
    pub fn delete(&self, id: &str, skip_dealloc: bool) -> HubResult<()> {
        let entry = self
            .entries
            .lock()
            .remove(id)
            .ok_or_else(|| HubError::unknown_resource(id))?;
        if skip_dealloc {
            return Ok(());
        }
        (entry.dealloc)()
    }

    /// Run every dealloc once and empty the table. All deallocs are attempted;
    /// their failures are returned.
    pub fn delete_all(&self) -> Vec<HubError> {
        let drained: Vec<(String, Entry<V>)> = self.entries.lock().drain().collect();
        let mut failures = Vec::new();
        for (id, entry) in drained {
            if let Err(e) = (entry.dealloc)() {
                tracing::warn!(resource = %id, error = %e, "dealloc failed during teardown");
                failures.push(e);
            }
        }
        failures
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<V: Clone> Default for ResourceTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "tests/resources_tests.rs"]
mod tests;

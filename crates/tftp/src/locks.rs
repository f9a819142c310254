//! Per-resource lock table
//!
//! One async mutex per registered name, created up front and never resized,
//! so the map itself needs no lock. Sessions for the same name queue on the
//! mutex; sessions for different names never touch each other's entry.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::registry::FileRegistry;

#[derive(Debug, Default)]
pub struct ResourceLocks {
    locks: HashMap<String, Arc<Mutex<()>>>,
}

impl ResourceLocks {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let locks = names
            .into_iter()
            .map(|name| (name.into(), Arc::new(Mutex::new(()))))
            .collect();
        Self { locks }
    }

    pub fn from_registry(registry: &FileRegistry) -> Self {
        Self::new(registry.names())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.locks.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Wait for exclusive use of `name`
    ///
    /// Returns `None` for a name that has no entry. The lock is held until
    /// the returned guard is dropped.
    pub async fn acquire(&self, name: &str) -> Option<ResourceGuard> {
        let lock = Arc::clone(self.locks.get(name)?);

        let guard = match Arc::clone(&lock).try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!("'{}' is busy, waiting for the current transfer", name);
                lock.lock_owned().await
            }
        };

        tracing::trace!("Acquired lock on '{}'", name);
        Some(ResourceGuard {
            name: name.to_string(),
            _guard: guard,
        })
    }
}

/// Exclusive hold on one resource; released on drop
#[derive(Debug)]
pub struct ResourceGuard {
    name: String,
    _guard: OwnedMutexGuard<()>,
}

impl ResourceGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        tracing::trace!("Released lock on '{}'", self.name);
    }
}

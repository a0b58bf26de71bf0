//! Reference-counted named mutexes shared across resources.
//!
//! Resources that mutate the same external object (for example two resources
//! talking to one management controller) declare a common block name; the
//! registry hands each of them a [`NamedLock`] over the same underlying
//! mutex. Reservations are refcounted and the entry is deleted when the
//! count returns to zero. Misuse is an invariant violation and panics.

use std::sync::Arc;

use ahash::HashMap;
use parking_lot::Mutex;

struct Entry {
    mutex: Arc<tokio::sync::Mutex<()>>,
    refcount: usize,
}

/// Process-wide registry of named mutexes. Carried on the init context so
/// there is no ambient global; the scheduler creates one per engine.
#[derive(Default)]
pub struct Registry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reserves `name`, creating the entry on first use, and returns a
    /// handle whose `lock` serializes against every other holder of the
    /// same name. The reservation is released when the handle drops.
    #[must_use]
    pub fn reserve(self: &Arc<Self>, name: &str) -> NamedLock {
        let mutex = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(name.to_owned()).or_insert_with(|| Entry {
                mutex: Arc::new(tokio::sync::Mutex::new(())),
                refcount: 0,
            });
            entry.refcount += 1;
            Arc::clone(&entry.mutex)
        };
        tracing::trace!(name, "reserved shared state");
        NamedLock {
            registry: Arc::clone(self),
            name: name.to_owned(),
            mutex,
        }
    }

    /// Decrements the refcount for `name`, removing the entry at zero.
    ///
    /// # Panics
    ///
    /// Releasing a name that was never reserved, or releasing more times
    /// than reserved, is a programming error and aborts.
    pub fn release(&self, name: &str) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(name) else {
            panic!("released shared state {name:?} that was never reserved");
        };
        assert!(
            entry.refcount > 0,
            "shared state {name:?} released more times than reserved"
        );
        entry.refcount -= 1;
        if entry.refcount == 0 {
            entries.remove(name);
        }
        tracing::trace!(name, "released shared state");
    }

    /// Number of live entries; empty once all reservations are matched.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// A live reservation of one named mutex. Dropping it releases the
/// reservation, so holders cannot leak entries on any exit path.
pub struct NamedLock {
    registry: Arc<Registry>,
    name: String,
    mutex: Arc<tokio::sync::Mutex<()>>,
}

impl NamedLock {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Takes the named mutex, waiting for any other resource holding it.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.mutex.lock().await
    }
}

impl Drop for NamedLock {
    fn drop(&mut self) {
        self.registry.release(&self.name);
    }
}

impl std::fmt::Debug for NamedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedLock").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::Registry;

    #[tokio::test]
    async fn matched_reservations_leave_registry_empty() {
        let registry = Registry::new();
        let first = registry.reserve("bmc0");
        let second = registry.reserve("bmc0");
        assert_eq!(registry.len(), 1);
        drop(first);
        assert_eq!(registry.len(), 1);
        drop(second);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn locks_on_the_same_name_serialize() {
        let registry = Registry::new();
        let first = registry.reserve("bmc0");
        let second = registry.reserve("bmc0");

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let guard = first.lock().await;
        let order2 = Arc::clone(&order);
        let waiter = tokio::spawn(async move {
            let _guard = second.lock().await;
            order2.lock().push("second");
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        order.lock().push("first");
        drop(guard);
        waiter.await.unwrap();

        assert_eq!(*order.lock(), vec!["first", "second"]);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn distinct_names_do_not_contend() {
        let registry = Registry::new();
        let a = registry.reserve("bmc0");
        let b = registry.reserve("bmc1");
        let _ga = a.lock().await;
        // A held lock on bmc0 must not block bmc1.
        let _gb = b.lock().await;
        assert_eq!(registry.len(), 2);
    }

    #[test]
    #[should_panic(expected = "never reserved")]
    fn releasing_unknown_name_panics() {
        let registry = Registry::new();
        registry.release("nope");
    }

    #[test]
    #[should_panic(expected = "never reserved")]
    fn over_releasing_panics() {
        let registry = Registry::new();
        let first = registry.reserve("bmc0");
        let second = registry.reserve("bmc0");
        drop(first);
        drop(second);
        // Both reservations are gone, so the entry no longer exists.
        registry.release("bmc0");
    }
}

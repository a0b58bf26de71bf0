//! The key-value store contracts the engine consumes, plus in-process
//! implementations used by tests and single-host deployments.
//!
//! `World` is shared cluster-wide; `Local` is scoped to the process. The
//! scheduler may substitute network-backed implementations; resources only
//! ever see the traits.

use std::sync::Arc;

use ahash::HashMap;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Cluster-wide string store.
#[async_trait]
pub trait World: Send + Sync {
    /// Fails with a not-found error when the key is absent; an empty value
    /// is a successful read.
    async fn str_get(&self, key: &str) -> Result<String>;

    async fn str_set(&self, key: &str, value: &str) -> Result<()>;

    async fn str_del(&self, key: &str) -> Result<()>;

    /// A channel that yields once per mutation of `key`, starting from the
    /// subscription point. Spurious yields are permitted; consumers
    /// re-observe on every yield.
    async fn str_watch(&self, key: &str) -> Result<mpsc::Receiver<()>>;
}

/// Per-process typed value store.
#[async_trait]
pub trait Local: Send + Sync {
    async fn value_get(&self, key: &str) -> Result<Value>;

    async fn value_set(&self, key: &str, value: Value) -> Result<()>;

    async fn value_watch(&self, key: &str) -> Result<mpsc::Receiver<()>>;
}

#[derive(Default)]
struct KvInner<V> {
    values: HashMap<String, V>,
    watchers: HashMap<String, Vec<mpsc::Sender<()>>>,
}

impl<V> KvInner<V> {
    fn notify(&mut self, key: &str) {
        if let Some(watchers) = self.watchers.get_mut(key) {
            // A full buffer already carries a pending wake; dropping the
            // extra signal keeps the coalescing semantics.
            watchers.retain(|tx| !tx.is_closed());
            for tx in watchers {
                let _ = tx.try_send(());
            }
        }
    }

    fn watch(&mut self, key: &str) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        self.watchers.entry(key.to_owned()).or_default().push(tx);
        rx
    }
}

/// In-memory [`World`] implementation.
#[derive(Default)]
pub struct MemWorld {
    inner: Mutex<KvInner<String>>,
}

impl MemWorld {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl World for MemWorld {
    async fn str_get(&self, key: &str) -> Result<String> {
        self.inner
            .lock()
            .values
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_owned()))
    }

    async fn str_set(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.values.insert(key.to_owned(), value.to_owned());
        inner.notify(key);
        Ok(())
    }

    async fn str_del(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.values.remove(key);
        inner.notify(key);
        Ok(())
    }

    async fn str_watch(&self, key: &str) -> Result<mpsc::Receiver<()>> {
        Ok(self.inner.lock().watch(key))
    }
}

/// In-memory [`Local`] implementation.
#[derive(Default)]
pub struct MemLocal {
    inner: Mutex<KvInner<Value>>,
}

impl MemLocal {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Local for MemLocal {
    async fn value_get(&self, key: &str) -> Result<Value> {
        self.inner
            .lock()
            .values
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_owned()))
    }

    async fn value_set(&self, key: &str, value: Value) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.values.insert(key.to_owned(), value);
        inner.notify(key);
        Ok(())
    }

    async fn value_watch(&self, key: &str) -> Result<mpsc::Receiver<()>> {
        Ok(self.inner.lock().watch(key))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Local, MemLocal, MemWorld, World};

    #[tokio::test]
    async fn missing_key_is_not_found_and_distinct_from_empty() {
        let world = MemWorld::new();
        assert!(world.str_get("k").await.unwrap_err().is_not_found());
        world.str_set("k", "").await.unwrap();
        assert_eq!(world.str_get("k").await.unwrap(), "");
    }

    #[tokio::test]
    async fn watch_yields_on_every_mutation() {
        let world = MemWorld::new();
        let mut rx = world.str_watch("k").await.unwrap();
        world.str_set("k", "v1").await.unwrap();
        rx.recv().await.unwrap();
        world.str_del("k").await.unwrap();
        rx.recv().await.unwrap();
    }

    #[tokio::test]
    async fn watch_is_per_key() {
        let world = MemWorld::new();
        let mut rx = world.str_watch("a").await.unwrap();
        world.str_set("b", "v").await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn local_round_trips_values() {
        let local = MemLocal::new();
        local.value_set("v", json!({"n": 1})).await.unwrap();
        assert_eq!(local.value_get("v").await.unwrap(), json!({"n": 1}));
    }
}

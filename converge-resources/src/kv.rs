//! One key in the cluster-wide world store, held at a desired value.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use converge_core::cmp::{self, CmpMismatch};
use converge_core::context::Context;
use converge_core::error::{Error, Result};
use converge_core::resource::{MetaParams, Resource};
use converge_runtime::apply::absorb_transient;

const KIND: &str = "kv";

#[derive(Default)]
pub struct KvRes {
    pub name: String,
    pub meta: MetaParams,
    /// World store key; defaults to the resource name when empty.
    pub key: String,
    pub value: String,
}

impl KvRes {
    fn key(&self) -> &str {
        if self.key.is_empty() {
            &self.name
        } else {
            &self.key
        }
    }

    async fn observe_and_set(&self, ctx: &Context, apply: bool) -> Result<bool> {
        let key = self.key();
        match ctx.world().str_get(key).await {
            // An empty stored value is a real value, not a missing key.
            Ok(stored) if stored == self.value => return Ok(true),
            Ok(_) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        if !apply {
            return Ok(false);
        }
        ctx.world().str_set(key, &self.value).await?;
        tracing::debug!(key, "world key converged");
        Ok(false)
    }
}

#[async_trait]
impl Resource for KvRes {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn meta(&self) -> &MetaParams {
        &self.meta
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::validation("kv resource requires a name"));
        }
        Ok(())
    }

    async fn init(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    async fn watch(&self, ctx: &Context) -> Result<()> {
        let mut changes = ctx.world().str_watch(self.key()).await?;
        ctx.running();
        loop {
            tokio::select! {
                () = ctx.cancelled() => return Ok(()),
                changed = changes.recv() => {
                    if changed.is_none() || ctx.event().await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn check_apply(&self, ctx: &Context, apply: bool) -> Result<bool> {
        let _ = ctx.refresh();
        absorb_transient(self.observe_and_set(ctx, apply).await)
    }

    fn cmp(&self, other: &dyn Resource) -> Result<(), CmpMismatch> {
        let Some(other) = other.as_any().downcast_ref::<KvRes>() else {
            return Err(CmpMismatch::kind(KIND));
        };
        cmp::field(KIND, "name", &self.name, &other.name)?;
        cmp::field(KIND, "meta", &self.meta, &other.meta)?;
        cmp::field(KIND, "key", &self.key, &other.key)?;
        cmp::field(KIND, "value", &self.value, &other.value)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::KvRes;
    use converge_core::world::{MemWorld, World};
    use converge_runtime::runner::Runner;

    #[tokio::test]
    async fn converges_the_key_and_settles() {
        let world = MemWorld::new();
        let res = KvRes {
            name: "motd".into(),
            value: "welcome".into(),
            ..KvRes::default()
        };
        let w = Arc::clone(&world);
        let mut runner = Runner::start_with(Arc::new(res), move |b| b.world(w))
            .await
            .unwrap();

        assert!(!runner.converge().await.unwrap());
        assert_eq!(world.str_get("motd").await.unwrap(), "welcome");
        assert!(runner.converge().await.unwrap());
        runner.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn empty_value_differs_from_missing_key() {
        let world = MemWorld::new();
        let res = KvRes {
            name: "empty".into(),
            value: String::new(),
            ..KvRes::default()
        };
        let w = Arc::clone(&world);
        let mut runner = Runner::start_with(Arc::new(res), move |b| b.world(w))
            .await
            .unwrap();

        // Missing key is divergent even though the desired value is empty.
        assert!(!runner.check().await.unwrap());
        assert!(!runner.converge().await.unwrap());
        assert_eq!(world.str_get("empty").await.unwrap(), "");
        assert!(runner.converge().await.unwrap());
        runner.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn external_writes_wake_the_watch() {
        let world = MemWorld::new();
        let res = KvRes {
            name: "motd".into(),
            value: "welcome".into(),
            ..KvRes::default()
        };
        let w = Arc::clone(&world);
        let mut runner = Runner::start_with(Arc::new(res), move |b| b.world(w))
            .await
            .unwrap();
        runner.converge().await.unwrap();

        world.str_set("motd", "defaced").await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                runner.next_event().await.unwrap();
                if !runner.converge().await.unwrap() {
                    break;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(world.str_get("motd").await.unwrap(), "welcome");
        runner.shutdown().await.unwrap();
    }
}

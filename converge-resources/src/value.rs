//! A typed value holder: the simplest send/receive participant.
//!
//! The desired value is either configured statically or received from an
//! upstream resource; converging stores it in the process-local KV and
//! publishes it downstream as `{value}`.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use converge_core::cmp::{self, CmpMismatch};
use converge_core::context::Context;
use converge_core::error::{Error, Result};
use converge_core::resource::{MetaParams, Resource, Sendable};
use converge_core::send::SendBundle;

const KIND: &str = "value";

#[derive(Default)]
pub struct ValueRes {
    pub name: String,
    pub meta: MetaParams,
    /// Statically configured value; a wired `value` input overrides it.
    pub value: Option<Value>,

    state: ValueState,
}

#[derive(Default)]
struct ValueState {
    sent: Mutex<Option<Option<Value>>>,
}

impl ValueRes {
    fn store_key(&self) -> String {
        format!("value-{}", self.name)
    }
}

#[async_trait]
impl Resource for ValueRes {
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
            return Err(Error::validation("value resource requires a name"));
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
        let mut changes = ctx.local().value_watch(&self.store_key()).await?;
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
        if ctx.refresh() {
            *self.state.sent.lock() = None;
        }

        // A wired input takes precedence over the configured value.
        let desired = ctx
            .recv()
            .get("value")
            .map(|entry| entry.value.clone())
            .or_else(|| self.value.clone());

        let stored = match ctx.local().value_get(&self.store_key()).await {
            Ok(value) => Some(value),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err),
        };

        // With nothing configured and nothing wired there is no store state
        // to hold in sync.
        let in_sync = desired.is_none() || stored == desired;
        let settled = in_sync && self.state.sent.lock().as_ref() == Some(&desired);
        if settled {
            ctx.send(SendBundle::new().with("value", desired)).await?;
            return Ok(true);
        }
        if !apply {
            return Ok(false);
        }

        if let Some(value) = desired.as_ref().filter(|_| !in_sync) {
            ctx.local().value_set(&self.store_key(), value.clone()).await?;
        }
        ctx.send(SendBundle::new().with("value", desired.clone())).await?;
        *self.state.sent.lock() = Some(desired);
        Ok(false)
    }

    fn cmp(&self, other: &dyn Resource) -> Result<(), CmpMismatch> {
        let Some(other) = other.as_any().downcast_ref::<ValueRes>() else {
            return Err(CmpMismatch::kind(KIND));
        };
        cmp::field(KIND, "name", &self.name, &other.name)?;
        cmp::field(KIND, "meta", &self.meta, &other.meta)?;
        cmp::field(KIND, "value", &self.value, &other.value)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn as_sendable(&self) -> Option<&dyn Sendable> {
        Some(self)
    }
}

impl Sendable for ValueRes {
    fn sends(&self) -> SendBundle {
        SendBundle::new().with("value", None)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::ValueRes;
    use converge_core::world::{Local, MemLocal};
    use converge_runtime::runner::Runner;

    #[tokio::test]
    async fn static_value_converges_into_the_local_store() {
        let local = MemLocal::new();
        let res = ValueRes {
            name: "greeting".into(),
            value: Some(json!("hello")),
            ..ValueRes::default()
        };
        let store = Arc::clone(&local);
        let mut runner = Runner::start_with(Arc::new(res), move |b| b.local(store))
            .await
            .unwrap();

        assert!(!runner.converge().await.unwrap());
        assert_eq!(
            local.value_get("value-greeting").await.unwrap(),
            json!("hello")
        );
        assert_eq!(
            runner.sends().unwrap().value_str("value"),
            Some("hello")
        );
        assert!(runner.converge().await.unwrap());
        runner.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn wired_input_overrides_the_configured_value() {
        let res = ValueRes {
            name: "v".into(),
            value: Some(json!("static")),
            ..ValueRes::default()
        };
        let mut runner = Runner::start(Arc::new(res)).await.unwrap();

        runner.recv_port().wire("value", json!("wired"));
        assert!(!runner.converge().await.unwrap());
        assert_eq!(runner.sends().unwrap().value_str("value"), Some("wired"));

        // Same wired value again: settled.
        assert!(runner.converge().await.unwrap());

        runner.recv_port().wire("value", json!("rewired"));
        assert!(!runner.converge().await.unwrap());
        assert_eq!(runner.sends().unwrap().value_str("value"), Some("rewired"));
        runner.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn external_store_changes_produce_events() {
        let local = MemLocal::new();
        let res = ValueRes {
            name: "v".into(),
            value: Some(json!("mine")),
            ..ValueRes::default()
        };
        let store = Arc::clone(&local);
        let mut runner = Runner::start_with(Arc::new(res), move |b| b.local(store))
            .await
            .unwrap();
        runner.converge().await.unwrap();

        local.value_set("value-v", json!("meddled")).await.unwrap();
        assert_eq!(runner.next_event().await, Some(()));
        assert!(!runner.converge().await.unwrap());
        assert_eq!(local.value_get("value-v").await.unwrap(), json!("mine"));
        runner.shutdown().await.unwrap();
    }
}

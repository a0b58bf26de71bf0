//! A reference single-resource driver.
//!
//! The real graph scheduler lives outside this workspace; `Runner` is the
//! executable form of the contract it must satisfy: validate, init, spawn
//! exactly one watch task, wait for running before consuming events, invoke
//! at most one `check_apply` at a time, and on shutdown cancel, join the
//! watch, then run cleanup exactly once. The test-suites across the
//! workspace drive resources through it.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::Instrument;

use converge_core::context::{Context, ContextBuilder, ContextDriver, RecvPort, SendSlot};
use converge_core::error::{Accumulator, Error, Result};
use converge_core::resource::Resource;
use converge_core::send::SendBundle;

pub struct Runner {
    resource: Arc<dyn Resource>,
    ctx: Context,
    driver: ContextDriver,
    watch: Option<JoinHandle<Result<()>>>,
    watch_result: Option<Result<()>>,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner").finish_non_exhaustive()
    }
}

impl Runner {
    /// Starts `resource` with a default context.
    pub async fn start(resource: Arc<dyn Resource>) -> Result<Self> {
        Self::start_with(resource, |builder| builder).await
    }

    /// Starts `resource`, letting `configure` adjust the context (var dir,
    /// stores, shared registry, wiring).
    pub async fn start_with(
        resource: Arc<dyn Resource>,
        configure: impl FnOnce(ContextBuilder) -> ContextBuilder,
    ) -> Result<Self> {
        resource.validate()?;

        let builder = Context::builder(resource.kind(), resource.name());
        let (ctx, mut driver) = configure(builder).build();

        if let Err(err) = resource.init(&ctx).await {
            // Cleanup still runs after a failed init.
            let _ = resource.cleanup().await;
            return Err(err);
        }
        // A resource restarted by a graph swap exposes its previous outputs
        // without a fresh apply.
        ctx.restore_sends().await?;

        let watched = Arc::clone(&resource);
        let watch_ctx = ctx.clone();
        let span = ctx.span();
        let mut watch = tokio::spawn(
            async move { watched.watch(&watch_ctx).await }.instrument(span),
        );

        // Readiness, unless the watch dies first.
        tokio::select! {
            started = driver.started() => {
                if let Err(err) = started {
                    let _ = resource.cleanup().await;
                    return Err(err);
                }
            }
            ended = &mut watch => {
                let err = match ended {
                    Ok(Ok(())) => Error::init("watch returned before signalling running"),
                    Ok(Err(err)) => err,
                    Err(join_err) => Error::Programming(format!("watch task died: {join_err}")),
                };
                let _ = resource.cleanup().await;
                return Err(err);
            }
        }

        Ok(Self {
            resource,
            ctx,
            driver,
            watch: Some(watch),
            watch_result: None,
        })
    }

    #[must_use]
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    #[must_use]
    pub fn resource(&self) -> &Arc<dyn Resource> {
        &self.resource
    }

    /// The last bundle the resource published, if any.
    #[must_use]
    pub fn sends(&self) -> Option<SendBundle> {
        self.driver.send_slot().peek()
    }

    #[must_use]
    pub fn send_slot(&self) -> &SendSlot {
        self.driver.send_slot()
    }

    /// The port upstream outputs are wired into.
    #[must_use]
    pub fn recv_port(&self) -> &RecvPort {
        self.driver.recv_port()
    }

    /// Marks the next `check_apply` as refreshed.
    pub fn refresh(&self) {
        self.driver.set_refresh();
    }

    /// The next change event from the watch; `None` once the watch ended.
    pub async fn next_event(&mut self) -> Option<()> {
        let Some(mut handle) = self.watch.take() else {
            return None;
        };
        tokio::select! {
            event = self.driver.next_event() => {
                self.watch = Some(handle);
                event
            }
            ended = &mut handle => {
                self.watch_result = Some(flatten_join(ended));
                // A late coalesced event may still be queued.
                self.driver.try_event().then_some(())
            }
        }
    }

    /// One serialized reconcile with apply enabled. `Ok(true)` means no
    /// change was performed.
    pub async fn converge(&mut self) -> Result<bool> {
        self.resource.check_apply(&self.ctx, true).await
    }

    /// One serialized dry-run observation.
    pub async fn check(&mut self) -> Result<bool> {
        self.resource.check_apply(&self.ctx, false).await
    }

    /// Waits for the next event and reconciles; `Ok(None)` once the watch
    /// has ended.
    pub async fn step(&mut self) -> Result<Option<bool>> {
        match self.next_event().await {
            Some(()) => self.converge().await.map(Some),
            None => Ok(None),
        }
    }

    /// Cancels the resource, joins the watch and runs cleanup. Watch
    /// cancellation is not an error; anything else is accumulated with the
    /// cleanup result.
    pub async fn shutdown(mut self) -> Result<()> {
        self.driver.cancel();
        let watch_result = match self.watch.take() {
            Some(handle) => flatten_join(handle.await),
            None => self.watch_result.take().unwrap_or(Ok(())),
        };
        let mut acc = Accumulator::new();
        match watch_result {
            Err(err) if err.is_cancelled() => {}
            other => acc.push(other),
        }
        acc.push(self.resource.cleanup().await);
        acc.finish()
    }
}

fn flatten_join(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(join_err) => Err(Error::Programming(format!("watch task died: {join_err}"))),
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::Runner;
    use converge_core::cmp::CmpMismatch;
    use converge_core::context::Context;
    use converge_core::error::{Error, Result};
    use converge_core::resource::{MetaParams, Resource};
    use converge_core::send::SendBundle;

    /// Emits one event per tick until cancelled; records call ordering.
    struct Ticker {
        meta: MetaParams,
        events: usize,
        running_seen: AtomicBool,
        applies: AtomicUsize,
        cleanups: AtomicUsize,
        concurrent: AtomicBool,
    }

    impl Ticker {
        fn new(events: usize) -> Arc<Self> {
            Arc::new(Self {
                meta: MetaParams::default(),
                events,
                running_seen: AtomicBool::new(false),
                applies: AtomicUsize::new(0),
                cleanups: AtomicUsize::new(0),
                concurrent: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Resource for Ticker {
        fn kind(&self) -> &'static str {
            "tick"
        }
        fn name(&self) -> &str {
            "t"
        }
        fn meta(&self) -> &MetaParams {
            &self.meta
        }
        fn validate(&self) -> Result<()> {
            Ok(())
        }
        async fn init(&self, _ctx: &Context) -> Result<()> {
            Ok(())
        }
        async fn cleanup(&self) -> Result<()> {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn watch(&self, ctx: &Context) -> Result<()> {
            ctx.running();
            self.running_seen.store(true, Ordering::SeqCst);
            for _ in 0..self.events {
                ctx.event().await?;
            }
            ctx.cancelled().await;
            Ok(())
        }
        async fn check_apply(&self, ctx: &Context, apply: bool) -> Result<bool> {
            assert!(
                !self.concurrent.swap(true, Ordering::SeqCst),
                "two applies ran at once"
            );
            assert!(self.running_seen.load(Ordering::SeqCst));
            tokio::time::sleep(Duration::from_millis(10)).await;
            let n = self.applies.fetch_add(1, Ordering::SeqCst);
            if apply {
                ctx.send(SendBundle::new().with("count", Some(json!(n + 1))))
                    .await?;
            }
            self.concurrent.store(false, Ordering::SeqCst);
            Ok(false)
        }
        fn cmp(&self, _other: &dyn Resource) -> Result<(), CmpMismatch> {
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    #[tokio::test]
    async fn drives_the_full_lifecycle_in_order() {
        let resource = Ticker::new(3);
        let mut runner = Runner::start(Arc::clone(&resource) as Arc<dyn Resource>)
            .await
            .unwrap();

        while let Some(_state_ok) = runner.step().await.unwrap() {
            if resource.applies.load(Ordering::SeqCst) == 3 {
                break;
            }
        }
        assert_eq!(resource.applies.load(Ordering::SeqCst), 3);
        assert_eq!(
            runner.sends().unwrap().get("count"),
            Some(&Some(json!(3)))
        );

        runner.shutdown().await.unwrap();
        assert_eq!(resource.cleanups.load(Ordering::SeqCst), 1);
    }

    #[derive(Default)]
    struct NeverRuns {
        meta: MetaParams,
    }

    #[async_trait]
    impl Resource for NeverRuns {
        fn kind(&self) -> &'static str {
            "broken"
        }
        fn name(&self) -> &str {
            "b"
        }
        fn meta(&self) -> &MetaParams {
            &self.meta
        }
        fn validate(&self) -> Result<()> {
            Ok(())
        }
        async fn init(&self, _ctx: &Context) -> Result<()> {
            Ok(())
        }
        async fn cleanup(&self) -> Result<()> {
            Ok(())
        }
        async fn watch(&self, _ctx: &Context) -> Result<()> {
            // Returns without ever calling running().
            Err(Error::init("no event source"))
        }
        async fn check_apply(&self, _ctx: &Context, _apply: bool) -> Result<bool> {
            Ok(true)
        }
        fn cmp(&self, _other: &dyn Resource) -> Result<(), CmpMismatch> {
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    #[tokio::test]
    async fn watch_failing_before_running_fails_start() {
        let err = Runner::start(Arc::new(NeverRuns::default())).await.unwrap_err();
        assert!(matches!(err, Error::Init(msg) if msg.contains("no event source")));
    }
}

//! Machinery for composite resources that absorb children at runtime.
//!
//! A parent owns an ordered [`ChildSet`]. Adoption happens before init;
//! at watch time the parent calls [`ChildSet::start`], which gives every
//! child a synthesized context (events multiplexed into one channel, sends
//! retained for the parent to relay, no filtered graph) and spawns its
//! watch on an owned task. The parent must not declare itself running
//! until `start` returns: it resolves only once every child has signalled
//! readiness, and fails if any child ends first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use converge_core::context::{Context, SendSlot};
use converge_core::error::{Accumulator, Error, Result};
use converge_core::resource::{kind_groupable, Resource};
use converge_core::send::SendBundle;

/// The ordered set of children a composite parent has adopted, plus their
/// live contexts once started.
pub struct ChildSet {
    parent_kind: String,
    parent_name: String,
    children: Mutex<Vec<Arc<dyn Resource>>>,
    ctxs: Mutex<Vec<Context>>,
    slots: Mutex<Vec<SendSlot>>,
    cleaned: AtomicBool,
}

impl ChildSet {
    #[must_use]
    pub fn new(parent_kind: &str, parent_name: &str) -> Self {
        Self {
            parent_kind: parent_kind.to_owned(),
            parent_name: parent_name.to_owned(),
            children: Mutex::new(Vec::new()),
            ctxs: Mutex::new(Vec::new()),
            slots: Mutex::new(Vec::new()),
            cleaned: AtomicBool::new(false),
        }
    }

    /// The adoption predicate: the child must be groupable at all, declare
    /// no parent name or this parent's, and carry a kind one segment below
    /// the parent's.
    #[must_use]
    pub fn would_group(&self, child: &dyn Resource) -> bool {
        let Some(grouped) = child.as_group_child() else {
            return false;
        };
        if let Some(parent) = grouped.parent_name() {
            if !parent.is_empty() && parent != self.parent_name {
                return false;
            }
        }
        kind_groupable(&self.parent_kind, child.kind())
    }

    /// Adds `child` to the set, in graph order.
    pub fn adopt(&self, child: Arc<dyn Resource>) -> Result<()> {
        if child.as_group_child().is_none() {
            return Err(Error::validation(format!(
                "{child} cannot be grouped under {}",
                self.parent_kind
            )));
        }
        if !self.would_group(child.as_ref()) {
            return Err(Error::validation(format!(
                "{child} does not group under {}[{}]",
                self.parent_kind, self.parent_name
            )));
        }
        tracing::debug!(child = %child.as_ref(), "adopted into composite");
        self.children.lock().push(child);
        Ok(())
    }

    #[must_use]
    pub fn children(&self) -> Vec<Arc<dyn Resource>> {
        self.children.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.children.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.lock().is_empty()
    }

    /// Validates, initializes and launches every adopted child, in order.
    /// Resolves once all of them have signalled running; a child that
    /// errors first fails the whole start.
    pub async fn start(&self, parent: &Context) -> Result<GroupRun> {
        let children = self.children();
        let (mux_tx, mux_rx) = mpsc::channel(children.len().max(1));
        let mut run = GroupRun {
            events: mux_rx,
            watches: JoinSet::new(),
            forwarders: JoinSet::new(),
            tokens: Vec::with_capacity(children.len()),
        };

        for (idx, child) in children.iter().enumerate() {
            if let Err(err) = self.start_child(parent, idx, child, &mux_tx, &mut run).await {
                run.cancel();
                let _ = run.drain().await;
                return Err(err);
            }
        }
        Ok(run)
    }

    async fn start_child(
        &self,
        parent: &Context,
        idx: usize,
        child: &Arc<dyn Resource>,
        mux_tx: &mpsc::Sender<usize>,
        run: &mut GroupRun,
    ) -> Result<()> {
        child.validate()?;

        let token = parent.token().child_token();
        let mut builder = Context::builder(child.kind(), child.name())
            .debug(parent.debug())
            .world(parent.world())
            .local(parent.local())
            .named(Arc::clone(parent.named()))
            .token(token.clone());
        if let Some(base) = parent.var_base() {
            builder = builder.var_base(base);
        }
        let (ctx, mut driver) = builder.build();
        // The parent mediates the child's sends: keep the slot so it can
        // relay published values.
        let slot = driver.send_slot().clone();

        child.init(&ctx).await?;

        let (end_tx, end_rx) = oneshot::channel::<()>();
        let span = ctx.span();
        let watched = Arc::clone(child);
        let watch_ctx = ctx.clone();
        run.watches.spawn(
            async move {
                let result = watched.watch(&watch_ctx).await;
                drop(end_tx);
                (idx, result)
            }
            .instrument(span),
        );

        // Block until this child is live, or it dies trying.
        tokio::select! {
            started = driver.started() => started?,
            _ = end_rx => {
                let detail = run
                    .take_finished(idx)
                    .map_or_else(String::new, |err| format!(": {err}"));
                return Err(Error::init(format!(
                    "child {child} ended before starting{detail}"
                )));
            }
        }

        let mux = mux_tx.clone();
        run.forwarders.spawn(async move {
            while driver.next_event().await.is_some() {
                if mux.send(idx).await.is_err() {
                    break;
                }
            }
        });

        run.tokens.push(token);
        self.ctxs.lock().push(ctx);
        self.slots.lock().push(slot);
        Ok(())
    }

    /// The last bundle the named child published, if any.
    #[must_use]
    pub fn child_sends(&self, name: &str) -> Option<SendBundle> {
        let idx = self
            .children
            .lock()
            .iter()
            .position(|child| child.name() == name)?;
        self.slots.lock().get(idx)?.peek()
    }

    /// Recursively invokes every started child's `check_apply`, so children
    /// publish their send values; the result is the conjunction of their
    /// `state_ok`s.
    pub async fn check_apply_all(&self, apply: bool) -> Result<bool> {
        let children = self.children();
        let ctxs = self.ctxs.lock().clone();
        let mut all_ok = true;
        for (child, ctx) in children.iter().zip(ctxs.iter()) {
            let ok = child.check_apply(ctx, apply).await?;
            all_ok = all_ok && ok;
        }
        Ok(all_ok)
    }

    /// Runs every child's `cleanup` exactly once, accumulating errors.
    pub async fn cleanup_all(&self) -> Result<()> {
        if self.cleaned.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut acc = Accumulator::new();
        for child in self.children() {
            acc.push(child.cleanup().await);
        }
        self.ctxs.lock().clear();
        self.slots.lock().clear();
        acc.finish()
    }
}

/// The live half of a started child set, owned by the parent's watch loop.
#[derive(Debug)]
pub struct GroupRun {
    events: mpsc::Receiver<usize>,
    watches: JoinSet<(usize, Result<()>)>,
    forwarders: JoinSet<()>,
    tokens: Vec<CancellationToken>,
}

impl GroupRun {
    /// The next multiplexed child event: the index of the child that
    /// signalled. `None` once every child watch has gone away.
    pub async fn next_event(&mut self) -> Option<usize> {
        self.events.recv().await
    }

    fn cancel(&self) {
        for token in &self.tokens {
            token.cancel();
        }
    }

    fn take_finished(&mut self, idx: usize) -> Option<Error> {
        while let Some(joined) = self.watches.try_join_next() {
            if let Ok((done_idx, Err(err))) = joined {
                if done_idx == idx {
                    return Some(err);
                }
            }
        }
        None
    }

    async fn drain(&mut self) -> Result<()> {
        let mut acc = Accumulator::new();
        while let Some(joined) = self.watches.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((_, Err(err))) if err.is_cancelled() => {}
                Ok((idx, Err(err))) => {
                    tracing::warn!(child = idx, %err, "child watch failed");
                    acc.push(Err(err));
                }
                Err(join_err) => acc.push(Err(Error::Programming(format!(
                    "child watch task died: {join_err}"
                )))),
            }
        }
        self.forwarders.abort_all();
        while self.forwarders.join_next().await.is_some() {}
        acc.finish()
    }

    /// Cancels every child watch and waits for them to unwind, collecting
    /// non-cancellation errors.
    pub async fn shutdown(mut self) -> Result<()> {
        self.cancel();
        self.drain().await
    }
}

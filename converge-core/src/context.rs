//! The collaborator bundle a resource uses to interact with the scheduler.
//!
//! [`Context::pair`] style construction produces two halves: the [`Context`]
//! handed to the resource (valid from `init` until `cleanup` returns) and
//! the [`ContextDriver`] kept by whoever schedules it. Composite parents
//! synthesize child contexts the same way, pointing the child's events at
//! their own multiplexed channel.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::resource::Resource;
use crate::send::{RecvEntry, SendBundle};
use crate::sendcache;
use crate::shared::Registry;
use crate::world::{Local, MemLocal, MemWorld, World};

/// Read-only view of the peer resources this resource is permitted to see,
/// for policy queries.
#[derive(Clone, Default)]
pub struct FilteredGraph {
    peers: Vec<Arc<dyn Resource>>,
}

impl FilteredGraph {
    #[must_use]
    pub fn new(peers: Vec<Arc<dyn Resource>>) -> Self {
        Self { peers }
    }

    #[must_use]
    pub fn peers(&self) -> &[Arc<dyn Resource>] {
        &self.peers
    }

    pub fn of_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Arc<dyn Resource>> {
        self.peers.iter().filter(move |r| r.kind() == kind)
    }

    #[must_use]
    pub fn find(&self, kind: &str, name: &str) -> Option<&Arc<dyn Resource>> {
        self.peers
            .iter()
            .find(|r| r.kind() == kind && r.name() == name)
    }
}

/// The published-outputs slot shared between a resource's context and the
/// scheduler that forwards bundles downstream.
#[derive(Clone, Default)]
pub struct SendSlot {
    inner: Arc<Mutex<Option<SendBundle>>>,
}

impl SendSlot {
    pub fn put(&self, bundle: SendBundle) {
        *self.inner.lock() = Some(bundle);
    }

    /// Removes and returns the pending bundle, if any.
    #[must_use]
    pub fn take(&self) -> Option<SendBundle> {
        self.inner.lock().take()
    }

    /// Returns a copy of the pending bundle without consuming it.
    #[must_use]
    pub fn peek(&self) -> Option<SendBundle> {
        self.inner.lock().clone()
    }
}

/// The wired-inputs port the scheduler fills before invoking `check_apply`.
#[derive(Clone, Default)]
pub struct RecvPort {
    inner: Arc<Mutex<BTreeMap<String, RecvEntry>>>,
}

impl RecvPort {
    /// Scheduler side: delivers an upstream value into the named local
    /// field. The changed flag latches until the next `recv` read.
    pub fn wire(&self, field: &str, value: Value) {
        let mut entries = self.inner.lock();
        match entries.get_mut(field) {
            Some(entry) => {
                if entry.value != value {
                    entry.value = value;
                    entry.changed = true;
                }
            }
            None => {
                entries.insert(
                    field.to_owned(),
                    RecvEntry {
                        value,
                        changed: true,
                    },
                );
            }
        }
    }

    fn read(&self) -> BTreeMap<String, RecvEntry> {
        let mut entries = self.inner.lock();
        let snapshot = entries.clone();
        for entry in entries.values_mut() {
            entry.changed = false;
        }
        snapshot
    }
}

struct Inner {
    kind: String,
    name: String,
    debug: bool,
    span: tracing::Span,
    running: Mutex<Option<oneshot::Sender<()>>>,
    events: mpsc::Sender<()>,
    token: CancellationToken,
    refresh: Arc<AtomicBool>,
    send: SendSlot,
    recv: RecvPort,
    world: Arc<dyn World>,
    local: Arc<dyn Local>,
    graph: Option<FilteredGraph>,
    named: Arc<Registry>,
    var_base: Option<PathBuf>,
}

/// Per-resource init context. Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    #[must_use]
    pub fn builder(kind: &str, name: &str) -> ContextBuilder {
        ContextBuilder::new(kind, name)
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        &self.inner.kind
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn debug(&self) -> bool {
        self.inner.debug
    }

    /// A span carrying the resource identity, for instrumenting tasks.
    #[must_use]
    pub fn span(&self) -> tracing::Span {
        self.inner.span.clone()
    }

    /// Signals that the watch loop has finished its setup and is live.
    ///
    /// # Panics
    ///
    /// Calling this more than once per watch lifecycle is a programming
    /// error and aborts.
    pub fn running(&self) {
        let sender = self
            .inner
            .running
            .lock()
            .take()
            .unwrap_or_else(|| {
                panic!(
                    "{}[{}] called running() twice in one watch lifecycle",
                    self.inner.kind, self.inner.name
                )
            });
        // The driver may have gone away during shutdown; that is fine.
        let _ = sender.send(());
    }

    /// Notifies the scheduler that external state may have diverged. Blocks
    /// until the scheduler accepts the event, and fails with
    /// [`Error::Cancelled`] once the done signal has fired.
    pub async fn event(&self) -> Result<()> {
        if self.inner.token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        tokio::select! {
            () = self.inner.token.cancelled() => Err(Error::Cancelled),
            sent = self.inner.events.send(()) => sent.map_err(|_| Error::Cancelled),
        }
    }

    /// The cancellation token merging every shutdown signal for this
    /// resource. Kinds derive child tokens from it for interruptible work.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    /// Resolves once shutdown has been requested.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await;
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Whether a refresh was requested since the last call; reading clears.
    #[must_use]
    pub fn refresh(&self) -> bool {
        self.inner.refresh.swap(false, Ordering::AcqRel)
    }

    /// Publishes the typed output bundle and persists it to the send cache
    /// when a var dir is configured.
    pub async fn send(&self, bundle: SendBundle) -> Result<()> {
        tracing::debug!(fields = ?bundle.field_names(), "publishing send bundle");
        self.inner.send.put(bundle.clone());
        if self.inner.var_base.is_some() {
            sendcache::store(&self.var_dir("send")?, &bundle).await?;
        }
        Ok(())
    }

    /// Restores the last persisted bundle into the send slot, so a resource
    /// restarted by a graph swap exposes outputs without a fresh apply.
    pub async fn restore_sends(&self) -> Result<Option<SendBundle>> {
        if self.inner.var_base.is_none() {
            return Ok(None);
        }
        let cached = sendcache::load(&self.var_dir("send")?).await?;
        if let Some(bundle) = &cached {
            self.inner.send.put(bundle.clone());
        }
        Ok(cached)
    }

    /// The wired input values; per-field changed flags clear on read.
    #[must_use]
    pub fn recv(&self) -> BTreeMap<String, RecvEntry> {
        self.inner.recv.read()
    }

    #[must_use]
    pub fn world(&self) -> Arc<dyn World> {
        Arc::clone(&self.inner.world)
    }

    #[must_use]
    pub fn local(&self) -> Arc<dyn Local> {
        Arc::clone(&self.inner.local)
    }

    /// `None` inside composite children, which are not wired into the graph.
    #[must_use]
    pub fn filtered_graph(&self) -> Option<&FilteredGraph> {
        self.inner.graph.as_ref()
    }

    /// The shared named state registry (see [`crate::shared`]).
    #[must_use]
    pub fn named(&self) -> &Arc<Registry> {
        &self.inner.named
    }

    /// Stable private directory scoped to `(kind, name, sub)`, created on
    /// first use.
    pub fn var_dir(&self, sub: &str) -> Result<PathBuf> {
        let Some(base) = &self.inner.var_base else {
            return Err(Error::init("no var dir configured for this context"));
        };
        let dir = base
            .join(sanitize(&self.inner.kind))
            .join(sanitize(&self.inner.name))
            .join(sub);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// The base var directory this context was built with, if any. Composite
    /// parents forward it into synthesized child contexts.
    #[must_use]
    pub fn var_base(&self) -> Option<&Path> {
        self.inner.var_base.as_deref()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("kind", &self.inner.kind)
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

fn sanitize(part: &str) -> String {
    part.replace(['/', '\\'], "-")
}

/// Scheduler-side half of a context: receives readiness and change events,
/// drives refresh and cancellation, and owns the data-plane ports.
pub struct ContextDriver {
    running: oneshot::Receiver<()>,
    events: mpsc::Receiver<()>,
    token: CancellationToken,
    refresh: Arc<AtomicBool>,
    send: SendSlot,
    recv: RecvPort,
}

impl ContextDriver {
    /// Waits for the resource's `running()`. Fails when the watch ended
    /// without ever signalling readiness.
    pub async fn started(&mut self) -> Result<()> {
        (&mut self.running)
            .await
            .map_err(|_| Error::init("watch ended before signalling running"))
    }

    /// The next change event; `None` once the resource side is gone.
    pub async fn next_event(&mut self) -> Option<()> {
        self.events.recv().await
    }

    /// Non-blocking event check, used to drain coalesced leftovers.
    pub fn try_event(&mut self) -> bool {
        self.events.try_recv().is_ok()
    }

    /// Requests that the next `check_apply` treats cached state as stale.
    pub fn set_refresh(&self) {
        self.refresh.store(true, Ordering::Release);
    }

    /// Requests shutdown of the resource's watch and in-flight apply.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    #[must_use]
    pub fn send_slot(&self) -> &SendSlot {
        &self.send
    }

    #[must_use]
    pub fn recv_port(&self) -> &RecvPort {
        &self.recv
    }
}

/// Builds a [`Context`] / [`ContextDriver`] pair.
pub struct ContextBuilder {
    kind: String,
    name: String,
    debug: bool,
    world: Option<Arc<dyn World>>,
    local: Option<Arc<dyn Local>>,
    graph: Option<FilteredGraph>,
    named: Option<Arc<Registry>>,
    var_base: Option<PathBuf>,
    token: Option<CancellationToken>,
    send: Option<SendSlot>,
    recv: Option<RecvPort>,
}

impl ContextBuilder {
    #[must_use]
    pub fn new(kind: &str, name: &str) -> Self {
        Self {
            kind: kind.to_owned(),
            name: name.to_owned(),
            debug: false,
            world: None,
            local: None,
            graph: None,
            named: None,
            var_base: None,
            token: None,
            send: None,
            recv: None,
        }
    }

    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    #[must_use]
    pub fn world(mut self, world: Arc<dyn World>) -> Self {
        self.world = Some(world);
        self
    }

    #[must_use]
    pub fn local(mut self, local: Arc<dyn Local>) -> Self {
        self.local = Some(local);
        self
    }

    #[must_use]
    pub fn filtered_graph(mut self, graph: FilteredGraph) -> Self {
        self.graph = Some(graph);
        self
    }

    #[must_use]
    pub fn named(mut self, named: Arc<Registry>) -> Self {
        self.named = Some(named);
        self
    }

    #[must_use]
    pub fn var_base(mut self, base: impl Into<PathBuf>) -> Self {
        self.var_base = Some(base.into());
        self
    }

    /// Derive cancellation from an existing token, e.g. a composite
    /// parent's, so parent shutdown cascades into the child.
    #[must_use]
    pub fn token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Share an existing send slot, e.g. the parent-mediated one.
    #[must_use]
    pub fn send_slot(mut self, slot: SendSlot) -> Self {
        self.send = Some(slot);
        self
    }

    #[must_use]
    pub fn recv_port(mut self, port: RecvPort) -> Self {
        self.recv = Some(port);
        self
    }

    #[must_use]
    pub fn build(self) -> (Context, ContextDriver) {
        let (running_tx, running_rx) = oneshot::channel();
        // Capacity one: event() blocks until the scheduler is ready, which
        // is what coalescing loops lean on.
        let (events_tx, events_rx) = mpsc::channel(1);
        let token = self.token.unwrap_or_default();
        let refresh = Arc::new(AtomicBool::new(false));
        let send = self.send.unwrap_or_default();
        let recv = self.recv.unwrap_or_default();
        let span = tracing::info_span!("resource", kind = %self.kind, name = %self.name);
        let context = Context {
            inner: Arc::new(Inner {
                kind: self.kind,
                name: self.name,
                debug: self.debug,
                span,
                running: Mutex::new(Some(running_tx)),
                events: events_tx,
                token: token.clone(),
                refresh: Arc::clone(&refresh),
                send: send.clone(),
                recv: recv.clone(),
                world: self.world.unwrap_or_else(|| MemWorld::new()),
                local: self.local.unwrap_or_else(|| MemLocal::new()),
                graph: self.graph,
                named: self.named.unwrap_or_else(Registry::new),
                var_base: self.var_base,
            }),
        };
        let driver = ContextDriver {
            running: running_rx,
            events: events_rx,
            token,
            refresh,
            send,
            recv,
        };
        (context, driver)
    }
}

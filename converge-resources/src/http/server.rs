//! The HTTP server composite parent.

use std::any::Any;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use converge_core::cmp::{self, CmpMismatch};
use converge_core::context::Context;
use converge_core::error::{Error, Result};
use converge_core::resource::{GroupParent, Interruptible, MetaParams, Resource};
use converge_core::send::SendBundle;
use converge_runtime::group::ChildSet;

use super::{safe_join, text_response, HttpChild, HttpFlagRes};

const KIND: &str = "http:server";

/// Listens on a TCP address and fans requests out to adopted children; a
/// configured filesystem root serves whatever no child accepts.
pub struct HttpServerRes {
    pub name: String,
    pub meta: MetaParams,
    /// Bind address, e.g. `"127.0.0.1:0"` for an ephemeral port.
    pub address: String,
    /// Bound for draining live connections on graceful shutdown.
    pub shutdown_timeout: Duration,
    /// Optional static-file root for requests no child accepts.
    pub root: Option<PathBuf>,

    children: ChildSet,
    routable: Mutex<Vec<Arc<dyn HttpChild>>>,
    state: ServerState,
}

#[derive(Default)]
struct ServerState {
    bound: Mutex<Option<SocketAddr>>,
    interrupt: Mutex<Option<CancellationToken>>,
}

enum Shutdown {
    Graceful,
    Forced,
}

impl HttpServerRes {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            meta: MetaParams::default(),
            address: "127.0.0.1:0".to_owned(),
            shutdown_timeout: Duration::from_secs(3),
            root: None,
            children: ChildSet::new(KIND, name),
            routable: Mutex::new(Vec::new()),
            state: ServerState::default(),
        }
    }

    /// Typed adoption; any kind implementing [`HttpChild`] is routable.
    pub fn adopt_child(&self, child: Arc<dyn HttpChild>) -> Result<()> {
        self.children.adopt(child.clone())?;
        self.routable.lock().push(child);
        Ok(())
    }

    /// The address the listener actually bound, once watch has opened it.
    #[must_use]
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        *self.state.bound.lock()
    }

    /// The last bundle the named adopted child published.
    #[must_use]
    pub fn child_sends(&self, name: &str) -> Option<SendBundle> {
        self.children.child_sends(name)
    }
}

impl Default for HttpServerRes {
    fn default() -> Self {
        Self::new("")
    }
}

#[derive(Clone)]
struct Router {
    children: Arc<Vec<Arc<dyn HttpChild>>>,
    root: Option<PathBuf>,
}

impl Router {
    async fn route(self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let (head, body) = req.into_parts();
        for child in self.children.iter() {
            if child.accept(&head) {
                let req = Request::from_parts(head, body);
                return match child.serve(req).await {
                    Ok(response) => response,
                    Err(err) => {
                        tracing::warn!(child = %child.name(), %err, "child handler failed");
                        text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error\n")
                    }
                };
            }
        }
        match &self.root {
            Some(root) => {
                let Some(path) = safe_join(root, head.uri.path()) else {
                    return text_response(StatusCode::FORBIDDEN, "forbidden\n");
                };
                match tokio::fs::read(&path).await {
                    Ok(bytes) => Response::builder()
                        .status(StatusCode::OK)
                        .body(Full::new(Bytes::from(bytes)))
                        .expect("file response is well formed"),
                    Err(_) => text_response(StatusCode::NOT_FOUND, "not found\n"),
                }
            }
            None => text_response(StatusCode::NOT_FOUND, "not found\n"),
        }
    }
}

#[async_trait]
impl Resource for HttpServerRes {
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
            return Err(Error::validation("http server requires a name"));
        }
        if self.address.is_empty() {
            return Err(Error::validation("http server requires a listen address"));
        }
        if self.shutdown_timeout.is_zero() {
            return Err(Error::validation("shutdown timeout must be non-zero"));
        }
        Ok(())
    }

    async fn init(&self, _ctx: &Context) -> Result<()> {
        // The listener opens inside watch, before anything can route
        // traffic here, so the first delivered request has somewhere to
        // land.
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        let result = self.children.cleanup_all().await;
        self.state.bound.lock().take();
        self.state.interrupt.lock().take();
        result
    }

    async fn watch(&self, ctx: &Context) -> Result<()> {
        let listener = TcpListener::bind(self.address.as_str())
            .await
            .map_err(|err| Error::init(format!("failed to bind {}: {err}", self.address)))?;
        let local = listener
            .local_addr()
            .map_err(|err| Error::init(format!("listener has no local address: {err}")))?;
        *self.state.bound.lock() = Some(local);
        tracing::info!(address = %local, "http server listening");

        let interrupt = ctx.token().child_token();
        *self.state.interrupt.lock() = Some(interrupt.clone());

        // Children start only after the listener is open; the parent is not
        // running until every child is.
        let mut run = self.children.start(ctx).await?;
        ctx.running();

        let router = Router {
            children: Arc::new(self.routable.lock().clone()),
            root: self.root.clone(),
        };
        let graceful = GracefulShutdown::new();
        let mut connections: JoinSet<()> = JoinSet::new();
        let mut children_live = !self.children.is_empty();

        let reason = loop {
            tokio::select! {
                () = ctx.cancelled() => break Shutdown::Graceful,
                () = interrupt.cancelled() => break Shutdown::Forced,
                child_event = run.next_event(), if children_live => match child_event {
                    Some(_) => {
                        if ctx.event().await.is_err() {
                            break Shutdown::Graceful;
                        }
                    }
                    None => children_live = false,
                },
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "accepted connection");
                        let io = TokioIo::new(stream);
                        let per_conn = router.clone();
                        let service = service_fn(move |req| {
                            let router = per_conn.clone();
                            async move {
                                Ok::<_, std::convert::Infallible>(router.route(req).await)
                            }
                        });
                        let conn = hyper::server::conn::http1::Builder::new()
                            .serve_connection(io, service);
                        let conn = graceful.watch(conn);
                        connections.spawn(async move {
                            if let Err(err) = conn.await {
                                tracing::debug!(%err, "connection ended with error");
                            }
                        });
                    }
                    Err(err) => {
                        tracing::warn!(%err, "accept failed");
                    }
                },
            }
        };

        drop(listener);
        match reason {
            Shutdown::Graceful => {
                tokio::select! {
                    () = graceful.shutdown() => {}
                    () = tokio::time::sleep(self.shutdown_timeout) => {
                        tracing::warn!("graceful drain deadline hit, closing connections");
                        connections.abort_all();
                    }
                }
            }
            Shutdown::Forced => {
                tracing::debug!("interrupt: closing connections immediately");
                connections.abort_all();
            }
        }
        while connections.join_next().await.is_some() {}
        self.state.interrupt.lock().take();
        run.shutdown().await
    }

    async fn check_apply(&self, _ctx: &Context, apply: bool) -> Result<bool> {
        // The parent has no external state of its own; recursing lets every
        // child publish its send values.
        self.children.check_apply_all(apply).await
    }

    fn cmp(&self, other: &dyn Resource) -> Result<(), CmpMismatch> {
        let Some(other) = other.as_any().downcast_ref::<HttpServerRes>() else {
            return Err(CmpMismatch::kind(KIND));
        };
        cmp::field(KIND, "name", &self.name, &other.name)?;
        cmp::field(KIND, "meta", &self.meta, &other.meta)?;
        cmp::field(KIND, "address", &self.address, &other.address)?;
        cmp::field(
            KIND,
            "shutdown_timeout",
            &self.shutdown_timeout,
            &other.shutdown_timeout,
        )?;
        cmp::field(KIND, "root", &self.root, &other.root)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn as_group_parent(&self) -> Option<&dyn GroupParent> {
        Some(self)
    }

    fn as_interruptible(&self) -> Option<&dyn Interruptible> {
        Some(self)
    }
}

impl GroupParent for HttpServerRes {
    fn groups(&self, child: &dyn Resource) -> bool {
        self.children.would_group(child)
    }

    fn adopt(&self, child: Arc<dyn Resource>) -> Result<()> {
        // The dyn-Resource path the scheduler's auto-group step uses; typed
        // callers go straight to `adopt_child`.
        let any = Arc::clone(&child).as_any_arc();
        match any.downcast::<HttpFlagRes>() {
            Ok(flag) => self.adopt_child(flag),
            Err(_) => Err(Error::validation(format!(
                "{} has no http dispatch surface",
                child.as_ref()
            ))),
        }
    }
}

impl Interruptible for HttpServerRes {
    fn interrupt(&self) {
        if let Some(token) = self.state.interrupt.lock().as_ref() {
            token.cancel();
        }
    }
}

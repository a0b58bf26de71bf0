//! The form-input child of the HTTP composite.
//!
//! Accepts POSTs to its configured path, captures the declared form field
//! and publishes it downstream as `{value}` on the next apply.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::request::Parts;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;

use converge_core::cmp::{self, CmpMismatch};
use converge_core::context::Context;
use converge_core::error::{Error, Result};
use converge_core::resource::{GroupChild, MetaParams, Resource, Sendable};
use converge_core::send::SendBundle;

use super::{text_response, HttpChild};

const KIND: &str = "http:server:flag";

/// Captures one form value POSTed to `path`.
#[derive(Default)]
pub struct HttpFlagRes {
    pub name: String,
    pub meta: MetaParams,
    /// Absolute request path this child answers on.
    pub path: String,
    /// The form field whose value is captured.
    pub key: String,

    state: FlagState,
}

#[derive(Default)]
struct FlagState {
    value: Mutex<Option<String>>,
    /// What the last apply published; `None` until the first apply.
    sent: Mutex<Option<Option<String>>>,
    notify: Mutex<Option<mpsc::Sender<()>>>,
}

impl HttpFlagRes {
    #[must_use]
    pub fn new(name: &str, path: &str, key: &str) -> Self {
        Self {
            name: name.to_owned(),
            path: path.to_owned(),
            key: key.to_owned(),
            ..Self::default()
        }
    }

    fn bundle(value: Option<&String>) -> SendBundle {
        SendBundle::new().with("value", value.map(|v| json!(v)))
    }
}

#[async_trait]
impl Resource for HttpFlagRes {
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
        if !self.path.starts_with('/') {
            return Err(Error::validation("flag path must be absolute"));
        }
        if self.key.is_empty() {
            return Err(Error::validation("flag requires a form field name"));
        }
        Ok(())
    }

    async fn init(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        self.state.notify.lock().take();
        Ok(())
    }

    async fn watch(&self, ctx: &Context) -> Result<()> {
        // Capacity one with try_send on the serve side: a burst of POSTs
        // between deliveries collapses into a single pending event.
        let (tx, mut rx) = mpsc::channel(1);
        *self.state.notify.lock() = Some(tx);

        ctx.running();
        loop {
            tokio::select! {
                () = ctx.cancelled() => {
                    self.state.notify.lock().take();
                    return Ok(());
                }
                received = rx.recv() => {
                    if received.is_none() || ctx.event().await.is_err() {
                        self.state.notify.lock().take();
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

        let current = self.state.value.lock().clone();
        let sent = self.state.sent.lock().clone();
        if sent.as_ref() == Some(&current) {
            // Unchanged since the previous call; re-send the cached value.
            ctx.send(Self::bundle(current.as_ref())).await?;
            return Ok(true);
        }
        if !apply {
            return Ok(false);
        }

        ctx.send(Self::bundle(current.as_ref())).await?;
        *self.state.sent.lock() = Some(current);
        Ok(false)
    }

    fn cmp(&self, other: &dyn Resource) -> Result<(), CmpMismatch> {
        let Some(other) = other.as_any().downcast_ref::<HttpFlagRes>() else {
            return Err(CmpMismatch::kind(KIND));
        };
        cmp::field(KIND, "name", &self.name, &other.name)?;
        cmp::field(KIND, "meta", &self.meta, &other.meta)?;
        cmp::field(KIND, "path", &self.path, &other.path)?;
        cmp::field(KIND, "key", &self.key, &other.key)?;
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

    fn as_group_child(&self) -> Option<&dyn GroupChild> {
        Some(self)
    }
}

impl Sendable for HttpFlagRes {
    fn sends(&self) -> SendBundle {
        SendBundle::new().with("value", None)
    }
}

impl GroupChild for HttpFlagRes {
    fn parent_name(&self) -> Option<&str> {
        self.meta.parent.as_deref()
    }
}

#[async_trait]
impl HttpChild for HttpFlagRes {
    fn accept(&self, head: &Parts) -> bool {
        head.uri.path() == self.path
    }

    async fn serve(&self, req: Request<Incoming>) -> Result<Response<Full<Bytes>>> {
        if req.method() != Method::POST {
            return Ok(text_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "method not allowed\n",
            ));
        }
        let body = req
            .into_body()
            .collect()
            .await
            .map_err(|err| Error::apply(format!("failed to read form body: {err}")))?
            .to_bytes();
        let Some(value) = form_urlencoded::parse(&body)
            .find(|(k, _)| k.as_ref() == self.key.as_str())
            .map(|(_, v)| v.into_owned())
        else {
            return Ok(text_response(StatusCode::BAD_REQUEST, "missing field\n"));
        };

        tracing::debug!(key = %self.key, "captured form value");
        *self.state.value.lock() = Some(value);
        if let Some(tx) = self.state.notify.lock().as_ref() {
            // Full buffer already carries a pending event.
            let _ = tx.try_send(());
        }
        Ok(text_response(StatusCode::OK, ""))
    }
}

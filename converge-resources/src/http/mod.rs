//! The HTTP auto-group composite: a server parent that absorbs routable
//! children and dispatches inbound requests to the first one that accepts.

mod flag;
mod server;

pub use flag::HttpFlagRes;
pub use server::HttpServerRes;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use http::request::Parts;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;

use converge_core::error::Result;
use converge_core::resource::Resource;

/// A resource that can be absorbed by [`HttpServerRes`] and serve a slice
/// of its request space.
#[async_trait]
pub trait HttpChild: Resource {
    /// Whether this child handles the request; checked in graph order, the
    /// first accepting child wins.
    fn accept(&self, head: &Parts) -> bool;

    /// Serves a request that was accepted.
    async fn serve(&self, req: Request<Incoming>) -> Result<Response<Full<Bytes>>>;
}

pub(crate) fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body.to_owned())))
        .expect("static response is well formed")
}

/// Joins a request path onto the filesystem root, refusing anything that
/// would escape it.
pub(crate) fn safe_join(root: &Path, request_path: &str) -> Option<PathBuf> {
    let mut joined = root.to_path_buf();
    for part in request_path.split('/') {
        match part {
            "" | "." => {}
            ".." => return None,
            part => joined.push(part),
        }
    }
    // Belt and braces: the joined result must stay prefixed by the root.
    joined.starts_with(root).then_some(joined)
}

//! The converge resource engine.
//!
//! A *resource* declares a unit of desired state (a command's outcome, an
//! HTTP endpoint, a firmware attribute, a store key); the engine observes
//! actual state, reconciles, and exposes typed outputs to downstream
//! resources. This facade re-exports the workspace:
//!
//! - [`core`]: the resource contract, init context, error taxonomy, shared
//!   named state and the send/receive types.
//! - [`runtime`]: watch and check-apply machinery, auto-group child sets,
//!   subprocess and filesystem adaptors, and the reference [`Runner`].
//! - [`resources`] (feature `resources`, default): exemplar kinds.
//!
//! # Example
//!
//! Drive a shell command to convergence and read its published outputs:
//!
//! ```no_run
//! use std::sync::Arc;
//! use converge::resources::ExecRes;
//! use converge::Runner;
//!
//! # async fn example() -> converge::Result<()> {
//! let mut resource = ExecRes::default();
//! resource.name = "hello".into();
//! resource.cmd = "echo hello world".into();
//! resource.shell = Some("/bin/bash".into());
//! let mut runner = Runner::start(Arc::new(resource)).await?;
//! let state_ok = runner.converge().await?;
//! assert!(!state_ok);
//! let sends = runner.sends().expect("outputs were published");
//! assert_eq!(sends.value_str("stdout"), Some("hello world\n"));
//! runner.shutdown().await
//! # }
//! ```

pub use converge_core as core;
#[cfg(feature = "resources")]
pub use converge_resources as resources;
pub use converge_runtime as runtime;

pub use converge_core::{
    CmpMismatch, Context, ContextBuilder, ContextDriver, Error, FilteredGraph, MetaParams,
    RecvEntry, Registry, ResUid, Resource, Result, SendBundle,
};
pub use converge_runtime::Runner;

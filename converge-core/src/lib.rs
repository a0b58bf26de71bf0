//! Core contract of the converge resource engine.
//!
//! A *resource* declares a unit of desired state; the engine repeatedly
//! observes actual state, reconciles, and exposes typed outputs to
//! downstream resources. This crate defines the universal protocol every
//! resource kind implements — the lifecycle
//! `validate → init → (watch ∥ check_apply*) → cleanup` — together with the
//! init context, the send/receive data plane, the shared named state
//! registry, and the error taxonomy. The runtime machinery that drives
//! these contracts lives in `converge-runtime`.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cmp;
pub mod context;
pub mod error;
pub mod resource;
pub mod send;
pub mod sendcache;
pub mod shared;
pub mod world;

pub use cmp::CmpMismatch;
pub use context::{Context, ContextBuilder, ContextDriver, FilteredGraph, RecvPort, SendSlot};
pub use error::{Error, Result};
pub use resource::{
    kind_groupable, GroupChild, GroupParent, Interruptible, MetaParams, ResUid, Resource,
    Reversible, Sendable,
};
pub use send::{RecvEntry, SendBundle};
pub use shared::{NamedLock, Registry};
pub use world::{Local, MemLocal, MemWorld, World};

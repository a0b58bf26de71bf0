//! Exemplar resource kinds for the converge engine.
//!
//! Each kind here exercises a different slice of the resource contract:
//! [`exec`] the guard/timeout/interrupt pipeline and the
//! `{output, stdout, stderr}` send bundle, [`http`] the auto-group
//! composite with its request dispatch, [`fwattr`] filesystem-backed
//! observation with typed validation and reversal, [`value`] the
//! send/receive data plane, and [`kv`] the world store contract.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod exec;
pub mod fwattr;
pub mod http;
pub mod kv;
pub mod value;

pub use exec::ExecRes;
pub use fwattr::FwAttrRes;
pub use http::{HttpChild, HttpFlagRes, HttpServerRes};
pub use kv::KvRes;
pub use value::ValueRes;

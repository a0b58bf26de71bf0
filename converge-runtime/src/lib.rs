//! Runtime machinery for the converge resource engine.
//!
//! Everything a resource kind leans on at runtime: watch-loop primitives
//! (burst coalescing, long-poll fallback), the check-apply pipeline pieces
//! (guards, last-ran marker, deadline/interrupt bounding), the auto-group
//! child machinery for composite resources, thin adaptors for subprocesses
//! and filesystem watching, and a reference single-resource [`runner`]
//! encoding the scheduler contract.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod apply;
pub mod fswatch;
pub mod group;
pub mod runner;
pub mod shell;
pub mod watch;

pub use apply::{absorb_transient, bounded, Gate, Guards};
pub use fswatch::{poll_watch, FsEvent};
pub use group::{ChildSet, GroupRun};
pub use runner::Runner;
pub use shell::{classify_status, CmdOutput, CmdSpec, ShellRunner, SystemShell};
pub use watch::{coalesce, longpoll, Coalesce, WatchStreamExt};

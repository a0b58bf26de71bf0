//! The error taxonomy shared by every resource kind and the runtime machinery.
//!
//! Each variant corresponds to one policy the scheduler applies on failure.
//! Invariant violations that leave the process in an undefined state do not
//! get a variant at all: they panic, fail-fast. [`Error::Programming`] exists
//! only for the return-position defensive cases where the process itself is
//! still sound but an impossible state was observed (for example a subprocess
//! wait that failed while reporting a zero exit status).

use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Static resource configuration is invalid. Never retried.
    #[error("invalid configuration: {0}")]
    Validation(String),

    /// Acquiring persistent per-resource resources failed. The scheduler may
    /// retry with its own backoff.
    #[error("initialization failed: {0}")]
    Init(String),

    /// An external operation failed in a transitional state. `check_apply`
    /// absorbs this into `Ok(false)` so the work is rescheduled on the next
    /// event instead of surfacing as a failure.
    #[error("transient backend state: {0}")]
    Transient(String),

    /// The per-call deadline expired and in-flight work was cancelled.
    #[error("deadline of {0:?} exceeded")]
    Timeout(Duration),

    /// The done signal or an interrupt fired. Returned quietly.
    #[error("operation cancelled")]
    Cancelled,

    /// An external mutation failed.
    #[error("apply failed: {0}")]
    Apply(String),

    /// Observed state failed a self-check, e.g. stored data is corrupt.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// A key was looked up in a store that does not hold it. Callers use
    /// [`Error::is_not_found`] to distinguish "missing" from "empty".
    #[error("not found: {0}")]
    NotFound(String),

    /// A contract violation observed at a point where the process itself is
    /// still in a defined state. Surfaced rather than panicked so the
    /// scheduler can abort cleanly.
    #[error("programming error: {0}")]
    Programming(String),

    /// Raw I/O failure surfaced where no more specific kind applies; the
    /// scheduler treats it like [`Error::Apply`].
    #[error("i/o failure")]
    Io(#[from] std::io::Error),

    /// Persisted data failed to encode or decode; the scheduler treats it
    /// like [`Error::Integrity`].
    #[error("serialization failure")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn init(msg: impl Into<String>) -> Self {
        Error::Init(msg.into())
    }

    pub fn apply(msg: impl Into<String>) -> Self {
        Error::Apply(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Error::Transient(msg.into())
    }

    /// True for cancellation via the done signal or an interrupt.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// True when a KV lookup failed because the key is absent.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

/// Collects errors from multi-step teardown paths that must keep going.
///
/// `cleanup` implementations accumulate instead of short-circuiting, so a
/// failed step never masks the release of later resources.
#[derive(Debug, Default)]
pub struct Accumulator {
    errors: Vec<Error>,
}

impl Accumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, result: Result<()>) {
        if let Err(err) = result {
            self.errors.push(err);
        }
    }

    /// Resolves to `Ok` when nothing was accumulated, otherwise to a single
    /// error joining every message.
    pub fn finish(self) -> Result<()> {
        if self.errors.is_empty() {
            return Ok(());
        }
        let joined = self
            .errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Err(Error::Apply(joined))
    }
}

#[cfg(test)]
mod tests {
    use super::{Accumulator, Error};

    #[test]
    fn accumulator_keeps_all_messages() {
        let mut acc = Accumulator::new();
        acc.push(Ok(()));
        acc.push(Err(Error::apply("first")));
        acc.push(Err(Error::init("second")));
        let err = acc.finish().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("first"));
        assert!(msg.contains("second"));
    }

    #[test]
    fn accumulator_empty_is_ok() {
        let mut acc = Accumulator::new();
        acc.push(Ok(()));
        assert!(acc.finish().is_ok());
    }

    #[test]
    fn policy_predicates() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(Error::Timeout(std::time::Duration::from_secs(3)).is_timeout());
        assert!(Error::transient("scaling").is_transient());
        assert!(Error::NotFound("key".into()).is_not_found());
        assert!(!Error::apply("boom").is_cancelled());
    }
}

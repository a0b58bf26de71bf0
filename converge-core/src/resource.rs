//! The universal contract every resource kind implements.
//!
//! A resource is a uniquely-named unit of desired state. The scheduler
//! drives each one through the lifecycle
//! `validate → init → (watch ∥ check_apply*) → cleanup`: exactly one watch
//! task, at most one concurrent `check_apply`, the two cooperating only
//! through the [`Context`]. See the capability traits at the bottom for the
//! optional surfaces a kind may additionally publish.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::cmp::CmpMismatch;
use crate::context::Context;
use crate::error::Result;
use crate::send::SendBundle;

/// Scheduling parameters common to every resource kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaParams {
    /// Polling interval for kinds without a usable push event source; `None`
    /// means purely event driven.
    pub poll: Option<Duration>,
    /// Failure retry budget the scheduler may consume; negative is infinite.
    pub retry: i32,
    /// Capture pre-apply state so the kind's reversal capability can later
    /// produce a restoring sibling.
    pub reverse: bool,
    /// Treat the first converge as refreshed.
    pub refresh: bool,
    /// Name of the auto-group parent this resource wants to be adopted by.
    pub parent: Option<String>,
    /// Shared named state to serialize external mutation against.
    pub block: Option<String>,
}

impl Default for MetaParams {
    fn default() -> Self {
        Self {
            poll: None,
            retry: 0,
            reverse: false,
            refresh: false,
            parent: None,
            block: None,
        }
    }
}

/// An advertised identifier for a resource, consumed by the scheduler's
/// auto-edge step. Every resource has at least its `(kind, name)` identity;
/// kinds may advertise secondary qualified identifiers (for example the
/// command path of an exec resource).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResUid {
    pub kind: String,
    pub name: String,
    pub qualifier: Option<String>,
}

impl ResUid {
    #[must_use]
    pub fn new(kind: &str, name: &str) -> Self {
        Self {
            kind: kind.to_owned(),
            name: name.to_owned(),
            qualifier: None,
        }
    }

    #[must_use]
    pub fn qualified(kind: &str, name: &str, qualifier: &str) -> Self {
        Self {
            kind: kind.to_owned(),
            name: name.to_owned(),
            qualifier: Some(qualifier.to_owned()),
        }
    }
}

impl fmt::Display for ResUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.qualifier {
            Some(q) => write!(f, "{}[{}]({q})", self.kind, self.name),
            None => write!(f, "{}[{}]", self.kind, self.name),
        }
    }
}

/// The operation set every resource kind implements.
///
/// Kind defaults come from the std [`Default`] impl each kind provides.
/// Methods take `&self`; anything mutated while watch and apply run
/// concurrently lives behind interior locks.
#[async_trait]
pub trait Resource: Send + Sync + 'static {
    /// The kind string, e.g. `"exec"` or `"http:server"`. Together with
    /// [`name`](Resource::name) it forms the resource's identity key.
    fn kind(&self) -> &'static str;

    fn name(&self) -> &str;

    fn meta(&self) -> &MetaParams;

    /// Checks field combinations. Pure: may probe read-only external facts
    /// that are safe to read, but never mutates and never blocks on
    /// external events.
    fn validate(&self) -> Result<()>;

    /// Acquires persistent per-resource resources. Called at most once,
    /// before any watch or apply. Bounded setup only; expensive outbound
    /// connections are deferred to watch/apply.
    async fn init(&self, ctx: &Context) -> Result<()>;

    /// Releases everything `init` acquired plus any owned external objects.
    /// Called exactly once after watch and any in-flight apply returned,
    /// and also after a failed `init`; implementations accumulate errors
    /// rather than stopping at the first.
    async fn cleanup(&self) -> Result<()>;

    /// The long-running event producer. Must call [`Context::running`]
    /// exactly once before the first [`Context::event`], return promptly on
    /// cancellation, and coalesce bursts into single events.
    async fn watch(&self, ctx: &Context) -> Result<()>;

    /// Observes external state and, when `apply` is true, reconciles it.
    /// Returns `Ok(true)` when no change was performed this call. With
    /// `apply` false it must not mutate anything external.
    async fn check_apply(&self, ctx: &Context, apply: bool) -> Result<bool>;

    /// Field-by-field equivalence against another resource, used by the
    /// scheduler's graph diffing.
    fn cmp(&self, other: &dyn Resource) -> Result<(), CmpMismatch>;

    /// At least one identifier, stable across runs.
    fn uids(&self) -> Vec<ResUid> {
        vec![ResUid::new(self.kind(), self.name())]
    }

    /// Concrete-type escape hatch used by `cmp` implementations and the
    /// auto-group machinery.
    fn as_any(&self) -> &dyn Any;

    /// Arc-preserving variant of [`as_any`](Resource::as_any), for adoption
    /// paths that must keep shared ownership while downcasting.
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    // Capability accessors. A kind overrides the ones it satisfies; the
    // scheduler tests presence before invoking.

    fn as_sendable(&self) -> Option<&dyn Sendable> {
        None
    }

    fn as_interruptible(&self) -> Option<&dyn Interruptible> {
        None
    }

    fn as_reversible(&self) -> Option<&dyn Reversible> {
        None
    }

    fn as_group_parent(&self) -> Option<&dyn GroupParent> {
        None
    }

    fn as_group_child(&self) -> Option<&dyn GroupChild> {
        None
    }
}

impl fmt::Display for dyn Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.kind(), self.name())
    }
}

/// Declares the send bundle's field set and zero value.
pub trait Sendable: Send + Sync {
    /// The declared fields, all present and unset.
    fn sends(&self) -> SendBundle;
}

/// Asynchronously aborts the kind's current `check_apply`. Idempotent.
pub trait Interruptible: Send + Sync {
    fn interrupt(&self);
}

/// Produces a resource whose apply restores the pre-apply state this
/// resource captured during its own init / pre-apply observation.
pub trait Reversible: Send + Sync {
    fn reversed(&self) -> Result<Option<Box<dyn Resource>>>;
}

/// A composite resource that absorbs child resources at runtime and owns
/// their lifecycle.
pub trait GroupParent: Send + Sync {
    /// Whether this parent would absorb `child`: the child's declared
    /// parent name must be empty or match, and the child's kind must
    /// satisfy the parent's domain predicate.
    fn groups(&self, child: &dyn Resource) -> bool;

    /// Absorbs `child`. Fails with a validation error when
    /// [`groups`](GroupParent::groups) does not hold or the child's kind
    /// has no dispatchable surface for this parent.
    fn adopt(&self, child: Arc<dyn Resource>) -> Result<()>;
}

/// A resource that may be absorbed by an auto-group parent.
pub trait GroupChild: Send + Sync {
    /// The parent name this child declared, if any.
    fn parent_name(&self) -> Option<&str>;
}

/// The kind-prefix grouping rule: a child kind is groupable under a parent
/// kind when it extends it by exactly one further `:`-separated segment.
#[must_use]
pub fn kind_groupable(parent_kind: &str, child_kind: &str) -> bool {
    let Some(rest) = child_kind.strip_prefix(parent_kind) else {
        return false;
    };
    let Some(segment) = rest.strip_prefix(':') else {
        return false;
    };
    !segment.is_empty() && !segment.contains(':')
}

//! Field-by-field resource comparison, used by the scheduler's graph diffing.

use std::fmt::Debug;

use thiserror::Error;

/// Returned by [`Resource::cmp`](crate::resource::Resource::cmp) when two
/// resources are not equivalent. Names the first field found to differ.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind} resource differs at field {field}")]
pub struct CmpMismatch {
    pub kind: String,
    pub field: String,
}

impl CmpMismatch {
    #[must_use]
    pub fn new(kind: &str, field: &str) -> Self {
        Self {
            kind: kind.to_owned(),
            field: field.to_owned(),
        }
    }

    /// The two resources are not even the same kind.
    #[must_use]
    pub fn kind(kind: &str) -> Self {
        Self::new(kind, "kind")
    }
}

/// Compares one field of two resources of kind `kind`.
pub fn field<T: PartialEq + Debug>(
    kind: &str,
    name: &str,
    ours: &T,
    theirs: &T,
) -> Result<(), CmpMismatch> {
    if ours == theirs {
        Ok(())
    } else {
        Err(CmpMismatch::new(kind, name))
    }
}

#[cfg(test)]
mod tests {
    use super::{field, CmpMismatch};

    #[test]
    fn equal_fields_pass() {
        assert!(field("exec", "cmd", &"echo hi", &"echo hi").is_ok());
    }

    #[test]
    fn mismatch_names_the_field() {
        let err = field("exec", "cmd", &"echo hi", &"echo bye").unwrap_err();
        assert_eq!(err, CmpMismatch::new("exec", "cmd"));
        assert!(err.to_string().contains("cmd"));
    }
}

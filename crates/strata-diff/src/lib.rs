//! Strata Diff -- structural diff and patch over JSON documents.
//!
//! This crate provides the delta codec used by the Strata template layer. A
//! *delta* describes how to turn one [`serde_json::Value`] into another. It is
//! itself plain JSON, so it can be written to disk next to (or instead of) the
//! document it describes.
//!
//! The [`StructuralDiff`] trait is the narrow seam consumers depend on;
//! [`JsonDiff`] is the default implementation backed by [`Delta`].
//!
//! # Quick Start
//!
//! ```
//! use serde_json::json;
//! use strata_diff::{JsonDiff, StructuralDiff};
//!
//! let codec = JsonDiff;
//! let before = json!({ "name": "Box", "size": 1, "tags": ["a", "b"] });
//! let after = json!({ "name": "Box", "size": 2, "tags": ["a", "b", "c"] });
//!
//! let delta = codec.diff(&before, &after).unwrap().expect("documents differ");
//! assert_eq!(codec.patch(&before, &delta).unwrap(), after);
//!
//! // Equal documents produce no delta at all.
//! assert!(codec.diff(&after, &after).unwrap().is_none());
//! ```

#![deny(unsafe_code)]

pub mod delta;

pub use delta::Delta;

use serde_json::Value;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced while encoding, decoding or applying a delta.
#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    /// The delta document could not be decoded (or encoded) as a [`Delta`].
    #[error("malformed delta document: {0}")]
    MalformedDelta(#[from] serde_json::Error),

    /// The delta expects a different JSON shape than the one it is applied to.
    #[error("delta at '{path}' expects {expected}, found {found}")]
    ShapeMismatch {
        path: String,
        expected: &'static str,
        found: &'static str,
    },

    /// A `remove` delta appeared somewhere other than an object field.
    #[error("remove delta at '{path}' is only valid for object fields")]
    InvalidRemove { path: String },
}

// ---------------------------------------------------------------------------
// StructuralDiff
// ---------------------------------------------------------------------------

/// Diff/patch capability over tree-shaped documents.
///
/// Implementations must be deterministic: the same pair of inputs always
/// yields the same delta, and `patch(a, diff(a, b)) == b`.
pub trait StructuralDiff: Send + Sync {
    /// Compute the delta that turns `from` into `to`.
    ///
    /// Returns `Ok(None)` when the two documents are semantically equal.
    fn diff(&self, from: &Value, to: &Value) -> Result<Option<Value>, DiffError>;

    /// Apply a delta produced by [`diff`](Self::diff) to `base`.
    fn patch(&self, base: &Value, delta: &Value) -> Result<Value, DiffError>;
}

/// The default [`StructuralDiff`] implementation, encoding deltas as
/// serialized [`Delta`] values.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDiff;

impl StructuralDiff for JsonDiff {
    fn diff(&self, from: &Value, to: &Value) -> Result<Option<Value>, DiffError> {
        match Delta::between(from, to) {
            Some(delta) => Ok(Some(serde_json::to_value(delta)?)),
            None => Ok(None),
        }
    }

    fn patch(&self, base: &Value, delta: &Value) -> Result<Value, DiffError> {
        let delta: Delta = serde_json::from_value(delta.clone())?;
        delta.apply(base)
    }
}

/// Human-readable name of a JSON value's shape, for error messages.
pub(crate) fn shape_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

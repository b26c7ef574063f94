//! The [`Delta`] tree: a structural description of the change between two
//! JSON documents.
//!
//! Deltas mirror the shape of the documents they describe:
//!
//! - Objects diff per key, keys visited in sorted order. Unchanged keys are
//!   omitted, removed keys become [`Delta::Remove`].
//! - Arrays diff per index and always record the target length, so both
//!   growing and shrinking lists patch back exactly. Element order is kept.
//!   Items are stored as `[index, delta]` pairs rather than a map so that the
//!   tagged encoding never has to parse integer map keys.
//! - Anything else (or a change of shape) is a [`Delta::Replace`].
//!
//! The serialized form is tagged by `op`:
//!
//! ```json
//! { "op": "object", "fields": { "size": { "op": "replace", "value": 2 } } }
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{shape_name, DiffError};

// ---------------------------------------------------------------------------
// Delta
// ---------------------------------------------------------------------------

/// A structural change between two JSON values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Delta {
    /// Replace the value wholesale.
    Replace {
        /// The new value.
        value: Value,
    },
    /// Remove the field from its parent object.
    Remove,
    /// Per-field changes to an object.
    Object {
        /// Changed, added or removed fields keyed by field name.
        fields: BTreeMap<String, Delta>,
    },
    /// Per-index changes to an array.
    Array {
        /// Length of the target array.
        len: usize,
        /// Changed or appended elements as `(index, delta)`, ascending.
        items: Vec<(usize, Delta)>,
    },
}

impl Delta {
    /// Compute the delta that turns `from` into `to`, or `None` if they are
    /// equal.
    pub fn between(from: &Value, to: &Value) -> Option<Delta> {
        if from == to {
            return None;
        }
        let delta = match (from, to) {
            (Value::Object(a), Value::Object(b)) => {
                let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
                let mut fields = BTreeMap::new();
                for key in keys {
                    match (a.get(key), b.get(key)) {
                        (Some(x), Some(y)) => {
                            if let Some(d) = Delta::between(x, y) {
                                fields.insert(key.clone(), d);
                            }
                        }
                        (Some(_), None) => {
                            fields.insert(key.clone(), Delta::Remove);
                        }
                        (None, Some(y)) => {
                            fields.insert(key.clone(), Delta::Replace { value: y.clone() });
                        }
                        (None, None) => {}
                    }
                }
                Delta::Object { fields }
            }
            (Value::Array(a), Value::Array(b)) => {
                let mut items = Vec::new();
                for (i, y) in b.iter().enumerate() {
                    match a.get(i) {
                        Some(x) => {
                            if let Some(d) = Delta::between(x, y) {
                                items.push((i, d));
                            }
                        }
                        None => items.push((i, Delta::Replace { value: y.clone() })),
                    }
                }
                Delta::Array {
                    len: b.len(),
                    items,
                }
            }
            _ => Delta::Replace { value: to.clone() },
        };
        Some(delta)
    }

    /// Apply this delta to `base`, producing the target document.
    pub fn apply(&self, base: &Value) -> Result<Value, DiffError> {
        self.apply_at(Some(base), "$")
    }

    /// `base` is `None` when the delta targets a field the base object does
    /// not have. Container deltas then start from an empty container.
    fn apply_at(&self, base: Option<&Value>, path: &str) -> Result<Value, DiffError> {
        match self {
            Delta::Replace { value } => Ok(value.clone()),
            Delta::Remove => Err(DiffError::InvalidRemove {
                path: path.to_owned(),
            }),
            Delta::Object { fields } => {
                let mut map = match base {
                    Some(Value::Object(map)) => map.clone(),
                    None | Some(Value::Null) => Map::new(),
                    Some(other) => {
                        return Err(DiffError::ShapeMismatch {
                            path: path.to_owned(),
                            expected: "object",
                            found: shape_name(other),
                        })
                    }
                };
                for (key, delta) in fields {
                    if matches!(delta, Delta::Remove) {
                        map.remove(key);
                        continue;
                    }
                    let child_path = format!("{path}.{key}");
                    let patched = delta.apply_at(map.get(key), &child_path)?;
                    map.insert(key.clone(), patched);
                }
                Ok(Value::Object(map))
            }
            Delta::Array { len, items } => {
                let mut list = match base {
                    Some(Value::Array(list)) => list.clone(),
                    None | Some(Value::Null) => Vec::new(),
                    Some(other) => {
                        return Err(DiffError::ShapeMismatch {
                            path: path.to_owned(),
                            expected: "array",
                            found: shape_name(other),
                        })
                    }
                };
                list.resize(*len, Value::Null);
                for (index, delta) in items {
                    let index = *index;
                    if index >= *len {
                        // Stale entries past the recorded length are ignored.
                        continue;
                    }
                    let child_path = format!("{path}[{index}]");
                    let patched = delta.apply_at(Some(&list[index]), &child_path)?;
                    list[index] = patched;
                }
                Ok(Value::Array(list))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! JSON diff, patch and operational transform.
//!
//! A diff is expressed as an operation object `{"o": <op>, "v": <value>}`:
//! - `O`: object diff, `v` maps keys to operations
//! - `L`: list diff, `v` maps decimal indexes to operations
//! - `+`: insert `v`
//! - `-`: remove
//! - `r`: replace with `v`
//! - `d`: string delta, see [`text`]

pub mod text;

use serde_json::{Map, Value, json};
use tracing::debug;

pub const OPERATION_KEY: &str = "o";
pub const VALUE_KEY: &str = "v";

pub const OPERATION_OBJECT: &str = "O";
pub const OPERATION_LIST: &str = "L";
pub const OPERATION_INSERT: &str = "+";
pub const OPERATION_REMOVE: &str = "-";
pub const OPERATION_REPLACE: &str = "r";
pub const OPERATION_DIFF: &str = "d";

/// Errors raised while applying or transforming diffs
#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    #[error("invalid delta: {0}")]
    InvalidDelta(String),

    #[error("delta length ({actual}) does not equal source text length ({expected})")]
    DeltaLength { expected: usize, actual: usize },

    #[error("edits conflict at position {position}")]
    Conflict { position: usize },

    #[error("invalid patch: {0}")]
    InvalidPatch(String),
}

pub type Result<T> = std::result::Result<T, DiffError>;

/// Builds an operation object.
pub fn operation(kind: &str, value: Value) -> Value {
    json!({ OPERATION_KEY: kind, VALUE_KEY: value })
}

fn remove_operation() -> Value {
    json!({ OPERATION_KEY: OPERATION_REMOVE })
}

fn parts(op: &Value) -> Result<(&str, Option<&Value>)> {
    let kind = op
        .get(OPERATION_KEY)
        .and_then(Value::as_str)
        .ok_or_else(|| DiffError::InvalidPatch(format!("missing operation in {op}")))?;
    Ok((kind, op.get(VALUE_KEY)))
}

fn required<'a>(value: Option<&'a Value>, kind: &str) -> Result<&'a Value> {
    value.ok_or_else(|| DiffError::InvalidPatch(format!("operation '{kind}' has no value")))
}

fn object_value<'a>(value: Option<&'a Value>, kind: &str) -> Result<&'a Map<String, Value>> {
    required(value, kind)?
        .as_object()
        .ok_or_else(|| DiffError::InvalidPatch(format!("operation '{kind}' expects an object")))
}

fn string_value<'a>(value: Option<&'a Value>, kind: &str) -> Result<&'a str> {
    required(value, kind)?
        .as_str()
        .ok_or_else(|| DiffError::InvalidPatch(format!("operation '{kind}' expects a string")))
}

fn parse_index(index: &str) -> Result<usize> {
    index
        .parse::<usize>()
        .map_err(|_| DiffError::InvalidPatch(format!("invalid list index '{index}'")))
}

/// Deep equality; object key order is ignored.
pub fn equals(a: &Value, b: &Value) -> bool {
    a == b
}

/// Number of leading elements shared by both lists.
pub fn common_prefix(a: &[Value], b: &[Value]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Number of trailing elements shared by both lists.
pub fn common_suffix(a: &[Value], b: &[Value]) -> usize {
    a.iter()
        .rev()
        .zip(b.iter().rev())
        .take_while(|(x, y)| x == y)
        .count()
}

/// Applies a single operation to `origin` and returns the new value.
pub fn apply(origin: &Value, op: &Value) -> Result<Value> {
    let (kind, value) = parts(op)?;
    match kind {
        OPERATION_INSERT | OPERATION_REPLACE => Ok(required(value, kind)?.clone()),
        OPERATION_OBJECT => {
            let target = origin.as_object().ok_or_else(|| {
                DiffError::InvalidPatch(format!("object diff applied to {origin}"))
            })?;
            Ok(Value::Object(apply_object(target, object_value(value, kind)?)?))
        }
        OPERATION_LIST => {
            let target = origin.as_array().ok_or_else(|| {
                DiffError::InvalidPatch(format!("list diff applied to {origin}"))
            })?;
            Ok(Value::Array(apply_list(target, object_value(value, kind)?)?))
        }
        OPERATION_DIFF => {
            let target = origin.as_str().ok_or_else(|| {
                DiffError::InvalidPatch(format!("string diff applied to {origin}"))
            })?;
            Ok(Value::String(text::apply(target, string_value(value, kind)?)?))
        }
        other => Err(DiffError::InvalidPatch(format!(
            "operation '{other}' cannot produce a value"
        ))),
    }
}

/// Applies an object diff (the `v` of an `O` operation).
pub fn apply_object(origin: &Map<String, Value>, diffs: &Map<String, Value>) -> Result<Map<String, Value>> {
    let mut patched = origin.clone();
    for (key, op) in diffs {
        let (kind, value) = parts(op)?;
        match kind {
            OPERATION_INSERT | OPERATION_REPLACE => {
                patched.insert(key.clone(), required(value, kind)?.clone());
            }
            OPERATION_REMOVE => {
                patched.remove(key);
            }
            OPERATION_OBJECT | OPERATION_LIST | OPERATION_DIFF => {
                let current = patched
                    .get(key)
                    .ok_or_else(|| DiffError::InvalidPatch(format!("missing key '{key}'")))?;
                let next = apply(current, op)?;
                patched.insert(key.clone(), next);
            }
            other => {
                return Err(DiffError::InvalidPatch(format!("unknown operation '{other}'")));
            }
        }
    }
    Ok(patched)
}

/// Applies a list diff (the `v` of an `L` operation).
///
/// Indexes are visited in ascending order and shifted down by the number of
/// removals already applied.
pub fn apply_list(origin: &[Value], diffs: &Map<String, Value>) -> Result<Vec<Value>> {
    let mut ops = diffs
        .iter()
        .map(|(index, op)| Ok((parse_index(index)?, op)))
        .collect::<Result<Vec<_>>>()?;
    ops.sort_by_key(|(index, _)| *index);

    let mut patched = origin.to_vec();
    let mut removed = 0usize;
    for (index, op) in ops {
        let position = index - removed;
        let out_of_range = || DiffError::InvalidPatch(format!("list index {index} out of range"));
        let (kind, value) = parts(op)?;
        match kind {
            OPERATION_INSERT => {
                if position > patched.len() {
                    return Err(out_of_range());
                }
                patched.insert(position, required(value, kind)?.clone());
            }
            OPERATION_REMOVE => {
                if position >= patched.len() {
                    return Err(out_of_range());
                }
                patched.remove(position);
                removed += 1;
            }
            OPERATION_REPLACE => {
                let slot = patched.get_mut(position).ok_or_else(out_of_range)?;
                *slot = required(value, kind)?.clone();
            }
            OPERATION_OBJECT | OPERATION_LIST | OPERATION_DIFF => {
                let slot = patched.get_mut(position).ok_or_else(out_of_range)?;
                *slot = apply(slot, op)?;
            }
            other => {
                return Err(DiffError::InvalidPatch(format!("unknown operation '{other}'")));
            }
        }
    }
    Ok(patched)
}

/// Value the operation produces from `origin`.
fn resolve(origin: Option<&Value>, op: &Value) -> Result<Value> {
    let (kind, value) = parts(op)?;
    match kind {
        OPERATION_INSERT | OPERATION_REPLACE => Ok(required(value, kind)?.clone()),
        _ => {
            let origin = origin
                .ok_or_else(|| DiffError::InvalidPatch(format!("operation '{kind}' needs an origin")))?;
            apply(origin, op)
        }
    }
}

/// Computes, applies and transforms JSON diffs.
///
/// Lists are replaced wholesale unless array diffing is enabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDiff {
    array_diff: bool,
}

impl JsonDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_array_diff(mut self, enabled: bool) -> Self {
        self.array_diff = enabled;
        self
    }

    pub fn array_diff(&self) -> bool {
        self.array_diff
    }

    /// Operation turning `a` into `b`, `None` when they are equal.
    pub fn diff(&self, a: &Value, b: &Value) -> Option<Value> {
        if a == b {
            return None;
        }
        match (a, b) {
            (Value::String(a), Value::String(b)) => {
                text::diff(a, b).map(|delta| operation(OPERATION_DIFF, Value::String(delta)))
            }
            (Value::Object(a), Value::Object(b)) => self.diff_objects(a, b),
            (Value::Array(a), Value::Array(b)) if self.array_diff => self.diff_lists(a, b),
            _ => Some(operation(OPERATION_REPLACE, b.clone())),
        }
    }

    pub fn diff_objects(&self, a: &Map<String, Value>, b: &Map<String, Value>) -> Option<Value> {
        let mut diffs = Map::new();
        for (key, a_value) in a {
            match b.get(key) {
                None => {
                    diffs.insert(key.clone(), remove_operation());
                }
                Some(b_value) => {
                    if let Some(op) = self.diff(a_value, b_value) {
                        diffs.insert(key.clone(), op);
                    }
                }
            }
        }
        for (key, b_value) in b {
            if !a.contains_key(key) {
                diffs.insert(key.clone(), operation(OPERATION_INSERT, b_value.clone()));
            }
        }

        if diffs.is_empty() {
            None
        } else {
            Some(operation(OPERATION_OBJECT, Value::Object(diffs)))
        }
    }

    pub fn diff_lists(&self, a: &[Value], b: &[Value]) -> Option<Value> {
        let prefix = common_prefix(a, b);
        let suffix = common_suffix(&a[prefix..], &b[prefix..]);
        let a_rest = &a[prefix..a.len() - suffix];
        let b_rest = &b[prefix..b.len() - suffix];

        let mut diffs = Map::new();
        for i in 0..a_rest.len().max(b_rest.len()) {
            let index = (prefix + i).to_string();
            match (a_rest.get(i), b_rest.get(i)) {
                (Some(a_value), Some(b_value)) => {
                    if let Some(op) = self.diff(a_value, b_value) {
                        diffs.insert(index, op);
                    }
                }
                (Some(_), None) => {
                    diffs.insert(index, remove_operation());
                }
                (None, Some(b_value)) => {
                    diffs.insert(index, operation(OPERATION_INSERT, b_value.clone()));
                }
                (None, None) => {}
            }
        }

        if diffs.is_empty() {
            None
        } else {
            Some(operation(OPERATION_LIST, Value::Object(diffs)))
        }
    }

    /// Rebases the `local` object diff so it applies after `remote`.
    ///
    /// Both diffs must have been computed against `origin`.
    pub fn transform_object(
        &self,
        local: &Map<String, Value>,
        remote: &Map<String, Value>,
        origin: &Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let mut transformed = Map::new();
        for (key, local_op) in local {
            let Some(remote_op) = remote.get(key) else {
                transformed.insert(key.clone(), local_op.clone());
                continue;
            };
            if let Some(op) = self.rebase(key, local_op, remote_op, origin.get(key))? {
                transformed.insert(key.clone(), op);
            }
        }
        Ok(transformed)
    }

    /// Rebases a list diff, shifting indexes over the remote's inserts and
    /// removals.
    pub fn transform_list(
        &self,
        local: &Map<String, Value>,
        remote: &Map<String, Value>,
        origin: &[Value],
    ) -> Result<Map<String, Value>> {
        let mut remote_ops = remote
            .iter()
            .map(|(index, op)| Ok((parse_index(index)?, op)))
            .collect::<Result<Vec<_>>>()?;
        remote_ops.sort_by_key(|(index, _)| *index);

        let mut local_ops = local
            .iter()
            .map(|(index, op)| Ok((parse_index(index)?, op)))
            .collect::<Result<Vec<_>>>()?;
        local_ops.sort_by_key(|(index, _)| *index);

        let mut transformed = Map::new();
        for (index, local_op) in local_ops {
            let mut shift = 0isize;
            let mut same_index = None;
            for (remote_index, remote_op) in &remote_ops {
                if *remote_index < index {
                    match parts(remote_op)?.0 {
                        OPERATION_INSERT => shift += 1,
                        OPERATION_REMOVE => shift -= 1,
                        _ => {}
                    }
                } else if *remote_index == index {
                    same_index = Some(*remote_op);
                }
            }
            let shifted = |offset: isize| (index as isize + shift + offset).max(0) as usize;

            let (local_kind, local_value) = parts(local_op)?;
            let entry = match same_index {
                None => Some((shifted(0), local_op.clone())),
                Some(remote_op) => {
                    let (remote_kind, remote_value) = parts(remote_op)?;
                    match (local_kind, remote_kind) {
                        (OPERATION_REMOVE, OPERATION_REMOVE) => None,
                        (OPERATION_INSERT, OPERATION_INSERT) => {
                            if local_value == remote_value {
                                None
                            } else {
                                Some((shifted(1), local_op.clone()))
                            }
                        }
                        (_, OPERATION_INSERT) => Some((shifted(1), local_op.clone())),
                        (OPERATION_REMOVE, _) | (OPERATION_INSERT, _) => {
                            Some((shifted(0), local_op.clone()))
                        }
                        (_, OPERATION_REMOVE) => {
                            let value = resolve(origin.get(index), local_op)?;
                            Some((shifted(0), operation(OPERATION_INSERT, value)))
                        }
                        _ => self
                            .rebase(&index.to_string(), local_op, remote_op, origin.get(index))?
                            .map(|op| (shifted(0), op)),
                    }
                }
            };

            if let Some((position, op)) = entry {
                transformed.insert(position.to_string(), op);
            }
        }
        Ok(transformed)
    }

    /// Transforms one entry. A conflicting string edit is dropped so the
    /// remote value wins for that entry only.
    fn rebase(
        &self,
        key: &str,
        local_op: &Value,
        remote_op: &Value,
        origin: Option<&Value>,
    ) -> Result<Option<Value>> {
        match self.transform_operation(local_op, remote_op, origin) {
            Err(DiffError::Conflict { position }) => {
                debug!("Dropping local edit to '{}' conflicting at {}", key, position);
                Ok(None)
            }
            result => result,
        }
    }

    fn transform_operation(
        &self,
        local_op: &Value,
        remote_op: &Value,
        origin: Option<&Value>,
    ) -> Result<Option<Value>> {
        let (local_kind, local_value) = parts(local_op)?;
        let (remote_kind, remote_value) = parts(remote_op)?;

        match (local_kind, remote_kind) {
            (OPERATION_REMOVE, OPERATION_REMOVE) => Ok(None),
            (OPERATION_REMOVE, _) => Ok(Some(local_op.clone())),
            (OPERATION_INSERT, OPERATION_INSERT) => Ok(self.diff(
                required(remote_value, remote_kind)?,
                required(local_value, local_kind)?,
            )),
            (_, OPERATION_REMOVE) => {
                let value = resolve(origin, local_op)?;
                Ok(Some(operation(OPERATION_INSERT, value)))
            }
            (OPERATION_OBJECT, OPERATION_OBJECT) => {
                let origin = origin.and_then(Value::as_object).ok_or_else(|| {
                    DiffError::InvalidPatch("object transform without an object origin".to_string())
                })?;
                let transformed = self.transform_object(
                    object_value(local_value, local_kind)?,
                    object_value(remote_value, remote_kind)?,
                    origin,
                )?;
                Ok((!transformed.is_empty())
                    .then(|| operation(OPERATION_OBJECT, Value::Object(transformed))))
            }
            (OPERATION_LIST, OPERATION_LIST) => {
                let origin = origin.and_then(Value::as_array).ok_or_else(|| {
                    DiffError::InvalidPatch("list transform without a list origin".to_string())
                })?;
                let transformed = self.transform_list(
                    object_value(local_value, local_kind)?,
                    object_value(remote_value, remote_kind)?,
                    origin,
                )?;
                Ok((!transformed.is_empty())
                    .then(|| operation(OPERATION_LIST, Value::Object(transformed))))
            }
            (OPERATION_DIFF, OPERATION_DIFF) => {
                let origin = origin.and_then(Value::as_str).ok_or_else(|| {
                    DiffError::InvalidPatch("string transform without a string origin".to_string())
                })?;
                let delta = text::transform(
                    string_value(local_value, local_kind)?,
                    string_value(remote_value, remote_kind)?,
                    origin,
                )?;
                Ok(Some(operation(OPERATION_DIFF, Value::String(delta))))
            }
            _ => {
                let local_result = resolve(origin, local_op)?;
                let remote_result = resolve(origin, remote_op)?;
                Ok(self.diff(&remote_result, &local_result))
            }
        }
    }
}

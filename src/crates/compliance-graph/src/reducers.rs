//! Reducers - merge rules for the fields of the state record
//!
//! Every node returns a partial update. The engine never assigns fields directly; it
//! merges each updated field through the rule registered for it:
//!
//! | Field             | Rule                                                        |
//! |-------------------|-------------------------------------------------------------|
//! | `messages`        | append, skipping exact duplicates (content, role, timestamp)|
//! | `tool_outputs`    | overwrite per key, previous value kept in `<key>_history`   |
//! | `errors`          | append, bounded FIFO (oldest evicted first)                 |
//! | `compliance_data` | per-key [`Reducer`] from a [`ComplianceDataSchema`]         |
//! | `metadata`        | overwrite per key with change history (see `MetadataMap`)   |
//!
//! # Compliance data
//!
//! `compliance_data` is an open map, so its keys are merged through trait objects, the
//! same way a state schema assigns a reducer per channel:
//!
//! ```rust
//! use compliance_graph::reducers::ComplianceDataSchema;
//! use serde_json::{json, Map, Value};
//!
//! let schema = ComplianceDataSchema::standard();
//! let current: Map<String, Value> = json!({"frameworks": ["SOC2"]}).as_object().unwrap().clone();
//! let update: Map<String, Value> = json!({"frameworks": ["ISO27001", "SOC2"]}).as_object().unwrap().clone();
//!
//! let merged = schema.apply(&current, &update).unwrap();
//! assert_eq!(merged["frameworks"], json!(["SOC2", "ISO27001"]));
//! ```

use crate::error::StateError;
use crate::state::{ErrorEntry, Message};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::OnceLock;

type Result<T> = std::result::Result<T, StateError>;

/// Merge rule for a single `compliance_data` key
pub trait Reducer: Send + Sync {
    /// Merge `update` into `current` (which is `Null` when the key is new)
    fn reduce(&self, current: &Value, update: &Value) -> Result<Value>;

    /// Name used in error messages
    fn name(&self) -> &str;
}

fn incompatible(reducer: &dyn Reducer, message: impl Into<String>) -> StateError {
    StateError::Incompatible {
        reducer: reducer.name().to_string(),
        message: message.into(),
    }
}

/// View a value as a list of items: `Null` is empty, an object is a single item
fn items(reducer: &dyn Reducer, value: &Value) -> Result<Vec<Value>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => Ok(items.clone()),
        Value::Object(_) | Value::String(_) => Ok(vec![value.clone()]),
        other => Err(incompatible(
            reducer,
            format!("expected a list, got {}", type_name(other)),
        )),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Replace the current value with the update
#[derive(Debug, Clone, Copy, Default)]
pub struct OverwriteReducer;

impl Reducer for OverwriteReducer {
    fn reduce(&self, _current: &Value, update: &Value) -> Result<Value> {
        Ok(update.clone())
    }

    fn name(&self) -> &str {
        "overwrite"
    }
}

/// Set union that keeps first-seen order
///
/// Used for framework lists: `["SOC2"] ∪ ["ISO27001", "SOC2"] = ["SOC2", "ISO27001"]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnionReducer;

impl Reducer for UnionReducer {
    fn reduce(&self, current: &Value, update: &Value) -> Result<Value> {
        let mut merged = items(self, current)?;
        for item in items(self, update)? {
            if !merged.contains(&item) {
                merged.push(item);
            }
        }
        Ok(Value::Array(merged))
    }

    fn name(&self) -> &str {
        "union"
    }
}

/// Upsert objects by an identifier field, replacing matches in place
///
/// Items without the identifier are appended as-is.
#[derive(Debug, Clone)]
pub struct KeyedUpsertReducer {
    key: String,
}

impl KeyedUpsertReducer {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl Reducer for KeyedUpsertReducer {
    fn reduce(&self, current: &Value, update: &Value) -> Result<Value> {
        let mut merged = items(self, current)?;
        for item in items(self, update)? {
            let existing = item.get(&self.key).and_then(|id| {
                merged
                    .iter()
                    .position(|candidate| candidate.get(&self.key) == Some(id))
            });
            match existing {
                Some(index) => merged[index] = item,
                None => merged.push(item),
            }
        }
        Ok(Value::Array(merged))
    }

    fn name(&self) -> &str {
        "keyed_upsert"
    }
}

/// Append objects unless one with the same content key is already present
///
/// Items without the key are compared by full equality.
#[derive(Debug, Clone)]
pub struct DedupAppendReducer {
    key: String,
}

impl DedupAppendReducer {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    fn is_duplicate(&self, merged: &[Value], item: &Value) -> bool {
        match item.get(&self.key) {
            Some(hash) => merged.iter().any(|m| m.get(&self.key) == Some(hash)),
            None => merged.contains(item),
        }
    }
}

impl Reducer for DedupAppendReducer {
    fn reduce(&self, current: &Value, update: &Value) -> Result<Value> {
        let mut merged = items(self, current)?;
        for item in items(self, update)? {
            if !self.is_duplicate(&merged, &item) {
                merged.push(item);
            }
        }
        Ok(Value::Array(merged))
    }

    fn name(&self) -> &str {
        "dedup_append"
    }
}

/// Reducer assignment for `compliance_data` keys
pub struct ComplianceDataSchema {
    fields: HashMap<String, Box<dyn Reducer>>,
    default_reducer: Box<dyn Reducer>,
}

impl Default for ComplianceDataSchema {
    fn default() -> Self {
        Self {
            fields: HashMap::new(),
            default_reducer: Box::new(OverwriteReducer),
        }
    }
}

impl std::fmt::Debug for ComplianceDataSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut fields: Vec<(&String, &str)> =
            self.fields.iter().map(|(k, r)| (k, r.name())).collect();
        fields.sort();
        f.debug_struct("ComplianceDataSchema")
            .field("fields", &fields)
            .field("default_reducer", &self.default_reducer.name())
            .finish()
    }
}

impl ComplianceDataSchema {
    /// Empty schema: every key is overwritten
    pub fn new() -> Self {
        Self::default()
    }

    /// Frameworks are a set, obligations upsert by `id`, evidence dedups by `hash`
    pub fn standard() -> Self {
        let mut schema = Self::new();
        schema.add_field("frameworks", Box::new(UnionReducer));
        schema.add_field("obligations", Box::new(KeyedUpsertReducer::new("id")));
        schema.add_field("evidence", Box::new(DedupAppendReducer::new("hash")));
        schema
    }

    pub fn add_field(&mut self, field: impl Into<String>, reducer: Box<dyn Reducer>) {
        self.fields.insert(field.into(), reducer);
    }

    pub fn with_default_reducer(mut self, reducer: Box<dyn Reducer>) -> Self {
        self.default_reducer = reducer;
        self
    }

    fn reducer_for(&self, field: &str) -> &dyn Reducer {
        self.fields
            .get(field)
            .map(|r| r.as_ref())
            .unwrap_or(self.default_reducer.as_ref())
    }

    /// Merge `update` into a copy of `current`
    ///
    /// Either every key merges or the whole update is rejected.
    pub fn apply(&self, current: &Map<String, Value>, update: &Map<String, Value>) -> Result<Map<String, Value>> {
        let mut merged = current.clone();
        for (field, value) in update {
            let existing = merged.get(field).unwrap_or(&Value::Null);
            let reduced = self
                .reducer_for(field)
                .reduce(existing, value)
                .map_err(|source| StateError::Field {
                    field: field.clone(),
                    source: Box::new(source),
                })?;
            merged.insert(field.clone(), reduced);
        }
        Ok(merged)
    }
}

/// Shared [`ComplianceDataSchema::standard`] instance used by the state record
pub fn standard_schema() -> &'static ComplianceDataSchema {
    static SCHEMA: OnceLock<ComplianceDataSchema> = OnceLock::new();
    SCHEMA.get_or_init(ComplianceDataSchema::standard)
}

/// Append messages, skipping any already present. Returns the number appended.
pub fn merge_messages(existing: &mut Vec<Message>, incoming: Vec<Message>) -> usize {
    let before = existing.len();
    for message in incoming {
        if !existing.contains(&message) {
            existing.push(message);
        }
    }
    existing.len() - before
}

/// Suffix of the key holding a tool's superseded outputs
pub const HISTORY_SUFFIX: &str = "_history";

/// Overwrite tool outputs per key, pushing the superseded value onto `<key>_history`
pub fn merge_tool_outputs(existing: &mut Map<String, Value>, incoming: Map<String, Value>, now: DateTime<Utc>) {
    for (tool, output) in incoming {
        if let Some(previous) = existing.get(&tool) {
            if *previous != output {
                let entry = json!({ "value": previous, "timestamp": now });
                let history_key = format!("{tool}{HISTORY_SUFFIX}");
                match existing.get_mut(&history_key) {
                    Some(Value::Array(history)) => history.push(entry),
                    _ => {
                        existing.insert(history_key, Value::Array(vec![entry]));
                    }
                }
            }
        }
        existing.insert(tool, output);
    }
}

/// Append errors, evicting the oldest beyond `capacity`. Returns the number appended.
pub fn merge_errors(existing: &mut Vec<ErrorEntry>, incoming: Vec<ErrorEntry>, capacity: usize) -> u64 {
    let appended = incoming.len() as u64;
    existing.extend(incoming);
    if existing.len() > capacity {
        let overflow = existing.len() - capacity;
        existing.drain(..overflow);
    }
    appended
}

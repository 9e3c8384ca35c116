//! Table storage and value comparison.

use bastion_core::error::{Result, StorageError};
use bastion_core::meta::{FieldInfo, ModelMeta};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

/// A stored row: physical column name to value.
pub type Row = Map<String, Value>;

/// Rows of one model, keyed by an internal, never reused row key.
#[derive(Debug, Clone, Default)]
pub struct Table {
    pub(crate) rows: BTreeMap<u64, Row>,
    next_key: u64,
}

impl Table {
    pub(crate) fn insert(&mut self, row: Row) -> u64 {
        let key = self.next_key;
        self.next_key += 1;
        self.rows.insert(key, row);
        key
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Complete database state. Cloned to take transaction snapshots.
#[derive(Debug, Clone, Default)]
pub struct State {
    pub(crate) tables: HashMap<String, Table>,
    sequences: HashMap<String, i64>,
}

impl State {
    pub(crate) fn table(&self, model: &str) -> Option<&Table> {
        self.tables.get(model)
    }

    pub(crate) fn table_mut(&mut self, model: &str) -> &mut Table {
        self.tables.entry(model.to_string()).or_default()
    }

    /// Next value of the autoincrement sequence of `model.field`.
    pub(crate) fn next_sequence(&mut self, model: &str, field: &str) -> i64 {
        let current_max = self
            .tables
            .get(model)
            .map(|t| {
                t.rows
                    .values()
                    .filter_map(|r| r.get(field).and_then(Value::as_i64))
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        let counter = self.sequences.entry(format!("{}.{}", model, field)).or_insert(0);
        *counter = (*counter).max(current_max) + 1;
        *counter
    }

    /// Number of rows stored for a model.
    pub fn row_count(&self, model: &str) -> usize {
        self.tables.get(model).map(Table::len).unwrap_or(0)
    }

    /// All rows of a model, in insertion order.
    pub fn rows(&self, model: &str) -> Vec<Row> {
        self.tables
            .get(model)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }
}

/// Whether a field is stored in the model's own table.
pub(crate) fn is_physical(field: &FieldInfo) -> bool {
    !field.is_data_model && (field.inherited_from.is_none() || field.is_id)
}

/// Look up a field a query refers to.
pub(crate) fn query_field<'m>(meta: &'m ModelMeta, model: &str, name: &str) -> Result<&'m FieldInfo> {
    meta.field(model, name).ok_or_else(|| {
        StorageError::InvalidQuery(format!("unknown field {}.{}", model, name)).into()
    })
}

/// Reject scalar access to a field that lives in a base model's table.
pub(crate) fn ensure_physical(model: &str, field: &FieldInfo) -> Result<()> {
    if !field.is_data_model && !is_physical(field) {
        return Err(StorageError::InvalidQuery(format!(
            "field {}.{} is stored on {}",
            model,
            field.name,
            field.inherited_from.as_deref().unwrap_or("a base model")
        ))
        .into());
    }
    Ok(())
}

/// Equality with numeric coercion.
pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

/// Ordering of two scalar values; `None` when they are not comparable.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Ordering used when sorting; nulls sort before everything else.
pub(crate) fn sort_order(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => compare_values(a, b).unwrap_or(Ordering::Equal),
    }
}

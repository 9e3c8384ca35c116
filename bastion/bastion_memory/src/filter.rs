//! Filter evaluation.
//!
//! Supports the scalar operators (`equals`, `not`, `in`, `notIn`, `lt`,
//! `lte`, `gt`, `gte`, `contains`, `startsWith`, `endsWith`, `has`), the
//! logical combinators (`AND`, `OR`, `NOT`), to-many relation filters
//! (`some`, `every`, `none`), to-one relation filters (`is`, `isNot`, or a
//! nested filter directly) and generated compound unique keys.

use crate::state::{compare_values, ensure_physical, query_field, values_equal, Row, State};
use bastion_core::error::{Result, StorageError};
use bastion_core::meta::{FieldInfo, ModelMeta};
use bastion_core::query::enumerate;
use serde_json::Value;
use std::cmp::Ordering;

const SCALAR_OPERATORS: &[&str] = &[
    "equals",
    "not",
    "in",
    "notIn",
    "lt",
    "lte",
    "gt",
    "gte",
    "contains",
    "startsWith",
    "endsWith",
    "mode",
    "has",
    "hasSome",
    "hasEvery",
    "isEmpty",
];

/// Read-only view over a database state.
pub(crate) struct View<'a> {
    pub meta: &'a ModelMeta,
    pub state: &'a State,
}

fn invalid(detail: String) -> bastion_core::Error {
    StorageError::InvalidQuery(detail).into()
}

impl<'a> View<'a> {
    pub fn new(meta: &'a ModelMeta, state: &'a State) -> Self {
        Self { meta, state }
    }

    pub fn row(&self, model: &str, key: u64) -> Option<&'a Row> {
        self.state.table(model).and_then(|t| t.rows.get(&key))
    }

    /// Row keys of a model, in insertion order.
    pub fn keys(&self, model: &str) -> Vec<u64> {
        self.state
            .table(model)
            .map(|t| t.rows.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Keys of the rows related to `row` through `field`.
    pub fn related(&self, model: &str, row: &Row, field: &FieldInfo) -> Result<Vec<u64>> {
        let target = &field.field_type;
        let Some(table) = self.state.table(target) else {
            return Ok(Vec::new());
        };

        // Pairs of (column on the target row, value taken from this row)
        let mut pairs: Vec<(String, Value)> = Vec::new();
        if field.is_relation_owner {
            let mapping = field.foreign_key_mapping.as_ref().ok_or_else(|| {
                invalid(format!("relation {}.{} has no foreign key mapping", model, field.name))
            })?;
            for (referenced, fk) in mapping {
                match row.get(fk) {
                    None | Some(Value::Null) => return Ok(Vec::new()),
                    Some(v) => pairs.push((referenced.clone(), v.clone())),
                }
            }
        } else {
            let back_link = field.back_link.as_deref().ok_or_else(|| {
                invalid(format!("relation {}.{} has no back link", model, field.name))
            })?;
            let back = query_field(self.meta, target, back_link)?;
            let mapping = back.foreign_key_mapping.as_ref().ok_or_else(|| {
                invalid(format!("relation {}.{} owns no foreign key", target, back_link))
            })?;
            for (referenced, fk) in mapping {
                match row.get(referenced) {
                    None | Some(Value::Null) => return Ok(Vec::new()),
                    Some(v) => pairs.push((fk.clone(), v.clone())),
                }
            }
        }

        Ok(table
            .rows
            .iter()
            .filter(|(_, r)| {
                pairs
                    .iter()
                    .all(|(col, v)| r.get(col).map(|x| values_equal(x, v)).unwrap_or(false))
            })
            .map(|(k, _)| *k)
            .collect())
    }

    /// Keys of the rows of `model` matching `filter`, in insertion order.
    pub fn find(&self, model: &str, filter: &Value) -> Result<Vec<u64>> {
        let mut keys = Vec::new();
        if let Some(table) = self.state.table(model) {
            for (key, row) in &table.rows {
                if self.matches(model, row, filter)? {
                    keys.push(*key);
                }
            }
        }
        Ok(keys)
    }

    /// Whether `row` of `model` satisfies `filter`.
    pub fn matches(&self, model: &str, row: &Row, filter: &Value) -> Result<bool> {
        match filter {
            Value::Null => Ok(true),
            Value::Bool(b) => Ok(*b),
            Value::Object(map) => {
                for (key, condition) in map {
                    if !self.matches_entry(model, row, key, condition)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            other => Err(invalid(format!("invalid filter for {}: {}", model, other))),
        }
    }

    fn matches_entry(&self, model: &str, row: &Row, key: &str, condition: &Value) -> Result<bool> {
        match key {
            "AND" => {
                for c in enumerate(condition) {
                    if !self.matches(model, row, c)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            "OR" => {
                for c in enumerate(condition) {
                    if self.matches(model, row, c)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            "NOT" => {
                for c in enumerate(condition) {
                    if self.matches(model, row, c)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            _ => {
                let Some(field) = self.meta.field(model, key) else {
                    let compound = self
                        .meta
                        .unique_constraints(model)
                        .any(|c| c.name == key && c.is_compound());
                    if compound && condition.is_object() {
                        return self.matches(model, row, condition);
                    }
                    return Err(invalid(format!("unknown field {}.{} in filter", model, key)));
                };
                if field.is_data_model {
                    self.matches_relation(model, row, field, condition)
                } else {
                    ensure_physical(model, field)?;
                    let value = row.get(key).unwrap_or(&Value::Null);
                    matches_scalar(value, condition)
                }
            }
        }
    }

    fn matches_relation(&self, model: &str, row: &Row, field: &FieldInfo, condition: &Value) -> Result<bool> {
        let related = self.related(model, row, field)?;
        let target = &field.field_type;

        if field.is_array {
            let Some(ops) = condition.as_object() else {
                return Err(invalid(format!(
                    "to-many filter on {}.{} must be an object",
                    model, field.name
                )));
            };
            for (op, sub) in ops {
                let ok = match op.as_str() {
                    "some" => self.any_matches(target, &related, sub)?,
                    "every" => {
                        let mut all = true;
                        for key in &related {
                            if let Some(r) = self.row(target, *key) {
                                if !self.matches(target, r, sub)? {
                                    all = false;
                                    break;
                                }
                            }
                        }
                        all
                    }
                    "none" => !self.any_matches(target, &related, sub)?,
                    other => {
                        return Err(invalid(format!(
                            "unsupported to-many filter '{}' on {}.{}",
                            other, model, field.name
                        )))
                    }
                };
                if !ok {
                    return Ok(false);
                }
            }
            return Ok(true);
        }

        if condition.is_null() {
            return Ok(related.is_empty());
        }
        let Some(ops) = condition.as_object() else {
            return Err(invalid(format!(
                "to-one filter on {}.{} must be an object or null",
                model, field.name
            )));
        };
        if ops.contains_key("is") || ops.contains_key("isNot") {
            for (op, sub) in ops {
                let ok = match op.as_str() {
                    "is" if sub.is_null() => related.is_empty(),
                    "is" => self.any_matches(target, &related, sub)?,
                    "isNot" if sub.is_null() => !related.is_empty(),
                    "isNot" => !self.any_matches(target, &related, sub)?,
                    other => {
                        return Err(invalid(format!(
                            "unsupported to-one filter '{}' on {}.{}",
                            other, model, field.name
                        )))
                    }
                };
                if !ok {
                    return Ok(false);
                }
            }
            return Ok(true);
        }
        self.any_matches(target, &related, condition)
    }

    fn any_matches(&self, model: &str, keys: &[u64], filter: &Value) -> Result<bool> {
        for key in keys {
            if let Some(r) = self.row(model, *key) {
                if self.matches(model, r, filter)? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

fn is_operator_object(condition: &Value) -> bool {
    condition
        .as_object()
        .map(|m| !m.is_empty() && m.keys().all(|k| SCALAR_OPERATORS.contains(&k.as_str())))
        .unwrap_or(false)
}

/// Whether a scalar value satisfies a scalar condition.
pub(crate) fn matches_scalar(value: &Value, condition: &Value) -> Result<bool> {
    if !is_operator_object(condition) {
        return Ok(values_equal(value, condition));
    }
    let Some(ops) = condition.as_object() else {
        return Ok(false);
    };
    let insensitive = ops.get("mode").and_then(Value::as_str) == Some("insensitive");

    for (op, arg) in ops {
        let ok = match op.as_str() {
            "mode" => true,
            "equals" => values_equal(value, arg),
            "not" if is_operator_object(arg) => !matches_scalar(value, arg)?,
            "not" => !values_equal(value, arg),
            "in" => arg
                .as_array()
                .map(|items| items.iter().any(|i| values_equal(value, i)))
                .unwrap_or(false),
            "notIn" => arg
                .as_array()
                .map(|items| !items.iter().any(|i| values_equal(value, i)))
                .unwrap_or(true),
            "lt" => compare_values(value, arg) == Some(Ordering::Less),
            "lte" => matches!(compare_values(value, arg), Some(Ordering::Less | Ordering::Equal)),
            "gt" => compare_values(value, arg) == Some(Ordering::Greater),
            "gte" => matches!(
                compare_values(value, arg),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            "contains" | "startsWith" | "endsWith" => {
                match (value.as_str(), arg.as_str()) {
                    (Some(v), Some(a)) => {
                        let (v, a) = if insensitive {
                            (v.to_lowercase(), a.to_lowercase())
                        } else {
                            (v.to_string(), a.to_string())
                        };
                        match op.as_str() {
                            "contains" => v.contains(&a),
                            "startsWith" => v.starts_with(&a),
                            _ => v.ends_with(&a),
                        }
                    }
                    _ => false,
                }
            }
            "has" => value
                .as_array()
                .map(|items| items.iter().any(|i| values_equal(i, arg)))
                .unwrap_or(false),
            "hasSome" => match (value.as_array(), arg.as_array()) {
                (Some(items), Some(wanted)) => {
                    wanted.iter().any(|w| items.iter().any(|i| values_equal(i, w)))
                }
                _ => false,
            },
            "hasEvery" => match (value.as_array(), arg.as_array()) {
                (Some(items), Some(wanted)) => {
                    wanted.iter().all(|w| items.iter().any(|i| values_equal(i, w)))
                }
                _ => false,
            },
            "isEmpty" => {
                let empty = value.as_array().map(Vec::is_empty).unwrap_or(true);
                arg.as_bool().map(|b| b == empty).unwrap_or(false)
            }
            _ => false,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

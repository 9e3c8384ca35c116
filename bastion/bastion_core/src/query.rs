//! Helpers for filter-shaped values.
//!
//! Guards and filters share one representation: `true`/`false` constants, or
//! a `where` object in the query language. The combinators fold constants
//! away so that the resulting filters stay small, and [`as_where`] turns any
//! guard into something that can be placed into a `where` slot.

use crate::meta::ModelMeta;
use serde_json::{json, Map, Value};

/// Whether the value is a filter that matches everything.
pub fn is_true(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Object(map) => {
            map.is_empty()
                || (map.len() == 1
                    && map
                        .get("AND")
                        .and_then(Value::as_array)
                        .map(Vec::is_empty)
                        .unwrap_or(false))
        }
        _ => false,
    }
}

/// Whether the value is a filter that matches nothing.
pub fn is_false(value: &Value) -> bool {
    match value {
        Value::Bool(b) => !*b,
        Value::Object(map) => {
            map.len() == 1
                && map
                    .get("OR")
                    .and_then(Value::as_array)
                    .map(Vec::is_empty)
                    .unwrap_or(false)
        }
        _ => false,
    }
}

/// Conjunction of filters. `Null` entries are ignored.
pub fn and<I: IntoIterator<Item = Value>>(conditions: I) -> Value {
    let mut children = Vec::new();
    for condition in conditions {
        if condition.is_null() || is_true(&condition) {
            continue;
        }
        if is_false(&condition) {
            return Value::Bool(false);
        }
        children.push(condition);
    }
    match children.len() {
        0 => Value::Bool(true),
        1 => children.pop().unwrap_or(Value::Bool(true)),
        _ => json!({ "AND": children }),
    }
}

/// Disjunction of filters. `Null` entries are ignored.
pub fn or<I: IntoIterator<Item = Value>>(conditions: I) -> Value {
    let mut children = Vec::new();
    for condition in conditions {
        if condition.is_null() || is_false(&condition) {
            continue;
        }
        if is_true(&condition) {
            return Value::Bool(true);
        }
        children.push(condition);
    }
    match children.len() {
        0 => Value::Bool(false),
        1 => children.pop().unwrap_or(Value::Bool(false)),
        _ => json!({ "OR": children }),
    }
}

/// Negation of a filter.
pub fn not(condition: Value) -> Value {
    if is_true(&condition) {
        Value::Bool(false)
    } else if is_false(&condition) {
        Value::Bool(true)
    } else {
        json!({ "NOT": condition })
    }
}

/// Convert a guard into a value that can be placed into a `where` slot.
pub fn as_where(guard: Value) -> Value {
    if is_true(&guard) || guard.is_null() {
        json!({})
    } else if is_false(&guard) {
        json!({ "OR": [] })
    } else {
        guard
    }
}

/// Items of a payload entry that may be a single value or a list.
pub fn enumerate(value: &Value) -> Vec<&Value> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

/// Whether a `select`/`include` entry requests the field.
pub fn is_requested(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        _ => true,
    }
}

/// `{ id: true, ... }` selecting the id fields of a model.
pub fn id_selection(meta: &ModelMeta, model: &str) -> Value {
    let mut select = Map::new();
    for field in meta.id_fields(model) {
        select.insert(field.name.clone(), Value::Bool(true));
    }
    Value::Object(select)
}

/// Extract id values from an entity, or `None` if any is missing.
pub fn entity_ids(meta: &ModelMeta, model: &str, entity: &Value) -> Option<Map<String, Value>> {
    let mut ids = Map::new();
    for field in meta.id_fields(model) {
        match entity.get(&field.name) {
            None | Some(Value::Null) => return None,
            Some(v) => {
                ids.insert(field.name.clone(), v.clone());
            }
        }
    }
    if ids.is_empty() {
        None
    } else {
        Some(ids)
    }
}

/// Replace generated compound unique keys (`{ a_b: { a, b } }`) with their
/// flat components (`{ a, b }`).
pub fn flatten_generated_unique_field(meta: &ModelMeta, model: &str, filter: &mut Map<String, Value>) {
    let compound: Vec<String> = meta
        .unique_constraints(model)
        .filter(|c| c.is_compound())
        .map(|c| c.name.clone())
        .collect();
    for name in compound {
        if let Some(Value::Object(parts)) = filter.remove(&name) {
            for (k, v) in parts {
                filter.insert(k, v);
            }
        }
    }
}

/// Replace flat components of a compound unique constraint with the
/// generated compound key, when every component is present as a plain value.
pub fn compose_compound_unique_field(
    meta: &ModelMeta,
    model: &str,
    filter: &Map<String, Value>,
) -> Map<String, Value> {
    let mut result = filter.clone();
    for constraint in meta.unique_constraints(model).filter(|c| c.is_compound()) {
        let complete = constraint
            .fields
            .iter()
            .all(|f| matches!(filter.get(f), Some(v) if !v.is_object() && !v.is_null()));
        if !complete {
            continue;
        }
        let mut parts = Map::new();
        for f in &constraint.fields {
            if let Some(v) = result.remove(f) {
                parts.insert(f.clone(), v);
            }
        }
        result.insert(constraint.name.clone(), Value::Object(parts));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{FieldInfo, ModelInfo, UniqueConstraint};

    #[test]
    fn test_constant_folding() {
        assert_eq!(and(vec![json!(true), json!({"a": 1})]), json!({"a": 1}));
        assert_eq!(and(vec![json!({"a": 1}), json!(false)]), json!(false));
        assert_eq!(and(Vec::new()), json!(true));
        assert_eq!(
            and(vec![json!({"a": 1}), json!({"b": 2})]),
            json!({"AND": [{"a": 1}, {"b": 2}]})
        );
        assert_eq!(or(vec![json!(false), json!({"a": 1})]), json!({"a": 1}));
        assert_eq!(or(vec![json!({"a": 1}), json!({})]), json!(true));
        assert_eq!(or(Vec::new()), json!(false));
        assert_eq!(not(json!({"OR": []})), json!(true));
        assert_eq!(not(json!({"a": 1})), json!({"NOT": {"a": 1}}));
    }

    #[test]
    fn test_as_where() {
        assert_eq!(as_where(json!(true)), json!({}));
        assert_eq!(as_where(json!(false)), json!({"OR": []}));
        assert!(is_false(&as_where(json!(false))));
        assert!(is_true(&as_where(json!(true))));
        assert!(is_true(&json!({"AND": []})));
    }

    #[test]
    fn test_compound_unique_fields() {
        let meta = ModelMeta::new(vec![ModelInfo::new("Membership")
            .field(FieldInfo::scalar("id", "Int").id())
            .field(FieldInfo::scalar("orgId", "Int"))
            .field(FieldInfo::scalar("userId", "Int"))
            .unique(UniqueConstraint::over(&["orgId", "userId"]))])
        .unwrap();

        let mut filter = json!({"orgId_userId": {"orgId": 1, "userId": 2}, "id": 3})
            .as_object()
            .cloned()
            .unwrap();
        flatten_generated_unique_field(&meta, "Membership", &mut filter);
        assert_eq!(Value::Object(filter.clone()), json!({"orgId": 1, "userId": 2, "id": 3}));

        let composed = compose_compound_unique_field(&meta, "Membership", &filter);
        assert_eq!(
            Value::Object(composed),
            json!({"orgId_userId": {"orgId": 1, "userId": 2}, "id": 3})
        );

        // Operator filters are left alone
        let filter = json!({"orgId": {"gt": 1}, "userId": 2}).as_object().cloned().unwrap();
        let composed = compose_compound_unique_field(&meta, "Membership", &filter);
        assert_eq!(composed, filter);
    }

    #[test]
    fn test_entity_ids() {
        let meta = ModelMeta::new(vec![ModelInfo::new("Post")
            .field(FieldInfo::scalar("id", "Int").id())
            .field(FieldInfo::scalar("title", "String"))])
        .unwrap();
        assert_eq!(id_selection(&meta, "Post"), json!({"id": true}));
        let ids = entity_ids(&meta, "Post", &json!({"id": 7, "title": "x"})).unwrap();
        assert_eq!(Value::Object(ids), json!({"id": 7}));
        assert!(entity_ids(&meta, "Post", &json!({"title": "x"})).is_none());
    }
}

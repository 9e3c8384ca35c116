//! Reversed queries.
//!
//! A nested operation only knows its own filter relative to its parent. The
//! reversed query re-expresses the whole ancestor chain in the terms of the
//! nested operation's model, so the exact rows it touches can be checked.

use bastion_core::error::{QueryError, Result};
use bastion_core::query::{and, as_where, flatten_generated_unique_field};
use bastion_core::{DbClient, ModelMeta, NestingPathItem};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::trace;

fn flattened(meta: &ModelMeta, model: &str, filter: &Value) -> Value {
    match filter {
        Value::Object(map) => {
            let mut map = map.clone();
            flatten_generated_unique_field(meta, model, &mut map);
            Value::Object(map)
        }
        _ => json!({}),
    }
}

/// Plain values of `fields` in `filter`, if every one is present.
fn plain_values(filter: &Value, fields: &[&String]) -> Option<Map<String, Value>> {
    let map = filter.as_object()?;
    let mut out = Map::new();
    for field in fields {
        match map.get(field.as_str()) {
            Some(v) if !v.is_object() && !v.is_null() && !v.is_array() => {
                out.insert(field.to_string(), v.clone());
            }
            _ => return None,
        }
    }
    Some(out)
}

/// Merge two filters into one object when their keys do not overlap.
fn conjoin(own: Value, link: Value) -> Value {
    match (own, link) {
        (Value::Object(mut a), Value::Object(b)) if b.keys().all(|k| !a.contains_key(k)) => {
            a.extend(b);
            Value::Object(a)
        }
        (a, b) => and([a, b]),
    }
}

/// Build a filter on the last model of `path` identifying the rows the
/// nested operation at the end of the path targets.
///
/// # Arguments
///
/// * `db` - Client used to look up parent ids when a foreign key is needed.
/// * `meta` - Schema metadata.
/// * `path` - Nesting path from the top-level operation, inclusive.
///
/// # Returns
///
/// A filter in the terms of the last model of the path. A to-one owned back
/// link compares foreign keys, and also keeps the parent filter under `is`
/// when it constrains more than the referenced keys. If a parent needed for
/// a foreign-key comparison does not exist, the filter matches nothing.
pub async fn build_reversed_query(
    db: &Arc<dyn DbClient>,
    meta: &ModelMeta,
    path: &[NestingPathItem],
) -> Result<Value> {
    let mut upper: Option<Value> = None;

    for (i, item) in path.iter().enumerate() {
        let own = flattened(meta, &item.model, &item.where_clause);
        let Some(parent_filter) = upper.take() else {
            upper = Some(own);
            continue;
        };

        let field = item.field.as_ref().ok_or_else(|| QueryError::InvalidArgument {
            action: "nested write".to_string(),
            detail: format!("missing relation leading to {}", item.model),
        })?;
        let back_name = field.back_link.as_deref().ok_or_else(|| QueryError::InvalidArgument {
            action: "nested write".to_string(),
            detail: format!("relation {} has no back link", field.name),
        })?;
        let back = meta.require_field(&item.model, back_name)?;

        let link = match back.foreign_key_mapping.as_ref() {
            Some(mapping) if back.is_relation_owner && !back.is_array => {
                let referenced: Vec<&String> = mapping.keys().collect();
                let values = match plain_values(&parent_filter, &referenced) {
                    Some(values) => Some(values),
                    None => {
                        let parent_model = &path[i - 1].model;
                        let select: Map<String, Value> = referenced
                            .iter()
                            .map(|r| (r.to_string(), Value::Bool(true)))
                            .collect();
                        db.model(parent_model)?
                            .find_first(json!({ "where": parent_filter, "select": select }))
                            .await?
                            .and_then(|parent| plain_values(&parent, &referenced))
                    }
                };
                match values {
                    Some(values) => {
                        let mut fk = Map::new();
                        for (referenced, local) in mapping {
                            if let Some(v) = values.get(referenced) {
                                fk.insert(local.clone(), v.clone());
                            }
                        }
                        // Constraints beyond the referenced keys still apply to the parent
                        let constrained = parent_filter
                            .as_object()
                            .is_some_and(|m| m.keys().any(|k| !referenced.contains(&k)));
                        if constrained {
                            fk.insert(back_name.to_string(), json!({ "is": parent_filter }));
                        }
                        Value::Object(fk)
                    }
                    None => Value::Bool(false),
                }
            }
            _ => {
                let wrapped = if back.is_array {
                    json!({ "some": parent_filter })
                } else {
                    json!({ "is": parent_filter })
                };
                let mut link = Map::new();
                link.insert(back_name.to_string(), wrapped);
                Value::Object(link)
            }
        };
        upper = Some(conjoin(own, link));
    }

    let result = as_where(upper.unwrap_or_else(|| json!({})));
    trace!(reversed = %result, "built reversed query");
    Ok(result)
}

/// The path with the filter of its last step replaced.
pub fn with_last_filter(path: &[NestingPathItem], filter: Value) -> Vec<NestingPathItem> {
    let mut path = path.to_vec();
    if let Some(last) = path.last_mut() {
        last.where_clause = filter;
    }
    path
}

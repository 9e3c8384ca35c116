//! Guarded lookups and read post-processing.

use super::guard::PolicyUtil;
use crate::model::ValidationMode;
use bastion_core::meta::{is_aux_relation, OMIT_ATTRIBUTE, SYSTEM_ATTRIBUTE};
use bastion_core::query::{and, as_where, entity_ids, id_selection, is_false, is_requested, is_true};
use bastion_core::{DbClient, Error, PolicyOperation, Result};
use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;

/// Post-process an entity read under injected guards.
///
/// Verifies every to-one relation in the entity against its read guard
/// (replacing unreadable ones with `null`), removes system and omitted
/// fields, and projects the entity back to the caller's `select`.
///
/// # Arguments
///
/// * `db` - Client of the layer below, used for to-one verification.
/// * `util` - Guard evaluation for the principal.
/// * `model` - Model of the entity.
/// * `entity` - Entity as returned by the layer below.
/// * `args` - The caller's original arguments (`select`/`include`).
pub fn post_process<'a>(
    db: &'a Arc<dyn DbClient>,
    util: PolicyUtil<'a>,
    model: &'a str,
    entity: Value,
    args: &'a Value,
) -> BoxFuture<'a, Result<Value>> {
    async move {
        let Value::Object(map) = entity else {
            return Ok(entity);
        };
        let select = args.get("select").and_then(Value::as_object);
        let include = args.get("include").and_then(Value::as_object);
        let empty = Value::Object(Map::new());

        let mut out = Map::new();
        for (name, value) in map {
            if is_aux_relation(&name) {
                continue;
            }
            let Some(field) = util.meta.field(model, &name) else {
                // `_count` and other computed entries
                out.insert(name, value);
                continue;
            };
            let requested = select
                .map(|s| s.get(&name).map(is_requested).unwrap_or(false))
                .or_else(|| include.and_then(|i| i.get(&name)).map(is_requested));

            if field.is_data_model {
                if requested == Some(false) || (select.is_some() && requested.is_none()) {
                    continue;
                }
                let spec = select
                    .and_then(|s| s.get(&name))
                    .or_else(|| include.and_then(|i| i.get(&name)))
                    .filter(|s| s.is_object())
                    .unwrap_or(&empty);
                let target = field.field_type.as_str();
                let value = match value {
                    Value::Array(items) => {
                        let mut rebuilt = Vec::with_capacity(items.len());
                        for item in items {
                            rebuilt.push(post_process(db, util, target, item, spec).await?);
                        }
                        Value::Array(rebuilt)
                    }
                    related @ Value::Object(_) => {
                        if readable_to_one(db, util, target, &related).await? {
                            post_process(db, util, target, related, spec).await?
                        } else {
                            debug!(model, relation = %name, "to-one relation is not readable");
                            Value::Null
                        }
                    }
                    other => other,
                };
                out.insert(name, value);
                continue;
            }

            if field.has_attribute(SYSTEM_ATTRIBUTE) {
                continue;
            }
            match select {
                Some(_) if requested != Some(true) => continue,
                None if field.has_attribute(OMIT_ATTRIBUTE) => continue,
                _ => {}
            }
            out.insert(name, value);
        }
        Ok(Value::Object(out))
    }
    .boxed()
}

/// Whether a related entity fetched through a to-one relation passes its read guard.
async fn readable_to_one(
    db: &Arc<dyn DbClient>,
    util: PolicyUtil<'_>,
    model: &str,
    entity: &Value,
) -> Result<bool> {
    let guard = util.guard(model, PolicyOperation::Read, None);
    if is_true(&guard) {
        return Ok(true);
    }
    if is_false(&guard) {
        return Ok(false);
    }
    let Some(ids) = entity_ids(util.meta, model, entity) else {
        return Ok(false);
    };
    let found = db
        .model(model)?
        .find_first(json!({
            "where": as_where(and([Value::Object(ids), guard])),
            "select": id_selection(util.meta, model),
        }))
        .await?;
    Ok(found.is_some())
}

/// Read an entity under read guards, shaped by the caller's `select`/`include`.
///
/// # Returns
///
/// The entity, or `None` if it does not exist or is not readable.
pub async fn read_back(
    db: &Arc<dyn DbClient>,
    util: PolicyUtil<'_>,
    model: &str,
    original: &Value,
    filter: Value,
) -> Result<Option<Value>> {
    let mut args = Map::new();
    for key in ["select", "include"] {
        if let Some(v) = original.get(key).filter(|v| !v.is_null()) {
            args.insert(key.to_string(), v.clone());
        }
    }
    let shape = Value::Object(args.clone());
    args.insert("where".to_string(), filter);
    let Some(guarded) = util.inject_for_read(model, &Value::Object(args)) else {
        return Ok(None);
    };
    match db.model(model)?.find_first(guarded).await? {
        Some(entity) => Ok(Some(post_process(db, util, model, entity, &shape).await?)),
        None => Ok(None),
    }
}

/// Look up the ids of the entity matching `filter`, ignoring policies.
///
/// # Returns
///
/// The ids, `None` if absent, or `Error::NotFound` if absent and `throw` is set.
pub async fn check_existence(
    db: &Arc<dyn DbClient>,
    util: PolicyUtil<'_>,
    model: &str,
    filter: &Value,
    throw: bool,
) -> Result<Option<Map<String, Value>>> {
    let found = db
        .model(model)?
        .find_first(json!({ "where": filter, "select": id_selection(util.meta, model) }))
        .await?;
    match found.and_then(|e| entity_ids(util.meta, model, &e)) {
        Some(ids) => Ok(Some(ids)),
        None if throw => Err(Error::NotFound(format!("{} entity not found", model))),
        None => Ok(None),
    }
}

/// Check that the entity matching `filter` satisfies the guard of `operation`.
///
/// For `create` and `postUpdate`, the stored entity is also validated
/// against the model's validation schema.
pub async fn check_policy_for_unique(
    db: &Arc<dyn DbClient>,
    util: PolicyUtil<'_>,
    model: &str,
    filter: &Value,
    operation: PolicyOperation,
    pre_value: Option<&Value>,
) -> Result<()> {
    let guard = util.guard(model, operation, pre_value);
    if is_false(&guard) {
        return Err(Error::denied(model, operation, None));
    }
    let lower = db.model(model)?;
    if !is_true(&guard) {
        let found = lower
            .find_first(json!({
                "where": as_where(and([filter.clone(), guard])),
                "select": id_selection(util.meta, model),
            }))
            .await?;
        if found.is_none() {
            return Err(Error::denied(
                model,
                operation,
                Some(format!("entity {} failed policy check", filter)),
            ));
        }
    }

    if matches!(operation, PolicyOperation::Create | PolicyOperation::PostUpdate)
        && util.has_validation(model)
    {
        if let Some(entity) = lower.find_first(json!({ "where": filter })).await? {
            util.validate(model, &entity, ValidationMode::Entity)?;
        }
    }
    Ok(())
}

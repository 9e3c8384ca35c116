//! Checks run inside the write transaction after the mutation.

use crate::model::ValidationMode;
use crate::query::{check_policy_for_unique, PolicyUtil};
use bastion_core::meta::TRANSACTION_FIELD_NAME;
use bastion_core::query::{and, as_where, id_selection, is_false, is_true, not};
use bastion_core::{DbClient, Error, PolicyOperation, Result};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// An entity that must satisfy its `postUpdate` guard once the write is done.
#[derive(Debug, Clone, PartialEq)]
pub struct PostWriteCheck {
    pub model: String,
    /// Unique filter identifying the entity after the write
    pub filter: Value,
    /// Entity fields captured before the write
    pub pre_value: Option<Value>,
}

/// Run registered post-write checks, failing on the first violation.
pub async fn run_post_write_checks(
    db: &Arc<dyn DbClient>,
    util: PolicyUtil<'_>,
    checks: &[PostWriteCheck],
) -> Result<()> {
    for check in checks {
        check_policy_for_unique(
            db,
            util,
            &check.model,
            &check.filter,
            PolicyOperation::PostUpdate,
            check.pre_value.as_ref(),
        )
        .await?;
    }
    Ok(())
}

fn tag_filter(tag: &str) -> Value {
    let mut filter = Map::new();
    filter.insert(TRANSACTION_FIELD_NAME.to_string(), Value::String(tag.to_string()));
    Value::Object(filter)
}

/// Marks the rows a write creates so their `create` guard can be checked
/// once they exist.
///
/// Each write gets its own tag. After the mutation, any tagged row that does
/// not satisfy its model's `create` guard fails the write; the tags are then
/// cleared.
#[derive(Debug)]
pub struct CreateTags {
    tag: String,
    models: BTreeSet<String>,
}

impl Default for CreateTags {
    fn default() -> Self {
        Self {
            tag: Uuid::new_v4().to_string(),
            models: BTreeSet::new(),
        }
    }
}

impl CreateTags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check a create payload up front and tag it when its guard depends on
    /// the stored row.
    ///
    /// # Returns
    ///
    /// The payload to create, tagged if needed.
    pub fn prepare(&mut self, util: PolicyUtil<'_>, model: &str, data: &Value) -> Result<Value> {
        util.try_reject(model, PolicyOperation::Create)?;
        util.validate(model, data, ValidationMode::Create)?;
        if !util.has_guard(model, PolicyOperation::Create) {
            return Ok(data.clone());
        }
        let Value::Object(mut map) = data.clone() else {
            return Ok(data.clone());
        };
        map.insert(
            TRANSACTION_FIELD_NAME.to_string(),
            Value::String(self.tag.clone()),
        );
        self.models.insert(model.to_string());
        Ok(Value::Object(map))
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Verify every tagged row against its `create` guard, then clear the tags.
    pub async fn verify(&self, db: &Arc<dyn DbClient>, util: PolicyUtil<'_>) -> Result<()> {
        let tagged = tag_filter(&self.tag);
        for model in &self.models {
            let guard = util.guard(model, PolicyOperation::Create, None);
            let lower = db.model(model)?;
            if !is_true(&guard) {
                let violating = if is_false(&guard) {
                    tagged.clone()
                } else {
                    as_where(and([tagged.clone(), not(guard)]))
                };
                let found = lower
                    .find_first(json!({ "where": violating, "select": id_selection(util.meta, model) }))
                    .await?;
                if let Some(entity) = found {
                    debug!(model = %model, entity = %entity, "created entity failed create check");
                    return Err(Error::denied(
                        model.as_str(),
                        PolicyOperation::Create,
                        Some("created entity does not satisfy the create policy".to_string()),
                    ));
                }
            }
            let mut cleared = Map::new();
            cleared.insert(TRANSACTION_FIELD_NAME.to_string(), Value::Null);
            lower
                .update_many(json!({ "where": tagged, "data": cleared }))
                .await?;
        }
        Ok(())
    }
}

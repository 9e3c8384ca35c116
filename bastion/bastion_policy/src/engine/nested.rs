//! Policy checks for nested writes.
//!
//! [`PolicyCallbacks`] is driven by the nested-write visitor over the payload
//! of a create or update. Rows that already exist are checked before the
//! mutation through their reversed queries; rows that are created are tagged
//! and checked afterwards, together with the registered `postUpdate` checks.

use super::checks::{run_post_write_checks, CreateTags, PostWriteCheck};
use super::handler::PolicyHandler;
use crate::query::{build_reversed_query, check_existence, check_policy_for_unique, with_last_filter};
use crate::model::ValidationMode;
use async_trait::async_trait;
use bastion_core::query::{and, as_where, entity_ids, enumerate, id_selection, is_false, is_true};
use bastion_core::visitor::is_wrapped_update;
use bastion_core::{
    Error, FieldInfo, ModelMeta, NestedWriteAction, NestedWriteCallbacks, PolicyOperation, Result,
    VisitAction, VisitorContext,
};
use serde_json::{json, Map, Value};
use tracing::trace;

/// Whether the foreign key of `field` lives on the related model, so that
/// connecting or disconnecting through it updates the related row.
fn target_owns(meta: &ModelMeta, field: &FieldInfo) -> bool {
    field
        .back_link
        .as_deref()
        .and_then(|back| meta.field(&field.field_type, back))
        .map(|back| back.is_relation_owner)
        .unwrap_or(false)
}

/// Ids of an entity with the new values of ids the update writes.
pub(crate) fn overlay_ids(
    meta: &ModelMeta,
    model: &str,
    mut ids: Map<String, Value>,
    data: Option<&Value>,
) -> Map<String, Value> {
    let Some(data) = data.and_then(Value::as_object) else {
        return ids;
    };
    for field in meta.id_fields(model) {
        let value = match data.get(&field.name) {
            Some(Value::Object(op)) => op.get("set"),
            Some(Value::Null) | None => None,
            Some(v) => Some(v),
        };
        if let Some(v) = value.filter(|v| !v.is_null()) {
            ids.insert(field.name.clone(), v.clone());
        }
    }
    ids
}

/// Selection of the id fields plus the fields `postUpdate` guards read.
pub(crate) fn check_selection(meta: &ModelMeta, model: &str, pre_value: Option<&Value>) -> Value {
    let mut select = match id_selection(meta, model) {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    if let Some(Value::Object(extra)) = pre_value {
        for (k, v) in extra {
            select.insert(k.clone(), v.clone());
        }
    }
    Value::Object(select)
}

/// Check that an existing row may be updated, and register its post-update
/// check if its model needs one.
async fn check_update_target(
    handler: &PolicyHandler,
    checks: &mut Vec<PostWriteCheck>,
    model: &str,
    filter: &Value,
    data: Option<&Value>,
    throw: bool,
) -> Result<()> {
    let db = handler.db();
    let util = handler.util();
    let Some(ids) = check_existence(db, util, model, filter, throw).await? else {
        return Ok(());
    };
    util.try_reject(model, PolicyOperation::Update)?;
    if let Some(data) = data {
        util.validate(model, data, ValidationMode::Update)?;
    }
    let unique = Value::Object(ids.clone());
    check_policy_for_unique(db, util, model, &unique, PolicyOperation::Update, None).await?;

    if util.needs_post_update_check(model) {
        let pre_value = match util.pre_value_select(model) {
            Some(select) => {
                db.model(model)?
                    .find_first(json!({ "where": unique, "select": select }))
                    .await?
            }
            None => None,
        };
        checks.push(PostWriteCheck {
            model: model.to_string(),
            filter: Value::Object(overlay_ids(util.meta, model, ids, data)),
            pre_value,
        });
    }
    Ok(())
}

/// Check every row matching `filter` as an update target.
async fn check_update_targets(
    handler: &PolicyHandler,
    checks: &mut Vec<PostWriteCheck>,
    model: &str,
    filter: Value,
) -> Result<()> {
    let rows = handler
        .db()
        .model(model)?
        .find_many(json!({ "where": filter, "select": id_selection(handler.util().meta, model) }))
        .await?;
    for row in rows {
        if let Some(ids) = entity_ids(handler.util().meta, model, &row) {
            check_update_target(handler, checks, model, &Value::Object(ids), None, false).await?;
        }
    }
    Ok(())
}

/// Visitor callbacks enforcing policies on a nested write.
pub struct PolicyCallbacks {
    handler: PolicyHandler,
    tags: CreateTags,
    checks: Vec<PostWriteCheck>,
}

impl PolicyCallbacks {
    pub fn new(handler: PolicyHandler) -> Self {
        Self {
            handler,
            tags: CreateTags::new(),
            checks: Vec::new(),
        }
    }

    /// Run the checks that need the mutation to have happened.
    pub async fn finish(&self) -> Result<()> {
        let db = self.handler.db();
        let util = self.handler.util();
        if !self.tags.is_empty() {
            self.tags.verify(db, util).await?;
        }
        trace!(count = self.checks.len(), "running post-write checks");
        run_post_write_checks(db, util, &self.checks).await
    }
}

#[async_trait]
impl NestedWriteCallbacks for PolicyCallbacks {
    async fn create(&mut self, model: &str, data: &Value, _ctx: &VisitorContext<'_>) -> Result<VisitAction> {
        let tagged = self.tags.prepare(self.handler.util(), model, data)?;
        Ok(VisitAction::Replace(tagged))
    }

    async fn create_many(&mut self, model: &str, args: &Value, _ctx: &VisitorContext<'_>) -> Result<VisitAction> {
        let util = self.handler.util();
        let mut rebuilt = args.as_object().cloned().unwrap_or_default();
        let data = match args.get("data") {
            Some(Value::Array(items)) => {
                let mut tagged = Vec::with_capacity(items.len());
                for item in items {
                    tagged.push(self.tags.prepare(util, model, item)?);
                }
                Value::Array(tagged)
            }
            Some(item) => self.tags.prepare(util, model, item)?,
            None => return Ok(VisitAction::Continue),
        };
        rebuilt.insert("data".to_string(), data);
        Ok(VisitAction::Replace(Value::Object(rebuilt)))
    }

    async fn connect(&mut self, model: &str, filter: &Value, ctx: &VisitorContext<'_>) -> Result<VisitAction> {
        if let Some(field) = ctx.field {
            if target_owns(self.handler.util().meta, field) {
                check_update_target(&self.handler, &mut self.checks, model, filter, None, false).await?;
            }
        }
        Ok(VisitAction::Continue)
    }

    async fn connect_or_create(&mut self, model: &str, args: &Value, ctx: &VisitorContext<'_>) -> Result<VisitAction> {
        let util = self.handler.util();
        let filter = args.get("where").cloned().unwrap_or_else(|| json!({}));
        match check_existence(self.handler.db(), util, model, &filter, false).await? {
            Some(_) => {
                if let Some(field) = ctx.field.filter(|f| target_owns(util.meta, f)) {
                    trace!(model, relation = %field.name, "connectOrCreate connects an existing row");
                    check_update_target(&self.handler, &mut self.checks, model, &filter, None, false).await?;
                }
                Ok(VisitAction::Convert {
                    action: NestedWriteAction::Connect,
                    item: filter,
                })
            }
            None => {
                let create = args.get("create").cloned().unwrap_or_else(|| json!({}));
                Ok(VisitAction::Convert {
                    action: NestedWriteAction::Create,
                    item: self.tags.prepare(util, model, &create)?,
                })
            }
        }
    }

    async fn disconnect(&mut self, model: &str, filter: &Value, ctx: &VisitorContext<'_>) -> Result<VisitAction> {
        if matches!(filter, Value::Bool(false)) {
            return Ok(VisitAction::Continue);
        }
        if let Some(field) = ctx.field {
            if target_owns(self.handler.util().meta, field) {
                let connected = build_reversed_query(self.handler.db(), self.handler.util().meta, ctx.nesting_path).await?;
                check_update_targets(&self.handler, &mut self.checks, model, connected).await?;
            }
        }
        Ok(VisitAction::Continue)
    }

    async fn set(&mut self, model: &str, filters: &Value, ctx: &VisitorContext<'_>) -> Result<VisitAction> {
        let Some(field) = ctx.field.filter(|f| target_owns(self.handler.util().meta, f)) else {
            return Ok(VisitAction::Continue);
        };
        trace!(model, relation = %field.name, "checking rows replaced by set");
        let path = with_last_filter(ctx.nesting_path, json!({}));
        let connected = build_reversed_query(self.handler.db(), self.handler.util().meta, &path).await?;
        check_update_targets(&self.handler, &mut self.checks, model, connected).await?;
        for filter in enumerate(filters) {
            check_update_target(&self.handler, &mut self.checks, model, filter, None, false).await?;
        }
        Ok(VisitAction::Continue)
    }

    async fn update(&mut self, model: &str, args: &Value, ctx: &VisitorContext<'_>) -> Result<VisitAction> {
        let filter = build_reversed_query(self.handler.db(), self.handler.util().meta, ctx.nesting_path).await?;
        let data = if ctx.is_top_level() || is_wrapped_update(args) {
            args.get("data")
        } else {
            Some(args)
        };
        check_update_target(&self.handler, &mut self.checks, model, &filter, data, true).await?;
        Ok(VisitAction::Continue)
    }

    async fn update_many(&mut self, model: &str, args: &Value, ctx: &VisitorContext<'_>) -> Result<VisitAction> {
        let util = self.handler.util();
        util.try_reject(model, PolicyOperation::Update)?;
        let data = args.get("data").cloned().unwrap_or_else(|| json!({}));
        util.validate(model, &data, ValidationMode::Update)?;
        let guard = util.guard(model, PolicyOperation::Update, None);

        if util.needs_post_update_check(model) {
            let reversed = build_reversed_query(self.handler.db(), util.meta, ctx.nesting_path).await?;
            let pre_select = util.pre_value_select(model);
            let rows = self
                .handler
                .db()
                .model(model)?
                .find_many(json!({
                    "where": as_where(and([reversed, guard.clone()])),
                    "select": check_selection(util.meta, model, pre_select),
                }))
                .await?;
            for row in rows {
                let Some(ids) = entity_ids(util.meta, model, &row) else {
                    continue;
                };
                self.checks.push(PostWriteCheck {
                    model: model.to_string(),
                    filter: Value::Object(overlay_ids(util.meta, model, ids, Some(&data))),
                    pre_value: pre_select.map(|_| row),
                });
            }
        }

        let mut rebuilt = args.as_object().cloned().unwrap_or_default();
        let filter = args.get("where").cloned().unwrap_or_else(|| json!({}));
        rebuilt.insert("where".to_string(), as_where(and([filter, guard])));
        Ok(VisitAction::Replace(Value::Object(rebuilt)))
    }

    async fn upsert(&mut self, model: &str, args: &Value, ctx: &VisitorContext<'_>) -> Result<VisitAction> {
        let util = self.handler.util();
        let filter = build_reversed_query(self.handler.db(), util.meta, ctx.nesting_path).await?;
        match check_existence(self.handler.db(), util, model, &filter, false).await? {
            Some(_) => {
                let update = args.get("update").cloned().unwrap_or_else(|| json!({}));
                check_update_target(&self.handler, &mut self.checks, model, &filter, Some(&update), true)
                    .await?;
                let item = if ctx.is_array() {
                    json!({
                        "where": args.get("where").cloned().unwrap_or_else(|| json!({})),
                        "data": update,
                    })
                } else {
                    update
                };
                Ok(VisitAction::Convert {
                    action: NestedWriteAction::Update,
                    item,
                })
            }
            None => {
                let create = args.get("create").cloned().unwrap_or_else(|| json!({}));
                Ok(VisitAction::Convert {
                    action: NestedWriteAction::Create,
                    item: self.tags.prepare(util, model, &create)?,
                })
            }
        }
    }

    async fn delete(&mut self, model: &str, filter: &Value, ctx: &VisitorContext<'_>) -> Result<VisitAction> {
        if matches!(filter, Value::Bool(false)) {
            return Ok(VisitAction::Continue);
        }
        let db = self.handler.db();
        let util = self.handler.util();
        let reversed = build_reversed_query(db, util.meta, ctx.nesting_path).await?;
        if let Some(ids) = check_existence(db, util, model, &reversed, true).await? {
            check_policy_for_unique(db, util, model, &Value::Object(ids), PolicyOperation::Delete, None)
                .await?;
        }
        Ok(VisitAction::Continue)
    }

    async fn delete_many(&mut self, model: &str, filter: &Value, _ctx: &VisitorContext<'_>) -> Result<VisitAction> {
        let guard = self.handler.util().guard(model, PolicyOperation::Delete, None);
        if is_false(&guard) {
            return Err(Error::denied(model, PolicyOperation::Delete, None));
        }
        if is_true(&guard) {
            return Ok(VisitAction::Continue);
        }
        Ok(VisitAction::Replace(as_where(and([filter.clone(), guard]))))
    }
}

/// Detects nested creates and connects, which rule out the create fast path.
#[derive(Debug, Default)]
pub struct NestedCreateDetector {
    found: bool,
}

impl NestedCreateDetector {
    pub fn found(&self) -> bool {
        self.found
    }
}

#[async_trait]
impl NestedWriteCallbacks for NestedCreateDetector {
    async fn create(&mut self, _model: &str, _data: &Value, ctx: &VisitorContext<'_>) -> Result<VisitAction> {
        if !ctx.is_top_level() {
            self.found = true;
        }
        Ok(VisitAction::Continue)
    }

    async fn create_many(&mut self, _model: &str, _args: &Value, _ctx: &VisitorContext<'_>) -> Result<VisitAction> {
        self.found = true;
        Ok(VisitAction::Skip)
    }

    async fn connect(&mut self, _model: &str, _filter: &Value, _ctx: &VisitorContext<'_>) -> Result<VisitAction> {
        self.found = true;
        Ok(VisitAction::Skip)
    }

    async fn connect_or_create(&mut self, _model: &str, _args: &Value, _ctx: &VisitorContext<'_>) -> Result<VisitAction> {
        self.found = true;
        Ok(VisitAction::Skip)
    }
}

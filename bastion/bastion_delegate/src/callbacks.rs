//! Nested-write callbacks reshaping payloads for hierarchy models.

use crate::hierarchy::{
    ensure_base_create_hierarchy, inject_where_hierarchy, reject_discriminator_writes,
    relocate_update_hierarchy, touches_inherited,
};
use async_trait::async_trait;
use bastion_core::error::QueryError;
use bastion_core::meta::is_aux_relation;
use bastion_core::visitor::is_wrapped_update;
use bastion_core::{
    ModelMeta, NestedWriteAction, NestedWriteCallbacks, Result, VisitAction, VisitorContext,
};
use serde_json::{Map, Value};

/// Whether the operation runs through a synthetic hierarchy relation, in
/// which case its payload is already shaped per level.
fn through_aux(ctx: &VisitorContext<'_>) -> bool {
    ctx.field.map(|f| is_aux_relation(&f.name)).unwrap_or(false)
}

fn object_with(entries: Vec<(&str, Value)>) -> Value {
    let mut map = Map::new();
    for (key, value) in entries {
        map.insert(key.to_string(), value);
    }
    Value::Object(map)
}

/// Rewrites every create, update and filter of a nested payload so each
/// field lands on the level that stores it.
pub struct DelegateCallbacks<'m> {
    meta: &'m ModelMeta,
}

impl<'m> DelegateCallbacks<'m> {
    pub fn new(meta: &'m ModelMeta) -> Self {
        Self { meta }
    }

    fn create_payload(&self, model: &str, data: &Value, action: &str) -> Result<Value> {
        if self.meta.is_delegate(model) {
            return Err(QueryError::AbstractModel {
                model: model.to_string(),
                action: action.to_string(),
            }
            .into());
        }
        reject_discriminator_writes(self.meta, model, data)?;
        Ok(ensure_base_create_hierarchy(self.meta, model, data))
    }

    fn update_payload(&self, model: &str, data: &Value) -> Result<Value> {
        reject_discriminator_writes(self.meta, model, data)?;
        Ok(relocate_update_hierarchy(self.meta, model, data))
    }

    fn filter(&self, model: &str, filter: &Value) -> Value {
        inject_where_hierarchy(self.meta, model, filter)
    }
}

#[async_trait]
impl NestedWriteCallbacks for DelegateCallbacks<'_> {
    async fn create(&mut self, model: &str, data: &Value, ctx: &VisitorContext<'_>) -> Result<VisitAction> {
        if through_aux(ctx) || !self.meta.in_hierarchy(model) {
            return Ok(VisitAction::Continue);
        }
        Ok(VisitAction::Replace(self.create_payload(model, data, "create")?))
    }

    async fn create_many(&mut self, model: &str, args: &Value, ctx: &VisitorContext<'_>) -> Result<VisitAction> {
        if through_aux(ctx) || self.meta.base_model(model).is_none() {
            return Ok(VisitAction::Continue);
        }
        if args.get("skipDuplicates").and_then(Value::as_bool).unwrap_or(false) {
            return Err(QueryError::SkipDuplicates {
                model: model.to_string(),
            }
            .into());
        }
        // A batch cannot carry nested creates, so each item becomes a create
        let mut items = Vec::new();
        for item in bastion_core::query::enumerate(args.get("data").unwrap_or(&Value::Null)) {
            items.push(self.create_payload(model, item, "createMany")?);
        }
        Ok(VisitAction::Convert {
            action: NestedWriteAction::Create,
            item: Value::Array(items),
        })
    }

    async fn connect_or_create(&mut self, model: &str, args: &Value, ctx: &VisitorContext<'_>) -> Result<VisitAction> {
        if through_aux(ctx) || !self.meta.in_hierarchy(model) {
            return Ok(VisitAction::Continue);
        }
        let mut out = args.as_object().cloned().unwrap_or_default();
        if let Some(create) = out.remove("create") {
            out.insert(
                "create".to_string(),
                self.create_payload(model, &create, "connectOrCreate")?,
            );
        }
        Ok(VisitAction::Replace(Value::Object(out)))
    }

    async fn update(&mut self, model: &str, args: &Value, ctx: &VisitorContext<'_>) -> Result<VisitAction> {
        if through_aux(ctx) || self.meta.base_model(model).is_none() {
            return Ok(VisitAction::Continue);
        }
        if ctx.is_top_level() || is_wrapped_update(args) {
            let mut out = args.as_object().cloned().unwrap_or_default();
            if let Some(data) = out.remove("data") {
                out.insert("data".to_string(), self.update_payload(model, &data)?);
            }
            if let Some(filter) = out.remove("where") {
                out.insert("where".to_string(), self.filter(model, &filter));
            }
            return Ok(VisitAction::Replace(Value::Object(out)));
        }
        Ok(VisitAction::Replace(self.update_payload(model, args)?))
    }

    async fn update_many(&mut self, model: &str, args: &Value, ctx: &VisitorContext<'_>) -> Result<VisitAction> {
        if through_aux(ctx) || self.meta.base_model(model).is_none() {
            return Ok(VisitAction::Continue);
        }
        let data = args.get("data").cloned().unwrap_or(Value::Null);
        reject_discriminator_writes(self.meta, model, &data)?;
        if touches_inherited(self.meta, model, &data) {
            return Err(QueryError::InvalidArgument {
                action: "updateMany".to_string(),
                detail: format!(
                    "a nested updateMany of {} cannot write fields stored on its base models",
                    model
                ),
            }
            .into());
        }
        let filter = args.get("where").cloned().unwrap_or(Value::Null);
        Ok(VisitAction::Replace(object_with(vec![
            ("where", self.filter(model, &filter)),
            ("data", data),
        ])))
    }

    async fn upsert(&mut self, model: &str, args: &Value, ctx: &VisitorContext<'_>) -> Result<VisitAction> {
        if through_aux(ctx) || !self.meta.in_hierarchy(model) {
            return Ok(VisitAction::Continue);
        }
        let mut out = args.as_object().cloned().unwrap_or_default();
        if let Some(create) = out.remove("create") {
            out.insert("create".to_string(), self.create_payload(model, &create, "upsert")?);
        }
        if let Some(update) = out.remove("update") {
            out.insert("update".to_string(), self.update_payload(model, &update)?);
        }
        if let Some(filter) = out.remove("where") {
            out.insert("where".to_string(), self.filter(model, &filter));
        }
        Ok(VisitAction::Replace(Value::Object(out)))
    }

    async fn delete(&mut self, model: &str, filter: &Value, ctx: &VisitorContext<'_>) -> Result<VisitAction> {
        self.reject_nested_delete(model, filter, ctx, "delete")
    }

    async fn delete_many(&mut self, model: &str, filter: &Value, ctx: &VisitorContext<'_>) -> Result<VisitAction> {
        self.reject_nested_delete(model, filter, ctx, "deleteMany")
    }
}

impl DelegateCallbacks<'_> {
    /// Nested deletes of a sub-type would leave its base rows behind.
    fn reject_nested_delete(
        &self,
        model: &str,
        filter: &Value,
        ctx: &VisitorContext<'_>,
        action: &str,
    ) -> Result<VisitAction> {
        if ctx.is_top_level() || through_aux(ctx) || self.meta.base_model(model).is_none() {
            return Ok(VisitAction::Continue);
        }
        Err(QueryError::InvalidArgument {
            action: action.to_string(),
            detail: format!(
                "{} rows cannot be deleted through a nested write, delete them through the {} model instead (filter: {})",
                model, model, filter
            ),
        }
        .into())
    }
}

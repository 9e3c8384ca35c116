//! Hierarchy-aware model handle.
//!
//! A [`DelegateHandler`] presents one virtual model per type of a hierarchy.
//! Reads fetch every level in one query and assemble the result. Writes are
//! reshaped so each field lands on the level that stores it, and operations
//! the storage cannot express across levels are decomposed inside a
//! transaction.

use crate::arena::assemble_hierarchy;
use crate::callbacks::DelegateCallbacks;
use crate::client::DelegateOptions;
use crate::hierarchy::{
    bases_track_updates, check_aggregation, inject_read_hierarchy, inject_where_hierarchy,
    reject_discriminator_writes, touches_inherited,
};
use async_trait::async_trait;
use bastion_core::error::QueryError;
use bastion_core::meta::{is_aux_relation, ReferentialAction};
use bastion_core::query::{entity_ids, enumerate, flatten_generated_unique_field, id_selection};
use bastion_core::utils::logging::log_query;
use bastion_core::{
    run_in_transaction, BatchPayload, CrudOperations, DbClient, Error, ModelMeta, NestedWriteAction,
    NestedWriteVisitor, Result,
};
use serde_json::{json, Map, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

fn require<'v>(args: &'v Value, action: &str, argument: &str) -> Result<&'v Value> {
    args.get(argument).filter(|v| !v.is_null()).ok_or_else(|| {
        QueryError::MissingArgument {
            action: action.to_string(),
            argument: argument.to_string(),
        }
        .into()
    })
}

/// Hierarchy-aware handle of one model.
#[derive(Clone)]
pub struct DelegateHandler {
    inner: Arc<dyn DbClient>,
    meta: Arc<ModelMeta>,
    options: Arc<DelegateOptions>,
    model: String,
}

impl DelegateHandler {
    pub(crate) fn new(
        inner: Arc<dyn DbClient>,
        meta: Arc<ModelMeta>,
        options: Arc<DelegateOptions>,
        model: &str,
    ) -> Self {
        Self {
            inner,
            meta,
            options,
            model: model.to_string(),
        }
    }

    fn lower(&self) -> Result<Arc<dyn CrudOperations>> {
        self.inner.model(&self.model)
    }

    fn scoped(&self, db: Arc<dyn DbClient>) -> Self {
        Self {
            inner: db,
            ..self.clone()
        }
    }

    fn for_model(&self, model: &str) -> Self {
        Self {
            model: model.to_string(),
            ..self.clone()
        }
    }

    fn log(&self, action: &str, args: &Value) {
        if self.options.log_queries {
            log_query("delegate", action, &self.model, args);
        }
    }

    /// Run `f` with a handler scoped to a transaction.
    async fn transact<F, Fut>(&self, f: F) -> Result<Value>
    where
        F: FnOnce(DelegateHandler) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let this = self.clone();
        run_in_transaction(&self.inner, &self.options.transaction, move |tx| f(this.scoped(tx))).await
    }

    fn assemble(&self, entity: Value) -> Value {
        assemble_hierarchy(&self.meta, &self.model, entity)
    }

    /// The caller's `select`/`include` rewritten to fetch the full hierarchy.
    fn shape(&self, args: &Value) -> Map<String, Value> {
        let mut shape = Map::new();
        for key in ["select", "include"] {
            if let Some(v) = args.get(key).filter(|v| !v.is_null()) {
                shape.insert(key.to_string(), v.clone());
            }
        }
        match inject_read_hierarchy(&self.meta, &self.model, &Value::Object(shape)) {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn ids_of(&self, entity: &Value) -> Result<Value> {
        entity_ids(&self.meta, &self.model, entity)
            .map(Value::Object)
            .ok_or_else(|| Error::Unknown {
                message: format!("{} entity was returned without its ids", self.model),
                source: None,
            })
    }

    fn not_found(&self) -> Error {
        Error::NotFound(format!("no {} matches the unique filter", self.model))
    }

    /// A unique filter the storage can evaluate on this model's own table.
    ///
    /// Filters on fields stored at a base level are resolved to ids first.
    async fn unique_filter(&self, args: &Value, action: &str) -> Result<Value> {
        let Some(Value::Object(filter)) = args.get("where") else {
            return Err(QueryError::MissingArgument {
                action: action.to_string(),
                argument: "where".to_string(),
            }
            .into());
        };
        let mut flat = filter.clone();
        flatten_generated_unique_field(&self.meta, &self.model, &mut flat);
        let flat = Value::Object(flat);
        if !touches_inherited(&self.meta, &self.model, &flat) {
            return Ok(Value::Object(filter.clone()));
        }
        debug!(model = %self.model, "resolving unique filter across hierarchy levels");
        let found = self
            .lower()?
            .find_first(json!({
                "where": inject_where_hierarchy(&self.meta, &self.model, &flat),
                "select": id_selection(&self.meta, &self.model),
            }))
            .await?;
        match found {
            Some(entity) => self.ids_of(&entity),
            None => Err(self.not_found()),
        }
    }

    /// Ids of every row matching a filter.
    async fn matching_ids(&self, filter: &Value) -> Result<Vec<Value>> {
        let rows = self
            .lower()?
            .find_many(json!({
                "where": inject_where_hierarchy(&self.meta, &self.model, filter),
                "select": id_selection(&self.meta, &self.model),
            }))
            .await?;
        rows.iter().map(|row| self.ids_of(row)).collect()
    }

    /// Reject direct writes to a delegate model.
    fn reject_abstract(&self, action: &str) -> Result<()> {
        if self.meta.is_delegate(&self.model) {
            return Err(QueryError::AbstractModel {
                model: self.model.clone(),
                action: action.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Run the nested-write visitor over a payload.
    async fn reshape(&self, action: NestedWriteAction, args: Value) -> Result<Value> {
        let mut visitor = NestedWriteVisitor::new(&self.meta, DelegateCallbacks::new(&self.meta));
        visitor.visit(&self.model, action, &args).await
    }

    async fn do_create(&self, data: Value, shape: Map<String, Value>) -> Result<Value> {
        let rebuilt = self
            .reshape(NestedWriteAction::Create, json!({ "data": data }))
            .await?;
        let mut lower_args = shape;
        lower_args.insert(
            "data".to_string(),
            rebuilt.get("data").cloned().unwrap_or_else(|| json!({})),
        );
        let lower_args = Value::Object(lower_args);
        self.log("create", &lower_args);
        let created = self.lower()?.create(lower_args).await?;
        Ok(self.assemble(created))
    }

    async fn do_update(&self, filter: Value, data: Value, shape: Map<String, Value>) -> Result<Value> {
        let rebuilt = self
            .reshape(
                NestedWriteAction::Update,
                json!({ "where": filter, "data": data }),
            )
            .await?;
        let mut lower_args = shape;
        for key in ["where", "data"] {
            if let Some(v) = rebuilt.get(key) {
                lower_args.insert(key.to_string(), v.clone());
            }
        }
        let lower_args = Value::Object(lower_args);
        self.log("update", &lower_args);
        let updated = self.lower()?.update(lower_args).await?;
        Ok(self.assemble(updated))
    }

    /// Items of a batch create, checked for hierarchy constraints.
    ///
    /// # Returns
    ///
    /// The items, or `None` when the batch can go to the storage as is.
    fn batch_items(&self, args: &Value, action: &str) -> Result<Option<Vec<Value>>> {
        self.reject_abstract(action)?;
        let data = require(args, action, "data")?;
        if self.meta.base_model(&self.model).is_none() {
            return Ok(None);
        }
        if args
            .get("skipDuplicates")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return Err(QueryError::SkipDuplicates {
                model: self.model.clone(),
            }
            .into());
        }
        Ok(Some(enumerate(data).into_iter().cloned().collect()))
    }

    /// Create items one by one in a transaction.
    async fn create_each(&self, items: Vec<Value>, shape: Map<String, Value>) -> Result<Vec<Value>> {
        debug!(model = %self.model, count = items.len(), "decomposing batch create");
        let created = self
            .transact(move |h| async move {
                let mut created = Vec::with_capacity(items.len());
                for item in items {
                    created.push(h.do_create(item, shape.clone()).await?);
                }
                Ok(Value::Array(created))
            })
            .await?;
        match created {
            Value::Array(items) => Ok(items),
            _ => Ok(Vec::new()),
        }
    }

    /// Delete rows of hierarchy models that cascade from the entity being
    /// deleted, so their base rows go with them.
    ///
    /// Every level shares the entity's id, so dependents of levels the entity
    /// does not have match nothing.
    async fn delete_dependents(&self, entity: &Value) -> Result<()> {
        let mut targets = vec![self.model.clone()];
        targets.extend(self.meta.base_chain(&self.model).iter().map(|m| m.name.clone()));
        targets.extend(self.descendants());

        let mut cascades = Vec::new();
        for dependent in self.meta.models() {
            if self.meta.base_model(&dependent.name).is_none() {
                continue;
            }
            for relation in dependent.fields.values() {
                let cascading = relation.is_relation_owner
                    && relation.inherited_from.is_none()
                    && !is_aux_relation(&relation.name)
                    && relation.on_delete_action == Some(ReferentialAction::Cascade)
                    && targets.contains(&relation.field_type);
                let Some(mapping) = relation.foreign_key_mapping.as_ref().filter(|_| cascading) else {
                    continue;
                };
                let mut filter = Map::new();
                for (referenced, fk) in mapping {
                    filter.insert(fk.clone(), entity.get(referenced).cloned().unwrap_or(Value::Null));
                }
                if filter.values().any(Value::is_null) {
                    continue;
                }
                cascades.push((dependent.name.clone(), Value::Object(filter)));
            }
        }

        for (model, filter) in cascades {
            debug!(model = %self.model, dependent = %model, "deleting cascaded hierarchy rows");
            self.for_model(&model)
                .delete_many(json!({ "where": filter }))
                .await?;
        }
        Ok(())
    }

    /// Every direct and indirect sub-type of this model.
    fn descendants(&self) -> Vec<String> {
        let mut found = Vec::new();
        let mut pending = vec![self.model.clone()];
        while let Some(model) = pending.pop() {
            for sub in self.meta.sub_models(&model) {
                if !found.contains(sub) {
                    found.push(sub.clone());
                    pending.push(sub.clone());
                }
            }
        }
        found
    }

    /// Delete one entity and every base row sharing its id.
    async fn delete_entity(&self, ids: Value) -> Result<()> {
        self.lower()?.delete(json!({ "where": ids.clone() })).await?;
        for base in self.meta.base_chain(&self.model) {
            self.inner
                .model(&base.name)?
                .delete(json!({ "where": ids.clone(), "select": id_selection(&self.meta, &base.name) }))
                .await?;
        }
        Ok(())
    }

    /// Whether a batch delete must go entity by entity.
    fn delete_needs_decomposition(&self) -> bool {
        if self.meta.base_model(&self.model).is_some() {
            return true;
        }
        let mut targets = vec![self.model.clone()];
        targets.extend(self.descendants());
        self.meta.models().any(|m| {
            self.meta.base_model(&m.name).is_some()
                && m.fields.values().any(|f| {
                    f.is_relation_owner
                        && f.inherited_from.is_none()
                        && !is_aux_relation(&f.name)
                        && f.on_delete_action == Some(ReferentialAction::Cascade)
                        && targets.contains(&f.field_type)
                })
        })
    }
}

#[async_trait]
impl CrudOperations for DelegateHandler {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn find_unique(&self, args: Value) -> Result<Option<Value>> {
        let filter = require(&args, "findUnique", "where")?.clone();
        let mut flat = filter.as_object().cloned().unwrap_or_default();
        flatten_generated_unique_field(&self.meta, &self.model, &mut flat);
        let across_levels = touches_inherited(&self.meta, &self.model, &Value::Object(flat.clone()));

        let mut lower_args = args.as_object().cloned().unwrap_or_default();
        if across_levels {
            lower_args.insert("where".to_string(), Value::Object(flat));
        }
        let lower_args = inject_read_hierarchy(&self.meta, &self.model, &Value::Object(lower_args));
        self.log("findUnique", &lower_args);
        let lower = self.lower()?;
        let found = if across_levels {
            lower.find_first(lower_args).await?
        } else {
            lower.find_unique(lower_args).await?
        };
        Ok(found.map(|entity| self.assemble(entity)))
    }

    async fn find_first(&self, args: Value) -> Result<Option<Value>> {
        let lower_args = inject_read_hierarchy(&self.meta, &self.model, &args);
        self.log("findFirst", &lower_args);
        let found = self.lower()?.find_first(lower_args).await?;
        Ok(found.map(|entity| self.assemble(entity)))
    }

    async fn find_many(&self, args: Value) -> Result<Vec<Value>> {
        let lower_args = inject_read_hierarchy(&self.meta, &self.model, &args);
        self.log("findMany", &lower_args);
        let rows = self.lower()?.find_many(lower_args).await?;
        Ok(rows.into_iter().map(|row| self.assemble(row)).collect())
    }

    async fn create(&self, args: Value) -> Result<Value> {
        let data = require(&args, "create", "data")?.clone();
        self.reject_abstract("create")?;
        self.do_create(data, self.shape(&args)).await
    }

    async fn create_many(&self, args: Value) -> Result<BatchPayload> {
        let Some(items) = self.batch_items(&args, "createMany")? else {
            self.log("createMany", &args);
            return self.lower()?.create_many(args).await;
        };
        let shape = match id_selection(&self.meta, &self.model) {
            Value::Object(select) => {
                let mut shape = Map::new();
                shape.insert("select".to_string(), Value::Object(select));
                shape
            }
            _ => Map::new(),
        };
        let created = self.create_each(items, shape).await?;
        Ok(BatchPayload::new(created.len() as u64))
    }

    async fn create_many_and_return(&self, args: Value) -> Result<Vec<Value>> {
        let shape = self.shape(&args);
        let Some(items) = self.batch_items(&args, "createManyAndReturn")? else {
            let mut lower_args = args.as_object().cloned().unwrap_or_default();
            lower_args.extend(shape);
            let lower_args = Value::Object(lower_args);
            self.log("createManyAndReturn", &lower_args);
            let rows = self.lower()?.create_many_and_return(lower_args).await?;
            return Ok(rows.into_iter().map(|row| self.assemble(row)).collect());
        };
        self.create_each(items, shape).await
    }

    async fn update(&self, args: Value) -> Result<Value> {
        let data = require(&args, "update", "data")?.clone();
        reject_discriminator_writes(&self.meta, &self.model, &data)?;
        let filter = self.unique_filter(&args, "update").await?;
        self.do_update(filter, data, self.shape(&args)).await
    }

    async fn update_many(&self, args: Value) -> Result<BatchPayload> {
        let data = require(&args, "updateMany", "data")?.clone();
        reject_discriminator_writes(&self.meta, &self.model, &data)?;
        let filter = args.get("where").cloned().unwrap_or_else(|| json!({}));

        let single_statement = !touches_inherited(&self.meta, &self.model, &filter)
            && !touches_inherited(&self.meta, &self.model, &data)
            && !bases_track_updates(&self.meta, &self.model);
        if single_statement {
            self.log("updateMany", &args);
            return self.lower()?.update_many(args).await;
        }

        debug!(model = %self.model, "decomposing updateMany across hierarchy levels");
        let count = self
            .transact(move |h| async move {
                let ids = h.matching_ids(&filter).await?;
                let select = id_selection(&h.meta, &h.model);
                for id in &ids {
                    let mut shape = Map::new();
                    shape.insert("select".to_string(), select.clone());
                    h.do_update(id.clone(), data.clone(), shape).await?;
                }
                Ok(json!(ids.len()))
            })
            .await?;
        Ok(BatchPayload::new(count.as_u64().unwrap_or(0)))
    }

    async fn upsert(&self, args: Value) -> Result<Value> {
        let create = require(&args, "upsert", "create")?.clone();
        let update = require(&args, "upsert", "update")?.clone();
        require(&args, "upsert", "where")?;
        self.reject_abstract("upsert")?;
        reject_discriminator_writes(&self.meta, &self.model, &update)?;
        let shape = self.shape(&args);

        let filter = match self.unique_filter(&args, "upsert").await {
            Ok(filter) => filter,
            Err(Error::NotFound(_)) => return self.do_create(create, shape).await,
            Err(err) => return Err(err),
        };
        if filter != args["where"] {
            // Existence was settled while resolving the filter
            return self.do_update(filter, update, shape).await;
        }

        let rebuilt = self
            .reshape(
                NestedWriteAction::Upsert,
                json!({ "where": filter, "create": create, "update": update }),
            )
            .await?;
        let mut lower_args = shape;
        if let Value::Object(map) = rebuilt {
            lower_args.extend(map);
        }
        let lower_args = Value::Object(lower_args);
        self.log("upsert", &lower_args);
        let upserted = self.lower()?.upsert(lower_args).await?;
        Ok(self.assemble(upserted))
    }

    async fn delete(&self, args: Value) -> Result<Value> {
        let filter = self.unique_filter(&args, "delete").await?;
        let shape = self.shape(&args);
        let caller_shaped = args.get("select").is_some() || args.get("include").is_some();

        let deleted = self
            .transact(move |h| async move {
                let full_args = inject_read_hierarchy(&h.meta, &h.model, &json!({ "where": filter }));
                let full = match h.lower()?.find_first(full_args).await? {
                    Some(entity) => h.assemble(entity),
                    None => return Err(h.not_found()),
                };
                let result = if caller_shaped {
                    let mut read_args = shape;
                    read_args.insert("where".to_string(), filter.clone());
                    h.lower()?
                        .find_first(Value::Object(read_args))
                        .await?
                        .map(|entity| h.assemble(entity))
                        .unwrap_or(Value::Null)
                } else {
                    full.clone()
                };

                h.delete_dependents(&full).await?;
                let ids = h.ids_of(&full)?;
                h.log("delete", &ids);
                h.delete_entity(ids).await?;
                Ok(result)
            })
            .await?;
        Ok(deleted)
    }

    async fn delete_many(&self, args: Value) -> Result<BatchPayload> {
        let filter = args.get("where").cloned().unwrap_or_else(|| json!({}));
        if !self.delete_needs_decomposition() {
            let lower_args = json!({ "where": inject_where_hierarchy(&self.meta, &self.model, &filter) });
            self.log("deleteMany", &lower_args);
            return self.lower()?.delete_many(lower_args).await;
        }

        debug!(model = %self.model, "decomposing deleteMany across hierarchy levels");
        let count = self
            .transact(move |h| async move {
                let ids = h.matching_ids(&filter).await?;
                for id in &ids {
                    h.delete(json!({ "where": id, "select": id_selection(&h.meta, &h.model) }))
                        .await?;
                }
                Ok(json!(ids.len()))
            })
            .await?;
        Ok(BatchPayload::new(count.as_u64().unwrap_or(0)))
    }

    async fn aggregate(&self, args: Value) -> Result<Value> {
        check_aggregation(&self.meta, &self.model, &args)?;
        let lower_args = self.relocate_filter(args);
        self.log("aggregate", &lower_args);
        self.lower()?.aggregate(lower_args).await
    }

    async fn group_by(&self, args: Value) -> Result<Vec<Value>> {
        check_aggregation(&self.meta, &self.model, &args)?;
        let lower_args = self.relocate_filter(args);
        self.log("groupBy", &lower_args);
        self.lower()?.group_by(lower_args).await
    }

    async fn count(&self, args: Value) -> Result<Value> {
        check_aggregation(&self.meta, &self.model, &args)?;
        let lower_args = self.relocate_filter(args);
        self.log("count", &lower_args);
        self.lower()?.count(lower_args).await
    }
}

impl DelegateHandler {
    fn relocate_filter(&self, args: Value) -> Value {
        let Value::Object(mut map) = args else {
            return args;
        };
        if let Some(filter) = map.remove("where") {
            map.insert(
                "where".to_string(),
                inject_where_hierarchy(&self.meta, &self.model, &filter),
            );
        }
        Value::Object(map)
    }
}

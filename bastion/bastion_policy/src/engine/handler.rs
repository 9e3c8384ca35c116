//! Policy-enforcing model handle.
//!
//! A [`PolicyHandler`] implements the CRUD contract for one model on top of
//! the client below it. Reads get guards injected and their results
//! post-processed. Writes are checked before they run, executed in a
//! transaction together with their post-write checks, and read back under
//! the read guard.

use super::checks::{run_post_write_checks, PostWriteCheck};
use super::client::PolicyOptions;
use super::nested::{check_selection, overlay_ids, NestedCreateDetector, PolicyCallbacks};
use crate::model::{PolicyDef, ValidationMode};
use crate::query::{check_existence, check_policy_for_unique, post_process, read_back, PolicyUtil};
use async_trait::async_trait;
use bastion_core::error::{PolicyError, QueryError};
use bastion_core::query::{and, as_where, entity_ids, enumerate, flatten_generated_unique_field, id_selection};
use bastion_core::utils::logging::log_query;
use bastion_core::{
    run_in_transaction, BatchPayload, CrudOperations, DbClient, Error, ModelMeta, NestedWriteAction,
    NestedWriteVisitor, PolicyOperation, QueryContext, Result,
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

/// Policy-enforcing handle of one model.
#[derive(Clone)]
pub struct PolicyHandler {
    inner: Arc<dyn DbClient>,
    meta: Arc<ModelMeta>,
    policy: Arc<PolicyDef>,
    context: Arc<QueryContext>,
    options: Arc<PolicyOptions>,
    model: String,
}

impl PolicyHandler {
    pub(crate) fn new(
        inner: Arc<dyn DbClient>,
        meta: Arc<ModelMeta>,
        policy: Arc<PolicyDef>,
        context: Arc<QueryContext>,
        options: Arc<PolicyOptions>,
        model: &str,
    ) -> Self {
        Self {
            inner,
            meta,
            policy,
            context,
            options,
            model: model.to_string(),
        }
    }

    /// Client of the layer below.
    pub(crate) fn db(&self) -> &Arc<dyn DbClient> {
        &self.inner
    }

    pub(crate) fn util(&self) -> PolicyUtil<'_> {
        PolicyUtil::new(&self.meta, &self.policy, &self.context)
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

    fn log(&self, action: &str, args: &Value) {
        if self.options.log_queries {
            log_query("policy", action, &self.model, args);
        }
    }

    /// Run `f` with a handler scoped to a transaction.
    async fn transact<F, Fut>(&self, f: F) -> Result<Value>
    where
        F: FnOnce(PolicyHandler) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let this = self.clone();
        run_in_transaction(&self.inner, &self.options.transaction, move |tx| f(this.scoped(tx))).await
    }

    /// Arguments with a required unique `where` in flat form.
    fn with_unique_where(&self, args: Value, action: &str) -> Result<Value> {
        let missing = || QueryError::MissingArgument {
            action: action.to_string(),
            argument: "where".to_string(),
        };
        let Value::Object(mut map) = args else {
            return Err(missing().into());
        };
        let Some(Value::Object(mut filter)) = map.remove("where") else {
            return Err(missing().into());
        };
        flatten_generated_unique_field(&self.meta, &self.model, &mut filter);
        map.insert("where".to_string(), Value::Object(filter));
        Ok(Value::Object(map))
    }

    fn ids_of(&self, entity: &Value) -> Result<Value> {
        entity_ids(&self.meta, &self.model, entity)
            .map(Value::Object)
            .ok_or_else(|| Error::Unknown {
                message: format!("{} entity was returned without its ids", self.model),
                source: None,
            })
    }

    /// Whether a filter reaches into relations.
    fn traverses_relations(&self, model: &str, filter: &Value) -> bool {
        match filter {
            Value::Object(map) => map.iter().any(|(key, value)| match key.as_str() {
                "AND" | "OR" | "NOT" => enumerate(value)
                    .into_iter()
                    .any(|v| self.traverses_relations(model, v)),
                _ => self
                    .meta
                    .field(model, key)
                    .map(|f| f.is_data_model)
                    .unwrap_or(false),
            }),
            _ => false,
        }
    }

    fn writes_relations(&self, data: &Value) -> bool {
        data.as_object()
            .map(|map| {
                map.keys().any(|k| {
                    self.meta
                        .field(&self.model, k)
                        .map(|f| f.is_data_model)
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    }

    async fn read_first(&self, action: &str, args: Value) -> Result<Option<Value>> {
        let util = self.util();
        let Some(guarded) = util.inject_for_read(&self.model, &args) else {
            debug!(model = %self.model, "model is not readable");
            return Ok(None);
        };
        self.log(action, &guarded);
        match self.lower()?.find_first(guarded).await? {
            Some(entity) => Ok(Some(
                post_process(&self.inner, util, &self.model, entity, &args).await?,
            )),
            None => Ok(None),
        }
    }

    /// Read back a written entity, failing if the read guard hides it.
    async fn read_result(&self, args: &Value, ids: Value, operation: PolicyOperation) -> Result<Value> {
        match read_back(&self.inner, self.util(), &self.model, args, ids).await? {
            Some(entity) => Ok(entity),
            None => Err(PolicyError::ResultNotReadable {
                model: self.model.clone(),
                operation,
            }
            .into()),
        }
    }

    fn guard_aggregate(&self, args: &Value) -> Value {
        let util = self.util();
        let guard = util.guard(&self.model, PolicyOperation::Read, None);
        let mut out = args.as_object().cloned().unwrap_or_default();
        let filter = out.get("where").cloned().unwrap_or_else(|| json!({}));
        out.insert(
            "where".to_string(),
            as_where(and([util.guard_where(&self.model, &filter), guard])),
        );
        Value::Object(out)
    }

    /// Create an entity with its nested writes checked.
    ///
    /// # Returns
    ///
    /// The ids of the created entity.
    async fn do_create(&self, args: Value) -> Result<Value> {
        let mut visitor = NestedWriteVisitor::new(&self.meta, PolicyCallbacks::new(self.clone()));
        let rebuilt = visitor
            .visit(&self.model, NestedWriteAction::Create, &args)
            .await?;
        let callbacks = visitor.into_callbacks();

        let lower_args = json!({
            "data": rebuilt.get("data").cloned().unwrap_or_else(|| json!({})),
            "select": id_selection(&self.meta, &self.model),
        });
        self.log("create", &lower_args);
        let created = self.lower()?.create(lower_args).await?;
        callbacks.finish().await?;
        self.ids_of(&created)
    }

    /// Update an entity with its nested writes checked.
    ///
    /// # Returns
    ///
    /// The ids of the updated entity.
    async fn do_update(&self, filter: Value, data: Value) -> Result<Value> {
        let payload = json!({ "where": filter, "data": data });
        let mut visitor = NestedWriteVisitor::new(&self.meta, PolicyCallbacks::new(self.clone()));
        let rebuilt = visitor
            .visit(&self.model, NestedWriteAction::Update, &payload)
            .await?;
        let callbacks = visitor.into_callbacks();

        let lower_args = json!({
            "where": rebuilt.get("where").cloned().unwrap_or(filter),
            "data": rebuilt.get("data").cloned().unwrap_or_else(|| json!({})),
            "select": id_selection(&self.meta, &self.model),
        });
        self.log("update", &lower_args);
        let updated = self.lower()?.update(lower_args).await?;
        callbacks.finish().await?;
        self.ids_of(&updated)
    }

    /// Decide a batch of creates from the payloads alone.
    ///
    /// # Returns
    ///
    /// `true` if every item is allowed by its input check, `false` if some
    /// item needs the stored row to decide.
    fn batch_input_check(&self, items: &[Value]) -> Result<bool> {
        let util = self.util();
        let mut decided = true;
        for item in items {
            match util.input_check(&self.model, item) {
                Some(true) => {}
                Some(false) => {
                    return Err(Error::denied(self.model.as_str(), PolicyOperation::Create, None))
                }
                None => decided = false,
            }
        }
        Ok(decided)
    }

    /// Whether an item collides with an existing row on a unique key.
    async fn is_duplicate(&self, item: &Value) -> Result<bool> {
        let Some(data) = item.as_object() else {
            return Ok(false);
        };
        let mut keys: Vec<Vec<String>> = vec![self
            .meta
            .id_fields(&self.model)
            .into_iter()
            .map(|f| f.name.clone())
            .collect()];
        keys.extend(
            self.meta
                .unique_constraints(&self.model)
                .map(|c| c.fields.clone()),
        );

        let lower = self.lower()?;
        'keys: for fields in keys {
            if fields.is_empty() {
                continue;
            }
            let mut filter = Map::new();
            for field in &fields {
                match data.get(field) {
                    Some(v) if !v.is_null() && !v.is_object() => {
                        filter.insert(field.clone(), v.clone());
                    }
                    _ => continue 'keys,
                }
            }
            let found = lower
                .find_first(json!({ "where": filter, "select": id_selection(&self.meta, &self.model) }))
                .await?;
            if found.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Create items one by one inside the current transaction.
    ///
    /// # Returns
    ///
    /// The ids of the created entities.
    async fn create_each(&self, items: Vec<Value>, skip_duplicates: bool) -> Result<Vec<Value>> {
        let mut created = Vec::with_capacity(items.len());
        for item in items {
            if skip_duplicates && self.is_duplicate(&item).await? {
                debug!(model = %self.model, "skipping duplicate item");
                continue;
            }
            created.push(self.do_create(json!({ "data": item })).await?);
        }
        Ok(created)
    }

    fn batch_items(&self, args: &Value, action: &str) -> Result<(Vec<Value>, bool)> {
        let util = self.util();
        util.try_reject(&self.model, PolicyOperation::Create)?;
        let items: Vec<Value> = enumerate(require(args, action, "data")?)
            .into_iter()
            .cloned()
            .collect();
        for item in &items {
            util.validate(&self.model, item, ValidationMode::Create)?;
        }
        let skip_duplicates = args
            .get("skipDuplicates")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok((items, skip_duplicates))
    }
}

#[async_trait]
impl CrudOperations for PolicyHandler {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn find_unique(&self, args: Value) -> Result<Option<Value>> {
        let args = self.with_unique_where(args, "findUnique")?;
        self.read_first("findUnique", args).await
    }

    async fn find_first(&self, args: Value) -> Result<Option<Value>> {
        self.read_first("findFirst", args).await
    }

    async fn find_many(&self, args: Value) -> Result<Vec<Value>> {
        let util = self.util();
        let Some(guarded) = util.inject_for_read(&self.model, &args) else {
            debug!(model = %self.model, "model is not readable");
            return Ok(Vec::new());
        };
        self.log("findMany", &guarded);
        let rows = self.lower()?.find_many(guarded).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(post_process(&self.inner, util, &self.model, row, &args).await?);
        }
        Ok(out)
    }

    async fn create(&self, args: Value) -> Result<Value> {
        let data = require(&args, "create", "data")?.clone();
        let util = self.util();
        util.try_reject(&self.model, PolicyOperation::Create)?;

        let mut detector = NestedWriteVisitor::new(&self.meta, NestedCreateDetector::default());
        detector.visit(&self.model, NestedWriteAction::Create, &args).await?;
        if !detector.callbacks().found() {
            match util.input_check(&self.model, &data) {
                Some(true) => {
                    util.validate(&self.model, &data, ValidationMode::Create)?;
                    let lower_args = json!({
                        "data": data,
                        "select": id_selection(&self.meta, &self.model),
                    });
                    self.log("create", &lower_args);
                    let created = self.lower()?.create(lower_args).await?;
                    let ids = self.ids_of(&created)?;
                    return self.read_result(&args, ids, PolicyOperation::Create).await;
                }
                Some(false) => {
                    return Err(Error::denied(self.model.as_str(), PolicyOperation::Create, None))
                }
                None => {}
            }
        }

        let payload = args.clone();
        let ids = self
            .transact(move |h| async move { h.do_create(payload).await })
            .await?;
        self.read_result(&args, ids, PolicyOperation::Create).await
    }

    async fn create_many(&self, args: Value) -> Result<BatchPayload> {
        let (items, skip_duplicates) = self.batch_items(&args, "createMany")?;
        if self.batch_input_check(&items)? {
            self.log("createMany", &args);
            return self.lower()?.create_many(args).await;
        }
        debug!(model = %self.model, count = items.len(), "creating items one by one");
        let count = self
            .transact(move |h| async move {
                let created = h.create_each(items, skip_duplicates).await?;
                Ok(json!(created.len()))
            })
            .await?;
        Ok(BatchPayload::new(count.as_u64().unwrap_or(0)))
    }

    async fn create_many_and_return(&self, args: Value) -> Result<Vec<Value>> {
        let (items, skip_duplicates) = self.batch_items(&args, "createManyAndReturn")?;
        let created: Vec<Value> = if self.batch_input_check(&items)? {
            let lower_args = json!({
                "data": items,
                "skipDuplicates": skip_duplicates,
                "select": id_selection(&self.meta, &self.model),
            });
            self.log("createManyAndReturn", &lower_args);
            let rows = self.lower()?.create_many_and_return(lower_args).await?;
            rows.iter().map(|row| self.ids_of(row)).collect::<Result<_>>()?
        } else {
            let ids = self
                .transact(move |h| async move {
                    Ok(Value::Array(h.create_each(items, skip_duplicates).await?))
                })
                .await?;
            match ids {
                Value::Array(ids) => ids,
                _ => Vec::new(),
            }
        };

        let util = self.util();
        let mut out = Vec::with_capacity(created.len());
        for ids in created {
            match read_back(&self.inner, util, &self.model, &args, ids).await? {
                Some(entity) => out.push(entity),
                None => debug!(model = %self.model, "created entity is not readable"),
            }
        }
        Ok(out)
    }

    async fn update(&self, args: Value) -> Result<Value> {
        let args = self.with_unique_where(args, "update")?;
        let data = require(&args, "update", "data")?.clone();
        let filter = args["where"].clone();
        self.util().try_reject(&self.model, PolicyOperation::Update)?;

        let ids = self
            .transact(move |h| async move { h.do_update(filter, data).await })
            .await?;
        self.read_result(&args, ids, PolicyOperation::Update).await
    }

    async fn update_many(&self, args: Value) -> Result<BatchPayload> {
        let util = self.util();
        util.try_reject(&self.model, PolicyOperation::Update)?;
        let data = require(&args, "updateMany", "data")?.clone();
        util.validate(&self.model, &data, ValidationMode::Update)?;
        let filter = args.get("where").cloned().unwrap_or_else(|| json!({}));
        let guard = util.guard(&self.model, PolicyOperation::Update, None);
        let flat = !self.traverses_relations(&self.model, &filter)
            && !self.traverses_relations(&self.model, &guard)
            && !self.writes_relations(&data);
        let guarded = as_where(and([filter, guard]));

        if flat && !util.needs_post_update_check(&self.model) {
            let lower_args = json!({ "where": guarded, "data": data });
            self.log("updateMany", &lower_args);
            return self.lower()?.update_many(lower_args).await;
        }

        debug!(model = %self.model, "updating matching entities one by one");
        let count = self
            .transact(move |h| async move {
                let util = h.util();
                let lower = h.lower()?;
                let pre_select = util.pre_value_select(&h.model);
                let rows = lower
                    .find_many(json!({
                        "where": guarded,
                        "select": check_selection(&h.meta, &h.model, pre_select),
                    }))
                    .await?;

                let mut checks = Vec::new();
                let mut count = 0u64;
                for row in rows {
                    let Some(ids) = entity_ids(&h.meta, &h.model, &row) else {
                        continue;
                    };
                    lower
                        .update(json!({ "where": ids, "data": data, "select": id_selection(&h.meta, &h.model) }))
                        .await?;
                    count += 1;
                    if util.needs_post_update_check(&h.model) {
                        checks.push(PostWriteCheck {
                            model: h.model.clone(),
                            filter: Value::Object(overlay_ids(&h.meta, &h.model, ids, Some(&data))),
                            pre_value: pre_select.map(|_| row),
                        });
                    }
                }
                run_post_write_checks(h.db(), util, &checks).await?;
                Ok(json!(count))
            })
            .await?;
        Ok(BatchPayload::new(count.as_u64().unwrap_or(0)))
    }

    async fn upsert(&self, args: Value) -> Result<Value> {
        let args = self.with_unique_where(args, "upsert")?;
        let create = require(&args, "upsert", "create")?.clone();
        let update = require(&args, "upsert", "update")?.clone();
        let filter = args["where"].clone();

        let outcome = self
            .transact(move |h| async move {
                let existing = check_existence(h.db(), h.util(), &h.model, &filter, false).await?;
                if existing.is_some() {
                    h.util().try_reject(&h.model, PolicyOperation::Update)?;
                    let ids = h.do_update(filter, update).await?;
                    Ok(json!({ "created": false, "ids": ids }))
                } else {
                    h.util().try_reject(&h.model, PolicyOperation::Create)?;
                    let ids = h.do_create(json!({ "data": create })).await?;
                    Ok(json!({ "created": true, "ids": ids }))
                }
            })
            .await?;
        // The read-back error names the branch that ran
        let operation = match outcome.get("created") {
            Some(Value::Bool(true)) => PolicyOperation::Create,
            _ => PolicyOperation::Update,
        };
        let ids = outcome.get("ids").cloned().unwrap_or(Value::Null);
        self.read_result(&args, ids, operation).await
    }

    async fn delete(&self, args: Value) -> Result<Value> {
        let args = self.with_unique_where(args, "delete")?;
        let filter = args["where"].clone();
        self.util().try_reject(&self.model, PolicyOperation::Delete)?;

        let original = args.clone();
        let deleted = self
            .transact(move |h| async move {
                let util = h.util();
                let ids = match check_existence(h.db(), util, &h.model, &filter, true).await? {
                    Some(ids) => Value::Object(ids),
                    None => return Ok(Value::Null),
                };
                check_policy_for_unique(h.db(), util, &h.model, &ids, PolicyOperation::Delete, None)
                    .await?;
                // Read first: the caller still gets the entity it deleted
                let readable = read_back(h.db(), util, &h.model, &original, ids.clone()).await?;
                let lower_args = json!({ "where": ids });
                h.log("delete", &lower_args);
                h.lower()?.delete(lower_args).await?;
                Ok(readable.unwrap_or(Value::Null))
            })
            .await?;

        if deleted.is_null() {
            return Err(PolicyError::ResultNotReadable {
                model: self.model.clone(),
                operation: PolicyOperation::Delete,
            }
            .into());
        }
        Ok(deleted)
    }

    async fn delete_many(&self, args: Value) -> Result<BatchPayload> {
        let util = self.util();
        util.try_reject(&self.model, PolicyOperation::Delete)?;
        let filter = args.get("where").cloned().unwrap_or_else(|| json!({}));
        let guard = util.guard(&self.model, PolicyOperation::Delete, None);
        let flat = !self.traverses_relations(&self.model, &filter)
            && !self.traverses_relations(&self.model, &guard);
        let guarded = as_where(and([filter, guard]));

        if flat {
            let lower_args = json!({ "where": guarded });
            self.log("deleteMany", &lower_args);
            return self.lower()?.delete_many(lower_args).await;
        }

        debug!(model = %self.model, "deleting matching entities one by one");
        let count = self
            .transact(move |h| async move {
                let lower = h.lower()?;
                let rows = lower
                    .find_many(json!({ "where": guarded, "select": id_selection(&h.meta, &h.model) }))
                    .await?;
                let mut count = 0;
                for row in rows {
                    if let Some(ids) = entity_ids(&h.meta, &h.model, &row) {
                        // Earlier cascades may already have removed the row
                        count += lower.delete_many(json!({ "where": ids })).await?.count;
                    }
                }
                Ok(json!(count))
            })
            .await?;
        Ok(BatchPayload::new(count.as_u64().unwrap_or(0)))
    }

    async fn aggregate(&self, args: Value) -> Result<Value> {
        let args = self.guard_aggregate(&args);
        self.log("aggregate", &args);
        self.lower()?.aggregate(args).await
    }

    async fn group_by(&self, args: Value) -> Result<Vec<Value>> {
        let args = self.guard_aggregate(&args);
        self.log("groupBy", &args);
        self.lower()?.group_by(args).await
    }

    async fn count(&self, args: Value) -> Result<Value> {
        let args = self.guard_aggregate(&args);
        self.log("count", &args);
        self.lower()?.count(args).await
    }
}

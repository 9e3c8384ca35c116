//! Nested-write traversal.
//!
//! A single top-level mutation can carry a tree of nested operations
//! (`create` inside `update` inside `upsert`, and so on). The visitor walks
//! that tree, calls the callback matching each operation kind and rebuilds
//! the payload from the callbacks' decisions. The caller's payload is never
//! mutated; sibling branches get their own copy of the nesting path.
//!
//! Each callback returns a [`VisitAction`]:
//!
//! - `Continue` keeps the item and descends into it
//! - `Skip` keeps the item without descending
//! - `Replace` substitutes the item, then descends into the substitute
//! - `Remove` drops the item from the rebuilt payload
//! - `Convert` moves the item under another operation key, then descends
//!   into it without invoking a callback for the new operation

use crate::error::{QueryError, Result};
use crate::meta::{FieldInfo, ModelMeta};
use crate::query::enumerate;
use crate::types::NestedWriteAction;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde_json::{Map, Value};

/// One step of the path from the top-level model to the current operation.
#[derive(Debug, Clone, PartialEq)]
pub struct NestingPathItem {
    /// Relation field leading to this step, `None` at the top level
    pub field: Option<FieldInfo>,
    pub model: String,
    /// Filter identifying the rows touched at this step
    pub where_clause: Value,
    /// Whether `where_clause` is a unique filter
    pub unique: bool,
}

/// What a callback sees about the operation being visited.
pub struct VisitorContext<'a> {
    /// Path from the top level to the current operation, inclusive
    pub nesting_path: &'a [NestingPathItem],
    /// Relation field leading to the current model
    pub field: Option<&'a FieldInfo>,
    /// Relation payload containing the current operation
    pub parent: Option<&'a Value>,
}

impl<'a> VisitorContext<'a> {
    /// Whether the current operation is the top-level one.
    pub fn is_top_level(&self) -> bool {
        self.nesting_path.len() <= 1
    }

    /// Whether the current operation runs through a to-many relation.
    pub fn is_array(&self) -> bool {
        self.field.map(|f| f.is_array).unwrap_or(false)
    }
}

/// Decision returned by a visitor callback.
#[derive(Debug, Clone, PartialEq)]
pub enum VisitAction {
    Continue,
    Skip,
    Replace(Value),
    Remove,
    Convert {
        action: NestedWriteAction,
        item: Value,
    },
}

/// Per-operation callbacks invoked by [`NestedWriteVisitor`].
///
/// Every callback defaults to `Continue`.
#[async_trait]
pub trait NestedWriteCallbacks: Send {
    async fn create(&mut self, _model: &str, _data: &Value, _ctx: &VisitorContext<'_>) -> Result<VisitAction> {
        Ok(VisitAction::Continue)
    }

    async fn create_many(&mut self, _model: &str, _args: &Value, _ctx: &VisitorContext<'_>) -> Result<VisitAction> {
        Ok(VisitAction::Continue)
    }

    async fn connect(&mut self, _model: &str, _filter: &Value, _ctx: &VisitorContext<'_>) -> Result<VisitAction> {
        Ok(VisitAction::Continue)
    }

    async fn connect_or_create(&mut self, _model: &str, _args: &Value, _ctx: &VisitorContext<'_>) -> Result<VisitAction> {
        Ok(VisitAction::Continue)
    }

    async fn disconnect(&mut self, _model: &str, _filter: &Value, _ctx: &VisitorContext<'_>) -> Result<VisitAction> {
        Ok(VisitAction::Continue)
    }

    async fn set(&mut self, _model: &str, _filters: &Value, _ctx: &VisitorContext<'_>) -> Result<VisitAction> {
        Ok(VisitAction::Continue)
    }

    async fn update(&mut self, _model: &str, _args: &Value, _ctx: &VisitorContext<'_>) -> Result<VisitAction> {
        Ok(VisitAction::Continue)
    }

    async fn update_many(&mut self, _model: &str, _args: &Value, _ctx: &VisitorContext<'_>) -> Result<VisitAction> {
        Ok(VisitAction::Continue)
    }

    async fn upsert(&mut self, _model: &str, _args: &Value, _ctx: &VisitorContext<'_>) -> Result<VisitAction> {
        Ok(VisitAction::Continue)
    }

    async fn delete(&mut self, _model: &str, _filter: &Value, _ctx: &VisitorContext<'_>) -> Result<VisitAction> {
        Ok(VisitAction::Continue)
    }

    async fn delete_many(&mut self, _model: &str, _filter: &Value, _ctx: &VisitorContext<'_>) -> Result<VisitAction> {
        Ok(VisitAction::Continue)
    }

    /// Called for every scalar field written by a create or update payload.
    async fn field(
        &mut self,
        _field: &FieldInfo,
        _action: NestedWriteAction,
        _value: &Value,
        _ctx: &VisitorContext<'_>,
    ) -> Result<()> {
        Ok(())
    }
}

async fn dispatch<C: NestedWriteCallbacks>(
    callbacks: &mut C,
    action: NestedWriteAction,
    model: &str,
    item: &Value,
    ctx: &VisitorContext<'_>,
) -> Result<VisitAction> {
    match action {
        NestedWriteAction::Create => callbacks.create(model, item, ctx).await,
        NestedWriteAction::CreateMany => callbacks.create_many(model, item, ctx).await,
        NestedWriteAction::Connect => callbacks.connect(model, item, ctx).await,
        NestedWriteAction::ConnectOrCreate => callbacks.connect_or_create(model, item, ctx).await,
        NestedWriteAction::Disconnect => callbacks.disconnect(model, item, ctx).await,
        NestedWriteAction::Set => callbacks.set(model, item, ctx).await,
        NestedWriteAction::Update => callbacks.update(model, item, ctx).await,
        NestedWriteAction::UpdateMany => callbacks.update_many(model, item, ctx).await,
        NestedWriteAction::Upsert => callbacks.upsert(model, item, ctx).await,
        NestedWriteAction::Delete => callbacks.delete(model, item, ctx).await,
        NestedWriteAction::DeleteMany => callbacks.delete_many(model, item, ctx).await,
    }
}

/// Filter identifying the rows an item touches, and whether it is unique.
fn item_filter(action: NestedWriteAction, item: &Value) -> (Value, bool) {
    let filter = match action {
        NestedWriteAction::Create | NestedWriteAction::CreateMany => Value::Object(Map::new()),
        NestedWriteAction::Connect | NestedWriteAction::Set => item.clone(),
        NestedWriteAction::Disconnect | NestedWriteAction::Delete | NestedWriteAction::DeleteMany => {
            item.clone()
        }
        NestedWriteAction::ConnectOrCreate
        | NestedWriteAction::Update
        | NestedWriteAction::UpdateMany
        | NestedWriteAction::Upsert => item.get("where").cloned().unwrap_or(Value::Null),
    };
    let unique = match action {
        NestedWriteAction::Connect | NestedWriteAction::Set => true,
        NestedWriteAction::Disconnect => item.is_object(),
        _ => false,
    };
    let filter = if filter.is_object() {
        filter
    } else {
        Value::Object(Map::new())
    };
    (filter, unique)
}

/// Whether a to-one nested update uses the `{ where, data }` form.
pub fn is_wrapped_update(item: &Value) -> bool {
    match item.as_object() {
        Some(map) => {
            map.get("data").map(Value::is_object).unwrap_or(false)
                && map.keys().all(|k| k == "data" || k == "where")
        }
        None => false,
    }
}

/// Walks nested mutation payloads, driving a set of callbacks.
pub struct NestedWriteVisitor<'m, C> {
    meta: &'m ModelMeta,
    callbacks: C,
}

impl<'m, C: NestedWriteCallbacks> NestedWriteVisitor<'m, C> {
    pub fn new(meta: &'m ModelMeta, callbacks: C) -> Self {
        Self { meta, callbacks }
    }

    pub fn callbacks(&self) -> &C {
        &self.callbacks
    }

    pub fn into_callbacks(self) -> C {
        self.callbacks
    }

    /// Visit the arguments of a top-level operation.
    ///
    /// # Arguments
    ///
    /// * `model` - Model the operation runs on.
    /// * `action` - The top-level operation.
    /// * `args` - The operation's argument object.
    ///
    /// # Returns
    ///
    /// The arguments rebuilt from the callbacks' decisions.
    pub async fn visit(&mut self, model: &str, action: NestedWriteAction, args: &Value) -> Result<Value> {
        let slot = match action {
            NestedWriteAction::Create => Some("data"),
            NestedWriteAction::Delete | NestedWriteAction::DeleteMany => Some("where"),
            _ => None,
        };

        let item = match slot {
            Some(key) => match args.get(key) {
                Some(v) => v.clone(),
                None => {
                    return Err(QueryError::MissingArgument {
                        action: action.as_str().to_string(),
                        argument: key.to_string(),
                    }
                    .into())
                }
            },
            None => args.clone(),
        };

        let results = self.visit_item(model, action, item.clone(), None, None, &[]).await?;
        let rebuilt = results.into_iter().next().map(|(_, v)| v).unwrap_or(item);

        match slot {
            Some(key) => {
                let mut out = args.as_object().cloned().unwrap_or_default();
                out.insert(key.to_string(), rebuilt);
                Ok(Value::Object(out))
            }
            None => Ok(rebuilt),
        }
    }

    /// Visit every item of one operation entry.
    fn visit_entry<'b>(
        &'b mut self,
        model: &'b str,
        action: NestedWriteAction,
        entry: Value,
        field: Option<&'b FieldInfo>,
        parent: Option<&'b Value>,
        path: &'b [NestingPathItem],
    ) -> BoxFuture<'b, Result<Vec<(NestedWriteAction, Value)>>> {
        async move {
            let items: Vec<Value> = match action {
                NestedWriteAction::Set | NestedWriteAction::CreateMany => vec![entry],
                _ => enumerate(&entry).into_iter().cloned().collect(),
            };
            let mut results = Vec::with_capacity(items.len());
            for item in items {
                let mut visited = self.visit_item(model, action, item, field, parent, path).await?;
                results.append(&mut visited);
            }
            Ok(results)
        }
        .boxed()
    }

    fn visit_item<'b>(
        &'b mut self,
        model: &'b str,
        action: NestedWriteAction,
        item: Value,
        field: Option<&'b FieldInfo>,
        parent: Option<&'b Value>,
        path: &'b [NestingPathItem],
    ) -> BoxFuture<'b, Result<Vec<(NestedWriteAction, Value)>>> {
        async move {
            let (where_clause, unique) = item_filter(action, &item);
            let mut item_path = path.to_vec();
            item_path.push(NestingPathItem {
                field: field.cloned(),
                model: model.to_string(),
                where_clause,
                unique,
            });

            let decision = {
                let ctx = VisitorContext {
                    nesting_path: &item_path,
                    field,
                    parent,
                };
                dispatch(&mut self.callbacks, action, model, &item, &ctx).await?
            };

            let result = match decision {
                VisitAction::Continue => {
                    Some((action, self.descend(model, action, item, field, &item_path).await?))
                }
                VisitAction::Replace(replacement) => Some((
                    action,
                    self.descend(model, action, replacement, field, &item_path).await?,
                )),
                VisitAction::Skip => Some((action, item)),
                VisitAction::Remove => None,
                VisitAction::Convert { action: converted, item } => Some((
                    converted,
                    self.descend(model, converted, item, field, &item_path).await?,
                )),
            };
            Ok(result.into_iter().collect())
        }
        .boxed()
    }

    /// Rebuild the sub-payloads of an item that can carry nested writes.
    fn descend<'b>(
        &'b mut self,
        model: &'b str,
        action: NestedWriteAction,
        item: Value,
        field: Option<&'b FieldInfo>,
        path: &'b [NestingPathItem],
    ) -> BoxFuture<'b, Result<Value>> {
        async move {
            let slots: &[&str] = match action {
                NestedWriteAction::Create => {
                    return self.visit_payload(model, action, item, field, path).await;
                }
                NestedWriteAction::Update if !is_wrapped_update(&item) => {
                    return self.visit_payload(model, action, item, field, path).await;
                }
                NestedWriteAction::Update
                | NestedWriteAction::UpdateMany
                | NestedWriteAction::CreateMany => &["data"],
                NestedWriteAction::ConnectOrCreate => &["create"],
                NestedWriteAction::Upsert => &["create", "update"],
                _ => return Ok(item),
            };

            let Value::Object(mut map) = item else {
                return Ok(item);
            };
            for slot in slots {
                if let Some(payload) = map.remove(*slot) {
                    let rebuilt = self.visit_payload(model, action, payload, field, path).await?;
                    map.insert(slot.to_string(), rebuilt);
                }
            }
            Ok(Value::Object(map))
        }
        .boxed()
    }

    /// Visit the fields of a create/update payload.
    fn visit_payload<'b>(
        &'b mut self,
        model: &'b str,
        action: NestedWriteAction,
        payload: Value,
        field: Option<&'b FieldInfo>,
        path: &'b [NestingPathItem],
    ) -> BoxFuture<'b, Result<Value>> {
        async move {
            let map = match payload {
                Value::Array(items) => {
                    let mut rebuilt = Vec::with_capacity(items.len());
                    for item in items {
                        rebuilt.push(self.visit_payload(model, action, item, field, path).await?);
                    }
                    return Ok(Value::Array(rebuilt));
                }
                Value::Object(map) => map,
                other => return Ok(other),
            };

            let meta = self.meta;
            let mut out = Map::new();
            for (key, value) in map {
                let Some(field_info) = meta.field(model, &key) else {
                    out.insert(key, value);
                    continue;
                };

                if !field_info.is_data_model {
                    let ctx = VisitorContext {
                        nesting_path: path,
                        field,
                        parent: None,
                    };
                    self.callbacks.field(field_info, action, &value, &ctx).await?;
                    out.insert(key, value);
                    continue;
                }

                let Some(relation) = value.as_object() else {
                    out.insert(key, value);
                    continue;
                };

                let mut rebuilt = RelationPayload::default();
                for (sub_key, sub_value) in relation {
                    let Some(sub_action) = NestedWriteAction::from_key(sub_key) else {
                        rebuilt.keep(sub_key, sub_value.clone());
                        continue;
                    };
                    rebuilt.note_shape(sub_action, sub_value);
                    let visited = self
                        .visit_entry(
                            &field_info.field_type,
                            sub_action,
                            sub_value.clone(),
                            Some(field_info),
                            Some(&value),
                            path,
                        )
                        .await?;
                    for (result_action, result_item) in visited {
                        rebuilt.push(result_action, result_item);
                    }
                }
                if let Some(rebuilt) = rebuilt.finish() {
                    out.insert(key, rebuilt);
                }
            }
            Ok(Value::Object(out))
        }
        .boxed()
    }
}

/// Accumulates the rebuilt operations of one relation payload.
#[derive(Default)]
struct RelationPayload {
    entries: Vec<(String, Vec<Value>, bool)>,
    passthrough: Map<String, Value>,
}

impl RelationPayload {
    fn keep(&mut self, key: &str, value: Value) {
        self.passthrough.insert(key.to_string(), value);
    }

    fn slot(&mut self, action: NestedWriteAction) -> &mut (String, Vec<Value>, bool) {
        let key = action.as_str();
        let index = match self.entries.iter().position(|(k, _, _)| k == key) {
            Some(i) => i,
            None => {
                self.entries.push((key.to_string(), Vec::new(), false));
                self.entries.len() - 1
            }
        };
        &mut self.entries[index]
    }

    fn note_shape(&mut self, action: NestedWriteAction, original: &Value) {
        if original.is_array() && !matches!(action, NestedWriteAction::Set | NestedWriteAction::CreateMany) {
            self.slot(action).2 = true;
        }
    }

    fn push(&mut self, action: NestedWriteAction, item: Value) {
        self.slot(action).1.push(item);
    }

    fn finish(self) -> Option<Value> {
        let mut out = self.passthrough;
        for (key, mut items, was_array) in self.entries {
            if items.is_empty() {
                continue;
            }
            let value = if key == NestedWriteAction::CreateMany.as_str() {
                merge_create_many(items)
            } else if key == NestedWriteAction::Set.as_str() || (items.len() == 1 && !was_array) {
                items.remove(0)
            } else {
                Value::Array(items)
            };
            out.insert(key, value);
        }
        if out.is_empty() {
            None
        } else {
            Some(Value::Object(out))
        }
    }
}

fn merge_create_many(mut items: Vec<Value>) -> Value {
    if items.len() == 1 {
        return items.remove(0);
    }
    let mut data = Vec::new();
    let mut merged = Map::new();
    for item in items {
        if let Value::Object(mut map) = item {
            match map.remove("data") {
                Some(Value::Array(rows)) => data.extend(rows),
                Some(row) => data.push(row),
                None => {}
            }
            merged.extend(map);
        }
    }
    merged.insert("data".to_string(), Value::Array(data));
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::ModelInfo;
    use serde_json::json;

    fn meta() -> ModelMeta {
        ModelMeta::new(vec![
            ModelInfo::new("User")
                .field(FieldInfo::scalar("id", "Int").id())
                .field(FieldInfo::scalar("name", "String"))
                .field(FieldInfo::relation("posts", "Post").array().back_link("author"))
                .field(FieldInfo::relation("profile", "Profile").optional().back_link("user")),
            ModelInfo::new("Profile")
                .field(FieldInfo::scalar("id", "Int").id())
                .field(FieldInfo::scalar("bio", "String"))
                .field(
                    FieldInfo::relation("user", "User")
                        .owner(&[("id", "userId")])
                        .back_link("profile"),
                )
                .field(FieldInfo::foreign_key("userId", "Int", "user")),
            ModelInfo::new("Post")
                .field(FieldInfo::scalar("id", "Int").id())
                .field(FieldInfo::scalar("title", "String"))
                .field(
                    FieldInfo::relation("author", "User")
                        .owner(&[("id", "authorId")])
                        .back_link("posts"),
                )
                .field(FieldInfo::foreign_key("authorId", "Int", "author"))
                .field(FieldInfo::relation("comments", "Comment").array().back_link("post")),
            ModelInfo::new("Comment")
                .field(FieldInfo::scalar("id", "Int").id())
                .field(FieldInfo::scalar("body", "String"))
                .field(
                    FieldInfo::relation("post", "Post")
                        .owner(&[("id", "postId")])
                        .back_link("comments"),
                )
                .field(FieldInfo::foreign_key("postId", "Int", "post")),
        ])
        .unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        visits: Vec<(String, NestedWriteAction, usize, bool)>,
        fields: Vec<String>,
    }

    impl Recorder {
        fn record(&mut self, model: &str, action: NestedWriteAction, ctx: &VisitorContext<'_>) {
            let unique = ctx.nesting_path.last().map(|p| p.unique).unwrap_or(false);
            self.visits
                .push((model.to_string(), action, ctx.nesting_path.len(), unique));
        }
    }

    #[async_trait]
    impl NestedWriteCallbacks for Recorder {
        async fn create(&mut self, model: &str, data: &Value, ctx: &VisitorContext<'_>) -> Result<VisitAction> {
            self.record(model, NestedWriteAction::Create, ctx);
            let mut tagged = data.as_object().cloned().unwrap_or_default();
            tagged.insert("tag".to_string(), json!("t1"));
            Ok(VisitAction::Replace(Value::Object(tagged)))
        }

        async fn connect(&mut self, model: &str, _filter: &Value, ctx: &VisitorContext<'_>) -> Result<VisitAction> {
            self.record(model, NestedWriteAction::Connect, ctx);
            Ok(VisitAction::Continue)
        }

        async fn connect_or_create(&mut self, model: &str, args: &Value, ctx: &VisitorContext<'_>) -> Result<VisitAction> {
            self.record(model, NestedWriteAction::ConnectOrCreate, ctx);
            Ok(VisitAction::Convert {
                action: NestedWriteAction::Connect,
                item: args["where"].clone(),
            })
        }

        async fn disconnect(&mut self, model: &str, _filter: &Value, ctx: &VisitorContext<'_>) -> Result<VisitAction> {
            self.record(model, NestedWriteAction::Disconnect, ctx);
            Ok(VisitAction::Continue)
        }

        async fn update(&mut self, model: &str, _args: &Value, ctx: &VisitorContext<'_>) -> Result<VisitAction> {
            self.record(model, NestedWriteAction::Update, ctx);
            Ok(VisitAction::Continue)
        }

        async fn delete(&mut self, model: &str, _filter: &Value, ctx: &VisitorContext<'_>) -> Result<VisitAction> {
            self.record(model, NestedWriteAction::Delete, ctx);
            Ok(VisitAction::Remove)
        }

        async fn field(
            &mut self,
            field: &FieldInfo,
            _action: NestedWriteAction,
            _value: &Value,
            _ctx: &VisitorContext<'_>,
        ) -> Result<()> {
            self.fields.push(field.name.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_create_visits_nested_creates() {
        let meta = meta();
        let mut visitor = NestedWriteVisitor::new(&meta, Recorder::default());
        let args = json!({
            "data": {
                "name": "alice",
                "posts": {
                    "create": [
                        { "title": "a", "comments": { "create": { "body": "c" } } },
                        { "title": "b" }
                    ]
                }
            },
            "select": { "id": true }
        });

        let rebuilt = visitor.visit("User", NestedWriteAction::Create, &args).await.unwrap();
        let recorder = visitor.into_callbacks();

        assert_eq!(rebuilt["select"], json!({"id": true}));
        assert_eq!(rebuilt["data"]["tag"], json!("t1"));
        assert_eq!(rebuilt["data"]["posts"]["create"][0]["tag"], json!("t1"));
        assert_eq!(rebuilt["data"]["posts"]["create"][1]["tag"], json!("t1"));
        assert_eq!(
            rebuilt["data"]["posts"]["create"][0]["comments"]["create"]["tag"],
            json!("t1")
        );
        // caller's payload is untouched
        assert!(args["data"].get("tag").is_none());

        let models: Vec<(&str, usize)> = recorder
            .visits
            .iter()
            .map(|(m, _, depth, _)| (m.as_str(), *depth))
            .collect();
        assert_eq!(models, vec![("User", 1), ("Post", 2), ("Comment", 3), ("Post", 2)]);
        assert!(recorder.fields.contains(&"name".to_string()));
        assert!(recorder.fields.contains(&"body".to_string()));
    }

    #[tokio::test]
    async fn test_update_remove_and_convert() {
        let meta = meta();
        let mut visitor = NestedWriteVisitor::new(&meta, Recorder::default());
        let args = json!({
            "where": { "id": 1 },
            "data": {
                "posts": {
                    "delete": { "id": 5 },
                    "connectOrCreate": { "where": { "id": 6 }, "create": { "title": "x" } },
                    "update": { "where": { "id": 7 }, "data": { "title": "y" } }
                },
                "profile": { "disconnect": true }
            }
        });

        let rebuilt = visitor.visit("User", NestedWriteAction::Update, &args).await.unwrap();
        let posts = &rebuilt["data"]["posts"];
        assert!(posts.get("delete").is_none());
        assert!(posts.get("connectOrCreate").is_none());
        assert_eq!(posts["connect"], json!({"id": 6}));
        assert_eq!(posts["update"]["data"], json!({"title": "y"}));
        assert_eq!(rebuilt["data"]["profile"], json!({"disconnect": true}));

        let recorder = visitor.into_callbacks();
        let disconnect = recorder
            .visits
            .iter()
            .find(|(_, a, _, _)| *a == NestedWriteAction::Disconnect)
            .unwrap();
        // a to-one disconnect carries no unique filter
        assert!(!disconnect.3);
        let nested_update = recorder
            .visits
            .iter()
            .find(|(m, a, _, _)| m == "Post" && *a == NestedWriteAction::Update)
            .unwrap();
        assert_eq!(nested_update.2, 2);
    }

    #[tokio::test]
    async fn test_upsert_visits_both_branches() {
        let meta = meta();
        let mut visitor = NestedWriteVisitor::new(&meta, Recorder::default());
        let args = json!({
            "where": { "id": 1 },
            "data": {
                "posts": {
                    "upsert": {
                        "where": { "id": 2 },
                        "create": { "title": "new", "comments": { "create": { "body": "c" } } },
                        "update": { "comments": { "connect": { "id": 9 } } }
                    }
                }
            }
        });
        visitor.visit("User", NestedWriteAction::Update, &args).await.unwrap();
        let recorder = visitor.into_callbacks();
        let actions: Vec<(String, NestedWriteAction)> = recorder
            .visits
            .iter()
            .map(|(m, a, _, _)| (m.clone(), *a))
            .collect();
        assert!(actions.contains(&("Comment".to_string(), NestedWriteAction::Create)));
        assert!(actions.contains(&("Comment".to_string(), NestedWriteAction::Connect)));
    }

    #[tokio::test]
    async fn test_nesting_path_filters() {
        struct PathCheck {
            paths: Vec<Vec<NestingPathItem>>,
        }

        #[async_trait]
        impl NestedWriteCallbacks for PathCheck {
            async fn update(&mut self, _model: &str, _args: &Value, ctx: &VisitorContext<'_>) -> Result<VisitAction> {
                self.paths.push(ctx.nesting_path.to_vec());
                Ok(VisitAction::Continue)
            }
        }

        let meta = meta();
        let mut visitor = NestedWriteVisitor::new(&meta, PathCheck { paths: Vec::new() });
        let args = json!({
            "where": { "id": 1 },
            "data": {
                "posts": {
                    "update": {
                        "where": { "id": 2 },
                        "data": { "comments": { "update": { "where": { "id": 3 }, "data": { "body": "b" } } } }
                    }
                }
            }
        });
        visitor.visit("User", NestedWriteAction::Update, &args).await.unwrap();
        let paths = visitor.into_callbacks().paths;
        assert_eq!(paths.len(), 3);
        let deepest = &paths[2];
        assert_eq!(
            deepest.iter().map(|p| p.where_clause.clone()).collect::<Vec<_>>(),
            vec![json!({"id": 1}), json!({"id": 2}), json!({"id": 3})]
        );
        assert_eq!(deepest[2].field.as_ref().unwrap().name, "comments");
        assert!(deepest[0].field.is_none());
    }

    #[tokio::test]
    async fn test_missing_data_is_usage_error() {
        let meta = meta();
        let mut visitor = NestedWriteVisitor::new(&meta, Recorder::default());
        let err = visitor
            .visit("User", NestedWriteAction::Create, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::Query(QueryError::MissingArgument { .. })));
    }
}

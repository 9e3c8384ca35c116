//! The in-memory database client.

use crate::filter::View;
use crate::state::{Row, State};
use crate::write::Engine;
use async_trait::async_trait;
use bastion_core::error::{QueryError, Result, StorageError};
use bastion_core::query::enumerate;
use bastion_core::traits::{CrudOperations, DbClient, TransactionCallback};
use bastion_core::types::{BatchPayload, TransactionOptions};
use bastion_core::ModelMeta;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// An in-memory database over a resolved schema.
///
/// Every statement is atomic: it runs against a copy of the state that
/// replaces the live state only if the statement succeeds. Transactions
/// work the same way over a snapshot, and hold the write gate until they
/// commit or roll back.
#[derive(Clone)]
pub struct MemoryDatabase {
    meta: Arc<ModelMeta>,
    state: Arc<RwLock<State>>,
    gate: Arc<Mutex<()>>,
    in_transaction: bool,
}

impl MemoryDatabase {
    /// Create an empty database.
    pub fn new(meta: Arc<ModelMeta>) -> Self {
        Self {
            meta,
            state: Arc::new(RwLock::new(State::default())),
            gate: Arc::new(Mutex::new(())),
            in_transaction: false,
        }
    }

    pub fn meta(&self) -> &Arc<ModelMeta> {
        &self.meta
    }

    /// Number of rows physically stored for a model.
    pub async fn row_count(&self, model: &str) -> usize {
        self.state.read().await.row_count(model)
    }

    /// Raw stored rows of a model, bypassing projection.
    pub async fn rows(&self, model: &str) -> Vec<Row> {
        self.state.read().await.rows(model)
    }

    async fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&View<'_>) -> Result<T> + Send,
    {
        let state = self.state.read().await;
        let view = View::new(&self.meta, &state);
        f(&view)
    }

    async fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Engine<'_>) -> Result<T> + Send,
        T: Send,
    {
        let _gate = if self.in_transaction {
            None
        } else {
            Some(self.gate.lock().await)
        };
        let mut state = self.state.write().await;
        let mut draft = state.clone();
        let out = {
            let mut engine = Engine::new(&self.meta, &mut draft);
            f(&mut engine)?
        };
        *state = draft;
        Ok(out)
    }
}

#[async_trait]
impl DbClient for MemoryDatabase {
    fn model(&self, name: &str) -> Result<Arc<dyn CrudOperations>> {
        self.meta.require_model(name)?;
        Ok(Arc::new(MemoryModel {
            db: self.clone(),
            model: name.to_string(),
        }))
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn transaction(
        &self,
        options: TransactionOptions,
        callback: TransactionCallback,
    ) -> Result<Value> {
        let gate = match options.max_wait_ms {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), self.gate.lock())
                .await
                .map_err(|_| {
                    StorageError::Transaction(format!(
                        "could not start a transaction within {} ms",
                        ms
                    ))
                })?,
            None => self.gate.lock().await,
        };

        let snapshot = self.state.read().await.clone();
        let tx = MemoryDatabase {
            meta: self.meta.clone(),
            state: Arc::new(RwLock::new(snapshot)),
            gate: Arc::new(Mutex::new(())),
            in_transaction: true,
        };
        debug!(isolation = ?options.isolation_level, "transaction started");

        let work = callback(Arc::new(tx.clone()));
        let outcome = match options.timeout_ms {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), work)
                .await
                .map_err(|_| {
                    StorageError::Transaction(format!("transaction timed out after {} ms", ms))
                })?,
            None => work.await,
        };

        match outcome {
            Ok(value) => {
                let committed = tx.state.read().await.clone();
                *self.state.write().await = committed;
                drop(gate);
                debug!("transaction committed");
                Ok(value)
            }
            Err(e) => {
                drop(gate);
                debug!(error = %e, "transaction rolled back");
                Err(e)
            }
        }
    }
}

/// Per-model handle of a [`MemoryDatabase`].
pub struct MemoryModel {
    db: MemoryDatabase,
    model: String,
}

fn required<'v>(args: &'v Value, action: &str, argument: &str) -> Result<&'v Value> {
    match args.get(argument) {
        Some(v) if !v.is_null() => Ok(v),
        _ => Err(QueryError::MissingArgument {
            action: action.to_string(),
            argument: argument.to_string(),
        }
        .into()),
    }
}

fn projection_args(args: &Value) -> Value {
    let mut out = Map::new();
    for key in ["select", "include"] {
        if let Some(v) = args.get(key).filter(|v| !v.is_null()) {
            out.insert(key.to_string(), v.clone());
        }
    }
    Value::Object(out)
}

fn record_not_found(model: &str, action: &str) -> bastion_core::Error {
    StorageError::RecordNotFound {
        model: model.to_string(),
        detail: format!("no record found for '{}'", action),
    }
    .into()
}

fn create_many_data(args: &Value, action: &str) -> Result<(Vec<Value>, bool)> {
    let data = required(args, action, "data")?;
    let skip_duplicates = args
        .get("skipDuplicates")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    Ok((enumerate(data).into_iter().cloned().collect(), skip_duplicates))
}

fn create_all(
    engine: &mut Engine<'_>,
    model: &str,
    items: &[Value],
    skip_duplicates: bool,
) -> Result<Vec<u64>> {
    let mut keys = Vec::with_capacity(items.len());
    for item in items {
        match engine.create(model, item, &Map::new()) {
            Ok(key) => keys.push(key),
            Err(bastion_core::Error::Storage(StorageError::UniqueConstraint { .. }))
                if skip_duplicates => {}
            Err(e) => return Err(e),
        }
    }
    Ok(keys)
}

#[async_trait]
impl CrudOperations for MemoryModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn find_unique(&self, args: Value) -> Result<Option<Value>> {
        required(&args, "findUnique", "where")?;
        self.find_first(args).await
    }

    async fn find_first(&self, args: Value) -> Result<Option<Value>> {
        let model = &self.model;
        self.db
            .read(|view| match view.select_rows(model, &args)?.first() {
                Some(key) => Ok(Some(view.project(model, *key, &args)?)),
                None => Ok(None),
            })
            .await
    }

    async fn find_many(&self, args: Value) -> Result<Vec<Value>> {
        let model = &self.model;
        self.db
            .read(|view| {
                view.select_rows(model, &args)?
                    .into_iter()
                    .map(|key| view.project(model, key, &args))
                    .collect()
            })
            .await
    }

    async fn create(&self, args: Value) -> Result<Value> {
        let model = &self.model;
        let data = required(&args, "create", "data")?.clone();
        let shape = projection_args(&args);
        debug!(model = %model, "create");
        self.db
            .write(|engine| {
                let key = engine.create(model, &data, &Map::new())?;
                engine.view().project(model, key, &shape)
            })
            .await
    }

    async fn create_many(&self, args: Value) -> Result<BatchPayload> {
        let model = &self.model;
        let (items, skip_duplicates) = create_many_data(&args, "createMany")?;
        self.db
            .write(|engine| {
                let keys = create_all(engine, model, &items, skip_duplicates)?;
                Ok(BatchPayload::new(keys.len() as u64))
            })
            .await
    }

    async fn create_many_and_return(&self, args: Value) -> Result<Vec<Value>> {
        let model = &self.model;
        let (items, skip_duplicates) = create_many_data(&args, "createManyAndReturn")?;
        let shape = projection_args(&args);
        self.db
            .write(|engine| {
                let keys = create_all(engine, model, &items, skip_duplicates)?;
                let view = engine.view();
                keys.into_iter()
                    .map(|key| view.project(model, key, &shape))
                    .collect()
            })
            .await
    }

    async fn update(&self, args: Value) -> Result<Value> {
        let model = &self.model;
        let filter = required(&args, "update", "where")?.clone();
        let data = required(&args, "update", "data")?.clone();
        let shape = projection_args(&args);
        debug!(model = %model, "update");
        self.db
            .write(|engine| {
                let key = engine
                    .view()
                    .find(model, &filter)?
                    .into_iter()
                    .next()
                    .ok_or_else(|| record_not_found(model, "update"))?;
                engine.update_row(model, key, &data)?;
                engine.view().project(model, key, &shape)
            })
            .await
    }

    async fn update_many(&self, args: Value) -> Result<BatchPayload> {
        let model = &self.model;
        let filter = args.get("where").cloned().unwrap_or(Value::Null);
        let data = required(&args, "updateMany", "data")?.clone();
        self.db
            .write(|engine| {
                let keys = engine.view().find(model, &filter)?;
                for key in &keys {
                    engine.update_row(model, *key, &data)?;
                }
                Ok(BatchPayload::new(keys.len() as u64))
            })
            .await
    }

    async fn upsert(&self, args: Value) -> Result<Value> {
        let model = &self.model;
        let filter = required(&args, "upsert", "where")?.clone();
        let create = required(&args, "upsert", "create")?.clone();
        let update = required(&args, "upsert", "update")?.clone();
        let shape = projection_args(&args);
        self.db
            .write(|engine| {
                let existing = engine.view().find(model, &filter)?.into_iter().next();
                let key = match existing {
                    Some(key) => {
                        engine.update_row(model, key, &update)?;
                        key
                    }
                    None => engine.create(model, &create, &Map::new())?,
                };
                engine.view().project(model, key, &shape)
            })
            .await
    }

    async fn delete(&self, args: Value) -> Result<Value> {
        let model = &self.model;
        let filter = required(&args, "delete", "where")?.clone();
        let shape = projection_args(&args);
        debug!(model = %model, "delete");
        self.db
            .write(|engine| {
                let key = engine
                    .view()
                    .find(model, &filter)?
                    .into_iter()
                    .next()
                    .ok_or_else(|| record_not_found(model, "delete"))?;
                let deleted = engine.view().project(model, key, &shape)?;
                engine.delete_row(model, key)?;
                Ok(deleted)
            })
            .await
    }

    async fn delete_many(&self, args: Value) -> Result<BatchPayload> {
        let model = &self.model;
        let filter = args.get("where").cloned().unwrap_or(Value::Null);
        self.db
            .write(|engine| {
                let keys = engine.view().find(model, &filter)?;
                let mut count = 0;
                for key in keys {
                    // Cascades from earlier deletions may already have removed the row
                    if engine.view().row(model, key).is_none() {
                        continue;
                    }
                    engine.delete_row(model, key)?;
                    count += 1;
                }
                Ok(BatchPayload::new(count))
            })
            .await
    }

    async fn aggregate(&self, args: Value) -> Result<Value> {
        let model = &self.model;
        self.db.read(|view| view.aggregate(model, &args)).await
    }

    async fn group_by(&self, args: Value) -> Result<Vec<Value>> {
        let model = &self.model;
        self.db.read(|view| view.group_by(model, &args)).await
    }

    async fn count(&self, args: Value) -> Result<Value> {
        let model = &self.model;
        self.db.read(|view| view.count(model, &args)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_core::meta::{FieldInfo, ModelInfo};
    use serde_json::json;

    fn database() -> MemoryDatabase {
        let meta = ModelMeta::new(vec![ModelInfo::new("Tag")
            .field(FieldInfo::scalar("id", "Int").id().autoincrement())
            .field(FieldInfo::scalar("label", "String").unique())])
        .unwrap();
        MemoryDatabase::new(Arc::new(meta))
    }

    #[tokio::test]
    async fn test_failed_statement_leaves_no_trace() {
        let db = database();
        let tags = db.model("Tag").unwrap();
        tags.create(json!({"data": {"label": "a"}})).await.unwrap();

        let result = tags
            .create_many(json!({"data": [{"label": "b"}, {"label": "a"}]}))
            .await;
        assert!(result.is_err());
        assert_eq!(db.row_count("Tag").await, 1);

        let batch = tags
            .create_many(json!({"data": [{"label": "b"}, {"label": "a"}], "skipDuplicates": true}))
            .await
            .unwrap();
        assert_eq!(batch.count, 1);
    }

    #[tokio::test]
    async fn test_unknown_model_is_rejected() {
        let db = database();
        assert!(db.model("Nope").is_err());
    }
}

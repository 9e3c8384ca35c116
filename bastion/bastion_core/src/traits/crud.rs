//! The per-model CRUD contract.
//!
//! Arguments and results are query-language values: argument objects carry
//! `where`, `data`, `select`, `include`, `orderBy`, `cursor`, `take` and
//! `skip` the way the storage collaborator expects them, and results are
//! shaped by `select`/`include`.

use crate::error::{Error, Result};
use crate::types::BatchPayload;
use async_trait::async_trait;
use serde_json::Value;

/// CRUD operations on a single model.
///
/// Each enhancement implements this trait by wrapping the handle of the
/// layer below it, so calling code uses the same operations on an enhanced
/// handle as on a raw one.
#[async_trait]
pub trait CrudOperations: Send + Sync {
    /// Name of the model this handle operates on.
    fn model_name(&self) -> &str;

    /// Find a single entity by a unique filter.
    async fn find_unique(&self, args: Value) -> Result<Option<Value>>;

    /// Find a single entity by a unique filter, failing if absent.
    async fn find_unique_or_throw(&self, args: Value) -> Result<Value> {
        self.find_unique(args)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no {} matches the unique filter", self.model_name())))
    }

    /// Find the first entity matching a filter.
    async fn find_first(&self, args: Value) -> Result<Option<Value>>;

    /// Find the first entity matching a filter, failing if absent.
    async fn find_first_or_throw(&self, args: Value) -> Result<Value> {
        self.find_first(args)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no {} matches the filter", self.model_name())))
    }

    /// Find all entities matching a filter.
    async fn find_many(&self, args: Value) -> Result<Vec<Value>>;

    /// Create an entity, possibly with nested writes.
    async fn create(&self, args: Value) -> Result<Value>;

    /// Create several entities without nested writes.
    async fn create_many(&self, args: Value) -> Result<BatchPayload>;

    /// Create several entities and return them.
    async fn create_many_and_return(&self, args: Value) -> Result<Vec<Value>>;

    /// Update an entity identified by a unique filter.
    async fn update(&self, args: Value) -> Result<Value>;

    /// Update all entities matching a filter.
    async fn update_many(&self, args: Value) -> Result<BatchPayload>;

    /// Update an entity, or create it if absent.
    async fn upsert(&self, args: Value) -> Result<Value>;

    /// Delete an entity identified by a unique filter, returning it.
    async fn delete(&self, args: Value) -> Result<Value>;

    /// Delete all entities matching a filter.
    async fn delete_many(&self, args: Value) -> Result<BatchPayload>;

    /// Compute aggregates.
    async fn aggregate(&self, args: Value) -> Result<Value>;

    /// Group entities and compute per-group aggregates.
    async fn group_by(&self, args: Value) -> Result<Vec<Value>>;

    /// Count entities, or non-null values per field when `select` is given.
    async fn count(&self, args: Value) -> Result<Value>;
}

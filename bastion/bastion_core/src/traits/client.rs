//! Client factory and transaction primitive.

use super::crud::CrudOperations;
use crate::error::Result;
use crate::types::TransactionOptions;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Work run inside a transaction, given the transaction-scoped client.
pub type TransactionCallback =
    Box<dyn FnOnce(Arc<dyn DbClient>) -> BoxFuture<'static, Result<Value>> + Send>;

/// A data-access client: a factory of per-model handles with transactions.
#[async_trait]
pub trait DbClient: Send + Sync {
    /// Get the handle for a model.
    fn model(&self, name: &str) -> Result<Arc<dyn CrudOperations>>;

    /// Whether this client is already scoped to a transaction.
    fn in_transaction(&self) -> bool;

    /// Run `callback` in a transaction.
    ///
    /// The transaction commits if the callback returns `Ok` and rolls back
    /// otherwise. Options are forwarded to the storage collaborator.
    async fn transaction(
        &self,
        options: TransactionOptions,
        callback: TransactionCallback,
    ) -> Result<Value>;
}

/// Run `f` in a transaction on `db`, reusing the current one if `db` is
/// already transaction scoped.
pub async fn run_in_transaction<F, Fut>(
    db: &Arc<dyn DbClient>,
    options: &TransactionOptions,
    f: F,
) -> Result<Value>
where
    F: FnOnce(Arc<dyn DbClient>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    if db.in_transaction() {
        return f(db.clone()).await;
    }
    db.transaction(options.clone(), Box::new(move |tx| f(tx).boxed()))
        .await
}

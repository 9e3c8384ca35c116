//! Hierarchy-aware client.

use crate::handler::DelegateHandler;
use async_trait::async_trait;
use bastion_core::{CrudOperations, DbClient, ModelMeta, Result, TransactionCallback, TransactionOptions};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

/// Options of the delegate layer.
#[derive(Debug, Clone, Default)]
pub struct DelegateOptions {
    /// Options of the transactions the layer opens
    pub transaction: TransactionOptions,
    /// Whether to log the rewritten queries
    pub log_queries: bool,
}

/// A client presenting every model of a table-per-type hierarchy as one
/// flat model.
///
/// Models outside any hierarchy pass through with only their relation
/// payloads rewritten.
#[derive(Clone)]
pub struct DelegateClient {
    inner: Arc<dyn DbClient>,
    meta: Arc<ModelMeta>,
    options: Arc<DelegateOptions>,
    handlers: Arc<DashMap<String, Arc<DelegateHandler>>>,
}

impl DelegateClient {
    pub fn new(inner: Arc<dyn DbClient>, meta: Arc<ModelMeta>, options: DelegateOptions) -> Self {
        Self {
            inner,
            meta,
            options: Arc::new(options),
            handlers: Arc::new(DashMap::new()),
        }
    }

    fn scoped(&self, tx: Arc<dyn DbClient>) -> Self {
        Self {
            inner: tx,
            meta: self.meta.clone(),
            options: self.options.clone(),
            handlers: Arc::new(DashMap::new()),
        }
    }
}

#[async_trait]
impl DbClient for DelegateClient {
    fn model(&self, name: &str) -> Result<Arc<dyn CrudOperations>> {
        if let Some(handler) = self.handlers.get(name) {
            return Ok(handler.value().clone());
        }
        self.meta.require_model(name)?;
        let handler = self
            .handlers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(DelegateHandler::new(
                    self.inner.clone(),
                    self.meta.clone(),
                    self.options.clone(),
                    name,
                ))
            })
            .value()
            .clone();
        Ok(handler)
    }

    fn in_transaction(&self) -> bool {
        self.inner.in_transaction()
    }

    async fn transaction(
        &self,
        options: TransactionOptions,
        callback: TransactionCallback,
    ) -> Result<Value> {
        if self.in_transaction() {
            return callback(Arc::new(self.clone())).await;
        }
        let this = self.clone();
        self.inner
            .transaction(
                options,
                Box::new(move |tx| callback(Arc::new(this.scoped(tx)))),
            )
            .await
    }
}

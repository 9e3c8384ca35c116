//! Composition of the enhancement layers.

use crate::system::config::{EnhancementConfig, EnhancementKind};
use async_trait::async_trait;
use bastion_core::{
    CrudOperations, DbClient, Error, ModelMeta, PolicyOperation, QueryContext, Result,
    TransactionCallback, TransactionOptions,
};
use bastion_delegate::{DelegateClient, DelegateOptions};
use bastion_policy::{PolicyClient, PolicyDef, PolicyOptions};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// A client with the configured enhancements applied.
///
/// Calls go to the outermost layer; every layer exposes the same operations
/// as the raw client.
#[derive(Clone)]
pub struct EnhancedClient {
    client: Arc<dyn DbClient>,
    policy: Option<PolicyClient>,
    kinds: Vec<EnhancementKind>,
}

impl EnhancedClient {
    /// Enabled enhancements, outermost first.
    pub fn kinds(&self) -> &[EnhancementKind] {
        &self.kinds
    }

    /// Whether `operation` on `model` can be permitted for this client's
    /// principal, see [`PolicyClient::check`].
    pub fn check(&self, model: &str, operation: PolicyOperation, filter: Option<&Value>) -> Result<bool> {
        match &self.policy {
            Some(policy) => policy.check(model, operation, filter),
            None => Err(Error::Config(
                "permission checks require the policy enhancement".to_string(),
            )),
        }
    }
}

/// Wrap `db` with the enhancements enabled in `config`.
///
/// Policies are enforced over the hierarchy layer, so guards and
/// validation see flat entities of the concrete model.
///
/// # Arguments
///
/// * `db` - The raw data-access client.
/// * `meta` - Schema metadata.
/// * `policy` - Access policies, used when the policy enhancement is enabled.
/// * `context` - The principal of every call.
/// * `config` - Enabled enhancements and their options.
pub fn enhance(
    db: Arc<dyn DbClient>,
    meta: Arc<ModelMeta>,
    policy: Arc<PolicyDef>,
    context: QueryContext,
    config: &EnhancementConfig,
) -> EnhancedClient {
    let mut client = db;
    let mut kinds = Vec::new();

    let has_hierarchy = meta.models().any(|m| meta.in_hierarchy(&m.name));
    if config.enables(EnhancementKind::Delegate) {
        client = Arc::new(DelegateClient::new(
            client,
            meta.clone(),
            DelegateOptions {
                transaction: config.transaction.clone(),
                log_queries: config.log_queries,
            },
        ));
        kinds.push(EnhancementKind::Delegate);
    } else if has_hierarchy {
        warn!("schema declares model hierarchies but the delegate enhancement is disabled");
    }

    let mut policy_client = None;
    if config.enables(EnhancementKind::Policy) {
        let enforced = PolicyClient::new(
            client,
            meta,
            policy,
            context,
            PolicyOptions {
                transaction: config.transaction.clone(),
                log_queries: config.log_queries,
            },
        );
        client = Arc::new(enforced.clone());
        policy_client = Some(enforced);
        kinds.insert(0, EnhancementKind::Policy);
    }

    info!(kinds = ?kinds, "client enhanced");
    EnhancedClient {
        client,
        policy: policy_client,
        kinds,
    }
}

#[async_trait]
impl DbClient for EnhancedClient {
    fn model(&self, name: &str) -> Result<Arc<dyn CrudOperations>> {
        self.client.model(name)
    }

    fn in_transaction(&self) -> bool {
        self.client.in_transaction()
    }

    async fn transaction(
        &self,
        options: TransactionOptions,
        callback: TransactionCallback,
    ) -> Result<Value> {
        self.client.transaction(options, callback).await
    }
}

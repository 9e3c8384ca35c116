//! Policy-enforcing client.

use super::handler::PolicyHandler;
use crate::model::{CheckerConstraint, ConstraintValue, PermissionChecker, PolicyDef, ValueKind};
use crate::solver::check_sat;
use async_trait::async_trait;
use bastion_core::error::{PolicyError, QueryError};
use bastion_core::{
    CrudOperations, DbClient, ModelMeta, PolicyOperation, QueryContext, Result, TransactionCallback,
    TransactionOptions,
};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Options of the policy layer.
#[derive(Debug, Clone, Default)]
pub struct PolicyOptions {
    /// Options of the transactions the layer opens
    pub transaction: TransactionOptions,
    /// Whether to log the rewritten queries
    pub log_queries: bool,
}

/// A client enforcing access policies for one principal.
///
/// Model handles are created on first use and cached for the lifetime of
/// the client.
#[derive(Clone)]
pub struct PolicyClient {
    inner: Arc<dyn DbClient>,
    meta: Arc<ModelMeta>,
    policy: Arc<PolicyDef>,
    context: Arc<QueryContext>,
    options: Arc<PolicyOptions>,
    handlers: Arc<DashMap<String, Arc<PolicyHandler>>>,
}

impl PolicyClient {
    /// Create a policy client over `inner`.
    ///
    /// # Arguments
    ///
    /// * `inner` - The client of the layer below.
    /// * `meta` - Schema metadata.
    /// * `policy` - Access policies of every model.
    /// * `context` - The principal of every call made through this client.
    /// * `options` - Transaction and logging options.
    pub fn new(
        inner: Arc<dyn DbClient>,
        meta: Arc<ModelMeta>,
        policy: Arc<PolicyDef>,
        context: QueryContext,
        options: PolicyOptions,
    ) -> Self {
        Self {
            inner,
            meta,
            policy,
            context: Arc::new(context),
            options: Arc::new(options),
            handlers: Arc::new(DashMap::new()),
        }
    }

    pub fn context(&self) -> &QueryContext {
        &self.context
    }

    fn scoped(&self, tx: Arc<dyn DbClient>) -> Self {
        Self {
            inner: tx,
            meta: self.meta.clone(),
            policy: self.policy.clone(),
            context: self.context.clone(),
            options: self.options.clone(),
            handlers: Arc::new(DashMap::new()),
        }
    }

    /// Whether `operation` on `model` can be permitted for some state of the
    /// data, given that the entity matches `filter`.
    ///
    /// The answer is computed from the model's permission checker alone and
    /// never touches storage.
    ///
    /// # Arguments
    ///
    /// * `model` - The model to check.
    /// * `operation` - The operation to check.
    /// * `filter` - Optional equality constraints on scalar fields.
    ///
    /// # Returns
    ///
    /// `true` if some assignment of the unknown fields satisfies the checker.
    pub fn check(&self, model: &str, operation: PolicyOperation, filter: Option<&Value>) -> Result<bool> {
        self.meta.require_model(model)?;
        let checker = self
            .policy
            .checker(model, operation)
            .ok_or_else(|| PolicyError::MissingChecker {
                model: model.to_string(),
                operation,
            })?;
        let extra = match filter {
            Some(filter) => self.filter_constraints(model, filter)?,
            None => Vec::new(),
        };

        let constraint = match checker {
            PermissionChecker::Constant(allowed) => return Ok(*allowed),
            PermissionChecker::Constraint(build) => build(&self.context),
        };
        let mut children = vec![constraint];
        children.extend(extra);
        let allowed = check_sat(&CheckerConstraint::and(children))?;
        debug!(model, operation = %operation, allowed, "permission check");
        Ok(allowed)
    }

    /// Equality constraints pinning fields to the values of `filter`.
    fn filter_constraints(&self, model: &str, filter: &Value) -> Result<Vec<CheckerConstraint>> {
        let invalid = |detail: String| -> bastion_core::Error { QueryError::InvalidCheck(detail).into() };
        let Value::Object(map) = filter else {
            return Err(invalid("filter of a permission check must be an object".to_string()));
        };
        let mut out = Vec::with_capacity(map.len());
        for (name, value) in map {
            let field = self.meta.require_field(model, name)?;
            if field.is_data_model || field.is_array {
                return Err(invalid(format!(
                    "only scalar fields can be used in a permission check, got {}.{}",
                    model, name
                )));
            }
            let (kind, value) = match (field.field_type.as_str(), value) {
                ("Int" | "BigInt", Value::Number(n)) => match n.as_i64() {
                    Some(n) => (ValueKind::Number, ConstraintValue::Number(n)),
                    None => {
                        return Err(invalid(format!("{}.{} must be an integer", model, name)));
                    }
                },
                ("String", Value::String(s)) => (ValueKind::String, ConstraintValue::String(s.clone())),
                ("Boolean", Value::Bool(b)) => (ValueKind::Boolean, ConstraintValue::Boolean(*b)),
                (field_type, value) => {
                    return Err(invalid(format!(
                        "value {} is not supported for {}.{} of type {}",
                        value, model, name, field_type
                    )));
                }
            };
            out.push(CheckerConstraint::eq(
                CheckerConstraint::variable(name, kind),
                CheckerConstraint::Value { value },
            ));
        }
        Ok(out)
    }
}

#[async_trait]
impl DbClient for PolicyClient {
    fn model(&self, name: &str) -> Result<Arc<dyn CrudOperations>> {
        if let Some(handler) = self.handlers.get(name) {
            return Ok(handler.value().clone());
        }
        self.meta.require_model(name)?;
        let handler = self
            .handlers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(PolicyHandler::new(
                    self.inner.clone(),
                    self.meta.clone(),
                    self.policy.clone(),
                    self.context.clone(),
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

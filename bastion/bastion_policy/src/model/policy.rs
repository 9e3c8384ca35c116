//! Policy definitions.
//!
//! A [`PolicyDef`] holds one [`ModelPolicy`] per model. Guards are keyed by
//! [`PolicyOperation`] and produce, for a given principal, either a constant
//! or a filter in the query language. Models or operations without a guard
//! are denied, except `postUpdate` which is allowed.

use super::constraint::CheckerConstraint;
use bastion_core::{PolicyOperation, QueryContext};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Inputs available to a guard function.
pub struct GuardContext<'a> {
    /// The principal of the current call
    pub user: &'a QueryContext,
    /// Entity as it was before the update, for `postUpdate` guards
    pub pre_value: Option<&'a Value>,
}

impl<'a> GuardContext<'a> {
    /// Read a principal attribute by dotted path.
    pub fn user_field(&self, path: &str) -> Value {
        self.user.user_field(path)
    }

    /// Read a pre-update field, `Null` if absent.
    pub fn pre_field(&self, field: &str) -> Value {
        self.pre_value
            .and_then(|v| v.get(field))
            .cloned()
            .unwrap_or(Value::Null)
    }
}

pub type GuardFn = Arc<dyn Fn(&GuardContext<'_>) -> Value + Send + Sync>;

/// A guard: an unconditional decision or a filter builder.
#[derive(Clone)]
pub enum Guard {
    Constant(bool),
    Filter(GuardFn),
}

impl Guard {
    /// Evaluate to `true`, `false`, or a filter object.
    pub fn evaluate(&self, ctx: &GuardContext<'_>) -> Value {
        match self {
            Guard::Constant(b) => Value::Bool(*b),
            Guard::Filter(f) => f(ctx),
        }
    }

    pub fn is_constant(&self, value: bool) -> bool {
        matches!(self, Guard::Constant(b) if *b == value)
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Guard::Constant(b) => write!(f, "Guard::Constant({})", b),
            Guard::Filter(_) => f.write_str("Guard::Filter(..)"),
        }
    }
}

/// Builds the constraint used by the permission checker for a principal.
pub type ConstraintFn = Arc<dyn Fn(&QueryContext) -> CheckerConstraint + Send + Sync>;

/// Static permission checker for an operation.
#[derive(Clone)]
pub enum PermissionChecker {
    Constant(bool),
    Constraint(ConstraintFn),
}

impl fmt::Debug for PermissionChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissionChecker::Constant(b) => write!(f, "PermissionChecker::Constant({})", b),
            PermissionChecker::Constraint(_) => f.write_str("PermissionChecker::Constraint(..)"),
        }
    }
}

/// Decides a create from its payload alone: `Some(allowed)`, or `None`
/// when the payload is not enough to decide.
pub type InputCheckFn = Arc<dyn Fn(&Value, &QueryContext) -> Option<bool> + Send + Sync>;

/// Access rules of one model.
#[derive(Clone, Default)]
pub struct ModelPolicy {
    guards: HashMap<PolicyOperation, Guard>,
    checkers: HashMap<PolicyOperation, PermissionChecker>,
    input_check: Option<InputCheckFn>,
    validation: Option<Value>,
    pre_value_select: Option<Value>,
}

impl ModelPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow an operation unconditionally.
    pub fn allow(mut self, operation: PolicyOperation) -> Self {
        self.guards.insert(operation, Guard::Constant(true));
        self
    }

    /// Deny an operation unconditionally.
    pub fn deny(mut self, operation: PolicyOperation) -> Self {
        self.guards.insert(operation, Guard::Constant(false));
        self
    }

    /// Guard an operation with a filter builder.
    pub fn guard<F>(mut self, operation: PolicyOperation, f: F) -> Self
    where
        F: Fn(&GuardContext<'_>) -> Value + Send + Sync + 'static,
    {
        self.guards.insert(operation, Guard::Filter(Arc::new(f)));
        self
    }

    pub fn checker(mut self, operation: PolicyOperation, checker: PermissionChecker) -> Self {
        self.checkers.insert(operation, checker);
        self
    }

    pub fn input_check<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value, &QueryContext) -> Option<bool> + Send + Sync + 'static,
    {
        self.input_check = Some(Arc::new(f));
        self
    }

    /// Attach a JSON Schema validating the model's scalar fields.
    pub fn validation(mut self, schema: Value) -> Self {
        self.validation = Some(schema);
        self
    }

    /// Fields fetched before an update so `postUpdate` guards can read them.
    pub fn pre_value_select(mut self, select: Value) -> Self {
        self.pre_value_select = Some(select);
        self
    }

    pub fn guard_for(&self, operation: PolicyOperation) -> Option<&Guard> {
        self.guards.get(&operation)
    }

    pub fn checker_for(&self, operation: PolicyOperation) -> Option<&PermissionChecker> {
        self.checkers.get(&operation)
    }

    pub fn input_checker(&self) -> Option<&InputCheckFn> {
        self.input_check.as_ref()
    }

    pub fn validation_schema(&self) -> Option<&Value> {
        self.validation.as_ref()
    }

    pub fn pre_value_fields(&self) -> Option<&Value> {
        self.pre_value_select.as_ref()
    }
}

/// Policies of every model.
#[derive(Clone, Default)]
pub struct PolicyDef {
    models: HashMap<String, ModelPolicy>,
}

impl PolicyDef {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the policy of a model.
    pub fn model(mut self, name: &str, policy: ModelPolicy) -> Self {
        self.models.insert(name.to_string(), policy);
        self
    }

    pub fn policy(&self, model: &str) -> Option<&ModelPolicy> {
        self.models.get(model)
    }

    pub fn guard(&self, model: &str, operation: PolicyOperation) -> Option<&Guard> {
        self.models.get(model).and_then(|p| p.guard_for(operation))
    }

    pub fn checker(&self, model: &str, operation: PolicyOperation) -> Option<&PermissionChecker> {
        self.models.get(model).and_then(|p| p.checker_for(operation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_guard_evaluation() {
        let policy = ModelPolicy::new()
            .allow(PolicyOperation::Create)
            .guard(PolicyOperation::Read, |ctx| {
                json!({"OR": [{"published": true}, {"authorId": ctx.user_field("id")}]})
            })
            .guard(PolicyOperation::PostUpdate, |ctx| {
                json!({"authorId": ctx.pre_field("authorId")})
            });

        let user = QueryContext::default();
        let ctx = GuardContext {
            user: &user,
            pre_value: None,
        };
        assert_eq!(
            policy.guard_for(PolicyOperation::Create).unwrap().evaluate(&ctx),
            json!(true)
        );
        assert_eq!(
            policy.guard_for(PolicyOperation::Read).unwrap().evaluate(&ctx),
            json!({"OR": [{"published": true}, {"authorId": null}]})
        );

        let pre = json!({"authorId": 3});
        let ctx = GuardContext {
            user: &user,
            pre_value: Some(&pre),
        };
        assert_eq!(
            policy.guard_for(PolicyOperation::PostUpdate).unwrap().evaluate(&ctx),
            json!({"authorId": 3})
        );
        assert!(policy.guard_for(PolicyOperation::Delete).is_none());
    }
}

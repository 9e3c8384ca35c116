//! Guard evaluation and injection.
//!
//! [`PolicyUtil`] evaluates guards for the current principal and folds them
//! into query arguments: the top-level `where`, relation filters inside
//! `where`, and relation selectors inside `select`/`include`.

use crate::model::{validate, ModelPolicy, PolicyDef, ValidationMode};
use crate::model::policy::GuardContext;
use bastion_core::query::{and, as_where, is_false, is_requested, not};
use bastion_core::{Error, ModelMeta, PolicyOperation, QueryContext, Result};
use serde_json::{json, Map, Value};
use tracing::trace;

/// Guard evaluation bound to one schema, policy and principal.
#[derive(Clone, Copy)]
pub struct PolicyUtil<'a> {
    pub meta: &'a ModelMeta,
    pub policy: &'a PolicyDef,
    pub context: &'a QueryContext,
}

impl<'a> PolicyUtil<'a> {
    pub fn new(meta: &'a ModelMeta, policy: &'a PolicyDef, context: &'a QueryContext) -> Self {
        Self {
            meta,
            policy,
            context,
        }
    }

    fn model_policy(&self, model: &str) -> Option<&'a ModelPolicy> {
        self.policy.policy(model)
    }

    /// Evaluate the guard of `model` for `operation`.
    ///
    /// A missing guard denies, except for `postUpdate` which allows.
    pub fn guard(&self, model: &str, operation: PolicyOperation, pre_value: Option<&Value>) -> Value {
        let value = match self.policy.guard(model, operation) {
            Some(guard) => guard.evaluate(&GuardContext {
                user: self.context,
                pre_value,
            }),
            None => Value::Bool(operation == PolicyOperation::PostUpdate),
        };
        trace!(model, operation = %operation, guard = %value, "evaluated guard");
        value
    }

    /// Whether a non-trivial guard is declared for the operation.
    pub fn has_guard(&self, model: &str, operation: PolicyOperation) -> bool {
        match self.policy.guard(model, operation) {
            Some(guard) => !guard.is_constant(true),
            None => operation != PolicyOperation::PostUpdate,
        }
    }

    /// Fail fast when the guard is statically false.
    pub fn try_reject(&self, model: &str, operation: PolicyOperation) -> Result<()> {
        if is_false(&self.guard(model, operation, None)) {
            return Err(Error::denied(model, operation, None));
        }
        Ok(())
    }

    /// Decide a create from its payload alone, if possible.
    pub fn input_check(&self, model: &str, data: &Value) -> Option<bool> {
        match self.policy.guard(model, PolicyOperation::Create) {
            None => return Some(false),
            Some(guard) if guard.is_constant(true) => return Some(true),
            Some(guard) if guard.is_constant(false) => return Some(false),
            Some(_) => {}
        }
        self.model_policy(model)
            .and_then(|p| p.input_checker())
            .and_then(|check| check(data, self.context))
    }

    pub fn has_validation(&self, model: &str) -> bool {
        self.model_policy(model)
            .and_then(|p| p.validation_schema())
            .is_some()
    }

    /// Validate a payload against the model's schema, if it has one.
    pub fn validate(&self, model: &str, data: &Value, mode: ValidationMode) -> Result<()> {
        match self.model_policy(model).and_then(|p| p.validation_schema()) {
            Some(schema) => validate(self.meta, model, schema, data, mode),
            None => Ok(()),
        }
    }

    /// Whether updates of the model need checks after the mutation.
    pub fn needs_post_update_check(&self, model: &str) -> bool {
        self.has_guard(model, PolicyOperation::PostUpdate) || self.has_validation(model)
    }

    /// Fields to fetch before an update for `postUpdate` guards.
    pub fn pre_value_select(&self, model: &str) -> Option<&'a Value> {
        self.model_policy(model).and_then(|p| p.pre_value_fields())
    }

    /// Fold read guards of related models into the relation filters of `filter`.
    ///
    /// - to-many: `some X` becomes `some AND(X, G)`, `none X` becomes
    ///   `none AND(X, G)` and `every X` becomes `none AND(G, NOT X)`
    /// - to-one: `is X` becomes `is AND(X, G)`, `isNot X` becomes
    ///   `isNot AND(X, G)`, a direct filter `X` becomes `is AND(X, G)`
    pub fn guard_where(&self, model: &str, filter: &Value) -> Value {
        let Value::Object(map) = filter else {
            return filter.clone();
        };
        let mut out = Map::new();
        let mut extra = Vec::new();

        for (key, value) in map {
            if matches!(key.as_str(), "AND" | "OR" | "NOT") {
                let guarded = match value {
                    Value::Array(items) => Value::Array(
                        items.iter().map(|item| self.guard_where(model, item)).collect(),
                    ),
                    other => self.guard_where(model, other),
                };
                out.insert(key.clone(), guarded);
                continue;
            }

            let Some(field) = self.meta.field(model, key).filter(|f| f.is_data_model) else {
                out.insert(key.clone(), value.clone());
                continue;
            };
            let target = field.field_type.as_str();
            let Some(ops) = value.as_object() else {
                out.insert(key.clone(), value.clone());
                continue;
            };
            let guard = self.guard(target, PolicyOperation::Read, None);

            if field.is_array {
                let mut rebuilt = Map::new();
                let mut none_clauses = Vec::new();
                for (op, condition) in ops {
                    let condition = self.guard_where(target, condition);
                    match op.as_str() {
                        "some" => {
                            rebuilt.insert(op.clone(), as_where(and([condition, guard.clone()])));
                        }
                        "none" => none_clauses.push(as_where(and([condition, guard.clone()]))),
                        "every" => {
                            none_clauses.push(as_where(and([guard.clone(), not(condition)])))
                        }
                        _ => {
                            rebuilt.insert(op.clone(), condition);
                        }
                    }
                }
                let mut none_clauses = none_clauses.into_iter();
                if let Some(first) = none_clauses.next() {
                    rebuilt.insert("none".to_string(), first);
                }
                for clause in none_clauses {
                    let mut relation = Map::new();
                    relation.insert(key.clone(), json!({ "none": clause }));
                    extra.push(Value::Object(relation));
                }
                out.insert(key.clone(), Value::Object(rebuilt));
                continue;
            }

            if ops.contains_key("is") || ops.contains_key("isNot") {
                let mut rebuilt = Map::new();
                for (op, condition) in ops {
                    let guarded = match op.as_str() {
                        "is" | "isNot" if !condition.is_null() => as_where(and([
                            self.guard_where(target, condition),
                            guard.clone(),
                        ])),
                        _ => condition.clone(),
                    };
                    rebuilt.insert(op.clone(), guarded);
                }
                out.insert(key.clone(), Value::Object(rebuilt));
            } else {
                let condition = self.guard_where(target, value);
                out.insert(
                    key.clone(),
                    json!({ "is": as_where(and([condition, guard])) }),
                );
            }
        }

        if extra.is_empty() {
            Value::Object(out)
        } else {
            and(std::iter::once(Value::Object(out)).chain(extra))
        }
    }

    /// Inject read guards into the arguments of a read.
    ///
    /// # Returns
    ///
    /// The guarded arguments, or `None` when the model is statically unreadable.
    pub fn inject_for_read(&self, model: &str, args: &Value) -> Option<Value> {
        let guard = self.guard(model, PolicyOperation::Read, None);
        if is_false(&guard) {
            return None;
        }
        let mut out = args.as_object().cloned().unwrap_or_default();
        let filter = out.get("where").cloned().unwrap_or_else(|| json!({}));
        out.insert(
            "where".to_string(),
            as_where(and([self.guard_where(model, &filter), guard])),
        );
        self.inject_selection(model, &mut out);
        Some(Value::Object(out))
    }

    /// Guard the relation selectors of a `select`/`include`-carrying object.
    fn inject_selection(&self, model: &str, args: &mut Map<String, Value>) {
        for key in ["select", "include"] {
            let Some(Value::Object(selection)) = args.get(key).cloned() else {
                continue;
            };
            let mut rebuilt = Map::new();
            for (name, spec) in selection {
                if name == "_count" {
                    rebuilt.insert(name, self.guard_count(model, &spec));
                    continue;
                }
                let Some(field) = self.meta.field(model, &name).filter(|f| f.is_data_model) else {
                    rebuilt.insert(name, spec);
                    continue;
                };
                if !is_requested(&spec) {
                    rebuilt.insert(name, spec);
                    continue;
                }
                let target = field.field_type.as_str();
                let mut sub = spec.as_object().cloned().unwrap_or_default();
                if field.is_array {
                    let guard = self.guard(target, PolicyOperation::Read, None);
                    let filter = sub.get("where").cloned().unwrap_or_else(|| json!({}));
                    sub.insert(
                        "where".to_string(),
                        as_where(and([self.guard_where(target, &filter), guard])),
                    );
                } else if let Some(Value::Object(select)) = sub.get_mut("select") {
                    // ids are needed to verify the related row afterwards
                    for id in self.meta.id_fields(target) {
                        select.insert(id.name.clone(), Value::Bool(true));
                    }
                }
                self.inject_selection(target, &mut sub);
                rebuilt.insert(name, Value::Object(sub));
            }
            args.insert(key.to_string(), Value::Object(rebuilt));
        }
    }

    /// Guard the relations counted by a `_count` selector.
    fn guard_count(&self, model: &str, spec: &Value) -> Value {
        let requested: Vec<(String, Value)> = match spec.get("select").and_then(Value::as_object) {
            Some(select) => select.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            None if is_requested(spec) => self
                .meta
                .model(model)
                .map(|m| {
                    m.fields
                        .values()
                        .filter(|f| f.is_to_many())
                        .map(|f| (f.name.clone(), Value::Bool(true)))
                        .collect()
                })
                .unwrap_or_default(),
            None => return spec.clone(),
        };

        let mut select = Map::new();
        for (name, options) in requested {
            let Some(field) = self.meta.field(model, &name).filter(|f| f.is_to_many()) else {
                select.insert(name, options);
                continue;
            };
            if !is_requested(&options) {
                continue;
            }
            let guard = self.guard(&field.field_type, PolicyOperation::Read, None);
            let filter = options.get("where").cloned().unwrap_or_else(|| json!({}));
            let filter = as_where(and([self.guard_where(&field.field_type, &filter), guard]));
            select.insert(name, json!({ "where": filter }));
        }
        json!({ "select": select })
    }
}

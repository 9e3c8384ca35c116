//! Per-call query context.
//!
//! The context carries the principal a call is made on behalf of. Guard
//! functions read principal attributes through [`QueryContext::user_field`],
//! which tolerates missing attributes with a logged integrity warning.

use crate::error::{Error, Result};
use crate::meta::ModelMeta;
use serde_json::{Map, Value};
use tracing::warn;

/// The principal and ambient data available to guard functions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryContext {
    user: Option<Map<String, Value>>,
}

impl QueryContext {
    /// Context without a principal.
    pub fn anonymous() -> Self {
        Self { user: None }
    }

    /// Context for a principal.
    ///
    /// # Arguments
    ///
    /// * `user` - Principal object, must contain every id field of the auth model.
    /// * `meta` - Schema metadata, used to look up the auth model's id fields.
    ///
    /// # Returns
    ///
    /// The context, or `Error::Context` if the principal is not an object or
    /// lacks an identifying field.
    pub fn for_user(user: Value, meta: &ModelMeta) -> Result<Self> {
        let Value::Object(user) = user else {
            return Err(Error::Context("user must be an object".to_string()));
        };

        let id_fields: Vec<String> = match meta.auth_model() {
            Some(auth) => meta.id_fields(auth).iter().map(|f| f.name.clone()).collect(),
            None => vec!["id".to_string()],
        };
        for id in &id_fields {
            match user.get(id) {
                None | Some(Value::Null) => {
                    return Err(Error::Context(format!(
                        "user context must contain id field \"{}\"",
                        id
                    )))
                }
                Some(_) => {}
            }
        }

        Ok(Self { user: Some(user) })
    }

    pub fn user(&self) -> Option<&Map<String, Value>> {
        self.user.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    /// Read a principal attribute by dotted path.
    ///
    /// Returns `Value::Null` when there is no principal or the attribute is
    /// absent. An absent attribute on a present principal is logged as an
    /// integrity warning.
    pub fn user_field(&self, path: &str) -> Value {
        let Some(user) = &self.user else {
            return Value::Null;
        };
        let mut segments = path.split('.');
        let mut current = match segments.next().and_then(|s| user.get(s)) {
            Some(v) => v,
            None => {
                warn!(field = path, "user context is missing a field referenced by policy");
                return Value::Null;
            }
        };
        for segment in segments {
            match current.get(segment) {
                Some(v) => current = v,
                None => {
                    warn!(field = path, "user context is missing a field referenced by policy");
                    return Value::Null;
                }
            }
        }
        current.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{FieldInfo, ModelInfo};
    use serde_json::json;

    fn meta() -> ModelMeta {
        ModelMeta::new(vec![ModelInfo::new("User")
            .field(FieldInfo::scalar("id", "Int").id())
            .field(FieldInfo::scalar("role", "String"))])
        .unwrap()
        .with_auth_model("User")
    }

    #[test]
    fn test_user_context() {
        let ctx = QueryContext::for_user(json!({"id": 1, "org": {"name": "acme"}}), &meta()).unwrap();
        assert!(ctx.is_authenticated());
        assert_eq!(ctx.user_field("id"), json!(1));
        assert_eq!(ctx.user_field("org.name"), json!("acme"));

        // Missing policy fields are not fatal
        assert_eq!(ctx.user_field("role"), Value::Null);
    }

    #[test]
    fn test_missing_id_rejected() {
        let err = QueryContext::for_user(json!({"role": "admin"}), &meta()).unwrap_err();
        assert!(matches!(err, Error::Context(_)));

        let err = QueryContext::for_user(json!({"id": null}), &meta()).unwrap_err();
        assert!(matches!(err, Error::Context(_)));
    }

    #[test]
    fn test_anonymous() {
        let ctx = QueryContext::anonymous();
        assert!(!ctx.is_authenticated());
        assert_eq!(ctx.user_field("id"), Value::Null);
    }
}

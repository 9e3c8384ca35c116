//! JSON Schema validation of write payloads.

use bastion_core::error::{Result, ValidationError};
use bastion_core::meta::SYSTEM_ATTRIBUTE;
use bastion_core::ModelMeta;
use serde_json::{Map, Value};

/// Which shape of payload is being validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Create payload, validated against the full schema
    Create,
    /// Update payload, `required` is not enforced
    Update,
    /// Entity as stored after an update
    Entity,
}

/// Scalar values of a payload that the schema applies to.
fn scalar_payload(meta: &ModelMeta, model: &str, data: &Value, mode: ValidationMode) -> Value {
    let mut out = Map::new();
    let Some(map) = data.as_object() else {
        return Value::Object(out);
    };
    for (key, value) in map {
        let Some(field) = meta.field(model, key) else {
            continue;
        };
        if field.is_data_model || field.has_attribute(SYSTEM_ATTRIBUTE) || value.is_null() {
            continue;
        }
        // Update operators (`increment`, `set`, ...) are not plain values
        if mode == ValidationMode::Update && value.is_object() && field.field_type != "Json" {
            if let Some(v) = value.get("set") {
                out.insert(key.clone(), v.clone());
            }
            continue;
        }
        out.insert(key.clone(), value.clone());
    }
    Value::Object(out)
}

/// Validate `data` of `model` against `schema`.
///
/// # Arguments
///
/// * `meta` - Schema metadata, used to keep only scalar fields.
/// * `model` - The model being written.
/// * `schema` - The model's JSON Schema.
/// * `data` - Payload or entity to validate.
/// * `mode` - Payload shape.
///
/// # Returns
///
/// `Ok(())`, or `ValidationError::Failed` listing every violation.
pub fn validate(
    meta: &ModelMeta,
    model: &str,
    schema: &Value,
    data: &Value,
    mode: ValidationMode,
) -> Result<()> {
    let instance = scalar_payload(meta, model, data, mode);
    let schema = match mode {
        ValidationMode::Update => {
            let mut relaxed = schema.clone();
            if let Some(map) = relaxed.as_object_mut() {
                map.remove("required");
            }
            relaxed
        }
        _ => schema.clone(),
    };

    let validator = jsonschema::validator_for(&schema).map_err(|e| ValidationError::InvalidSchema {
        model: model.to_string(),
        detail: e.to_string(),
    })?;
    let errors: Vec<String> = validator
        .iter_errors(&instance)
        .map(|e| format!("{}: {}", e.instance_path, e))
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::Failed {
            model: model.to_string(),
            detail: errors.join("; "),
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_core::error::Error;
    use bastion_core::meta::{FieldInfo, ModelInfo};
    use serde_json::json;

    fn meta() -> ModelMeta {
        ModelMeta::new(vec![
            ModelInfo::new("User")
                .field(FieldInfo::scalar("id", "Int").id())
                .field(FieldInfo::relation("posts", "Post").array().back_link("author")),
            ModelInfo::new("Post")
                .field(FieldInfo::scalar("id", "Int").id())
                .field(FieldInfo::scalar("title", "String"))
                .field(FieldInfo::scalar("views", "Int"))
                .field(
                    FieldInfo::relation("author", "User")
                        .optional()
                        .owner(&[("id", "authorId")])
                        .back_link("posts"),
                )
                .field(FieldInfo::foreign_key("authorId", "Int", "author").optional()),
        ])
        .unwrap()
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": {"type": "string", "minLength": 3},
                "views": {"type": "integer", "minimum": 0}
            },
            "required": ["title"]
        })
    }

    #[test]
    fn test_create_validation() {
        let meta = meta();
        validate(&meta, "Post", &schema(), &json!({"title": "hello", "author": {"connect": {"id": 1}}}), ValidationMode::Create).unwrap();

        let err = validate(&meta, "Post", &schema(), &json!({"title": "hi"}), ValidationMode::Create).unwrap_err();
        match err {
            Error::Validation(ValidationError::Failed { model, detail }) => {
                assert_eq!(model, "Post");
                assert!(detail.starts_with("/title"));
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(validate(&meta, "Post", &schema(), &json!({"views": 1}), ValidationMode::Create).is_err());
    }

    #[test]
    fn test_update_validation_is_partial() {
        let meta = meta();
        validate(&meta, "Post", &schema(), &json!({"views": {"increment": 1}}), ValidationMode::Update).unwrap();
        validate(&meta, "Post", &schema(), &json!({"views": 2}), ValidationMode::Update).unwrap();
        assert!(validate(&meta, "Post", &schema(), &json!({"views": {"set": -1}}), ValidationMode::Update).is_err());
    }

    #[test]
    fn test_invalid_schema() {
        let err = validate(&meta(), "Post", &json!({"type": 12}), &json!({}), ValidationMode::Entity).unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::InvalidSchema { .. })));
    }
}

//! Field metadata.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Attribute marking a field as excluded from results.
pub const OMIT_ATTRIBUTE: &str = "@omit";

/// Attribute marking a timestamp bumped on every update.
pub const UPDATED_AT_ATTRIBUTE: &str = "@updatedAt";

/// Attribute marking a single-field unique constraint.
pub const UNIQUE_ATTRIBUTE: &str = "@unique";

/// Attribute marking a field managed by the engine itself.
pub const SYSTEM_ATTRIBUTE: &str = "@system";

/// An attribute attached to a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldAttribute {
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Database-side default for a scalar field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "value")]
pub enum FieldDefault {
    /// Next integer in a per-model sequence
    Autoincrement,
    /// Random v4 uuid
    Uuid,
    /// Current timestamp
    Now,
    /// A literal value
    Value(Value),
}

/// Referential action applied to dependents when the referenced row is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferentialAction {
    Cascade,
    Restrict,
    NoAction,
    SetNull,
    SetDefault,
}

/// Metadata describing one field of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldInfo {
    /// Field name
    pub name: String,

    /// Scalar type name, or the related model name for relations
    #[serde(rename = "type")]
    pub field_type: String,

    #[serde(default)]
    pub is_id: bool,

    #[serde(default)]
    pub is_array: bool,

    #[serde(default)]
    pub is_optional: bool,

    /// Whether this is a relation rather than a scalar
    #[serde(default)]
    pub is_data_model: bool,

    #[serde(default)]
    pub is_foreign_key: bool,

    /// Relation field a foreign-key scalar belongs to
    #[serde(default)]
    pub relation_field: Option<String>,

    /// Whether this side of the relation holds the foreign key
    #[serde(default)]
    pub is_relation_owner: bool,

    /// Related id field name to local foreign-key field name
    #[serde(default)]
    pub foreign_key_mapping: Option<BTreeMap<String, String>>,

    /// Name of the opposite relation field
    #[serde(default)]
    pub back_link: Option<String>,

    /// Base model that declares this field
    #[serde(default)]
    pub inherited_from: Option<String>,

    #[serde(default)]
    pub on_delete_action: Option<ReferentialAction>,

    #[serde(default)]
    pub default: Option<FieldDefault>,

    #[serde(default)]
    pub attributes: Vec<FieldAttribute>,
}

impl FieldInfo {
    fn blank(name: &str, field_type: &str) -> Self {
        Self {
            name: name.to_string(),
            field_type: field_type.to_string(),
            is_id: false,
            is_array: false,
            is_optional: false,
            is_data_model: false,
            is_foreign_key: false,
            relation_field: None,
            is_relation_owner: false,
            foreign_key_mapping: None,
            back_link: None,
            inherited_from: None,
            on_delete_action: None,
            default: None,
            attributes: Vec::new(),
        }
    }

    /// Create a scalar field.
    pub fn scalar(name: &str, field_type: &str) -> Self {
        Self::blank(name, field_type)
    }

    /// Create a relation field pointing at `target`.
    pub fn relation(name: &str, target: &str) -> Self {
        let mut field = Self::blank(name, target);
        field.is_data_model = true;
        field
    }

    /// Create a foreign-key scalar belonging to `relation_field`.
    pub fn foreign_key(name: &str, field_type: &str, relation_field: &str) -> Self {
        let mut field = Self::blank(name, field_type);
        field.is_foreign_key = true;
        field.relation_field = Some(relation_field.to_string());
        field
    }

    pub fn id(mut self) -> Self {
        self.is_id = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.is_optional = true;
        self
    }

    pub fn array(mut self) -> Self {
        self.is_array = true;
        self
    }

    pub fn autoincrement(mut self) -> Self {
        self.default = Some(FieldDefault::Autoincrement);
        self
    }

    pub fn default_uuid(mut self) -> Self {
        self.default = Some(FieldDefault::Uuid);
        self
    }

    pub fn default_now(mut self) -> Self {
        self.default = Some(FieldDefault::Now);
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(FieldDefault::Value(value));
        self
    }

    /// Mark the relation as owning the foreign key, given `(related id, local fk)` pairs.
    pub fn owner(mut self, mapping: &[(&str, &str)]) -> Self {
        self.is_relation_owner = true;
        self.foreign_key_mapping = Some(
            mapping
                .iter()
                .map(|(r, l)| (r.to_string(), l.to_string()))
                .collect(),
        );
        self
    }

    pub fn back_link(mut self, name: &str) -> Self {
        self.back_link = Some(name.to_string());
        self
    }

    pub fn on_delete(mut self, action: ReferentialAction) -> Self {
        self.on_delete_action = Some(action);
        self
    }

    pub fn inherited_from(mut self, base: &str) -> Self {
        self.inherited_from = Some(base.to_string());
        self
    }

    /// Attach an attribute without arguments.
    pub fn attribute(mut self, name: &str) -> Self {
        self.attributes.push(FieldAttribute {
            name: name.to_string(),
            args: Vec::new(),
        });
        self
    }

    pub fn unique(self) -> Self {
        self.attribute(UNIQUE_ATTRIBUTE)
    }

    pub fn omitted(self) -> Self {
        self.attribute(OMIT_ATTRIBUTE)
    }

    pub fn updated_at(self) -> Self {
        self.attribute(UPDATED_AT_ATTRIBUTE)
    }

    /// Whether the field carries the named attribute.
    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.iter().any(|a| a.name == name)
    }

    /// Whether the field is a to-many relation.
    pub fn is_to_many(&self) -> bool {
        self.is_data_model && self.is_array
    }

    /// Whether the field is a to-one relation.
    pub fn is_to_one(&self) -> bool {
        self.is_data_model && !self.is_array
    }

    /// Whether the field is excluded from results.
    pub fn is_omitted(&self) -> bool {
        self.has_attribute(OMIT_ATTRIBUTE) || self.has_attribute(SYSTEM_ATTRIBUTE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder() {
        let field = FieldInfo::relation("author", "User")
            .owner(&[("id", "authorId")])
            .back_link("posts");
        assert!(field.is_to_one());
        assert!(field.is_relation_owner);
        assert_eq!(
            field.foreign_key_mapping.as_ref().unwrap().get("id"),
            Some(&"authorId".to_string())
        );

        let field = FieldInfo::scalar("password", "String").omitted();
        assert!(field.is_omitted());
        assert!(!field.is_data_model);
    }

    #[test]
    fn test_deserialize() {
        let field: FieldInfo = serde_json::from_value(json!({
            "name": "id",
            "type": "Int",
            "isId": true,
            "default": { "kind": "autoincrement" }
        }))
        .unwrap();
        assert!(field.is_id);
        assert_eq!(field.default, Some(FieldDefault::Autoincrement));

        let field: FieldInfo = serde_json::from_value(json!({
            "name": "published",
            "type": "Boolean",
            "default": { "kind": "value", "value": false }
        }))
        .unwrap();
        assert_eq!(field.default, Some(FieldDefault::Value(json!(false))));
    }
}

//! Model metadata.

use super::field::FieldInfo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A unique constraint over one or more scalar fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueConstraint {
    /// Constraint name, also the generated compound filter key
    pub name: String,
    pub fields: Vec<String>,
}

impl UniqueConstraint {
    /// Create a constraint named after its fields joined by `_`.
    pub fn over(fields: &[&str]) -> Self {
        Self {
            name: fields.join("_"),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    /// Whether the constraint spans more than one field.
    pub fn is_compound(&self) -> bool {
        self.fields.len() > 1
    }
}

/// Metadata describing one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub name: String,

    #[serde(default)]
    pub fields: BTreeMap<String, FieldInfo>,

    /// Direct base model, at most one entry
    #[serde(default)]
    pub base_types: Vec<String>,

    /// Field naming the concrete sub-type of each row
    #[serde(default)]
    pub discriminator: Option<String>,

    /// Whether the model is abstract
    #[serde(default)]
    pub is_delegate: bool,

    #[serde(default)]
    pub unique_constraints: BTreeMap<String, UniqueConstraint>,
}

impl ModelInfo {
    /// Create an empty model.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fields: BTreeMap::new(),
            base_types: Vec::new(),
            discriminator: None,
            is_delegate: false,
            unique_constraints: BTreeMap::new(),
        }
    }

    /// Add a field.
    pub fn field(mut self, field: FieldInfo) -> Self {
        self.fields.insert(field.name.clone(), field);
        self
    }

    /// Declare the direct base model.
    pub fn extends(mut self, base: &str) -> Self {
        self.base_types.push(base.to_string());
        self
    }

    /// Mark the model abstract, with the given discriminator field.
    pub fn delegate(mut self, discriminator: &str) -> Self {
        self.is_delegate = true;
        self.discriminator = Some(discriminator.to_string());
        self
    }

    /// Add a discriminator to a concrete model that has sub-types of its own.
    pub fn discriminated_by(mut self, discriminator: &str) -> Self {
        self.discriminator = Some(discriminator.to_string());
        self
    }

    /// Add a unique constraint.
    pub fn unique(mut self, constraint: UniqueConstraint) -> Self {
        self.unique_constraints
            .insert(constraint.name.clone(), constraint);
        self
    }

    /// Id fields, in name order.
    pub fn id_fields(&self) -> Vec<&FieldInfo> {
        self.fields.values().filter(|f| f.is_id).collect()
    }

    /// Names of the id fields, in name order.
    pub fn id_field_names(&self) -> Vec<String> {
        self.id_fields().iter().map(|f| f.name.clone()).collect()
    }

    /// The direct base model name, if any.
    pub fn base(&self) -> Option<&str> {
        self.base_types.first().map(String::as_str)
    }
}

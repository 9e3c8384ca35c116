//! Schema metadata.
//!
//! `ModelMeta` is the immutable, fully resolved description of every model
//! the engine operates on. It is built once by [`ModelMeta::new`], which
//! validates the schema invariants and runs a derived-metadata pass:
//!
//! 1. fields declared on a base model are copied onto every sub-type with
//!    `inherited_from` set, so lookups never need to walk the chain;
//! 2. the synthetic one-to-one relations linking hierarchy levels are added
//!    (`delegate_aux_<model>`), owned by the sub-type and cascading on delete;
//! 3. a system field holding the transaction tag is added to every model;
//! 4. id and single-field unique constraints are registered;
//! 5. attribute usage and the sub-type index are computed.

pub mod field;
pub mod model;

pub use field::{
    FieldAttribute, FieldDefault, FieldInfo, ReferentialAction, OMIT_ATTRIBUTE,
    SYSTEM_ATTRIBUTE, UNIQUE_ATTRIBUTE, UPDATED_AT_ATTRIBUTE,
};
pub use model::{ModelInfo, UniqueConstraint};

use crate::error::{QueryError, Result, SchemaError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Prefix of the synthetic relations linking hierarchy levels.
pub const DELEGATE_AUX_RELATION_PREFIX: &str = "delegate_aux";

/// System field that tags rows created inside a policy-checked transaction.
pub const TRANSACTION_FIELD_NAME: &str = "_txTag";

/// Name of the synthetic relation pointing at `model`.
pub fn aux_relation_name(model: &str) -> String {
    let mut chars = model.chars();
    let lowered = match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect::<String>(),
        None => String::new(),
    };
    format!("{}_{}", DELEGATE_AUX_RELATION_PREFIX, lowered)
}

/// Whether `field` is one of the synthetic hierarchy relations.
pub fn is_aux_relation(field: &str) -> bool {
    field.starts_with(DELEGATE_AUX_RELATION_PREFIX)
}

/// Serialized form of a schema, as produced by the schema compiler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDocument {
    #[serde(default)]
    pub models: Vec<ModelInfo>,

    /// Model the principal is an instance of
    #[serde(default)]
    pub auth_model: Option<String>,
}

/// Facts computed once from the declared models.
#[derive(Debug, Clone, Default)]
struct DerivedMeta {
    attributes_in_use: HashSet<String>,
    sub_models: BTreeMap<String, Vec<String>>,
}

/// Resolved schema metadata.
#[derive(Debug, Clone)]
pub struct ModelMeta {
    models: BTreeMap<String, ModelInfo>,
    auth_model: Option<String>,
    derived: DerivedMeta,
}

impl ModelMeta {
    /// Validate the models and run the derived-metadata pass.
    pub fn new(models: impl IntoIterator<Item = ModelInfo>) -> Result<Self> {
        let mut models: BTreeMap<String, ModelInfo> =
            models.into_iter().map(|m| (m.name.clone(), m)).collect();

        for model in models.values() {
            if model.base_types.len() > 1 {
                return Err(SchemaError::MultipleInheritance(model.name.clone()).into());
            }
            if let Some(base) = model.base() {
                if !models.contains_key(base) {
                    return Err(SchemaError::UnknownBase {
                        model: model.name.clone(),
                        base: base.to_string(),
                    }
                    .into());
                }
            }
        }

        let order = inheritance_order(&models)?;
        for name in &order {
            inherit_base_fields(&mut models, name);
        }
        for name in &order {
            link_hierarchy_levels(&mut models, name);
        }

        for model in models.values_mut() {
            model.fields.insert(
                TRANSACTION_FIELD_NAME.to_string(),
                FieldInfo::scalar(TRANSACTION_FIELD_NAME, "String")
                    .optional()
                    .attribute(SYSTEM_ATTRIBUTE),
            );

            let ids: Vec<String> = model.id_field_names();
            if ids.is_empty() {
                return Err(SchemaError::MissingIdFields(model.name.clone()).into());
            }
            let id_constraint = UniqueConstraint {
                name: ids.join("_"),
                fields: ids,
            };
            model
                .unique_constraints
                .entry(id_constraint.name.clone())
                .or_insert(id_constraint);

            let unique_fields: Vec<String> = model
                .fields
                .values()
                .filter(|f| f.inherited_from.is_none() && f.has_attribute(UNIQUE_ATTRIBUTE))
                .map(|f| f.name.clone())
                .collect();
            for name in unique_fields {
                model
                    .unique_constraints
                    .entry(name.clone())
                    .or_insert(UniqueConstraint {
                        name: name.clone(),
                        fields: vec![name],
                    });
            }
        }

        validate_relations(&models)?;

        let mut derived = DerivedMeta::default();
        for model in models.values() {
            for field in model.fields.values() {
                for attr in &field.attributes {
                    derived.attributes_in_use.insert(attr.name.clone());
                }
            }
            if let Some(base) = model.base() {
                derived
                    .sub_models
                    .entry(base.to_string())
                    .or_default()
                    .push(model.name.clone());
            }
        }

        Ok(Self {
            models,
            auth_model: None,
            derived,
        })
    }

    /// Build from a serialized schema document.
    pub fn from_document(doc: SchemaDocument) -> Result<Self> {
        let auth_model = doc.auth_model.clone();
        let meta = Self::new(doc.models)?;
        Ok(match auth_model {
            Some(auth) => meta.with_auth_model(&auth),
            None => meta,
        })
    }

    /// Set the model the principal is an instance of.
    pub fn with_auth_model(mut self, model: &str) -> Self {
        self.auth_model = Some(model.to_string());
        self
    }

    pub fn auth_model(&self) -> Option<&str> {
        self.auth_model.as_deref()
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelInfo> {
        self.models.values()
    }

    pub fn model(&self, name: &str) -> Option<&ModelInfo> {
        self.models.get(name)
    }

    /// Look up a model, failing with a usage error.
    pub fn require_model(&self, name: &str) -> Result<&ModelInfo> {
        self.models
            .get(name)
            .ok_or_else(|| QueryError::UnknownModel(name.to_string()).into())
    }

    pub fn field(&self, model: &str, field: &str) -> Option<&FieldInfo> {
        self.models.get(model).and_then(|m| m.fields.get(field))
    }

    /// Look up a field, failing with a usage error.
    pub fn require_field(&self, model: &str, field: &str) -> Result<&FieldInfo> {
        self.field(model, field).ok_or_else(|| {
            QueryError::UnknownField {
                model: model.to_string(),
                field: field.to_string(),
            }
            .into()
        })
    }

    /// Id fields of a model; empty for unknown models.
    pub fn id_fields(&self, model: &str) -> Vec<&FieldInfo> {
        self.models
            .get(model)
            .map(|m| m.id_fields())
            .unwrap_or_default()
    }

    pub fn base_model(&self, model: &str) -> Option<&ModelInfo> {
        self.models
            .get(model)
            .and_then(|m| m.base())
            .and_then(|b| self.models.get(b))
    }

    /// Base models from the nearest parent up to the root of the hierarchy.
    pub fn base_chain(&self, model: &str) -> Vec<&ModelInfo> {
        let mut chain = Vec::new();
        let mut current = self.base_model(model);
        while let Some(base) = current {
            chain.push(base);
            current = self.base_model(&base.name);
        }
        chain
    }

    /// Direct sub-types of a model.
    pub fn sub_models(&self, model: &str) -> &[String] {
        self.derived
            .sub_models
            .get(model)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_delegate(&self, model: &str) -> bool {
        self.models.get(model).map(|m| m.is_delegate).unwrap_or(false)
    }

    /// Whether the model has a base or sub-types.
    pub fn in_hierarchy(&self, model: &str) -> bool {
        self.base_model(model).is_some() || !self.sub_models(model).is_empty()
    }

    /// Whether the model, or a model it relates to, is part of a hierarchy.
    pub fn involves_hierarchy(&self, model: &str) -> bool {
        if self.in_hierarchy(model) {
            return true;
        }
        self.models
            .get(model)
            .map(|m| {
                m.fields
                    .values()
                    .any(|f| f.is_data_model && self.in_hierarchy(&f.field_type))
            })
            .unwrap_or(false)
    }

    /// Whether `field` is the discriminator of `model` or of one of its bases.
    pub fn is_discriminator(&self, model: &str, field: &str) -> bool {
        let own = self
            .models
            .get(model)
            .map(|m| m.discriminator.as_deref() == Some(field))
            .unwrap_or(false);
        own || self
            .base_chain(model)
            .iter()
            .any(|b| b.discriminator.as_deref() == Some(field))
    }

    /// Whether any field in the schema carries the attribute.
    pub fn uses_attribute(&self, attribute: &str) -> bool {
        self.derived.attributes_in_use.contains(attribute)
    }

    /// Unique constraints of a model.
    pub fn unique_constraints(&self, model: &str) -> impl Iterator<Item = &UniqueConstraint> {
        self.models
            .get(model)
            .into_iter()
            .flat_map(|m| m.unique_constraints.values())
    }
}

/// Order models so that every base precedes its sub-types.
fn inheritance_order(models: &BTreeMap<String, ModelInfo>) -> Result<Vec<String>> {
    let mut order = Vec::with_capacity(models.len());
    let mut placed: BTreeSet<String> = BTreeSet::new();

    for name in models.keys() {
        let mut chain = Vec::new();
        let mut current = Some(name.clone());
        while let Some(model) = current {
            if placed.contains(&model) {
                break;
            }
            if chain.contains(&model) {
                return Err(SchemaError::InheritanceCycle(model).into());
            }
            current = models
                .get(&model)
                .and_then(|m| m.base())
                .map(str::to_string);
            chain.push(model);
        }
        for model in chain.into_iter().rev() {
            placed.insert(model.clone());
            order.push(model);
        }
    }
    Ok(order)
}

fn inherit_base_fields(models: &mut BTreeMap<String, ModelInfo>, name: &str) {
    let Some(base_name) = models.get(name).and_then(|m| m.base()).map(str::to_string) else {
        return;
    };
    let inherited: Vec<FieldInfo> = match models.get(&base_name) {
        Some(base) => base
            .fields
            .values()
            .filter(|f| !f.is_id && !is_aux_relation(&f.name))
            .map(|f| {
                let mut copy = f.clone();
                if copy.inherited_from.is_none() {
                    copy.inherited_from = Some(base_name.clone());
                }
                copy
            })
            .collect(),
        None => return,
    };
    if let Some(model) = models.get_mut(name) {
        for field in inherited {
            model.fields.entry(field.name.clone()).or_insert(field);
        }
    }
}

fn link_hierarchy_levels(models: &mut BTreeMap<String, ModelInfo>, name: &str) {
    let Some(base_name) = models.get(name).and_then(|m| m.base()).map(str::to_string) else {
        return;
    };
    let base_ids = match models.get(&base_name) {
        Some(base) => base.id_field_names(),
        None => return,
    };
    let to_base = aux_relation_name(&base_name);
    let to_sub = aux_relation_name(name);

    if let Some(sub) = models.get_mut(name) {
        let mapping: Vec<(&str, &str)> = base_ids.iter().map(|id| (id.as_str(), id.as_str())).collect();
        sub.fields.insert(
            to_base.clone(),
            FieldInfo::relation(&to_base, &base_name)
                .owner(&mapping)
                .back_link(&to_sub)
                .on_delete(ReferentialAction::Cascade),
        );
        for id in &base_ids {
            if let Some(field) = sub.fields.get_mut(id) {
                field.is_foreign_key = true;
                field.relation_field = Some(to_base.clone());
            }
        }
    }
    if let Some(base) = models.get_mut(&base_name) {
        base.fields.insert(
            to_sub.clone(),
            FieldInfo::relation(&to_sub, name)
                .optional()
                .back_link(&to_base),
        );
    }
}

fn validate_relations(models: &BTreeMap<String, ModelInfo>) -> Result<()> {
    for model in models.values() {
        for field in model.fields.values().filter(|f| f.is_data_model) {
            let Some(target) = models.get(&field.field_type) else {
                return Err(SchemaError::UnknownRelationTarget {
                    model: model.name.clone(),
                    field: field.name.clone(),
                    target: field.field_type.clone(),
                }
                .into());
            };
            if let Some(back_link) = &field.back_link {
                if !target.fields.contains_key(back_link) {
                    return Err(SchemaError::InvalidBackLink {
                        model: model.name.clone(),
                        field: field.name.clone(),
                        back_link: back_link.clone(),
                    }
                    .into());
                }
            }
        }
    }
    Ok(())
}

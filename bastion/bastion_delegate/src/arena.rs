//! Assembly of hierarchy rows into flat entities.
//!
//! A read through the hierarchy returns one nested object per level, linked
//! by the synthetic relations. [`HierarchyArena`] flattens that nesting into
//! per-level rows connected by index, then [`HierarchyArena::assemble`]
//! merges a row with its bases (merge-up) and with the concrete sub-type
//! named by each discriminator (merge-down).

use bastion_core::meta::{is_aux_relation, ModelMeta};
use serde_json::{Map, Value};

/// Fields one hierarchy level contributed to an entity.
#[derive(Debug, Clone)]
struct LevelRow {
    model: String,
    fields: Map<String, Value>,
    base: Option<usize>,
    subs: Vec<usize>,
}

/// Per-level rows of fetched entities.
#[derive(Debug)]
pub struct HierarchyArena<'m> {
    meta: &'m ModelMeta,
    rows: Vec<LevelRow>,
}

impl<'m> HierarchyArena<'m> {
    pub fn new(meta: &'m ModelMeta) -> Self {
        Self {
            meta,
            rows: Vec::new(),
        }
    }

    /// Number of level rows held.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Split a fetched entity of `model` into level rows.
    ///
    /// Entities reached through ordinary relations are assembled in place.
    ///
    /// # Returns
    ///
    /// The index of the entity's own level, or `None` if it is not an object.
    pub fn insert(&mut self, model: &str, entity: Value) -> Option<usize> {
        let Value::Object(map) = entity else {
            return None;
        };
        let index = self.rows.len();
        self.rows.push(LevelRow {
            model: model.to_string(),
            fields: Map::new(),
            base: None,
            subs: Vec::new(),
        });

        let meta = self.meta;
        let mut fields = Map::new();
        for (name, value) in map {
            let relation = meta.field(model, &name).filter(|f| f.is_data_model);
            match relation {
                Some(field) if is_aux_relation(&name) => {
                    if let Some(linked) = self.insert(&field.field_type, value) {
                        if field.is_relation_owner {
                            self.rows[index].base = Some(linked);
                            self.rows[linked].subs.push(index);
                        } else {
                            self.rows[index].subs.push(linked);
                            self.rows[linked].base = Some(index);
                        }
                    }
                }
                Some(field) => {
                    fields.insert(name, assemble_hierarchy(meta, &field.field_type, value));
                }
                None => {
                    fields.insert(name, value);
                }
            }
        }
        self.rows[index].fields = fields;
        Some(index)
    }

    /// The concrete sub-type row below `index`, chosen by the discriminator.
    fn concrete_sub(&self, index: usize) -> Option<usize> {
        let row = &self.rows[index];
        let discriminator = self
            .meta
            .model(&row.model)
            .and_then(|m| m.discriminator.as_deref());
        match discriminator.and_then(|d| row.fields.get(d)).and_then(Value::as_str) {
            Some(type_name) => row
                .subs
                .iter()
                .copied()
                .find(|s| self.rows[*s].model == type_name),
            // Discriminator not fetched, take the only sub-type row present
            None if row.subs.len() == 1 => row.subs.first().copied(),
            None => None,
        }
    }

    /// Merge the level at `index` with its bases and concrete sub-types.
    pub fn assemble(&self, index: usize) -> Map<String, Value> {
        let mut out = self.rows[index].fields.clone();

        let mut base = self.rows[index].base;
        while let Some(b) = base {
            for (name, value) in &self.rows[b].fields {
                out.entry(name.clone()).or_insert_with(|| value.clone());
            }
            base = self.rows[b].base;
        }

        let mut sub = self.concrete_sub(index);
        while let Some(s) = sub {
            for (name, value) in &self.rows[s].fields {
                out.entry(name.clone()).or_insert_with(|| value.clone());
            }
            sub = self.concrete_sub(s);
        }
        out
    }
}

/// Assemble a fetched value of `model` (an entity, a list of entities, or
/// `null`) into flat entities.
pub fn assemble_hierarchy(meta: &ModelMeta, model: &str, value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| assemble_hierarchy(meta, model, item))
                .collect(),
        ),
        Value::Object(_) => {
            let mut arena = HierarchyArena::new(meta);
            match arena.insert(model, value) {
                Some(index) => Value::Object(arena.assemble(index)),
                None => Value::Null,
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::tests::asset_meta;
    use serde_json::json;

    #[test]
    fn test_merge_up_and_down() {
        let meta = asset_meta();
        let fetched = json!({
            "id": 1,
            "assetType": "Video",
            "ownerId": null,
            "delegate_aux_video": {
                "id": 1,
                "duration": 100,
                "videoType": "RatedVideo",
                "delegate_aux_ratedVideo": { "id": 1, "rating": 5 }
            }
        });
        let mut arena = HierarchyArena::new(&meta);
        let index = arena.insert("Asset", fetched).unwrap();
        assert_eq!(arena.len(), 3);
        assert_eq!(
            Value::Object(arena.assemble(index)),
            json!({
                "id": 1,
                "assetType": "Video",
                "ownerId": null,
                "duration": 100,
                "videoType": "RatedVideo",
                "rating": 5
            })
        );

        let fetched = json!({
            "id": 2,
            "rating": 3,
            "delegate_aux_video": {
                "id": 2,
                "duration": 7,
                "delegate_aux_asset": { "id": 2, "assetType": "Video" }
            }
        });
        assert_eq!(
            assemble_hierarchy(&meta, "RatedVideo", fetched),
            json!({ "id": 2, "rating": 3, "duration": 7, "assetType": "Video" })
        );
    }

    #[test]
    fn test_discriminator_selects_sub_type() {
        let meta = asset_meta();
        // A plain video: the sub-type relation is fetched but empty
        let fetched = json!({
            "id": 3,
            "assetType": "Video",
            "delegate_aux_video": {
                "id": 3,
                "duration": 1,
                "videoType": "Video",
                "delegate_aux_ratedVideo": null
            }
        });
        assert_eq!(
            assemble_hierarchy(&meta, "Asset", fetched),
            json!({ "id": 3, "assetType": "Video", "duration": 1, "videoType": "Video" })
        );
    }

    #[test]
    fn test_nested_relations_are_assembled() {
        let meta = asset_meta();
        let fetched = json!({
            "id": 1,
            "assets": [
                { "id": 4, "assetType": "Video", "delegate_aux_video": { "id": 4, "duration": 9, "videoType": "Video" } }
            ]
        });
        assert_eq!(
            assemble_hierarchy(&meta, "User", fetched),
            json!({
                "id": 1,
                "assets": [{ "id": 4, "assetType": "Video", "duration": 9, "videoType": "Video" }]
            })
        );
        assert_eq!(assemble_hierarchy(&meta, "User", Value::Null), Value::Null);
    }
}

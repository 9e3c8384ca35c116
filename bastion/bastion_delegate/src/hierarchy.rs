//! Rewriting of query arguments across hierarchy levels.
//!
//! A sub-type stores only its own fields. Fields inherited from a base live
//! in the base's table and are reached through the synthetic relation
//! `delegate_aux_<base>`. The functions here move such fields under that
//! relation, level by level, until every field sits on the model that
//! stores it.

use bastion_core::error::QueryError;
use bastion_core::meta::{aux_relation_name, is_aux_relation, FieldInfo, ModelMeta, UPDATED_AT_ATTRIBUTE};
use bastion_core::query::{enumerate, is_requested};
use bastion_core::Result;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};

fn now() -> Value {
    Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Whether `field` of `model` is stored on one of its bases.
pub fn is_inherited(meta: &ModelMeta, model: &str, field: &str) -> bool {
    meta.base_model(model).is_some()
        && meta
            .field(model, field)
            .map(|f| f.inherited_from.is_some())
            .unwrap_or(false)
}

/// Whether a filter refers to a field stored on a base model, at this level
/// or through `AND`/`OR`/`NOT`.
pub fn touches_inherited(meta: &ModelMeta, model: &str, filter: &Value) -> bool {
    let Value::Object(map) = filter else {
        return false;
    };
    map.iter().any(|(key, value)| match key.as_str() {
        "AND" | "OR" | "NOT" => enumerate(value)
            .into_iter()
            .any(|clause| touches_inherited(meta, model, clause)),
        _ => is_inherited(meta, model, key),
    })
}

fn clauses(meta: &ModelMeta, model: &str, value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| inject_where_hierarchy(meta, model, item))
                .collect(),
        ),
        other => inject_where_hierarchy(meta, model, other),
    }
}

fn relation_filter(meta: &ModelMeta, field: &FieldInfo, value: &Value) -> Value {
    let target = field.field_type.as_str();
    let Value::Object(map) = value else {
        return value.clone();
    };
    let keyed: &[&str] = if field.is_array {
        &["some", "every", "none"]
    } else {
        &["is", "isNot"]
    };
    if !map.is_empty() && map.keys().all(|k| keyed.contains(&k.as_str())) {
        let rewritten = map
            .iter()
            .map(|(op, condition)| (op.clone(), inject_where_hierarchy(meta, target, condition)))
            .collect();
        return Value::Object(rewritten);
    }
    if field.is_array {
        value.clone()
    } else {
        inject_where_hierarchy(meta, target, value)
    }
}

/// Relocate filter conditions on inherited fields under the relation to the
/// base that stores them, recursively up the chain.
///
/// Relation filters are rewritten for the related model as well.
pub fn inject_where_hierarchy(meta: &ModelMeta, model: &str, filter: &Value) -> Value {
    let Value::Object(map) = filter else {
        return filter.clone();
    };
    let mut out = Map::new();
    let mut base_filter = Map::new();
    for (key, value) in map {
        if matches!(key.as_str(), "AND" | "OR" | "NOT") {
            out.insert(key.clone(), clauses(meta, model, value));
            continue;
        }
        match meta.field(model, key) {
            Some(_) if is_inherited(meta, model, key) => {
                base_filter.insert(key.clone(), value.clone());
            }
            Some(field) if field.is_data_model && !is_aux_relation(key) => {
                out.insert(key.clone(), relation_filter(meta, field, value));
            }
            _ => {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    if let Some(base) = meta.base_model(model) {
        if !base_filter.is_empty() {
            out.insert(
                aux_relation_name(&base.name),
                inject_where_hierarchy(meta, &base.name, &Value::Object(base_filter)),
            );
        }
    }
    Value::Object(out)
}

/// Relocate `orderBy` entries on inherited fields the same way as filters.
pub fn inject_order_by_hierarchy(meta: &ModelMeta, model: &str, order_by: &Value) -> Value {
    let map = match order_by {
        Value::Array(items) => {
            return Value::Array(
                items
                    .iter()
                    .map(|item| inject_order_by_hierarchy(meta, model, item))
                    .collect(),
            )
        }
        Value::Object(map) => map,
        other => return other.clone(),
    };
    let mut out = Map::new();
    let mut base_order = Map::new();
    for (key, direction) in map {
        match meta.field(model, key) {
            Some(_) if is_inherited(meta, model, key) => {
                base_order.insert(key.clone(), direction.clone());
            }
            Some(field) if field.is_to_one() && direction.is_object() => {
                out.insert(
                    key.clone(),
                    inject_order_by_hierarchy(meta, &field.field_type, direction),
                );
            }
            _ => {
                out.insert(key.clone(), direction.clone());
            }
        }
    }
    if let Some(base) = meta.base_model(model) {
        if !base_order.is_empty() {
            out.insert(
                aux_relation_name(&base.name),
                inject_order_by_hierarchy(meta, &base.name, &Value::Object(base_order)),
            );
        }
    }
    Value::Object(out)
}

fn relation_spec(meta: &ModelMeta, target: &str, spec: &Value) -> Value {
    match spec {
        Value::Object(_) => inject_read_hierarchy(meta, target, spec),
        _ if is_requested(spec) => {
            let rewritten = inject_read_hierarchy(meta, target, &json!({}));
            if rewritten.as_object().map(Map::is_empty).unwrap_or(true) {
                spec.clone()
            } else {
                rewritten
            }
        }
        _ => spec.clone(),
    }
}

fn select_hierarchy(meta: &ModelMeta, model: &str, select: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    let mut base_select = Map::new();
    for (name, spec) in select {
        match meta.field(model, name) {
            Some(_) if is_inherited(meta, model, name) => {
                base_select.insert(name.clone(), spec.clone());
            }
            Some(field) if field.is_data_model && !is_aux_relation(name) => {
                out.insert(name.clone(), relation_spec(meta, &field.field_type, spec));
            }
            _ => {
                out.insert(name.clone(), spec.clone());
            }
        }
    }
    // The concrete type of a row is needed to assemble it
    if let Some(discriminator) = meta.model(model).and_then(|m| m.discriminator.as_ref()) {
        out.entry(discriminator.clone()).or_insert(Value::Bool(true));
    }
    if let Some(base) = meta.base_model(model) {
        if !base_select.is_empty() {
            out.insert(
                aux_relation_name(&base.name),
                json!({ "select": select_hierarchy(meta, &base.name, &base_select) }),
            );
        }
    }
    out
}

fn include_arg(include: Map<String, Value>) -> Value {
    if include.is_empty() {
        Value::Bool(true)
    } else {
        json!({ "include": include })
    }
}

fn include_hierarchy(
    meta: &ModelMeta,
    model: &str,
    include: Option<&Map<String, Value>>,
    up: bool,
    down: bool,
) -> Map<String, Value> {
    let mut out = Map::new();
    let mut base_include = Map::new();
    for (name, spec) in include.into_iter().flatten() {
        match meta.field(model, name) {
            Some(_) if up && is_inherited(meta, model, name) => {
                base_include.insert(name.clone(), spec.clone());
            }
            Some(field) if field.is_data_model && !is_aux_relation(name) => {
                out.insert(name.clone(), relation_spec(meta, &field.field_type, spec));
            }
            _ => {
                out.insert(name.clone(), spec.clone());
            }
        }
    }
    if up {
        if let Some(base) = meta.base_model(model) {
            let nested = include_hierarchy(meta, &base.name, Some(&base_include), true, false);
            out.insert(aux_relation_name(&base.name), include_arg(nested));
        }
    }
    if down {
        for sub in meta.sub_models(model) {
            let nested = include_hierarchy(meta, sub, None, false, true);
            out.insert(aux_relation_name(sub), include_arg(nested));
        }
    }
    out
}

/// Rewrite the arguments of a read so the whole hierarchy of `model` is
/// fetched in one query.
///
/// `where`, `cursor` and `orderBy` are relocated. With an explicit `select`,
/// inherited fields are selected through the base relations. Otherwise every
/// base level is included upward and every sub-type downward, and inherited
/// relations in `include` move to the level that owns them.
pub fn inject_read_hierarchy(meta: &ModelMeta, model: &str, args: &Value) -> Value {
    let mut out = args.as_object().cloned().unwrap_or_default();
    for key in ["where", "cursor"] {
        if let Some(filter) = out.remove(key) {
            out.insert(key.to_string(), inject_where_hierarchy(meta, model, &filter));
        }
    }
    if let Some(order_by) = out.remove("orderBy") {
        out.insert(
            "orderBy".to_string(),
            inject_order_by_hierarchy(meta, model, &order_by),
        );
    }
    let include = out.remove("include");
    match out.remove("select") {
        Some(Value::Object(select)) => {
            out.insert(
                "select".to_string(),
                Value::Object(select_hierarchy(meta, model, &select)),
            );
        }
        _ => {
            let include = include_hierarchy(
                meta,
                model,
                include.as_ref().and_then(Value::as_object),
                true,
                true,
            );
            if !include.is_empty() {
                out.insert("include".to_string(), Value::Object(include));
            }
        }
    }
    Value::Object(out)
}

/// Fail if a write payload sets a discriminator.
pub fn reject_discriminator_writes(meta: &ModelMeta, model: &str, data: &Value) -> Result<()> {
    for item in enumerate(data) {
        let Some(map) = item.as_object() else {
            continue;
        };
        if let Some(field) = map.keys().find(|k| meta.is_discriminator(model, k)) {
            return Err(QueryError::DiscriminatorWrite {
                model: model.to_string(),
                field: field.clone(),
            }
            .into());
        }
    }
    Ok(())
}

/// Nest a create payload level by level.
///
/// Fields stored on the base, including caller-supplied ids, move into a
/// `create` under the base relation. Every discriminator on the way up is
/// set to the name of the level below it, and a concrete model's own
/// discriminator to its own name.
pub fn ensure_base_create_hierarchy(meta: &ModelMeta, model: &str, data: &Value) -> Value {
    let mut data = data.clone();
    if let (Some(info), Value::Object(map)) = (meta.model(model), &mut data) {
        if let Some(discriminator) = info.discriminator.as_ref().filter(|_| !info.is_delegate) {
            map.entry(discriminator.clone())
                .or_insert_with(|| Value::String(model.to_string()));
        }
    }
    nest_base_create(meta, model, &data)
}

fn nest_base_create(meta: &ModelMeta, model: &str, data: &Value) -> Value {
    let (Some(base), Value::Object(map)) = (meta.base_model(model), data) else {
        return data.clone();
    };
    let mut own = Map::new();
    let mut base_data = Map::new();
    for (name, value) in map {
        let base_id = meta
            .field(&base.name, name)
            .map(|f| f.is_id)
            .unwrap_or(false);
        if base_id || is_inherited(meta, model, name) {
            base_data.insert(name.clone(), value.clone());
        } else {
            own.insert(name.clone(), value.clone());
        }
    }
    if let Some(discriminator) = &base.discriminator {
        base_data.insert(discriminator.clone(), Value::String(model.to_string()));
    }
    let nested = nest_base_create(meta, &base.name, &Value::Object(base_data));
    own.insert(aux_relation_name(&base.name), json!({ "create": nested }));
    Value::Object(own)
}

/// Nest an update payload level by level.
///
/// Fields stored on a base move into an `update` under the base relation.
/// `@updatedAt` fields of every base level are stamped, so a change to
/// sub-type fields alone still bumps them.
pub fn relocate_update_hierarchy(meta: &ModelMeta, model: &str, data: &Value) -> Value {
    let (Some(base), Value::Object(map)) = (meta.base_model(model), data) else {
        return data.clone();
    };
    if map.is_empty() {
        return data.clone();
    }
    let mut own = Map::new();
    let mut base_data = Map::new();
    for (name, value) in map {
        if is_inherited(meta, model, name) {
            base_data.insert(name.clone(), value.clone());
        } else {
            own.insert(name.clone(), value.clone());
        }
    }
    for field in base.fields.values() {
        if field.has_attribute(UPDATED_AT_ATTRIBUTE) && !base_data.contains_key(&field.name) {
            base_data.insert(field.name.clone(), now());
        }
    }
    if !base_data.is_empty() {
        let nested = relocate_update_hierarchy(meta, &base.name, &Value::Object(base_data));
        own.insert(aux_relation_name(&base.name), json!({ "update": nested }));
    }
    Value::Object(own)
}

/// Whether any base level of `model` has `@updatedAt` fields.
pub fn bases_track_updates(meta: &ModelMeta, model: &str) -> bool {
    meta.base_chain(model).iter().any(|base| {
        base.fields
            .values()
            .any(|f| f.has_attribute(UPDATED_AT_ATTRIBUTE))
    })
}

/// Reject aggregation expressions over inherited fields.
///
/// Covers `_count`/`_sum`/`_avg`/`_min`/`_max` selections, the `by` of a
/// `groupBy` and the `select` of a `count`.
pub fn check_aggregation(meta: &ModelMeta, model: &str, args: &Value) -> Result<()> {
    let reject = |field: &str| -> Result<()> {
        if is_inherited(meta, model, field) {
            return Err(QueryError::InheritedAggregation {
                model: model.to_string(),
                field: field.to_string(),
            }
            .into());
        }
        Ok(())
    };
    for key in ["_count", "_sum", "_avg", "_min", "_max", "select"] {
        if let Some(Value::Object(fields)) = args.get(key) {
            for name in fields.keys() {
                reject(name)?;
            }
        }
    }
    if let Some(by) = args.get("by") {
        for name in enumerate(by).into_iter().filter_map(Value::as_str) {
            reject(name)?;
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bastion_core::meta::{FieldInfo, ModelInfo};

    pub(crate) fn asset_meta() -> ModelMeta {
        ModelMeta::new(vec![
            ModelInfo::new("User")
                .field(FieldInfo::scalar("id", "Int").id().autoincrement())
                .field(FieldInfo::relation("assets", "Asset").array().back_link("owner")),
            ModelInfo::new("Asset")
                .delegate("assetType")
                .field(FieldInfo::scalar("id", "Int").id().autoincrement())
                .field(FieldInfo::scalar("assetType", "String"))
                .field(FieldInfo::scalar("updatedAt", "DateTime").updated_at())
                .field(
                    FieldInfo::relation("owner", "User")
                        .optional()
                        .owner(&[("id", "ownerId")])
                        .back_link("assets"),
                )
                .field(FieldInfo::foreign_key("ownerId", "Int", "owner").optional()),
            ModelInfo::new("Video")
                .extends("Asset")
                .discriminated_by("videoType")
                .field(FieldInfo::scalar("id", "Int").id())
                .field(FieldInfo::scalar("duration", "Int"))
                .field(FieldInfo::scalar("videoType", "String")),
            ModelInfo::new("RatedVideo")
                .extends("Video")
                .field(FieldInfo::scalar("id", "Int").id())
                .field(FieldInfo::scalar("rating", "Int")),
        ])
        .unwrap()
    }

    #[test]
    fn test_where_relocation() {
        let meta = asset_meta();
        let filter = inject_where_hierarchy(
            &meta,
            "RatedVideo",
            &json!({ "rating": 5, "duration": { "gt": 10 }, "ownerId": 1 }),
        );
        assert_eq!(
            filter,
            json!({
                "rating": 5,
                "delegate_aux_video": {
                    "duration": { "gt": 10 },
                    "delegate_aux_asset": { "ownerId": 1 }
                }
            })
        );

        let filter = inject_where_hierarchy(
            &meta,
            "Video",
            &json!({ "OR": [{ "duration": 1 }, { "assetType": "Video" }], "NOT": { "owner": { "is": { "id": 2 } } } }),
        );
        assert_eq!(
            filter,
            json!({
                "OR": [
                    { "duration": 1 },
                    { "delegate_aux_asset": { "assetType": "Video" } }
                ],
                "NOT": { "delegate_aux_asset": { "owner": { "is": { "id": 2 } } } }
            })
        );
        assert!(touches_inherited(&meta, "Video", &json!({ "AND": [{ "ownerId": 1 }] })));
        assert!(!touches_inherited(&meta, "Video", &json!({ "id": 1, "duration": 3 })));
        assert!(!touches_inherited(&meta, "Asset", &json!({ "ownerId": 1 })));
    }

    #[test]
    fn test_relation_filters_are_rewritten_for_the_target() {
        let meta = ModelMeta::new(vec![
            ModelInfo::new("Asset")
                .delegate("assetType")
                .field(FieldInfo::scalar("id", "Int").id().autoincrement())
                .field(FieldInfo::scalar("assetType", "String"))
                .field(FieldInfo::scalar("title", "String")),
            ModelInfo::new("Video")
                .extends("Asset")
                .field(FieldInfo::scalar("id", "Int").id())
                .field(FieldInfo::relation("playlist", "Playlist").optional().owner(&[("id", "playlistId")]).back_link("videos"))
                .field(FieldInfo::foreign_key("playlistId", "Int", "playlist").optional()),
            ModelInfo::new("Playlist")
                .field(FieldInfo::scalar("id", "Int").id())
                .field(FieldInfo::relation("videos", "Video").array().back_link("playlist")),
        ])
        .unwrap();
        let filter = inject_where_hierarchy(
            &meta,
            "Playlist",
            &json!({ "videos": { "some": { "title": "intro" } } }),
        );
        assert_eq!(
            filter,
            json!({ "videos": { "some": { "delegate_aux_asset": { "title": "intro" } } } })
        );
    }

    #[test]
    fn test_order_by_relocation() {
        let meta = asset_meta();
        let order = inject_order_by_hierarchy(
            &meta,
            "RatedVideo",
            &json!([{ "rating": "desc" }, { "duration": "asc" }]),
        );
        assert_eq!(
            order,
            json!([{ "rating": "desc" }, { "delegate_aux_video": { "duration": "asc" } }])
        );
    }

    #[test]
    fn test_full_hierarchy_is_included() {
        let meta = asset_meta();
        let args = inject_read_hierarchy(&meta, "Video", &json!({ "include": { "owner": true } }));
        assert_eq!(
            args,
            json!({
                "include": {
                    "delegate_aux_asset": { "include": { "owner": true } },
                    "delegate_aux_ratedVideo": true
                }
            })
        );

        let args = inject_read_hierarchy(&meta, "Asset", &json!({ "where": { "ownerId": 1 } }));
        assert_eq!(
            args,
            json!({
                "where": { "ownerId": 1 },
                "include": {
                    "delegate_aux_video": { "include": { "delegate_aux_ratedVideo": true } }
                }
            })
        );

        // Relations into a hierarchy fetch the related hierarchy as well
        let args = inject_read_hierarchy(&meta, "User", &json!({ "include": { "assets": true } }));
        assert_eq!(
            args["include"]["assets"],
            json!({ "include": { "delegate_aux_video": { "include": { "delegate_aux_ratedVideo": true } } } })
        );
    }

    #[test]
    fn test_select_relocation_keeps_discriminator() {
        let meta = asset_meta();
        let args = inject_read_hierarchy(
            &meta,
            "RatedVideo",
            &json!({ "select": { "id": true, "duration": true, "ownerId": true } }),
        );
        assert_eq!(
            args,
            json!({
                "select": {
                    "id": true,
                    "delegate_aux_video": {
                        "select": {
                            "duration": true,
                            "videoType": true,
                            "delegate_aux_asset": { "select": { "ownerId": true, "assetType": true } }
                        }
                    }
                }
            })
        );
        let args = inject_read_hierarchy(&meta, "Asset", &json!({ "select": { "id": true } }));
        assert_eq!(args, json!({ "select": { "id": true, "assetType": true } }));
    }

    #[test]
    fn test_create_payload_is_nested_per_level() {
        let meta = asset_meta();
        let data = ensure_base_create_hierarchy(
            &meta,
            "RatedVideo",
            &json!({ "id": 7, "rating": 5, "duration": 100, "owner": { "connect": { "id": 1 } } }),
        );
        assert_eq!(
            data,
            json!({
                "rating": 5,
                "delegate_aux_video": {
                    "create": {
                        "duration": 100,
                        "videoType": "RatedVideo",
                        "delegate_aux_asset": {
                            "create": {
                                "id": 7,
                                "assetType": "Video",
                                "owner": { "connect": { "id": 1 } }
                            }
                        }
                    }
                }
            })
        );
        let data = ensure_base_create_hierarchy(&meta, "User", &json!({ "id": 1 }));
        assert_eq!(data, json!({ "id": 1 }));

        let data = ensure_base_create_hierarchy(&meta, "Video", &json!({ "duration": 3 }));
        assert_eq!(data["videoType"], json!("Video"));
        assert_eq!(data["delegate_aux_asset"]["create"]["assetType"], json!("Video"));
    }

    #[test]
    fn test_update_payload_bumps_base_timestamps() {
        let meta = asset_meta();
        let data = relocate_update_hierarchy(&meta, "RatedVideo", &json!({ "rating": 4 }));
        assert_eq!(data["rating"], json!(4));
        let asset = &data["delegate_aux_video"]["update"]["delegate_aux_asset"]["update"];
        assert!(asset["updatedAt"].is_string());
        assert!(data["delegate_aux_video"]["update"].get("updatedAt").is_none());

        let data = relocate_update_hierarchy(&meta, "Video", &json!({ "ownerId": { "set": null } }));
        assert_eq!(data["delegate_aux_asset"]["update"]["ownerId"], json!({ "set": null }));
        assert!(bases_track_updates(&meta, "Video"));
        assert!(!bases_track_updates(&meta, "Asset"));
    }

    #[test]
    fn test_discriminator_and_aggregation_guards() {
        let meta = asset_meta();
        let err = reject_discriminator_writes(&meta, "RatedVideo", &json!({ "videoType": "x" })).unwrap_err();
        assert!(matches!(
            err,
            bastion_core::Error::Query(QueryError::DiscriminatorWrite { ref field, .. }) if field == "videoType"
        ));
        assert!(reject_discriminator_writes(&meta, "RatedVideo", &json!([{ "rating": 1 }])).is_ok());

        let err = check_aggregation(&meta, "RatedVideo", &json!({ "_sum": { "duration": true } })).unwrap_err();
        assert!(matches!(
            err,
            bastion_core::Error::Query(QueryError::InheritedAggregation { .. })
        ));
        assert!(check_aggregation(&meta, "RatedVideo", &json!({ "by": ["ownerId"] })).is_err());
        assert!(check_aggregation(&meta, "RatedVideo", &json!({ "_avg": { "rating": true }, "by": "rating" })).is_ok());
        assert!(check_aggregation(&meta, "Asset", &json!({ "_max": { "ownerId": true } })).is_ok());
    }
}

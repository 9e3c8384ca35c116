//! Nested writes and referential actions.

use crate::filter::View;
use crate::state::{ensure_physical, is_physical, query_field, values_equal, Row, State};
use bastion_core::error::{Result, StorageError};
use bastion_core::meta::{
    FieldDefault, FieldInfo, ModelMeta, ReferentialAction, UPDATED_AT_ATTRIBUTE,
};
use bastion_core::query::enumerate;
use bastion_core::visitor::is_wrapped_update;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use uuid::Uuid;

fn invalid(detail: String) -> bastion_core::Error {
    StorageError::InvalidQuery(detail).into()
}

fn not_found(model: &str, detail: String) -> bastion_core::Error {
    StorageError::RecordNotFound {
        model: model.to_string(),
        detail,
    }
    .into()
}

fn now() -> Value {
    Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Mutable access to a database state.
pub(crate) struct Engine<'a> {
    pub meta: &'a ModelMeta,
    pub state: &'a mut State,
}

impl<'a> Engine<'a> {
    pub fn new(meta: &'a ModelMeta, state: &'a mut State) -> Self {
        Self { meta, state }
    }

    pub fn view(&self) -> View<'_> {
        View::new(self.meta, self.state)
    }

    fn row(&self, model: &str, key: u64) -> Result<Row> {
        self.view()
            .row(model, key)
            .cloned()
            .ok_or_else(|| not_found(model, format!("row {} no longer exists", key)))
    }

    fn find_unique(&self, model: &str, filter: &Value) -> Result<Option<u64>> {
        Ok(self.view().find(model, filter)?.into_iter().next())
    }

    fn require_unique(&self, model: &str, filter: &Value) -> Result<u64> {
        self.find_unique(model, filter)?
            .ok_or_else(|| not_found(model, format!("no row matches {}", filter)))
    }

    fn set_columns(&mut self, model: &str, key: u64, values: &Map<String, Value>) -> Result<()> {
        let row = self
            .state
            .table_mut(model)
            .rows
            .get_mut(&key)
            .ok_or_else(|| not_found(model, format!("row {} no longer exists", key)))?;
        for (k, v) in values {
            row.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    /// Foreign-key values that make a `target` row point at `row` through the
    /// non-owning relation `field`.
    fn back_reference(&self, model: &str, row: &Row, field: &FieldInfo) -> Result<Map<String, Value>> {
        let back_link = field
            .back_link
            .as_deref()
            .ok_or_else(|| invalid(format!("relation {}.{} has no back link", model, field.name)))?;
        let back = query_field(self.meta, &field.field_type, back_link)?;
        let mapping = back.foreign_key_mapping.as_ref().ok_or_else(|| {
            invalid(format!("relation {}.{} owns no foreign key", field.field_type, back_link))
        })?;
        let mut values = Map::new();
        for (referenced, fk) in mapping {
            values.insert(fk.clone(), row.get(referenced).cloned().unwrap_or(Value::Null));
        }
        Ok(values)
    }

    /// Foreign-key values that make `row` point at `target_row` through the owning relation `field`.
    fn owner_reference(&self, field: &FieldInfo, target_row: &Row) -> Map<String, Value> {
        let mut values = Map::new();
        if let Some(mapping) = &field.foreign_key_mapping {
            for (referenced, fk) in mapping {
                values.insert(
                    fk.clone(),
                    target_row.get(referenced).cloned().unwrap_or(Value::Null),
                );
            }
        }
        values
    }

    fn cleared_reference(&self, model: &str, field: &FieldInfo, fks: &Map<String, Value>) -> Result<Map<String, Value>> {
        let mut cleared = Map::new();
        for fk in fks.keys() {
            let fk_field = query_field(self.meta, model, fk)?;
            if !fk_field.is_optional {
                return Err(StorageError::RelationViolation {
                    model: model.to_string(),
                    detail: format!("cannot disconnect required relation {}", field.name),
                }
                .into());
            }
            cleared.insert(fk.clone(), Value::Null);
        }
        Ok(cleared)
    }

    fn check_unique(&self, model: &str, row: &Row, exclude: Option<u64>) -> Result<()> {
        let view = self.view();
        for constraint in self.meta.unique_constraints(model) {
            let values: Vec<&Value> = constraint
                .fields
                .iter()
                .map(|f| row.get(f).unwrap_or(&Value::Null))
                .collect();
            if values.iter().any(|v| v.is_null()) {
                continue;
            }
            for key in view.keys(model) {
                if Some(key) == exclude {
                    continue;
                }
                let Some(other) = view.row(model, key) else {
                    continue;
                };
                let clash = constraint
                    .fields
                    .iter()
                    .zip(values.iter())
                    .all(|(f, v)| other.get(f).map(|o| values_equal(o, v)).unwrap_or(false));
                if clash {
                    return Err(StorageError::UniqueConstraint {
                        model: model.to_string(),
                        fields: constraint.fields.clone(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Insert a row with its nested writes.
    ///
    /// # Arguments
    ///
    /// * `model` - Model to insert into.
    /// * `data` - Create payload.
    /// * `extra` - Column values forced onto the row, used to link it to a parent.
    ///
    /// # Returns
    ///
    /// The key of the inserted row.
    pub fn create(&mut self, model: &str, data: &Value, extra: &Map<String, Value>) -> Result<u64> {
        let meta = self.meta;
        let info = meta.require_model(model)?;
        let data = data
            .as_object()
            .ok_or_else(|| invalid(format!("create data for {} must be an object", model)))?;
        let mut row = Row::new();

        // Owning relations first so their foreign keys are known
        for (name, value) in data {
            let field = query_field(meta, model, name)?;
            if field.is_data_model && field.is_relation_owner {
                if let Some(target_key) = self.resolve_owned_for_create(model, field, value)? {
                    let target_row = self.row(&field.field_type, target_key)?;
                    row.extend(self.owner_reference(field, &target_row));
                }
            }
        }

        for (name, value) in data {
            let field = query_field(meta, model, name)?;
            if field.is_data_model {
                continue;
            }
            ensure_physical(model, field)?;
            let value = match value.as_object().and_then(|m| m.get("set")) {
                Some(inner) if field.field_type != "Json" => inner.clone(),
                _ => value.clone(),
            };
            row.insert(name.clone(), value);
        }
        row.extend(extra.clone());

        for field in info.fields.values().filter(|f| is_physical(f)) {
            if row.contains_key(&field.name) {
                continue;
            }
            let value = match &field.default {
                Some(FieldDefault::Autoincrement) => json!(self.state.next_sequence(model, &field.name)),
                Some(FieldDefault::Uuid) => Value::String(Uuid::new_v4().to_string()),
                Some(FieldDefault::Now) => now(),
                Some(FieldDefault::Value(v)) => v.clone(),
                None if field.has_attribute(UPDATED_AT_ATTRIBUTE) => now(),
                None if field.is_array => json!([]),
                None if field.is_optional => Value::Null,
                None => {
                    return Err(invalid(format!(
                        "argument `{}` is missing for create on {}",
                        field.name, model
                    )))
                }
            };
            row.insert(field.name.clone(), value);
        }

        self.check_unique(model, &row, None)?;
        let key = self.state.table_mut(model).insert(row);

        for (name, value) in data {
            let field = query_field(meta, model, name)?;
            if field.is_data_model && !field.is_relation_owner {
                self.apply_relation_ops(model, key, field, value)?;
            }
        }
        Ok(key)
    }

    fn resolve_owned_for_create(&mut self, model: &str, field: &FieldInfo, ops: &Value) -> Result<Option<u64>> {
        let target = field.field_type.clone();
        let ops = ops
            .as_object()
            .ok_or_else(|| invalid(format!("relation payload {}.{} must be an object", model, field.name)))?;
        let mut resolved = None;
        for (op, arg) in ops {
            resolved = Some(match op.as_str() {
                "create" => self.create(&target, arg, &Map::new())?,
                "connect" => self.require_unique(&target, arg)?,
                "connectOrCreate" => match self.find_unique(&target, &arg["where"])? {
                    Some(key) => key,
                    None => self.create(&target, &arg["create"], &Map::new())?,
                },
                other => {
                    return Err(invalid(format!(
                        "'{}' is not allowed in a create of {}.{}",
                        other, model, field.name
                    )))
                }
            });
        }
        Ok(resolved)
    }

    /// Apply an update payload to one row.
    pub fn update_row(&mut self, model: &str, key: u64, data: &Value) -> Result<()> {
        let meta = self.meta;
        let info = meta.require_model(model)?;
        let data = data
            .as_object()
            .ok_or_else(|| invalid(format!("update data for {} must be an object", model)))?;

        let mut scalars = Map::new();
        for (name, value) in data {
            let field = query_field(meta, model, name)?;
            if field.is_data_model {
                if field.is_relation_owner {
                    self.apply_owned_ops(model, key, field, value)?;
                } else {
                    self.apply_relation_ops(model, key, field, value)?;
                }
                continue;
            }
            ensure_physical(model, field)?;
            let current = self.row(model, key)?.get(name).cloned().unwrap_or(Value::Null);
            scalars.insert(name.clone(), apply_scalar_update(field, &current, value)?);
        }

        if !data.is_empty() {
            for field in info.fields.values() {
                if is_physical(field)
                    && field.has_attribute(UPDATED_AT_ATTRIBUTE)
                    && !scalars.contains_key(&field.name)
                {
                    scalars.insert(field.name.clone(), now());
                }
            }
        }

        if !scalars.is_empty() {
            self.set_columns(model, key, &scalars)?;
            let row = self.row(model, key)?;
            self.check_unique(model, &row, Some(key))?;
        }
        Ok(())
    }

    /// Nested operations through a relation whose foreign key lives on this row.
    fn apply_owned_ops(&mut self, model: &str, key: u64, field: &FieldInfo, ops: &Value) -> Result<()> {
        let target = field.field_type.clone();
        let ops = ops
            .as_object()
            .ok_or_else(|| invalid(format!("relation payload {}.{} must be an object", model, field.name)))?;

        for (op, arg) in ops {
            let row = self.row(model, key)?;
            let current = self.view().related(model, &row, field)?.into_iter().next();
            match op.as_str() {
                "create" | "connect" | "connectOrCreate" => {
                    let mut single = Map::new();
                    single.insert(op.clone(), arg.clone());
                    if let Some(target_key) =
                        self.resolve_owned_for_create(model, field, &Value::Object(single))?
                    {
                        let target_row = self.row(&target, target_key)?;
                        let fks = self.owner_reference(field, &target_row);
                        self.set_columns(model, key, &fks)?;
                    }
                }
                "disconnect" => {
                    if matches!(arg, Value::Bool(false)) || current.is_none() {
                        continue;
                    }
                    let fks = self.owner_reference(field, &Row::new());
                    let cleared = self.cleared_reference(model, field, &fks)?;
                    self.set_columns(model, key, &cleared)?;
                }
                "update" => {
                    let target_key = current.ok_or_else(|| {
                        not_found(&target, format!("no {} connected to {}.{}", target, model, field.name))
                    })?;
                    let data = if is_wrapped_update(arg) { &arg["data"] } else { arg };
                    self.update_row(&target, target_key, data)?;
                }
                "upsert" => match current {
                    Some(target_key) => self.update_row(&target, target_key, &arg["update"])?,
                    None => {
                        let target_key = self.create(&target, &arg["create"], &Map::new())?;
                        let target_row = self.row(&target, target_key)?;
                        let fks = self.owner_reference(field, &target_row);
                        self.set_columns(model, key, &fks)?;
                    }
                },
                "delete" => {
                    if matches!(arg, Value::Bool(false)) {
                        continue;
                    }
                    let target_key = current.ok_or_else(|| {
                        not_found(&target, format!("no {} connected to {}.{}", target, model, field.name))
                    })?;
                    self.delete_row(&target, target_key)?;
                }
                other => {
                    return Err(invalid(format!(
                        "unsupported nested operation '{}' on {}.{}",
                        other, model, field.name
                    )))
                }
            }
        }
        Ok(())
    }

    /// Nested operations through a relation whose foreign key lives on the related rows.
    fn apply_relation_ops(&mut self, model: &str, key: u64, field: &FieldInfo, ops: &Value) -> Result<()> {
        let target = field.field_type.clone();
        let ops = ops
            .as_object()
            .ok_or_else(|| invalid(format!("relation payload {}.{} must be an object", model, field.name)))?;
        let row = self.row(model, key)?;
        let link = self.back_reference(model, &row, field)?;

        for (op, arg) in ops {
            let related = {
                let row = self.row(model, key)?;
                self.view().related(model, &row, field)?
            };
            match op.as_str() {
                "create" => {
                    for item in enumerate(arg) {
                        self.create(&target, item, &link)?;
                    }
                }
                "createMany" => {
                    let skip_duplicates = arg
                        .get("skipDuplicates")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    for item in enumerate(arg.get("data").unwrap_or(&Value::Null)) {
                        match self.create(&target, item, &link) {
                            Err(bastion_core::Error::Storage(StorageError::UniqueConstraint { .. }))
                                if skip_duplicates => {}
                            other => {
                                other?;
                            }
                        }
                    }
                }
                "connect" => {
                    for filter in enumerate(arg) {
                        let target_key = self.require_unique(&target, filter)?;
                        if !field.is_array {
                            self.detach_others(&target, field, &related, target_key, &link)?;
                        }
                        self.set_columns(&target, target_key, &link)?;
                    }
                }
                "connectOrCreate" => {
                    for item in enumerate(arg) {
                        match self.find_unique(&target, &item["where"])? {
                            Some(target_key) => self.set_columns(&target, target_key, &link)?,
                            None => {
                                self.create(&target, &item["create"], &link)?;
                            }
                        }
                    }
                }
                "disconnect" => {
                    let victims = if field.is_array {
                        self.related_matching(&target, &related, arg)?
                    } else if matches!(arg, Value::Bool(false)) {
                        Vec::new()
                    } else {
                        related.clone()
                    };
                    let cleared = self.cleared_reference(&target, field, &link)?;
                    for victim in victims {
                        self.set_columns(&target, victim, &cleared)?;
                    }
                }
                "set" => {
                    if !related.is_empty() {
                        let cleared = self.cleared_reference(&target, field, &link)?;
                        for victim in &related {
                            self.set_columns(&target, *victim, &cleared)?;
                        }
                    }
                    for filter in enumerate(arg) {
                        let target_key = self.require_unique(&target, filter)?;
                        self.set_columns(&target, target_key, &link)?;
                    }
                }
                "update" => {
                    if field.is_array {
                        for item in enumerate(arg) {
                            let target_key = self
                                .related_matching(&target, &related, &item["where"])?
                                .into_iter()
                                .next()
                                .ok_or_else(|| {
                                    not_found(&target, format!("no related row matches {}", item["where"]))
                                })?;
                            self.update_row(&target, target_key, &item["data"])?;
                        }
                    } else {
                        let target_key = related.first().copied().ok_or_else(|| {
                            not_found(&target, format!("no {} connected to {}.{}", target, model, field.name))
                        })?;
                        let data = if is_wrapped_update(arg) { &arg["data"] } else { arg };
                        self.update_row(&target, target_key, data)?;
                    }
                }
                "updateMany" => {
                    for item in enumerate(arg) {
                        for target_key in self.related_matching(&target, &related, &item["where"])? {
                            self.update_row(&target, target_key, &item["data"])?;
                        }
                    }
                }
                "upsert" => {
                    for item in enumerate(arg) {
                        let existing = if field.is_array {
                            self.related_matching(&target, &related, &item["where"])?
                                .into_iter()
                                .next()
                        } else {
                            related.first().copied()
                        };
                        match existing {
                            Some(target_key) => self.update_row(&target, target_key, &item["update"])?,
                            None => {
                                self.create(&target, &item["create"], &link)?;
                            }
                        }
                    }
                }
                "delete" => {
                    if field.is_array {
                        for filter in enumerate(arg) {
                            let target_key = self
                                .related_matching(&target, &related, filter)?
                                .into_iter()
                                .next()
                                .ok_or_else(|| not_found(&target, format!("no related row matches {}", filter)))?;
                            self.delete_row(&target, target_key)?;
                        }
                    } else if !matches!(arg, Value::Bool(false)) {
                        let target_key = related.first().copied().ok_or_else(|| {
                            not_found(&target, format!("no {} connected to {}.{}", target, model, field.name))
                        })?;
                        self.delete_row(&target, target_key)?;
                    }
                }
                "deleteMany" => {
                    for filter in enumerate(arg) {
                        for target_key in self.related_matching(&target, &related, filter)? {
                            self.delete_row(&target, target_key)?;
                        }
                    }
                }
                other => {
                    return Err(invalid(format!(
                        "unsupported nested operation '{}' on {}.{}",
                        other, model, field.name
                    )))
                }
            }
        }
        Ok(())
    }

    fn related_matching(&self, target: &str, related: &[u64], filter: &Value) -> Result<Vec<u64>> {
        let view = self.view();
        let mut keys = Vec::new();
        for key in related {
            if let Some(r) = view.row(target, *key) {
                if view.matches(target, r, filter)? {
                    keys.push(*key);
                }
            }
        }
        Ok(keys)
    }

    /// Detach rows previously linked through a to-one non-owning relation.
    fn detach_others(
        &mut self,
        target: &str,
        field: &FieldInfo,
        related: &[u64],
        keep: u64,
        link: &Map<String, Value>,
    ) -> Result<()> {
        let others: Vec<u64> = related.iter().copied().filter(|k| *k != keep).collect();
        if others.is_empty() {
            return Ok(());
        }
        let cleared = self.cleared_reference(target, field, link)?;
        for other in others {
            self.set_columns(target, other, &cleared)?;
        }
        Ok(())
    }

    /// Delete a row, applying the referential actions of rows pointing at it.
    pub fn delete_row(&mut self, model: &str, key: u64) -> Result<()> {
        let Some(row) = self.view().row(model, key).cloned() else {
            return Ok(());
        };
        let meta = self.meta;

        for dependent_model in meta.models() {
            for relation in dependent_model.fields.values() {
                if !relation.is_relation_owner
                    || relation.field_type != model
                    || relation.inherited_from.is_some()
                {
                    continue;
                }
                let Some(mapping) = &relation.foreign_key_mapping else {
                    continue;
                };
                let mut filter = Map::new();
                for (referenced, fk) in mapping {
                    filter.insert(fk.clone(), row.get(referenced).cloned().unwrap_or(Value::Null));
                }
                if filter.values().any(Value::is_null) {
                    continue;
                }
                let dependents = self.view().find(&dependent_model.name, &Value::Object(filter.clone()))?;
                if dependents.is_empty() {
                    continue;
                }

                let optional = mapping.values().all(|fk| {
                    meta.field(&dependent_model.name, fk)
                        .map(|f| f.is_optional)
                        .unwrap_or(false)
                });
                let action = relation.on_delete_action.unwrap_or(if optional {
                    ReferentialAction::SetNull
                } else {
                    ReferentialAction::Restrict
                });
                match action {
                    ReferentialAction::Cascade => {
                        for dependent in dependents {
                            self.delete_row(&dependent_model.name, dependent)?;
                        }
                    }
                    ReferentialAction::SetNull | ReferentialAction::SetDefault => {
                        let cleared =
                            self.cleared_reference(&dependent_model.name, relation, &filter)?;
                        for dependent in dependents {
                            self.set_columns(&dependent_model.name, dependent, &cleared)?;
                        }
                    }
                    ReferentialAction::Restrict | ReferentialAction::NoAction => {
                        return Err(StorageError::RelationViolation {
                            model: model.to_string(),
                            detail: format!(
                                "{} rows of {} still reference this row through {}",
                                dependents.len(),
                                dependent_model.name,
                                relation.name
                            ),
                        }
                        .into());
                    }
                }
            }
        }

        self.state.table_mut(model).rows.remove(&key);
        Ok(())
    }
}

/// Compute the new value of a scalar column from an update payload entry.
fn apply_scalar_update(field: &FieldInfo, current: &Value, update: &Value) -> Result<Value> {
    let Some(ops) = update.as_object() else {
        return Ok(update.clone());
    };
    if field.field_type == "Json" {
        return Ok(update.clone());
    }
    let mut value = current.clone();
    for (op, arg) in ops {
        value = match op.as_str() {
            "set" => arg.clone(),
            "increment" | "decrement" | "multiply" | "divide" => arithmetic(op, &value, arg)?,
            "push" => {
                let mut items = value.as_array().cloned().unwrap_or_default();
                match arg {
                    Value::Array(more) => items.extend(more.iter().cloned()),
                    other => items.push(other.clone()),
                }
                Value::Array(items)
            }
            other => {
                return Err(invalid(format!(
                    "unsupported update operator '{}' on {}",
                    other, field.name
                )))
            }
        };
    }
    Ok(value)
}

fn arithmetic(op: &str, current: &Value, arg: &Value) -> Result<Value> {
    if let (Some(a), Some(b)) = (current.as_i64(), arg.as_i64()) {
        let result = match op {
            "increment" => a.checked_add(b),
            "decrement" => a.checked_sub(b),
            "multiply" => a.checked_mul(b),
            _ => a.checked_div(b),
        };
        if let Some(r) = result {
            return Ok(json!(r));
        }
    }
    match (current.as_f64(), arg.as_f64()) {
        (Some(a), Some(b)) => Ok(json!(match op {
            "increment" => a + b,
            "decrement" => a - b,
            "multiply" => a * b,
            _ => a / b,
        })),
        _ => Err(invalid(format!("'{}' requires numeric operands", op))),
    }
}

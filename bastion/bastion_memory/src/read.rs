//! Row selection, ordering and projection.

use crate::filter::View;
use crate::state::{ensure_physical, is_physical, query_field, sort_order, Row};
use bastion_core::error::{Result, StorageError};
use bastion_core::meta::FieldInfo;
use bastion_core::query::{enumerate, is_requested};
use serde_json::{json, Map, Value};
use std::cmp::Ordering;

fn invalid(detail: String) -> bastion_core::Error {
    StorageError::InvalidQuery(detail).into()
}

/// One sort key: the value and whether it sorts descending.
type SortKey = Vec<(Value, bool)>;

impl<'a> View<'a> {
    /// Rows of `model` selected by `where`, `orderBy`, `cursor`, `skip` and `take`.
    pub fn select_rows(&self, model: &str, args: &Value) -> Result<Vec<u64>> {
        let filter = args.get("where").unwrap_or(&Value::Null);
        let keys = self.find(model, filter)?;
        self.paginate(model, keys, args)
    }

    /// Apply ordering and pagination to an already filtered key list.
    pub fn paginate(&self, model: &str, mut keys: Vec<u64>, args: &Value) -> Result<Vec<u64>> {
        if let Some(order_by) = args.get("orderBy") {
            self.order(model, &mut keys, order_by)?;
        }

        if let Some(cursor) = args.get("cursor").filter(|c| c.is_object()) {
            let mut start = None;
            for (i, key) in keys.iter().enumerate() {
                if let Some(row) = self.row(model, *key) {
                    if self.matches(model, row, cursor)? {
                        start = Some(i);
                        break;
                    }
                }
            }
            keys = match start {
                Some(i) => keys.split_off(i),
                None => Vec::new(),
            };
        }

        let skip = args.get("skip").and_then(Value::as_u64).unwrap_or(0) as usize;
        let keys: Vec<u64> = keys.into_iter().skip(skip).collect();

        match args.get("take").and_then(Value::as_i64) {
            Some(take) if take >= 0 => Ok(keys.into_iter().take(take as usize).collect()),
            Some(take) => {
                let n = take.unsigned_abs() as usize;
                let start = keys.len().saturating_sub(n);
                Ok(keys[start..].to_vec())
            }
            None => Ok(keys),
        }
    }

    fn order(&self, model: &str, keys: &mut Vec<u64>, order_by: &Value) -> Result<()> {
        let mut decorated: Vec<(u64, SortKey)> = Vec::with_capacity(keys.len());
        for key in keys.iter() {
            let Some(row) = self.row(model, *key) else {
                continue;
            };
            let mut sort_key = Vec::new();
            for spec in enumerate(order_by) {
                self.sort_key(model, row, spec, &mut sort_key)?;
            }
            decorated.push((*key, sort_key));
        }
        decorated.sort_by(|(_, a), (_, b)| {
            for ((va, desc), (vb, _)) in a.iter().zip(b.iter()) {
                let ord = sort_order(va, vb);
                let ord = if *desc { ord.reverse() } else { ord };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
        *keys = decorated.into_iter().map(|(k, _)| k).collect();
        Ok(())
    }

    fn sort_key(&self, model: &str, row: &Row, spec: &Value, out: &mut SortKey) -> Result<()> {
        let Some(spec) = spec.as_object() else {
            return Err(invalid(format!("invalid orderBy for {}", model)));
        };
        for (name, direction) in spec {
            let field = query_field(self.meta, model, name)?;
            if field.is_data_model {
                let related = self.related(model, row, field)?;
                if field.is_array {
                    // Only `{ _count: dir }` is meaningful for to-many relations
                    let dir = direction.get("_count").unwrap_or(&Value::Null);
                    out.push((json!(related.len()), is_desc(dir)));
                } else {
                    match related.first().and_then(|k| self.row(&field.field_type, *k)) {
                        Some(target_row) => {
                            self.sort_key(&field.field_type, target_row, direction, out)?
                        }
                        None => {
                            let width = direction.as_object().map(Map::len).unwrap_or(1);
                            for _ in 0..width {
                                out.push((Value::Null, false));
                            }
                        }
                    }
                }
            } else {
                ensure_physical(model, field)?;
                let dir = direction.get("sort").unwrap_or(direction);
                out.push((row.get(name).cloned().unwrap_or(Value::Null), is_desc(dir)));
            }
        }
        Ok(())
    }

    /// Shape a row according to `select`/`include`.
    pub fn project(&self, model: &str, key: u64, args: &Value) -> Result<Value> {
        let row = self
            .row(model, key)
            .ok_or_else(|| invalid(format!("row of {} vanished during projection", model)))?;
        let info = self.meta.require_model(model)?;
        let mut out = Map::new();

        if let Some(select) = args.get("select").and_then(Value::as_object) {
            for (name, spec) in select {
                if !is_requested(spec) {
                    continue;
                }
                if name == "_count" {
                    out.insert(name.clone(), self.count_relations(model, row, spec)?);
                    continue;
                }
                let field = query_field(self.meta, model, name)?;
                if field.is_data_model {
                    out.insert(name.clone(), self.project_relation(model, row, field, spec)?);
                } else {
                    ensure_physical(model, field)?;
                    out.insert(name.clone(), row.get(name).cloned().unwrap_or(Value::Null));
                }
            }
            return Ok(Value::Object(out));
        }

        for field in info.fields.values().filter(|f| is_physical(f)) {
            out.insert(
                field.name.clone(),
                row.get(&field.name).cloned().unwrap_or(Value::Null),
            );
        }
        if let Some(include) = args.get("include").and_then(Value::as_object) {
            for (name, spec) in include {
                if !is_requested(spec) {
                    continue;
                }
                if name == "_count" {
                    out.insert(name.clone(), self.count_relations(model, row, spec)?);
                    continue;
                }
                let field = query_field(self.meta, model, name)?;
                if !field.is_data_model {
                    return Err(invalid(format!(
                        "include of scalar field {}.{}",
                        model, name
                    )));
                }
                out.insert(name.clone(), self.project_relation(model, row, field, spec)?);
            }
        }
        Ok(Value::Object(out))
    }

    fn project_relation(&self, model: &str, row: &Row, field: &FieldInfo, spec: &Value) -> Result<Value> {
        let related = self.related(model, row, field)?;
        let target = &field.field_type;
        let empty = json!({});
        let sub_args = if spec.is_object() { spec } else { &empty };

        if field.is_array {
            let filter = sub_args.get("where").unwrap_or(&Value::Null);
            let mut keys = Vec::new();
            for key in related {
                if let Some(r) = self.row(target, key) {
                    if self.matches(target, r, filter)? {
                        keys.push(key);
                    }
                }
            }
            let keys = self.paginate(target, keys, sub_args)?;
            let mut items = Vec::with_capacity(keys.len());
            for key in keys {
                items.push(self.project(target, key, sub_args)?);
            }
            return Ok(Value::Array(items));
        }

        match related.first() {
            Some(key) => self.project(target, *key, sub_args),
            None => Ok(Value::Null),
        }
    }

    fn count_relations(&self, model: &str, row: &Row, spec: &Value) -> Result<Value> {
        let info = self.meta.require_model(model)?;
        let mut out = Map::new();
        let requested: Vec<(String, Value)> = match spec.get("select").and_then(Value::as_object) {
            Some(select) => select
                .iter()
                .filter(|(_, v)| is_requested(v))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            None => info
                .fields
                .values()
                .filter(|f| f.is_to_many())
                .map(|f| (f.name.clone(), Value::Bool(true)))
                .collect(),
        };
        for (name, options) in requested {
            let field = query_field(self.meta, model, &name)?;
            if !field.is_to_many() {
                return Err(invalid(format!("_count of non to-many field {}.{}", model, name)));
            }
            let filter = options.get("where").unwrap_or(&Value::Null);
            let mut count = 0u64;
            for key in self.related(model, row, field)? {
                if let Some(r) = self.row(&field.field_type, key) {
                    if self.matches(&field.field_type, r, filter)? {
                        count += 1;
                    }
                }
            }
            out.insert(name, json!(count));
        }
        Ok(Value::Object(out))
    }
}

fn is_desc(direction: &Value) -> bool {
    direction.as_str() == Some("desc")
}

//! Counting, aggregation and grouping.

use crate::filter::View;
use crate::state::{compare_values, ensure_physical, query_field, sort_order, values_equal, Row};
use bastion_core::error::{Result, StorageError};
use bastion_core::query::{enumerate, is_requested};
use serde_json::{json, Map, Value};
use std::cmp::Ordering;

fn invalid(detail: String) -> bastion_core::Error {
    StorageError::InvalidQuery(detail).into()
}

impl<'a> View<'a> {
    fn selected(&self, model: &str, args: &Value) -> Result<Vec<&'a Row>> {
        let keys = self.select_rows(model, args)?;
        Ok(keys.into_iter().filter_map(|k| self.row(model, k)).collect())
    }

    /// Number of matching rows, or per-field non-null counts when `select` is given.
    pub fn count(&self, model: &str, args: &Value) -> Result<Value> {
        let rows = self.selected(model, args)?;
        match args.get("select") {
            Some(select) if select.is_object() => self.count_fields(model, &rows, select),
            _ => Ok(json!(rows.len())),
        }
    }

    fn count_fields(&self, model: &str, rows: &[&Row], select: &Value) -> Result<Value> {
        let mut out = Map::new();
        let Some(fields) = select.as_object() else {
            out.insert("_all".to_string(), json!(rows.len()));
            return Ok(Value::Object(out));
        };
        for (name, spec) in fields {
            if !is_requested(spec) {
                continue;
            }
            if name == "_all" {
                out.insert(name.clone(), json!(rows.len()));
                continue;
            }
            ensure_physical(model, query_field(self.meta, model, name)?)?;
            let n = rows
                .iter()
                .filter(|r| !r.get(name).unwrap_or(&Value::Null).is_null())
                .count();
            out.insert(name.clone(), json!(n));
        }
        Ok(Value::Object(out))
    }

    /// `_count`, `_sum`, `_avg`, `_min` and `_max` over the matching rows.
    pub fn aggregate(&self, model: &str, args: &Value) -> Result<Value> {
        let rows = self.selected(model, args)?;
        self.aggregates_of(model, &rows, args)
    }

    fn aggregates_of(&self, model: &str, rows: &[&Row], args: &Value) -> Result<Value> {
        let mut out = Map::new();
        let Some(args) = args.as_object() else {
            return Ok(Value::Object(out));
        };
        for (key, spec) in args {
            let value = match key.as_str() {
                "_count" => match spec {
                    Value::Bool(true) => json!(rows.len()),
                    Value::Object(_) => self.count_fields(model, rows, spec)?,
                    _ => continue,
                },
                "_sum" | "_avg" | "_min" | "_max" => {
                    let fields = spec.as_object().ok_or_else(|| {
                        invalid(format!("{} on {} expects an object of fields", key, model))
                    })?;
                    let mut result = Map::new();
                    for (name, requested) in fields {
                        if !is_requested(requested) {
                            continue;
                        }
                        ensure_physical(model, query_field(self.meta, model, name)?)?;
                        let values: Vec<&Value> = rows
                            .iter()
                            .filter_map(|r| r.get(name))
                            .filter(|v| !v.is_null())
                            .collect();
                        result.insert(name.clone(), fold(key, &values));
                    }
                    Value::Object(result)
                }
                _ => continue,
            };
            out.insert(key.clone(), value);
        }
        Ok(Value::Object(out))
    }

    /// Group matching rows by the `by` fields.
    pub fn group_by(&self, model: &str, args: &Value) -> Result<Vec<Value>> {
        if args.get("having").is_some_and(|h| !h.is_null()) {
            return Err(invalid(format!("groupBy on {} does not support `having`", model)));
        }
        let by: Vec<String> = enumerate(args.get("by").unwrap_or(&Value::Null))
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        if by.is_empty() {
            return Err(invalid(format!("groupBy on {} requires `by`", model)));
        }
        for name in &by {
            ensure_physical(model, query_field(self.meta, model, name)?)?;
        }

        let filter = args.get("where").unwrap_or(&Value::Null);
        let keys = self.find(model, filter)?;
        let mut groups: Vec<(Vec<Value>, Vec<&Row>)> = Vec::new();
        for key in keys {
            let Some(row) = self.row(model, key) else {
                continue;
            };
            let group_key: Vec<Value> = by
                .iter()
                .map(|f| row.get(f).cloned().unwrap_or(Value::Null))
                .collect();
            match groups.iter_mut().find(|(k, _)| {
                k.iter().zip(group_key.iter()).all(|(a, b)| values_equal(a, b))
            }) {
                Some((_, rows)) => rows.push(row),
                None => groups.push((group_key, vec![row])),
            }
        }

        let mut results = Vec::with_capacity(groups.len());
        for (group_key, rows) in &groups {
            let Value::Object(mut entry) = self.aggregates_of(model, rows, args)? else {
                continue;
            };
            for (name, value) in by.iter().zip(group_key.iter()) {
                entry.insert(name.clone(), value.clone());
            }
            results.push(Value::Object(entry));
        }

        if let Some(order_by) = args.get("orderBy") {
            let specs: Vec<(String, bool)> = enumerate(order_by)
                .into_iter()
                .filter_map(Value::as_object)
                .flat_map(|m| {
                    m.iter()
                        .map(|(k, v)| (k.clone(), v.as_str() == Some("desc")))
                        .collect::<Vec<_>>()
                })
                .collect();
            results.sort_by(|a, b| {
                for (name, desc) in &specs {
                    let ord = sort_order(
                        a.get(name).unwrap_or(&Value::Null),
                        b.get(name).unwrap_or(&Value::Null),
                    );
                    let ord = if *desc { ord.reverse() } else { ord };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }

        let skip = args.get("skip").and_then(Value::as_u64).unwrap_or(0) as usize;
        let take = args.get("take").and_then(Value::as_u64).map(|t| t as usize);
        let results = results.into_iter().skip(skip);
        Ok(match take {
            Some(n) => results.take(n).collect(),
            None => results.collect(),
        })
    }
}

fn fold(op: &str, values: &[&Value]) -> Value {
    match op {
        "_sum" => {
            if values.is_empty() {
                return Value::Null;
            }
            if values.iter().all(|v| v.is_i64()) {
                json!(values.iter().filter_map(|v| v.as_i64()).sum::<i64>())
            } else {
                json!(values.iter().filter_map(|v| v.as_f64()).sum::<f64>())
            }
        }
        "_avg" => {
            let numbers: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();
            if numbers.is_empty() {
                Value::Null
            } else {
                json!(numbers.iter().sum::<f64>() / numbers.len() as f64)
            }
        }
        _ => {
            let wanted = if op == "_min" { Ordering::Less } else { Ordering::Greater };
            let mut best: Option<&Value> = None;
            for v in values {
                best = match best {
                    Some(b) if compare_values(v, b) != Some(wanted) => Some(b),
                    _ => Some(v),
                };
            }
            best.cloned().unwrap_or(Value::Null)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold() {
        let values = [json!(3), json!(1), json!(2)];
        let refs: Vec<&Value> = values.iter().collect();
        assert_eq!(fold("_sum", &refs), json!(6));
        assert_eq!(fold("_avg", &refs), json!(2.0));
        assert_eq!(fold("_min", &refs), json!(1));
        assert_eq!(fold("_max", &refs), json!(3));
        assert_eq!(fold("_sum", &[]), Value::Null);
    }
}

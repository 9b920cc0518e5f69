//! Constraint sets and the search-form builder. A resolved descriptor
//! tree doubles as a search form: the builder relaxes `required`, echoes
//! the raw query back as form data and accumulates provider constraints
//! keyed by `__`-joined segments.

use crate::error::BindError;
use crate::spec::resolved::{CmpOp, FieldDescriptor, FieldKind, RangePolicy};
use crate::spec::transform::TransformerRegistry;
use crate::walk;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// Flat string query, e.g. decoded GET parameters.
pub type RawQuery = HashMap<String, String>;

/// One provider constraint. `key` is the `__`-joined identity used by
/// filter transformers; `path` is the attribute chain the provider
/// evaluates, relation hops included.
#[derive(Clone, Debug, PartialEq)]
pub struct Condition {
    pub key: String,
    pub path: Vec<String>,
    pub op: CmpOp,
    pub value: Value,
}

/// Ordered conjunction of conditions.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FilterExpression {
    conditions: Vec<Condition>,
}

impl FilterExpression {
    pub fn new() -> Self {
        FilterExpression::default()
    }

    /// Equality conditions from a criteria map, one per attribute.
    pub fn eq_criteria(criteria: &Map<String, Value>) -> Self {
        let mut f = FilterExpression::new();
        for (attr, value) in criteria {
            f.push(Condition {
                key: attr.clone(),
                path: vec![attr.clone()],
                op: CmpOp::Eq,
                value: value.clone(),
            });
        }
        f
    }

    pub fn push(&mut self, condition: Condition) {
        self.conditions.push(condition);
    }

    pub fn get(&self, key: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.key == key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Condition> {
        self.conditions.iter_mut().find(|c| c.key == key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Condition> {
        let idx = self.conditions.iter().position(|c| c.key == key)?;
        Some(self.conditions.remove(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.conditions.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }
}

fn join(segments: &[String]) -> String {
    segments.join("__")
}

pub struct FilterBuilder<'a> {
    transformers: &'a TransformerRegistry,
}

impl<'a> FilterBuilder<'a> {
    pub fn new(transformers: &'a TransformerRegistry) -> Self {
        FilterBuilder { transformers }
    }

    /// Turn a resolved tree plus a raw query into the relaxed search
    /// schema, the echoed form data and the constraint set.
    pub fn build(
        &self,
        desc: &FieldDescriptor,
        raw: &RawQuery,
    ) -> Result<(FieldDescriptor, Value, FilterExpression), BindError> {
        let relaxed = walk::map_tree(desc, &mut |mut d| {
            d.required = false;
            d
        });
        let mut filters = FilterExpression::new();
        let mut data = Map::new();
        self.collect_children(
            &relaxed.children,
            &[],
            &[],
            raw,
            &mut data,
            &mut filters,
        )?;
        tracing::debug!(conditions = filters.len(), "built search constraints");
        Ok((relaxed, Value::Object(data), filters))
    }

    fn collect_children(
        &self,
        children: &[FieldDescriptor],
        key_prefix: &[String],
        path_prefix: &[String],
        raw: &RawQuery,
        data: &mut Map<String, Value>,
        filters: &mut FilterExpression,
    ) -> Result<(), BindError> {
        for child in children {
            self.collect(child, key_prefix, path_prefix, raw, data, filters)?;
        }
        Ok(())
    }

    fn collect(
        &self,
        desc: &FieldDescriptor,
        key_prefix: &[String],
        path_prefix: &[String],
        raw: &RawQuery,
        data: &mut Map<String, Value>,
        filters: &mut FilterExpression,
    ) -> Result<(), BindError> {
        if desc.kind == FieldKind::Group {
            match &desc.key {
                Some(key) => {
                    // Keyed group: nested data object, longer prefixes.
                    let mut key_prefix = key_prefix.to_vec();
                    key_prefix.push(key.clone());
                    let mut path_prefix = path_prefix.to_vec();
                    path_prefix.push(key.clone());
                    let mut sub = Map::new();
                    self.collect_children(
                        &desc.children,
                        &key_prefix,
                        &path_prefix,
                        raw,
                        &mut sub,
                        filters,
                    )?;
                    self.finish_group(desc, &key_prefix, filters)?;
                    data.insert(key.clone(), Value::Object(sub));
                }
                None => {
                    // Keyless group: children spread into the parent.
                    self.collect_children(
                        &desc.children,
                        key_prefix,
                        path_prefix,
                        raw,
                        data,
                        filters,
                    )?;
                    self.finish_group(desc, key_prefix, filters)?;
                }
            }
            return Ok(());
        }
        self.collect_leaf(desc, key_prefix, path_prefix, raw, data, filters)
    }

    /// Range flip, then the group's named filter transformer.
    fn finish_group(
        &self,
        desc: &FieldDescriptor,
        key_prefix: &[String],
        filters: &mut FilterExpression,
    ) -> Result<(), BindError> {
        let Some(attr) = &desc.attribute else {
            return Ok(());
        };
        let mut prefix_segments = key_prefix.to_vec();
        prefix_segments.push(attr.clone());
        let prefix = join(&prefix_segments);

        if desc.range_policy == Some(RangePolicy::Flip) {
            enforce_flip(filters, &prefix);
        }
        if let Some(name) = &desc.transformer {
            let transformer = self.transformers.filter(name).ok_or_else(|| {
                crate::error::ConfigurationError::UnknownTransformer(name.clone())
            })?;
            transformer.apply(filters, &prefix, desc)?;
        }
        Ok(())
    }

    fn collect_leaf(
        &self,
        desc: &FieldDescriptor,
        key_prefix: &[String],
        path_prefix: &[String],
        raw: &RawQuery,
        data: &mut Map<String, Value>,
        filters: &mut FilterExpression,
    ) -> Result<(), BindError> {
        let Some(key) = &desc.key else {
            return Ok(());
        };
        let mut lookup = key_prefix.to_vec();
        lookup.push(key.clone());
        let raw_value = raw.get(&join(&lookup)).map(String::as_str);

        data.insert(key.clone(), crate::read::read_raw_leaf(desc, raw_value)?);

        let Some(raw_value) = raw_value.filter(|s| !s.is_empty()) else {
            return Ok(());
        };

        let mut base_segments = key_prefix.to_vec();
        let base = desc.query_key.clone().unwrap_or_else(|| {
            let mut segs = desc.path.clone();
            segs.push(desc.attribute.clone().unwrap_or_else(|| key.clone()));
            join(&segs)
        });
        base_segments.push(base);

        let mut path: Vec<String> = path_prefix.to_vec();
        path.extend(desc.path.iter().cloned());
        path.push(desc.attribute.clone().unwrap_or_else(|| key.clone()));

        match desc.kind {
            FieldKind::Select if desc.multiple => {
                let ids: Vec<Value> = raw_value
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(|s| match s.trim().parse::<i64>() {
                        Ok(n) => json!(n),
                        Err(_) => json!(s.trim()),
                    })
                    .collect();
                if ids.is_empty() {
                    return Ok(());
                }
                filters.push(Condition {
                    key: format!("{}__in", join(&base_segments)),
                    path,
                    op: CmpOp::In,
                    value: Value::Array(ids),
                });
            }
            FieldKind::Select => {
                tracing::debug!(key, "single select contributes no constraint");
            }
            FieldKind::Boolean => {
                let checked = matches!(raw_value, "yes" | "true" | "on" | "1");
                if !checked {
                    return Ok(());
                }
                filters.push(Condition {
                    key: join(&base_segments),
                    path,
                    op: desc.filter_op.unwrap_or(CmpOp::Eq),
                    value: json!(true),
                });
            }
            FieldKind::Date | FieldKind::Number | FieldKind::Decimal | FieldKind::Text => {
                let value = match crate::codec::codec_for(desc.kind) {
                    Some(codec) => codec.decode(Some(&json!(raw_value)))?,
                    None => json!(raw_value),
                };
                if value.is_null() {
                    return Ok(());
                }
                filters.push(Condition {
                    key: join(&base_segments),
                    path,
                    op: desc.filter_op.unwrap_or(CmpOp::Eq),
                    value,
                });
            }
            FieldKind::Month => {
                filters.push(Condition {
                    key: join(&base_segments),
                    path,
                    op: CmpOp::Month,
                    value: json!(raw_value),
                });
            }
            _ => {
                tracing::debug!(key, kind = ?desc.kind, "leaf kind contributes no constraint");
            }
        }
        Ok(())
    }
}

/// Swap the lower and upper bound values when submitted in reverse.
fn enforce_flip(filters: &mut FilterExpression, prefix: &str) {
    let from_key = format!("{prefix}__gte");
    let to_key = format!("{prefix}__lte");
    let (Some(from), Some(to)) = (filters.get(&from_key), filters.get(&to_key)) else {
        return;
    };
    let reversed = match (from.value.as_f64(), to.value.as_f64()) {
        (Some(a), Some(b)) => a > b,
        _ => match (from.value.as_str(), to.value.as_str()) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        },
    };
    if !reversed {
        return;
    }
    let from_value = from.value.clone();
    let to_value = to.value.clone();
    if let Some(c) = filters.get_mut(&from_key) {
        c.value = to_value;
    }
    if let Some(c) = filters.get_mut(&to_key) {
        c.value = from_value;
    }
}

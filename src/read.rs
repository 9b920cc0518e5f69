//! Projection of persisted instances into value trees shaped by a
//! resolved descriptor. Reads never mutate storage; unsaved instances
//! degrade to documented empty shapes instead of erroring.

use crate::codec::codec_for;
use crate::error::{BindError, ConfigurationError};
use crate::filter::{Condition, FilterExpression};
use crate::provider::{AttrKind, Instance, PersistenceProvider};
use crate::spec::resolved::{find_option, find_options, CmpOp, FieldDescriptor, FieldKind};
use serde_json::{json, Map, Value};

pub struct Reader<'a> {
    provider: &'a dyn PersistenceProvider,
}

impl<'a> Reader<'a> {
    pub fn new(provider: &'a dyn PersistenceProvider) -> Self {
        Reader { provider }
    }

    /// Value tree for one instance, or the whole collection for a
    /// bulk-list root.
    pub fn read(&self, instance: &Instance, desc: &FieldDescriptor) -> Result<Value, BindError> {
        if desc.kind == FieldKind::List {
            return self.read_bulk(desc);
        }
        let mut out = Map::new();
        self.read_into(instance, &desc.children, &mut out)?;
        Ok(Value::Object(out))
    }

    /// All rows matched by a bulk-list root, as an array of item objects.
    pub fn read_bulk(&self, desc: &FieldDescriptor) -> Result<Value, BindError> {
        let entity = desc
            .entity
            .as_deref()
            .ok_or(ConfigurationError::MissingListEntity)?;
        let filter = FilterExpression::eq_criteria(&desc.criteria);
        let mut rows = self.provider.query(entity, &filter)?;
        if desc.ordered {
            rows.sort_by_key(|r| r.get_id("order").unwrap_or(i64::MAX));
        }
        tracing::debug!(entity, count = rows.len(), "read collection");
        let items = rows
            .iter()
            .map(|row| {
                let mut item = Map::new();
                self.read_into(row, &desc.children, &mut item)?;
                Ok(Value::Object(item))
            })
            .collect::<Result<Vec<_>, BindError>>()?;
        Ok(Value::Array(items))
    }

    fn read_into(
        &self,
        instance: &Instance,
        children: &[FieldDescriptor],
        out: &mut Map<String, Value>,
    ) -> Result<(), BindError> {
        for child in children {
            match child.kind {
                FieldKind::Group => match &child.key {
                    Some(key) => {
                        let mut sub = Map::new();
                        self.read_into(instance, &child.children, &mut sub)?;
                        out.insert(key.clone(), Value::Object(sub));
                    }
                    None => self.read_into(instance, &child.children, out)?,
                },
                FieldKind::RelatedList => {
                    if let Some(key) = &child.key {
                        out.insert(key.clone(), self.read_related_list(instance, child)?);
                    }
                }
                FieldKind::UniqueItem => {
                    if let Some(key) = &child.key {
                        let row = self.unique_child(instance, child)?;
                        let mut sub = Map::new();
                        self.read_into(&row, &child.children, &mut sub)?;
                        out.insert(key.clone(), Value::Object(sub));
                    }
                }
                _ => {
                    let Some(key) = &child.key else { continue };
                    if let Some(v) = self.read_leaf(instance, child)? {
                        out.insert(key.clone(), v);
                    }
                }
            }
        }
        Ok(())
    }

    /// Child rows of a reverse one-to-many, ordered and criteria-scoped.
    fn read_related_list(
        &self,
        parent: &Instance,
        desc: &FieldDescriptor,
    ) -> Result<Value, BindError> {
        let Some(parent_id) = parent.id else {
            return Ok(json!([]));
        };
        let rows = self.child_rows(desc, parent_id)?;
        let items = rows
            .iter()
            .map(|row| {
                let mut item = Map::new();
                self.read_into(row, &desc.children, &mut item)?;
                Ok(Value::Object(item))
            })
            .collect::<Result<Vec<_>, BindError>>()?;
        Ok(Value::Array(items))
    }

    pub(crate) fn child_rows(
        &self,
        desc: &FieldDescriptor,
        parent_id: i64,
    ) -> Result<Vec<Instance>, BindError> {
        let entity = desc
            .entity
            .as_deref()
            .ok_or(ConfigurationError::MissingListEntity)?;
        let fk = desc
            .foreign_key
            .as_deref()
            .ok_or_else(|| ConfigurationError::InvalidSpec("child collection lost its foreign key".into()))?;
        let mut filter = FilterExpression::eq_criteria(&desc.criteria);
        filter.push(Condition {
            key: fk.into(),
            path: vec![fk.into()],
            op: CmpOp::Eq,
            value: json!(parent_id),
        });
        let mut rows = self.provider.query(entity, &filter)?;
        if desc.ordered {
            rows.sort_by_key(|r| r.get_id("order").unwrap_or(i64::MAX));
        }
        Ok(rows)
    }

    /// First criteria-matching reverse row, or a blank child when the
    /// parent is unsaved or has none yet.
    pub(crate) fn unique_child(
        &self,
        parent: &Instance,
        desc: &FieldDescriptor,
    ) -> Result<Instance, BindError> {
        let entity = desc
            .entity
            .as_deref()
            .ok_or(ConfigurationError::MissingListEntity)?;
        let Some(parent_id) = parent.id else {
            return Ok(Instance::new(entity));
        };
        let mut rows = self.child_rows(desc, parent_id)?;
        if rows.is_empty() {
            Ok(Instance::new(entity))
        } else {
            Ok(rows.remove(0))
        }
    }

    /// Leaf value, or `None` when the leaf is an unmapped defined branch.
    fn read_leaf(
        &self,
        instance: &Instance,
        desc: &FieldDescriptor,
    ) -> Result<Option<Value>, BindError> {
        if !desc.path.is_empty() {
            return match self.follow_path(instance, &desc.path)? {
                Some(related) => self.read_terminal(&related, desc),
                None => Ok(Some(Value::Null)),
            };
        }
        self.read_terminal(instance, desc)
    }

    /// Chase a single-relation chain; a missing hop reads as `None`.
    fn follow_path(
        &self,
        instance: &Instance,
        path: &[String],
    ) -> Result<Option<Instance>, BindError> {
        let mut current = instance.clone();
        for hop in path {
            let ty = self.provider.entity_type(&current.entity)?;
            let target = match ty.attribute(hop).map(|a| &a.kind) {
                Some(AttrKind::BelongsTo { target }) => target.clone(),
                _ => {
                    return Err(ConfigurationError::UnsupportedKind {
                        entity: current.entity.clone(),
                        attribute: hop.clone(),
                        kind: "dotted-path",
                    }
                    .into());
                }
            };
            let Some(id) = current.get_id(hop) else {
                return Ok(None);
            };
            let Some(next) = self.provider.get(&target, id)? else {
                return Ok(None);
            };
            current = next;
        }
        Ok(Some(current))
    }

    fn read_terminal(
        &self,
        instance: &Instance,
        desc: &FieldDescriptor,
    ) -> Result<Option<Value>, BindError> {
        match desc.kind {
            FieldKind::Select => self.read_select(instance, desc).map(Some),
            FieldKind::Range => {
                let base = desc.attribute.as_deref().unwrap_or_default();
                let mut m = Map::new();
                m.insert(
                    "from".into(),
                    instance
                        .get(&format!("{base}_from"))
                        .cloned()
                        .unwrap_or(Value::Null),
                );
                m.insert(
                    "to".into(),
                    instance
                        .get(&format!("{base}_to"))
                        .cloned()
                        .unwrap_or(Value::Null),
                );
                Ok(Some(Value::Object(m)))
            }
            FieldKind::Defined => self.read_defined(instance, desc),
            FieldKind::Attachments => self.read_attachments(instance, desc).map(Some),
            FieldKind::Image => {
                let attr = desc.attribute.as_deref().unwrap_or_default();
                Ok(Some(instance.get(attr).cloned().unwrap_or(Value::Null)))
            }
            FieldKind::Hidden if desc.attribute.as_deref() == Some("id") => {
                Ok(Some(instance.id.map_or(Value::Null, |id| json!(id))))
            }
            _ => {
                let attr = desc.attribute.as_deref().unwrap_or_default();
                let stored = instance.get(attr);
                match codec_for(desc.kind) {
                    Some(codec) => Ok(Some(codec.encode(stored))),
                    None => Ok(Some(stored.cloned().unwrap_or(Value::Null))),
                }
            }
        }
    }

    fn read_select(
        &self,
        instance: &Instance,
        desc: &FieldDescriptor,
    ) -> Result<Value, BindError> {
        let attr = desc.attribute.as_deref().unwrap_or_default();

        if desc.choice_backed {
            if desc.multiple {
                let values: Vec<Value> = instance
                    .get(attr)
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                return Ok(json!(find_options(&desc.options, &values)));
            }
            let stored = instance.get(attr).cloned().unwrap_or(Value::Null);
            return Ok(find_option(&desc.options, &stored)
                .map(|e| e.to_value())
                .unwrap_or(Value::Null));
        }

        if let Some(through) = &desc.through {
            let Some(id) = instance.id else {
                return Ok(json!([]));
            };
            let mut filter = FilterExpression::new();
            filter.push(Condition {
                key: through.foreign_key.clone(),
                path: vec![through.foreign_key.clone()],
                op: CmpOp::Eq,
                value: json!(id),
            });
            let rows = self.provider.query(&through.entity, &filter)?;
            let values: Vec<Value> = rows
                .iter()
                .filter_map(|r| r.get_id(&through.value_attribute))
                .map(|v| json!(v))
                .collect();
            return Ok(json!(find_options(&desc.options, &values)));
        }

        if desc.multiple {
            let Some(id) = instance.id else {
                return Ok(json!([]));
            };
            let ids = self.provider.relation_ids(&instance.entity, id, attr)?;
            let values: Vec<Value> = ids.into_iter().map(|v| json!(v)).collect();
            return Ok(json!(find_options(&desc.options, &values)));
        }

        if let Some(entity) = &desc.entity {
            let Some(related_id) = instance.get_id(attr) else {
                return Ok(Value::Null);
            };
            let Some(related) = self.provider.get(entity, related_id)? else {
                return Ok(Value::Null);
            };
            let label_attr = desc.label_attr.as_deref().unwrap_or("name");
            let mut m = Map::new();
            m.insert("value".into(), json!(related_id));
            m.insert(
                "label".into(),
                related.get(label_attr).cloned().unwrap_or(Value::Null),
            );
            for p in &desc.projected {
                m.insert(p.clone(), related.get(p).cloned().unwrap_or(Value::Null));
            }
            return Ok(Value::Object(m));
        }

        // Manual select: echo whatever is stored.
        Ok(instance.get(attr).cloned().unwrap_or(Value::Null))
    }

    /// Branch object selected by the current discriminator value;
    /// an unmapped discriminant means the key is absent entirely.
    fn read_defined(
        &self,
        instance: &Instance,
        desc: &FieldDescriptor,
    ) -> Result<Option<Value>, BindError> {
        let Some(discriminant) = self.discriminant_of(instance, desc) else {
            return Ok(None);
        };
        let Some((_, branch)) = desc.branches.iter().find(|(d, _)| *d == discriminant) else {
            return Ok(None);
        };
        if branch.children.is_empty() {
            return self.read_leaf(instance, branch);
        }
        let mut sub = Map::new();
        self.read_into(instance, &branch.children, &mut sub)?;
        Ok(Some(Value::Object(sub)))
    }

    pub(crate) fn discriminant_of(
        &self,
        instance: &Instance,
        desc: &FieldDescriptor,
    ) -> Option<String> {
        let attr = desc.discriminator.as_deref()?;
        match instance.get(attr)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    fn read_attachments(
        &self,
        instance: &Instance,
        desc: &FieldDescriptor,
    ) -> Result<Value, BindError> {
        let attr = desc.attribute.as_deref().unwrap_or_default();
        let Some(id) = instance.id else {
            return Ok(json!({ "existing": [] }));
        };
        let entity = desc
            .entity
            .as_deref()
            .ok_or(ConfigurationError::MissingListEntity)?;
        let name_attr = desc.name_attr.as_deref().unwrap_or("name");
        let mut existing = Vec::new();
        for related_id in self.provider.relation_ids(&instance.entity, id, attr)? {
            let Some(row) = self.provider.get(entity, related_id)? else {
                continue;
            };
            existing.push(json!({
                "id": related_id,
                "name": row.get(name_attr).cloned().unwrap_or(Value::Null),
                "document": row.get("document").cloned().unwrap_or(Value::Null),
            }));
        }
        Ok(json!({ "existing": existing }))
    }
}

/// Echo one raw query token back as form data for the leaf.
pub(crate) fn read_raw_leaf(
    desc: &FieldDescriptor,
    raw: Option<&str>,
) -> Result<Value, BindError> {
    let raw = raw.unwrap_or_default();
    match desc.kind {
        FieldKind::Select if desc.multiple => {
            let values: Vec<Value> = raw
                .split(',')
                .filter(|s| !s.is_empty())
                .map(|s| match s.trim().parse::<i64>() {
                    Ok(n) => json!(n),
                    Err(_) => json!(s.trim()),
                })
                .collect();
            Ok(json!(find_options(&desc.options, &values)))
        }
        FieldKind::Select => {
            if raw.is_empty() {
                return Ok(Value::Null);
            }
            let value = match raw.parse::<i64>() {
                Ok(n) => json!(n),
                Err(_) => json!(raw),
            };
            Ok(find_option(&desc.options, &value)
                .map(|e| e.to_value())
                .unwrap_or(Value::Null))
        }
        FieldKind::Boolean => Ok(json!(matches!(raw, "yes" | "true" | "on" | "1"))),
        _ if raw.is_empty() => Ok(Value::Null),
        _ => Ok(json!(raw)),
    }
}

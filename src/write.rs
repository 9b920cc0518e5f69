//! Application of submitted value trees back onto storage. Every write
//! runs under one provider transaction; a validation or consistency
//! failure rolls the whole submission back. Absent keys are left
//! untouched, so partial submissions update only what they carry.

use crate::codec::codec_for;
use crate::error::{BindError, ConfigurationError};
use crate::filter::FilterExpression;
use crate::provider::{AttrKind, Instance, PersistenceProvider};
use crate::read::Reader;
use crate::spec::resolved::{FieldDescriptor, FieldKind, Validator};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use regex::Regex;
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;

/// One uploaded file, keyed in the submission by an upload token.
#[derive(Clone, Debug)]
pub struct Blob {
    pub name: String,
    pub bytes: Vec<u8>,
}

pub type BlobMap = HashMap<String, Blob>;

/// What a write is applied to.
pub enum WriteTarget {
    /// A single instance, saved or blank.
    Instance(Instance),
    /// The whole collection of a bulk-list root.
    Bulk,
}

/// What a write produced.
#[derive(Debug)]
pub enum Written {
    One(Instance),
    Many(Vec<Instance>),
}

pub struct Writer<'a> {
    provider: &'a dyn PersistenceProvider,
}

impl<'a> Writer<'a> {
    pub fn new(provider: &'a dyn PersistenceProvider) -> Self {
        Writer { provider }
    }

    /// Apply one submission transactionally.
    pub fn write(
        &self,
        desc: &FieldDescriptor,
        target: WriteTarget,
        data: &Value,
        blobs: &BlobMap,
    ) -> Result<Written, BindError> {
        self.provider.begin()?;
        match self.write_inner(desc, target, data, blobs) {
            Ok(written) => {
                self.provider.commit()?;
                Ok(written)
            }
            Err(err) => {
                if let Err(rb) = self.provider.rollback() {
                    tracing::error!(error = %rb, "rollback failed after write error");
                }
                Err(err)
            }
        }
    }

    fn write_inner(
        &self,
        desc: &FieldDescriptor,
        target: WriteTarget,
        data: &Value,
        blobs: &BlobMap,
    ) -> Result<Written, BindError> {
        match (desc.kind, target) {
            (FieldKind::List, _) => {
                let items = data.as_array().ok_or_else(|| {
                    BindError::Validation("collection write expects an array".into())
                })?;
                self.write_bulk(desc, items, blobs).map(Written::Many)
            }
            (_, WriteTarget::Instance(instance)) => {
                let map = data.as_object().ok_or_else(|| {
                    BindError::Validation("instance write expects an object".into())
                })?;
                self.write_object(&desc.children, instance, map, blobs)
                    .map(Written::One)
            }
            (_, WriteTarget::Bulk) => Err(ConfigurationError::InvalidSpec(
                "bulk target requires a collection root".into(),
            )
            .into()),
        }
    }

    /// Reconcile a whole collection: delete rows absent from the
    /// submission, then create or update the submitted ones in order.
    fn write_bulk(
        &self,
        desc: &FieldDescriptor,
        items: &[Value],
        blobs: &BlobMap,
    ) -> Result<Vec<Instance>, BindError> {
        let entity = desc
            .entity
            .as_deref()
            .ok_or(ConfigurationError::MissingListEntity)?;
        let existing = self
            .provider
            .query(entity, &FilterExpression::eq_criteria(&desc.criteria))?;
        let submitted: HashSet<i64> = items
            .iter()
            .filter_map(|i| i.get("id").and_then(Value::as_i64))
            .collect();
        for row in &existing {
            if let Some(id) = row.id {
                if !submitted.contains(&id) {
                    self.provider.delete(entity, id)?;
                }
            }
        }
        let mut written = Vec::new();
        for (j, item) in items.iter().enumerate() {
            let map = item.as_object().ok_or_else(|| {
                BindError::Validation("collection item must be an object".into())
            })?;
            let Some(mut instance) =
                self.target_item(entity, map.get("id").and_then(Value::as_i64), &desc.criteria)?
            else {
                continue;
            };
            if desc.ordered {
                instance.set("order", json!((j + 1) as i64));
            }
            written.push(self.write_object(&desc.children, instance, map, blobs)?);
        }
        Ok(written)
    }

    /// Row a submitted item lands on: a fresh criteria-stamped instance,
    /// the existing row, or nothing when the submitted id is stale.
    /// An existing row outside the criteria fails the whole write.
    fn target_item(
        &self,
        entity: &str,
        id: Option<i64>,
        criteria: &Map<String, Value>,
    ) -> Result<Option<Instance>, BindError> {
        let Some(id) = id else {
            let mut instance = Instance::new(entity);
            for (k, v) in criteria {
                instance.set(k, v.clone());
            }
            return Ok(Some(instance));
        };
        let Some(instance) = self.provider.get(entity, id)? else {
            tracing::debug!(entity, id, "skipping stale collection item");
            return Ok(None);
        };
        for (k, v) in criteria {
            if instance.get(k) != Some(v) {
                return Err(BindError::Consistency(format!(
                    "{entity} #{id} does not match collection criteria on '{k}'"
                )));
            }
        }
        Ok(Some(instance))
    }

    /// Full write of one instance: scalar assignment, save, then
    /// relation and child-collection reconciliation against the saved id.
    fn write_object(
        &self,
        children: &[FieldDescriptor],
        mut instance: Instance,
        data: &Map<String, Value>,
        blobs: &BlobMap,
    ) -> Result<Instance, BindError> {
        self.assign_scalars(children, &mut instance, data, blobs)?;
        self.assign_defined(children, &mut instance, data, blobs)?;
        let saved = if instance.is_saved() {
            self.provider.update(&instance)?
        } else {
            self.provider.insert(&instance)?
        };
        self.apply_relations(children, &saved, data, blobs)?;
        Ok(saved)
    }

    fn assign_scalars(
        &self,
        children: &[FieldDescriptor],
        instance: &mut Instance,
        data: &Map<String, Value>,
        blobs: &BlobMap,
    ) -> Result<(), BindError> {
        for child in children {
            if !child.path.is_empty() {
                // Dotted leaves cross a relation and are read-only.
                continue;
            }
            match child.kind {
                FieldKind::Group => match &child.key {
                    Some(key) => {
                        if let Some(sub) = data.get(key).and_then(Value::as_object) {
                            self.assign_scalars(&child.children, instance, sub, blobs)?;
                        }
                    }
                    None => self.assign_scalars(&child.children, instance, data, blobs)?,
                },
                FieldKind::Select => self.assign_select(child, instance, data)?,
                FieldKind::Range => self.assign_range(child, instance, data)?,
                FieldKind::Image => self.assign_image(child, instance, data, blobs)?,
                FieldKind::Hidden
                | FieldKind::Defined
                | FieldKind::Attachments
                | FieldKind::List
                | FieldKind::RelatedList
                | FieldKind::UniqueItem => {}
                _ => self.assign_coded(child, instance, data)?,
            }
        }
        Ok(())
    }

    /// Discriminated sub-schemas assign after plain scalars so the
    /// discriminator attribute already holds its submitted value.
    fn assign_defined(
        &self,
        children: &[FieldDescriptor],
        instance: &mut Instance,
        data: &Map<String, Value>,
        blobs: &BlobMap,
    ) -> Result<(), BindError> {
        for child in children {
            match child.kind {
                FieldKind::Group => match &child.key {
                    Some(key) => {
                        if let Some(sub) = data.get(key).and_then(Value::as_object) {
                            self.assign_defined(&child.children, instance, sub, blobs)?;
                        }
                    }
                    None => self.assign_defined(&child.children, instance, data, blobs)?,
                },
                FieldKind::Defined => {
                    let reader = Reader::new(self.provider);
                    let Some(discriminant) = reader.discriminant_of(instance, child) else {
                        continue;
                    };
                    let Some((_, branch)) =
                        child.branches.iter().find(|(d, _)| *d == discriminant)
                    else {
                        continue;
                    };
                    let Some(key) = &child.key else { continue };
                    let Some(raw) = data.get(key) else { continue };
                    // Mirror the read shape: a composite branch carries an
                    // object of its children, a leaf branch its bare value.
                    if branch.children.is_empty() {
                        let Some(branch_key) = &branch.key else { continue };
                        let mut sub = Map::new();
                        sub.insert(branch_key.clone(), raw.clone());
                        self.assign_scalars(std::slice::from_ref(branch), instance, &sub, blobs)?;
                    } else if let Some(sub) = raw.as_object() {
                        self.assign_scalars(&branch.children, instance, sub, blobs)?;
                        self.assign_defined(&branch.children, instance, sub, blobs)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn assign_select(
        &self,
        desc: &FieldDescriptor,
        instance: &mut Instance,
        data: &Map<String, Value>,
    ) -> Result<(), BindError> {
        if desc.through.is_some() || (desc.multiple && !desc.choice_backed) {
            // Relation membership happens after save.
            return Ok(());
        }
        let Some(key) = &desc.key else { return Ok(()) };
        let Some(attr) = &desc.attribute else {
            return Ok(());
        };
        let Some(raw) = data.get(key) else {
            return Ok(());
        };
        if desc.choice_backed && desc.multiple {
            let values: Vec<Value> = raw
                .as_array()
                .map(|a| a.iter().map(selection_value).collect())
                .unwrap_or_default();
            instance.set(attr.clone(), Value::Array(values));
            return Ok(());
        }
        let value = match raw {
            Value::Null => Value::Null,
            Value::Object(m) => m.get("value").cloned().unwrap_or(Value::Null),
            other => other.clone(),
        };
        instance.set(attr.clone(), value);
        Ok(())
    }

    fn assign_range(
        &self,
        desc: &FieldDescriptor,
        instance: &mut Instance,
        data: &Map<String, Value>,
    ) -> Result<(), BindError> {
        let (Some(key), Some(base)) = (&desc.key, &desc.attribute) else {
            return Ok(());
        };
        let Some(raw) = data.get(key).and_then(Value::as_object) else {
            return Ok(());
        };
        for (bound, attr) in [("from", format!("{base}_from")), ("to", format!("{base}_to"))] {
            let Some(wire) = raw.get(bound) else { continue };
            let kind = self.attribute_kind(&instance.entity, &attr)?;
            let value = match codec_for(kind) {
                Some(codec) => codec.decode(Some(wire))?,
                None => wire.clone(),
            };
            instance.set(attr, value);
        }
        Ok(())
    }

    fn assign_image(
        &self,
        desc: &FieldDescriptor,
        instance: &mut Instance,
        data: &Map<String, Value>,
        blobs: &BlobMap,
    ) -> Result<(), BindError> {
        let (Some(key), Some(attr)) = (&desc.key, &desc.attribute) else {
            return Ok(());
        };
        let Some(raw) = data.get(key) else {
            return Ok(());
        };
        match raw {
            Value::Null => instance.set(attr.clone(), Value::Null),
            Value::Object(m) => {
                let token = m.get("upload").and_then(Value::as_str).ok_or_else(|| {
                    BindError::Validation(format!("'{key}' upload reference is malformed"))
                })?;
                let blob = blobs.get(token).ok_or_else(|| {
                    BindError::Validation(format!("unknown upload token '{token}'"))
                })?;
                instance.set(attr.clone(), json!(blob.name));
            }
            Value::String(s) if s.starts_with("data:") => {
                let name = decode_data_uri(key, s)?;
                instance.set(attr.clone(), json!(name));
            }
            // A plain stored name echoed back leaves the attribute alone.
            Value::String(_) => {}
            other => {
                return Err(BindError::Validation(format!(
                    "'{key}' expects a file reference, got {other}"
                )))
            }
        }
        Ok(())
    }

    fn assign_coded(
        &self,
        desc: &FieldDescriptor,
        instance: &mut Instance,
        data: &Map<String, Value>,
    ) -> Result<(), BindError> {
        let (Some(key), Some(attr)) = (&desc.key, &desc.attribute) else {
            return Ok(());
        };
        let Some(raw) = data.get(key) else {
            return Ok(());
        };
        let Some(codec) = codec_for(desc.kind) else {
            return Ok(());
        };
        let value = codec.decode(Some(raw))?;
        if desc.required && is_blank(&value) {
            return Err(BindError::Validation(format!("'{key}' is required")));
        }
        check_validators(key, &desc.validators, &value)?;
        instance.set(attr.clone(), value);
        Ok(())
    }

    fn apply_relations(
        &self,
        children: &[FieldDescriptor],
        instance: &Instance,
        data: &Map<String, Value>,
        blobs: &BlobMap,
    ) -> Result<(), BindError> {
        for child in children {
            if !child.path.is_empty() {
                continue;
            }
            match child.kind {
                FieldKind::Group => match &child.key {
                    Some(key) => {
                        if let Some(sub) = data.get(key).and_then(Value::as_object) {
                            self.apply_relations(&child.children, instance, sub, blobs)?;
                        }
                    }
                    None => self.apply_relations(&child.children, instance, data, blobs)?,
                },
                FieldKind::Defined => {
                    let reader = Reader::new(self.provider);
                    let Some(discriminant) = reader.discriminant_of(instance, child) else {
                        continue;
                    };
                    let Some((_, branch)) =
                        child.branches.iter().find(|(d, _)| *d == discriminant)
                    else {
                        continue;
                    };
                    let Some(key) = &child.key else { continue };
                    if let Some(sub) = data.get(key).and_then(Value::as_object) {
                        self.apply_relations(&branch.children, instance, sub, blobs)?;
                    }
                }
                FieldKind::Select if child.through.is_some() => {
                    self.reconcile_through(child, instance, data)?;
                }
                FieldKind::Select if child.multiple && !child.choice_backed => {
                    self.reconcile_membership(child, instance, data)?;
                }
                FieldKind::Attachments => {
                    self.reconcile_attachments(child, instance, data, blobs)?;
                }
                FieldKind::RelatedList => {
                    self.reconcile_children(child, instance, data, blobs)?;
                }
                FieldKind::UniqueItem => {
                    self.write_unique_child(child, instance, data, blobs)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Diff many-to-many membership; untouched members cost no provider
    /// relation calls.
    fn reconcile_membership(
        &self,
        desc: &FieldDescriptor,
        instance: &Instance,
        data: &Map<String, Value>,
    ) -> Result<(), BindError> {
        let (Some(key), Some(attr), Some(id)) = (&desc.key, &desc.attribute, instance.id) else {
            return Ok(());
        };
        let Some(raw) = data.get(key) else {
            return Ok(());
        };
        let desired = selection_ids(key, raw)?;
        let current: HashSet<i64> = self
            .provider
            .relation_ids(&instance.entity, id, attr)?
            .into_iter()
            .collect();
        let desired_set: HashSet<i64> = desired.iter().copied().collect();
        for stale in current.difference(&desired_set) {
            self.provider
                .relation_remove(&instance.entity, id, attr, *stale)?;
        }
        for added in desired_set.difference(&current) {
            self.provider
                .relation_add(&instance.entity, id, attr, *added)?;
        }
        Ok(())
    }

    /// Diff the link rows of a flattened reverse relation.
    fn reconcile_through(
        &self,
        desc: &FieldDescriptor,
        instance: &Instance,
        data: &Map<String, Value>,
    ) -> Result<(), BindError> {
        let (Some(key), Some(through), Some(id)) = (&desc.key, &desc.through, instance.id) else {
            return Ok(());
        };
        let Some(raw) = data.get(key) else {
            return Ok(());
        };
        let desired: HashSet<i64> = selection_ids(key, raw)?.into_iter().collect();
        let mut fk_criteria = Map::new();
        fk_criteria.insert(through.foreign_key.clone(), json!(id));
        let rows = self
            .provider
            .query(&through.entity, &FilterExpression::eq_criteria(&fk_criteria))?;
        let mut present = HashSet::new();
        for row in &rows {
            match row.get_id(&through.value_attribute) {
                Some(v) if desired.contains(&v) && !present.contains(&v) => {
                    present.insert(v);
                }
                _ => {
                    if let Some(row_id) = row.id {
                        self.provider.delete(&through.entity, row_id)?;
                    }
                }
            }
        }
        for v in desired.difference(&present) {
            let mut link = Instance::new(through.entity.clone());
            link.set(through.foreign_key.clone(), json!(id));
            link.set(through.value_attribute.clone(), json!(*v));
            self.provider.insert(&link)?;
        }
        Ok(())
    }

    /// `{existing, added}` attachment reconciliation: detach what was
    /// removed, create and attach rows for uploaded blobs.
    fn reconcile_attachments(
        &self,
        desc: &FieldDescriptor,
        instance: &Instance,
        data: &Map<String, Value>,
        blobs: &BlobMap,
    ) -> Result<(), BindError> {
        let (Some(key), Some(attr), Some(entity), Some(id)) =
            (&desc.key, &desc.attribute, &desc.entity, instance.id)
        else {
            return Ok(());
        };
        let Some(raw) = data.get(key).and_then(Value::as_object) else {
            return Ok(());
        };
        let keep: HashSet<i64> = raw
            .get("existing")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(|e| e.get("id").and_then(Value::as_i64))
                    .collect()
            })
            .unwrap_or_default();
        for current in self.provider.relation_ids(&instance.entity, id, attr)? {
            if !keep.contains(&current) {
                self.provider
                    .relation_remove(&instance.entity, id, attr, current)?;
            }
        }
        let name_attr = desc.name_attr.as_deref().unwrap_or("name");
        for added in raw
            .get("added")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let token = added.get("upload").and_then(Value::as_str).ok_or_else(|| {
                BindError::Validation(format!("'{key}' upload reference is malformed"))
            })?;
            let blob = blobs
                .get(token)
                .ok_or_else(|| BindError::Validation(format!("unknown upload token '{token}'")))?;
            let mut row = Instance::new(entity.clone());
            row.set(name_attr, json!(blob.name));
            row.set("document", json!(blob.name));
            let saved = self.provider.insert(&row)?;
            if let Some(row_id) = saved.id {
                self.provider
                    .relation_add(&instance.entity, id, attr, row_id)?;
            }
        }
        Ok(())
    }

    /// Reconcile a nested child collection under its saved parent.
    fn reconcile_children(
        &self,
        desc: &FieldDescriptor,
        parent: &Instance,
        data: &Map<String, Value>,
        blobs: &BlobMap,
    ) -> Result<(), BindError> {
        let (Some(key), Some(entity), Some(fk), Some(parent_id)) =
            (&desc.key, &desc.entity, &desc.foreign_key, parent.id)
        else {
            return Ok(());
        };
        let Some(items) = data.get(key).and_then(Value::as_array) else {
            return Ok(());
        };
        let reader = Reader::new(self.provider);
        let existing = reader.child_rows(desc, parent_id)?;
        let submitted: HashSet<i64> = items
            .iter()
            .filter_map(|i| i.get("id").and_then(Value::as_i64))
            .collect();
        for row in &existing {
            if let Some(id) = row.id {
                if !submitted.contains(&id) {
                    self.provider.delete(entity, id)?;
                }
            }
        }
        for (j, item) in items.iter().enumerate() {
            let map = item.as_object().ok_or_else(|| {
                BindError::Validation("collection item must be an object".into())
            })?;
            let Some(mut child) =
                self.target_item(entity, map.get("id").and_then(Value::as_i64), &desc.criteria)?
            else {
                continue;
            };
            child.set(fk.clone(), json!(parent_id));
            if desc.ordered {
                child.set("order", json!((j + 1) as i64));
            }
            self.write_object(&desc.children, child, map, blobs)?;
        }
        Ok(())
    }

    /// Get-or-create the singleton reverse child, then write into it.
    fn write_unique_child(
        &self,
        desc: &FieldDescriptor,
        parent: &Instance,
        data: &Map<String, Value>,
        blobs: &BlobMap,
    ) -> Result<(), BindError> {
        let (Some(key), Some(fk), Some(parent_id)) = (&desc.key, &desc.foreign_key, parent.id)
        else {
            return Ok(());
        };
        let Some(sub) = data.get(key).and_then(Value::as_object) else {
            return Ok(());
        };
        let reader = Reader::new(self.provider);
        let mut child = reader.unique_child(parent, desc)?;
        if !child.is_saved() {
            for (k, v) in &desc.criteria {
                child.set(k, v.clone());
            }
        }
        child.set(fk.clone(), json!(parent_id));
        self.write_object(&desc.children, child, sub, blobs)?;
        Ok(())
    }

    fn attribute_kind(&self, entity: &str, attr: &str) -> Result<FieldKind, BindError> {
        let ty = self.provider.entity_type(entity)?;
        let meta = ty
            .attribute(attr)
            .ok_or_else(|| ConfigurationError::MissingAttribute {
                entity: entity.into(),
                attribute: attr.into(),
            })?;
        Ok(match meta.kind {
            AttrKind::Bool => FieldKind::Boolean,
            AttrKind::Integer { .. } => FieldKind::Number,
            AttrKind::Decimal => FieldKind::Decimal,
            AttrKind::Date | AttrKind::DateTime => FieldKind::Date,
            AttrKind::LongText => FieldKind::Textarea,
            AttrKind::Text { .. } => FieldKind::Text,
            _ => FieldKind::Hidden,
        })
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn check_validators(key: &str, validators: &[Validator], value: &Value) -> Result<(), BindError> {
    if value.is_null() {
        return Ok(());
    }
    for v in validators {
        match v {
            Validator::MaxLength { value: max } => {
                if let Some(s) = value.as_str() {
                    if s.chars().count() > *max as usize {
                        return Err(BindError::Validation(format!(
                            "'{key}' exceeds {max} characters"
                        )));
                    }
                }
            }
            Validator::MinNumber { value: min } => {
                if numeric(value).is_some_and(|n| n < Decimal::from(*min)) {
                    return Err(BindError::Validation(format!("'{key}' is below {min}")));
                }
            }
            Validator::MaxNumber { value: max } => {
                if numeric(value).is_some_and(|n| n > Decimal::from(*max)) {
                    return Err(BindError::Validation(format!("'{key}' is above {max}")));
                }
            }
            Validator::Pattern { value: pattern } => {
                let re = Regex::new(pattern).map_err(|_| {
                    ConfigurationError::InvalidSpec(format!(
                        "invalid pattern '{pattern}' on '{key}'"
                    ))
                })?;
                if let Some(s) = value.as_str() {
                    if !re.is_match(s) {
                        return Err(BindError::Validation(format!(
                            "'{key}' does not match the expected pattern"
                        )));
                    }
                }
            }
            Validator::FromTo => {}
        }
    }
    Ok(())
}

fn numeric(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        Value::String(s) => Decimal::from_str(s).ok(),
        _ => None,
    }
}

/// Option value of one selection entry, `{value, label}` or bare.
fn selection_value(entry: &Value) -> Value {
    match entry {
        Value::Object(m) => m.get("value").cloned().unwrap_or(Value::Null),
        other => other.clone(),
    }
}

/// Selected relation ids from a submitted multi-select value.
fn selection_ids(key: &str, raw: &Value) -> Result<Vec<i64>, BindError> {
    let entries = raw
        .as_array()
        .ok_or_else(|| BindError::Validation(format!("'{key}' expects a selection list")))?;
    entries
        .iter()
        .map(|e| {
            selection_value(e)
                .as_i64()
                .ok_or_else(|| BindError::Validation(format!("'{key}' holds a non-id selection")))
        })
        .collect()
}

/// `data:<mime>;base64,<payload>` to a named blob; the stored value is
/// the derived file name.
fn decode_data_uri(key: &str, uri: &str) -> Result<String, BindError> {
    let rest = uri
        .strip_prefix("data:")
        .and_then(|r| r.split_once(";base64,"))
        .ok_or_else(|| BindError::Validation(format!("'{key}' data URI is malformed")))?;
    let (mime, payload) = rest;
    BASE64
        .decode(payload)
        .map_err(|_| BindError::Validation(format!("'{key}' data URI payload is not base64")))?;
    let ext = mime.split('/').nth(1).unwrap_or("bin");
    Ok(format!("{key}.{ext}"))
}

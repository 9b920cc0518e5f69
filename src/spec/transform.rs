//! Named `via` transformers (composite UI patterns resolved in place of
//! a plain leaf) and filter post-processors. Registries are injected
//! into the engine at construction; nothing here is ambient state.

use crate::error::{BindError, ConfigurationError};
use crate::filter::FilterExpression;
use crate::provider::{AttrKind, AttributeMeta, EntityType};
use crate::spec::resolve::Resolver;
use crate::spec::resolved::{
    CmpOp, FieldDescriptor, FieldKind, RangePolicy, ThroughRelation, Validator,
};
use crate::spec::types::FieldSpec;
use chrono::{Duration, NaiveDate};
use serde_json::json;
use std::collections::HashMap;

/// Takes over resolution of a spec node.
pub trait ViaTransformer {
    fn resolve(
        &self,
        r: &Resolver<'_>,
        spec: &FieldSpec,
        entity: &EntityType,
    ) -> Result<FieldDescriptor, BindError>;
}

/// Post-processes the constraint set accumulated for a subtree.
/// `prefix` is the constraint-key prefix of the subtree's base attribute.
pub trait FilterTransformer {
    fn apply(
        &self,
        filters: &mut FilterExpression,
        prefix: &str,
        desc: &FieldDescriptor,
    ) -> Result<(), BindError>;
}

pub struct TransformerRegistry {
    via: HashMap<String, Box<dyn ViaTransformer>>,
    filter: HashMap<String, Box<dyn FilterTransformer>>,
}

impl Default for TransformerRegistry {
    fn default() -> Self {
        let mut r = TransformerRegistry {
            via: HashMap::new(),
            filter: HashMap::new(),
        };
        r.register_via("from_to", Box::new(FromTo));
        r.register_via("multiple_choices_select", Box::new(MultipleChoicesSelect));
        r.register_via("defined_field", Box::new(DefinedField));
        r.register_via("flat_many", Box::new(FlatMany));
        r.register_via("filter_from_to", Box::new(FilterFromTo));
        r.register_via("filter_from_to_month", Box::new(FilterFromToMonth));
        r.register_via("filter_multiple_select", Box::new(FilterMultipleSelect));
        r.register_filter("plus_days", Box::new(PlusDays));
        r
    }
}

impl TransformerRegistry {
    pub fn register_via(&mut self, name: &str, transformer: Box<dyn ViaTransformer>) {
        self.via.insert(name.into(), transformer);
    }

    pub fn register_filter(&mut self, name: &str, transformer: Box<dyn FilterTransformer>) {
        self.filter.insert(name.into(), transformer);
    }

    pub(crate) fn via(&self, name: &str) -> Option<&dyn ViaTransformer> {
        self.via.get(name).map(|b| b.as_ref())
    }

    pub(crate) fn filter(&self, name: &str) -> Option<&dyn FilterTransformer> {
        self.filter.get(name).map(|b| b.as_ref())
    }
}

fn base_field<'t>(
    spec: &FieldSpec,
    entity: &'t EntityType,
) -> Result<(&'t AttributeMeta, String), BindError> {
    let from = spec
        .from_field
        .clone()
        .ok_or_else(|| ConfigurationError::InvalidSpec("transformer requires from_field".into()))?;
    let attr = entity
        .attribute(&from)
        .ok_or_else(|| ConfigurationError::MissingAttribute {
            entity: entity.name.clone(),
            attribute: from.clone(),
        })?;
    Ok((attr, from))
}

/// Paired `<base>_from` / `<base>_to` attributes edited as one `{from, to}`
/// value.
struct FromTo;

impl ViaTransformer for FromTo {
    fn resolve(
        &self,
        _r: &Resolver<'_>,
        spec: &FieldSpec,
        entity: &EntityType,
    ) -> Result<FieldDescriptor, BindError> {
        let base = spec.from_field.clone().ok_or_else(|| {
            ConfigurationError::InvalidSpec("from_to requires from_field".into())
        })?;
        let from_attr = entity
            .attribute(&format!("{base}_from"))
            .ok_or_else(|| ConfigurationError::MissingAttribute {
                entity: entity.name.clone(),
                attribute: format!("{base}_from"),
            })?;
        entity
            .attribute(&format!("{base}_to"))
            .ok_or_else(|| ConfigurationError::MissingAttribute {
                entity: entity.name.clone(),
                attribute: format!("{base}_to"),
            })?;
        let mut d = FieldDescriptor::leaf(FieldKind::Range);
        d.key = Some(spec.key.clone().unwrap_or_else(|| base.clone()));
        d.attribute = Some(base);
        d.label = spec.label.clone();
        d.required = spec.required.unwrap_or(from_attr.required);
        d.validators.push(Validator::FromTo);
        Ok(d)
    }
}

/// Multi-select over a fixed choice set backed by a text array.
struct MultipleChoicesSelect;

impl ViaTransformer for MultipleChoicesSelect {
    fn resolve(
        &self,
        r: &Resolver<'_>,
        spec: &FieldSpec,
        entity: &EntityType,
    ) -> Result<FieldDescriptor, BindError> {
        let (attr, from) = base_field(spec, entity)?;
        let AttrKind::TextArray { choices } = &attr.kind else {
            return Err(ConfigurationError::UnsupportedKind {
                entity: entity.name.clone(),
                attribute: from,
                kind: "multiple-choices select",
            }
            .into());
        };
        let mut stripped = spec.clone();
        stripped.via = None;
        let mut d = r.field_from_attr(attr, &stripped, &entity.name)?;
        d.kind = FieldKind::Select;
        d.multiple = true;
        d.choice_backed = true;
        d.options = choices
            .iter()
            .map(|c| {
                crate::spec::resolved::OptionNode::Entry(
                    crate::spec::resolved::OptionEntry::new(c.value.clone(), c.label.clone()),
                )
            })
            .collect();
        Ok(d)
    }
}

/// Polymorphic "defined field": the active sub-schema is selected by the
/// current value of a discriminator attribute. Branches resolve against
/// the same entity type.
struct DefinedField;

impl ViaTransformer for DefinedField {
    fn resolve(
        &self,
        r: &Resolver<'_>,
        spec: &FieldSpec,
        entity: &EntityType,
    ) -> Result<FieldDescriptor, BindError> {
        let key = spec
            .key
            .clone()
            .or_else(|| spec.from_field.clone())
            .ok_or_else(|| {
                ConfigurationError::InvalidSpec("defined_field requires a key".into())
            })?;
        let discriminator = spec.discriminator.clone().ok_or_else(|| {
            ConfigurationError::InvalidSpec("defined_field requires a discriminator".into())
        })?;
        entity
            .attribute(&discriminator)
            .ok_or_else(|| ConfigurationError::MissingAttribute {
                entity: entity.name.clone(),
                attribute: discriminator.clone(),
            })?;
        let mut d = FieldDescriptor::leaf(FieldKind::Defined);
        d.key = Some(key);
        d.attribute = spec.from_field.clone();
        d.required = false;
        d.discriminator = Some(discriminator);
        for (discriminant, sub) in &spec.branches {
            d.branches
                .push((discriminant.clone(), r.resolve_node(sub, &entity.name)?));
        }
        Ok(d)
    }
}

/// Flattened multi-valued reverse relation: a one-to-many of link rows,
/// each holding a single related id, presented as one multi-select.
struct FlatMany;

impl ViaTransformer for FlatMany {
    fn resolve(
        &self,
        r: &Resolver<'_>,
        spec: &FieldSpec,
        entity: &EntityType,
    ) -> Result<FieldDescriptor, BindError> {
        let (attr, from) = base_field(spec, entity)?;
        let AttrKind::HasMany {
            target,
            foreign_key,
        } = &attr.kind
        else {
            return Err(ConfigurationError::UnsupportedKind {
                entity: entity.name.clone(),
                attribute: from,
                kind: "flattened relation",
            }
            .into());
        };
        let through_ty = r.provider.entity_type(target)?;
        let value_attr = through_ty
            .attributes
            .iter()
            .find(|a| matches!(a.kind, AttrKind::BelongsTo { .. }) && a.name != *foreign_key)
            .ok_or_else(|| ConfigurationError::UnsupportedKind {
                entity: entity.name.clone(),
                attribute: from.clone(),
                kind: "flattened relation",
            })?;
        let AttrKind::BelongsTo {
            target: option_entity,
        } = &value_attr.kind
        else {
            unreachable!("matched BelongsTo above");
        };
        let mut d = FieldDescriptor::leaf(FieldKind::Select);
        d.key = Some(spec.key.clone().unwrap_or(from));
        d.attribute = Some(attr.name.clone());
        d.label = Some(spec.label.clone().unwrap_or_else(|| attr.label.clone()));
        d.multiple = true;
        d.required = spec.required.unwrap_or(attr.required);
        d.entity = Some(option_entity.clone());
        d.options = r.relation_options(option_entity, spec)?;
        d.label_attr = Some(spec.label_attr.clone().unwrap_or_else(|| "name".into()));
        d.through = Some(ThroughRelation {
            entity: target.clone(),
            foreign_key: foreign_key.clone(),
            value_attribute: value_attr.name.clone(),
        });
        Ok(d)
    }
}

fn range_leaf_kind(attr: &AttributeMeta) -> Result<FieldKind, BindError> {
    match attr.kind {
        AttrKind::Date | AttrKind::DateTime => Ok(FieldKind::Date),
        AttrKind::Integer { .. } => Ok(FieldKind::Number),
        AttrKind::Decimal => Ok(FieldKind::Decimal),
        _ => Err(ConfigurationError::UnsupportedKind {
            entity: String::new(),
            attribute: attr.name.clone(),
            kind: "range filter",
        }
        .into()),
    }
}

pub(crate) fn plural_days(n: i64) -> String {
    format!("{n} day(s)")
}

/// Search-form range over one attribute: two independent boundary inputs
/// under one logical key, optionally with a day-offset checkbox.
struct FilterFromTo;

impl ViaTransformer for FilterFromTo {
    fn resolve(
        &self,
        _r: &Resolver<'_>,
        spec: &FieldSpec,
        entity: &EntityType,
    ) -> Result<FieldDescriptor, BindError> {
        let (attr, from) = base_field(spec, entity)?;
        let leaf = range_leaf_kind(attr)?;
        let key_base = spec.key.clone().unwrap_or_else(|| from.clone());

        let mut children = Vec::new();
        for (suffix, op, label) in [("from", CmpOp::Gte, "from"), ("to", CmpOp::Lte, "to")] {
            let mut c = FieldDescriptor::leaf(leaf);
            c.key = Some(format!("{key_base}_{suffix}"));
            c.attribute = Some(attr.name.clone());
            c.label = Some(label.into());
            c.required = false;
            c.query_key = Some(format!(
                "{}__{}",
                attr.name,
                match op {
                    CmpOp::Gte => "gte",
                    _ => "lte",
                }
            ));
            c.filter_op = Some(op);
            children.push(c);
        }
        if let Some(days) = spec.plus_days {
            let mut c = FieldDescriptor::leaf(FieldKind::Boolean);
            c.key = Some(format!("{key_base}__plus"));
            c.label = Some(format!("+{}", plural_days(days)));
            c.required = false;
            c.query_key = Some(format!("{}__plus", attr.name));
            children.push(c);
        }

        let mut d = FieldDescriptor::group(children);
        d.label = spec
            .label
            .clone()
            .or_else(|| Some(attr.label.clone()));
        d.attribute = Some(attr.name.clone());
        d.range_policy = Some(RangePolicy::Flip);
        d.validators.push(Validator::FromTo);
        if spec.plus_days.is_some() {
            d.transformer = Some("plus_days".into());
            d.plus_days = spec.plus_days;
        }
        Ok(d)
    }
}

/// Month-only filter over a date attribute.
struct FilterFromToMonth;

impl ViaTransformer for FilterFromToMonth {
    fn resolve(
        &self,
        _r: &Resolver<'_>,
        spec: &FieldSpec,
        entity: &EntityType,
    ) -> Result<FieldDescriptor, BindError> {
        let (attr, from) = base_field(spec, entity)?;
        if !matches!(attr.kind, AttrKind::Date | AttrKind::DateTime) {
            return Err(ConfigurationError::UnsupportedKind {
                entity: entity.name.clone(),
                attribute: from,
                kind: "month filter",
            }
            .into());
        }
        let key_base = spec.key.clone().unwrap_or_else(|| from.clone());
        let mut d = FieldDescriptor::leaf(FieldKind::Month);
        d.key = Some(format!("{key_base}__month"));
        d.attribute = Some(attr.name.clone());
        d.label = spec.label.clone().or_else(|| Some(attr.label.clone()));
        d.required = false;
        d.query_key = Some(format!("{}__month", attr.name));
        d.filter_op = Some(CmpOp::Month);
        Ok(d)
    }
}

/// Base select widened to a multi-select for search forms.
struct FilterMultipleSelect;

impl ViaTransformer for FilterMultipleSelect {
    fn resolve(
        &self,
        r: &Resolver<'_>,
        spec: &FieldSpec,
        entity: &EntityType,
    ) -> Result<FieldDescriptor, BindError> {
        let (attr, _) = base_field(spec, entity)?;
        let mut stripped = spec.clone();
        stripped.via = None;
        let mut inner = r.field_from_attr(attr, &stripped, &entity.name)?;
        inner.multiple = true;
        inner.required = false;
        Ok(FieldDescriptor::group(vec![inner]))
    }
}

/// Shifts the lower/upper bound constraints of a date range by
/// `± plus_days` when the range's offset checkbox was ticked, then
/// removes the checkbox entry from the constraint set.
struct PlusDays;

impl FilterTransformer for PlusDays {
    fn apply(
        &self,
        filters: &mut FilterExpression,
        prefix: &str,
        desc: &FieldDescriptor,
    ) -> Result<(), BindError> {
        let enabled = filters
            .remove(&format!("{prefix}__plus"))
            .map(|c| c.value == json!(true))
            .unwrap_or(false);
        if !enabled {
            return Ok(());
        }
        let days = desc.plus_days.unwrap_or(0);
        for (suffix, direction) in [("gte", -1i64), ("lte", 1i64)] {
            let Some(cond) = filters.get_mut(&format!("{prefix}__{suffix}")) else {
                continue;
            };
            let Some(s) = cond.value.as_str() else {
                continue;
            };
            let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map_err(|_| BindError::Validation(format!("'{s}' is not a date")))?;
            let shifted = date + Duration::days(days * direction);
            cond.value = json!(shifted.format("%Y-%m-%d").to_string());
        }
        Ok(())
    }
}

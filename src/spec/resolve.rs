//! Schema resolution: merge an author-written spec tree with entity-type
//! metadata into a descriptor tree. Depth-first; the entity-type context
//! is threaded as an explicit argument and replaced (never merged) when
//! a node redefines it. Resolution is side-effect-free and re-run per
//! request.

use crate::error::{BindError, ConfigurationError};
use crate::filter::FilterExpression;
use crate::provider::{AttrKind, AttributeMeta, EntityType, PersistenceProvider};
use crate::spec::resolved::{
    FieldDescriptor, FieldKind, OptionEntry, OptionNode, Validator,
};
use crate::spec::transform::TransformerRegistry;
use crate::spec::types::{FieldSpec, NodeType};
use serde_json::{json, Value};

pub struct Resolver<'a> {
    pub(crate) provider: &'a dyn PersistenceProvider,
    pub(crate) transformers: &'a TransformerRegistry,
}

impl<'a> Resolver<'a> {
    pub fn new(provider: &'a dyn PersistenceProvider, transformers: &'a TransformerRegistry) -> Self {
        Resolver {
            provider,
            transformers,
        }
    }

    pub fn resolve(&self, spec: &FieldSpec, entity: &str) -> Result<FieldDescriptor, BindError> {
        tracing::debug!(entity, "resolving field spec");
        self.resolve_node(spec, entity)
    }

    pub(crate) fn resolve_node(
        &self,
        spec: &FieldSpec,
        entity: &str,
    ) -> Result<FieldDescriptor, BindError> {
        if let Some(via) = &spec.via {
            let transformer = self
                .transformers
                .via(via)
                .ok_or_else(|| ConfigurationError::UnknownTransformer(via.clone()))?;
            let ty = self.provider.entity_type(entity)?;
            return transformer.resolve(self, spec, ty);
        }
        let composite = spec.node.map_or(!spec.fields.is_empty(), NodeType::is_composite);
        if composite {
            return self.resolve_composite(spec, spec.node.unwrap_or(NodeType::Fields), entity);
        }
        self.resolve_leaf(spec, entity)
    }

    fn resolve_composite(
        &self,
        spec: &FieldSpec,
        node: NodeType,
        entity: &str,
    ) -> Result<FieldDescriptor, BindError> {
        match node {
            NodeType::Fields => {
                let children = self.resolve_children(&spec.fields, entity)?;
                let mut d = FieldDescriptor::group(children);
                d.key = spec.key.clone();
                d.label = spec.label.clone();
                Ok(d)
            }
            NodeType::ListField => {
                let element = spec
                    .entity
                    .clone()
                    .ok_or(ConfigurationError::MissingListEntity)?;
                // Validate the element type exists before descending.
                self.provider.entity_type(&element)?;
                let children = self.resolve_children(&spec.fields, &element)?;
                let mut d = FieldDescriptor::leaf(FieldKind::List);
                d.key = spec.key.clone();
                d.label = spec.label.clone();
                d.entity = Some(element);
                d.criteria = spec.criteria.clone();
                d.ordered = spec.ordered;
                d.children = children;
                Ok(d)
            }
            NodeType::ForeignKeyListField
            | NodeType::ForeignKeyUniqueItem
            | NodeType::FilterOfRelated => {
                let key = spec
                    .key
                    .clone()
                    .or_else(|| spec.from_field.clone())
                    .ok_or_else(|| {
                        ConfigurationError::InvalidSpec(
                            "reverse-relation node requires a key".into(),
                        )
                    })?;
                let ty = self.provider.entity_type(entity)?;
                let attr = ty.attribute(&key).ok_or_else(|| {
                    ConfigurationError::MissingReverseRelation {
                        entity: entity.into(),
                        relation: key.clone(),
                    }
                })?;
                let AttrKind::HasMany {
                    target,
                    foreign_key,
                } = &attr.kind
                else {
                    return Err(ConfigurationError::MissingReverseRelation {
                        entity: entity.into(),
                        relation: key,
                    }
                    .into());
                };
                let children = self.resolve_children(&spec.fields, target)?;
                let kind = match node {
                    NodeType::ForeignKeyListField => FieldKind::RelatedList,
                    NodeType::ForeignKeyUniqueItem => FieldKind::UniqueItem,
                    _ => FieldKind::Group,
                };
                let mut d = FieldDescriptor::leaf(kind);
                d.key = Some(key);
                d.label = spec.label.clone().or_else(|| Some(attr.label.clone()));
                d.entity = Some(target.clone());
                d.foreign_key = Some(foreign_key.clone());
                d.criteria = spec.criteria.clone();
                d.ordered = spec.ordered;
                d.children = children;
                Ok(d)
            }
            other => Err(ConfigurationError::UnsupportedNode(format!("{other:?}")).into()),
        }
    }

    fn resolve_children(
        &self,
        fields: &[FieldSpec],
        entity: &str,
    ) -> Result<Vec<FieldDescriptor>, BindError> {
        // Sibling order is preserved; it drives layout.
        fields
            .iter()
            .map(|f| self.resolve_node(f, entity))
            .collect()
    }

    pub(crate) fn resolve_leaf(
        &self,
        spec: &FieldSpec,
        entity: &str,
    ) -> Result<FieldDescriptor, BindError> {
        let Some(from) = spec.from_field.as_deref() else {
            return self.resolve_manual_leaf(spec, entity);
        };
        if let Some((head, rest)) = from.split_once('.') {
            return self.resolve_dotted(spec, entity, head, rest);
        }
        let ty = self.provider.entity_type(entity)?;
        if from == "id" {
            let mut d = FieldDescriptor::leaf(FieldKind::Hidden);
            d.key = Some(spec.key.clone().unwrap_or_else(|| "id".into()));
            d.attribute = Some("id".into());
            d.required = true;
            return Ok(d);
        }
        let attr = ty
            .attribute(from)
            .ok_or_else(|| ConfigurationError::MissingAttribute {
                entity: entity.into(),
                attribute: from.into(),
            })?;
        if spec.node == Some(NodeType::AttachmentsField) {
            let target = match &attr.kind {
                AttrKind::ManyToMany { target } => target.clone(),
                _ => {
                    return Err(ConfigurationError::UnsupportedKind {
                        entity: entity.into(),
                        attribute: from.into(),
                        kind: "attachments",
                    }
                    .into());
                }
            };
            let mut d = FieldDescriptor::leaf(FieldKind::Attachments);
            d.key = Some(spec.key.clone().unwrap_or_else(|| attr.name.clone()));
            d.attribute = Some(attr.name.clone());
            d.label = Some(spec.label.clone().unwrap_or_else(|| attr.label.clone()));
            d.entity = Some(target);
            d.name_attr = Some(spec.name_attr.clone().unwrap_or_else(|| "name".into()));
            d.required = spec.required.unwrap_or(false);
            return Ok(d);
        }
        let mut d = self.field_from_attr(attr, spec, entity)?;
        if let Some(node) = spec.node {
            if let Some(kind) = leaf_kind(node) {
                d.kind = kind;
            }
        }
        Ok(d)
    }

    /// Dotted `from_field`: switch to the related type and recurse on the
    /// remainder. The resulting leaf remembers the relation chain and is
    /// read-only for the Writer.
    fn resolve_dotted(
        &self,
        spec: &FieldSpec,
        entity: &str,
        head: &str,
        rest: &str,
    ) -> Result<FieldDescriptor, BindError> {
        let ty = self.provider.entity_type(entity)?;
        let attr = ty
            .attribute(head)
            .ok_or_else(|| ConfigurationError::MissingAttribute {
                entity: entity.into(),
                attribute: head.into(),
            })?;
        let AttrKind::BelongsTo { target } = &attr.kind else {
            return Err(ConfigurationError::UnsupportedKind {
                entity: entity.into(),
                attribute: head.into(),
                kind: "dotted-path",
            }
            .into());
        };
        let mut inner = spec.clone();
        inner.from_field = Some(rest.into());
        let mut d = self.resolve_leaf(&inner, target)?;
        d.path.insert(0, head.into());
        Ok(d)
    }

    /// Leaf with an explicit kind and no backing attribute. Used for
    /// manually declared filter inputs.
    fn resolve_manual_leaf(
        &self,
        spec: &FieldSpec,
        entity: &str,
    ) -> Result<FieldDescriptor, BindError> {
        let kind = spec.node.and_then(leaf_kind).ok_or_else(|| {
            ConfigurationError::UnsupportedNode(format!(
                "node without from_field, via or fields on entity '{entity}'"
            ))
        })?;
        let key = spec.key.clone().ok_or_else(|| {
            ConfigurationError::InvalidSpec("manual leaf requires a key".into())
        })?;
        let mut d = FieldDescriptor::leaf(kind);
        d.key = Some(key);
        d.label = spec.label.clone();
        d.required = spec.required.unwrap_or(false);
        d.placeholder = spec.placeholder.clone();
        d.query_key = spec.query_key.clone();
        Ok(d)
    }

    /// Map a declared attribute (plus spec overrides) onto a descriptor.
    pub(crate) fn field_from_attr(
        &self,
        attr: &AttributeMeta,
        spec: &FieldSpec,
        entity: &str,
    ) -> Result<FieldDescriptor, BindError> {
        let mut d = match &attr.kind {
            AttrKind::Bool => {
                let mut d = FieldDescriptor::leaf(FieldKind::Boolean);
                // Checkboxes are never required unless the spec insists.
                d.required = spec.required.unwrap_or(false);
                d
            }
            AttrKind::Text { choices, .. } if !choices.is_empty() => {
                let mut d = FieldDescriptor::leaf(FieldKind::Select);
                d.choice_backed = true;
                d.options = choice_options(choices);
                d.required = spec.required.unwrap_or(attr.required);
                d
            }
            AttrKind::Text { max_length, .. } => {
                let mut d = FieldDescriptor::leaf(FieldKind::Text);
                if let Some(m) = max_length {
                    d.validators.push(Validator::MaxLength { value: *m });
                }
                d.required = spec.required.unwrap_or(attr.required);
                d
            }
            AttrKind::LongText => {
                let mut d = FieldDescriptor::leaf(FieldKind::Textarea);
                d.required = spec.required.unwrap_or(attr.required);
                d
            }
            AttrKind::TextArray { .. } => {
                let mut d = FieldDescriptor::leaf(FieldKind::TextArray);
                d.required = spec.required.unwrap_or(attr.required);
                d
            }
            AttrKind::Integer { min, max } => {
                let mut d = FieldDescriptor::leaf(FieldKind::Number);
                if let Some(v) = spec.min.or(*min) {
                    d.validators.push(Validator::MinNumber { value: v });
                }
                if let Some(v) = spec.max.or(*max) {
                    d.validators.push(Validator::MaxNumber { value: v });
                }
                d.required = spec.required.unwrap_or(attr.required);
                d
            }
            AttrKind::Decimal => {
                let mut d = FieldDescriptor::leaf(FieldKind::Decimal);
                if let Some(v) = spec.min {
                    d.validators.push(Validator::MinNumber { value: v });
                }
                if let Some(v) = spec.max {
                    d.validators.push(Validator::MaxNumber { value: v });
                }
                d.required = spec.required.unwrap_or(attr.required);
                d
            }
            AttrKind::Date | AttrKind::DateTime => {
                let mut d = FieldDescriptor::leaf(FieldKind::Date);
                d.required = spec.required.unwrap_or(attr.required);
                d
            }
            AttrKind::File => {
                let mut d = FieldDescriptor::leaf(FieldKind::Image);
                d.required = spec.required.unwrap_or(attr.required);
                d
            }
            AttrKind::BelongsTo { target } => {
                let mut d = FieldDescriptor::leaf(FieldKind::Select);
                d.entity = Some(target.clone());
                d.options = self.relation_options(target, spec)?;
                d.label_attr = Some(spec.label_attr.clone().unwrap_or_else(|| "name".into()));
                d.projected = spec.project.clone();
                d.required = spec.required.unwrap_or(attr.required);
                if let Some(create) = &spec.create_form {
                    d.create_form = Some(Box::new(self.resolve_node(create, target)?));
                }
                d
            }
            AttrKind::ManyToMany { target } => {
                let mut d = FieldDescriptor::leaf(FieldKind::Select);
                d.multiple = true;
                d.entity = Some(target.clone());
                d.options = self.relation_options(target, spec)?;
                d.label_attr = Some(spec.label_attr.clone().unwrap_or_else(|| "name".into()));
                d.projected = spec.project.clone();
                d.required = spec.required.unwrap_or(attr.required);
                d
            }
            AttrKind::HasMany { .. } => {
                return Err(ConfigurationError::UnsupportedKind {
                    entity: entity.into(),
                    attribute: attr.name.clone(),
                    kind: "plain leaf",
                }
                .into());
            }
        };
        if let Some(p) = &spec.pattern {
            d.validators.push(Validator::Pattern { value: p.clone() });
        }
        d.key = Some(spec.key.clone().unwrap_or_else(|| attr.name.clone()));
        d.attribute = Some(attr.name.clone());
        d.label = Some(spec.label.clone().unwrap_or_else(|| attr.label.clone()));
        d.default = attr.default.clone();
        d.placeholder = spec.placeholder.clone();
        d.query_key = spec.query_key.clone();
        Ok(d)
    }

    /// Option list for a relation leaf: `{value, label, ...projected}` per
    /// candidate row, optionally grouped two-level by a related grouping
    /// attribute. Adjacent equal groups are merged; empty groups dropped.
    pub(crate) fn relation_options(
        &self,
        target: &str,
        spec: &FieldSpec,
    ) -> Result<Vec<OptionNode>, BindError> {
        let filter = FilterExpression::eq_criteria(&spec.option_filter);
        let rows = self.provider.query(target, &filter)?;
        tracing::debug!(target, count = rows.len(), "loaded relation options");
        let label_attr = spec.label_attr.as_deref().unwrap_or("name");

        let mut entries: Vec<(Option<i64>, OptionEntry)> = Vec::new();
        for row in &rows {
            let label = row
                .get(label_attr)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let mut entry = OptionEntry::new(json!(row.id.unwrap_or_default()), label);
            for p in &spec.project {
                entry
                    .extra
                    .insert(p.clone(), row.get(p).cloned().unwrap_or(Value::Null));
            }
            let group_id = spec
                .option_group
                .as_deref()
                .and_then(|g| row.get_id(g));
            entries.push((group_id, entry));
        }

        let Some(group_attr) = spec.option_group.as_deref() else {
            return Ok(entries
                .into_iter()
                .map(|(_, e)| OptionNode::Entry(e))
                .collect());
        };

        let target_ty = self.provider.entity_type(target)?;
        let group_entity = match target_ty.attribute(group_attr).map(|a| &a.kind) {
            Some(AttrKind::BelongsTo { target }) => target.clone(),
            _ => {
                return Err(ConfigurationError::UnsupportedKind {
                    entity: target.into(),
                    attribute: group_attr.into(),
                    kind: "option-group",
                }
                .into());
            }
        };
        let group_label_attr = spec.option_group_label.as_deref().unwrap_or("name");

        entries.sort_by_key(|(gid, _)| gid.unwrap_or(0));
        let mut groups: Vec<OptionNode> = Vec::new();
        let mut current: Option<(Option<i64>, String, Vec<OptionEntry>)> = None;
        for (gid, entry) in entries {
            match &mut current {
                Some((cur_gid, _, items)) if *cur_gid == gid => items.push(entry),
                _ => {
                    if let Some((_, label, items)) = current.take() {
                        if !items.is_empty() {
                            groups.push(OptionNode::Group {
                                label,
                                options: items,
                            });
                        }
                    }
                    let label = match gid {
                        Some(gid) => self
                            .provider
                            .get(&group_entity, gid)?
                            .and_then(|g| {
                                g.get(group_label_attr)
                                    .and_then(Value::as_str)
                                    .map(str::to_string)
                            })
                            .unwrap_or_default(),
                        None => String::new(),
                    };
                    current = Some((gid, label, vec![entry]));
                }
            }
        }
        if let Some((_, label, items)) = current {
            if !items.is_empty() {
                groups.push(OptionNode::Group {
                    label,
                    options: items,
                });
            }
        }
        Ok(groups)
    }
}

/// Explicit leaf-kind override carried by a spec node.
fn leaf_kind(node: NodeType) -> Option<FieldKind> {
    match node {
        NodeType::BooleanField => Some(FieldKind::Boolean),
        NodeType::TextField => Some(FieldKind::Text),
        NodeType::TextareaField => Some(FieldKind::Textarea),
        NodeType::NumberField => Some(FieldKind::Number),
        NodeType::DecimalField => Some(FieldKind::Decimal),
        NodeType::DateField => Some(FieldKind::Date),
        NodeType::MonthField => Some(FieldKind::Month),
        NodeType::HiddenField => Some(FieldKind::Hidden),
        NodeType::SelectField => Some(FieldKind::Select),
        NodeType::ImageField => Some(FieldKind::Image),
        _ => None,
    }
}

fn choice_options(choices: &[crate::provider::Choice]) -> Vec<OptionNode> {
    choices
        .iter()
        .map(|c| OptionNode::Entry(OptionEntry::new(c.value.clone(), c.label.clone())))
        .collect()
}

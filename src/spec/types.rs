//! Author-written field specs. Static per view, authored as JSON and
//! resolved against an entity type per request.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Structural node type or explicit leaf-kind override. Absent means the
/// kind is inferred from the backing attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    /// Plain grouping of child fields; no context switch.
    Fields,
    /// Bulk collection of a named element entity (root-level editing).
    ListField,
    /// Nested child collection over a reverse one-to-many relation.
    ForeignKeyListField,
    /// Singleton child over a reverse relation (first row, get-or-create).
    ForeignKeyUniqueItem,
    /// Filter-form subtree over a reverse relation; emitted constraint
    /// keys are prefixed with the relation path.
    FilterOfRelated,
    AttachmentsField,
    // Leaf-kind overrides.
    BooleanField,
    TextField,
    TextareaField,
    NumberField,
    DecimalField,
    DateField,
    MonthField,
    HiddenField,
    SelectField,
    ImageField,
}

impl NodeType {
    /// True for node types that carry child fields.
    pub fn is_composite(self) -> bool {
        matches!(
            self,
            NodeType::Fields
                | NodeType::ListField
                | NodeType::ForeignKeyListField
                | NodeType::ForeignKeyUniqueItem
                | NodeType::FilterOfRelated
        )
    }
}

/// One node of an author-written field tree.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub node: Option<NodeType>,
    /// Backing attribute; dotted segments cross single relations.
    pub from_field: Option<String>,
    /// Output key; defaults to the backing attribute name.
    pub key: Option<String>,
    /// Named transformer that takes over resolution of this node.
    pub via: Option<String>,
    pub fields: Vec<FieldSpec>,
    /// Element entity for a `ListField` root.
    pub entity: Option<String>,
    /// Ownership constraint scoping which rows a collection sees/mutates.
    pub criteria: Map<String, Value>,
    pub label: Option<String>,
    pub placeholder: Option<String>,
    /// Override of the attribute-derived required flag.
    pub required: Option<bool>,
    /// Collection items carry an `order` attribute assigned 1..n on write.
    pub ordered: bool,
    /// Attribute of the option entity used to group options two-level.
    pub option_group: Option<String>,
    /// Attribute of the group entity used as the group label (default `name`).
    pub option_group_label: Option<String>,
    /// Option label attribute on the related entity (default `name`).
    pub label_attr: Option<String>,
    /// Extra option columns projected into `{value, label, ...}` entries.
    pub project: Vec<String>,
    /// Criteria applied to the option query of a relation leaf.
    pub option_filter: Map<String, Value>,
    /// Nested create sub-form resolved against the related type.
    pub create_form: Option<Box<FieldSpec>>,
    /// Day-offset knob for date-range filter transformers.
    pub plus_days: Option<i64>,
    /// Attribute whose current value selects the active branch.
    pub discriminator: Option<String>,
    /// Discriminant value -> sub-spec, for the polymorphic defined field.
    pub branches: BTreeMap<String, FieldSpec>,
    pub min: Option<i64>,
    pub max: Option<i64>,
    /// Regex the submitted text must match.
    pub pattern: Option<String>,
    /// Constraint-key override for the filter builder.
    pub query_key: Option<String>,
    /// Attachment display-name attribute (default `name`).
    pub name_attr: Option<String>,
}

impl FieldSpec {
    /// Leaf bound to an attribute of the current entity type.
    pub fn attr(from_field: &str) -> Self {
        FieldSpec {
            from_field: Some(from_field.into()),
            ..Default::default()
        }
    }

    /// Keyless grouping of child specs.
    pub fn group(fields: Vec<FieldSpec>) -> Self {
        FieldSpec {
            node: Some(NodeType::Fields),
            fields,
            ..Default::default()
        }
    }

    pub fn with_via(mut self, via: &str) -> Self {
        self.via = Some(via.into());
        self
    }

    pub fn with_key(mut self, key: &str) -> Self {
        self.key = Some(key.into());
        self
    }
}

//! Resolved field descriptors: spec nodes merged with entity-type
//! metadata, flattened for runtime use. Never mutated after resolution;
//! recomputed per request.

use serde::Serialize;
use serde_json::{Map, Value};

/// Kind of a resolved field. Each leaf kind has exactly one encode/decode
/// contract; the Reader's output for an unmodified value is accepted
/// unchanged by the Writer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Boolean,
    Text,
    Textarea,
    /// Array-backed text, newline-joined on the wire.
    TextArray,
    Number,
    Decimal,
    Date,
    Month,
    Hidden,
    Select,
    /// Paired from/to attributes under one key.
    Range,
    /// Discriminated sub-schema.
    Defined,
    Attachments,
    Image,
    /// Plain grouping node.
    Group,
    /// Bulk collection of a named element entity.
    List,
    /// Reverse one-to-many child collection.
    RelatedList,
    /// Singleton reverse-relation child.
    UniqueItem,
}

/// Client-side validation rules mirrored from entity metadata and spec.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Validator {
    MaxLength { value: u32 },
    MinNumber { value: i64 },
    MaxNumber { value: i64 },
    Pattern { value: String },
    FromTo,
}

/// One selectable option: `{value, label}` plus projected extras.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OptionEntry {
    pub value: Value,
    pub label: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OptionEntry {
    pub fn new(value: impl Into<Value>, label: impl Into<String>) -> Self {
        OptionEntry {
            value: value.into(),
            label: label.into(),
            extra: Map::new(),
        }
    }

    /// JSON shape used in value trees: `{value, label, ...extra}`.
    pub fn to_value(&self) -> Value {
        let mut m = Map::new();
        m.insert("value".into(), self.value.clone());
        m.insert("label".into(), Value::String(self.label.clone()));
        for (k, v) in &self.extra {
            m.insert(k.clone(), v.clone());
        }
        Value::Object(m)
    }
}

/// Flat or two-level grouped option list.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OptionNode {
    Group {
        label: String,
        options: Vec<OptionEntry>,
    },
    Entry(OptionEntry),
}

/// Find a single option by value across groups.
pub fn find_option<'a>(options: &'a [OptionNode], value: &Value) -> Option<&'a OptionEntry> {
    for node in options {
        match node {
            OptionNode::Entry(e) => {
                if &e.value == value {
                    return Some(e);
                }
            }
            OptionNode::Group { options, .. } => {
                if let Some(e) = options.iter().find(|e| &e.value == value) {
                    return Some(e);
                }
            }
        }
    }
    None
}

/// Filter an option tree to the given values, preserving structure.
/// Groups left empty are dropped.
pub fn find_options(options: &[OptionNode], values: &[Value]) -> Vec<OptionNode> {
    let mut out = Vec::new();
    for node in options {
        match node {
            OptionNode::Entry(e) => {
                if values.contains(&e.value) {
                    out.push(node.clone());
                }
            }
            OptionNode::Group { label, options } => {
                let kept: Vec<OptionEntry> = options
                    .iter()
                    .filter(|e| values.contains(&e.value))
                    .cloned()
                    .collect();
                if !kept.is_empty() {
                    out.push(OptionNode::Group {
                        label: label.clone(),
                        options: kept,
                    });
                }
            }
        }
    }
    out
}

/// Flatten a possibly grouped option tree.
pub fn plain_options(options: &[OptionNode]) -> Vec<&OptionEntry> {
    let mut out = Vec::new();
    for node in options {
        match node {
            OptionNode::Entry(e) => out.push(e),
            OptionNode::Group { options, .. } => out.extend(options.iter()),
        }
    }
    out
}

/// Tie-break policy for from/to range pairs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RangePolicy {
    /// Swap the two boundary constraints when from > to.
    Flip,
}

/// Flattened multi-valued reverse relation: rows of `entity` owned via
/// `foreign_key`, each carrying one selected id under `value_attribute`.
#[derive(Clone, Debug, Serialize)]
pub struct ThroughRelation {
    pub entity: String,
    pub foreign_key: String,
    pub value_attribute: String,
}

/// Comparison operator a filter leaf contributes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq,
    In,
    Gte,
    Lte,
    /// Calendar-month match on a date attribute.
    Month,
}

/// A spec node resolved against a concrete entity type. Structural shape
/// is a pure function of (spec, entity type); only leaf values vary per
/// instance.
#[derive(Clone, Debug, Serialize)]
pub struct FieldDescriptor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub kind: FieldKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub required: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub multiple: bool,
    /// Options come from declared attribute choices rather than rows.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub choice_backed: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<OptionNode>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub validators: Vec<Validator>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Resolved attribute name on the context entity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    /// Relation chain preceding `attribute` for dotted `from_field`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
    /// Related entity type, where applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    /// Child foreign-key attribute for RelatedList/UniqueItem nodes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub foreign_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub through: Option<ThroughRelation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label_attr: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub projected: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_attr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_op: Option<CmpOp>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub criteria: Map<String, Value>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub ordered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    /// Named filter post-processor for this subtree's constraint set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transformer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plus_days: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range_policy: Option<RangePolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_form: Option<Box<FieldDescriptor>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discriminator: Option<String>,
    /// Resolved branch sub-schemas keyed by discriminant, in spec order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<(String, FieldDescriptor)>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FieldDescriptor>,
}

impl FieldDescriptor {
    /// Bare descriptor of the given kind; resolution fills the rest in.
    pub fn leaf(kind: FieldKind) -> Self {
        FieldDescriptor {
            key: None,
            kind,
            label: None,
            required: false,
            multiple: false,
            choice_backed: false,
            options: Vec::new(),
            validators: Vec::new(),
            default: None,
            attribute: None,
            path: Vec::new(),
            entity: None,
            foreign_key: None,
            through: None,
            label_attr: None,
            projected: Vec::new(),
            name_attr: None,
            query_key: None,
            filter_op: None,
            criteria: Map::new(),
            ordered: false,
            placeholder: None,
            transformer: None,
            plus_days: None,
            range_policy: None,
            create_form: None,
            discriminator: None,
            branches: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn group(children: Vec<FieldDescriptor>) -> Self {
        let mut d = FieldDescriptor::leaf(FieldKind::Group);
        d.children = children;
        d
    }

    pub fn branch(&self, discriminant: &str) -> Option<&FieldDescriptor> {
        self.branches
            .iter()
            .find(|(k, _)| k == discriminant)
            .map(|(_, d)| d)
    }

    pub fn is_composite(&self) -> bool {
        matches!(
            self.kind,
            FieldKind::Group | FieldKind::List | FieldKind::RelatedList | FieldKind::UniqueItem
        )
    }
}

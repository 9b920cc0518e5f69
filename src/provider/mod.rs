//! Abstract persistence collaborator: entity-type introspection plus CRUD,
//! filtered querying, relation membership and transaction scoping. The
//! engine never touches storage directly; everything goes through this
//! trait.

pub mod memory;

pub use memory::MemoryProvider;

use crate::error::ProviderError;
use crate::filter::FilterExpression;
use serde_json::{Map, Value};

/// One persisted row, shaped as JSON attributes. `id == None` means the
/// instance has never been saved; relation and collection reads degrade
/// to their documented empty values on such instances.
#[derive(Clone, Debug, PartialEq)]
pub struct Instance {
    pub entity: String,
    pub id: Option<i64>,
    pub attrs: Map<String, Value>,
}

impl Instance {
    /// A blank, unsaved instance of the given entity type.
    pub fn new(entity: impl Into<String>) -> Self {
        Instance {
            entity: entity.into(),
            id: None,
            attrs: Map::new(),
        }
    }

    pub fn is_saved(&self) -> bool {
        self.id.is_some()
    }

    pub fn get(&self, attr: &str) -> Option<&Value> {
        self.attrs.get(attr)
    }

    pub fn set(&mut self, attr: impl Into<String>, value: Value) {
        self.attrs.insert(attr.into(), value);
    }

    /// Attribute read as a relation id, if set.
    pub fn get_id(&self, attr: &str) -> Option<i64> {
        self.attrs.get(attr).and_then(Value::as_i64)
    }
}

/// One allowed value of a choice-backed attribute.
#[derive(Clone, Debug, PartialEq)]
pub struct Choice {
    pub value: Value,
    pub label: String,
}

impl Choice {
    pub fn new(value: impl Into<Value>, label: impl Into<String>) -> Self {
        Choice {
            value: value.into(),
            label: label.into(),
        }
    }
}

/// Storage-level kind of one declared attribute.
#[derive(Clone, Debug, PartialEq)]
pub enum AttrKind {
    Bool,
    Text {
        max_length: Option<u32>,
        choices: Vec<Choice>,
    },
    LongText,
    TextArray {
        choices: Vec<Choice>,
    },
    Integer {
        min: Option<i64>,
        max: Option<i64>,
    },
    Decimal,
    Date,
    DateTime,
    File,
    /// Single relation; the instance stores the related id under the
    /// attribute name.
    BelongsTo {
        target: String,
    },
    ManyToMany {
        target: String,
    },
    /// Reverse one-to-many: rows of `target` whose `foreign_key` points
    /// back at this entity.
    HasMany {
        target: String,
        foreign_key: String,
    },
}

#[derive(Clone, Debug)]
pub struct AttributeMeta {
    pub name: String,
    pub label: String,
    pub kind: AttrKind,
    pub required: bool,
    pub default: Option<Value>,
}

impl AttributeMeta {
    pub fn new(name: &str, label: &str, kind: AttrKind) -> Self {
        AttributeMeta {
            name: name.into(),
            label: label.into(),
            kind,
            required: false,
            default: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, v: Value) -> Self {
        self.default = Some(v);
        self
    }
}

/// Introspected entity type: declared attributes in declaration order.
#[derive(Clone, Debug)]
pub struct EntityType {
    pub name: String,
    pub attributes: Vec<AttributeMeta>,
}

impl EntityType {
    pub fn new(name: &str, attributes: Vec<AttributeMeta>) -> Self {
        EntityType {
            name: name.into(),
            attributes,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeMeta> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

/// Synchronous persistence collaborator. Implementations are expected to
/// keep `query` results ordered by id so resolved option lists and
/// collection reads are deterministic.
pub trait PersistenceProvider {
    fn entity_type(&self, name: &str) -> Result<&EntityType, ProviderError>;

    fn get(&self, entity: &str, id: i64) -> Result<Option<Instance>, ProviderError>;

    fn query(
        &self,
        entity: &str,
        filter: &FilterExpression,
    ) -> Result<Vec<Instance>, ProviderError>;

    /// Persist a new row; returns the instance with its assigned id.
    fn insert(&self, instance: &Instance) -> Result<Instance, ProviderError>;

    /// Overwrite the attributes of an existing row.
    fn update(&self, instance: &Instance) -> Result<Instance, ProviderError>;

    fn delete(&self, entity: &str, id: i64) -> Result<(), ProviderError>;

    /// Current member ids of a many-to-many attribute, ordered.
    fn relation_ids(
        &self,
        entity: &str,
        id: i64,
        attribute: &str,
    ) -> Result<Vec<i64>, ProviderError>;

    fn relation_add(
        &self,
        entity: &str,
        id: i64,
        attribute: &str,
        related_id: i64,
    ) -> Result<(), ProviderError>;

    fn relation_remove(
        &self,
        entity: &str,
        id: i64,
        attribute: &str,
        related_id: i64,
    ) -> Result<(), ProviderError>;

    /// Open a transaction scope. The engine wraps every write in one;
    /// a failed write must leave storage untouched after `rollback`.
    fn begin(&self) -> Result<(), ProviderError>;

    fn commit(&self) -> Result<(), ProviderError>;

    fn rollback(&self) -> Result<(), ProviderError>;
}

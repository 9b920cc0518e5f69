//! Typed errors for spec resolution, reading, writing and filtering.

use thiserror::Error;

/// Build-time defects: the spec references something the entity type
/// does not have, or pairs a node with an unsupported kind. Raised
/// immediately, never caught internally.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("no attribute '{attribute}' on entity '{entity}'")]
    MissingAttribute { entity: String, attribute: String },
    #[error("no reverse relation '{relation}' on entity '{entity}'")]
    MissingReverseRelation { entity: String, relation: String },
    #[error("unknown transformer '{0}'")]
    UnknownTransformer(String),
    #[error("unsupported node: {0}")]
    UnsupportedNode(String),
    #[error("attribute '{attribute}' on '{entity}' cannot back a {kind} field")]
    UnsupportedKind {
        entity: String,
        attribute: String,
        kind: &'static str,
    },
    #[error("list node requires an element entity")]
    MissingListEntity,
    #[error("invalid spec: {0}")]
    InvalidSpec(String),
}

/// Errors reported by a persistence provider.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("unknown entity type '{0}'")]
    UnknownEntity(String),
    #[error("unknown attribute '{attribute}' on entity '{entity}'")]
    UnknownAttribute { entity: String, attribute: String },
    #[error("no {entity} with id {id}")]
    NotFound { entity: String, id: i64 },
    #[error("transaction already active")]
    TransactionActive,
    #[error("no active transaction")]
    NoTransaction,
    #[error("storage: {0}")]
    Storage(String),
}

/// Runtime error taxonomy for the binding engine.
#[derive(Error, Debug)]
pub enum BindError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    /// A submitted value failed coercion; surfaced for field-level messaging.
    #[error("validation: {0}")]
    Validation(String),
    /// A submitted collection item violates its declared ownership criteria.
    #[error("consistency: {0}")]
    Consistency(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

//! Declarative field binding: resolve author-written field specs
//! against entity metadata into typed descriptor trees, then read,
//! write, search and project through one engine surface.

pub mod codec;
pub mod engine;
pub mod error;
pub mod filter;
pub mod project;
pub mod provider;
pub mod read;
pub mod spec;
pub mod walk;
pub mod write;

pub use engine::{Engine, Form};
pub use error::{BindError, ConfigurationError, ProviderError};
pub use filter::{Condition, FilterBuilder, FilterExpression, RawQuery};
pub use project::{InclusionEntry, InclusionMap, InclusionOption};
pub use provider::{
    AttrKind, AttributeMeta, Choice, EntityType, Instance, MemoryProvider, PersistenceProvider,
};
pub use read::Reader;
pub use spec::{
    CmpOp, FieldDescriptor, FieldKind, FieldSpec, NodeType, Resolver, TransformerRegistry,
};
pub use write::{Blob, BlobMap, WriteTarget, Writer, Written};

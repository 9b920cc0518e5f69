//! Declarative field specs and their resolution into descriptor trees.

pub mod resolve;
pub mod resolved;
pub mod transform;
pub mod types;

pub use resolve::Resolver;
pub use resolved::{
    CmpOp, FieldDescriptor, FieldKind, OptionEntry, OptionNode, RangePolicy, ThroughRelation,
    Validator,
};
pub use transform::{FilterTransformer, TransformerRegistry, ViaTransformer};
pub use types::{FieldSpec, NodeType};

//! Data-element evaluation engine: the document-modeling core of a
//! protocol/file-format fuzzer. Declare a document as a tree of typed
//! elements, then compute the exact byte/bit sequence it currently
//! represents, with cross-element relations, pluggable fixups and chainable
//! transformers.

pub mod bits;
pub mod config;
pub mod element;
pub mod expr;
pub mod fixup;
pub mod model;
pub mod relation;
pub mod transform;
pub mod value;

pub use bits::{BitStream, BitsError, Endian};
pub use config::{EngineConfig, OverlapPolicy};
pub use element::{Element, ElementId, ElementKind, LengthSpec, MutateFlags, StringEncoding};
pub use expr::{Evaluator, FnEvaluator, Scope};
pub use fixup::{ChecksumFixup, Fixup, SequenceCounter, SequenceIncrementFixup};
pub use model::{DataModel, GenerateError, ModelError};
pub use relation::{Relation, RelationKind, RelationSet};
pub use transform::{HexTransformer, Transformer, TransformerChain, XorTransformer};
pub use value::{ValueError, Variant};

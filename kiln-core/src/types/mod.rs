//! Core data model: ops, vertices, definitions, and layer chains.

pub mod chain;
pub mod op;
pub mod vertex;

pub use chain::{LayerChain, WorkerResult};
pub use op::{ExecOp, FileAction, FileActionKind, FileOp, MergeOp, DiffOp, Mount, Op, SourceOp, BuildOp};
pub use vertex::{Definition, OpDef, Vertex, VertexInput};

//! Kiln Core Library
//!
//! The solver and content-addressed build cache of the Kiln image build
//! engine: deterministic two-level cache keys per DAG vertex, deduplicated
//! concurrent evaluation across jobs, durable cache records over SQLite, and
//! merge/diff layer-chain semantics.

pub mod cachekey;
pub mod config;
pub mod digest;
pub mod error;
pub mod solver;
pub mod store;
pub mod types;
pub mod worker;

// Re-export commonly used items
pub use cachekey::{compose_key, output_key, CacheKeyEngine, KeyDomain, SlowKeyPart};
pub use config::SolverConfig;
pub use digest::Digest;
pub use error::{KilnError, Result, SourceLocation};
pub use solver::{Job, ProgressBus, ProgressEvent, SolveOutput, Solver, VertexState};
pub use store::{CacheRecord, CacheStore, NormalizedLink, StoredResult};
pub use types::{Definition, LayerChain, Op, OpDef, Vertex, VertexInput, WorkerResult};
pub use worker::{ResultLease, Worker};

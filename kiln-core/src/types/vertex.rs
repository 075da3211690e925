//! Vertices and build definitions.
//!
//! A frontend submits a `Definition`: a topologically ordered array of ops
//! with input references by index. The solver validates it and materializes
//! the immutable `Vertex` graph it solves over.

use crate::digest::Digest;
use crate::error::{KilnError, Result};
use crate::types::op::Op;
use serde::{Deserialize, Serialize};

/// Reference to one output of another vertex, with the selector restricting
/// the portion of that input the op consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertexInput {
    /// Index of the referenced op within the definition.
    pub vertex: usize,
    /// Output index of the referenced op.
    #[serde(default)]
    pub output: usize,
    /// Opaque selector; two entries with the same op and input but different
    /// selectors are distinct cache entries.
    #[serde(default)]
    pub selector: String,
}

/// One entry of a definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpDef {
    pub op: Op,
    #[serde(default)]
    pub inputs: Vec<VertexInput>,
    /// Optional display name; defaults to the op's own name.
    #[serde(default)]
    pub name: Option<String>,
}

/// A topologically ordered build DAG as submitted by a frontend.
///
/// The last op is the terminal vertex of the submitted sub-DAG.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    pub ops: Vec<OpDef>,
}

/// An immutable vertex of the build graph.
#[derive(Debug, Clone)]
pub struct Vertex {
    /// Content digest of the op payload.
    pub digest: Digest,
    pub op: Op,
    pub inputs: Vec<VertexInput>,
    pub name: String,
}

impl Definition {
    pub fn new(ops: Vec<OpDef>) -> Self {
        Self { ops }
    }

    /// Validate acyclicity and input-slot completeness.
    ///
    /// Input references must point strictly backwards in the array, every
    /// declared arity must be satisfied, and no input slot may be empty.
    pub fn validate(&self) -> Result<()> {
        if self.ops.is_empty() {
            return Err(KilnError::InvalidGraph { reason: "definition has no ops".into() });
        }
        for (i, def) in self.ops.iter().enumerate() {
            let digest = def.op.digest();
            if let Some(required) = def.op.required_arity() {
                if def.inputs.len() != required {
                    return Err(KilnError::InvalidGraph {
                        reason: format!(
                            "op {} at index {} requires {} inputs, has {}",
                            digest,
                            i,
                            required,
                            def.inputs.len()
                        ),
                    });
                }
            }
            if matches!(def.op, Op::Merge(_)) && def.inputs.is_empty() {
                return Err(KilnError::EmptyInputSlot { digest, input: 0 });
            }
            for input in &def.inputs {
                // Backward references only; forward or self references make
                // the array non-topological.
                if input.vertex >= i {
                    return Err(KilnError::InvalidGraph {
                        reason: format!(
                            "op at index {} references input {} at or after itself",
                            i, input.vertex
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    /// Materialize the vertex graph. Call `validate` first.
    pub fn vertices(&self) -> Vec<Vertex> {
        self.ops
            .iter()
            .map(|def| Vertex {
                digest: def.op.digest(),
                op: def.op.clone(),
                inputs: def.inputs.clone(),
                name: def.name.clone().unwrap_or_else(|| def.op.name()),
            })
            .collect()
    }

    /// Index of the terminal vertex.
    pub fn target(&self) -> usize {
        self.ops.len().saturating_sub(1)
    }
}

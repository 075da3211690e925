//! Build operations.
//!
//! Ops are a closed sum of variants. The solver never interprets the
//! payloads beyond three capabilities: contributing to the fast key (via the
//! op digest), declaring per-input slow keying, and deciding whether the op
//! executes in the worker at all (merge and diff do not).

use crate::digest::Digest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single operation in the build DAG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Op {
    /// Run a command over mounted inputs.
    Exec(ExecOp),
    /// Filesystem actions (copy, mkdir, rm, mkfile) over inputs.
    File(FileOp),
    /// Fetch an external source; roots of the DAG.
    Source(SourceOp),
    /// Combine input layer chains in order without execution.
    Merge(MergeOp),
    /// Layers of `upper` that are not in `lower`'s chain.
    Diff(DiffOp),
    /// Invoke a frontend build as an op.
    Build(BuildOp),
}

/// Mount of an input into an exec op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Input slot this mount consumes.
    pub input: usize,
    /// Destination path inside the exec environment.
    pub dest: String,
    #[serde(default)]
    pub readonly: bool,
    /// Key this input by materialized content rather than structure alone.
    #[serde(default)]
    pub content_based: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOp {
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileActionKind {
    Copy,
    Mkdir,
    Mkfile,
    Rm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAction {
    pub kind: FileActionKind,
    /// Source path, for actions that read an input.
    #[serde(default)]
    pub src: Option<String>,
    pub dest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOp {
    pub actions: Vec<FileAction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOp {
    /// Source identifier, e.g. `docker-image://alpine:3.19` or `local://context`.
    pub identifier: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOp {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffOp {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOp {
    /// Frontend reference resolved by the worker.
    pub frontend: String,
    #[serde(default)]
    pub opts: BTreeMap<String, String>,
}

impl Op {
    /// Content digest of the op payload. Two vertices carrying equal
    /// payloads share an op digest; their cache keys still differ if their
    /// inputs differ.
    pub fn digest(&self) -> Digest {
        // Serialization of a closed enum with ordered maps is deterministic.
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        Digest::from_bytes(bytes)
    }

    /// Display name for progress output.
    pub fn name(&self) -> String {
        match self {
            Op::Exec(e) => format!("exec {}", e.args.join(" ")),
            Op::File(f) => format!("file ({} actions)", f.actions.len()),
            Op::Source(s) => s.identifier.clone(),
            Op::Merge(_) => "merge".to_string(),
            Op::Diff(_) => "diff".to_string(),
            Op::Build(b) => format!("build {}", b.frontend),
        }
    }

    /// Whether slow (content-based) keying applies to input slot `input`.
    pub fn content_based(&self, input: usize) -> bool {
        match self {
            Op::Exec(e) => {
                e.mounts.iter().any(|m| m.input == input && m.content_based)
            }
            // File actions always consume input content.
            Op::File(_) => true,
            Op::Source(_) | Op::Merge(_) | Op::Diff(_) | Op::Build(_) => false,
        }
    }

    /// Whether this op runs in the worker. Merge and diff are resolved by
    /// chain algebra in the solver; everything else executes.
    pub fn executes(&self) -> bool {
        !matches!(self, Op::Merge(_) | Op::Diff(_))
    }

    /// Arity constraint, if the op kind imposes one.
    pub fn required_arity(&self) -> Option<usize> {
        match self {
            Op::Source(_) => Some(0),
            Op::Diff(_) => Some(2),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec(args: &[&str]) -> Op {
        Op::Exec(ExecOp {
            args: args.iter().map(|s| s.to_string()).collect(),
            env: BTreeMap::new(),
            mounts: vec![],
        })
    }

    #[test]
    fn test_op_digest_depends_on_payload() {
        assert_eq!(exec(&["sh", "-c", "make"]).digest(), exec(&["sh", "-c", "make"]).digest());
        assert_ne!(exec(&["sh", "-c", "make"]).digest(), exec(&["sh", "-c", "test"]).digest());
    }

    #[test]
    fn test_op_digest_distinguishes_variants() {
        let merge = Op::Merge(MergeOp::default());
        let diff = Op::Diff(DiffOp::default());
        assert_ne!(merge.digest(), diff.digest());
    }

    #[test]
    fn test_content_based_declaration() {
        let op = Op::Exec(ExecOp {
            args: vec!["cp".into()],
            env: BTreeMap::new(),
            mounts: vec![Mount {
                input: 1,
                dest: "/src".into(),
                readonly: true,
                content_based: true,
            }],
        });
        assert!(!op.content_based(0));
        assert!(op.content_based(1));

        let src = Op::Source(SourceOp { identifier: "local://ctx".into(), attrs: BTreeMap::new() });
        assert!(!src.content_based(0));
    }

    #[test]
    fn test_merge_diff_do_not_execute() {
        assert!(!Op::Merge(MergeOp::default()).executes());
        assert!(!Op::Diff(DiffOp::default()).executes());
        assert!(exec(&["true"]).executes());
    }
}

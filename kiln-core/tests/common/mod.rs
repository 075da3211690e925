//! Test worker and definition builders shared by the solve tests.

use async_trait::async_trait;
use kiln_core::types::op::{ExecOp, DiffOp, MergeOp, Mount, Op, SourceOp};
use kiln_core::{
    Definition, Digest, KilnError, LayerChain, OpDef, Result, ResultLease, VertexInput, Worker,
    WorkerResult,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

/// Call at the top of a test to see solver logs with `RUST_LOG`.
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// In-memory worker with call accounting.
///
/// Results are pure functions of op payload and input content, so repeated
/// executions of equal work produce equal chains with fresh handle ids.
pub struct TestWorker {
    execs: Mutex<HashMap<String, usize>>,
    refs: Mutex<HashMap<String, i64>>,
    contents: Mutex<HashMap<(String, String), Digest>>,
    delays: Mutex<HashMap<String, Duration>>,
    failures: Mutex<HashSet<String>>,
    aborts: Arc<Mutex<Vec<String>>>,
    next_id: AtomicUsize,
}

impl TestWorker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            execs: Mutex::new(HashMap::new()),
            refs: Mutex::new(HashMap::new()),
            contents: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashSet::new()),
            aborts: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicUsize::new(0),
        })
    }

    /// Configure the content digest reported for `selector` over the result
    /// of `op`.
    pub fn set_content(&self, op: &Op, selector: &str, content: Digest) {
        let blob = op_blob(op);
        self.contents.lock().unwrap().insert((blob.as_str().to_string(), selector.to_string()), content);
    }

    /// Make executions of ops named `name` sleep for `delay`.
    pub fn set_delay(&self, name: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(name.to_string(), delay);
    }

    /// Make executions of ops named `name` fail.
    pub fn fail_on(&self, name: &str) {
        self.failures.lock().unwrap().insert(name.to_string());
    }

    pub fn exec_count(&self, name: &str) -> usize {
        self.execs.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    /// Outstanding references across every handle the worker has seen.
    pub fn outstanding_refs(&self) -> i64 {
        self.refs.lock().unwrap().values().sum()
    }

    pub fn aborted(&self, name: &str) -> bool {
        self.aborts.lock().unwrap().iter().any(|n| n == name)
    }

    /// Wait until every handed-out reference has been released again.
    pub async fn wait_refs_drained(&self) {
        for _ in 0..200 {
            if self.outstanding_refs() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("worker references not drained: {}", self.outstanding_refs());
    }
}

/// Records an abort when an exec future is dropped before finishing.
struct ExecGuard {
    name: String,
    aborts: Arc<Mutex<Vec<String>>>,
    done: bool,
}

impl Drop for ExecGuard {
    fn drop(&mut self) {
        if !self.done {
            self.aborts.lock().unwrap().push(self.name.clone());
        }
    }
}

#[async_trait]
impl Worker for TestWorker {
    async fn exec(&self, op: &Op, inputs: &[ResultLease]) -> Result<WorkerResult> {
        let name = op.name();
        let mut guard =
            ExecGuard { name: name.clone(), aborts: self.aborts.clone(), done: false };

        let delay = self.delays.lock().unwrap().get(&name).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        guard.done = true;

        if self.failures.lock().unwrap().contains(&name) {
            return Err(KilnError::Internal(format!("exec failed: {}", name)));
        }

        *self.execs.lock().unwrap().entry(name).or_insert(0) += 1;

        let mut chain = LayerChain::default();
        for input in inputs {
            chain = chain.concat(input.chain());
        }
        chain.blobs.push(op_blob(op));

        let id = format!("r{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.refs.lock().unwrap().insert(id.clone(), 1);
        Ok(WorkerResult::new(id, chain))
    }

    async fn materialize(&self, result: &WorkerResult) -> Result<LayerChain> {
        // Unknown ids (imported or derived elsewhere) materialize from
        // their chain; known ids gain a reference.
        *self.refs.lock().unwrap().entry(result.id.clone()).or_insert(0) += 1;
        Ok(result.chain.clone())
    }

    async fn release(&self, result: &WorkerResult) -> Result<()> {
        let mut refs = self.refs.lock().unwrap();
        let count = refs.entry(result.id.clone()).or_insert(0);
        *count -= 1;
        Ok(())
    }

    async fn content_digest(&self, result: &WorkerResult, selector: &str) -> Result<Option<Digest>> {
        let key = match result.chain.blobs.first() {
            Some(blob) => (blob.as_str().to_string(), selector.to_string()),
            None => return Ok(None),
        };
        Ok(self.contents.lock().unwrap().get(&key).cloned())
    }
}

/// The one layer blob an op contributes, derived from its payload so equal
/// work yields equal content.
pub fn op_blob(op: &Op) -> Digest {
    Digest::from_bytes(format!("blob:{}", op.digest()))
}

pub fn source(identifier: &str) -> OpDef {
    OpDef {
        op: Op::Source(SourceOp { identifier: identifier.into(), attrs: BTreeMap::new() }),
        inputs: vec![],
        name: None,
    }
}

pub fn source_op(identifier: &str) -> Op {
    Op::Source(SourceOp { identifier: identifier.into(), attrs: BTreeMap::new() })
}

pub fn exec(cmd: &str, inputs: &[(usize, &str)]) -> OpDef {
    OpDef {
        op: Op::Exec(ExecOp {
            args: vec!["sh".into(), "-c".into(), cmd.into()],
            env: BTreeMap::new(),
            mounts: vec![],
        }),
        inputs: inputs
            .iter()
            .map(|(vertex, selector)| VertexInput {
                vertex: *vertex,
                output: 0,
                selector: selector.to_string(),
            })
            .collect(),
        name: None,
    }
}

/// An exec op keyed by the materialized content of its input.
pub fn exec_content(cmd: &str, input: usize, selector: &str) -> OpDef {
    OpDef {
        op: Op::Exec(ExecOp {
            args: vec!["sh".into(), "-c".into(), cmd.into()],
            env: BTreeMap::new(),
            mounts: vec![Mount {
                input: 0,
                dest: "/src".into(),
                readonly: true,
                content_based: true,
            }],
        }),
        inputs: vec![VertexInput { vertex: input, output: 0, selector: selector.to_string() }],
        name: None,
    }
}

pub fn merge(inputs: &[usize]) -> OpDef {
    OpDef {
        op: Op::Merge(MergeOp::default()),
        inputs: inputs
            .iter()
            .map(|vertex| VertexInput { vertex: *vertex, output: 0, selector: String::new() })
            .collect(),
        name: None,
    }
}

pub fn diff(lower: usize, upper: usize) -> OpDef {
    OpDef {
        op: Op::Diff(DiffOp::default()),
        inputs: [lower, upper]
            .iter()
            .map(|vertex| VertexInput { vertex: *vertex, output: 0, selector: String::new() })
            .collect(),
        name: None,
    }
}

pub fn definition(ops: Vec<OpDef>) -> Definition {
    Definition::new(ops)
}

/// Name of an exec op built by `exec`/`exec_content`, as the worker sees it.
pub fn exec_name(cmd: &str) -> String {
    format!("exec sh -c {}", cmd)
}

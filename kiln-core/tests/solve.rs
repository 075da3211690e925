//! End-to-end solve scenarios: cache sharing, selectors, slow keys,
//! merge/diff semantics, cancellation, and error propagation.

mod common;

use common::*;
use kiln_core::{
    CacheStore, Digest, Job, KilnError, SolverConfig, Solver, SourceLocation, VertexState,
};
use std::sync::Arc;
use std::time::Duration;

async fn test_solver(worker: Arc<TestWorker>) -> Arc<Solver> {
    let store = Arc::new(CacheStore::new_in_memory().await.unwrap());
    Solver::new(SolverConfig::default(), store, worker)
}

/// Two structurally identical subgraphs collapse onto one task: in
/// C(B(A), B(A)) each op executes exactly once and the store holds exactly
/// three records.
#[tokio::test]
async fn test_shared_subgraph_executes_once() {
    let worker = TestWorker::new();
    let solver = test_solver(worker.clone()).await;

    let def = definition(vec![
        source("local://ctx"),
        exec("build-b", &[(0, "")]),
        exec("build-b", &[(0, "")]),
        exec("combine-c", &[(1, ""), (2, "")]),
    ]);

    let output = Job::new(&solver, "j1").build(&def).await.unwrap();
    assert!(!output.from_cache);

    assert_eq!(worker.exec_count("local://ctx"), 1);
    assert_eq!(worker.exec_count(&exec_name("build-b")), 1);
    assert_eq!(worker.exec_count(&exec_name("combine-c")), 1);

    // One key per distinct vertex: source, one B, C.
    let keys = solver.store().keys().await.unwrap();
    assert_eq!(keys.len(), 3);
}

/// Same op, same input, different selectors: two distinct cache entries and
/// two executions.
#[tokio::test]
async fn test_selectors_make_distinct_entries() {
    let worker = TestWorker::new();
    let solver = test_solver(worker.clone()).await;

    let def = definition(vec![
        source("local://ctx"),
        exec("copy", &[(0, "/a")]),
        exec("copy", &[(0, "/b")]),
        merge(&[1, 2]),
    ]);

    Job::new(&solver, "j1").build(&def).await.unwrap();

    assert_eq!(worker.exec_count(&exec_name("copy")), 2);
}

/// A repeat build is satisfied from storage without touching the worker.
#[tokio::test]
async fn test_fast_key_hit_on_rebuild() {
    let worker = TestWorker::new();
    let solver = test_solver(worker.clone()).await;

    let def = definition(vec![source("local://ctx"), exec("make", &[(0, "")])]);

    let first = Job::new(&solver, "j1").build(&def).await.unwrap();
    assert!(!first.from_cache);

    let second = Job::new(&solver, "j2").build(&def).await.unwrap();
    assert!(second.from_cache);
    assert_eq!(second.chain(), first.chain());
    assert_eq!(worker.exec_count(&exec_name("make")), 1);
}

/// Two vertices with different ops but identical materialized input content
/// collide on the slow key; the second build reuses the first result
/// without executing.
#[tokio::test]
async fn test_slow_key_hit_after_fast_key_miss() {
    let worker = TestWorker::new();
    let solver = test_solver(worker.clone()).await;

    let tree = Digest::from_bytes(b"identical-tree");
    worker.set_content(&source_op("local://ctx-a"), "/src", tree.clone());
    worker.set_content(&source_op("local://ctx-b"), "/src", tree);

    let def_a = definition(vec![source("local://ctx-a"), exec_content("compile-a", 0, "/src")]);
    let def_b = definition(vec![source("local://ctx-b"), exec_content("compile-b", 0, "/src")]);

    let first = Job::new(&solver, "j1").build(&def_a).await.unwrap();
    assert!(!first.from_cache);
    assert!(first.slow_key.is_some());
    assert_eq!(worker.exec_count(&exec_name("compile-a")), 1);

    let second = Job::new(&solver, "j2").build(&def_b).await.unwrap();
    assert!(second.from_cache);
    assert_eq!(second.chain(), first.chain());
    assert_eq!(worker.exec_count(&exec_name("compile-b")), 0);

    // A third build keyed on either definition now hits structurally.
    let third = Job::new(&solver, "j3").build(&def_b).await.unwrap();
    assert!(third.from_cache);
    assert_eq!(worker.exec_count(&exec_name("compile-b")), 0);
}

/// An op that does not declare content keying never gets a slow key, and a
/// worker that cannot digest the selector degrades to fast keys only.
#[tokio::test]
async fn test_slow_key_unavailable_is_skipped() {
    let worker = TestWorker::new();
    let solver = test_solver(worker.clone()).await;

    // No content configured: the worker answers None for the selector.
    let def = definition(vec![source("local://ctx"), exec_content("compile", 0, "/src")]);
    let output = Job::new(&solver, "j1").build(&def).await.unwrap();

    assert!(output.slow_key.is_none());
    assert_eq!(worker.exec_count(&exec_name("compile")), 1);
}

/// Concurrent jobs over the same definition share one worker invocation per
/// vertex.
#[tokio::test]
async fn test_concurrent_jobs_share_work() {
    let worker = TestWorker::new();
    let solver = test_solver(worker.clone()).await;
    worker.set_delay(&exec_name("slow-step"), Duration::from_millis(100));

    let def = definition(vec![source("local://ctx"), exec("slow-step", &[(0, "")])]);

    let j1 = Job::new(&solver, "j1");
    let j2 = Job::new(&solver, "j2");
    let (a, b) = tokio::join!(j1.build(&def), j2.build(&def));
    let a = a.unwrap();
    let b = b.unwrap();

    assert_eq!(a.fast_key, b.fast_key);
    assert_eq!(a.chain(), b.chain());
    assert_eq!(worker.exec_count(&exec_name("slow-step")), 1);
}

/// merge(L, diff(L, U)) has exactly U's layer chain, without any merge or
/// diff execution in the worker.
#[tokio::test]
async fn test_merge_of_diff_restores_upper() {
    let worker = TestWorker::new();
    let solver = test_solver(worker.clone()).await;

    // U extends L by one layer.
    let upper_def = definition(vec![
        source("local://base"),
        exec("lower-step", &[(0, "")]),
        exec("upper-step", &[(1, "")]),
    ]);
    let upper = Job::new(&solver, "j1").build(&upper_def).await.unwrap();

    let combined_def = definition(vec![
        source("local://base"),
        exec("lower-step", &[(0, "")]),
        exec("upper-step", &[(1, "")]),
        diff(1, 2),
        merge(&[1, 3]),
    ]);
    let combined = Job::new(&solver, "j2").build(&combined_def).await.unwrap();

    assert_eq!(combined.chain(), upper.chain());
    // Everything below the merge/diff pair was reused.
    assert_eq!(worker.exec_count(&exec_name("lower-step")), 1);
    assert_eq!(worker.exec_count(&exec_name("upper-step")), 1);
}

/// Cancelling one of two joined jobs leaves the shared task running; the
/// surviving job completes.
#[tokio::test]
async fn test_cancel_one_job_keeps_task_alive() {
    let worker = TestWorker::new();
    let solver = test_solver(worker.clone()).await;
    worker.set_delay(&exec_name("long-step"), Duration::from_millis(200));

    let def = definition(vec![source("local://ctx"), exec("long-step", &[(0, "")])]);

    let j1 = Arc::new(Job::new(&solver, "j1"));
    let j2 = Arc::new(Job::new(&solver, "j2"));

    // Both jobs join the same task before either is cancelled.
    let cancelled = {
        let job = j1.clone();
        let def = def.clone();
        tokio::spawn(async move { job.build(&def).await })
    };
    let survivor = {
        let job = j2.clone();
        let def = def.clone();
        tokio::spawn(async move { job.build(&def).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    j1.cancel();

    let err = cancelled.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());

    let output = survivor.await.unwrap().unwrap();
    assert_eq!(worker.exec_count(&exec_name("long-step")), 1);
    assert!(!worker.aborted(&exec_name("long-step")));
    drop(output);
}

/// Cancelling every joined job cancels the worker call and releases all
/// leases within a bounded time.
#[tokio::test]
async fn test_cancel_all_jobs_cancels_worker() {
    let worker = TestWorker::new();
    let solver = test_solver(worker.clone()).await;
    worker.set_delay(&exec_name("doomed-step"), Duration::from_secs(60));

    let def = definition(vec![source("local://ctx"), exec("doomed-step", &[(0, "")])]);

    let j1 = Arc::new(Job::new(&solver, "j1"));
    let j2 = Arc::new(Job::new(&solver, "j2"));
    let b1 = {
        let job = j1.clone();
        let def = def.clone();
        tokio::spawn(async move { job.build(&def).await })
    };
    let b2 = {
        let job = j2.clone();
        let def = def.clone();
        tokio::spawn(async move { job.build(&def).await })
    };

    // Let the exec start, then pull both subscribers.
    tokio::time::sleep(Duration::from_millis(100)).await;
    j1.cancel();
    j2.cancel();

    assert!(b1.await.unwrap().unwrap_err().is_cancelled());
    assert!(b2.await.unwrap().unwrap_err().is_cancelled());

    // The worker call was abandoned and every lease drains.
    tokio::time::timeout(Duration::from_secs(5), async {
        while !worker.aborted(&exec_name("doomed-step")) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("worker exec was not cancelled in time");
    worker.wait_refs_drained().await;
}

/// Worker failures surface to the job with the vertex digest and its
/// registered source locations; an unrelated job is unaffected.
#[tokio::test]
async fn test_failure_carries_source_context() {
    let worker = TestWorker::new();
    let solver = test_solver(worker.clone()).await;
    worker.fail_on(&exec_name("broken-step"));

    let def = definition(vec![source("local://ctx"), exec("broken-step", &[(0, "")])]);
    let vertex_digest = def.vertices()[1].digest.clone();
    solver.register_source(
        &vertex_digest,
        SourceLocation { filename: "Buildfile".into(), line: 4, column: 1 },
    );

    let err = Job::new(&solver, "j1").build(&def).await.unwrap_err();
    match err {
        KilnError::Worker { vertex, locations, .. } => {
            assert_eq!(vertex, vertex_digest);
            assert_eq!(locations.len(), 1);
            assert_eq!(locations[0].line, 4);
        }
        other => panic!("expected worker error, got {}", other),
    }

    // Sibling job on an unrelated graph is unaffected.
    let ok_def = definition(vec![source("local://other"), exec("fine-step", &[(0, "")])]);
    Job::new(&solver, "j2").build(&ok_def).await.unwrap();
}

/// Progress events per vertex arrive in state-machine order and end in a
/// terminal state.
#[tokio::test]
async fn test_progress_events_in_transition_order() {
    let worker = TestWorker::new();
    let solver = test_solver(worker.clone()).await;

    let mut subscriber = solver.progress().subscribe(vec!["j1.*".to_string()]);
    let def = definition(vec![source("local://ctx"), exec("step", &[(0, "")])]);
    Job::new(&solver, "j1").build(&def).await.unwrap();

    let mut events = Vec::new();
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(200), subscriber.recv()).await
    {
        events.push(event);
        let finalized = events
            .iter()
            .filter(|e| e.state == VertexState::Finalized)
            .count();
        if finalized == 2 {
            break;
        }
    }

    assert!(!events.is_empty());
    let mut last_rank: std::collections::HashMap<Digest, u8> = std::collections::HashMap::new();
    for event in &events {
        let rank = event.state.rank();
        if let Some(previous) = last_rank.get(&event.vertex) {
            assert!(rank >= *previous, "state went backwards for {}", event.vertex);
        }
        last_rank.insert(event.vertex.clone(), rank);
    }
}

/// Invalid definitions are rejected before any scheduling happens.
#[tokio::test]
async fn test_invalid_definition_rejected() {
    let worker = TestWorker::new();
    let solver = test_solver(worker.clone()).await;

    let err = Job::new(&solver, "j1").build(&definition(vec![])).await.unwrap_err();
    assert!(matches!(err, KilnError::InvalidGraph { .. }));
    assert_eq!(worker.outstanding_refs(), 0);
}

/// Result leases drain back to the worker once outputs are dropped.
#[tokio::test]
async fn test_ref_safety_after_drop() {
    let worker = TestWorker::new();
    let solver = test_solver(worker.clone()).await;

    let def = definition(vec![source("local://ctx"), exec("step", &[(0, "")])]);
    let output = Job::new(&solver, "j1").build(&def).await.unwrap();
    assert!(worker.outstanding_refs() > 0);

    drop(output);
    worker.wait_refs_drained().await;
}

//! Integration tests for concurrent resolution of one unit

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::Harness;
use futures_util::future::join_all;
use pkgsys_core::{LatestPolicy, ResolveError};
use pkgsys_registry::test_utils::MockTransport;
use pretty_assertions::assert_eq;

const CALLERS: usize = 16;

fn gated() -> Harness {
    Harness::with(LatestPolicy::AlwaysRefresh, MockTransport::gated(), u64::MAX)
}

/// Spawn `CALLERS` resolutions of `name`, give them time to attach to the
/// shared fetch, then let the transport answer.
async fn resolve_concurrently(
    h: &Harness,
    name: &'static str,
) -> Vec<Result<pkgsys_core::ModuleHandle, ResolveError>> {
    let tasks: Vec<_> = (0..CALLERS)
        .map(|_| {
            let engine = Arc::clone(&h.engine);
            tokio::spawn(async move { engine.resolve_str(name).await })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.engine.in_flight(), 1);
    h.transport().open_gate();

    join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_share_one_fetch() {
    let h = gated();
    let artifact = h.publish_tools("1.0.0");
    let location = h.serve("tools", None, &artifact);

    let results = resolve_concurrently(&h, "acme.tools").await;

    assert_eq!(h.transport().calls_for(&location), 1);
    for result in &results {
        let handle = result.as_ref().unwrap();
        assert_eq!(handle.digest(), &artifact.digest);
    }
    assert_eq!(h.engine.cache().len(), 1);
    assert_eq!(h.engine.in_flight(), 0);

    let metrics = h.engine.metrics();
    assert_eq!(metrics.resolutions_total, CALLERS as u64);
    assert_eq!(metrics.successes, CALLERS as u64);
    assert_eq!(metrics.downloads, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_share_one_failure() {
    let h = gated();
    let location = {
        let provider = h.engine.registry().lookup("acme").unwrap();
        pkgsys_registry::artifact_location(&provider, "tools", None)
            .unwrap()
            .to_string()
    };

    let results = resolve_concurrently(&h, "acme.tools").await;

    assert_eq!(h.transport().calls_for(&location), 1);
    let messages: Vec<String> = results
        .into_iter()
        .map(|r| match r {
            Err(e @ ResolveError::Fetch { .. }) => e.to_string(),
            other => panic!("expected fetch failure, got {other:?}"),
        })
        .collect();
    assert!(messages.iter().all(|m| m == &messages[0]));
    assert_eq!(h.engine.metrics().fetch_failures, CALLERS as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_waiter_does_not_cancel_fetch() {
    let h = gated();
    let artifact = h.publish_tools("1.0.0");
    let location = h.serve("tools", None, &artifact);

    let cancelled = {
        let engine = Arc::clone(&h.engine);
        tokio::spawn(async move { engine.resolve_str("acme.tools").await })
    };
    let survivor = {
        let engine = Arc::clone(&h.engine);
        tokio::spawn(async move { engine.resolve_str("acme.tools").await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancelled.abort();
    assert!(cancelled.await.unwrap_err().is_cancelled());
    h.transport().open_gate();

    let handle = survivor.await.unwrap().unwrap();
    assert_eq!(handle.digest(), &artifact.digest);
    assert_eq!(h.transport().calls_for(&location), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_units_fetch_in_parallel() {
    let h = gated();
    let tools = h.publish_tools("1.0.0");
    let other = h.publisher.publish_wat(
        "other",
        "1.0.0",
        &["answer"],
        r#"(module (global (export "answer") i32 (i32.const 1)))"#,
    );
    h.serve("tools", None, &tools);
    h.serve("other", None, &other);

    let a = {
        let engine = Arc::clone(&h.engine);
        tokio::spawn(async move { engine.resolve_str("acme.tools").await })
    };
    let b = {
        let engine = Arc::clone(&h.engine);
        tokio::spawn(async move { engine.resolve_str("acme.other").await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.engine.in_flight(), 2);
    h.transport().open_gate();

    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();
    assert_eq!(h.transport().calls(), 2);
}

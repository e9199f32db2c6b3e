//! Integration tests for eviction under pressure while the engine is loading
//!
//! The runtime has a single blocking thread. Occupying it holds the engine's
//! load, and with it the cache lease, until the test lets it run.

mod common;

use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use common::Harness;
use pkgsys_cache::CacheKey;
use pkgsys_core::{LatestPolicy, Value};
use pkgsys_registry::test_utils::{MockTransport, Publisher, container_bytes};
use pretty_assertions::assert_eq;
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

fn unit_wat(answer: i32) -> String {
    format!(r#"(module (global (export "answer") i32 (i32.const {answer})))"#)
}

fn one_blocking_thread() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .max_blocking_threads(1)
        .enable_all()
        .build()
        .unwrap()
}

/// Occupy the only blocking thread until the returned sender fires.
async fn hold_blocking_pool() -> (mpsc::Sender<()>, JoinHandle<()>) {
    let (release, released) = mpsc::channel::<()>();
    let (busy, is_busy) = oneshot::channel();
    let blocker = tokio::task::spawn_blocking(move || {
        let _ = busy.send(());
        let _ = released.recv();
    });
    is_busy.await.unwrap();
    (release, blocker)
}

async fn wait_for_pin(h: &Harness, key: &CacheKey) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.engine.cache().pin_count(key) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("engine never pinned the entry");
}

#[test]
fn entry_pinned_by_engine_load_survives_eviction_pressure() {
    one_blocking_thread().block_on(async {
        // Room for one container but not two.
        let sample =
            Publisher::new("acme", 42).publish_wat("first", "1.0.0", &["answer"], &unit_wat(1));
        let size = container_bytes(&sample).len() as u64;
        let h = Harness::with(LatestPolicy::AlwaysRefresh, MockTransport::new(), size * 3 / 2);

        let first = h
            .publisher
            .publish_wat("first", "1.0.0", &["answer"], &unit_wat(1));
        h.serve("first", Some("1.0.0"), &first);
        let key = CacheKey::new("acme", "first", &first.digest);

        let (release, blocker) = hold_blocking_pool().await;
        let resolving = {
            let engine = Arc::clone(&h.engine);
            tokio::spawn(async move { engine.resolve_str("acme.first@1.0.0").await })
        };
        wait_for_pin(&h, &key).await;

        // Pressure: any two containers exceed the budget.
        let mut pressure = Vec::new();
        for (i, unit) in ["second", "third", "fourth"].iter().enumerate() {
            let artifact = h
                .publisher
                .publish_wat(unit, "1.0.0", &["answer"], &unit_wat(i as i32 + 2));
            let other = CacheKey::new("acme", unit, &artifact.digest);
            drop(h.engine.cache().put(other, Arc::new(artifact)).unwrap());
            pressure.push(other);
        }
        assert!(h.engine.cache().contains(&key));
        assert_eq!(h.engine.cache().pin_count(&key), 1);
        assert!(!h.engine.cache().contains(&pressure[0]));

        release.send(()).unwrap();
        blocker.await.unwrap();
        let handle = resolving.await.unwrap().unwrap();
        assert_eq!(handle.value("answer"), Some(Value::I32(1)));

        // The load released its lease, so the older entry goes.
        assert_eq!(h.engine.cache().pin_count(&key), 0);
        assert!(!h.engine.cache().contains(&key));
        assert!(h.engine.cache().contains(&pressure[2]));
    });
}

#[test]
fn clear_during_engine_load_keeps_artifact_usable() {
    one_blocking_thread().block_on(async {
        let h = Harness::new(LatestPolicy::AlwaysRefresh);
        let artifact = h.publish_tools("1.0.0");
        h.serve("tools", Some("1.0.0"), &artifact);
        let key = CacheKey::new("acme", "tools", &artifact.digest);

        let (release, blocker) = hold_blocking_pool().await;
        let resolving = {
            let engine = Arc::clone(&h.engine);
            tokio::spawn(async move { engine.resolve_str("acme.tools@1.0.0").await })
        };
        wait_for_pin(&h, &key).await;

        assert_eq!(h.engine.clear_cache(), 1);
        assert!(h.engine.cache().is_empty());

        release.send(()).unwrap();
        blocker.await.unwrap();
        let handle = resolving.await.unwrap().unwrap();
        assert_eq!(handle.value("answer"), Some(Value::I32(42)));
        assert!(h.engine.cache().is_empty());
    });
}

//! Integration tests for resolving `acme.tools`
//!
//! Tests the full pipeline: fetch, verify, cache, load, and the repair paths.

mod common;

use std::fs;

use common::{Harness, TOOLS_EXPORTS};
use pkgsys_cache::CacheKey;
use pkgsys_core::{
    EngineConfig, LatestPolicy, Outcome, ResolutionEngine, ResolveError, RetryPolicy, TrustTier,
    Value,
};
use pkgsys_registry::test_utils::{MockTransport, Publisher};

fn flip_payload_byte(path: &std::path::Path) {
    let mut bytes = fs::read(path).unwrap();
    let magic = bytes
        .windows(4)
        .position(|w| w == b"\0asm")
        .expect("entry point is stored uncompressed");
    bytes[magic + 10] ^= 0xff;
    fs::write(path, bytes).unwrap();
}

mod resolution {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn exposes_exactly_declared_symbols() {
        let h = Harness::new(LatestPolicy::AlwaysRefresh);
        let artifact = h.publish_tools("1.0.0");
        h.serve("tools", None, &artifact);

        let tools = h.engine.resolve_str("acme.tools").await.unwrap();

        let names: Vec<&str> = tools.symbol_names().collect();
        assert_eq!(names, TOOLS_EXPORTS);
        assert!(tools.get("internal").is_none());
        assert_eq!(tools.value("answer"), Some(Value::I32(42)));
        let add = tools.function("add").unwrap();
        assert_eq!(
            add.call(&[Value::I32(40), Value::I32(2)]).unwrap(),
            vec![Value::I32(42)]
        );
        assert_eq!(tools.unit_name(), "tools");
        assert_eq!(tools.provider_name(), "acme");
        assert_eq!(tools.digest(), &artifact.digest);
    }

    #[tokio::test]
    async fn re_resolve_is_cache_hit_without_transport() {
        let h = Harness::new(LatestPolicy::ReuseWithin { grace_secs: 600 });
        let artifact = h.publish_tools("1.0.0");
        let location = h.serve("tools", None, &artifact);

        h.engine.resolve_str("acme.tools").await.unwrap();
        h.engine.resolve_str("acme.tools").await.unwrap();

        assert_eq!(h.transport().calls_for(&location), 1);
        let metrics = h.engine.metrics();
        assert_eq!(metrics.cache_hits, 1);
        assert_eq!(metrics.downloads, 1);
        assert_eq!(metrics.cache_hit_rate(), 50.0);
    }

    #[tokio::test]
    async fn pinned_re_resolve_is_cache_hit_without_transport() {
        let h = Harness::new(LatestPolicy::AlwaysRefresh);
        let artifact = h.publish_tools("1.0.0");
        let location = h.serve("tools", Some("1.0.0"), &artifact);

        h.engine.resolve_str("acme.tools@1.0.0").await.unwrap();
        h.engine.resolve_str("acme.tools@1.0.0").await.unwrap();

        assert_eq!(h.transport().calls_for(&location), 1);
        assert_eq!(h.engine.metrics().cache_hits, 1);
    }

    #[tokio::test]
    async fn cache_survives_engine_restart() {
        let h = Harness::new(LatestPolicy::AlwaysRefresh);
        let artifact = h.publish_tools("1.0.0");
        h.serve("tools", Some("1.0.0"), &artifact);
        h.engine.resolve_str("acme.tools@1.0.0").await.unwrap();

        let config = EngineConfig {
            retry: RetryPolicy::none(),
            ..EngineConfig::with_cache_dir(h.cache_dir())
        };
        let restarted = ResolutionEngine::new(&config, MockTransport::new()).unwrap();
        restarted
            .register(h.publisher.descriptor(common::BASE, TrustTier::High))
            .unwrap();

        let tools = restarted.resolve_str("acme.tools@1.0.0").await.unwrap();
        assert_eq!(tools.digest(), &artifact.digest);
        assert_eq!(restarted.transport().calls(), 0);
        assert_eq!(restarted.metrics().cache_hits, 1);
    }
}

mod corruption {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn flipped_byte_is_repaired_by_refetch() {
        let h = Harness::new(LatestPolicy::AlwaysRefresh);
        let artifact = h.publish_tools("1.0.0");
        let location = h.serve("tools", Some("1.0.0"), &artifact);

        h.engine.resolve_str("acme.tools@1.0.0").await.unwrap();
        let key = CacheKey::new("acme", "tools", &artifact.digest);
        flip_payload_byte(&h.engine.cache().path_for(&key));

        let tools = h.engine.resolve_str("acme.tools@1.0.0").await.unwrap();
        assert_eq!(tools.value("answer"), Some(Value::I32(42)));
        assert_eq!(h.transport().calls_for(&location), 2);

        let metrics = h.engine.metrics();
        assert_eq!(metrics.cache_corruptions, 1);
        assert_eq!(metrics.successes, 2);
        assert_eq!(metrics.cache_hits, 0);

        // Repaired: the next request is a clean hit.
        h.engine.resolve_str("acme.tools@1.0.0").await.unwrap();
        assert_eq!(h.transport().calls_for(&location), 2);
        assert_eq!(h.engine.metrics().cache_hits, 1);
    }

    #[tokio::test]
    async fn truncated_file_is_repaired_by_refetch() {
        let h = Harness::new(LatestPolicy::AlwaysRefresh);
        let artifact = h.publish_tools("1.0.0");
        let location = h.serve("tools", Some("1.0.0"), &artifact);

        h.engine.resolve_str("acme.tools@1.0.0").await.unwrap();
        let path = h
            .engine
            .cache()
            .path_for(&CacheKey::new("acme", "tools", &artifact.digest));
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        h.engine.resolve_str("acme.tools@1.0.0").await.unwrap();
        assert_eq!(h.transport().calls_for(&location), 2);
        assert_eq!(h.engine.metrics().cache_corruptions, 1);
    }
}

mod security {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn wrong_key_is_rejected_every_time_without_cache_writes() {
        let h = Harness::new(LatestPolicy::ReuseWithin { grace_secs: 600 });
        let impostor = Publisher::new("acme", 13);
        let artifact = impostor.publish_wat("tools", "1.0.0", TOOLS_EXPORTS, common::TOOLS_WAT);
        let location = h.serve("tools", None, &artifact);

        for _ in 0..3 {
            let err = h.engine.resolve_str("acme.tools").await.unwrap_err();
            assert!(err.is_security_rejection(), "{err}");
            assert!(!err.is_retryable());
            assert!(matches!(
                err,
                ResolveError::Security {
                    source: pkgsys_registry::SecurityError::Signature(_),
                    ..
                }
            ));
        }

        // Never cached, so every attempt went back to the provider.
        assert_eq!(h.transport().calls_for(&location), 3);
        assert!(h.engine.cache().is_empty());
        assert_eq!(fs::read_dir(h.cache_dir()).unwrap().count(), 0);

        let metrics = h.engine.metrics();
        assert_eq!(metrics.security_rejections, 3);
        assert_eq!(metrics.security_rejection_rate(), 100.0);
        assert!(
            h.engine
                .audit_log()
                .iter()
                .all(|e| e.outcome == Outcome::SecurityRejection)
        );
    }

    #[tokio::test]
    async fn tampered_payload_is_integrity_rejection() {
        let h = Harness::new(LatestPolicy::AlwaysRefresh);
        let mut artifact = h.publish_tools("1.0.0");
        if let Some(wasm) = artifact.payload.get_mut("tools.wasm") {
            wasm.push(0);
        }
        h.serve("tools", None, &artifact);

        let err = h.engine.resolve_str("acme.tools").await.unwrap_err();
        assert!(matches!(
            err,
            ResolveError::Security {
                source: pkgsys_registry::SecurityError::Integrity(_),
                ..
            }
        ));
        assert!(h.engine.cache().is_empty());
    }

    #[tokio::test]
    async fn artifact_for_another_provider_is_policy_rejection() {
        let h = Harness::new(LatestPolicy::AlwaysRefresh);
        // Signed with acme's key but claims to come from someone else.
        let mut artifact = h.publish_tools("1.0.0");
        artifact.manifest.provider = "globex".to_string();
        let artifact = pkgsys_manifest::Artifact::seal(artifact.manifest, artifact.payload);
        let artifact = h.publisher.sign(artifact);
        h.serve("tools", None, &artifact);

        let err = h.engine.resolve_str("acme.tools").await.unwrap_err();
        assert!(matches!(
            err,
            ResolveError::Security {
                source: pkgsys_registry::SecurityError::Policy(_),
                ..
            }
        ));
    }
}

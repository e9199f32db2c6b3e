//! Integration tests resolving through the HTTP transport

mod common;

use std::time::Duration;

use common::{TOOLS_EXPORTS, TOOLS_WAT, init_tracing};
use pkgsys_core::{
    EngineConfig, EngineError, HttpTransport, LatestPolicy, PolicyFlag, ProviderPolicy,
    ResolutionEngine, ResolveError, RetryPolicy, TrustTier, Value,
};
use pkgsys_registry::{FetchError, RegistryError};
use pkgsys_registry::test_utils::{Publisher, container_bytes};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Setup {
    _dir: TempDir,
    server: MockServer,
    engine: ResolutionEngine<HttpTransport>,
    publisher: Publisher,
}

async fn setup() -> Setup {
    init_tracing();
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
            attempt_timeout_ms: 2_000,
        },
        latest: LatestPolicy::AlwaysRefresh,
        ..EngineConfig::with_cache_dir(dir.path())
    };
    let transport = HttpTransport::builder()
        .allow_local(true)
        .timeout(Duration::from_secs(2))
        .build()
        .unwrap();
    let engine = ResolutionEngine::new(&config, transport).unwrap();

    let publisher = Publisher::new("acme", 5);
    engine
        .register(publisher.descriptor_with(
            &format!("{}/acme", server.uri()),
            TrustTier::Enterprise,
            ProviderPolicy::default()
                .with_flag(PolicyFlag::AllowLocal)
                .with_min_version("1.0.0".parse().unwrap()),
        ))
        .unwrap();

    Setup {
        _dir: dir,
        server,
        engine,
        publisher,
    }
}

#[tokio::test]
async fn resolves_pinned_release_over_http() {
    let s = setup().await;
    let artifact = s
        .publisher
        .publish_wat("tools", "1.2.0", TOOLS_EXPORTS, TOOLS_WAT);

    Mock::given(method("GET"))
        .and(path("/acme/tools/releases/download/v1.2.0/tools.pkg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(container_bytes(&artifact)))
        .expect(1)
        .mount(&s.server)
        .await;

    let tools = s.engine.resolve_str("acme.tools@1.2.0").await.unwrap();
    assert_eq!(tools.value("answer"), Some(Value::I32(42)));
    assert_eq!(tools.version(), "1.2.0");

    // Served from the cache; the mock's expectation of one call is checked on drop.
    s.engine.resolve_str("acme.tools@1.2.0").await.unwrap();
}

#[tokio::test]
async fn retries_server_errors() {
    let s = setup().await;
    let artifact = s
        .publisher
        .publish_wat("tools", "1.2.0", TOOLS_EXPORTS, TOOLS_WAT);
    let latest = "/acme/tools/releases/latest/download/tools.pkg";

    Mock::given(method("GET"))
        .and(path(latest))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&s.server)
        .await;
    Mock::given(method("GET"))
        .and(path(latest))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(container_bytes(&artifact)))
        .expect(1)
        .mount(&s.server)
        .await;

    s.engine.resolve_str("acme.tools").await.unwrap();
}

#[tokio::test]
async fn not_found_is_not_a_security_rejection() {
    let s = setup().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        // Release, then the main and master branches.
        .expect(3)
        .mount(&s.server)
        .await;

    let err = s.engine.resolve_str("acme.missing").await.unwrap_err();
    assert!(!err.is_security_rejection());
    assert!(!err.is_retryable());
    assert!(matches!(
        err,
        ResolveError::Fetch {
            source: FetchError::Transport { attempts: 1, .. },
            ..
        }
    ));
}

#[tokio::test]
async fn latest_falls_back_to_main_branch() {
    let s = setup().await;
    let artifact = s
        .publisher
        .publish_wat("tools", "1.2.0", TOOLS_EXPORTS, TOOLS_WAT);

    Mock::given(method("GET"))
        .and(path("/acme/tools/releases/latest/download/tools.pkg"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&s.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/acme/tools/raw/main/tools.pkg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(container_bytes(&artifact)))
        .expect(1)
        .mount(&s.server)
        .await;

    let tools = s.engine.resolve_str("acme.tools").await.unwrap();
    assert_eq!(tools.value("answer"), Some(Value::I32(42)));
    assert_eq!(s.engine.metrics().downloads, 1);
}

#[tokio::test]
async fn default_engine_reaches_allow_local_provider() {
    init_tracing();
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let engine = ResolutionEngine::with_http(&EngineConfig::with_cache_dir(dir.path())).unwrap();

    let publisher = Publisher::new("acme", 5);
    engine
        .register(publisher.descriptor_with(
            &format!("{}/acme", server.uri()),
            TrustTier::High,
            ProviderPolicy::default().with_flag(PolicyFlag::AllowLocal),
        ))
        .unwrap();
    let artifact = publisher.publish_wat("tools", "1.2.0", TOOLS_EXPORTS, TOOLS_WAT);

    Mock::given(method("GET"))
        .and(path("/acme/tools/releases/download/v1.2.0/tools.pkg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(container_bytes(&artifact)))
        .expect(1)
        .mount(&server)
        .await;

    let tools = engine.resolve_str("acme.tools@1.2.0").await.unwrap();
    assert_eq!(tools.value("answer"), Some(Value::I32(42)));
}

#[tokio::test]
async fn default_engine_refuses_local_provider_without_flag() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let engine = ResolutionEngine::with_http(&EngineConfig::with_cache_dir(dir.path())).unwrap();

    let base = format!("{}/acme", server.uri());
    let err = engine
        .register(Publisher::new("acme", 5).descriptor(&base, TrustTier::High))
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Registry(RegistryError::InvalidLocation { .. })
    ));
    assert!(engine.registry().is_empty());
}

#[tokio::test]
async fn enterprise_minimum_version_is_enforced() {
    let s = setup().await;
    let artifact = s
        .publisher
        .publish_wat("tools", "0.9.0", TOOLS_EXPORTS, TOOLS_WAT);

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(container_bytes(&artifact)))
        .mount(&s.server)
        .await;

    let err = s.engine.resolve_str("acme.tools").await.unwrap_err();
    assert!(err.is_security_rejection(), "{err}");
    assert!(s.engine.cache().is_empty());
}

#[tokio::test]
async fn garbage_body_is_malformed() {
    let s = setup().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"<html>oops</html>".to_vec()))
        .mount(&s.server)
        .await;

    let err = s.engine.resolve_str("acme.tools").await.unwrap_err();
    assert!(matches!(
        err,
        ResolveError::Fetch {
            source: FetchError::Malformed { .. },
            ..
        }
    ));
    assert!(!err.is_retryable());
}

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response};
use http_body_util::BodyExt;
use sqlx::postgres::PgPoolOptions;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};
use tower::ServiceExt;

use trove_core::config::{EngineConfig, IdentityConfig, IdentitySpec, ImageConfig, RateConfig};
use trove_core::manager::JobManager;
use trove_core::testutil::{
    MockAdapter, MockImageFetcher, MockImageStore, MockProductStore, MockReporter, candidates,
};
use trove_core::traits::SourceRegistry;
use trove_db::{Database, ProductRepository};
use trove_server::routes;
use trove_server::state::AppState;

pub const TEST_API_KEY: &str = "test-secret-key";

pub type TestManager = JobManager<MockAdapter, MockProductStore, MockImageFetcher, MockImageStore>;

pub struct TestApp {
    pub router: Router,
    pub manager: Arc<TestManager>,
}

/// Engine settings that let a mock job finish in milliseconds.
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.scheduler.unit_size = 10;
    config.rate = RateConfig {
        base_delay: Duration::from_millis(1),
        min_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        ..config.rate
    };
    config.retry.block_jitter = Duration::from_millis(5);
    config.retry.transient_backoff = Duration::from_millis(5);
    config.identity = IdentityConfig {
        identities: (0..3)
            .map(|i| IdentitySpec {
                route: None,
                user_agent: format!("TestAgent/{i}"),
            })
            .collect(),
        cooldown: Duration::from_millis(50),
        checkout_poll: Duration::from_millis(5),
        checkout_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    config.image = ImageConfig {
        enabled: false,
        ..config.image
    };
    config
}

fn build_app(adapter: MockAdapter, products: Option<ProductRepository>) -> TestApp {
    let manager = Arc::new(JobManager::new(
        fast_config(),
        SourceRegistry::new().with("mock", adapter),
        MockProductStore::new(),
        MockImageFetcher::new(),
        MockImageStore::new(),
        Arc::new(MockReporter::new()),
    ));
    let state = Arc::new(AppState {
        jobs: manager.clone(),
        products,
        api_key: TEST_API_KEY.to_string(),
    });
    TestApp {
        router: routes::router(state),
        manager,
    }
}

/// Router backed by a mock source serving 50 valid products, no database.
pub fn setup_test_app() -> TestApp {
    build_app(MockAdapter::with_candidates(candidates(50)), None)
}

pub fn setup_test_app_with(adapter: MockAdapter) -> TestApp {
    build_app(adapter, None)
}

/// Router with product browsing backed by a PostgreSQL container.
pub async fn setup_test_app_with_db() -> (TestApp, ProductRepository, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("postgres", "16")
        .with_exposed_port(ContainerPort::Tcp(5432))
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_DB", "trove_test")
        .start()
        .await
        .expect("Failed to start PostgreSQL container");

    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get port");
    let url = format!("postgresql://postgres:postgres@{host}:{port}/trove_test");

    let mut pool = None;
    for _ in 0..30 {
        if let Ok(p) = PgPoolOptions::new().max_connections(5).connect(&url).await {
            pool = Some(p);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let db = Database::from_pool(pool.expect("Failed to connect to test database"));
    db.migrate().await.expect("Failed to run migrations");

    let repo = db.products();
    let app = build_app(MockAdapter::with_candidates(candidates(5)), Some(repo.clone()));
    (app, repo, container)
}

pub fn authed(builder: axum::http::request::Builder) -> axum::http::request::Builder {
    builder.header("authorization", format!("Bearer {TEST_API_KEY}"))
}

pub async fn send(router: &Router, request: Request<Body>) -> Response<Body> {
    router.clone().oneshot(request).await.unwrap()
}

pub async fn json_body(response: Response<Body>) -> serde_json::Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

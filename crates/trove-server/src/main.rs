use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_governor::GovernorLayer;
use tower_governor::governor::GovernorConfigBuilder;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use trove_client::{FsImageStore, HttpImageFetcher, HttpSourceAdapter, load_sources, registry_from};
use trove_core::traits::{NullStore, ProductStore, SourceRegistry};
use trove_core::{EngineConfig, JobManager, TracingJobReporter};
use trove_db::{Database, DatabaseConfig, ProductRepository};
use trove_server::routes;
use trove_server::state::AppState;

const IMAGE_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REQUEST_BODY: usize = 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("trove=info".parse()?))
        .with_target(false)
        .init();

    let api_key =
        std::env::var("TROVE_SERVER_API_KEY").context("TROVE_SERVER_API_KEY must be set")?;
    let port = std::env::var("TROVE_SERVER_PORT").unwrap_or_else(|_| "3000".to_string());
    let addr = format!("0.0.0.0:{port}");

    let config = EngineConfig::from_env()?;
    let sources_file =
        std::env::var("TROVE_SOURCES_FILE").unwrap_or_else(|_| "sources.json".to_string());
    let sources = registry_from(
        load_sources(Path::new(&sources_file))
            .with_context(|| format!("loading sources from {sources_file}"))?,
    );
    let fetcher = HttpImageFetcher::new(IMAGE_FETCH_TIMEOUT, config.image.max_bytes)?;
    let image_store = FsImageStore::new(&config.image.storage_dir);

    let server = Server {
        config,
        sources,
        fetcher,
        image_store,
        api_key,
        addr,
    };

    if std::env::var("DATABASE_URL").is_ok() {
        let db = Database::connect(&DatabaseConfig::from_env()?).await?;
        db.migrate().await?;
        let repo = db.products();
        server.run(repo.clone(), Some(repo)).await
    } else {
        tracing::warn!("DATABASE_URL not set; scraped products will not be persisted");
        server.run(NullStore, None).await
    }
}

struct Server {
    config: EngineConfig,
    sources: SourceRegistry<HttpSourceAdapter>,
    fetcher: HttpImageFetcher,
    image_store: FsImageStore,
    api_key: String,
    addr: String,
}

impl Server {
    async fn run<S: ProductStore>(
        self,
        store: S,
        products: Option<ProductRepository>,
    ) -> anyhow::Result<()> {
        let manager = Arc::new(JobManager::new(
            self.config,
            self.sources,
            store,
            self.fetcher,
            self.image_store,
            Arc::new(TracingJobReporter),
        ));

        let stop = CancellationToken::new();
        let janitor = tokio::spawn({
            let manager = manager.clone();
            let stop = stop.clone();
            async move { manager.run_janitor(stop).await }
        });

        let state = Arc::new(AppState {
            jobs: manager.clone(),
            products,
            api_key: self.api_key,
        });

        let governor = GovernorConfigBuilder::default()
            .per_millisecond(100)
            .burst_size(50)
            .finish()
            .context("invalid rate limit configuration")?;

        let app = routes::router(state)
            .layer(GovernorLayer::new(Arc::new(governor)))
            .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive());

        tracing::info!(sources = ?manager.sources(), "Starting server on {}", self.addr);
        let listener = TcpListener::bind(&self.addr).await?;
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        stop.cancel();
        janitor.await?;
        manager.shutdown().await;
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

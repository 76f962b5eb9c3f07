use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use reqwest::{Client, Proxy, StatusCode};
use trove_core::error::AppError;
use trove_core::identity::IdentityTicket;
use trove_core::models::{RawCandidate, RawPage, UnitOfWork};
use trove_core::traits::{SourceAdapter, SourceRegistry};

use crate::parser;
use crate::source::SourceConfig;

/// Source adapter for search pages that embed schema.org JSON-LD.
///
/// Each identity gets its own HTTP client (proxy route plus User-Agent),
/// built on first use and cached. HTTP 403/429 and pages showing a
/// configured block marker are reported as [`AppError::Blocked`].
#[derive(Clone)]
pub struct HttpSourceAdapter {
    config: Arc<SourceConfig>,
    clients: Cache<usize, Client>,
}

impl HttpSourceAdapter {
    pub fn new(config: SourceConfig) -> Self {
        Self {
            config: Arc::new(config),
            clients: Cache::builder().max_capacity(256).build(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    async fn client_for(&self, identity: &IdentityTicket) -> Result<Client, AppError> {
        let ticket = identity.clone();
        let timeout = self.timeout();
        self.clients
            .try_get_with(identity.id, async move { build_client(&ticket, timeout) })
            .await
            .map_err(|e: Arc<AppError>| AppError::ConfigError(e.to_string()))
    }

    fn request_error(&self, e: reqwest::Error) -> AppError {
        if e.is_timeout() {
            AppError::Timeout(self.config.timeout_secs)
        } else if e.is_connect() {
            AppError::NetworkError(format!("Connection failed: {e}"))
        } else {
            AppError::HttpError(e.to_string())
        }
    }
}

/// One adapter per configured source, keyed by source name.
pub fn registry_from(sources: Vec<SourceConfig>) -> SourceRegistry<HttpSourceAdapter> {
    let mut registry = SourceRegistry::new();
    for source in sources {
        let name = source.name.clone();
        registry.register(&name, HttpSourceAdapter::new(source));
    }
    registry
}

fn build_client(identity: &IdentityTicket, timeout: Duration) -> Result<Client, AppError> {
    let mut builder = Client::builder()
        .user_agent(identity.user_agent.as_str())
        .timeout(timeout);
    if let Some(route) = &identity.route {
        let proxy = Proxy::all(route.as_str()).map_err(|e| {
            AppError::ConfigError(format!("Invalid route for identity {}: {e}", identity.id))
        })?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| AppError::ConfigError(format!("Failed to build HTTP client: {e}")))
}

impl SourceAdapter for HttpSourceAdapter {
    async fn fetch(&self, unit: &UnitOfWork, identity: &IdentityTicket) -> Result<RawPage, AppError> {
        let url = self.config.search_url_for(unit)?;
        let client = self.client_for(identity).await?;

        tracing::debug!(source = %self.config.name, %url, identity = identity.id, "Fetching result page");
        let response = client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        let status = response.status();
        if matches!(status, StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS) {
            return Err(AppError::Blocked {
                status_code: Some(status.as_u16()),
                reason: format!("HTTP {} for {url}", status.as_u16()),
            });
        }
        if !status.is_success() {
            return Err(AppError::HttpError(format!(
                "HTTP {} for {url}",
                status.as_u16()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to read response body: {e}")))?;

        if let Some(marker) = self.config.block_marker_in(&parser::visible_text(&body)) {
            return Err(AppError::Blocked {
                status_code: Some(status.as_u16()),
                reason: format!("page shows block marker '{marker}'"),
            });
        }

        Ok(RawPage {
            url: url.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    fn parse(&self, page: &RawPage) -> Result<Vec<RawCandidate>, AppError> {
        parser::parse_products(&page.body, &page.url)
    }
}

//! Per-source HTTP configuration, loaded from a JSON file.
//!
//! ```json
//! [
//!   {
//!     "name": "shop-a",
//!     "search_url": "https://shop-a.test/s?q={query}&page={page}&n={limit}",
//!     "params": { "min_price": "pmin", "max_price": "pmax", "sort": "order" },
//!     "block_markers": ["captcha", "verify you are a human"]
//!   }
//! ]
//! ```

use std::path::Path;

use serde::Deserialize;
use trove_core::error::AppError;
use trove_core::models::UnitOfWork;
use url::Url;
use url::form_urlencoded::byte_serialize;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

fn default_block_markers() -> Vec<String> {
    ["captcha", "robot check", "security measure", "unusual traffic", "verify you are a human"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// Query parameter names used to pass search filters to the source.
///
/// Filters without a parameter name are still enforced locally by the
/// record pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FilterParams {
    pub min_price: Option<String>,
    pub max_price: Option<String>,
    pub category: Option<String>,
    pub condition: Option<String>,
    pub sort: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    /// Search URL template with `{query}`, `{page}` and `{limit}` placeholders.
    pub search_url: String,
    #[serde(default)]
    pub params: FilterParams,
    /// Visible-text fragments that mark a page as a bot challenge.
    #[serde(default = "default_block_markers")]
    pub block_markers: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl SourceConfig {
    pub fn new(name: impl Into<String>, search_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            search_url: search_url.into(),
            params: FilterParams::default(),
            block_markers: default_block_markers(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Build the result-page URL for one unit of work.
    pub fn search_url_for(&self, unit: &UnitOfWork) -> Result<Url, AppError> {
        let query: String = byte_serialize(unit.request.query.trim().as_bytes()).collect();
        let expanded = self
            .search_url
            .replace("{query}", &query)
            .replace("{page}", &unit.page.to_string())
            .replace("{limit}", &unit.limit.to_string());

        let mut url = Url::parse(&expanded).map_err(|e| {
            AppError::ConfigError(format!("Bad search_url for source '{}': {e}", self.name))
        })?;

        let filters = &unit.request.filters;
        let p = &self.params;
        let mut extra: Vec<(&str, String)> = Vec::new();
        if let (Some(name), Some(v)) = (&p.min_price, filters.min_price) {
            extra.push((name, v.to_string()));
        }
        if let (Some(name), Some(v)) = (&p.max_price, filters.max_price) {
            extra.push((name, v.to_string()));
        }
        if let (Some(name), Some(v)) = (&p.category, &filters.category) {
            extra.push((name, v.clone()));
        }
        if let (Some(name), Some(v)) = (&p.condition, &filters.condition) {
            extra.push((name, v.clone()));
        }
        if let Some(name) = &p.sort {
            extra.push((name, filters.sort.as_str().to_string()));
        }
        if !extra.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in extra {
                pairs.append_pair(name, &value);
            }
        }

        Ok(url)
    }

    /// First configured block marker found in `text` (case-insensitive).
    pub fn block_marker_in(&self, text: &str) -> Option<&str> {
        let lowered = text.to_lowercase();
        self.block_markers
            .iter()
            .map(String::as_str)
            .find(|m| !m.is_empty() && lowered.contains(&m.to_lowercase()))
    }
}

/// Load source configurations from a JSON file.
pub fn load_sources(path: &Path) -> Result<Vec<SourceConfig>, AppError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        AppError::ConfigError(format!("Failed to read sources file {}: {e}", path.display()))
    })?;
    let sources: Vec<SourceConfig> = serde_json::from_str(&raw).map_err(|e| {
        AppError::ConfigError(format!("Invalid sources file {}: {e}", path.display()))
    })?;
    for source in &sources {
        if !source.search_url.contains("{query}") {
            return Err(AppError::ConfigError(format!(
                "search_url for source '{}' must contain {{query}}",
                source.name
            )));
        }
    }
    Ok(sources)
}

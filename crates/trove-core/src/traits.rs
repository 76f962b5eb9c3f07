use std::collections::BTreeMap;
use std::future::Future;

use crate::error::AppError;
use crate::identity::IdentityTicket;
use crate::models::{ProductRecord, RawCandidate, RawPage, UnitOfWork};

/// Per-source boundary: fetch one result page and turn it into candidates.
///
/// Both calls are fallible. The fetch worker classifies errors with
/// [`AppError::is_block_signal`] and [`AppError::is_retryable`].
pub trait SourceAdapter: Send + Sync + Clone + 'static {
    /// Fetch the result page described by `unit`, presenting as `identity`.
    fn fetch(
        &self,
        unit: &UnitOfWork,
        identity: &IdentityTicket,
    ) -> impl Future<Output = Result<RawPage, AppError>> + Send;

    /// Extract raw candidate listings from a fetched page.
    fn parse(&self, page: &RawPage) -> Result<Vec<RawCandidate>, AppError>;
}

/// Persistent product store used for cross-job dedup and the final write.
pub trait ProductStore: Send + Sync + Clone + 'static {
    /// Insert or update a record keyed by its fingerprint.
    fn upsert(&self, record: &ProductRecord) -> impl Future<Output = Result<(), AppError>> + Send;

    fn exists_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;
}

/// A no-op ProductStore for use when persistence is not needed.
#[derive(Debug, Clone)]
pub struct NullStore;

impl ProductStore for NullStore {
    async fn upsert(&self, _record: &ProductRecord) -> Result<(), AppError> {
        Ok(())
    }

    async fn exists_by_fingerprint(&self, _fingerprint: &str) -> Result<bool, AppError> {
        Ok(false)
    }
}

/// Downloaded image bytes, prior to normalisation.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub url: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Downloads a single image reference.
pub trait ImageFetcher: Send + Sync + Clone + 'static {
    fn fetch_image(&self, url: &str) -> impl Future<Output = Result<FetchedImage, AppError>> + Send;
}

/// Normalises and stores an image, returning its stored location.
pub trait ImageStore: Send + Sync + Clone + 'static {
    /// Resize so the longest side is at most `max_dimension` and persist.
    fn store(
        &self,
        image: FetchedImage,
        max_dimension: u32,
    ) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// Source adapters by source identifier (case-insensitive).
#[derive(Clone)]
pub struct SourceRegistry<A> {
    adapters: BTreeMap<String, A>,
}

impl<A: SourceAdapter> SourceRegistry<A> {
    pub fn new() -> Self {
        Self {
            adapters: BTreeMap::new(),
        }
    }

    pub fn with(mut self, source: &str, adapter: A) -> Self {
        self.register(source, adapter);
        self
    }

    pub fn register(&mut self, source: &str, adapter: A) {
        self.adapters.insert(source.trim().to_lowercase(), adapter);
    }

    pub fn get(&self, source: &str) -> Option<&A> {
        self.adapters.get(&source.trim().to_lowercase())
    }

    /// Look up an adapter, rejecting unknown sources as a validation error.
    pub fn resolve(&self, source: &str) -> Result<&A, AppError> {
        self.get(source).ok_or_else(|| {
            AppError::ValidationError(format!(
                "Unknown source '{}' (known: {})",
                source,
                self.names().join(", ")
            ))
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl<A: SourceAdapter> Default for SourceRegistry<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockAdapter;

    #[test]
    fn registry_lookup_is_case_insensitive() {
        let registry = SourceRegistry::new().with("Shop-A", MockAdapter::with_candidates(vec![]));
        assert!(registry.get("shop-a").is_some());
        assert!(registry.get(" SHOP-A ").is_some());
        assert_eq!(registry.names(), vec!["shop-a".to_string()]);
    }

    #[test]
    fn unknown_source_is_a_validation_error() {
        let registry = SourceRegistry::new().with("a", MockAdapter::with_candidates(vec![]));
        let err = registry.resolve("b").err().unwrap();
        assert!(matches!(err, AppError::ValidationError(_)));
    }
}

use std::sync::Arc;

use trove_core::error::AppError;
use trove_core::identity::IdentityStats;
use trove_core::job::{JobCounts, JobSnapshot, JobState, JobSummary};
use trove_core::manager::JobManager;
use trove_core::rate::RateStats;
use trove_core::request::ScrapeRequest;
use trove_core::traits::{ImageFetcher, ImageStore, ProductStore, SourceAdapter};
use trove_db::ProductRepository;
use uuid::Uuid;

/// The job operations the HTTP layer needs, independent of which adapters
/// and stores the engine was built with.
pub trait JobControl: Send + Sync {
    fn start(&self, request: ScrapeRequest) -> Result<Uuid, AppError>;
    fn status(&self, id: Uuid) -> Result<JobSnapshot, AppError>;
    fn cancel(&self, id: Uuid) -> Result<JobState, AppError>;
    fn list(&self, state: Option<JobState>, limit: usize) -> Vec<JobSummary>;
    fn counts(&self) -> JobCounts;
    fn identity_stats(&self) -> Vec<IdentityStats>;
    fn rate_stats(&self) -> Vec<RateStats>;
    fn sources(&self) -> Vec<String>;
    fn pending_images(&self) -> usize;
    fn usable_identities(&self) -> usize;
}

impl<A, S, F, I> JobControl for JobManager<A, S, F, I>
where
    A: SourceAdapter,
    S: ProductStore,
    F: ImageFetcher,
    I: ImageStore,
{
    fn start(&self, request: ScrapeRequest) -> Result<Uuid, AppError> {
        JobManager::start(self, request)
    }

    fn status(&self, id: Uuid) -> Result<JobSnapshot, AppError> {
        JobManager::status(self, id)
    }

    fn cancel(&self, id: Uuid) -> Result<JobState, AppError> {
        JobManager::cancel(self, id)
    }

    fn list(&self, state: Option<JobState>, limit: usize) -> Vec<JobSummary> {
        JobManager::list(self, state, limit)
    }

    fn counts(&self) -> JobCounts {
        JobManager::counts(self)
    }

    fn identity_stats(&self) -> Vec<IdentityStats> {
        JobManager::identity_stats(self)
    }

    fn rate_stats(&self) -> Vec<RateStats> {
        JobManager::rate_stats(self)
    }

    fn sources(&self) -> Vec<String> {
        JobManager::sources(self)
    }

    fn pending_images(&self) -> usize {
        JobManager::pending_images(self)
    }

    fn usable_identities(&self) -> usize {
        JobManager::usable_identities(self)
    }
}

/// Shared application state, available to handlers via `State<Arc<AppState>>`.
pub struct AppState {
    pub jobs: Arc<dyn JobControl>,
    /// `None` when the server runs without a database.
    pub products: Option<ProductRepository>,
    pub api_key: String,
}

pub mod config;
pub mod error;
pub mod fetch;
pub mod identity;
pub mod image;
pub mod job;
pub mod manager;
pub mod models;
pub mod pipeline;
pub mod rate;
pub mod reporter;
pub mod request;
pub mod scheduler;
pub mod traits;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use config::EngineConfig;
pub use error::{AppError, FetchError};
pub use identity::{IdentityRotator, IdentityStats, IdentityTicket};
pub use job::{JobCounts, JobSnapshot, JobState, JobSummary};
pub use manager::JobManager;
pub use models::{ImageStatus, Price, ProductRecord, RawCandidate, RawPage, UnitOfWork, compute_hash};
pub use rate::{RateController, RateStats};
pub use reporter::{JobEvent, JobReporter, TracingJobReporter};
pub use request::{ScrapeRequest, SearchFilters, SortOrder};
pub use traits::{
    FetchedImage, ImageFetcher, ImageStore, NullStore, ProductStore, SourceAdapter, SourceRegistry,
};

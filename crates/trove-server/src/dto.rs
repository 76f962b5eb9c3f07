use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use trove_core::identity::IdentityStats;
use trove_core::job::{JobCounts, JobSnapshot, JobSummary};
use trove_core::models::{ImageStatus, ProductRecord};
use trove_core::rate::RateStats;
use trove_core::request::{ScrapeRequest, SearchFilters, SortOrder};

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize, utoipa::ToSchema)]
pub struct FiltersBody {
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub category: Option<String>,
    pub condition: Option<String>,
    /// relevance, price_asc, price_desc or newest
    pub sort: Option<String>,
    #[serde(default)]
    pub exclude_terms: Vec<String>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct CreateJobRequest {
    pub query: String,
    pub source: String,
    pub max_items: u32,
    #[serde(default)]
    pub filters: Option<FiltersBody>,
}

impl CreateJobRequest {
    /// Convert to the engine's request type. Unknown sort names are a
    /// validation error.
    pub fn into_request(self) -> Result<ScrapeRequest, String> {
        let filters = match self.filters {
            None => SearchFilters::default(),
            Some(f) => SearchFilters {
                min_price: f.min_price,
                max_price: f.max_price,
                category: f.category,
                condition: f.condition,
                sort: f
                    .sort
                    .as_deref()
                    .map(str::parse::<SortOrder>)
                    .transpose()?
                    .unwrap_or_default(),
                exclude_terms: f.exclude_terms,
            },
        };
        Ok(ScrapeRequest::new(self.query, self.source, self.max_items).with_filters(filters))
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct CreateJobResponse {
    pub job_id: Uuid,
    pub state: String,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct JobSummaryResponse {
    pub id: Uuid,
    pub query: String,
    pub source: String,
    pub state: String,
    /// Fraction of requested items processed, 0.0 to 1.0.
    pub progress: f64,
    pub items_completed: u32,
    pub items_requested: u32,
    pub items_found: u32,
    pub units_total: u32,
    pub error_count: u32,
    pub quality_rejects: u32,
    pub duplicates: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<JobSummary> for JobSummaryResponse {
    fn from(s: JobSummary) -> Self {
        Self {
            id: s.id,
            query: s.query,
            source: s.source,
            state: s.state.to_string(),
            progress: s.progress,
            items_completed: s.items_completed,
            items_requested: s.items_requested,
            items_found: s.items_found,
            units_total: s.units_total,
            error_count: s.error_count,
            quality_rejects: s.quality_rejects,
            duplicates: s.duplicates,
            error: s.last_error,
            created_at: s.created_at,
            completed_at: s.completed_at,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct JobStatusResponse {
    #[serde(flatten)]
    pub summary: JobSummaryResponse,
    pub results: Vec<ProductResponse>,
}

impl From<JobSnapshot> for JobStatusResponse {
    fn from(snapshot: JobSnapshot) -> Self {
        Self {
            summary: snapshot.summary.into(),
            results: snapshot.results.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ListJobsQuery {
    pub state: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct JobListResponse {
    pub jobs: Vec<JobSummaryResponse>,
    pub total: usize,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct CancelJobResponse {
    pub job_id: Uuid,
    pub state: String,
}

// ---------------------------------------------------------------------------
// Products
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ProductResponse {
    pub fingerprint: String,
    pub title: String,
    pub price: f64,
    pub currency: String,
    pub source: String,
    pub url: Option<String>,
    pub category: Option<String>,
    pub condition: Option<String>,
    pub specifications: BTreeMap<String, String>,
    pub images: Vec<String>,
    /// pending, hydrated or skipped
    pub image_status: String,
    pub captured_at: DateTime<Utc>,
}

impl From<ProductRecord> for ProductResponse {
    fn from(p: ProductRecord) -> Self {
        let image_status = match p.image_status {
            ImageStatus::Pending => "pending",
            ImageStatus::Hydrated { .. } => "hydrated",
            ImageStatus::Skipped => "skipped",
        };
        Self {
            fingerprint: p.fingerprint,
            title: p.title,
            price: p.price.amount,
            currency: p.price.currency,
            source: p.source,
            url: p.url,
            category: p.category,
            condition: p.condition,
            specifications: p.specifications,
            images: p.images,
            image_status: image_status.to_string(),
            captured_at: p.captured_at,
        }
    }
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ListProductsQuery {
    pub source: Option<String>,
    pub category: Option<String>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    /// Case-insensitive title search.
    pub q: Option<String>,
    /// newest, price_asc or price_desc
    pub sort: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ProductListResponse {
    pub products: Vec<ProductResponse>,
    pub total: i64,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct DeleteProductsRequest {
    /// Fingerprints of the products to remove.
    pub fingerprints: Vec<String>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct DeleteProductsResponse {
    /// Rows removed; unknown fingerprints are not counted.
    pub deleted: u64,
}

// ---------------------------------------------------------------------------
// System
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: &'static str,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct JobCountsResponse {
    /// Pending, running and cancelling jobs.
    pub active: usize,
    pub pending: usize,
    pub running: usize,
    pub cancelling: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl From<JobCounts> for JobCountsResponse {
    fn from(c: JobCounts) -> Self {
        Self {
            active: c.active(),
            pending: c.pending,
            running: c.running,
            cancelling: c.cancelling,
            completed: c.completed,
            failed: c.failed,
            cancelled: c.cancelled,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct IdentityResponse {
    pub id: usize,
    pub route: Option<String>,
    pub user_agent: String,
    pub health: f64,
    pub in_use: bool,
    pub retired: bool,
    pub cooling_down: bool,
    pub successes: u64,
    pub blocks: u64,
    pub failures: u64,
}

impl From<IdentityStats> for IdentityResponse {
    fn from(s: IdentityStats) -> Self {
        Self {
            id: s.id,
            route: s.route,
            user_agent: s.user_agent,
            health: s.health,
            in_use: s.in_use,
            retired: s.retired,
            cooling_down: s.cooling_down,
            successes: s.successes,
            blocks: s.blocks,
            failures: s.failures,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SourceRateResponse {
    pub source: String,
    pub success_rate: f64,
    pub current_delay_ms: u64,
    pub attempts: u64,
}

impl From<RateStats> for SourceRateResponse {
    fn from(s: RateStats) -> Self {
        Self {
            source: s.source,
            success_rate: s.success_rate,
            current_delay_ms: s.current_delay.as_millis() as u64,
            attempts: s.attempts,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SystemStatusResponse {
    pub sources: Vec<String>,
    pub jobs: JobCountsResponse,
    /// Identities not yet retired.
    pub usable_identities: usize,
    pub identities: Vec<IdentityResponse>,
    pub rates: Vec<SourceRateResponse>,
    /// Image hydration tasks still running.
    pub pending_images: usize,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

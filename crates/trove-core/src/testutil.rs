//! Test utilities: mock implementations of all core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::AppError;
use crate::identity::IdentityTicket;
use crate::models::{ProductRecord, RawCandidate, RawPage, UnitOfWork, compute_hash};
use crate::reporter::{JobEvent, JobReporter};
use crate::traits::{FetchedImage, ImageFetcher, ImageStore, ProductStore, SourceAdapter};

/// A valid candidate with a distinct title, price and image per index.
pub fn candidate(i: usize) -> RawCandidate {
    RawCandidate {
        title: Some(format!("Gold Ring {i}")),
        price: Some(format!("${}.99", 100 + i)),
        currency: None,
        url: Some(format!("https://shop.test/item/{i}")),
        category: Some("Jewelry".into()),
        condition: Some("New".into()),
        specifications: vec![("Metal".into(), "14k gold".into())],
        images: vec![format!("https://img.test/{i}.jpg")],
    }
}

/// `n` valid candidates with pairwise distinct fingerprints.
pub fn candidates(n: usize) -> Vec<RawCandidate> {
    (0..n).map(candidate).collect()
}

// ---------------------------------------------------------------------------
// MockAdapter
// ---------------------------------------------------------------------------

type ErrorFactory = Arc<dyn Fn() -> AppError + Send + Sync>;

/// Mock source adapter serving a fixed candidate list, one page per unit.
///
/// Page `p` with limit `l` yields `candidates[(p - 1) * l .. p * l]`.
#[derive(Clone)]
pub struct MockAdapter {
    candidates: Arc<Vec<RawCandidate>>,
    /// Errors returned (in order) before any page is served.
    failures: Arc<Mutex<VecDeque<AppError>>>,
    always: Option<ErrorFactory>,
    failing_pages: Arc<HashSet<u32>>,
    latency: Duration,
    fetches: Arc<Mutex<Vec<(u32, usize)>>>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl MockAdapter {
    pub fn with_candidates(candidates: Vec<RawCandidate>) -> Self {
        Self {
            candidates: Arc::new(candidates),
            failures: Arc::new(Mutex::new(VecDeque::new())),
            always: None,
            failing_pages: Arc::new(HashSet::new()),
            latency: Duration::ZERO,
            fetches: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Every fetch fails with the error built by `make`.
    pub fn always_failing(make: impl Fn() -> AppError + Send + Sync + 'static) -> Self {
        Self {
            always: Some(Arc::new(make)),
            ..Self::with_candidates(vec![])
        }
    }

    pub fn with_failures(self, failures: Vec<AppError>) -> Self {
        *self.failures.lock().unwrap() = failures.into();
        self
    }

    /// Fetches of these pages fail with a non-retryable error.
    pub fn failing_pages(mut self, pages: Vec<u32>) -> Self {
        self.failing_pages = Arc::new(pages.into_iter().collect());
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().unwrap().len()
    }

    /// Identity id used by each fetch, in call order.
    pub fn identities_used(&self) -> Vec<usize> {
        self.fetches.lock().unwrap().iter().map(|(_, id)| *id).collect()
    }

    /// Highest number of fetches that were running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn pages_fetched(&self) -> Vec<u32> {
        self.fetches.lock().unwrap().iter().map(|(p, _)| *p).collect()
    }
}

impl SourceAdapter for MockAdapter {
    async fn fetch(&self, unit: &UnitOfWork, identity: &IdentityTicket) -> Result<RawPage, AppError> {
        self.fetches.lock().unwrap().push((unit.page, identity.id));
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(make) = &self.always {
            return Err(make());
        }
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        if self.failing_pages.contains(&unit.page) {
            return Err(AppError::HttpError(format!("HTTP 404 for page {}", unit.page)));
        }

        Ok(RawPage {
            url: format!("mock://{}/{}?page={}", unit.source(), unit.request.query, unit.page),
            status: 200,
            body: format!("{} {}", unit.page, unit.limit),
        })
    }

    fn parse(&self, page: &RawPage) -> Result<Vec<RawCandidate>, AppError> {
        let mut parts = page.body.split_whitespace().map(str::parse::<usize>);
        let (Some(Ok(page_no)), Some(Ok(limit))) = (parts.next(), parts.next()) else {
            return Err(AppError::ParseError(format!("bad mock page: {}", page.body)));
        };
        let start = ((page_no - 1) * limit).min(self.candidates.len());
        let end = (start + limit).min(self.candidates.len());
        Ok(self.candidates[start..end].to_vec())
    }
}

// ---------------------------------------------------------------------------
// MockProductStore
// ---------------------------------------------------------------------------

/// In-memory product store keyed by fingerprint.
#[derive(Clone, Default)]
pub struct MockProductStore {
    records: Arc<Mutex<HashMap<String, ProductRecord>>>,
    error: Arc<Mutex<Option<String>>>,
}

impl MockProductStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails with a database error.
    pub fn failing(message: &str) -> Self {
        let store = Self::default();
        *store.error.lock().unwrap() = Some(message.to_string());
        store
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, fingerprint: &str) -> Option<ProductRecord> {
        self.records.lock().unwrap().get(fingerprint).cloned()
    }

    fn check(&self) -> Result<(), AppError> {
        match self.error.lock().unwrap().as_ref() {
            Some(msg) => Err(AppError::DatabaseError(msg.clone())),
            None => Ok(()),
        }
    }
}

impl ProductStore for MockProductStore {
    async fn upsert(&self, record: &ProductRecord) -> Result<(), AppError> {
        self.check()?;
        self.records
            .lock()
            .unwrap()
            .insert(record.fingerprint.clone(), record.clone());
        Ok(())
    }

    async fn exists_by_fingerprint(&self, fingerprint: &str) -> Result<bool, AppError> {
        self.check()?;
        Ok(self.records.lock().unwrap().contains_key(fingerprint))
    }
}

// ---------------------------------------------------------------------------
// MockImageFetcher / MockImageStore
// ---------------------------------------------------------------------------

/// Serves a small fake image for every URL, except those marked failing.
#[derive(Clone)]
pub struct MockImageFetcher {
    failing: Arc<HashSet<String>>,
    size: usize,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockImageFetcher {
    pub fn new() -> Self {
        Self {
            failing: Arc::new(HashSet::new()),
            size: 16,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fetches of `url` fail with a retryable network error.
    pub fn failing(mut self, url: &str) -> Self {
        let mut failing = (*self.failing).clone();
        failing.insert(url.to_string());
        self.failing = Arc::new(failing);
        self
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn calls_for(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
    }
}

impl Default for MockImageFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageFetcher for MockImageFetcher {
    async fn fetch_image(&self, url: &str) -> Result<FetchedImage, AppError> {
        self.calls.lock().unwrap().push(url.to_string());
        if self.failing.contains(url) {
            return Err(AppError::NetworkError(format!("connection reset: {url}")));
        }
        Ok(FetchedImage {
            url: url.to_string(),
            content_type: Some("image/jpeg".into()),
            bytes: vec![0xAB; self.size],
        })
    }
}

/// Records stored images and returns `stored/<hash>.jpg` locations.
#[derive(Clone, Default)]
pub struct MockImageStore {
    stored: Arc<Mutex<Vec<(String, u32)>>>,
}

impl MockImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored_count(&self) -> usize {
        self.stored.lock().unwrap().len()
    }
}

impl ImageStore for MockImageStore {
    async fn store(&self, image: FetchedImage, max_dimension: u32) -> Result<String, AppError> {
        self.stored.lock().unwrap().push((image.url.clone(), max_dimension));
        Ok(format!("stored/{}.jpg", &compute_hash(&image.url)[..16]))
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Reporter that records event names for assertions.
#[derive(Clone, Default)]
pub struct MockReporter {
    events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl JobReporter for MockReporter {
    fn report(&self, event: JobEvent<'_>) {
        let name = match event {
            JobEvent::JobStarted { .. } => "job_started",
            JobEvent::UnitDispatched { .. } => "unit_dispatched",
            JobEvent::UnitSucceeded { .. } => "unit_succeeded",
            JobEvent::UnitFailed { .. } => "unit_failed",
            JobEvent::DispatchHalted { .. } => "dispatch_halted",
            JobEvent::CancelRequested { .. } => "cancel_requested",
            JobEvent::UnitsAbandoned { .. } => "units_abandoned",
            JobEvent::JobFinished { .. } => "job_finished",
            JobEvent::ImagesHydrated { .. } => "images_hydrated",
            JobEvent::JobsPurged { .. } => "jobs_purged",
        };
        self.events.lock().unwrap().push(name.to_string());
    }
}

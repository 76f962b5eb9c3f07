//! Image pipeline: hydrate accepted records' media off the job's critical path.
//!
//! Each image reference gets its own bounded retry budget. Failures degrade
//! the record (its original reference is kept) but never reject it.

use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio_util::task::TaskTracker;

use crate::config::ImageConfig;
use crate::error::AppError;
use crate::job::JobHandle;
use crate::models::{ImageStatus, ProductRecord};
use crate::reporter::{JobEvent, JobReporter};
use crate::traits::{ImageFetcher, ImageStore, ProductStore};

#[derive(Clone)]
pub struct ImagePipeline<F, I, S>
where
    F: ImageFetcher,
    I: ImageStore,
    S: ProductStore,
{
    fetcher: F,
    images: I,
    products: S,
    config: ImageConfig,
    permits: Arc<Semaphore>,
    tasks: TaskTracker,
    /// Held across close/wait/reopen so concurrent drains cannot reopen the
    /// tracker under another drain's wait.
    draining: Arc<Mutex<()>>,
    reporter: Arc<dyn JobReporter>,
}

impl<F, I, S> ImagePipeline<F, I, S>
where
    F: ImageFetcher,
    I: ImageStore,
    S: ProductStore,
{
    pub fn new(
        fetcher: F,
        images: I,
        products: S,
        config: ImageConfig,
        reporter: Arc<dyn JobReporter>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            fetcher,
            images,
            products,
            config,
            permits,
            tasks: TaskTracker::new(),
            draining: Arc::new(Mutex::new(())),
            reporter,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Hydrate `record` in the background and write the result back into
    /// the owning job and the product store.
    pub fn spawn(&self, job: Arc<JobHandle>, record: ProductRecord) {
        let pipeline = self.clone();
        self.tasks.spawn(async move {
            pipeline.hydrate(job, record).await;
        });
    }

    /// Number of hydration tasks still running.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every spawned hydration task to finish.
    pub async fn drain(&self) {
        let _guard = self.draining.lock().await;
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    async fn hydrate(&self, job: Arc<JobHandle>, record: ProductRecord) {
        let mut stored = 0;
        let mut failed = 0;
        let mut locations = Vec::with_capacity(record.images.len());

        for url in &record.images {
            match self.hydrate_one(url).await {
                Ok(location) => {
                    stored += 1;
                    locations.push(location);
                }
                Err(e) => {
                    failed += 1;
                    tracing::warn!(fingerprint = %record.fingerprint, %url, error = %e, "Image hydration failed");
                    locations.push(url.clone());
                }
            }
        }

        let job_id = job.read(|j| j.id);
        let updated = job.write(|j| {
            j.update_images(
                &record.fingerprint,
                locations,
                ImageStatus::Hydrated { stored, failed },
            )
        });
        self.reporter.report(JobEvent::ImagesHydrated {
            job_id,
            fingerprint: &record.fingerprint,
            stored,
            failed,
        });

        if let Some(updated) = updated
            && let Err(e) = self.products.upsert(&updated).await
        {
            tracing::warn!(fingerprint = %updated.fingerprint, error = %e, "Failed to persist hydrated record");
        }
    }

    async fn hydrate_one(&self, url: &str) -> Result<String, AppError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.fetch_and_store(url).await {
                Ok(location) => return Ok(location),
                Err(e) if e.is_retryable() && attempt <= self.config.max_retries => {
                    tracing::debug!(%url, %attempt, error = %e, "Retrying image");
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_and_store(&self, url: &str) -> Result<String, AppError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| AppError::Generic("image pipeline closed".into()))?;
        let image = self.fetcher.fetch_image(url).await?;
        if image.bytes.len() > self.config.max_bytes {
            return Err(AppError::ImageError(format!(
                "{url} is {} bytes, limit is {}",
                image.bytes.len(),
                self.config.max_bytes
            )));
        }
        self.images.store(image, self.config.max_dimension).await
    }
}

//! Job manager: the engine's public face.
//!
//! Owns every job, exposes start/status/cancel, and hands each new job to
//! the batch scheduler on its own task. Status reads are snapshot copies, so
//! repeated polling has no side effects.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::config::{EngineConfig, JobConfig};
use crate::error::AppError;
use crate::identity::{IdentityRotator, IdentityStats};
use crate::image::ImagePipeline;
use crate::job::{Job, JobCounts, JobHandle, JobSnapshot, JobState, JobSummary};
use crate::rate::{RateController, RateStats};
use crate::reporter::{JobEvent, JobReporter};
use crate::request::ScrapeRequest;
use crate::scheduler::BatchScheduler;
use crate::traits::{ImageFetcher, ImageStore, ProductStore, SourceAdapter, SourceRegistry};

type JobMap = HashMap<Uuid, Arc<JobHandle>>;

pub struct JobManager<A, S, F, I>
where
    A: SourceAdapter,
    S: ProductStore,
    F: ImageFetcher,
    I: ImageStore,
{
    config: JobConfig,
    sources: SourceRegistry<A>,
    scheduler: Arc<BatchScheduler<S, F, I>>,
    identities: IdentityRotator,
    rate: RateController,
    jobs: Arc<RwLock<JobMap>>,
    runs: TaskTracker,
    reporter: Arc<dyn JobReporter>,
}

impl<A, S, F, I> JobManager<A, S, F, I>
where
    A: SourceAdapter,
    S: ProductStore,
    F: ImageFetcher,
    I: ImageStore,
{
    pub fn new(
        config: EngineConfig,
        sources: SourceRegistry<A>,
        store: S,
        image_fetcher: F,
        image_store: I,
        reporter: Arc<dyn JobReporter>,
    ) -> Self {
        let identities = IdentityRotator::new(config.identity.clone());
        let rate = RateController::new(config.rate.clone());
        let images = ImagePipeline::new(
            image_fetcher,
            image_store,
            store.clone(),
            config.image.clone(),
            reporter.clone(),
        );
        let scheduler = BatchScheduler::new(
            &config,
            rate.clone(),
            identities.clone(),
            store,
            images,
            reporter.clone(),
        );

        Self {
            config: config.job,
            sources,
            scheduler: Arc::new(scheduler),
            identities,
            rate,
            jobs: Arc::new(RwLock::new(HashMap::new())),
            runs: TaskTracker::new(),
            reporter,
        }
    }

    fn read_jobs(&self) -> std::sync::RwLockReadGuard<'_, JobMap> {
        self.jobs.read().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned job map lock");
            poisoned.into_inner()
        })
    }

    fn write_jobs(&self) -> std::sync::RwLockWriteGuard<'_, JobMap> {
        self.jobs.write().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned job map lock");
            poisoned.into_inner()
        })
    }

    fn handle(&self, id: Uuid) -> Result<Arc<JobHandle>, AppError> {
        self.read_jobs()
            .get(&id)
            .cloned()
            .ok_or(AppError::JobNotFound(id))
    }

    /// Validate `request`, create its job and start scraping in the
    /// background. Returns as soon as the job is RUNNING.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, request: ScrapeRequest) -> Result<Uuid, AppError> {
        request.validate(self.config.max_items_ceiling)?;
        let adapter = self.sources.resolve(&request.source)?.clone();

        let handle = Arc::new(JobHandle::new(Job::new(request)));
        let id = handle.read(|j| j.id);
        self.write_jobs().insert(id, handle.clone());

        handle.write(|j| j.transition(JobState::Running));

        let scheduler = self.scheduler.clone();
        let run = handle.clone();
        let runner = tokio::spawn(async move { scheduler.run(run, adapter).await });

        let watched = handle.clone();
        self.runs.spawn(async move {
            if let Err(e) = runner.await {
                tracing::error!(job_id = %id, error = %e, "Scheduler task failed");
                watched.write(|j| {
                    j.record_unit_failure(format!("scheduler task failed: {e}"));
                    let target = if j.state == JobState::Cancelling {
                        JobState::Cancelled
                    } else {
                        JobState::Failed
                    };
                    j.transition(target);
                });
            }
        });

        Ok(id)
    }

    /// Read-only copy of a job's current state and results.
    pub fn status(&self, id: Uuid) -> Result<JobSnapshot, AppError> {
        Ok(self.handle(id)?.snapshot())
    }

    /// Request cancellation. Cancelling a terminal job is a no-op.
    ///
    /// Returns the job's state after the call.
    pub fn cancel(&self, id: Uuid) -> Result<JobState, AppError> {
        let handle = self.handle(id)?;
        let (requested, state) = handle.write(|j| {
            let requested = match j.state {
                JobState::Pending => j.transition(JobState::Cancelled),
                JobState::Running => j.transition(JobState::Cancelling),
                _ => false,
            };
            (requested, j.state)
        });
        if requested {
            self.reporter.report(JobEvent::CancelRequested { job_id: id });
        }
        handle.cancel_token().cancel();
        Ok(state)
    }

    /// Most recent jobs first, optionally restricted to one state.
    pub fn list(&self, state: Option<JobState>, limit: usize) -> Vec<JobSummary> {
        let mut summaries: Vec<JobSummary> = self
            .read_jobs()
            .values()
            .map(|h| h.read(Job::summary))
            .filter(|s| state.is_none_or(|wanted| s.state == wanted))
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries.truncate(limit);
        summaries
    }

    pub fn counts(&self) -> JobCounts {
        let mut counts = JobCounts::default();
        for handle in self.read_jobs().values() {
            counts.add(handle.state());
        }
        counts
    }

    /// Drop terminal jobs whose retention window has passed.
    pub fn purge_expired(&self) -> usize {
        let retention = TimeDelta::from_std(self.config.retention).unwrap_or(TimeDelta::MAX);
        let now = Utc::now();

        let mut jobs = self.write_jobs();
        let before = jobs.len();
        jobs.retain(|_, handle| {
            handle.read(|j| match (j.state.is_terminal(), j.completed_at) {
                (true, Some(done)) => now - done < retention,
                _ => true,
            })
        });
        let purged = before - jobs.len();
        drop(jobs);

        if purged > 0 {
            self.reporter.report(JobEvent::JobsPurged { count: purged });
        }
        purged
    }

    /// Purge expired jobs every `janitor_interval` until cancelled.
    pub async fn run_janitor(&self, cancel_token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.janitor_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.purge_expired();
                }
                () = cancel_token.cancelled() => break,
            }
        }
    }

    /// Cancel every active job and wait for their runs and image
    /// hydration to wind down.
    pub async fn shutdown(&self) {
        let counts = self.counts();
        if counts.active() > 0 {
            tracing::info!(active = counts.active(), "Cancelling active jobs");
        }
        let active: Vec<Uuid> = self
            .read_jobs()
            .iter()
            .filter(|(_, h)| !h.state().is_terminal())
            .map(|(id, _)| *id)
            .collect();
        for id in active {
            let _ = self.cancel(id);
        }

        self.runs.close();
        self.runs.wait().await;
        let pending_images = self.pending_images();
        if pending_images > 0 {
            tracing::info!(pending_images, "Waiting for image hydration");
        }
        self.scheduler.images().drain().await;
        tracing::info!("Job manager shut down");
    }

    /// Wait until a job reaches a terminal state, polling its snapshot.
    pub async fn wait_for(&self, id: Uuid, poll: Duration) -> Result<JobSnapshot, AppError> {
        loop {
            let snapshot = self.status(id)?;
            if snapshot.summary.state.is_terminal() {
                return Ok(snapshot);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Wait for pending image hydration to finish.
    pub async fn wait_for_images(&self) {
        self.scheduler.images().drain().await;
    }

    /// Image hydration tasks still in flight, across all jobs.
    pub fn pending_images(&self) -> usize {
        self.scheduler.images().pending()
    }

    pub fn identity_stats(&self) -> Vec<IdentityStats> {
        self.identities.stats()
    }

    /// Identities that have not been retired.
    pub fn usable_identities(&self) -> usize {
        self.identities.usable_count()
    }

    pub fn rate_stats(&self) -> Vec<RateStats> {
        self.rate.stats()
    }

    pub fn sources(&self) -> Vec<String> {
        self.sources.names()
    }
}

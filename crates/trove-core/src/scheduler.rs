//! Batch scheduler: fans a job out into units of work and aggregates results.
//!
//! One `run` call drives one job. It owns the job's in-flight units in a
//! `JoinSet` and is the only writer of the job's progress counters; units
//! report back through their join handles in completion order.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{EngineConfig, RetryPolicy, SchedulerConfig};
use crate::error::FetchError;
use crate::fetch::FetchWorker;
use crate::identity::IdentityRotator;
use crate::image::ImagePipeline;
use crate::job::{JobHandle, JobState};
use crate::models::{RawCandidate, UnitOfWork};
use crate::pipeline::{Rejection, RecordPipeline};
use crate::rate::RateController;
use crate::reporter::{JobEvent, JobReporter};
use crate::traits::{ImageFetcher, ImageStore, ProductStore, SourceAdapter};

type UnitResult = (usize, Result<Vec<RawCandidate>, FetchError>);

/// Why a job stopped dispatching new units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    Cancelled,
    Saturated,
    TooManyFailures,
    NoIdentities,
}

impl Halt {
    fn reason(&self) -> &'static str {
        match self {
            Halt::Cancelled => "cancelled",
            Halt::Saturated => "requested item count reached",
            Halt::TooManyFailures => "failure ratio exceeded",
            Halt::NoIdentities => "no usable identities",
        }
    }
}

/// Per-run bookkeeping kept outside the job record.
#[derive(Debug, Default)]
struct RunTally {
    succeeded: u32,
    failed: u32,
}

pub struct BatchScheduler<S, F, I>
where
    S: ProductStore,
    F: ImageFetcher,
    I: ImageStore,
{
    config: SchedulerConfig,
    retry: RetryPolicy,
    cross_job_dedup: bool,
    rate: RateController,
    identities: IdentityRotator,
    global: Arc<Semaphore>,
    store: S,
    images: ImagePipeline<F, I, S>,
    reporter: Arc<dyn JobReporter>,
}

impl<S, F, I> BatchScheduler<S, F, I>
where
    S: ProductStore,
    F: ImageFetcher,
    I: ImageStore,
{
    pub fn new(
        config: &EngineConfig,
        rate: RateController,
        identities: IdentityRotator,
        store: S,
        images: ImagePipeline<F, I, S>,
        reporter: Arc<dyn JobReporter>,
    ) -> Self {
        Self {
            config: config.scheduler.clone(),
            retry: config.retry.clone(),
            cross_job_dedup: config.job.cross_job_dedup,
            rate,
            identities,
            global: Arc::new(Semaphore::new(config.scheduler.global_concurrency)),
            store,
            images,
            reporter,
        }
    }

    pub fn images(&self) -> &ImagePipeline<F, I, S> {
        &self.images
    }

    /// Number of units needed to cover `items` candidates.
    pub fn unit_count(&self, items: u32) -> u32 {
        items.div_ceil(self.config.unit_size)
    }

    /// Drive `job` to a terminal state.
    pub async fn run<A: SourceAdapter>(&self, job: Arc<JobHandle>, adapter: A) {
        let (job_id, request, requested) = job.read(|j| (j.id, j.request.clone(), j.items_requested));
        let total_units = self.unit_count(requested);
        job.write(|j| j.units_total = total_units);
        self.reporter.report(JobEvent::JobStarted {
            job_id,
            query: &request.query,
            source: &request.source,
            units: total_units,
        });

        let worker = FetchWorker::new(
            adapter,
            self.rate.clone(),
            self.identities.clone(),
            self.retry.clone(),
        );
        let pipeline = RecordPipeline::new(&request, self.images.enabled());
        let cancel = job.cancel_token().clone();

        let mut seen = HashSet::new();
        let mut tally = RunTally::default();
        let mut in_flight: JoinSet<UnitResult> = JoinSet::new();
        let mut next_sequence = 0usize;
        let mut halt: Option<Halt> = None;
        let mut grace_deadline: Option<Instant> = None;

        loop {
            if halt.is_none() && cancel.is_cancelled() {
                halt = Some(Halt::Cancelled);
            }

            while halt.is_none()
                && in_flight.len() < self.config.per_job_concurrency
                && next_sequence < total_units as usize
            {
                let unit = UnitOfWork {
                    job_id,
                    sequence: next_sequence,
                    page: next_sequence as u32 + 1,
                    limit: self.config.unit_size,
                    request: request.clone(),
                    block_retries: 0,
                    transient_retries: 0,
                };
                self.reporter.report(JobEvent::UnitDispatched {
                    job_id,
                    sequence: next_sequence,
                });
                in_flight.spawn(run_unit(
                    worker.clone(),
                    self.global.clone(),
                    cancel.clone(),
                    unit,
                ));
                next_sequence += 1;
            }

            if in_flight.is_empty() {
                break;
            }

            let deadline = grace_deadline.unwrap_or_else(Instant::now);
            tokio::select! {
                biased;

                () = cancel.cancelled(), if grace_deadline.is_none() => {
                    halt.get_or_insert(Halt::Cancelled);
                    grace_deadline = Some(Instant::now() + self.config.cancel_grace);
                    tracing::debug!(%job_id, in_flight = in_flight.len(), "Draining in-flight units");
                }
                () = tokio::time::sleep_until(deadline), if grace_deadline.is_some() => {
                    let count = in_flight.len();
                    in_flight.abort_all();
                    self.reporter.report(JobEvent::UnitsAbandoned { job_id, count });
                    break;
                }
                Some(joined) = in_flight.join_next() => {
                    if let Some(stop) = self.absorb(&job, &pipeline, &mut seen, &mut tally, total_units, joined).await {
                        if halt.is_none() {
                            self.reporter.report(JobEvent::DispatchHalted { job_id, reason: stop.reason() });
                            halt = Some(stop);
                        }
                        if stop == Halt::Saturated {
                            in_flight.abort_all();
                            break;
                        }
                    }
                }
            }
        }

        self.finish(&job, &tally);
    }

    /// Fold one finished unit into the job. Returns a reason to stop
    /// dispatching, if any.
    async fn absorb(
        &self,
        job: &Arc<JobHandle>,
        pipeline: &RecordPipeline,
        seen: &mut HashSet<String>,
        tally: &mut RunTally,
        total_units: u32,
        joined: Result<UnitResult, JoinError>,
    ) -> Option<Halt> {
        let job_id = job.read(|j| j.id);
        let (sequence, result) = match joined {
            Ok(done) => done,
            Err(e) if e.is_cancelled() => return None,
            Err(e) => {
                tracing::error!(%job_id, error = %e, "Unit task panicked");
                tally.failed += 1;
                job.write(|j| j.record_unit_failure(format!("unit task panicked: {e}")));
                return self.failure_halt(tally, total_units, false);
            }
        };

        match result {
            Ok(candidates) => {
                tally.succeeded += 1;
                job.write(|j| j.units_succeeded += 1);
                self.reporter.report(JobEvent::UnitSucceeded {
                    job_id,
                    sequence,
                    candidates: candidates.len(),
                });
                self.accept_candidates(job, pipeline, seen, candidates).await;
                let full = job.read(|j| j.remaining() == 0);
                full.then_some(Halt::Saturated)
            }
            Err(error) if !error.is_terminal_failure() => None,
            Err(error) => {
                tally.failed += 1;
                self.reporter.report(JobEvent::UnitFailed {
                    job_id,
                    sequence,
                    error: &error,
                });
                job.write(|j| j.record_unit_failure(error.to_string()));
                self.failure_halt(tally, total_units, error == FetchError::NoIdentities)
            }
        }
    }

    fn failure_halt(&self, tally: &RunTally, total_units: u32, no_identities: bool) -> Option<Halt> {
        if no_identities {
            return Some(Halt::NoIdentities);
        }
        let ratio = f64::from(tally.failed) / f64::from(total_units.max(1));
        (ratio >= self.config.max_failure_ratio).then_some(Halt::TooManyFailures)
    }

    async fn accept_candidates(
        &self,
        job: &Arc<JobHandle>,
        pipeline: &RecordPipeline,
        seen: &mut HashSet<String>,
        candidates: Vec<RawCandidate>,
    ) {
        for raw in candidates {
            if job.read(|j| j.remaining() == 0) {
                break;
            }

            let outcome = match pipeline.process(raw, seen) {
                Ok(record) if self.cross_job_dedup => {
                    match self.store.exists_by_fingerprint(&record.fingerprint).await {
                        Ok(true) => Err(Rejection::KnownInStore),
                        Ok(false) => Ok(record),
                        Err(e) => {
                            tracing::warn!(fingerprint = %record.fingerprint, error = %e, "Store lookup failed, accepting record");
                            Ok(record)
                        }
                    }
                }
                other => other,
            };

            match outcome {
                Ok(record) => {
                    if let Err(e) = self.store.upsert(&record).await {
                        tracing::warn!(fingerprint = %record.fingerprint, error = %e, "Failed to persist record");
                    }
                    let accepted = job.write(|j| j.accept(record.clone()));
                    if accepted && self.images.enabled() {
                        self.images.spawn(job.clone(), record);
                    }
                }
                Err(rejection) => {
                    tracing::debug!(%rejection, "Candidate rejected");
                    job.write(|j| j.reject(&rejection));
                }
            }
        }
    }

    fn finish(&self, job: &Arc<JobHandle>, tally: &RunTally) {
        let cancelled = job.cancel_token().is_cancelled();
        let (job_id, state, items_completed, items_found, error_count) = job.write(|j| {
            let target = if cancelled || j.state == JobState::Cancelling {
                JobState::Cancelled
            } else if tally.succeeded == 0 && tally.failed > 0 {
                JobState::Failed
            } else {
                JobState::Completed
            };
            if j.state == JobState::Running && target == JobState::Cancelled {
                j.transition(JobState::Cancelling);
            }
            j.transition(target);
            (
                j.id,
                j.state,
                j.items_completed,
                j.results.len() as u32,
                j.error_count,
            )
        });

        self.reporter.report(JobEvent::JobFinished {
            job_id,
            state,
            items_completed,
            items_found,
            error_count,
        });
    }
}

async fn run_unit<A: SourceAdapter>(
    worker: FetchWorker<A>,
    global: Arc<Semaphore>,
    cancel: CancellationToken,
    mut unit: UnitOfWork,
) -> UnitResult {
    let sequence = unit.sequence;
    let permit = tokio::select! {
        permit = global.acquire_owned() => permit,
        () = cancel.cancelled() => return (sequence, Err(FetchError::Cancelled)),
    };
    let Ok(_permit) = permit else {
        return (sequence, Err(FetchError::Cancelled));
    };
    (sequence, worker.execute(&mut unit, &cancel).await)
}

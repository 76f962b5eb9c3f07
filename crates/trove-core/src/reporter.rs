use uuid::Uuid;

use crate::error::FetchError;
use crate::job::JobState;

/// Events emitted by the job manager and scheduler for monitoring/logging.
#[derive(Debug, Clone)]
pub enum JobEvent<'a> {
    JobStarted {
        job_id: Uuid,
        query: &'a str,
        source: &'a str,
        units: u32,
    },
    UnitDispatched {
        job_id: Uuid,
        sequence: usize,
    },
    UnitSucceeded {
        job_id: Uuid,
        sequence: usize,
        candidates: usize,
    },
    UnitFailed {
        job_id: Uuid,
        sequence: usize,
        error: &'a FetchError,
    },
    DispatchHalted {
        job_id: Uuid,
        reason: &'a str,
    },
    CancelRequested {
        job_id: Uuid,
    },
    UnitsAbandoned {
        job_id: Uuid,
        count: usize,
    },
    JobFinished {
        job_id: Uuid,
        state: JobState,
        items_completed: u32,
        items_found: u32,
        error_count: u32,
    },
    ImagesHydrated {
        job_id: Uuid,
        fingerprint: &'a str,
        stored: usize,
        failed: usize,
    },
    JobsPurged {
        count: usize,
    },
}

/// Trait for receiving job events (decoupled logging).
pub trait JobReporter: Send + Sync {
    fn report(&self, event: JobEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingJobReporter;

impl JobReporter for TracingJobReporter {
    fn report(&self, event: JobEvent<'_>) {
        match event {
            JobEvent::JobStarted {
                job_id,
                query,
                source,
                units,
            } => {
                tracing::info!(%job_id, %query, %source, %units, "Job started");
            }
            JobEvent::UnitDispatched { job_id, sequence } => {
                tracing::debug!(%job_id, %sequence, "Unit dispatched");
            }
            JobEvent::UnitSucceeded {
                job_id,
                sequence,
                candidates,
            } => {
                tracing::debug!(%job_id, %sequence, %candidates, "Unit succeeded");
            }
            JobEvent::UnitFailed {
                job_id,
                sequence,
                error,
            } => {
                tracing::warn!(%job_id, %sequence, %error, "Unit failed");
            }
            JobEvent::DispatchHalted { job_id, reason } => {
                tracing::warn!(%job_id, %reason, "Dispatch halted");
            }
            JobEvent::CancelRequested { job_id } => {
                tracing::info!(%job_id, "Cancellation requested");
            }
            JobEvent::UnitsAbandoned { job_id, count } => {
                tracing::warn!(%job_id, %count, "In-flight units abandoned after grace period");
            }
            JobEvent::JobFinished {
                job_id,
                state,
                items_completed,
                items_found,
                error_count,
            } => {
                tracing::info!(
                    %job_id,
                    %state,
                    %items_completed,
                    %items_found,
                    %error_count,
                    "Job finished"
                );
            }
            JobEvent::ImagesHydrated {
                job_id,
                fingerprint,
                stored,
                failed,
            } => {
                tracing::debug!(%job_id, %fingerprint, %stored, %failed, "Images hydrated");
            }
            JobEvent::JobsPurged { count } => {
                tracing::info!(%count, "Purged expired jobs");
            }
        }
    }
}

//! Fetch worker: one fetch-and-parse attempt loop for a single unit.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::RetryPolicy;
use crate::error::{AppError, FetchError};
use crate::identity::{IdentityRotator, IdentityTicket, Outcome};
use crate::models::{RawCandidate, UnitOfWork};
use crate::rate::RateController;
use crate::traits::SourceAdapter;

/// How an attempt's error is handled.
enum Disposition {
    Block,
    Transient,
    Fatal,
}

fn classify(error: &AppError) -> Disposition {
    if error.is_block_signal() {
        Disposition::Block
    } else if error.is_retryable() || matches!(error, AppError::ParseError(_)) {
        Disposition::Transient
    } else {
        Disposition::Fatal
    }
}

/// Executes units of work against one source adapter.
///
/// Retries are local to the unit: an exhausted unit reports a terminal
/// [`FetchError`] and never blocks other units.
#[derive(Clone)]
pub struct FetchWorker<A: SourceAdapter> {
    adapter: A,
    rate: RateController,
    identities: IdentityRotator,
    policy: RetryPolicy,
}

impl<A: SourceAdapter> FetchWorker<A> {
    pub fn new(
        adapter: A,
        rate: RateController,
        identities: IdentityRotator,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            adapter,
            rate,
            identities,
            policy,
        }
    }

    /// Run attempts for `unit` until it yields candidates or its retry
    /// budget is spent. Retry counters on `unit` are updated in place.
    pub async fn execute(
        &self,
        unit: &mut UnitOfWork,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawCandidate>, FetchError> {
        let source = unit.source().to_string();

        loop {
            if !self.rate.wait(&source, cancel).await {
                return Err(FetchError::Cancelled);
            }

            let lease = loop {
                match self.identities.checkout_wait(cancel).await {
                    Ok(Some(lease)) => break lease,
                    Ok(None) => return Err(FetchError::Cancelled),
                    Err(AppError::PoolExhausted) => {
                        tracing::debug!(job_id = %unit.job_id, sequence = unit.sequence, "Still waiting for a free identity");
                    }
                    Err(AppError::NoUsableIdentities) => return Err(FetchError::NoIdentities),
                    Err(e) => return Err(FetchError::Fatal(e.to_string())),
                }
            };

            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            let error = match self.attempt(unit, lease.ticket()).await {
                Ok(candidates) => {
                    tracing::debug!(
                        job_id = %unit.job_id,
                        sequence = unit.sequence,
                        identity = lease.ticket().id,
                        candidates = candidates.len(),
                        "Attempt succeeded"
                    );
                    lease.release(Outcome::Success);
                    self.rate.record(&source, true);
                    return Ok(candidates);
                }
                Err(e) => e,
            };

            let identity = lease.ticket().id;
            let delay = match classify(&error) {
                Disposition::Block => {
                    lease.release(Outcome::Blocked);
                    self.rate.record(&source, false);
                    tracing::warn!(
                        job_id = %unit.job_id,
                        sequence = unit.sequence,
                        %identity,
                        %error,
                        "Block signal"
                    );
                    if unit.block_retries >= self.policy.max_block_retries {
                        return Err(FetchError::Blocked {
                            attempts: unit.attempts(),
                        });
                    }
                    unit.block_retries += 1;
                    self.policy.block_delay()
                }
                Disposition::Transient => {
                    lease.release(Outcome::Failed);
                    self.rate.record(&source, false);
                    tracing::debug!(
                        job_id = %unit.job_id,
                        sequence = unit.sequence,
                        %identity,
                        %error,
                        "Transient failure"
                    );
                    if unit.transient_retries >= self.policy.max_transient_retries {
                        return Err(FetchError::Transient {
                            attempts: unit.attempts(),
                            message: error.to_string(),
                        });
                    }
                    unit.transient_retries += 1;
                    self.policy.transient_delay(unit.transient_retries)
                }
                Disposition::Fatal => {
                    // Not the identity's fault: hand it back unchanged.
                    drop(lease);
                    return Err(FetchError::Fatal(error.to_string()));
                }
            };

            if !sleep_or_cancel(delay, cancel).await {
                return Err(FetchError::Cancelled);
            }
        }
    }

    async fn attempt(
        &self,
        unit: &UnitOfWork,
        identity: &IdentityTicket,
    ) -> Result<Vec<RawCandidate>, AppError> {
        let page = self.adapter.fetch(unit, identity).await?;
        self.adapter.parse(&page)
    }
}

async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        () = tokio::time::sleep(delay) => true,
        () = cancel.cancelled() => false,
    }
}

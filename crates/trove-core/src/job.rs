use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::{ImageStatus, ProductRecord};
use crate::pipeline::Rejection;
use crate::request::ScrapeRequest;

/// State of a scrape job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Cancelling => "cancelling",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Cancelling)
                | (Cancelling, Cancelled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobState::Pending),
            "running" => Ok(JobState::Running),
            "cancelling" => Ok(JobState::Cancelling),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            _ => Err(format!("Unknown job state: {}", s)),
        }
    }
}

/// A scrape job and its evolving outcome.
///
/// Counters only grow, and `items_completed` is capped at `items_requested`.
/// Once the job is terminal, only image hydration may touch it.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub request: Arc<ScrapeRequest>,
    pub state: JobState,
    /// Candidates processed by the record pipeline (accepted or not).
    pub items_completed: u32,
    pub items_requested: u32,
    /// Accepted records, in acceptance order.
    pub results: Vec<ProductRecord>,
    pub units_total: u32,
    pub units_succeeded: u32,
    /// Units that failed terminally.
    pub error_count: u32,
    pub quality_rejects: u32,
    pub duplicates: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(request: ScrapeRequest) -> Self {
        let items_requested = request.max_items;
        Self {
            id: Uuid::new_v4(),
            request: Arc::new(request),
            state: JobState::Pending,
            items_completed: 0,
            items_requested,
            results: Vec::new(),
            units_total: 0,
            units_succeeded: 0,
            error_count: 0,
            quality_rejects: 0,
            duplicates: 0,
            last_error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Fraction of requested items processed, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.items_requested == 0 {
            return 1.0;
        }
        f64::from(self.items_completed) / f64::from(self.items_requested)
    }

    pub fn remaining(&self) -> u32 {
        self.items_requested.saturating_sub(self.items_completed)
    }

    /// Move to `next` if the state machine allows it. Returns whether it moved.
    pub fn transition(&mut self, next: JobState) -> bool {
        if !self.state.can_transition_to(next) {
            tracing::debug!(job_id = %self.id, from = %self.state, to = %next, "Ignored state transition");
            return false;
        }
        self.state = next;
        match next {
            JobState::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.completed_at = Some(Utc::now()),
            _ => {}
        }
        true
    }

    /// Append an accepted record. Returns false if the job is full or terminal.
    pub fn accept(&mut self, record: ProductRecord) -> bool {
        if self.state.is_terminal() || self.remaining() == 0 {
            return false;
        }
        self.items_completed += 1;
        self.results.push(record);
        true
    }

    /// Count a processed candidate that did not make it into the results.
    pub fn reject(&mut self, rejection: &Rejection) -> bool {
        if self.state.is_terminal() || self.remaining() == 0 {
            return false;
        }
        self.items_completed += 1;
        if rejection.is_duplicate() {
            self.duplicates += 1;
        } else {
            self.quality_rejects += 1;
        }
        true
    }

    pub fn record_unit_failure(&mut self, error: String) {
        if self.state.is_terminal() {
            return;
        }
        self.error_count += 1;
        self.last_error = Some(error);
    }

    /// Reassign a record's images after hydration. Allowed after completion.
    pub fn update_images(
        &mut self,
        fingerprint: &str,
        images: Vec<String>,
        status: ImageStatus,
    ) -> Option<ProductRecord> {
        let record = self
            .results
            .iter_mut()
            .find(|r| r.fingerprint == fingerprint && r.image_status == ImageStatus::Pending)?;
        record.images = images;
        record.image_status = status;
        Some(record.clone())
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            summary: self.summary(),
            results: self.results.clone(),
        }
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            query: self.request.query.clone(),
            source: self.request.source.clone(),
            state: self.state,
            progress: self.progress(),
            items_completed: self.items_completed,
            items_requested: self.items_requested,
            items_found: self.results.len() as u32,
            units_total: self.units_total,
            error_count: self.error_count,
            quality_rejects: self.quality_rejects,
            duplicates: self.duplicates,
            last_error: self.last_error.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// Job overview without the result set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub query: String,
    pub source: String,
    pub state: JobState,
    pub progress: f64,
    pub items_completed: u32,
    pub items_requested: u32,
    pub items_found: u32,
    pub units_total: u32,
    pub error_count: u32,
    pub quality_rejects: u32,
    pub duplicates: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Read-only copy of a job handed to polling callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    #[serde(flatten)]
    pub summary: JobSummary,
    pub results: Vec<ProductRecord>,
}

/// Number of known jobs per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: usize,
    pub running: usize,
    pub cancelling: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobCounts {
    pub fn add(&mut self, state: JobState) {
        let slot = match state {
            JobState::Pending => &mut self.pending,
            JobState::Running => &mut self.running,
            JobState::Cancelling => &mut self.cancelling,
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
            JobState::Cancelled => &mut self.cancelled,
        };
        *slot += 1;
    }

    pub fn active(&self) -> usize {
        self.pending + self.running + self.cancelling
    }
}

/// A job plus its cancellation signal, shared between the manager, the
/// job's scheduler run and image hydration tasks.
#[derive(Debug)]
pub struct JobHandle {
    job: RwLock<Job>,
    cancel: CancellationToken,
}

impl JobHandle {
    pub fn new(job: Job) -> Self {
        Self {
            job: RwLock::new(job),
            cancel: CancellationToken::new(),
        }
    }

    pub fn read<R>(&self, f: impl FnOnce(&Job) -> R) -> R {
        let guard = self.job.read().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned job lock");
            poisoned.into_inner()
        });
        f(&guard)
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut Job) -> R) -> R {
        let mut guard = self.job.write().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned job lock");
            poisoned.into_inner()
        });
        f(&mut guard)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.read(Job::snapshot)
    }

    pub fn state(&self) -> JobState {
        self.read(|j| j.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Price;
    use std::collections::BTreeMap;

    fn record(fingerprint: &str) -> ProductRecord {
        ProductRecord {
            fingerprint: fingerprint.into(),
            title: "Gold ring".into(),
            price: Price {
                amount: 10.0,
                currency: "USD".into(),
            },
            source: "a".into(),
            url: None,
            category: None,
            condition: None,
            specifications: BTreeMap::new(),
            images: vec!["https://img.test/1.jpg".into()],
            image_status: ImageStatus::Pending,
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn test_state_roundtrip() {
        for state in [
            JobState::Pending,
            JobState::Running,
            JobState::Cancelling,
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
        ] {
            let parsed: JobState = state.as_str().parse().unwrap();
            assert_eq!(parsed, state);
        }
        assert!("bogus".parse::<JobState>().is_err());
    }

    #[test]
    fn test_state_machine() {
        let mut job = Job::new(ScrapeRequest::new("ring", "a", 2));
        assert!(!job.transition(JobState::Completed));
        assert!(job.transition(JobState::Running));
        assert!(job.started_at.is_some());
        assert!(job.transition(JobState::Cancelling));
        assert!(!job.transition(JobState::Completed));
        assert!(job.transition(JobState::Cancelled));
        assert!(job.completed_at.is_some());
        assert!(!job.transition(JobState::Running));
    }

    #[test]
    fn test_counters_are_capped_at_requested() {
        let mut job = Job::new(ScrapeRequest::new("ring", "a", 2));
        job.transition(JobState::Running);
        assert!(job.accept(record("a")));
        assert!(job.reject(&Rejection::Duplicate));
        assert!(!job.accept(record("b")));
        assert!(!job.reject(&Rejection::NoImages));

        assert_eq!(job.items_completed, 2);
        assert_eq!(job.results.len(), 1);
        assert_eq!(job.duplicates, 1);
        assert_eq!(job.quality_rejects, 0);
        assert_eq!(job.progress(), 1.0);
    }

    #[test]
    fn test_terminal_job_is_frozen_except_images() {
        let mut job = Job::new(ScrapeRequest::new("ring", "a", 5));
        job.transition(JobState::Running);
        job.accept(record("a"));
        job.transition(JobState::Completed);

        assert!(!job.accept(record("b")));
        job.record_unit_failure("late".into());
        assert_eq!(job.error_count, 0);

        let updated = job
            .update_images(
                "a",
                vec!["stored/x.jpg".into()],
                ImageStatus::Hydrated {
                    stored: 1,
                    failed: 0,
                },
            )
            .unwrap();
        assert_eq!(updated.images, vec!["stored/x.jpg".to_string()]);
        // Images are reassigned once.
        assert!(job.update_images("a", vec![], ImageStatus::Skipped).is_none());
    }

    #[test]
    fn test_snapshot_serializes_flat() {
        let job = Job::new(ScrapeRequest::new("ring", "a", 5));
        let value = serde_json::to_value(job.snapshot()).unwrap();
        assert_eq!(value["state"], "pending");
        assert_eq!(value["items_requested"], 5);
        assert!(value["results"].as_array().unwrap().is_empty());
    }
}

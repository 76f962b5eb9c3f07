//! Rotation pool of egress identities.
//!
//! Each identity is a route (proxy) plus client signature (User-Agent) with a
//! health score in `[0, 1]`. A fetch attempt checks out exactly one identity
//! and must hand it back with the attempt's outcome:
//!
//! ```text
//! free --checkout--> in use --release(Success)--> free (health up)
//!                           --release(Failed)---> free (health slightly down)
//!                           --release(Blocked)--> cooling down (health sharply down)
//!                                                     |
//!                           health reaches 0 -----> retired (kept, never handed out)
//! ```
//!
//! Checkout and release happen under one mutex, so health updates are
//! atomic with respect to selection.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::IdentityConfig;
use crate::error::AppError;

const HEALTH_CEILING: f64 = 1.0;

/// How an attempt using an identity ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// The source flagged the request as automated traffic.
    Blocked,
    /// Transient failure (timeout, connection error).
    Failed,
}

/// One pool entry.
#[derive(Debug, Clone)]
struct Identity {
    id: usize,
    route: Option<String>,
    user_agent: String,
    health: f64,
    in_use: bool,
    retired: bool,
    last_used: Option<Instant>,
    cooldown_until: Option<Instant>,
    successes: u64,
    blocks: u64,
    failures: u64,
}

impl Identity {
    fn is_cooling(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    fn is_eligible(&self, now: Instant) -> bool {
        !self.in_use && !self.retired && !self.is_cooling(now)
    }
}

/// The part of an identity an in-flight attempt needs to make a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityTicket {
    pub id: usize,
    pub route: Option<String>,
    pub user_agent: String,
}

/// Monitoring view of a pool entry. Route credentials are redacted.
#[derive(Debug, Clone, Serialize)]
pub struct IdentityStats {
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

/// Exclusive checkout of one identity.
///
/// Release it with [`IdentityLease::release`]. A lease dropped without an
/// explicit release (e.g. an abandoned attempt) returns the identity to the
/// pool without touching its health.
pub struct IdentityLease {
    ticket: IdentityTicket,
    rotator: IdentityRotator,
    released: bool,
}

impl IdentityLease {
    pub fn ticket(&self) -> &IdentityTicket {
        &self.ticket
    }

    pub fn release(mut self, outcome: Outcome) {
        self.released = true;
        self.rotator.give_back(self.ticket.id, Some(outcome));
    }
}

impl Drop for IdentityLease {
    fn drop(&mut self) {
        if !self.released {
            self.rotator.give_back(self.ticket.id, None);
        }
    }
}

/// Thread-safe identity pool shared by all fetch workers.
#[derive(Clone)]
pub struct IdentityRotator {
    config: Arc<IdentityConfig>,
    pool: Arc<Mutex<Vec<Identity>>>,
    returned: Arc<Notify>,
}

impl IdentityRotator {
    /// Build the pool from configuration. Entries live for the process lifetime.
    pub fn new(config: IdentityConfig) -> Self {
        let pool = config
            .identities
            .iter()
            .enumerate()
            .map(|(id, spec)| Identity {
                id,
                route: spec.route.clone(),
                user_agent: spec.user_agent.clone(),
                health: HEALTH_CEILING,
                in_use: false,
                retired: false,
                last_used: None,
                cooldown_until: None,
                successes: 0,
                blocks: 0,
                failures: 0,
            })
            .collect();

        Self {
            config: Arc::new(config),
            pool: Arc::new(Mutex::new(pool)),
            returned: Arc::new(Notify::new()),
        }
    }

    fn lock_pool(&self) -> std::sync::MutexGuard<'_, Vec<Identity>> {
        self.pool.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned identity pool mutex");
            poisoned.into_inner()
        })
    }

    /// Check out the healthiest free identity, least recently used on ties.
    ///
    /// Fails with [`AppError::PoolExhausted`] when every usable identity is
    /// busy or cooling down, and with [`AppError::NoUsableIdentities`] when
    /// none is usable at all.
    pub fn checkout(&self) -> Result<IdentityLease, AppError> {
        let mut pool = self.lock_pool();
        if pool.iter().all(|i| i.retired) {
            return Err(AppError::NoUsableIdentities);
        }

        let now = Instant::now();
        let chosen = pool
            .iter_mut()
            .filter(|i| i.is_eligible(now))
            .max_by(|a, b| {
                a.health
                    .partial_cmp(&b.health)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.last_used.cmp(&a.last_used))
            })
            .ok_or(AppError::PoolExhausted)?;

        chosen.in_use = true;
        chosen.last_used = Some(now);
        chosen.cooldown_until = None;

        let ticket = IdentityTicket {
            id: chosen.id,
            route: chosen.route.clone(),
            user_agent: chosen.user_agent.clone(),
        };
        drop(pool);

        Ok(IdentityLease {
            ticket,
            rotator: self.clone(),
            released: false,
        })
    }

    /// Check out an identity, waiting while the pool is exhausted.
    ///
    /// Returns `Ok(None)` if cancelled while waiting, and
    /// [`AppError::PoolExhausted`] if nothing frees up within the configured
    /// checkout timeout.
    pub async fn checkout_wait(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<IdentityLease>, AppError> {
        let deadline = Instant::now() + self.config.checkout_timeout;
        loop {
            let returned = self.returned.notified();
            match self.checkout() {
                Ok(lease) => return Ok(Some(lease)),
                Err(AppError::PoolExhausted) => {}
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(AppError::PoolExhausted);
            }
            let mut poll = self.config.checkout_poll.min(deadline - now);
            if let Some(expiry) = self.next_cooldown_expiry() {
                poll = poll.min(expiry);
            }

            tokio::select! {
                () = returned => {}
                () = tokio::time::sleep(poll) => {}
                () = cancel.cancelled() => return Ok(None),
            }
        }
    }

    fn give_back(&self, id: usize, outcome: Option<Outcome>) {
        let mut pool = self.lock_pool();
        let Some(identity) = pool.iter_mut().find(|i| i.id == id) else {
            return;
        };
        identity.in_use = false;

        match outcome {
            Some(Outcome::Success) => {
                identity.successes += 1;
                identity.health = (identity.health + self.config.success_reward).min(HEALTH_CEILING);
            }
            Some(Outcome::Blocked) => {
                identity.blocks += 1;
                identity.health = (identity.health - self.config.block_penalty).max(0.0);
                identity.cooldown_until = Some(Instant::now() + self.config.cooldown);
                tracing::warn!(
                    identity = id,
                    health = identity.health,
                    cooldown_secs = self.config.cooldown.as_secs(),
                    "Identity blocked, cooling down"
                );
            }
            Some(Outcome::Failed) => {
                identity.failures += 1;
                identity.health = (identity.health - self.config.failure_penalty).max(0.0);
            }
            None => {}
        }

        if !identity.retired && identity.health <= f64::EPSILON {
            identity.retired = true;
            tracing::warn!(
                identity = id,
                route = ?identity.route.as_deref().map(redact_route),
                "Identity retired: health exhausted, needs operator replacement"
            );
        }
        drop(pool);
        self.returned.notify_waiters();
    }

    /// Number of identities that are not retired.
    pub fn usable_count(&self) -> usize {
        self.lock_pool().iter().filter(|i| !i.retired).count()
    }

    /// Time until the earliest cooling identity becomes eligible again.
    pub fn next_cooldown_expiry(&self) -> Option<Duration> {
        let now = Instant::now();
        self.lock_pool()
            .iter()
            .filter(|i| !i.retired)
            .filter_map(|i| i.cooldown_until)
            .filter(|until| *until > now)
            .min()
            .map(|until| until - now)
    }

    pub fn stats(&self) -> Vec<IdentityStats> {
        let now = Instant::now();
        self.lock_pool()
            .iter()
            .map(|i| IdentityStats {
                id: i.id,
                route: i.route.as_deref().map(redact_route),
                user_agent: i.user_agent.clone(),
                health: i.health,
                in_use: i.in_use,
                retired: i.retired,
                cooling_down: i.is_cooling(now),
                successes: i.successes,
                blocks: i.blocks,
                failures: i.failures,
            })
            .collect()
    }
}

/// Hide `user:pass` in a proxy URL.
fn redact_route(route: &str) -> String {
    match (route.find("://"), route.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}***{}", &route[..scheme_end + 3], &route[at..])
        }
        _ => route.to_string(),
    }
}

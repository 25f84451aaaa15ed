//! Drives a ticket from submission to a terminal state.
//!
//! ```text
//! Submitted -> Polling(1) -> Polling(2) -> ... -> Completed
//!                                             \-> Failed
//!                                             \-> BudgetExceeded
//! ```
//!
//! Before every attempt the poller sleeps the next interval of a
//! non-decreasing schedule and takes a slot from the shared limiter. A
//! limiter deferral is just a longer wait. A poll that times out or fails
//! transiently costs budget but not an attempt. When the next wait would
//! overrun the budget the loop stops with `BudgetExceeded`, handing the
//! still-valid ticket back to the caller.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ConfigError;
use crate::error::{map_signal, ResolutionResult, RetryPolicy, UpstreamSignal};
use crate::provider::{TaskState, UpstreamClient};
use crate::rate_limit::SlidingWindowLimiter;
use crate::retry::TransientRetry;
use crate::types::TaskTicket;

/// Upper bound of the random spread added to limiter deferrals.
const DEFERRAL_JITTER_MS: u64 = 50;

/// Ordered wait intervals between poll attempts. The last interval repeats
/// once the list is exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    steps: Vec<Duration>,
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            steps: [500, 1000, 1000, 1500, 2000]
                .into_iter()
                .map(Duration::from_millis)
                .collect(),
        }
    }
}

impl BackoffSchedule {
    pub fn new(steps: Vec<Duration>) -> Result<Self, ConfigError> {
        if steps.is_empty() {
            return Err(ConfigError::Invalid("backoff schedule is empty".into()));
        }
        if steps.iter().any(|s| s.is_zero()) {
            return Err(ConfigError::Invalid(
                "backoff schedule intervals must be positive".into(),
            ));
        }
        if steps.windows(2).any(|w| w[1] < w[0]) {
            return Err(ConfigError::Invalid(
                "backoff schedule must be non-decreasing".into(),
            ));
        }
        Ok(Self { steps })
    }

    /// Parse a comma separated list of milliseconds.
    pub fn parse_millis(raw: &str) -> Result<Self, ConfigError> {
        let steps = raw
            .split(',')
            .map(|part| {
                part.trim()
                    .parse::<u64>()
                    .map(Duration::from_millis)
                    .map_err(|e| ConfigError::InvalidVar {
                        name: "KEYWORD_BACKOFF_SCHEDULE_MS".into(),
                        reason: format!("'{}': {}", part.trim(), e),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(steps)
    }

    /// Wait before attempt `attempt` (zero-based).
    pub fn delay(&self, attempt: usize) -> Duration {
        self.steps
            .get(attempt)
            .or_else(|| self.steps.last())
            .copied()
            .unwrap_or_default()
    }
}

/// Lifecycle of one ticket inside this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Submitted,
    Polling { attempt: u32 },
    Completed,
    Failed,
    BudgetExceeded,
}

impl PollState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PollState::Completed | PollState::Failed | PollState::BudgetExceeded
        )
    }

    /// Move to the next attempt. Terminal states stay put.
    pub fn begin_attempt(self) -> PollState {
        match self {
            PollState::Submitted => PollState::Polling { attempt: 1 },
            PollState::Polling { attempt } => PollState::Polling {
                attempt: attempt + 1,
            },
            terminal => terminal,
        }
    }

    /// Fold in what the provider reported. Terminal states never revert.
    pub fn observe(self, reply: &TaskState) -> PollState {
        if self.is_terminal() {
            return self;
        }
        match reply {
            TaskState::Queued => self,
            TaskState::Completed(_) => PollState::Completed,
            TaskState::Failed { .. } => PollState::Failed,
        }
    }

    pub fn expire(self) -> PollState {
        if self.is_terminal() {
            self
        } else {
            PollState::BudgetExceeded
        }
    }
}

/// Non-error results of a poll loop. Provider failures are returned as `Err`.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Completed {
        ticket: TaskTicket,
        payload: serde_json::Value,
        attempts: u32,
    },
    BudgetExceeded { ticket: TaskTicket, attempts: u32 },
}

pub struct Poller {
    upstream: Arc<dyn UpstreamClient>,
    limiter: Arc<SlidingWindowLimiter>,
    schedule: BackoffSchedule,
    retry: TransientRetry,
}

impl Poller {
    pub fn new(
        upstream: Arc<dyn UpstreamClient>,
        limiter: Arc<SlidingWindowLimiter>,
        schedule: BackoffSchedule,
        retry: TransientRetry,
    ) -> Self {
        Self {
            upstream,
            limiter,
            schedule,
            retry,
        }
    }

    fn attempts(state: PollState) -> u32 {
        match state {
            PollState::Polling { attempt } => attempt,
            _ => 0,
        }
    }

    /// Wait `wait`, unless that would cross `deadline`.
    async fn wait_within(wait: Duration, deadline: Instant) -> bool {
        if Instant::now() + wait > deadline {
            return false;
        }
        tokio::time::sleep(wait).await;
        true
    }

    /// Take a limiter slot, treating refusals as extra scheduled waits.
    async fn gate(&self, ticket: &TaskTicket, deadline: Instant) -> bool {
        loop {
            match self.limiter.try_acquire() {
                Ok(()) => return true,
                Err(defer) => {
                    let jitter = rand::thread_rng().gen_range(0..=DEFERRAL_JITTER_MS);
                    let defer = defer + Duration::from_millis(jitter);
                    debug!("Poll of {} deferred {:?} by limiter", ticket.ticket_id, defer);
                    if !Self::wait_within(defer, deadline).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Poll `ticket` until it completes, fails, or `budget` runs out.
    pub async fn poll(&self, ticket: &TaskTicket, budget: Duration) -> ResolutionResult<PollOutcome> {
        let deadline = Instant::now() + budget;
        let mut state = PollState::Submitted;
        let mut step = 0usize;

        loop {
            let wait = self.schedule.delay(step);
            step += 1;
            if !Self::wait_within(wait, deadline).await || !self.gate(ticket, deadline).await {
                let attempts = Self::attempts(state);
                info!(
                    "Poll budget {:?} exhausted for {} after {} attempts ({:?})",
                    budget,
                    ticket.ticket_id,
                    attempts,
                    state.expire()
                );
                return Ok(PollOutcome::BudgetExceeded {
                    ticket: ticket.clone(),
                    attempts,
                });
            }

            let reply = match self
                .retry
                .run("task_get", deadline, || {
                    self.upstream.get_task(ticket.kind, &ticket.ticket_id)
                })
                .await
            {
                Ok(reply) => reply,
                // The ticket is still valid; only the budget may end the loop.
                Err(e) if e.kind().retry_policy() != RetryPolicy::Never => {
                    warn!("Poll of {} gave no answer: {}", ticket.ticket_id, e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            state = state.begin_attempt();
            let attempts = Self::attempts(state);
            state = state.observe(&reply);

            match reply {
                TaskState::Queued => {
                    debug!("{} still queued (attempt {})", ticket.ticket_id, attempts);
                }
                TaskState::Completed(payload) => {
                    info!("{} completed after {} polls", ticket.ticket_id, attempts);
                    return Ok(PollOutcome::Completed {
                        ticket: ticket.clone(),
                        payload,
                        attempts,
                    });
                }
                TaskState::Failed { code, message } => {
                    info!("{} failed with status {}: {}", ticket.ticket_id, code, message);
                    return Err(map_signal(&UpstreamSignal::Application { code, message }));
                }
            }
        }
    }
}

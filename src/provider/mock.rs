//! In-process provider that replays a script, counting every submission and
//! poll. Engine, registry and tool tests run against it instead of the network.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{TaskState, UpstreamClient};
use crate::error::UpstreamSignal;
use crate::types::{TaskInput, TaskKind};

/// How tickets of one kind behave when polled.
#[derive(Debug, Clone)]
pub enum PollPlan {
    /// Report "in queue" `queued_polls` times, then complete.
    CompletesAfter {
        queued_polls: usize,
        payload: serde_json::Value,
    },
    /// Report "in queue" `queued_polls` times, then fail.
    FailsAfter {
        queued_polls: usize,
        code: u32,
        message: String,
    },
    /// Never leave the queue.
    NeverCompletes,
}

impl PollPlan {
    pub fn completes_after(queued_polls: usize, payload: serde_json::Value) -> Self {
        PollPlan::CompletesAfter {
            queued_polls,
            payload,
        }
    }

    pub fn fails_after(queued_polls: usize, code: u32, message: impl Into<String>) -> Self {
        PollPlan::FailsAfter {
            queued_polls,
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ScriptedProvider {
    plans: HashMap<TaskKind, PollPlan>,
    poll_delay: Duration,
    submit_failures: Mutex<VecDeque<UpstreamSignal>>,
    poll_failures: Mutex<VecDeque<UpstreamSignal>>,
    tickets: Mutex<HashMap<String, (TaskKind, usize)>>,
    submitted: Mutex<Vec<(TaskKind, TaskInput)>>,
    submissions: AtomicUsize,
    polls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(mut self, kind: TaskKind, plan: PollPlan) -> Self {
        self.plans.insert(kind, plan);
        self
    }

    /// Simulated latency of `task_get`.
    pub fn with_poll_delay(mut self, delay: Duration) -> Self {
        self.poll_delay = delay;
        self
    }

    /// Signals returned by the next submissions, in order, before any succeeds.
    pub fn with_submit_failures(self, failures: Vec<UpstreamSignal>) -> Self {
        *self.submit_failures.lock() = failures.into();
        self
    }

    /// Signals returned by the next polls, in order, before any is answered.
    pub fn with_poll_failures(self, failures: Vec<UpstreamSignal>) -> Self {
        *self.poll_failures.lock() = failures.into();
        self
    }

    /// Successful and failed `task_post` calls.
    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    /// All `task_get` calls, across tickets.
    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn polls_for(&self, ticket_id: &str) -> usize {
        self.tickets
            .lock()
            .get(ticket_id)
            .map(|(_, polls)| *polls)
            .unwrap_or(0)
    }

    pub fn submitted_inputs(&self) -> Vec<(TaskKind, TaskInput)> {
        self.submitted.lock().clone()
    }
}

#[async_trait]
impl UpstreamClient for ScriptedProvider {
    async fn post_task(&self, kind: TaskKind, input: &TaskInput) -> Result<String, UpstreamSignal> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        if let Some(signal) = self.submit_failures.lock().pop_front() {
            return Err(signal);
        }
        let ticket_id = uuid::Uuid::new_v4().to_string();
        self.tickets.lock().insert(ticket_id.clone(), (kind, 0));
        self.submitted.lock().push((kind, input.clone()));
        Ok(ticket_id)
    }

    async fn get_task(&self, kind: TaskKind, task_id: &str) -> Result<TaskState, UpstreamSignal> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if !self.poll_delay.is_zero() {
            tokio::time::sleep(self.poll_delay).await;
        }
        if let Some(signal) = self.poll_failures.lock().pop_front() {
            return Err(signal);
        }

        let answered = {
            let mut tickets = self.tickets.lock();
            let Some((ticket_kind, polls)) = tickets.get_mut(task_id) else {
                return Err(UpstreamSignal::Application {
                    code: 40401,
                    message: format!("Task '{task_id}' not found"),
                });
            };
            if *ticket_kind != kind {
                return Err(UpstreamSignal::Application {
                    code: 40401,
                    message: format!("Task '{task_id}' not found for {kind}"),
                });
            }
            let answered = *polls;
            *polls += 1;
            answered
        };

        let state = match self.plans.get(&kind) {
            None | Some(PollPlan::NeverCompletes) => TaskState::Queued,
            Some(PollPlan::CompletesAfter {
                queued_polls,
                payload,
            }) => {
                if answered < *queued_polls {
                    TaskState::Queued
                } else {
                    TaskState::Completed(payload.clone())
                }
            }
            Some(PollPlan::FailsAfter {
                queued_polls,
                code,
                message,
            }) => {
                if answered < *queued_polls {
                    TaskState::Queued
                } else {
                    TaskState::Failed {
                        code: *code,
                        message: message.clone(),
                    }
                }
            }
        };
        Ok(state)
    }
}

/// Build a search-volume style result payload: `(keyword, volume, competition_index)`.
pub fn volume_payload(rows: &[(&str, u64, u32)]) -> serde_json::Value {
    let items: Vec<serde_json::Value> = rows
        .iter()
        .map(|(keyword, volume, competition_index)| {
            let competition = match competition_index {
                0..=33 => "LOW",
                34..=66 => "MEDIUM",
                _ => "HIGH",
            };
            serde_json::json!({
                "keyword": keyword,
                "search_volume": volume,
                "cpc": 1.25,
                "competition": competition,
                "competition_index": competition_index,
                "low_top_of_page_bid": 0.5,
                "high_top_of_page_bid": 2.75,
                "monthly_searches": [
                    { "year": 2024, "month": 1, "search_volume": volume },
                    { "year": 2024, "month": 2, "search_volume": volume / 2 },
                ],
            })
        })
        .collect();
    serde_json::Value::Array(items)
}

/// Build a trends result payload: `(keyword, values)`.
pub fn trends_payload(rows: &[(&str, &[f64])]) -> serde_json::Value {
    let items: Vec<serde_json::Value> = rows
        .iter()
        .map(|(keyword, values)| serde_json::json!({ "keyword": keyword, "values": values }))
        .collect();
    serde_json::Value::Array(items)
}

//! Runs independent resolutions side by side and reports each one on its own.
//!
//! A failing branch never aborts its siblings. Only a branch marked required
//! can fail the composite.

use futures::future::{join_all, BoxFuture};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{ErrorKind, ResolutionError, ResolutionResult};
use crate::store::Outcome;
use crate::types::{ResolveMeta, ResolvedMetric};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BranchError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Per-branch result of a composite request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum BranchOutcome {
    Completed {
        data: Vec<ResolvedMetric>,
        meta: ResolveMeta,
    },
    Pending {
        #[serde(rename = "ticketId")]
        ticket_id: String,
    },
    Failed {
        error: BranchError,
    },
}

impl BranchOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, BranchOutcome::Completed { .. })
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, BranchOutcome::Pending { .. })
    }
}

impl From<Outcome> for BranchOutcome {
    fn from(outcome: Outcome) -> Self {
        use crate::types::Resolution;
        match outcome {
            Ok(Resolution::Completed { data, meta }) => BranchOutcome::Completed { data, meta },
            Ok(Resolution::Pending { meta }) => BranchOutcome::Pending {
                ticket_id: meta.ticket_id,
            },
            Err(err) => BranchOutcome::Failed {
                error: BranchError {
                    kind: err.kind(),
                    message: err.public_message(),
                },
            },
        }
    }
}

pub struct Branch<'a> {
    pub name: &'static str,
    pub required: bool,
    pub future: BoxFuture<'a, Outcome>,
}

impl<'a> Branch<'a> {
    pub fn new(name: &'static str, required: bool, future: BoxFuture<'a, Outcome>) -> Self {
        Self {
            name,
            required,
            future,
        }
    }

    pub fn required(name: &'static str, future: BoxFuture<'a, Outcome>) -> Self {
        Self::new(name, true, future)
    }

    pub fn optional(name: &'static str, future: BoxFuture<'a, Outcome>) -> Self {
        Self::new(name, false, future)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BranchReport {
    pub name: &'static str,
    pub required: bool,
    pub outcome: BranchOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompositeResult {
    pub branches: Vec<BranchReport>,
}

impl CompositeResult {
    pub fn get(&self, name: &str) -> Option<&BranchOutcome> {
        self.branches
            .iter()
            .find(|b| b.name == name)
            .map(|b| &b.outcome)
    }

    /// Take a branch outcome out by name.
    pub fn take(&mut self, name: &str) -> Option<BranchOutcome> {
        let index = self.branches.iter().position(|b| b.name == name)?;
        Some(self.branches.remove(index).outcome)
    }
}

pub struct Combiner;

impl Combiner {
    /// Drive every branch concurrently for at most `wait`. A branch still
    /// running at the deadline is reported as a timeout failure.
    pub async fn run(branches: Vec<Branch<'_>>, wait: Duration) -> ResolutionResult<CompositeResult> {
        let deadline = Instant::now() + wait;
        let finished = join_all(branches.into_iter().map(|branch| async move {
            let outcome = match tokio::time::timeout_at(deadline, branch.future).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!("Branch '{}' still running after {:?}", branch.name, wait);
                    Err(ResolutionError::Timeout(format!(
                        "{} did not finish within {:?}",
                        branch.name, wait
                    )))
                }
            };
            (branch.name, branch.required, outcome)
        }))
        .await;

        let mut reports = Vec::with_capacity(finished.len());
        for (name, required, outcome) in finished {
            if required {
                if let Err(err) = outcome {
                    debug!("Required branch '{}' failed: {}", name, err);
                    return Err(err);
                }
            }
            reports.push(BranchReport {
                name,
                required,
                outcome: outcome.into(),
            });
        }
        Ok(CompositeResult { branches: reports })
    }
}

/// Seed metrics plus related terms for one keyword.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeywordOverview {
    pub keyword: String,
    pub seed_metrics: BranchOutcome,
    pub related_keywords: BranchOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PendingMeta, Resolution, TaskKind};
    use chrono::Utc;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn completed() -> Outcome {
        Ok(Resolution::Completed {
            data: Vec::new(),
            meta: ResolveMeta {
                fetched_at: Utc::now(),
                ticket_id: "seed".into(),
                cached: false,
                unresolved: Vec::new(),
                rejected: Vec::new(),
            },
        })
    }

    fn pending() -> Outcome {
        Ok(Resolution::Pending {
            meta: PendingMeta {
                ticket_id: "related".into(),
                kind: TaskKind::RelatedKeywords,
                rejected: Vec::new(),
            },
        })
    }

    #[tokio::test(start_paused = true)]
    async fn completed_and_pending_branches_are_reported_independently() {
        let composite = Combiner::run(
            vec![
                Branch::required("seed", async { completed() }.boxed()),
                Branch::optional(
                    "related",
                    async {
                        tokio::time::sleep(Duration::from_secs(8)).await;
                        pending()
                    }
                    .boxed(),
                ),
            ],
            Duration::from_secs(13),
        )
        .await
        .unwrap();
        assert!(composite.get("seed").unwrap().is_completed());
        assert_eq!(
            composite.get("related"),
            Some(&BranchOutcome::Pending {
                ticket_id: "related".into()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn optional_failure_does_not_abort_sibling() {
        let sibling_finished = Arc::new(AtomicBool::new(false));
        let flag = sibling_finished.clone();
        let composite = Combiner::run(
            vec![
                Branch::optional(
                    "related",
                    async { Err(ResolutionError::RestrictedCategory("policy".into())) }.boxed(),
                ),
                Branch::required(
                    "seed",
                    async move {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        flag.store(true, Ordering::SeqCst);
                        completed()
                    }
                    .boxed(),
                ),
            ],
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert!(sibling_finished.load(Ordering::SeqCst));
        assert!(composite.get("seed").unwrap().is_completed());
        assert!(matches!(
            composite.get("related"),
            Some(BranchOutcome::Failed { error }) if error.kind == ErrorKind::RestrictedCategory
        ));
    }

    #[tokio::test]
    async fn required_failure_fails_the_composite() {
        let err = Combiner::run(
            vec![
                Branch::required("seed", async { Err(ResolutionError::Auth("bad login".into())) }.boxed()),
                Branch::optional("related", async { pending() }.boxed()),
            ],
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);
    }

    #[tokio::test(start_paused = true)]
    async fn branch_past_the_wait_is_a_timeout() {
        let mut composite = Combiner::run(
            vec![
                Branch::required("seed", async { completed() }.boxed()),
                Branch::optional(
                    "related",
                    async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        completed()
                    }
                    .boxed(),
                ),
            ],
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        match composite.take("related") {
            Some(BranchOutcome::Failed { error }) => assert_eq!(error.kind, ErrorKind::Timeout),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(composite.branches.len(), 1);
    }

    #[test]
    fn failed_branch_hides_auth_detail() {
        let outcome: BranchOutcome = Err(ResolutionError::Auth("login=secret".into())).into();
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failed");
        assert!(!json["error"]["message"].as_str().unwrap().contains("secret"));
    }
}

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

use crate::error::{ResolutionError, ResolutionResult};
use crate::provider::UpstreamClient;
use crate::retry::TransientRetry;
use crate::types::{TaskInput, TaskKind, TaskTicket};

/// How long transient submission failures keep being retried.
const SUBMIT_RETRY_WINDOW: Duration = Duration::from_secs(10);

/// Posts one unit of work to the provider.
pub struct TaskSubmitter {
    upstream: Arc<dyn UpstreamClient>,
    retry: TransientRetry,
}

impl TaskSubmitter {
    pub fn new(upstream: Arc<dyn UpstreamClient>, retry: TransientRetry) -> Self {
        Self { upstream, retry }
    }

    pub async fn submit(&self, kind: TaskKind, input: &TaskInput) -> ResolutionResult<TaskTicket> {
        if input.keywords.is_empty() {
            return Err(ResolutionError::Validation(format!(
                "{kind} task needs at least one keyword"
            )));
        }
        if input.keywords.len() > kind.max_batch() {
            return Err(ResolutionError::Validation(format!(
                "{kind} accepts at most {} keywords, got {}",
                kind.max_batch(),
                input.keywords.len()
            )));
        }

        let ticket_id = self
            .retry
            .run("task_post", Instant::now() + SUBMIT_RETRY_WINDOW, || self.upstream.post_task(kind, input))
            .await?;
        info!(
            "Submitted {} task {} ({} keywords, location {})",
            kind,
            ticket_id,
            input.keywords.len(),
            input.location_code
        );
        Ok(TaskTicket::new(ticket_id, kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, UpstreamSignal};
    use crate::provider::ScriptedProvider;

    fn retry() -> TransientRetry {
        TransientRetry {
            initial_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(50),
            max_attempts: 3,
            call_timeout: Duration::from_secs(1),
        }
    }

    fn input(n: usize) -> TaskInput {
        TaskInput {
            keywords: (0..n).map(|i| format!("kw {i}")).collect(),
            location_code: 2840,
            language_code: "en".into(),
            limit: None,
            search_partners: false,
            date_from: None,
            date_to: None,
        }
    }

    #[tokio::test]
    async fn returns_ticket_of_requested_kind() {
        let provider = Arc::new(ScriptedProvider::new());
        let submitter = TaskSubmitter::new(provider.clone(), retry());
        let ticket = submitter.submit(TaskKind::Trends, &input(2)).await.unwrap();
        assert_eq!(ticket.kind, TaskKind::Trends);
        assert!(!ticket.ticket_id.is_empty());
        assert_eq!(provider.submissions(), 1);
    }

    #[tokio::test]
    async fn batch_ceiling_is_checked_before_calling_out() {
        let provider = Arc::new(ScriptedProvider::new());
        let submitter = TaskSubmitter::new(provider.clone(), retry());
        let err = submitter
            .submit(TaskKind::RelatedKeywords, &input(21))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(provider.submissions(), 0);
        assert!(submitter.submit(TaskKind::SearchVolume, &input(1000)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_is_retried() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .with_submit_failures(vec![UpstreamSignal::Transport("connection reset".into())]),
        );
        let submitter = TaskSubmitter::new(provider.clone(), retry());
        assert!(submitter.submit(TaskKind::SearchVolume, &input(1)).await.is_ok());
        assert_eq!(provider.submissions(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn configuration_problem_is_fatal() {
        let provider = Arc::new(ScriptedProvider::new().with_submit_failures(vec![
            UpstreamSignal::Application {
                code: 40402,
                message: "Invalid Path".into(),
            },
        ]));
        let submitter = TaskSubmitter::new(provider.clone(), retry());
        let err = submitter.submit(TaskKind::SearchVolume, &input(1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);
        assert_eq!(provider.submissions(), 1);
    }
}

pub mod http;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

use async_trait::async_trait;

use crate::error::UpstreamSignal;
use crate::types::{TaskInput, TaskKind};

pub use http::HttpUpstream;
#[cfg(any(test, feature = "mock"))]
pub use mock::{PollPlan, ScriptedProvider};

/// State of a provider task as reported by one poll.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskState {
    /// Accepted but not finished. Includes "ok at HTTP level, in queue at
    /// application level".
    Queued,
    /// Finished; the payload may legitimately be empty.
    Completed(serde_json::Value),
    /// Finished with an application error.
    Failed { code: u32, message: String },
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Queued)
    }
}

/// The queue-based task API: submit once, then poll by id.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// `POST .../task_post`. Returns the provider's task id.
    async fn post_task(&self, kind: TaskKind, input: &TaskInput) -> Result<String, UpstreamSignal>;

    /// `GET .../task_get/{id}`.
    async fn get_task(&self, kind: TaskKind, task_id: &str) -> Result<TaskState, UpstreamSignal>;
}

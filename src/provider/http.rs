use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response};
use std::time::Duration;
use tracing::debug;

use super::{TaskState, UpstreamClient};
use crate::error::{classify_status, StatusClass, UpstreamSignal, STATUS_OK};
use crate::types::{ProviderEnvelope, ProviderTask, TaskInput, TaskKind};

/// reqwest-backed client for the provider's task endpoints.
#[derive(Clone, Debug)]
pub struct HttpUpstream {
    client: Client,
    base_url: String,
    login: String,
    password: String,
    call_timeout: Duration,
}

impl HttpUpstream {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        login: impl Into<String>,
        password: impl Into<String>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            login: login.into(),
            password: password.into(),
            call_timeout,
        }
    }

    fn endpoint(kind: TaskKind) -> &'static str {
        match kind {
            TaskKind::SearchVolume => "keywords_data/google_ads/search_volume",
            TaskKind::RelatedKeywords => "keywords_data/google_ads/keywords_for_keywords",
            TaskKind::Trends => "keywords_data/google_trends/explore",
        }
    }

    fn post_url(&self, kind: TaskKind) -> String {
        format!("{}/{}/task_post", self.base_url, Self::endpoint(kind))
    }

    fn get_url(&self, kind: TaskKind, task_id: &str) -> String {
        format!(
            "{}/{}/task_get/{}",
            self.base_url,
            Self::endpoint(kind),
            utf8_percent_encode(task_id, NON_ALPHANUMERIC)
        )
    }

    fn transport_signal(&self, err: reqwest::Error) -> UpstreamSignal {
        if err.is_timeout() {
            UpstreamSignal::CallTimeout(self.call_timeout)
        } else {
            UpstreamSignal::Transport(err.to_string())
        }
    }

    async fn read_envelope(&self, resp: Response) -> Result<ProviderEnvelope, UpstreamSignal> {
        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = resp.text().await.unwrap_or_default();
            return Err(UpstreamSignal::Http {
                status: status.as_u16(),
                body,
                retry_after,
            });
        }
        let envelope: ProviderEnvelope = resp
            .json()
            .await
            .map_err(|e| UpstreamSignal::Transport(format!("Failed to parse provider response: {}", e)))?;
        if envelope.status_code != STATUS_OK {
            return Err(UpstreamSignal::Application {
                code: envelope.status_code,
                message: envelope.status_message,
            });
        }
        Ok(envelope)
    }

    fn first_task(envelope: ProviderEnvelope) -> Result<ProviderTask, UpstreamSignal> {
        envelope
            .tasks
            .into_iter()
            .next()
            .ok_or_else(|| UpstreamSignal::Transport("provider response contained no task".into()))
    }
}

/// Interpret one task record from a `task_get` response.
pub fn interpret_task(task: ProviderTask) -> TaskState {
    match classify_status(task.status_code, &task.status_message) {
        StatusClass::InQueue => TaskState::Queued,
        StatusClass::Ok => TaskState::Completed(
            task.result
                .unwrap_or_else(|| serde_json::Value::Array(Vec::new())),
        ),
        StatusClass::Error(_) => TaskState::Failed {
            code: task.status_code,
            message: task.status_message,
        },
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstream {
    async fn post_task(&self, kind: TaskKind, input: &TaskInput) -> Result<String, UpstreamSignal> {
        let url = self.post_url(kind);
        debug!("Posting {} task to {}", kind, url);
        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.login, Some(&self.password))
            .header("Accept", "application/json")
            .json(&[input])
            .send()
            .await
            .map_err(|e| self.transport_signal(e))?;
        let task = Self::first_task(self.read_envelope(resp).await?)?;
        match classify_status(task.status_code, &task.status_message) {
            StatusClass::Ok => Ok(task.id),
            _ => Err(UpstreamSignal::Application {
                code: task.status_code,
                message: task.status_message,
            }),
        }
    }

    async fn get_task(&self, kind: TaskKind, task_id: &str) -> Result<TaskState, UpstreamSignal> {
        let url = self.get_url(kind, task_id);
        let resp = self
            .client
            .get(&url)
            .basic_auth(&self.login, Some(&self.password))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| self.transport_signal(e))?;
        let task = Self::first_task(self.read_envelope(resp).await?)?;
        Ok(interpret_task(task))
    }
}

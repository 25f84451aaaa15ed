//! Error taxonomy for keyword resolution and the mapping from raw upstream
//! signals onto it.
//!
//! The provider reports failures on two levels: transport (HTTP status codes,
//! connection errors, per-call timeouts) and application (a numeric status
//! code inside an otherwise successful response body). Both are funnelled
//! through [`map_signal`] so every call site classifies failures the same way.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Application status: request accepted.
pub const STATUS_OK: u32 = 20000;
/// Application status: task accepted into the provider queue.
pub const STATUS_TASK_CREATED: u32 = 20100;
/// Application status: task handed to a worker, result not ready.
pub const STATUS_TASK_HANDED: u32 = 40601;
/// Application status: task still waiting in the queue.
pub const STATUS_TASK_IN_QUEUE: u32 = 40602;

/// Fallback wait when the provider rate-limits without a `Retry-After` hint.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Stable, fieldless error kind. Exhaustive matches over this enum are how
/// retry and surfacing policy stay in sync with the taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    RateLimited,
    QuotaExceeded,
    Auth,
    Timeout,
    Network,
    RestrictedCategory,
    Upstream,
}

/// What the engine is allowed to do after a failure of a given kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Fatal. Broadcast to every waiter, never retried.
    Never,
    /// Retry once the computed wait has elapsed.
    AfterWait,
    /// Retry with jittered exponential backoff, bounded attempts.
    Backoff,
}

impl ErrorKind {
    pub fn retry_policy(self) -> RetryPolicy {
        match self {
            ErrorKind::Validation
            | ErrorKind::QuotaExceeded
            | ErrorKind::Auth
            | ErrorKind::RestrictedCategory
            | ErrorKind::Upstream => RetryPolicy::Never,
            ErrorKind::RateLimited => RetryPolicy::AfterWait,
            ErrorKind::Timeout | ErrorKind::Network => RetryPolicy::Backoff,
        }
    }

    /// HTTP status this kind is surfaced as.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::Validation | ErrorKind::RestrictedCategory => 400,
            ErrorKind::RateLimited => 429,
            ErrorKind::QuotaExceeded | ErrorKind::Auth => 503,
            ErrorKind::Timeout => 504,
            ErrorKind::Network => 502,
            ErrorKind::Upstream => 500,
        }
    }

    pub fn is_retryable(self) -> bool {
        self.retry_policy() != RetryPolicy::Never
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::Auth => "auth",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Network => "network",
            ErrorKind::RestrictedCategory => "restricted_category",
            ErrorKind::Upstream => "upstream",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolutionError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("Provider quota exceeded: {0}")]
    QuotaExceeded(String),
    /// Bad credentials or a provider-reported configuration problem.
    #[error("Provider authentication/configuration error: {0}")]
    Auth(String),
    #[error("Upstream call timed out: {0}")]
    Timeout(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Restricted category: {0}")]
    RestrictedCategory(String),
    #[error("Upstream error: {message}")]
    Upstream { code: Option<u32>, message: String },
}

pub type ResolutionResult<T> = Result<T, ResolutionError>;

impl ResolutionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResolutionError::Validation(_) => ErrorKind::Validation,
            ResolutionError::RateLimited { .. } => ErrorKind::RateLimited,
            ResolutionError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            ResolutionError::Auth(_) => ErrorKind::Auth,
            ResolutionError::Timeout(_) => ErrorKind::Timeout,
            ResolutionError::Network(_) => ErrorKind::Network,
            ResolutionError::RestrictedCategory(_) => ErrorKind::RestrictedCategory,
            ResolutionError::Upstream { .. } => ErrorKind::Upstream,
        }
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        ResolutionError::Upstream {
            code: None,
            message: message.into(),
        }
    }

    /// Message safe to show an end user. Credential and quota details stay in
    /// the logs.
    pub fn public_message(&self) -> String {
        match self {
            ResolutionError::Auth(_) => "Keyword data provider is unavailable".to_string(),
            ResolutionError::QuotaExceeded(_) => {
                "Keyword data provider is temporarily unavailable".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// A raw failure signal observed at the provider boundary, before
/// classification.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamSignal {
    /// Connection, DNS, TLS or body decoding failure.
    Transport(String),
    /// The per-call network timeout elapsed.
    CallTimeout(Duration),
    /// Non-success HTTP status.
    Http {
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },
    /// Application-level status code carried inside a 200 response.
    Application { code: u32, message: String },
}

/// Classification of an application status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Ok,
    InQueue,
    Error(ErrorKind),
}

/// Every application status code the provider documents, with its class.
pub const DOCUMENTED_STATUS_CODES: &[(u32, StatusClass)] = &[
    (STATUS_OK, StatusClass::Ok),
    (STATUS_TASK_CREATED, StatusClass::Ok),
    (40000, StatusClass::Error(ErrorKind::Upstream)),
    (40100, StatusClass::Error(ErrorKind::Auth)),
    (40101, StatusClass::Error(ErrorKind::Auth)),
    (40103, StatusClass::Error(ErrorKind::Auth)),
    (40104, StatusClass::Error(ErrorKind::Auth)),
    (40200, StatusClass::Error(ErrorKind::QuotaExceeded)),
    (40202, StatusClass::Error(ErrorKind::RateLimited)),
    (40209, StatusClass::Error(ErrorKind::RateLimited)),
    (40210, StatusClass::Error(ErrorKind::QuotaExceeded)),
    (40400, StatusClass::Error(ErrorKind::Upstream)),
    (40401, StatusClass::Error(ErrorKind::Upstream)),
    (40402, StatusClass::Error(ErrorKind::Auth)),
    (40501, StatusClass::Error(ErrorKind::Validation)),
    (40503, StatusClass::Error(ErrorKind::Validation)),
    (40505, StatusClass::Error(ErrorKind::RestrictedCategory)),
    (STATUS_TASK_HANDED, StatusClass::InQueue),
    (STATUS_TASK_IN_QUEUE, StatusClass::InQueue),
    (50000, StatusClass::Error(ErrorKind::Upstream)),
    (50301, StatusClass::Error(ErrorKind::Upstream)),
    (50401, StatusClass::Error(ErrorKind::Timeout)),
];

fn mentions_balance(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("balance") || lower.contains("insufficient funds")
}

/// Classify an application status code. Codes outside the documented table
/// fall through to `Upstream`, unless the message reports an exhausted
/// balance.
pub fn classify_status(code: u32, message: &str) -> StatusClass {
    if let Some((_, class)) = DOCUMENTED_STATUS_CODES.iter().find(|(c, _)| *c == code) {
        return *class;
    }
    if mentions_balance(message) {
        return StatusClass::Error(ErrorKind::QuotaExceeded);
    }
    StatusClass::Error(ErrorKind::Upstream)
}

/// Map an upstream failure signal onto the internal taxonomy. Pure.
pub fn map_signal(signal: &UpstreamSignal) -> ResolutionError {
    match signal {
        UpstreamSignal::Transport(msg) => ResolutionError::Network(msg.clone()),
        UpstreamSignal::CallTimeout(after) => {
            ResolutionError::Timeout(format!("no response within {after:?}"))
        }
        UpstreamSignal::Http {
            status,
            body,
            retry_after,
        } => match *status {
            401 | 403 => ResolutionError::Auth(format!("HTTP {status}")),
            402 => ResolutionError::QuotaExceeded(format!("HTTP {status}: {body}")),
            _ if mentions_balance(body) => {
                ResolutionError::QuotaExceeded(format!("HTTP {status}: {body}"))
            }
            429 => ResolutionError::RateLimited {
                retry_after: retry_after.unwrap_or(DEFAULT_RETRY_AFTER),
            },
            408 | 504 => ResolutionError::Timeout(format!("HTTP {status}")),
            500..=599 => ResolutionError::Network(format!("HTTP {status}: {body}")),
            _ => ResolutionError::Upstream {
                code: Some(u32::from(*status)),
                message: format!("HTTP {status}: {body}"),
            },
        },
        UpstreamSignal::Application { code, message } => match classify_status(*code, message) {
            StatusClass::Ok | StatusClass::InQueue => ResolutionError::Upstream {
                code: Some(*code),
                message: format!("status {code} reported as a failure: {message}"),
            },
            StatusClass::Error(kind) => error_for_kind(kind, *code, message),
        },
    }
}

fn error_for_kind(kind: ErrorKind, code: u32, message: &str) -> ResolutionError {
    let detail = format!("{code} {message}");
    match kind {
        ErrorKind::Validation => ResolutionError::Validation(detail),
        ErrorKind::RateLimited => ResolutionError::RateLimited {
            retry_after: DEFAULT_RETRY_AFTER,
        },
        ErrorKind::QuotaExceeded => ResolutionError::QuotaExceeded(detail),
        ErrorKind::Auth => ResolutionError::Auth(detail),
        ErrorKind::Timeout => ResolutionError::Timeout(detail),
        ErrorKind::Network => ResolutionError::Network(detail),
        ErrorKind::RestrictedCategory => ResolutionError::RestrictedCategory(detail),
        ErrorKind::Upstream => ResolutionError::Upstream {
            code: Some(code),
            message: message.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn documented_codes_are_unique() {
        let mut seen = HashSet::new();
        for (code, _) in DOCUMENTED_STATUS_CODES {
            assert!(seen.insert(*code), "duplicate status code {code}");
        }
    }

    #[test]
    fn every_documented_error_code_maps_to_its_kind() {
        for (code, class) in DOCUMENTED_STATUS_CODES {
            if let StatusClass::Error(kind) = class {
                let err = map_signal(&UpstreamSignal::Application {
                    code: *code,
                    message: "documented".into(),
                });
                assert_eq!(err.kind(), *kind, "code {code}");
            }
        }
    }

    #[test]
    fn unmapped_code_falls_through_to_upstream() {
        let err = map_signal(&UpstreamSignal::Application {
            code: 49999,
            message: "something odd".into(),
        });
        assert_eq!(
            err,
            ResolutionError::Upstream {
                code: Some(49999),
                message: "something odd".into()
            }
        );
    }

    #[test]
    fn balance_keyword_means_quota() {
        let err = map_signal(&UpstreamSignal::Application {
            code: 49998,
            message: "Your balance is too low".into(),
        });
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);

        let err = map_signal(&UpstreamSignal::Http {
            status: 400,
            body: "insufficient funds on balance".into(),
            retry_after: None,
        });
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
    }

    #[test]
    fn http_statuses_map_to_transport_kinds() {
        let http = |status| UpstreamSignal::Http {
            status,
            body: String::new(),
            retry_after: None,
        };
        assert_eq!(map_signal(&http(401)).kind(), ErrorKind::Auth);
        assert_eq!(map_signal(&http(403)).kind(), ErrorKind::Auth);
        assert_eq!(map_signal(&http(402)).kind(), ErrorKind::QuotaExceeded);
        assert_eq!(map_signal(&http(429)).kind(), ErrorKind::RateLimited);
        assert_eq!(map_signal(&http(504)).kind(), ErrorKind::Timeout);
        assert_eq!(map_signal(&http(502)).kind(), ErrorKind::Network);
        assert_eq!(map_signal(&http(404)).kind(), ErrorKind::Upstream);
    }

    #[test]
    fn rate_limit_keeps_retry_after_hint() {
        let err = map_signal(&UpstreamSignal::Http {
            status: 429,
            body: String::new(),
            retry_after: Some(Duration::from_secs(7)),
        });
        assert_eq!(
            err,
            ResolutionError::RateLimited {
                retry_after: Duration::from_secs(7)
            }
        );
    }

    #[test]
    fn transport_failures_are_retryable() {
        let err = map_signal(&UpstreamSignal::Transport("connection reset".into()));
        assert_eq!(err.kind(), ErrorKind::Network);
        assert_eq!(err.kind().retry_policy(), RetryPolicy::Backoff);

        let err = map_signal(&UpstreamSignal::CallTimeout(Duration::from_secs(10)));
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.kind().http_status(), 504);
    }

    #[test]
    fn fatal_kinds_are_never_retried() {
        for kind in [
            ErrorKind::Validation,
            ErrorKind::QuotaExceeded,
            ErrorKind::Auth,
            ErrorKind::RestrictedCategory,
        ] {
            assert!(!kind.is_retryable(), "{kind:?}");
        }
    }

    #[test]
    fn auth_detail_is_hidden_from_users() {
        let err = ResolutionError::Auth("40100 bad password for login x".into());
        assert!(!err.public_message().contains("password"));
        assert_eq!(err.kind().http_status(), 503);
    }
}

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ErrorKind, ResolutionError};

/// The unit of work the provider queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    SearchVolume,
    RelatedKeywords,
    Trends,
}

impl TaskKind {
    /// Largest number of terms a single task of this kind may carry.
    pub fn max_batch(self) -> usize {
        match self {
            TaskKind::SearchVolume => 1000,
            TaskKind::RelatedKeywords => 20,
            TaskKind::Trends => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::SearchVolume => "search_volume",
            TaskKind::RelatedKeywords => "related_keywords",
            TaskKind::Trends => "trends",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = ResolutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "search_volume" => Ok(TaskKind::SearchVolume),
            "related_keywords" => Ok(TaskKind::RelatedKeywords),
            "trends" => Ok(TaskKind::Trends),
            other => Err(ResolutionError::Validation(format!(
                "unknown task kind '{other}'"
            ))),
        }
    }
}

/// Opaque handle for a queued provider task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTicket {
    pub ticket_id: String,
    pub kind: TaskKind,
    pub submitted_at: DateTime<Utc>,
}

impl TaskTicket {
    pub fn new(ticket_id: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            ticket_id: ticket_id.into(),
            kind,
            submitted_at: Utc::now(),
        }
    }
}

pub(crate) fn default_location() -> String {
    "us".to_string()
}

/// A raw keyword resolution request as received from a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeywordRequest {
    pub kind: TaskKind,
    pub keywords: Vec<String>,
    #[serde(default = "default_location")]
    pub location: String,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub search_partners: bool,
    #[serde(default)]
    pub date_from: Option<NaiveDate>,
    #[serde(default)]
    pub date_to: Option<NaiveDate>,
}

impl KeywordRequest {
    pub fn new(kind: TaskKind, keywords: Vec<String>, location: impl Into<String>) -> Self {
        Self {
            kind,
            keywords,
            location: location.into(),
            limit: None,
            search_partners: false,
            date_from: None,
            date_to: None,
        }
    }
}

/// Seed term plus related-terms fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverviewRequest {
    pub keyword: String,
    #[serde(default = "default_location")]
    pub location: String,
    #[serde(default)]
    pub limit: Option<u32>,
    /// Fail the whole overview when the related-terms branch fails.
    #[serde(default)]
    pub require_related: bool,
}

/// Normalized work unit as sent to the provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskInput {
    pub keywords: Vec<String>,
    pub location_code: u32,
    pub language_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    pub search_partners: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_from: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_to: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompetitionLevel {
    Low,
    Medium,
    High,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyVolume {
    pub year: i32,
    pub month: u32,
    pub volume: u64,
}

/// A single parsed keyword metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedMetric {
    pub term: String,
    pub search_volume: u64,
    /// Heuristic 0..=100, see `metrics::estimate_difficulty`.
    pub difficulty_estimate: u8,
    pub difficulty_is_estimate: bool,
    pub cpc: f64,
    pub competition_index: u8,
    pub competition_level: CompetitionLevel,
    pub low_bid: f64,
    pub high_bid: f64,
    pub monthly_series: Vec<MonthlyVolume>,
    pub trend: Vec<f64>,
    pub spelling_corrected_from: Option<String>,
}

/// A keyword the normalizer refused, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidKeyword {
    pub input: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveMeta {
    pub fetched_at: DateTime<Utc>,
    pub ticket_id: String,
    #[serde(default)]
    pub cached: bool,
    /// Submitted terms the provider returned no data for.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unresolved: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<InvalidKeyword>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMeta {
    pub ticket_id: String,
    pub kind: TaskKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<InvalidKeyword>,
}

/// Outcome of a resolve call that did not raise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Resolution {
    Completed {
        data: Vec<ResolvedMetric>,
        meta: ResolveMeta,
    },
    /// Poll budget ran out while the ticket was still queued upstream.
    Pending { meta: PendingMeta },
}

impl Resolution {
    pub fn is_pending(&self) -> bool {
        matches!(self, Resolution::Pending { .. })
    }

    pub fn ticket_id(&self) -> &str {
        match self {
            Resolution::Completed { meta, .. } => &meta.ticket_id,
            Resolution::Pending { meta } => &meta.ticket_id,
        }
    }

    pub fn data(&self) -> Option<&[ResolvedMetric]> {
        match self {
            Resolution::Completed { data, .. } => Some(data),
            Resolution::Pending { .. } => None,
        }
    }

    pub(crate) fn with_rejected(mut self, rejected: Vec<InvalidKeyword>) -> Self {
        match &mut self {
            Resolution::Completed { meta, .. } => meta.rejected = rejected,
            Resolution::Pending { meta } => meta.rejected = rejected,
        }
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: ErrorKind,
}

impl From<&ResolutionError> for ErrorResponse {
    fn from(err: &ResolutionError) -> Self {
        Self {
            error: err.public_message(),
            kind: err.kind(),
        }
    }
}

// Provider API types

#[derive(Debug, Deserialize)]
pub struct ProviderEnvelope {
    pub status_code: u32,
    #[serde(default)]
    pub status_message: String,
    #[serde(default)]
    pub tasks: Vec<ProviderTask>,
}

#[derive(Debug, Deserialize)]
pub struct ProviderTask {
    pub id: String,
    pub status_code: u32,
    #[serde(default)]
    pub status_message: String,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

/// One keyword row from a search volume or related keywords result.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderKeywordItem {
    pub keyword: String,
    #[serde(default)]
    pub spell: Option<String>,
    #[serde(default)]
    pub search_volume: Option<u64>,
    #[serde(default)]
    pub cpc: Option<f64>,
    #[serde(default)]
    pub competition: Option<String>,
    #[serde(default)]
    pub competition_index: Option<u32>,
    #[serde(default)]
    pub low_top_of_page_bid: Option<f64>,
    #[serde(default)]
    pub high_top_of_page_bid: Option<f64>,
    #[serde(default)]
    pub monthly_searches: Option<Vec<ProviderMonthlySearch>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMonthlySearch {
    pub year: i32,
    pub month: u32,
    #[serde(default)]
    pub search_volume: Option<u64>,
}

/// One interest-over-time row from a trends result.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderTrendItem {
    pub keyword: String,
    #[serde(default)]
    pub values: Vec<Option<f64>>,
}

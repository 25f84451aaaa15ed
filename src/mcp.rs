use crate::combine::{BranchOutcome, KeywordOverview};
use crate::engine::KeywordEngine;
use crate::error::{ErrorKind, ResolutionError};
use crate::types::*;
use crate::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

/// Rows listed in a tool reply before the rest are summarized.
const MAX_LISTED_ROWS: usize = 25;

#[derive(Debug, Serialize, Deserialize)]
pub struct McpTool {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct McpToolsResponse {
    pub tools: Vec<McpTool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct McpCallRequest {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct McpCallResponse {
    pub content: Vec<McpContent>,
    pub is_error: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct McpContent {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: String,
}

/// A tool call that could not be dispatched at all.
#[derive(Debug, Error, PartialEq)]
pub enum ToolError {
    #[error("Invalid arguments: {0}")]
    InvalidParams(String),
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
}

/// Text reply of a dispatched tool. Engine failures are replies too, with
/// `is_error` set.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolReply {
    pub text: String,
    pub is_error: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetricsArgs {
    keywords: Vec<String>,
    #[serde(default = "default_location")]
    location: String,
    #[serde(default)]
    search_partners: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelatedArgs {
    keyword: String,
    #[serde(default = "default_location")]
    location: String,
    #[serde(default)]
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrendsArgs {
    keywords: Vec<String>,
    #[serde(default = "default_location")]
    location: String,
    #[serde(default)]
    date_from: Option<NaiveDate>,
    #[serde(default)]
    date_to: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResumeArgs {
    kind: String,
    ticket_id: String,
}

fn parse_args<T: serde::de::DeserializeOwned>(arguments: &serde_json::Value) -> Result<T, ToolError> {
    let arguments = if arguments.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        arguments.clone()
    };
    serde_json::from_value(arguments).map_err(|e| ToolError::InvalidParams(e.to_string()))
}

pub fn tool_definitions() -> Vec<McpTool> {
    let location = serde_json::json!({
        "type": "string",
        "description": "Two-letter region code, e.g. \"us\" or \"gb\"",
        "default": "us"
    });
    vec![
        McpTool {
            name: "keyword_metrics".to_string(),
            description: "Look up search volume, CPC, competition and a difficulty estimate for up to 1000 keywords. Returns a pending ticket if the provider is still working.".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "keywords": { "type": "array", "items": { "type": "string" }, "description": "Keywords to look up" },
                    "location": location,
                    "searchPartners": { "type": "boolean", "description": "Include search partner network volume" }
                },
                "required": ["keywords"]
            }),
        },
        McpTool {
            name: "related_keywords".to_string(),
            description: "Find keywords related to a seed keyword, ranked by search volume.".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "keyword": { "type": "string", "description": "Seed keyword" },
                    "location": location,
                    "limit": { "type": "integer", "minimum": 1, "maximum": 1000, "description": "Maximum related keywords to return" }
                },
                "required": ["keyword"]
            }),
        },
        McpTool {
            name: "keyword_trends".to_string(),
            description: "Relative search interest over time for up to 5 keywords.".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "keywords": { "type": "array", "items": { "type": "string" }, "maxItems": 5 },
                    "location": location,
                    "dateFrom": { "type": "string", "format": "date" },
                    "dateTo": { "type": "string", "format": "date" }
                },
                "required": ["keywords"]
            }),
        },
        McpTool {
            name: "keyword_overview".to_string(),
            description: "Metrics for a seed keyword together with its related keywords. Each part is reported separately as completed, pending or failed.".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "keyword": { "type": "string" },
                    "location": location,
                    "limit": { "type": "integer", "minimum": 1, "maximum": 1000 },
                    "requireRelated": { "type": "boolean", "description": "Fail the whole overview if related keywords fail" }
                },
                "required": ["keyword"]
            }),
        },
        McpTool {
            name: "resume_ticket".to_string(),
            description: "Continue waiting on a ticket returned earlier as pending.".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "kind": { "type": "string", "enum": ["search_volume", "related_keywords", "trends"] },
                    "ticketId": { "type": "string" }
                },
                "required": ["kind", "ticketId"]
            }),
        },
    ]
}

fn render_metric(text: &mut String, index: usize, metric: &ResolvedMetric) {
    let _ = write!(text, "{}. **{}**", index + 1, metric.term);
    if let Some(original) = &metric.spelling_corrected_from {
        let _ = write!(text, " (corrected from \"{}\")", original);
    }
    if metric.monthly_series.is_empty() && metric.search_volume == 0 {
        let trend = metric
            .trend
            .iter()
            .map(|v| format!("{v:.0}"))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(text, "\n   Trend: [{}]", trend);
        return;
    }
    let _ = writeln!(
        text,
        "\n   Volume: {} | Difficulty: ~{} | CPC: ${:.2} | Competition: {:?} ({})\n   Bids: ${:.2} - ${:.2}",
        metric.search_volume,
        metric.difficulty_estimate,
        metric.cpc,
        metric.competition_level,
        metric.competition_index,
        metric.low_bid,
        metric.high_bid,
    );
}

fn render_metrics(text: &mut String, data: &[ResolvedMetric]) {
    for (i, metric) in data.iter().take(MAX_LISTED_ROWS).enumerate() {
        render_metric(text, i, metric);
    }
    if data.len() > MAX_LISTED_ROWS {
        let _ = writeln!(text, "... and {} more", data.len() - MAX_LISTED_ROWS);
    }
}

pub fn render_resolution(resolution: &Resolution) -> String {
    let mut text = String::new();
    match resolution {
        Resolution::Completed { data, meta } => {
            let _ = writeln!(
                text,
                "Resolved {} keywords (ticket {}{})\n",
                data.len(),
                meta.ticket_id,
                if meta.cached { ", cached" } else { "" }
            );
            render_metrics(&mut text, data);
            if !meta.unresolved.is_empty() {
                let _ = writeln!(text, "\nNo data for: {}", meta.unresolved.join(", "));
            }
            if !meta.rejected.is_empty() {
                let _ = writeln!(text, "\nRejected input:");
                for rejected in &meta.rejected {
                    let _ = writeln!(text, "- \"{}\": {}", rejected.input, rejected.reason);
                }
            }
        }
        Resolution::Pending { meta } => {
            let _ = writeln!(
                text,
                "Still processing upstream. Call resume_ticket with kind \"{}\" and ticketId \"{}\" to continue.",
                meta.kind, meta.ticket_id
            );
        }
    }
    text
}

fn render_branch(text: &mut String, title: &str, outcome: &BranchOutcome) {
    let _ = writeln!(text, "## {}", title);
    match outcome {
        BranchOutcome::Completed { data, .. } if data.is_empty() => {
            let _ = writeln!(text, "No data returned.");
        }
        BranchOutcome::Completed { data, .. } => render_metrics(text, data),
        BranchOutcome::Pending { ticket_id } => {
            let _ = writeln!(text, "Pending, ticket {}", ticket_id);
        }
        BranchOutcome::Failed { error } => {
            let _ = writeln!(text, "Failed ({}): {}", error.kind.as_str(), error.message);
        }
    }
    text.push('\n');
}

pub fn render_overview(overview: &KeywordOverview) -> String {
    let mut text = format!("Overview for '{}'\n\n", overview.keyword);
    render_branch(&mut text, "Seed metrics", &overview.seed_metrics);
    render_branch(&mut text, "Related keywords", &overview.related_keywords);
    text
}

fn failure(action: &str, err: &ResolutionError) -> ToolReply {
    error!("{} failed: {}", action, err);
    ToolReply {
        text: format!("{} failed: {}", action, err.public_message()),
        is_error: true,
    }
}

fn reply(action: &str, result: Result<String, ResolutionError>) -> ToolReply {
    match result {
        Ok(text) => ToolReply {
            text,
            is_error: false,
        },
        Err(err) => failure(action, &err),
    }
}

/// Run one tool against the engine. Shared by the HTTP and stdio surfaces.
pub async fn dispatch(
    engine: &KeywordEngine,
    name: &str,
    arguments: &serde_json::Value,
) -> Result<ToolReply, ToolError> {
    match name {
        "keyword_metrics" => {
            let args: MetricsArgs = parse_args(arguments)?;
            let mut request = KeywordRequest::new(TaskKind::SearchVolume, args.keywords, args.location);
            request.search_partners = args.search_partners;
            let result = engine.resolve(&request).await;
            Ok(reply("Keyword lookup", result.map(|r| render_resolution(&r))))
        }
        "related_keywords" => {
            let args: RelatedArgs = parse_args(arguments)?;
            let mut request =
                KeywordRequest::new(TaskKind::RelatedKeywords, vec![args.keyword], args.location);
            request.limit = args.limit;
            let result = engine.resolve(&request).await;
            Ok(reply("Related keyword lookup", result.map(|r| render_resolution(&r))))
        }
        "keyword_trends" => {
            let args: TrendsArgs = parse_args(arguments)?;
            let mut request = KeywordRequest::new(TaskKind::Trends, args.keywords, args.location);
            request.date_from = args.date_from;
            request.date_to = args.date_to;
            let result = engine.resolve(&request).await;
            Ok(reply("Trend lookup", result.map(|r| render_resolution(&r))))
        }
        "keyword_overview" => {
            let request: OverviewRequest = parse_args(arguments)?;
            let result = engine.overview(&request).await;
            Ok(reply("Keyword overview", result.map(|o| render_overview(&o))))
        }
        "resume_ticket" => {
            let args: ResumeArgs = parse_args(arguments)?;
            let kind: TaskKind = args
                .kind
                .parse()
                .map_err(|e: ResolutionError| ToolError::InvalidParams(e.public_message()))?;
            let result = engine.resume_ticket(kind, &args.ticket_id).await;
            Ok(reply("Ticket resume", result.map(|r| render_resolution(&r))))
        }
        other => Err(ToolError::UnknownTool(other.to_string())),
    }
}

pub async fn list_tools() -> Json<McpToolsResponse> {
    Json(McpToolsResponse {
        tools: tool_definitions(),
    })
}

pub async fn call_tool(
    State(state): State<Arc<AppState>>,
    Json(request): Json<McpCallRequest>,
) -> Result<Json<McpCallResponse>, (StatusCode, Json<ErrorResponse>)> {
    info!("MCP tool call: {} with args: {:?}", request.name, request.arguments);

    match dispatch(&state.engine, &request.name, &request.arguments).await {
        Ok(reply) => Ok(Json(McpCallResponse {
            content: vec![McpContent {
                content_type: "text".to_string(),
                text: reply.text,
            }],
            is_error: reply.is_error,
        })),
        Err(e) => {
            let status = match e {
                ToolError::InvalidParams(_) => StatusCode::BAD_REQUEST,
                ToolError::UnknownTool(_) => StatusCode::NOT_FOUND,
            };
            Err((
                status,
                Json(ErrorResponse {
                    error: e.to_string(),
                    kind: ErrorKind::Validation,
                }),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::provider::mock::volume_payload;
    use crate::provider::{PollPlan, ScriptedProvider};
    use serde_json::json;

    fn engine(provider: Arc<ScriptedProvider>) -> KeywordEngine {
        KeywordEngine::new(EngineConfig::default(), provider)
    }

    #[test]
    fn every_tool_declares_an_object_schema() {
        let tools = tool_definitions();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "keyword_metrics",
                "related_keywords",
                "keyword_trends",
                "keyword_overview",
                "resume_ticket"
            ]
        );
        for tool in &tools {
            assert_eq!(tool.input_schema["type"], "object", "{}", tool.name);
            assert!(tool.input_schema["required"].is_array(), "{}", tool.name);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn keyword_metrics_renders_rows() {
        let provider = Arc::new(ScriptedProvider::new().with_plan(
            TaskKind::SearchVolume,
            PollPlan::completes_after(0, volume_payload(&[("rust async", 2900, 15)])),
        ));
        let engine = engine(provider);
        let reply = dispatch(&engine, "keyword_metrics", &json!({ "keywords": ["Rust Async"] }))
            .await
            .unwrap();
        assert!(!reply.is_error);
        assert!(reply.text.contains("**rust async**"), "{}", reply.text);
        assert!(reply.text.contains("Volume: 2900"), "{}", reply.text);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_reply_explains_how_to_resume() {
        let provider = Arc::new(ScriptedProvider::new().with_plan(TaskKind::Trends, PollPlan::NeverCompletes));
        let engine = engine(provider);
        let reply = dispatch(&engine, "keyword_trends", &json!({ "keywords": ["rust"], "location": "gb" }))
            .await
            .unwrap();
        assert!(!reply.is_error);
        assert!(reply.text.contains("resume_ticket"));
        assert!(reply.text.contains("\"trends\""));
    }

    #[tokio::test]
    async fn validation_failure_is_an_error_reply() {
        let provider = Arc::new(ScriptedProvider::new());
        let engine = engine(provider.clone());
        let reply = dispatch(&engine, "keyword_metrics", &json!({ "keywords": ["   "] }))
            .await
            .unwrap();
        assert!(reply.is_error);
        assert_eq!(provider.submissions(), 0);
    }

    #[tokio::test]
    async fn missing_arguments_and_unknown_tools_are_dispatch_errors() {
        let engine = engine(Arc::new(ScriptedProvider::new()));
        let err = dispatch(&engine, "related_keywords", &serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParams(_)));

        let err = dispatch(&engine, "resume_ticket", &json!({ "kind": "volume", "ticketId": "abc" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParams(_)));

        assert_eq!(
            dispatch(&engine, "search_web", &json!({})).await.unwrap_err(),
            ToolError::UnknownTool("search_web".into())
        );
    }
}

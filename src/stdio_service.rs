use rmcp::{model::*, ServiceExt};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::info;

use crate::config::EngineConfig;
use crate::mcp::{self, ToolError};
use crate::AppState;

#[derive(Clone)]
pub struct McpService {
    pub state: Arc<AppState>,
}

impl McpService {
    pub fn new() -> anyhow::Result<Self> {
        // stdout carries the protocol, so logs go to stderr
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();

        let config = EngineConfig::from_env()?;
        info!("Starting keyword MCP service");
        info!("Provider URL: {}", config.provider_url);

        let http_client = reqwest::Client::builder()
            .timeout(config.call_timeout)
            .gzip(true)
            .build()?;

        Ok(Self::with_state(Arc::new(AppState::new(config, http_client))))
    }

    pub fn with_state(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

fn to_rmcp_tool(tool: mcp::McpTool) -> Tool {
    let input_schema = match tool.input_schema {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    Tool::new(
        Cow::<'static, str>::Owned(tool.name),
        Cow::<'static, str>::Owned(tool.description),
        Arc::new(input_schema),
    )
}

impl rmcp::ServerHandler for McpService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            server_info: Implementation {
                name: "keyword-engine".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "Keyword metrics, related keywords and search trends from a queue-based data provider. Slow lookups return a ticket that can be resumed with resume_ticket.".to_string(),
            ),
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .build(),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self,
        _page: Option<PaginatedRequestParam>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        let tools = mcp::tool_definitions().into_iter().map(to_rmcp_tool).collect();
        Ok(ListToolsResult {
            tools,
            ..Default::default()
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        info!("MCP tool call: {} with args: {:?}", request.name, request.arguments);

        let arguments = request
            .arguments
            .map(serde_json::Value::Object)
            .unwrap_or(serde_json::Value::Null);

        match mcp::dispatch(&self.state.engine, request.name.as_ref(), &arguments).await {
            Ok(reply) if reply.is_error => Ok(CallToolResult::error(vec![Content::text(reply.text)])),
            Ok(reply) => Ok(CallToolResult::success(vec![Content::text(reply.text)])),
            Err(e @ ToolError::InvalidParams(_)) => {
                Err(ErrorData::new(ErrorCode::INVALID_PARAMS, e.to_string(), None))
            }
            Err(e @ ToolError::UnknownTool(_)) => {
                Err(ErrorData::new(ErrorCode::METHOD_NOT_FOUND, e.to_string(), None))
            }
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    let service = McpService::new()?;
    let maintenance = service
        .state
        .engine
        .spawn_maintenance(service.state.config.maintenance_interval);

    // Use the stdio transport from rmcp
    let server = service.serve(rmcp::transport::stdio()).await?;
    info!("MCP stdio server running");
    let _quit_reason = server.waiting().await?;
    maintenance.abort();
    Ok(())
}

pub mod coalesce;
pub mod combine;
pub mod config;
pub mod engine;
pub mod error;
pub mod mcp;
pub mod metrics;
pub mod normalize;
pub mod poller;
pub mod provider;
pub mod rate_limit;
pub mod retry;
pub mod stdio_service;
pub mod store;
pub mod submit;
pub mod types;

use std::sync::Arc;

use config::EngineConfig;
use engine::KeywordEngine;
use provider::{HttpUpstream, UpstreamClient};

#[derive(Clone)]
pub struct AppState {
    pub config: EngineConfig,
    // Shared by every handler; owns the cache, pending registry and limiter
    pub engine: Arc<KeywordEngine>,
}

// Re-export types for easy access
pub use types::*;

impl AppState {
    pub fn new(config: EngineConfig, http_client: reqwest::Client) -> Self {
        let upstream = Arc::new(HttpUpstream::new(
            http_client,
            config.provider_url.clone(),
            config.provider_login.clone(),
            config.provider_password.clone(),
            config.call_timeout,
        ));
        Self::with_upstream(config, upstream)
    }

    pub fn with_upstream(config: EngineConfig, upstream: Arc<dyn UpstreamClient>) -> Self {
        Self {
            engine: Arc::new(KeywordEngine::new(config.clone(), upstream)),
            config,
        }
    }
}

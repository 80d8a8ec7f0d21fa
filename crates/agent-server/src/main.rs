//! agent-server
//!
//! Axum server exposing the tool-using agent over REST and WebSocket.

mod approvals;
mod handlers;
mod state;
mod tools;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_core::{
    config::{Settings, StaticSettings},
    provider::Transport,
    reasoning::LoopConfig,
    session::MemoryConversationStore,
    subagent::{SubAgentConfig, SubAgentExecutor, SubAgentTool},
    tool::ToolRegistry,
};
use agent_runtime::{default_adapters, HttpTransport};

use crate::approvals::{ActiveTurns, PendingApprovals, RejectAll};
use crate::handlers::{chat_handler, chat_stream_handler, health_check, list_models};
use crate::state::AppState;
use crate::tools::{register_workspace_tools, Workspace};

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/models", get(list_models))
        .route("/api/chat", post(chat_handler))
        .route("/api/chat/stream", get(chat_stream_handler))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state)
}

/// Sub-agent definitions from the JSON file named by `AGENT_SUBAGENTS_FILE`
fn load_subagents(path: &Path) -> anyhow::Result<Vec<SubAgentConfig>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings: Arc<dyn Settings> = Arc::new(StaticSettings::from_env().context("loading channel settings")?);
    let adapters = Arc::new(default_adapters());
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new());

    let channels = settings.channels();
    if channels.is_empty() {
        tracing::warn!("no channels configured; set AGENT_CHANNELS and <PREFIX>_API_KEY");
    }
    for channel in &channels {
        tracing::info!(id = %channel.id, kind = %channel.channel_type, model = %channel.model, "channel");
    }

    let workspace = Workspace::from_env();
    tracing::info!(root = %workspace.root().display(), "workspace");
    let mut base_tools = ToolRegistry::new();
    register_workspace_tools(&mut base_tools, &workspace);

    let mut tools = base_tools.clone();
    if let Ok(path) = std::env::var("AGENT_SUBAGENTS_FILE") {
        let executor = Arc::new(
            SubAgentExecutor::new(adapters.clone(), transport.clone(), Arc::new(base_tools), settings.clone())
                .with_approver(Arc::new(RejectAll)),
        );
        for config in load_subagents(Path::new(&path))? {
            tracing::info!(tool = %config.tool_name(), "sub-agent");
            tools.register(SubAgentTool::new(executor.clone(), config));
        }
    }

    tracing::info!(count = tools.len(), tools = ?tools.names(), "registered tools");

    let loop_config = LoopConfig::from_env();
    tracing::info!(
        mode = %loop_config.mode,
        max_iterations = loop_config.max_iterations,
        max_runtime_secs = loop_config.max_runtime_seconds,
        "loop limits"
    );

    let state = AppState {
        settings,
        adapters,
        transport,
        tools: Arc::new(tools),
        store: Arc::new(MemoryConversationStore::new()),
        approvals: Arc::new(PendingApprovals::new()),
        turns: Arc::new(ActiveTurns::new()),
        loop_config,
    };

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    tracing::info!("agent-server listening on http://{}", addr);
    tracing::info!("  GET  /health          - Health check");
    tracing::info!("  GET  /api/models      - List channel models");
    tracing::info!("  POST /api/chat        - Run one turn");
    tracing::info!("  GET  /api/chat/stream - WebSocket streaming");

    axum::serve(listener, build_router(state)).await?;

    Ok(())
}

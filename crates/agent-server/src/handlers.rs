//! HTTP/WebSocket Handlers

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use agent_core::{
    error::AgentError,
    policy::Mode,
    provider::{ModelInfo, TokenUsage},
    reasoning::{EventSink, LoopStatus},
    session::ConversationId,
    stream::{EventRouter, StreamChunk},
};

use crate::approvals::RejectAll;
use crate::state::AppState;

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub default_channel: Option<String>,
    pub backend_connected: bool,
    pub tools: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub mode: Option<Mode>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub message: String,
    pub conversation_id: ConversationId,
    pub model: String,
    pub status: &'static str,
    pub iterations: u32,
    pub tool_calls: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
pub struct ModelsQuery {
    #[serde(default)]
    pub channel: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Commands a WebSocket client may send
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientCommand {
    Chat {
        message: String,
        #[serde(default)]
        conversation_id: Option<ConversationId>,
        #[serde(default)]
        channel: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        mode: Option<Mode>,
    },
    Cancel {
        conversation_id: ConversationId,
    },
    Confirm {
        conversation_id: ConversationId,
        #[serde(default)]
        approved: Vec<String>,
    },
    Activate {
        conversation_id: ConversationId,
    },
}

/// Connection-level messages that belong to no turn
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
enum ServerNotice {
    Started { conversation_id: ConversationId },
    CommandError { message: String },
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    TurnFailed(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, error) = match &self {
            ApiError::Agent(e @ AgentError::Config(_)) => (StatusCode::BAD_REQUEST, "CONFIG_ERROR", e.user_message()),
            ApiError::Agent(
                e @ (AgentError::Protocol { .. } | AgentError::Transport(_) | AgentError::MalformedResponse(_)),
            ) => (StatusCode::BAD_GATEWAY, "BACKEND_ERROR", e.user_message()),
            ApiError::Agent(e) => (StatusCode::INTERNAL_SERVER_ERROR, "AGENT_ERROR", e.user_message()),
            ApiError::Conflict(message) => (StatusCode::CONFLICT, "TURN_IN_PROGRESS", message.clone()),
            ApiError::TurnFailed(message) => (StatusCode::INTERNAL_SERVER_ERROR, "AGENT_ERROR", message.clone()),
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error,
                code: code.into(),
            }),
        )
            .into_response()
    }
}

fn status_label(status: &LoopStatus) -> &'static str {
    match status {
        LoopStatus::Completed => "completed",
        LoopStatus::Cancelled => "cancelled",
        LoopStatus::Error(_) => "error",
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let default_channel = state.settings.default_channel();
    let backend_connected = match default_channel.clone().map(|c| state.client(c)) {
        Some(Ok(client)) => client.health_check().await,
        _ => false,
    };

    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        default_channel: default_channel.map(|c| c.id),
        backend_connected,
        tools: state.tools.len(),
    })
}

/// Model catalog of a channel (default channel unless `?channel=`)
pub async fn list_models(
    State(state): State<AppState>,
    Query(query): Query<ModelsQuery>,
) -> Result<Json<Vec<ModelInfo>>, ApiError> {
    let channel = state.channel(query.channel.as_deref(), None)?;
    let models = state.client(channel)?.list_models().await?;
    Ok(Json(models))
}

/// Run one turn to completion
pub async fn chat_handler(
    State(state): State<AppState>,
    Json(payload): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let conversation_id = payload.conversation_id.unwrap_or_default();
    let channel = state.channel(payload.channel.as_deref(), payload.model.as_deref())?;
    let model = channel.model.clone();
    let agent = state.agent(payload.mode, Arc::new(RejectAll))?;

    // dropped with this future if the client goes away
    let turn = state
        .turns
        .start(&conversation_id)
        .ok_or_else(|| ApiError::Conflict(format!("a turn is already running for {conversation_id}")))?;
    let (events, receiver) = mpsc::unbounded_channel();
    drop(receiver);

    let outcome = agent
        .send(&conversation_id, payload.message, channel, &events, turn.cancel_token())
        .await;
    drop(turn);

    if let LoopStatus::Error(message) = &outcome.status {
        return Err(ApiError::TurnFailed(message.clone()));
    }
    Ok(Json(ChatResponse {
        message: outcome.text(),
        model: outcome.model_version.clone().unwrap_or(model),
        status: status_label(&outcome.status),
        iterations: outcome.iterations,
        tool_calls: outcome.tool_calls.len(),
        usage: outcome.usage,
        conversation_id,
    }))
}

/// WebSocket streaming chat
pub async fn chat_stream_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_stream(socket, state))
}

fn chunk_json(chunk: &StreamChunk) -> Option<String> {
    serde_json::to_string(chunk)
        .inspect_err(|e| tracing::warn!(error = %e, "unserializable stream chunk"))
        .ok()
}

fn notice_json(notice: &ServerNotice) -> Option<String> {
    serde_json::to_string(notice).ok()
}

fn command_error(message: impl Into<String>) -> Vec<String> {
    notice_json(&ServerNotice::CommandError {
        message: message.into(),
    })
    .into_iter()
    .collect()
}

async fn handle_stream(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (events, mut incoming) = mpsc::unbounded_channel::<StreamChunk>();
    let mut router = EventRouter::new();
    // generation of the turn this socket last started, per conversation
    let mut started: HashMap<ConversationId, u64> = HashMap::new();

    'conn: loop {
        let outgoing: Vec<String> = tokio::select! {
            msg = receiver.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break 'conn,
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "WebSocket error");
                        break 'conn;
                    }
                    Some(Ok(_)) => continue 'conn,
                };
                match serde_json::from_str::<ClientCommand>(text.as_str()) {
                    Ok(command) => handle_command(&state, command, &mut router, &mut started, &events).await,
                    Err(e) => command_error(format!("invalid command: {e}")),
                }
            }
            Some(chunk) = incoming.recv() => {
                router.route(chunk).as_ref().and_then(chunk_json).into_iter().collect()
            }
        };

        for text in outgoing {
            if sender.send(Message::Text(text.into())).await.is_err() {
                break 'conn;
            }
        }
    }

    cancel_started(&state, &started);
}

/// Cancel the turns this socket started that are still running
fn cancel_started(state: &AppState, started: &HashMap<ConversationId, u64>) {
    for (id, generation) in started {
        if state.turns.cancel_generation(id, *generation) {
            state.approvals.discard(id);
        }
    }
}

async fn handle_command(
    state: &AppState,
    command: ClientCommand,
    router: &mut EventRouter,
    started: &mut HashMap<ConversationId, u64>,
    events: &EventSink,
) -> Vec<String> {
    match command {
        ClientCommand::Chat {
            message,
            conversation_id,
            channel,
            model,
            mode,
        } => {
            let id = conversation_id.unwrap_or_default();
            let mut out: Vec<String> = notice_json(&ServerNotice::Started {
                conversation_id: id.clone(),
            })
            .into_iter()
            .collect();
            out.extend(router.activate(id.clone()).iter().filter_map(chunk_json));

            let turn = TurnRequest {
                message,
                channel,
                model,
                mode,
            };
            match start_turn(state, id.clone(), turn, events.clone()) {
                Ok(generation) => {
                    started.insert(id, generation);
                }
                Err(e) => out.extend(command_error(e.to_string())),
            }
            out
        }
        ClientCommand::Cancel { conversation_id } => {
            if state.turns.cancel(&conversation_id) {
                state.approvals.discard(&conversation_id);
                Vec::new()
            } else {
                command_error(format!("no running turn for {conversation_id}"))
            }
        }
        ClientCommand::Confirm {
            conversation_id,
            approved,
        } => {
            if state
                .approvals
                .resolve(&conversation_id, approved.into_iter().collect())
            {
                Vec::new()
            } else {
                command_error(format!("nothing awaiting confirmation for {conversation_id}"))
            }
        }
        ClientCommand::Activate { conversation_id } => router
            .activate(conversation_id)
            .iter()
            .filter_map(chunk_json)
            .collect(),
    }
}

struct TurnRequest {
    message: String,
    channel: Option<String>,
    model: Option<String>,
    mode: Option<Mode>,
}

/// Spawn a turn whose events go to `events`; returns its generation
fn start_turn(state: &AppState, id: ConversationId, turn: TurnRequest, events: EventSink) -> Result<u64, ApiError> {
    let channel = state.channel(turn.channel.as_deref(), turn.model.as_deref())?;
    let agent = state.agent(turn.mode, state.approvals.clone())?;
    let guard = state
        .turns
        .start(&id)
        .ok_or_else(|| ApiError::Conflict(format!("a turn is already running for {id}")))?;
    let generation = guard.generation();

    tokio::spawn(async move {
        let outcome = agent.send(&id, turn.message, channel, &events, guard.cancel_token()).await;
        tracing::info!(
            conversation_id = %id,
            status = status_label(&outcome.status),
            iterations = outcome.iterations,
            "turn finished"
        );
        drop(guard);
    });
    Ok(generation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use agent_core::config::{ChannelConfig, ChannelType, StaticSettings};
    use agent_core::error::Result as AgentResult;
    use agent_core::provider::{HttpRequestSpec, RawEventStream, Transport};
    use agent_core::reasoning::LoopConfig;
    use agent_core::session::{ConversationStore, MemoryConversationStore};
    use agent_core::tool::ToolRegistry;
    use agent_runtime::default_adapters;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::approvals::{ActiveTurns, PendingApprovals};

    /// Speaks the chat-completions stream format without a network
    struct CannedTransport;

    #[async_trait]
    impl Transport for CannedTransport {
        async fn send(&self, _request: HttpRequestSpec) -> AgentResult<Value> {
            Ok(json!({"data": [{"id": "canned-model"}]}))
        }

        async fn stream(&self, _request: HttpRequestSpec) -> AgentResult<RawEventStream> {
            let events = vec![
                Ok(json!({"model": "canned-model-001", "choices": [{"index": 0, "delta": {"content": "Hello"}}]})),
                Ok(json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]})),
            ];
            Ok(Box::pin(futures::stream::iter(events)))
        }
    }

    /// Opens a stream that never yields
    struct StalledTransport;

    #[async_trait]
    impl Transport for StalledTransport {
        async fn send(&self, _request: HttpRequestSpec) -> AgentResult<Value> {
            Ok(json!({"data": []}))
        }

        async fn stream(&self, _request: HttpRequestSpec) -> AgentResult<RawEventStream> {
            Ok(Box::pin(futures::stream::pending()))
        }
    }

    fn test_state() -> AppState {
        test_state_with(Arc::new(CannedTransport))
    }

    fn test_state_with(transport: Arc<dyn Transport>) -> AppState {
        let channel = ChannelConfig::new("main", ChannelType::OpenAi, "key", "canned-model").with_base_url("http://canned");
        AppState {
            settings: Arc::new(StaticSettings::new(vec![channel])),
            adapters: Arc::new(default_adapters()),
            transport,
            tools: Arc::new(ToolRegistry::new()),
            store: Arc::new(MemoryConversationStore::new()),
            approvals: Arc::new(PendingApprovals::new()),
            turns: Arc::new(ActiveTurns::new()),
            loop_config: LoopConfig::default(),
        }
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_chat(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/chat")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_default_channel() {
        let app = crate::build_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["defaultChannel"], "main");
        assert_eq!(body["backendConnected"], true);
    }

    #[tokio::test]
    async fn test_models_lists_channel_catalog() {
        let app = crate::build_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/api/models").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(body_json(response).await[0]["id"], "canned-model");
    }

    #[tokio::test]
    async fn test_chat_runs_turn_and_stores_history() {
        let state = test_state();
        let store = state.store.clone();
        let app = crate::build_router(state);

        let response = app
            .oneshot(post_chat(json!({"message": "hi", "conversationId": "conv-1"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["message"], "Hello");
        assert_eq!(body["status"], "completed");
        assert_eq!(body["model"], "canned-model-001");
        assert_eq!(body["conversationId"], "conv-1");

        let history = store.get_history(&ConversationId::from_string("conv-1")).await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_chat_unknown_channel_is_bad_request() {
        let app = crate::build_router(test_state());
        let response = app
            .oneshot(post_chat(json!({"message": "hi", "channel": "nope"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "CONFIG_ERROR");
    }

    #[tokio::test]
    async fn test_chat_conflicts_with_running_turn() {
        let state = test_state();
        let _running = state.turns.start(&ConversationId::from_string("busy")).unwrap();
        let app = crate::build_router(state.clone());

        let response = app
            .oneshot(post_chat(json!({"message": "hi", "conversationId": "busy"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_dropped_request_releases_turn() {
        let state = test_state_with(Arc::new(StalledTransport));
        let turns = state.turns.clone();
        let app = crate::build_router(state);
        let id = ConversationId::from_string("c-drop");

        let request = app.oneshot(post_chat(json!({"message": "hi", "conversationId": "c-drop"})));
        assert!(tokio::time::timeout(Duration::from_millis(200), request).await.is_err());

        assert!(!turns.is_running(&id));
        assert!(turns.start(&id).is_some());
    }

    #[tokio::test]
    async fn test_socket_close_leaves_newer_turn_alone() {
        let state = test_state();
        let id = ConversationId::from_string("shared");
        let mut started = HashMap::new();

        let first = state.turns.start(&id).unwrap();
        started.insert(id.clone(), first.generation());
        drop(first);

        let second = state.turns.start(&id).unwrap();
        cancel_started(&state, &started);

        assert!(!second.cancel_token().is_cancelled());
        assert!(state.turns.is_running(&id));
    }

    #[test]
    fn test_client_commands_parse() {
        let chat: ClientCommand =
            serde_json::from_value(json!({"type": "chat", "message": "hi", "mode": "readonly"})).unwrap();
        assert!(matches!(chat, ClientCommand::Chat { mode: Some(Mode::Readonly), conversation_id: None, .. }));

        let confirm: ClientCommand =
            serde_json::from_value(json!({"type": "confirm", "conversationId": "c", "approved": ["a"]})).unwrap();
        assert!(matches!(confirm, ClientCommand::Confirm { ref approved, .. } if approved == &["a".to_string()]));

        assert!(serde_json::from_value::<ClientCommand>(json!({"type": "cancel"})).is_err());
    }

    #[test]
    fn test_notice_shape() {
        let json = serde_json::to_value(ServerNotice::Started {
            conversation_id: ConversationId::from_string("c-9"),
        })
        .unwrap();
        assert_eq!(json, json!({"type": "started", "conversationId": "c-9"}));
    }
}

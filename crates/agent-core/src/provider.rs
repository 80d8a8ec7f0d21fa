//! Protocol Adapter Strategy Pattern
//!
//! Defines the seam between the unified conversation model and each backend
//! family's wire format. An adapter is a pure translator: it builds an
//! [`HttpRequestSpec`], parses a non-streaming body, and maps one raw stream
//! event to zero or more [`ChunkDelta`]s. Sending bytes is the job of a
//! [`Transport`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_core::provider::{AdapterRegistry, ChannelClient};
//!
//! let client = ChannelClient::new(&adapters, transport, channel)?;
//! let mut deltas = client.stream(&request).await?;
//! ```

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::Arc;

use crate::config::{ChannelConfig, ChannelType};
use crate::error::{AgentError, Result};
use crate::message::{Content, ContentMetadata, Part, Role};
use crate::session::ConversationId;
use crate::tool::ToolDeclaration;

/// Option keys understood by every adapter
pub mod option_keys {
    pub const TEMPERATURE: &str = "temperature";
    pub const MAX_TOKENS: &str = "maxTokens";
    pub const TOP_P: &str = "topP";
}

/// Generation options with an explicit enabled-flag map.
///
/// Adapters serialize a field only when its flag is `true`; provider-specific
/// extensions live in `extra` under their own keys and follow the same rule.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationOptions {
    #[serde(default)]
    pub temperature: Option<f32>,

    #[serde(default)]
    pub max_tokens: Option<u32>,

    #[serde(default)]
    pub top_p: Option<f32>,

    /// Provider-specific fields, passed through verbatim when enabled
    #[serde(default)]
    pub extra: Map<String, Value>,

    #[serde(default)]
    pub enabled: BTreeMap<String, bool>,
}

impl GenerationOptions {
    pub fn is_enabled(&self, key: &str) -> bool {
        self.enabled.get(key).copied().unwrap_or(false)
    }

    /// Set a flag (builder style)
    pub fn enable(mut self, key: impl Into<String>) -> Self {
        self.enabled.insert(key.into(), true);
        self
    }

    pub fn temperature(&self) -> Option<f32> {
        self.temperature.filter(|_| self.is_enabled(option_keys::TEMPERATURE))
    }

    pub fn max_tokens(&self) -> Option<u32> {
        self.max_tokens.filter(|_| self.is_enabled(option_keys::MAX_TOKENS))
    }

    pub fn top_p(&self) -> Option<f32> {
        self.top_p.filter(|_| self.is_enabled(option_keys::TOP_P))
    }

    /// Extension fields whose flag is set
    pub fn enabled_extra(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.extra.iter().filter(|(key, _)| self.is_enabled(key))
    }
}

/// Token usage statistics
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Fold a partial report into this one; non-zero fields win.
    pub fn merge(&mut self, other: &TokenUsage) {
        if other.prompt_tokens > 0 {
            self.prompt_tokens = other.prompt_tokens;
        }
        if other.completion_tokens > 0 {
            self.completion_tokens = other.completion_tokens;
        }
        self.total_tokens = other
            .total_tokens
            .max(self.prompt_tokens + self.completion_tokens);
    }

    /// Sum usage across turns
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Reason for completion finishing
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolUse,
    ContentFilter,
    Error,
}

/// One generation request, backend-agnostic
#[derive(Clone, Debug)]
pub struct GenerateRequest {
    pub conversation_id: ConversationId,
    pub history: Vec<Content>,
    pub system_instruction: Option<String>,
    /// Mode/context material injected at the insertion point
    pub dynamic_context: Option<String>,
    pub tools: Vec<ToolDeclaration>,
    pub options: GenerationOptions,
    pub stream: bool,
}

impl GenerateRequest {
    pub fn new(conversation_id: ConversationId, history: Vec<Content>) -> Self {
        Self {
            conversation_id,
            history,
            system_instruction: None,
            dynamic_context: None,
            tools: Vec::new(),
            options: GenerationOptions::default(),
            stream: true,
        }
    }

    /// History with dynamic context spliced in
    pub fn prepared_history(&self) -> Vec<Content> {
        match self.dynamic_context.as_deref() {
            Some(ctx) => crate::message::inject_dynamic_context(&self.history, ctx),
            None => self.history.clone(),
        }
    }
}

/// Non-streaming result mapped to the unified shape
#[derive(Clone, Debug)]
pub struct GenerateResponse {
    pub content: Content,
    pub usage: Option<TokenUsage>,
    pub model_version: Option<String>,
    pub finish_reason: Option<FinishReason>,
}

impl GenerateResponse {
    /// Replay as stream deltas so one accumulator handles both paths
    pub fn into_deltas(self) -> Vec<ChunkDelta> {
        let mut deltas = Vec::new();
        if let Some(version) = self.model_version {
            deltas.push(ChunkDelta::ModelVersion(version));
        }
        for part in self.content.parts {
            match part {
                Part::Text { text } => deltas.push(ChunkDelta::Text(text)),
                Part::FunctionCall { id, name, args } => deltas.push(ChunkDelta::ToolCall {
                    id: Some(id),
                    name,
                    args,
                }),
                Part::FunctionResponse { .. } => {}
            }
        }
        if let Some(usage) = self.usage {
            deltas.push(ChunkDelta::Usage(usage));
        }
        deltas.push(ChunkDelta::Finish(self.finish_reason.unwrap_or(FinishReason::Stop)));
        deltas
    }

    /// Build the assistant content with metadata attached
    pub fn assistant(parts: Vec<Part>, usage: Option<TokenUsage>, model_version: Option<String>, finish_reason: Option<FinishReason>) -> Self {
        let content = Content {
            parts,
            ..Content::new(Role::Assistant)
        }
        .with_metadata(ContentMetadata {
            usage: usage.clone(),
            model_version: model_version.clone(),
            finish_reason,
        });
        Self {
            content,
            usage,
            model_version,
            finish_reason,
        }
    }
}

/// Backend-agnostic stream delta produced by an adapter for one raw event
#[derive(Clone, Debug, PartialEq)]
pub enum ChunkDelta {
    /// Text appended to the active text part
    Text(String),
    /// A streamed tool call opened at `index`
    ToolCallBegin {
        index: u32,
        id: Option<String>,
        name: Option<String>,
    },
    /// Argument fragment for the call at `index`
    ToolCallArgs { index: u32, fragment: String },
    /// The call at `index` is finished; its buffer may be parsed
    ToolCallEnd { index: u32 },
    /// A tool call delivered whole (no fragments)
    ToolCall {
        id: Option<String>,
        name: String,
        args: Value,
    },
    Usage(TokenUsage),
    ModelVersion(String),
    /// Explicit terminal signal from the backend
    Finish(FinishReason),
    /// Backend-reported error inside the stream
    Error(String),
}

/// HTTP method for a request spec
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// Fully built HTTP request, ready for a [`Transport`]
#[derive(Clone, Debug)]
pub struct HttpRequestSpec {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    pub stream: bool,
    pub timeout_secs: Option<u64>,
}

impl HttpRequestSpec {
    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers: Vec::new(),
            body: Some(body),
            stream: false,
            timeout_secs: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            stream: false,
            timeout_secs: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Case-insensitive header lookup
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Information about a model
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub context_length: Option<u32>,
}

/// Strategy trait for backend protocol translation
///
/// Implemented once per backend family. Must not perform I/O.
pub trait ProtocolAdapter: Send + Sync {
    /// Backend family this adapter speaks
    fn channel_type(&self) -> ChannelType;

    /// Translate a unified request into a backend HTTP request
    fn build_request(&self, request: &GenerateRequest, channel: &ChannelConfig) -> Result<HttpRequestSpec>;

    /// Map a non-streaming success body to the unified shape
    fn parse_response(&self, raw: &Value) -> Result<GenerateResponse>;

    /// Map one native stream event; unknown or malformed events yield nothing
    fn parse_stream_chunk(&self, raw: &Value) -> Vec<ChunkDelta>;

    /// Backend-native tool schema
    fn convert_tools(&self, tools: &[ToolDeclaration]) -> Value;

    /// Model-listing request for this backend
    fn models_request(&self, channel: &ChannelConfig) -> HttpRequestSpec;

    /// Parse a model-listing body
    fn parse_models(&self, raw: &Value) -> Vec<ModelInfo>;

    /// True iff the config targets this backend and carries credentials
    fn validate_config(&self, config: &ChannelConfig) -> bool {
        config.channel_type == self.channel_type() && !config.api_key.trim().is_empty()
    }
}

/// Raw backend events, one JSON object per item
pub type RawEventStream = Pin<Box<dyn Stream<Item = Result<Value>> + Send>>;

/// Unified deltas
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<ChunkDelta>> + Send>>;

/// Sends [`HttpRequestSpec`]s. Dropping a returned stream aborts the request.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send and decode a JSON body; non-2xx maps to [`AgentError::Protocol`]
    async fn send(&self, request: HttpRequestSpec) -> Result<Value>;

    /// Send and yield the body as a sequence of JSON events
    async fn stream(&self, request: HttpRequestSpec) -> Result<RawEventStream>;
}

/// Explicit adapter registry, built once at startup
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<ChannelType, Arc<dyn ProtocolAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own channel type
    pub fn register<A: ProtocolAdapter + 'static>(&mut self, adapter: A) {
        self.adapters.insert(adapter.channel_type(), Arc::new(adapter));
    }

    pub fn register_arc(&mut self, adapter: Arc<dyn ProtocolAdapter>) {
        self.adapters.insert(adapter.channel_type(), adapter);
    }

    pub fn get(&self, channel_type: ChannelType) -> Result<Arc<dyn ProtocolAdapter>> {
        self.adapters
            .get(&channel_type)
            .cloned()
            .ok_or_else(|| AgentError::AdapterNotFound(channel_type.to_string()))
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Adapter, transport and channel bundled for one backend
#[derive(Clone)]
pub struct ChannelClient {
    adapter: Arc<dyn ProtocolAdapter>,
    transport: Arc<dyn Transport>,
    channel: ChannelConfig,
}

impl ChannelClient {
    /// Resolve the adapter for `channel` and validate its config
    pub fn new(adapters: &AdapterRegistry, transport: Arc<dyn Transport>, channel: ChannelConfig) -> Result<Self> {
        let adapter = adapters.get(channel.channel_type)?;
        if !adapter.validate_config(&channel) {
            return Err(AgentError::Config(format!(
                "channel '{}' is not a valid {} configuration",
                channel.id, channel.channel_type
            )));
        }
        Ok(Self {
            adapter,
            transport,
            channel,
        })
    }

    pub fn channel(&self) -> &ChannelConfig {
        &self.channel
    }

    pub fn adapter(&self) -> &dyn ProtocolAdapter {
        self.adapter.as_ref()
    }

    /// Non-streaming generation
    pub async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse> {
        let mut request = request.clone();
        request.stream = false;
        let spec = self.adapter.build_request(&request, &self.channel)?;
        let raw = self.transport.send(spec).await?;
        self.adapter.parse_response(&raw)
    }

    /// Streaming generation as unified deltas
    pub async fn stream(&self, request: &GenerateRequest) -> Result<DeltaStream> {
        let mut request = request.clone();
        request.stream = true;
        let spec = self.adapter.build_request(&request, &self.channel)?;
        let raw = self.transport.stream(spec).await?;
        let adapter = self.adapter.clone();
        let deltas = raw.flat_map(move |event| {
            let items: Vec<Result<ChunkDelta>> = match event {
                Ok(value) => adapter.parse_stream_chunk(&value).into_iter().map(Ok).collect(),
                Err(e) => vec![Err(e)],
            };
            futures::stream::iter(items)
        });
        Ok(Box::pin(deltas))
    }

    /// Simple model-catalog fetch
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let spec = self.adapter.models_request(&self.channel);
        let raw = self.transport.send(spec).await?;
        Ok(self.adapter.parse_models(&raw))
    }

    /// Check the backend answers the model-listing endpoint
    pub async fn health_check(&self) -> bool {
        match self.list_models().await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(channel = %self.channel.id, error = %e, "health check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generation_options_flags() {
        let mut opts = GenerationOptions {
            temperature: Some(0.2),
            max_tokens: Some(512),
            ..Default::default()
        };
        opts.extra.insert("thinkingBudget".into(), json!(1024));
        opts.extra.insert("seed".into(), json!(7));
        let opts = opts.enable(option_keys::TEMPERATURE).enable("seed");

        assert_eq!(opts.temperature(), Some(0.2));
        assert_eq!(opts.max_tokens(), None);
        let extra: Vec<_> = opts.enabled_extra().map(|(k, _)| k.as_str()).collect();
        assert_eq!(extra, vec!["seed"]);
    }

    #[test]
    fn test_usage_merge_keeps_partial_reports() {
        let mut usage = TokenUsage::new(12, 0);
        usage.merge(&TokenUsage {
            prompt_tokens: 0,
            completion_tokens: 30,
            total_tokens: 0,
        });
        assert_eq!(usage, TokenUsage::new(12, 30));
    }

    #[test]
    fn test_response_into_deltas_ends_with_finish() {
        let response = GenerateResponse::assistant(
            vec![Part::text("hi")],
            Some(TokenUsage::new(1, 2)),
            Some("model-x".into()),
            None,
        );
        let deltas = response.into_deltas();
        assert_eq!(deltas.first(), Some(&ChunkDelta::ModelVersion("model-x".into())));
        assert_eq!(deltas.last(), Some(&ChunkDelta::Finish(FinishReason::Stop)));
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let spec = HttpRequestSpec::get("http://x").header("X-Api-Key", "k");
        assert_eq!(spec.header_value("x-api-key"), Some("k"));
    }
}

//! OpenAI Chat Completions Adapter
//!
//! `POST {base}/chat/completions`, streaming with `stream_options.include_usage`
//! so token counts arrive in a trailing chunk. Tool arguments travel as JSON
//! strings in both directions.

use agent_core::config::{ChannelConfig, ChannelType};
use agent_core::error::{AgentError, Result};
use agent_core::message::{Content, Part, Role};
use agent_core::provider::{
    ChunkDelta, FinishReason, GenerateRequest, GenerateResponse, HttpRequestSpec, ModelInfo, ProtocolAdapter,
    TokenUsage,
};
use agent_core::tool::ToolDeclaration;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::common::{args_from_str, args_to_string, normalize_base_url, response_to_string, with_auth, write_options};

/// Key header used when bearer auth is switched off (Azure-style gateways)
const API_KEY_HEADER: &str = "api-key";

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Value>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(flatten)]
    options: Map<String, Value>,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Serialize, Debug, PartialEq)]
struct ChatMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl ChatMessage {
    fn text(role: &'static str, text: String) -> Self {
        Self {
            role,
            content: Some(text),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default)]
    kind: String,
    function: WireFunction,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl From<WireUsage> for TokenUsage {
    fn from(usage: WireUsage) -> Self {
        Self {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens.max(usage.prompt_tokens + usage.completion_tokens),
        }
    }
}

#[derive(Deserialize)]
struct StreamEvent {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<StreamToolCall>,
}

#[derive(Deserialize)]
struct StreamToolCall {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunction>,
}

#[derive(Deserialize)]
struct StreamFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

pub(crate) fn finish_reason(reason: &str) -> FinishReason {
    match reason {
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolUse,
        "content_filter" => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

/// Auth headers shared with the responses variant
pub(crate) fn openai_auth(spec: HttpRequestSpec, channel: &ChannelConfig) -> HttpRequestSpec {
    with_auth(spec, channel, API_KEY_HEADER)
}

pub(crate) fn parse_model_list(raw: &Value) -> Vec<ModelInfo> {
    match serde_json::from_value::<ModelList>(raw.clone()) {
        Ok(list) => list
            .data
            .into_iter()
            .map(|m| ModelInfo {
                name: m.id.clone(),
                id: m.id,
                context_length: None,
            })
            .collect(),
        Err(e) => {
            debug!(error = %e, "unreadable model list");
            Vec::new()
        }
    }
}

fn to_messages(request: &GenerateRequest) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    if let Some(system) = request.system_instruction.as_deref().filter(|s| !s.is_empty()) {
        messages.push(ChatMessage::text("system", system.to_string()));
    }
    for content in request.prepared_history() {
        push_content(&mut messages, &content);
    }
    messages
}

fn push_content(messages: &mut Vec<ChatMessage>, content: &Content) {
    match content.role {
        Role::User => {
            let text = content.text();
            if !text.is_empty() {
                messages.push(ChatMessage::text("user", text));
            }
        }
        Role::Assistant => {
            let text = content.text();
            let tool_calls: Vec<WireToolCall> = content
                .function_calls()
                .map(|(id, name, args)| WireToolCall {
                    id: id.to_string(),
                    kind: "function".into(),
                    function: WireFunction {
                        name: name.to_string(),
                        arguments: args_to_string(args),
                    },
                })
                .collect();
            if text.is_empty() && tool_calls.is_empty() {
                return;
            }
            messages.push(ChatMessage {
                role: "assistant",
                content: (!text.is_empty()).then_some(text),
                tool_calls,
                tool_call_id: None,
            });
        }
        Role::Tool => {
            for part in &content.parts {
                if let Part::FunctionResponse { id, response, .. } = part {
                    messages.push(ChatMessage {
                        role: "tool",
                        content: Some(response_to_string(response)),
                        tool_calls: Vec::new(),
                        tool_call_id: Some(id.clone()),
                    });
                }
            }
        }
    }
}

/// Adapter for `/chat/completions` compatible backends
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenAiAdapter;

impl ProtocolAdapter for OpenAiAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::OpenAi
    }

    fn build_request(&self, request: &GenerateRequest, channel: &ChannelConfig) -> Result<HttpRequestSpec> {
        let mut options = Map::new();
        write_options(&mut options, &channel.options, "temperature", "max_tokens", "top_p");

        let body = ChatRequest {
            model: channel.model.clone(),
            messages: to_messages(request),
            tools: (!request.tools.is_empty()).then(|| self.convert_tools(&request.tools)),
            stream: request.stream,
            stream_options: request.stream.then_some(StreamOptions { include_usage: true }),
            options,
        };
        let url = format!("{}/chat/completions", normalize_base_url(&channel.base_url));
        let mut spec = HttpRequestSpec::post(url, serde_json::to_value(body)?).streaming(request.stream);
        spec.timeout_secs = Some(channel.timeout_secs);
        Ok(openai_auth(spec, channel))
    }

    fn parse_response(&self, raw: &Value) -> Result<GenerateResponse> {
        let response: ChatResponse =
            serde_json::from_value(raw.clone()).map_err(|e| AgentError::MalformedResponse(e.to_string()))?;
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::MalformedResponse("response has no choices".into()))?;

        let mut parts = Vec::new();
        if let Some(text) = choice.message.content.filter(|t| !t.is_empty()) {
            parts.push(Part::text(text));
        }
        for call in choice.message.tool_calls {
            let args = args_from_str(&call.function.arguments).ok_or_else(|| {
                AgentError::MalformedResponse(format!("invalid arguments for tool call {}", call.id))
            })?;
            parts.push(Part::FunctionCall {
                id: call.id,
                name: call.function.name,
                args,
            });
        }

        Ok(GenerateResponse::assistant(
            parts,
            response.usage.map(TokenUsage::from),
            response.model,
            choice.finish_reason.as_deref().map(finish_reason),
        ))
    }

    fn parse_stream_chunk(&self, raw: &Value) -> Vec<ChunkDelta> {
        let event: StreamEvent = match serde_json::from_value(raw.clone()) {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "ignoring unrecognized chat completion chunk");
                return Vec::new();
            }
        };

        let mut deltas = Vec::new();
        if let Some(model) = event.model.filter(|m| !m.is_empty()) {
            deltas.push(ChunkDelta::ModelVersion(model));
        }
        for choice in event.choices {
            if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                deltas.push(ChunkDelta::Text(text));
            }
            for call in choice.delta.tool_calls {
                let (name, arguments) = match call.function {
                    Some(f) => (f.name, f.arguments),
                    None => (None, None),
                };
                if call.id.is_some() || name.is_some() {
                    deltas.push(ChunkDelta::ToolCallBegin {
                        index: call.index,
                        id: call.id,
                        name,
                    });
                }
                if let Some(fragment) = arguments.filter(|a| !a.is_empty()) {
                    deltas.push(ChunkDelta::ToolCallArgs {
                        index: call.index,
                        fragment,
                    });
                }
            }
            if let Some(reason) = choice.finish_reason {
                deltas.push(ChunkDelta::Finish(finish_reason(&reason)));
            }
        }
        if let Some(usage) = event.usage {
            deltas.push(ChunkDelta::Usage(usage.into()));
        }
        deltas
    }

    fn convert_tools(&self, tools: &[ToolDeclaration]) -> Value {
        Value::Array(
            tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        }
                    })
                })
                .collect(),
        )
    }

    fn models_request(&self, channel: &ChannelConfig) -> HttpRequestSpec {
        let url = format!("{}/models", normalize_base_url(&channel.base_url));
        openai_auth(HttpRequestSpec::get(url), channel)
    }

    fn parse_models(&self, raw: &Value) -> Vec<ModelInfo> {
        parse_model_list(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::provider::option_keys;
    use agent_core::session::ConversationId;

    fn channel() -> ChannelConfig {
        ChannelConfig::new("o", ChannelType::OpenAi, "sk-test", "gpt-4o").with_base_url("https://api.example.com/v1/")
    }

    #[test]
    fn test_build_request_maps_history() {
        let history = vec![
            Content::user("list files"),
            Content::new(Role::Assistant).with_function_call("call_1", "list_dir", json!({"path": "."})),
            Content::tool_responses(vec![Part::FunctionResponse {
                id: "call_1".into(),
                name: "list_dir".into(),
                response: json!({"files": ["a.rs"]}),
                is_error: false,
            }]),
        ];
        let mut request = GenerateRequest::new(ConversationId::new(), history);
        request.system_instruction = Some("be brief".into());
        request.stream = false;

        let spec = OpenAiAdapter.build_request(&request, &channel()).unwrap();
        let body = spec.body.clone().unwrap();

        assert_eq!(spec.url, "https://api.example.com/v1/chat/completions");
        assert_eq!(spec.header_value("authorization"), Some("Bearer sk-test"));
        assert_eq!(body["messages"][0], json!({"role": "system", "content": "be brief"}));
        assert_eq!(body["messages"][2]["tool_calls"][0]["function"]["arguments"], "{\"path\":\".\"}");
        assert!(body["messages"][2].get("content").is_none());
        assert_eq!(body["messages"][3]["role"], "tool");
        assert_eq!(body["messages"][3]["tool_call_id"], "call_1");
        assert!(body.get("stream_options").is_none());
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn test_build_request_streaming_with_options_and_key_header() {
        let mut channel = channel().with_bearer_auth(false);
        channel.options.temperature = Some(0.25);
        channel.options = channel.options.enable(option_keys::TEMPERATURE);
        let request = GenerateRequest::new(ConversationId::new(), vec![Content::user("hi")]);

        let spec = OpenAiAdapter.build_request(&request, &channel).unwrap();
        let body = spec.body.clone().unwrap();

        assert!(spec.stream);
        assert_eq!(spec.header_value("api-key"), Some("sk-test"));
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["temperature"], 0.25);
    }

    #[test]
    fn test_parse_response_with_tool_call() {
        let raw = json!({
            "model": "gpt-4o-2024-08-06",
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{"id": "call_9", "type": "function", "function": {"name": "grep", "arguments": "{\"q\":\"fn\"}"}}]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        });

        let response = OpenAiAdapter.parse_response(&raw).unwrap();
        let calls: Vec<_> = response.content.function_calls().collect();

        assert_eq!(calls, vec![("call_9", "grep", &json!({"q": "fn"}))]);
        assert_eq!(response.finish_reason, Some(FinishReason::ToolUse));
        assert_eq!(response.usage, Some(TokenUsage::new(10, 5)));
        assert_eq!(response.content.model_version(), Some("gpt-4o-2024-08-06"));
    }

    #[test]
    fn test_parse_response_without_choices_is_malformed() {
        let err = OpenAiAdapter.parse_response(&json!({"choices": []})).unwrap_err();
        assert!(matches!(err, AgentError::MalformedResponse(_)));
    }

    #[test]
    fn test_stream_chunks_map_to_deltas() {
        let begin = json!({"model": "gpt-4o", "choices": [{"index": 0, "delta": {"tool_calls": [
            {"index": 0, "id": "call_1", "type": "function", "function": {"name": "read_file", "arguments": ""}}
        ]}}]});
        let args = json!({"choices": [{"index": 0, "delta": {"tool_calls": [
            {"index": 0, "function": {"arguments": "{\"path\":"}}
        ]}}]});
        let finish = json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]});
        let usage = json!({"choices": [], "usage": {"prompt_tokens": 4, "completion_tokens": 2, "total_tokens": 6}});

        assert_eq!(
            OpenAiAdapter.parse_stream_chunk(&begin),
            vec![
                ChunkDelta::ModelVersion("gpt-4o".into()),
                ChunkDelta::ToolCallBegin { index: 0, id: Some("call_1".into()), name: Some("read_file".into()) },
            ]
        );
        assert_eq!(
            OpenAiAdapter.parse_stream_chunk(&args),
            vec![ChunkDelta::ToolCallArgs { index: 0, fragment: "{\"path\":".into() }]
        );
        assert_eq!(OpenAiAdapter.parse_stream_chunk(&finish), vec![ChunkDelta::Finish(FinishReason::ToolUse)]);
        assert_eq!(OpenAiAdapter.parse_stream_chunk(&usage), vec![ChunkDelta::Usage(TokenUsage::new(4, 2))]);
    }

    #[test]
    fn test_unknown_chunk_is_dropped() {
        assert!(OpenAiAdapter.parse_stream_chunk(&json!({"choices": "nope"})).is_empty());
        assert!(OpenAiAdapter.parse_stream_chunk(&json!({"object": "ping"})).is_empty());
    }

    #[test]
    fn test_parse_models_and_validate() {
        let models = OpenAiAdapter.parse_models(&json!({"data": [{"id": "gpt-4o"}, {"id": "o3"}]}));
        assert_eq!(models.len(), 2);
        assert_eq!(models[1].id, "o3");

        assert!(OpenAiAdapter.validate_config(&channel()));
        assert!(!OpenAiAdapter.validate_config(&ChannelConfig::new("o", ChannelType::OpenAi, " ", "m")));
        assert!(!OpenAiAdapter.validate_config(&ChannelConfig::new("a", ChannelType::Anthropic, "k", "m")));
    }
}

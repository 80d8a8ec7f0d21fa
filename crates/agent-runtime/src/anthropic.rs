//! Anthropic Messages Adapter
//!
//! `POST {base}/messages` with `anthropic-version: 2023-06-01`. Tool results go
//! back as `tool_result` blocks inside a user turn, so consecutive same-role
//! turns are merged before sending. `max_tokens` is mandatory on this API.

use agent_core::config::{ChannelConfig, ChannelType};
use agent_core::error::{AgentError, Result};
use agent_core::message::{Part, Role};
use agent_core::provider::{
    ChunkDelta, FinishReason, GenerateRequest, GenerateResponse, HttpRequestSpec, ModelInfo, ProtocolAdapter,
    TokenUsage,
};
use agent_core::tool::ToolDeclaration;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::common::{normalize_base_url, response_to_string, with_auth, write_options};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Used when the channel does not enable its own `maxTokens`
pub const DEFAULT_MAX_TOKENS: u32 = 8192;

#[derive(Serialize)]
struct MessagesRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Value>,
    stream: bool,
    #[serde(flatten)]
    options: Map<String, Value>,
}

#[derive(Serialize, Debug)]
struct WireMessage {
    role: &'static str,
    content: Vec<RequestBlock>,
}

#[derive(Serialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RequestBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug, Default)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: MessageStart,
    },
    ContentBlockStart {
        index: u32,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        #[serde(default)]
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<WireUsage>,
    },
    Error {
        error: ErrorBody,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug)]
struct MessageStart {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug, Default)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
}

fn finish_reason(reason: &str) -> FinishReason {
    match reason {
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolUse,
        "refusal" => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

fn blocks_for(role: Role, parts: Vec<Part>) -> Vec<RequestBlock> {
    parts
        .into_iter()
        .filter_map(|part| match part {
            Part::Text { text } if !text.is_empty() => Some(RequestBlock::Text { text }),
            Part::Text { .. } => None,
            Part::FunctionCall { id, name, args } if role == Role::Assistant => Some(RequestBlock::ToolUse {
                id,
                name,
                input: if args.is_object() { args } else { json!({}) },
            }),
            Part::FunctionCall { .. } => None,
            Part::FunctionResponse { id, response, is_error, .. } => Some(RequestBlock::ToolResult {
                tool_use_id: id,
                is_error,
                content: response_to_string(&response),
            }),
        })
        .collect()
}

/// History as alternating user/assistant turns
fn to_messages(request: &GenerateRequest) -> Vec<WireMessage> {
    let mut messages: Vec<WireMessage> = Vec::new();
    for content in request.prepared_history() {
        let role = match content.role {
            Role::Assistant => "assistant",
            Role::User | Role::Tool => "user",
        };
        let blocks = blocks_for(content.role, content.parts);
        if blocks.is_empty() {
            continue;
        }
        match messages.last_mut() {
            Some(last) if last.role == role => last.content.extend(blocks),
            _ => messages.push(WireMessage { role, content: blocks }),
        }
    }
    messages
}

fn anthropic_auth(spec: HttpRequestSpec, channel: &ChannelConfig) -> HttpRequestSpec {
    with_auth(spec, channel, "x-api-key").header("anthropic-version", ANTHROPIC_VERSION)
}

/// Adapter for the Anthropic Messages API
#[derive(Clone, Copy, Debug, Default)]
pub struct AnthropicAdapter;

impl ProtocolAdapter for AnthropicAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Anthropic
    }

    fn build_request(&self, request: &GenerateRequest, channel: &ChannelConfig) -> Result<HttpRequestSpec> {
        let mut options = Map::new();
        write_options(&mut options, &channel.options, "temperature", "max_tokens", "top_p");
        options
            .entry("max_tokens")
            .or_insert_with(|| Value::from(DEFAULT_MAX_TOKENS));

        let body = MessagesRequest {
            model: channel.model.clone(),
            messages: to_messages(request),
            system: request.system_instruction.clone().filter(|s| !s.is_empty()),
            tools: (!request.tools.is_empty()).then(|| self.convert_tools(&request.tools)),
            stream: request.stream,
            options,
        };
        let url = format!("{}/messages", normalize_base_url(&channel.base_url));
        let mut spec = HttpRequestSpec::post(url, serde_json::to_value(body)?).streaming(request.stream);
        spec.timeout_secs = Some(channel.timeout_secs);
        Ok(anthropic_auth(spec, channel))
    }

    fn parse_response(&self, raw: &Value) -> Result<GenerateResponse> {
        let response: MessagesResponse =
            serde_json::from_value(raw.clone()).map_err(|e| AgentError::MalformedResponse(e.to_string()))?;

        let mut parts: Vec<Part> = Vec::new();
        for block in response.content {
            match block {
                ContentBlock::Text { text } if !text.is_empty() => match parts.last_mut() {
                    Some(Part::Text { text: active }) => active.push_str(&text),
                    _ => parts.push(Part::text(text)),
                },
                ContentBlock::ToolUse { id, name, input } => parts.push(Part::FunctionCall {
                    id,
                    name,
                    args: if input.is_null() { json!({}) } else { input },
                }),
                _ => {}
            }
        }

        Ok(GenerateResponse::assistant(
            parts,
            response
                .usage
                .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens)),
            response.model,
            response.stop_reason.as_deref().map(finish_reason),
        ))
    }

    fn parse_stream_chunk(&self, raw: &Value) -> Vec<ChunkDelta> {
        let event: StreamEvent = match serde_json::from_value(raw.clone()) {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "ignoring unrecognized messages event");
                return Vec::new();
            }
        };

        match event {
            StreamEvent::MessageStart { message } => {
                let mut deltas = Vec::new();
                if let Some(model) = message.model {
                    deltas.push(ChunkDelta::ModelVersion(model));
                }
                if let Some(usage) = message.usage {
                    deltas.push(ChunkDelta::Usage(TokenUsage::new(usage.input_tokens, usage.output_tokens)));
                }
                deltas
            }
            StreamEvent::ContentBlockStart { index, content_block } => match content_block {
                ContentBlock::ToolUse { id, name, .. } => vec![ChunkDelta::ToolCallBegin {
                    index,
                    id: Some(id),
                    name: Some(name),
                }],
                ContentBlock::Text { text } if !text.is_empty() => vec![ChunkDelta::Text(text)],
                _ => Vec::new(),
            },
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } if !text.is_empty() => vec![ChunkDelta::Text(text)],
                BlockDelta::InputJsonDelta { partial_json } if !partial_json.is_empty() => {
                    vec![ChunkDelta::ToolCallArgs {
                        index,
                        fragment: partial_json,
                    }]
                }
                _ => Vec::new(),
            },
            StreamEvent::ContentBlockStop { index } => vec![ChunkDelta::ToolCallEnd { index }],
            StreamEvent::MessageDelta { delta, usage } => {
                let mut deltas = Vec::new();
                if let Some(usage) = usage {
                    deltas.push(ChunkDelta::Usage(TokenUsage::new(usage.input_tokens, usage.output_tokens)));
                }
                if let Some(reason) = delta.stop_reason {
                    deltas.push(ChunkDelta::Finish(finish_reason(&reason)));
                }
                deltas
            }
            StreamEvent::Error { error } => vec![ChunkDelta::Error(error.message)],
            StreamEvent::Unknown => Vec::new(),
        }
    }

    fn convert_tools(&self, tools: &[ToolDeclaration]) -> Value {
        Value::Array(
            tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "input_schema": tool.parameters,
                    })
                })
                .collect(),
        )
    }

    fn models_request(&self, channel: &ChannelConfig) -> HttpRequestSpec {
        let url = format!("{}/models", normalize_base_url(&channel.base_url));
        anthropic_auth(HttpRequestSpec::get(url), channel)
    }

    fn parse_models(&self, raw: &Value) -> Vec<ModelInfo> {
        match serde_json::from_value::<ModelList>(raw.clone()) {
            Ok(list) => list
                .data
                .into_iter()
                .map(|m| ModelInfo {
                    name: m.display_name.unwrap_or_else(|| m.id.clone()),
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::message::Content;
    use agent_core::session::ConversationId;

    fn channel() -> ChannelConfig {
        ChannelConfig::new("c", ChannelType::Anthropic, "sk-ant", "claude-sonnet-4")
    }

    #[test]
    fn test_build_request_headers_and_defaults() {
        let request = GenerateRequest::new(ConversationId::new(), vec![Content::user("hello")]);
        let spec = AnthropicAdapter.build_request(&request, &channel()).unwrap();
        let body = spec.body.clone().unwrap();

        assert_eq!(spec.url, "https://api.anthropic.com/v1/messages");
        assert_eq!(spec.header_value("x-api-key"), Some("sk-ant"));
        assert_eq!(spec.header_value("anthropic-version"), Some(ANTHROPIC_VERSION));
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["content"][0], json!({"type": "text", "text": "hello"}));
    }

    #[test]
    fn test_bearer_flag_keeps_version_header() {
        let channel = channel().with_bearer_auth(true);
        let spec = AnthropicAdapter.models_request(&channel);

        assert_eq!(spec.header_value("authorization"), Some("Bearer sk-ant"));
        assert_eq!(spec.header_value("x-api-key"), None);
        assert_eq!(spec.header_value("anthropic-version"), Some(ANTHROPIC_VERSION));
    }

    #[test]
    fn test_tool_results_merge_into_user_turn() {
        let history = vec![
            Content::user("read both"),
            Content::new(Role::Assistant)
                .with_function_call("tu_1", "read_file", json!({"path": "a"}))
                .with_function_call("tu_2", "read_file", json!({"path": "b"})),
            Content::tool_responses(vec![
                // a successful payload that happens to carry an "error" key
                Part::FunctionResponse {
                    id: "tu_1".into(),
                    name: "read_file".into(),
                    response: json!({"text": "A", "error": null}),
                    is_error: false,
                },
                Part::FunctionResponse {
                    id: "tu_2".into(),
                    name: "read_file".into(),
                    response: json!({"error": "missing"}),
                    is_error: true,
                },
            ]),
            Content::user("and summarize"),
        ];
        let request = GenerateRequest::new(ConversationId::new(), history);
        let body = AnthropicAdapter.build_request(&request, &channel()).unwrap().body.unwrap();
        let messages = body["messages"].as_array().unwrap();

        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["content"][1]["type"], "tool_use");
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(messages[2]["content"][0]["tool_use_id"], "tu_1");
        assert!(messages[2]["content"][0].get("is_error").is_none());
        assert_eq!(messages[2]["content"][1]["is_error"], true);
        assert_eq!(messages[2]["content"][2]["text"], "and summarize");
    }

    #[test]
    fn test_parse_response() {
        let raw = json!({
            "model": "claude-sonnet-4-20250514",
            "content": [
                {"type": "thinking", "thinking": "..."},
                {"type": "text", "text": "Let me check."},
                {"type": "tool_use", "id": "tu_1", "name": "ls", "input": {"path": "."}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 20, "output_tokens": 8}
        });

        let response = AnthropicAdapter.parse_response(&raw).unwrap();

        assert_eq!(response.content.text(), "Let me check.");
        assert_eq!(response.content.function_calls().count(), 1);
        assert_eq!(response.finish_reason, Some(FinishReason::ToolUse));
        assert_eq!(response.usage, Some(TokenUsage::new(20, 8)));
    }

    #[test]
    fn test_stream_events() {
        let adapter = AnthropicAdapter;
        let events = [
            json!({"type": "message_start", "message": {"model": "claude-x", "usage": {"input_tokens": 9, "output_tokens": 1}}}),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hi"}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "tu_1", "name": "ls", "input": {}}}),
            json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"p\":1}"}}),
            json!({"type": "content_block_stop", "index": 1}),
            json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 12}}),
            json!({"type": "message_stop"}),
            json!({"type": "ping"}),
        ];
        let deltas: Vec<ChunkDelta> = events.iter().flat_map(|e| adapter.parse_stream_chunk(e)).collect();

        assert_eq!(
            deltas,
            vec![
                ChunkDelta::ModelVersion("claude-x".into()),
                ChunkDelta::Usage(TokenUsage::new(9, 1)),
                ChunkDelta::Text("Hi".into()),
                ChunkDelta::ToolCallEnd { index: 0 },
                ChunkDelta::ToolCallBegin { index: 1, id: Some("tu_1".into()), name: Some("ls".into()) },
                ChunkDelta::ToolCallArgs { index: 1, fragment: "{\"p\":1}".into() },
                ChunkDelta::ToolCallEnd { index: 1 },
                ChunkDelta::Usage(TokenUsage::new(0, 12)),
                ChunkDelta::Finish(FinishReason::ToolUse),
            ]
        );
    }

    #[test]
    fn test_stream_error_event() {
        let event = json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}});
        assert_eq!(AnthropicAdapter.parse_stream_chunk(&event), vec![ChunkDelta::Error("Overloaded".into())]);
    }

    #[test]
    fn test_parse_models_prefers_display_name() {
        let models = AnthropicAdapter.parse_models(&json!({"data": [{"id": "claude-x", "display_name": "Claude X"}]}));
        assert_eq!(models[0].name, "Claude X");
        assert_eq!(models[0].id, "claude-x");
    }
}

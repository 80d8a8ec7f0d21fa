//! OpenAI Responses Adapter
//!
//! `POST {base}/responses`. The system prompt goes into `instructions`;
//! history becomes a flat list of message, `function_call` and
//! `function_call_output` items. Streamed tool arguments are taken whole from
//! `response.output_item.done` instead of stitching `arguments.delta` events.

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

use crate::common::{args_from_str, args_to_string, normalize_base_url, response_to_string, write_options};
use crate::openai::{openai_auth, parse_model_list};

#[derive(Serialize)]
struct ResponsesRequest {
    model: String,
    input: Vec<InputItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Value>,
    stream: bool,
    #[serde(flatten)]
    options: Map<String, Value>,
}

#[derive(Serialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InputItem {
    Message {
        role: &'static str,
        content: String,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

#[derive(Deserialize, Debug, Default)]
struct ResponseObject {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    output: Vec<OutputItem>,
    #[serde(default)]
    usage: Option<ResponsesUsage>,
    #[serde(default)]
    incomplete_details: Option<IncompleteDetails>,
    #[serde(default)]
    error: Option<ResponseError>,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputItem {
    Message {
        #[serde(default)]
        content: Vec<OutputContent>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputContent {
    OutputText {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug)]
struct ResponsesUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl From<ResponsesUsage> for TokenUsage {
    fn from(usage: ResponsesUsage) -> Self {
        Self {
            prompt_tokens: usage.input_tokens,
            completion_tokens: usage.output_tokens,
            total_tokens: usage.total_tokens.max(usage.input_tokens + usage.output_tokens),
        }
    }
}

#[derive(Deserialize, Debug)]
struct IncompleteDetails {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ResponseError {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "response.created")]
    Created { response: ResponseObject },
    #[serde(rename = "response.output_text.delta")]
    TextDelta { delta: String },
    #[serde(rename = "response.output_item.done")]
    ItemDone { output_index: u32, item: OutputItem },
    #[serde(rename = "response.completed", alias = "response.incomplete")]
    Completed { response: ResponseObject },
    #[serde(rename = "response.failed")]
    Failed { response: ResponseObject },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Unknown,
}

/// Base URL with a trailing `/responses` removed
fn responses_base(base_url: &str) -> &str {
    let base = normalize_base_url(base_url);
    base.strip_suffix("/responses").unwrap_or(base)
}

fn finish_reason(response: &ResponseObject) -> FinishReason {
    let reason = response.incomplete_details.as_ref().and_then(|d| d.reason.as_deref());
    match reason {
        Some("max_output_tokens") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        _ if response
            .output
            .iter()
            .any(|item| matches!(item, OutputItem::FunctionCall { .. })) =>
        {
            FinishReason::ToolUse
        }
        _ => FinishReason::Stop,
    }
}

fn to_input(request: &GenerateRequest) -> Vec<InputItem> {
    let mut items = Vec::new();
    for content in request.prepared_history() {
        match content.role {
            Role::User => {
                let text = content.text();
                if !text.is_empty() {
                    items.push(InputItem::Message { role: "user", content: text });
                }
            }
            Role::Assistant => {
                let text = content.text();
                if !text.is_empty() {
                    items.push(InputItem::Message {
                        role: "assistant",
                        content: text,
                    });
                }
                for (id, name, args) in content.function_calls() {
                    items.push(InputItem::FunctionCall {
                        call_id: id.to_string(),
                        name: name.to_string(),
                        arguments: args_to_string(args),
                    });
                }
            }
            Role::Tool => {
                for part in content.parts {
                    if let Part::FunctionResponse { id, response, .. } = part {
                        items.push(InputItem::FunctionCallOutput {
                            call_id: id,
                            output: response_to_string(&response),
                        });
                    }
                }
            }
        }
    }
    items
}

/// Adapter for the `/responses` API
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenAiResponsesAdapter;

impl ProtocolAdapter for OpenAiResponsesAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::OpenAiResponses
    }

    fn build_request(&self, request: &GenerateRequest, channel: &ChannelConfig) -> Result<HttpRequestSpec> {
        let mut options = Map::new();
        write_options(&mut options, &channel.options, "temperature", "max_output_tokens", "top_p");

        let body = ResponsesRequest {
            model: channel.model.clone(),
            input: to_input(request),
            instructions: request.system_instruction.clone().filter(|s| !s.is_empty()),
            tools: (!request.tools.is_empty()).then(|| self.convert_tools(&request.tools)),
            stream: request.stream,
            options,
        };
        let url = format!("{}/responses", responses_base(&channel.base_url));
        let mut spec = HttpRequestSpec::post(url, serde_json::to_value(body)?).streaming(request.stream);
        spec.timeout_secs = Some(channel.timeout_secs);
        Ok(openai_auth(spec, channel))
    }

    fn parse_response(&self, raw: &Value) -> Result<GenerateResponse> {
        let response: ResponseObject =
            serde_json::from_value(raw.clone()).map_err(|e| AgentError::MalformedResponse(e.to_string()))?;
        if let Some(error) = &response.error {
            return Err(AgentError::MalformedResponse(error.message.clone()));
        }

        let finish = finish_reason(&response);
        let mut parts = Vec::new();
        for item in response.output {
            match item {
                OutputItem::Message { content } => {
                    let text: String = content
                        .into_iter()
                        .filter_map(|c| match c {
                            OutputContent::OutputText { text } => Some(text),
                            OutputContent::Other => None,
                        })
                        .collect();
                    if !text.is_empty() {
                        parts.push(Part::text(text));
                    }
                }
                OutputItem::FunctionCall { call_id, name, arguments } => {
                    let args = args_from_str(&arguments).ok_or_else(|| {
                        AgentError::MalformedResponse(format!("invalid arguments for tool call {call_id}"))
                    })?;
                    parts.push(Part::FunctionCall { id: call_id, name, args });
                }
                OutputItem::Other => {}
            }
        }

        Ok(GenerateResponse::assistant(
            parts,
            response.usage.map(TokenUsage::from),
            response.model,
            Some(finish),
        ))
    }

    fn parse_stream_chunk(&self, raw: &Value) -> Vec<ChunkDelta> {
        let event: StreamEvent = match serde_json::from_value(raw.clone()) {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "ignoring unrecognized responses event");
                return Vec::new();
            }
        };

        match event {
            StreamEvent::Created { response } => {
                response.model.map(ChunkDelta::ModelVersion).into_iter().collect()
            }
            StreamEvent::TextDelta { delta } if !delta.is_empty() => vec![ChunkDelta::Text(delta)],
            StreamEvent::ItemDone {
                output_index,
                item: OutputItem::FunctionCall { call_id, name, arguments },
            } => {
                let mut deltas = vec![ChunkDelta::ToolCallBegin {
                    index: output_index,
                    id: Some(call_id),
                    name: Some(name),
                }];
                if !arguments.is_empty() {
                    deltas.push(ChunkDelta::ToolCallArgs {
                        index: output_index,
                        fragment: arguments,
                    });
                }
                deltas.push(ChunkDelta::ToolCallEnd { index: output_index });
                deltas
            }
            StreamEvent::Completed { response } => {
                let finish = finish_reason(&response);
                let mut deltas = Vec::new();
                if let Some(model) = response.model {
                    deltas.push(ChunkDelta::ModelVersion(model));
                }
                if let Some(usage) = response.usage {
                    deltas.push(ChunkDelta::Usage(usage.into()));
                }
                deltas.push(ChunkDelta::Finish(finish));
                deltas
            }
            StreamEvent::Failed { response } => {
                let message = response
                    .error
                    .map(|e| e.message)
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| "response failed".into());
                vec![ChunkDelta::Error(message)]
            }
            StreamEvent::Error { message } => vec![ChunkDelta::Error(message)],
            _ => Vec::new(),
        }
    }

    fn convert_tools(&self, tools: &[ToolDeclaration]) -> Value {
        Value::Array(
            tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    })
                })
                .collect(),
        )
    }

    fn models_request(&self, channel: &ChannelConfig) -> HttpRequestSpec {
        let url = format!("{}/models", responses_base(&channel.base_url));
        openai_auth(HttpRequestSpec::get(url), channel)
    }

    fn parse_models(&self, raw: &Value) -> Vec<ModelInfo> {
        parse_model_list(raw)
    }
}

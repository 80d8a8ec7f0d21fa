//! Gemini Adapter
//!
//! `generateContent` / `streamGenerateContent?alt=sse` on the v1beta API.
//! The assistant role is called `model`, tool results travel as
//! `functionResponse` parts in a user turn, and generation options live under
//! `generationConfig`. Function calls always arrive whole.

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
use uuid::Uuid;

use crate::common::{normalize_base_url, with_auth, write_options};

/// Schema keywords the function-declaration validator rejects
const UNSUPPORTED_SCHEMA_KEYS: &[&str] = &["additionalProperties", "$schema"];

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Value>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    generation_config: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thought: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
}

#[derive(Serialize, Deserialize, Debug)]
struct FunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Serialize, Deserialize, Debug)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    model_version: Option<String>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    total_token_count: u32,
}

impl From<UsageMetadata> for TokenUsage {
    fn from(usage: UsageMetadata) -> Self {
        Self {
            prompt_tokens: usage.prompt_token_count,
            completion_tokens: usage.candidates_token_count,
            total_tokens: usage
                .total_token_count
                .max(usage.prompt_token_count + usage.candidates_token_count),
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelEntry {
    name: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    input_token_limit: Option<u32>,
}

fn finish_reason(reason: &str) -> FinishReason {
    match reason {
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" | "IMAGE_SAFETY" => {
            FinishReason::ContentFilter
        }
        "MALFORMED_FUNCTION_CALL" | "OTHER" => FinishReason::Error,
        _ => FinishReason::Stop,
    }
}

fn model_path(model: &str) -> &str {
    model.strip_prefix("models/").unwrap_or(model)
}

/// Remove keywords Gemini rejects, at every depth
fn sanitize_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !UNSUPPORTED_SCHEMA_KEYS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), sanitize_schema(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_schema).collect()),
        other => other.clone(),
    }
}

fn to_part(part: Part) -> Option<GeminiPart> {
    match part {
        Part::Text { text } if text.is_empty() => None,
        Part::Text { text } => Some(GeminiPart {
            text: Some(text),
            ..Default::default()
        }),
        Part::FunctionCall { name, args, .. } => Some(GeminiPart {
            function_call: Some(FunctionCall {
                id: None,
                name,
                args: if args.is_object() { args } else { json!({}) },
            }),
            ..Default::default()
        }),
        Part::FunctionResponse { name, response, .. } => Some(GeminiPart {
            function_response: Some(FunctionResponse {
                name,
                response: if response.is_object() {
                    response
                } else {
                    json!({ "result": response })
                },
            }),
            ..Default::default()
        }),
    }
}

fn to_contents(request: &GenerateRequest) -> Vec<GeminiContent> {
    let mut contents: Vec<GeminiContent> = Vec::new();
    for content in request.prepared_history() {
        let role = match content.role {
            Role::Assistant => "model",
            Role::User | Role::Tool => "user",
        };
        let parts: Vec<GeminiPart> = content.parts.into_iter().filter_map(to_part).collect();
        if parts.is_empty() {
            continue;
        }
        match contents.last_mut() {
            Some(last) if last.role.as_deref() == Some(role) => last.parts.extend(parts),
            _ => contents.push(GeminiContent {
                role: Some(role.into()),
                parts,
            }),
        }
    }
    contents
}

/// Unified parts from one candidate, skipping thought summaries
fn candidate_parts(candidate: Candidate) -> (Vec<Part>, Vec<(Option<String>, String, Value)>) {
    let mut parts = Vec::new();
    let mut calls = Vec::new();
    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        if part.thought == Some(true) {
            continue;
        }
        if let Some(text) = part.text.filter(|t| !t.is_empty()) {
            match parts.last_mut() {
                Some(Part::Text { text: active }) => active.push_str(&text),
                _ => parts.push(Part::text(text)),
            }
        }
        if let Some(call) = part.function_call {
            let args = if call.args.is_null() { json!({}) } else { call.args };
            calls.push((call.id, call.name, args));
        }
    }
    (parts, calls)
}

/// Adapter for the Gemini `generateContent` API
#[derive(Clone, Copy, Debug, Default)]
pub struct GeminiAdapter;

impl ProtocolAdapter for GeminiAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Gemini
    }

    fn build_request(&self, request: &GenerateRequest, channel: &ChannelConfig) -> Result<HttpRequestSpec> {
        let mut generation_config = Map::new();
        write_options(&mut generation_config, &channel.options, "temperature", "maxOutputTokens", "topP");

        let body = GeminiRequest {
            contents: to_contents(request),
            system_instruction: request
                .system_instruction
                .as_deref()
                .filter(|s| !s.is_empty())
                .map(|s| GeminiContent {
                    role: None,
                    parts: vec![GeminiPart {
                        text: Some(s.to_string()),
                        ..Default::default()
                    }],
                }),
            tools: (!request.tools.is_empty()).then(|| self.convert_tools(&request.tools)),
            generation_config,
        };

        let base = normalize_base_url(&channel.base_url);
        let model = model_path(&channel.model);
        let url = if request.stream {
            format!("{base}/models/{model}:streamGenerateContent?alt=sse")
        } else {
            format!("{base}/models/{model}:generateContent")
        };
        let mut spec = HttpRequestSpec::post(url, serde_json::to_value(body)?).streaming(request.stream);
        spec.timeout_secs = Some(channel.timeout_secs);
        Ok(with_auth(spec, channel, "x-goog-api-key"))
    }

    fn parse_response(&self, raw: &Value) -> Result<GenerateResponse> {
        let response: GeminiResponse =
            serde_json::from_value(raw.clone()).map_err(|e| AgentError::MalformedResponse(e.to_string()))?;

        let Some(candidate) = response.candidates.into_iter().next() else {
            let reason = response
                .prompt_feedback
                .and_then(|f| f.block_reason)
                .unwrap_or_else(|| "no candidates".into());
            return Err(AgentError::MalformedResponse(format!("response has no candidates: {reason}")));
        };

        let finish = candidate.finish_reason.as_deref().map(finish_reason);
        let (mut parts, calls) = candidate_parts(candidate);
        for (id, name, args) in calls {
            parts.push(Part::FunctionCall {
                id: id.unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple())),
                name,
                args,
            });
        }

        Ok(GenerateResponse::assistant(
            parts,
            response.usage_metadata.map(TokenUsage::from),
            response.model_version,
            finish,
        ))
    }

    fn parse_stream_chunk(&self, raw: &Value) -> Vec<ChunkDelta> {
        let response: GeminiResponse = match serde_json::from_value(raw.clone()) {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, "ignoring unrecognized gemini chunk");
                return Vec::new();
            }
        };

        let mut deltas = Vec::new();
        if let Some(version) = response.model_version {
            deltas.push(ChunkDelta::ModelVersion(version));
        }
        if response.candidates.is_empty() {
            if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
                deltas.push(ChunkDelta::Error(format!("prompt blocked: {reason}")));
            }
        }
        for candidate in response.candidates.into_iter().take(1) {
            let finish = candidate.finish_reason.as_deref().map(finish_reason);
            let (parts, calls) = candidate_parts(candidate);
            deltas.extend(parts.into_iter().filter_map(|p| match p {
                Part::Text { text } => Some(ChunkDelta::Text(text)),
                _ => None,
            }));
            deltas.extend(
                calls
                    .into_iter()
                    .map(|(id, name, args)| ChunkDelta::ToolCall { id, name, args }),
            );
            if let Some(reason) = finish {
                deltas.push(ChunkDelta::Finish(reason));
            }
        }
        if let Some(usage) = response.usage_metadata {
            deltas.push(ChunkDelta::Usage(usage.into()));
        }
        deltas
    }

    fn convert_tools(&self, tools: &[ToolDeclaration]) -> Value {
        let declarations: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": sanitize_schema(&tool.parameters),
                })
            })
            .collect();
        json!([{ "functionDeclarations": declarations }])
    }

    fn models_request(&self, channel: &ChannelConfig) -> HttpRequestSpec {
        let url = format!("{}/models", normalize_base_url(&channel.base_url));
        with_auth(HttpRequestSpec::get(url), channel, "x-goog-api-key")
    }

    fn parse_models(&self, raw: &Value) -> Vec<ModelInfo> {
        match serde_json::from_value::<ModelList>(raw.clone()) {
            Ok(list) => list
                .models
                .into_iter()
                .map(|m| {
                    let id = model_path(&m.name).to_string();
                    ModelInfo {
                        name: m.display_name.unwrap_or_else(|| id.clone()),
                        id,
                        context_length: m.input_token_limit,
                    }
                })
                .collect(),
            Err(e) => {
                debug!(error = %e, "unreadable model list");
                Vec::new()
            }
        }
    }
}

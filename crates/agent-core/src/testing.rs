//! Scripted fakes shared by the loop and sub-agent tests.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::{ChannelConfig, ChannelType, StaticSettings};
use crate::error::{AgentError, Result};
use crate::provider::{
    AdapterRegistry, ChunkDelta, FinishReason, GenerateRequest, GenerateResponse, HttpRequestSpec, ModelInfo,
    ProtocolAdapter, RawEventStream, Transport,
};
use crate::tool::{Tool, ToolContext, ToolDeclaration};

/// Adapter whose raw events are `{"text"}`, `{"call"}`, `{"model"}` or `{"finish"}`
pub struct ScriptAdapter;

impl ProtocolAdapter for ScriptAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::OpenAi
    }

    fn build_request(&self, request: &GenerateRequest, channel: &ChannelConfig) -> Result<HttpRequestSpec> {
        Ok(HttpRequestSpec::post(
            format!("{}/script", channel.base_url),
            json!({ "model": channel.model, "turns": request.history.len() }),
        )
        .streaming(request.stream))
    }

    fn parse_response(&self, _raw: &Value) -> Result<GenerateResponse> {
        Err(AgentError::MalformedResponse("script adapter only streams".into()))
    }

    fn parse_stream_chunk(&self, raw: &Value) -> Vec<ChunkDelta> {
        if let Some(text) = raw.get("text").and_then(Value::as_str) {
            return vec![ChunkDelta::Text(text.to_string())];
        }
        if let Some(call) = raw.get("call") {
            return vec![ChunkDelta::ToolCall {
                id: call["id"].as_str().map(str::to_string),
                name: call["name"].as_str().unwrap_or_default().to_string(),
                args: call["args"].clone(),
            }];
        }
        if let Some(model) = raw.get("model").and_then(Value::as_str) {
            return vec![ChunkDelta::ModelVersion(model.to_string())];
        }
        if raw.get("finish").is_some() {
            return vec![ChunkDelta::Finish(FinishReason::Stop)];
        }
        Vec::new()
    }

    fn convert_tools(&self, tools: &[ToolDeclaration]) -> Value {
        json!(tools.iter().map(|t| t.name.clone()).collect::<Vec<_>>())
    }

    fn models_request(&self, channel: &ChannelConfig) -> HttpRequestSpec {
        HttpRequestSpec::get(format!("{}/models", channel.base_url))
    }

    fn parse_models(&self, _raw: &Value) -> Vec<ModelInfo> {
        Vec::new()
    }
}

pub fn text(t: &str) -> Value {
    json!({ "text": t })
}

pub fn call(id: &str, name: &str, args: Value) -> Value {
    json!({ "call": { "id": id, "name": name, "args": args } })
}

pub fn model(version: &str) -> Value {
    json!({ "model": version })
}

pub fn finish() -> Value {
    json!({ "finish": true })
}

/// Marker: the stream stays open forever after this point
pub fn hang() -> Value {
    json!({ "hang": true })
}

/// Plays one script per streaming request
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Vec<Value>>>,
    fallback: Option<Vec<Value>>,
    pub calls: AtomicUsize,
    pub requests: Mutex<Vec<HttpRequestSpec>>,
}

impl ScriptedTransport {
    pub fn new(scripts: Vec<Vec<Value>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            fallback: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Replays the same script for every request
    pub fn endless(script: Vec<Value>) -> Self {
        Self {
            fallback: Some(script),
            ..Self::new(Vec::new())
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, _request: HttpRequestSpec) -> Result<Value> {
        Err(AgentError::Transport("scripted transport only streams".into()))
    }

    async fn stream(&self, request: HttpRequestSpec) -> Result<RawEventStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| AgentError::Transport("script exhausted".into()))?;

        let hangs = script.iter().any(|e| e.get("hang").is_some());
        let events: Vec<Result<Value>> = script
            .into_iter()
            .take_while(|e| e.get("hang").is_none())
            .map(Ok)
            .collect();
        let stream = futures::stream::iter(events);
        if hangs {
            Ok(Box::pin(stream.chain(futures::stream::pending())))
        } else {
            Ok(Box::pin(stream))
        }
    }
}

pub fn script_adapters() -> AdapterRegistry {
    let mut adapters = AdapterRegistry::new();
    adapters.register(ScriptAdapter);
    adapters
}

pub fn script_channel() -> ChannelConfig {
    ChannelConfig::new("main", ChannelType::OpenAi, "key", "script-model").with_base_url("http://script")
}

pub fn script_settings() -> StaticSettings {
    StaticSettings::new(vec![
        script_channel(),
        ChannelConfig::new("helper", ChannelType::OpenAi, "key", "helper-model").with_base_url("http://helper"),
    ])
    .with_default_channel("main")
}

/// Counts invocations and echoes its arguments
pub struct CountingTool {
    name: String,
    hits: Arc<AtomicUsize>,
}

impl CountingTool {
    pub fn new(name: &str) -> (Self, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        (
            Self {
                name: name.to_string(),
                hits: hits.clone(),
            },
            hits,
        )
    }
}

#[async_trait]
impl Tool for CountingTool {
    fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration::new(self.name.clone(), "Counts calls", json!({ "type": "object" }))
    }

    async fn execute(&self, args: &Value, _ctx: &ToolContext) -> Result<Value> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "echo": args }))
    }
}

/// Runs until its call is cancelled
pub struct BlockingTool;

#[async_trait]
impl Tool for BlockingTool {
    fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration::new("slow", "Never finishes on its own", json!({ "type": "object" }))
    }

    async fn execute(&self, _args: &Value, ctx: &ToolContext) -> Result<Value> {
        ctx.cancel.cancelled().await;
        Err(AgentError::Cancelled)
    }
}

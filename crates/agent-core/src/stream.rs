//! Stream Accumulation
//!
//! [`StreamAccumulator`] folds backend-agnostic [`ChunkDelta`]s into an
//! assistant [`Content`] plus the tool calls it requested, and emits the
//! caller-facing [`StreamChunk`] events. One accumulator lives for a whole
//! user turn (possibly several model calls) and emits exactly one terminal
//! event: `Complete`, `Cancelled` or `Error`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use uuid::Uuid;

use crate::message::{Content, ContentMetadata, Part, Role};
use crate::provider::{ChunkDelta, FinishReason, TokenUsage};
use crate::session::{Checkpoint, ConversationId};
use crate::tool::{ToolCall, ToolCallStatus, ToolOutcome};

/// Event payload of a [`StreamChunk`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StreamEvent {
    /// Text delta
    Chunk { delta: String },
    /// Tool calls about to be dispatched
    ToolsExecuting { names: Vec<String> },
    ToolStatus {
        id: String,
        name: String,
        status: ToolCallStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    AwaitingConfirmation { pending: Vec<ToolCall> },
    /// Assistant content of a finished tool-calling iteration
    ToolIteration { iteration: u32, content: Content },
    Complete {
        content: Content,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
    },
    Checkpoints { checkpoints: Vec<Checkpoint> },
    Cancelled,
    Error { message: String },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::Complete { .. } | StreamEvent::Cancelled | StreamEvent::Error { .. }
        )
    }
}

/// Caller-facing event, tagged with its conversation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChunk {
    pub conversation_id: ConversationId,
    #[serde(flatten)]
    pub event: StreamEvent,
}

impl StreamChunk {
    pub fn new(conversation_id: ConversationId, event: StreamEvent) -> Self {
        Self {
            conversation_id,
            event,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.event.is_terminal()
    }
}

/// Accumulator lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccumulatorState {
    Idle,
    Streaming,
    AwaitingApproval,
    Completed,
    Cancelled,
    Errored,
}

impl AccumulatorState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AccumulatorState::Completed | AccumulatorState::Cancelled | AccumulatorState::Errored
        )
    }
}

/// Fragments of a streamed tool call
#[derive(Debug, Default)]
struct CallBuffer {
    id: Option<String>,
    name: Option<String>,
    args: String,
}

/// Folds deltas into content and tool calls for one user turn
#[derive(Debug)]
pub struct StreamAccumulator {
    conversation_id: ConversationId,
    state: AccumulatorState,
    parts: Vec<Part>,
    buffers: BTreeMap<u32, CallBuffer>,
    calls: Vec<ToolCall>,
    call_usage: Option<TokenUsage>,
    total_usage: Option<TokenUsage>,
    model_version: Option<String>,
    finish_reason: Option<FinishReason>,
    error: Option<String>,
}

impl StreamAccumulator {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            state: AccumulatorState::Idle,
            parts: Vec::new(),
            buffers: BTreeMap::new(),
            calls: Vec::new(),
            call_usage: None,
            total_usage: None,
            model_version: None,
            finish_reason: None,
            error: None,
        }
    }

    pub fn state(&self) -> AccumulatorState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Start a model call. Clears the previous call's content and tool calls.
    pub fn begin(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.state = AccumulatorState::Streaming;
        self.parts.clear();
        self.buffers.clear();
        self.calls.clear();
        self.call_usage = None;
        self.finish_reason = None;
    }

    /// Fold one delta, returning the events it produces
    pub fn push(&mut self, delta: ChunkDelta) -> Vec<StreamChunk> {
        if self.is_terminal() {
            return Vec::new();
        }
        if self.state == AccumulatorState::Idle {
            self.begin();
        }

        match delta {
            ChunkDelta::Text(text) => {
                if text.is_empty() {
                    return Vec::new();
                }
                match self.parts.last_mut() {
                    Some(Part::Text { text: active }) => active.push_str(&text),
                    _ => self.parts.push(Part::text(text.clone())),
                }
                vec![self.chunk(StreamEvent::Chunk { delta: text })]
            }
            ChunkDelta::ToolCallBegin { index, id, name } => {
                let buffer = self.buffers.entry(index).or_default();
                if id.is_some() {
                    buffer.id = id;
                }
                if name.is_some() {
                    buffer.name = name;
                }
                Vec::new()
            }
            ChunkDelta::ToolCallArgs { index, fragment } => {
                self.buffers.entry(index).or_default().args.push_str(&fragment);
                Vec::new()
            }
            ChunkDelta::ToolCallEnd { index } => {
                if let Some(buffer) = self.buffers.remove(&index) {
                    self.flush_buffer(buffer);
                }
                Vec::new()
            }
            ChunkDelta::ToolCall { id, name, args } => {
                self.add_call(id, name, Ok(args));
                Vec::new()
            }
            ChunkDelta::Usage(usage) => {
                self.call_usage.get_or_insert_with(TokenUsage::default).merge(&usage);
                Vec::new()
            }
            ChunkDelta::ModelVersion(version) => {
                self.model_version = Some(version);
                Vec::new()
            }
            ChunkDelta::Finish(reason) => {
                self.flush_all();
                self.finish_reason = Some(reason);
                Vec::new()
            }
            ChunkDelta::Error(message) => self.fail(message).into_iter().collect(),
        }
    }

    /// The raw stream ended. Without a finish signal the turn errors.
    pub fn end_of_stream(&mut self) -> Option<StreamChunk> {
        if self.is_terminal() {
            return None;
        }
        if let Some(usage) = &self.call_usage {
            self.total_usage.get_or_insert_with(TokenUsage::default).add(usage);
        }
        if self.finish_reason.is_none() {
            return self.fail("stream ended without a finish signal");
        }
        self.flush_all();
        None
    }

    /// Assistant content of the current model call
    pub fn content(&self) -> Content {
        Content {
            parts: self.parts.clone(),
            ..Content::new(Role::Assistant)
        }
        .with_metadata(ContentMetadata {
            usage: self.call_usage.clone(),
            model_version: self.model_version.clone(),
            finish_reason: self.finish_reason,
        })
    }

    /// Concatenated text of the current model call
    pub fn text(&self) -> String {
        self.parts.iter().filter_map(Part::as_text).collect()
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        &self.calls
    }

    pub fn tool_call(&self, id: &str) -> Option<&ToolCall> {
        self.calls.iter().find(|c| c.id == id)
    }

    /// Provider-reported model version, latest seen
    pub fn model_version(&self) -> Option<&str> {
        self.model_version.as_deref()
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Message of the terminal error, if the turn errored
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Usage summed over finished model calls
    pub fn total_usage(&self) -> Option<&TokenUsage> {
        self.total_usage.as_ref()
    }

    /// Move a tool call forward and emit its status
    pub fn set_status(&mut self, id: &str, status: ToolCallStatus) -> crate::Result<StreamChunk> {
        let call = self
            .calls
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| crate::AgentError::ToolNotFound(id.to_string()))?;
        call.transition(status)?;
        let event = status_event(call);
        Ok(self.chunk(event))
    }

    /// Record a call's outcome. Already-finished calls are left untouched.
    pub fn finish_call(&mut self, id: &str, outcome: ToolOutcome) -> Option<StreamChunk> {
        let call = self.calls.iter_mut().find(|c| c.id == id)?;
        if call.is_terminal() {
            return None;
        }
        call.finish(outcome);
        let event = status_event(call);
        Some(self.chunk(event))
    }

    /// Suspend until the listed calls are approved or rejected.
    ///
    /// Open argument buffers stay buffered; only a finish signal parses them.
    pub fn await_confirmation(&mut self, ids: &[String]) -> Vec<StreamChunk> {
        if self.is_terminal() {
            return Vec::new();
        }
        let mut events = Vec::new();
        for call in self.calls.iter_mut().filter(|c| ids.contains(&c.id)) {
            if call.transition(ToolCallStatus::AwaitingApproval).is_ok() {
                events.push(status_event(call));
            }
        }
        let pending: Vec<ToolCall> = self
            .calls
            .iter()
            .filter(|c| c.status == ToolCallStatus::AwaitingApproval)
            .cloned()
            .collect();
        self.state = AccumulatorState::AwaitingApproval;
        events.push(StreamEvent::AwaitingConfirmation { pending });
        events.into_iter().map(|e| self.chunk(e)).collect()
    }

    /// Leave `AwaitingApproval`; calls not in `approved` fail as rejected
    pub fn resolve_confirmation(&mut self, approved: &HashSet<String>) -> Vec<StreamChunk> {
        if self.state != AccumulatorState::AwaitingApproval {
            return Vec::new();
        }
        self.state = AccumulatorState::Streaming;
        let mut events = Vec::new();
        for call in self
            .calls
            .iter_mut()
            .filter(|c| c.status == ToolCallStatus::AwaitingApproval)
        {
            if !approved.contains(&call.id) {
                call.fail("rejected by user");
                events.push(status_event(call));
            }
        }
        events.into_iter().map(|e| self.chunk(e)).collect()
    }

    /// Terminal success with the final content and summed usage
    pub fn complete(&mut self) -> Option<StreamChunk> {
        if self.is_terminal() {
            return None;
        }
        self.state = AccumulatorState::Completed;
        let content = self.content();
        let usage = self.total_usage.clone().or_else(|| self.call_usage.clone());
        Some(self.chunk(StreamEvent::Complete { content, usage }))
    }

    /// Terminal cancellation; every unfinished call fails
    pub fn cancel(&mut self) -> Vec<StreamChunk> {
        if self.is_terminal() {
            return Vec::new();
        }
        self.buffers.clear();
        let mut events: Vec<StreamEvent> = Vec::new();
        for call in self.calls.iter_mut().filter(|c| !c.is_terminal()) {
            call.fail("cancelled");
            events.push(status_event(call));
        }
        events.push(StreamEvent::Cancelled);
        self.state = AccumulatorState::Cancelled;
        events.into_iter().map(|e| self.chunk(e)).collect()
    }

    /// Terminal error
    pub fn fail(&mut self, message: impl Into<String>) -> Option<StreamChunk> {
        if self.is_terminal() {
            return None;
        }
        self.buffers.clear();
        for call in self.calls.iter_mut().filter(|c| !c.is_terminal()) {
            call.fail("turn failed");
        }
        let message = message.into();
        self.state = AccumulatorState::Errored;
        self.error = Some(message.clone());
        Some(self.chunk(StreamEvent::Error { message }))
    }

    fn chunk(&self, event: StreamEvent) -> StreamChunk {
        StreamChunk::new(self.conversation_id.clone(), event)
    }

    fn flush_all(&mut self) {
        for (_, buffer) in std::mem::take(&mut self.buffers) {
            self.flush_buffer(buffer);
        }
    }

    fn flush_buffer(&mut self, buffer: CallBuffer) {
        let Some(name) = buffer.name else {
            tracing::warn!(conversation_id = %self.conversation_id, "dropping tool call without a name");
            return;
        };
        let args = if buffer.args.trim().is_empty() {
            Ok(Value::Object(Map::new()))
        } else {
            serde_json::from_str::<Value>(&buffer.args).map_err(|e| e.to_string())
        };
        self.add_call(buffer.id, name, args);
    }

    fn add_call(&mut self, id: Option<String>, name: String, args: Result<Value, String>) {
        let id = id
            .filter(|id| !id.is_empty() && self.tool_call(id).is_none())
            .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple()));
        let (args, parse_error) = match args {
            Ok(args) => (args, None),
            Err(e) => (Value::Object(Map::new()), Some(e)),
        };
        self.parts.push(Part::FunctionCall {
            id: id.clone(),
            name: name.clone(),
            args: args.clone(),
        });
        let mut call = ToolCall::new(id, name, args);
        if let Some(error) = parse_error {
            tracing::warn!(tool = %call.name, error = %error, "malformed tool call arguments");
            call.fail(format!("malformed arguments: {error}"));
        }
        self.calls.push(call);
    }
}

fn status_event(call: &ToolCall) -> StreamEvent {
    StreamEvent::ToolStatus {
        id: call.id.clone(),
        name: call.name.clone(),
        status: call.status,
        error: call.result.as_ref().and_then(|r| r.error.clone()),
    }
}

// ============================================================================
// Event Routing
// ============================================================================

/// Delivers events of the active conversation, buffers the rest.
///
/// Buffered events are flushed in arrival order when their conversation is
/// activated.
#[derive(Debug, Default)]
pub struct EventRouter {
    active: Option<ConversationId>,
    buffers: HashMap<ConversationId, VecDeque<StreamChunk>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<&ConversationId> {
        self.active.as_ref()
    }

    /// `Some` when the chunk should be delivered now
    pub fn route(&mut self, chunk: StreamChunk) -> Option<StreamChunk> {
        if self.active.as_ref() == Some(&chunk.conversation_id) {
            return Some(chunk);
        }
        self.buffers
            .entry(chunk.conversation_id.clone())
            .or_default()
            .push_back(chunk);
        None
    }

    /// Make `id` active and drain its backlog
    pub fn activate(&mut self, id: ConversationId) -> Vec<StreamChunk> {
        let backlog = self
            .buffers
            .remove(&id)
            .map(Vec::from)
            .unwrap_or_default();
        self.active = Some(id);
        backlog
    }

    /// Number of buffered events for `id`
    pub fn pending(&self, id: &ConversationId) -> usize {
        self.buffers.get(id).map_or(0, VecDeque::len)
    }

    /// Drop the backlog of a conversation that went away
    pub fn discard(&mut self, id: &ConversationId) {
        self.buffers.remove(id);
    }
}

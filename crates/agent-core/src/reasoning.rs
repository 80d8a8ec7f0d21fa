//! Tool Execution Loop
//!
//! Runs one user turn: send the history to a backend, fold the stream, and
//! while the model asks for tools, gate them through the policy and the
//! approval gate, dispatch them concurrently and feed the results back.
//!
//! Every suspension point (stream `next()`, approval wait, tool execution)
//! races the turn's [`CancellationToken`] and the runtime deadline.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{ChannelConfig, Settings};
use crate::error::{AgentError, Result};
use crate::message::{dedupe_function_responses, Content, Part};
use crate::policy::{self, Mode, PolicyDecision};
use crate::provider::{AdapterRegistry, ChannelClient, GenerateRequest, TokenUsage, Transport};
use crate::session::{Checkpoint, ConversationId, ConversationStore};
use crate::stream::{AccumulatorState, StreamAccumulator, StreamChunk, StreamEvent};
use crate::tool::{ToolCall, ToolCallStatus, ToolContext, ToolOutcome, ToolRegistry};

/// Sink for caller-facing events. A dropped receiver is not an error.
pub type EventSink = mpsc::UnboundedSender<StreamChunk>;

pub const DEFAULT_MAX_ITERATIONS: i64 = 20;
pub const DEFAULT_MAX_RUNTIME_SECS: i64 = 300;

/// Loop configuration; negative limits disable the cap
#[derive(Clone, Debug)]
pub struct LoopConfig {
    /// Model calls allowed per user turn
    pub max_iterations: i64,

    /// Wall-clock budget for the whole turn
    pub max_runtime_seconds: i64,

    pub mode: Mode,

    pub system_instruction: Option<String>,

    /// Mode/context material injected before the trailing user input
    pub dynamic_context: Option<String>,

    /// Tools that must pass the approval gate before running
    pub confirm_tools: HashSet<String>,

    /// Fail the turn when every call of a tool iteration failed
    pub require_tool_success: bool,

    /// Use the streaming endpoint
    pub stream: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_runtime_seconds: DEFAULT_MAX_RUNTIME_SECS,
            mode: Mode::Agent,
            system_instruction: None,
            dynamic_context: None,
            confirm_tools: HashSet::new(),
            require_tool_success: false,
            stream: true,
        }
    }
}

impl LoopConfig {
    /// Defaults overridden by `AGENT_MAX_ITERATIONS`, `AGENT_MAX_RUNTIME_SECS`,
    /// `AGENT_MODE` and `AGENT_CONFIRM_TOOLS` (comma-separated)
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(max) = env_parse("AGENT_MAX_ITERATIONS") {
            config.max_iterations = max;
        }
        if let Some(secs) = env_parse("AGENT_MAX_RUNTIME_SECS") {
            config.max_runtime_seconds = secs;
        }
        if let Ok(mode) = std::env::var("AGENT_MODE") {
            config.mode = mode.parse().unwrap_or_default();
        }
        if let Ok(tools) = std::env::var("AGENT_CONFIRM_TOOLS") {
            config.confirm_tools = tools
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
        }
        config
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max_iterations(mut self, max: i64) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_max_runtime_seconds(mut self, secs: i64) -> Self {
        self.max_runtime_seconds = secs;
        self
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    pub fn with_dynamic_context(mut self, context: impl Into<String>) -> Self {
        self.dynamic_context = Some(context.into());
        self
    }

    pub fn confirm_tool(mut self, name: impl Into<String>) -> Self {
        self.confirm_tools.insert(name.into());
        self
    }

    pub fn deadline(&self, started: Instant) -> Option<Instant> {
        u64::try_from(self.max_runtime_seconds)
            .ok()
            .map(|secs| started + Duration::from_secs(secs))
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Decides which calls awaiting confirmation may run
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    /// Ids of the approved calls; the rest are rejected
    async fn decide(&self, conversation_id: &ConversationId, pending: &[ToolCall]) -> Result<HashSet<String>>;
}

/// Approves everything
pub struct AutoApprove;

#[async_trait]
impl ApprovalGate for AutoApprove {
    async fn decide(&self, _conversation_id: &ConversationId, pending: &[ToolCall]) -> Result<HashSet<String>> {
        Ok(pending.iter().map(|c| c.id.clone()).collect())
    }
}

/// How a turn ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoopStatus {
    Completed,
    Cancelled,
    Error(String),
}

/// Result of [`ToolExecutionLoop::run`]
#[derive(Clone, Debug)]
pub struct LoopOutcome {
    pub status: LoopStatus,

    /// Assistant content of the last model call
    pub final_content: Option<Content>,

    /// Model calls made
    pub iterations: u32,

    /// Every tool call of the turn, in dispatch order, with its result
    pub tool_calls: Vec<ToolCall>,

    /// Provider-reported model version
    pub model_version: Option<String>,

    pub usage: Option<TokenUsage>,
}

impl LoopOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == LoopStatus::Completed
    }

    pub fn text(&self) -> String {
        self.final_content.as_ref().map(Content::text).unwrap_or_default()
    }

    pub fn error(&self) -> Option<&str> {
        match &self.status {
            LoopStatus::Error(message) => Some(message),
            _ => None,
        }
    }
}

enum CallStep {
    Done,
    Cancelled,
    TimedOut,
}

/// Multi-turn tool-calling orchestrator
pub struct ToolExecutionLoop {
    adapters: Arc<AdapterRegistry>,
    transport: Arc<dyn Transport>,
    tools: Arc<ToolRegistry>,
    store: Arc<dyn ConversationStore>,
    settings: Arc<dyn Settings>,
    approver: Arc<dyn ApprovalGate>,
    config: LoopConfig,
}

impl ToolExecutionLoop {
    pub fn builder() -> LoopBuilder {
        LoopBuilder::default()
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Append user input and run the turn
    pub async fn send(
        &self,
        conversation_id: &ConversationId,
        message: impl Into<String>,
        channel: ChannelConfig,
        events: &EventSink,
        cancel: CancellationToken,
    ) -> LoopOutcome {
        if let Err(e) = self
            .store
            .append_content(conversation_id, Content::user(message))
            .await
        {
            let mut acc = StreamAccumulator::new(conversation_id.clone());
            return self.fail(&mut acc, events, 0, Vec::new(), e.to_string());
        }
        self.run(conversation_id, channel, events, cancel).await
    }

    /// Run a turn over the stored history
    pub async fn run(
        &self,
        conversation_id: &ConversationId,
        channel: ChannelConfig,
        events: &EventSink,
        cancel: CancellationToken,
    ) -> LoopOutcome {
        let mut acc = StreamAccumulator::new(conversation_id.clone());
        let mut audit: Vec<ToolCall> = Vec::new();
        let mut iteration: u32 = 0;
        let deadline = self.config.deadline(Instant::now());

        let client = match ChannelClient::new(&self.adapters, self.transport.clone(), channel.clone()) {
            Ok(client) => client,
            Err(e) => return self.fail(&mut acc, events, iteration, audit, e.to_string()),
        };
        let policy_ctx = self.settings.policy_context(&self.config.mode);
        let declarations = self.tools.declarations();

        loop {
            if cancel.is_cancelled() {
                return self.cancelled(&mut acc, events, iteration, audit);
            }
            if let Err(e) = self.check_budget(iteration, deadline) {
                return self.fail(&mut acc, events, iteration, audit, e.to_string());
            }
            iteration += 1;
            tracing::info!(conversation_id = %conversation_id, iteration, channel = %channel.id, "starting model call");

            let history = match self.store.get_history(conversation_id).await {
                Ok(history) => history,
                Err(e) => return self.fail(&mut acc, events, iteration, audit, e.to_string()),
            };
            let mut request = GenerateRequest::new(conversation_id.clone(), history);
            request.system_instruction = self.config.system_instruction.clone();
            request.dynamic_context = self.config.dynamic_context.clone();
            request.tools = declarations.clone();
            request.options = channel.options.clone();
            request.stream = self.config.stream;

            acc.begin();
            match self.model_call(&client, &request, &mut acc, events, &cancel, deadline).await {
                CallStep::Done => {}
                CallStep::Cancelled => {
                    let partial = acc.text();
                    if !partial.is_empty() {
                        let content = Content::assistant(partial);
                        if let Err(e) = self.store.append_content(conversation_id, content).await {
                            tracing::warn!(conversation_id = %conversation_id, error = %e, "failed to keep partial output");
                        }
                    }
                    return self.cancelled(&mut acc, events, iteration, audit);
                }
                CallStep::TimedOut => {
                    let message = AgentError::BudgetExceeded(format!(
                        "max runtime of {}s reached",
                        self.config.max_runtime_seconds
                    ));
                    return self.fail(&mut acc, events, iteration, audit, message.to_string());
                }
            }
            if acc.is_terminal() {
                tracing::error!(conversation_id = %conversation_id, iteration, "model call failed");
                return self.outcome(&acc, iteration, audit);
            }

            let content = acc.content();
            if acc.tool_calls().is_empty() {
                if !content.parts.is_empty() {
                    if let Err(e) = self.append(conversation_id, content, iteration, events).await {
                        return self.fail(&mut acc, events, iteration, audit, e.to_string());
                    }
                }
                emit(events, acc.complete());
                tracing::info!(conversation_id = %conversation_id, iteration, "turn completed");
                return self.outcome(&acc, iteration, audit);
            }

            if let Err(e) = self.store.append_content(conversation_id, content.clone()).await {
                return self.fail(&mut acc, events, iteration, audit, e.to_string());
            }
            emit(
                events,
                Some(StreamChunk::new(
                    conversation_id.clone(),
                    StreamEvent::ToolIteration { iteration, content },
                )),
            );

            self.apply_policy(&mut acc, events, &policy_ctx);

            if !self.confirm(&mut acc, events, &cancel, deadline).await {
                self.keep_responses(conversation_id, &request.history, &mut acc, events).await;
                return self.cancelled(&mut acc, events, iteration, audit);
            }

            match self.dispatch(&mut acc, events, &cancel, deadline, &channel).await {
                CallStep::Done => {}
                CallStep::Cancelled => {
                    emit(events, acc.cancel());
                    self.keep_responses(conversation_id, &request.history, &mut acc, events).await;
                    audit.extend(acc.tool_calls().iter().cloned());
                    return self.outcome(&acc, iteration, audit);
                }
                CallStep::TimedOut => {
                    for id in unfinished_ids(&acc) {
                        emit(events, acc.finish_call(&id, ToolOutcome::failure("runtime budget exceeded")));
                    }
                    self.keep_responses(conversation_id, &request.history, &mut acc, events).await;
                    audit.extend(acc.tool_calls().iter().cloned());
                    let message = AgentError::BudgetExceeded(format!(
                        "max runtime of {}s reached",
                        self.config.max_runtime_seconds
                    ));
                    return self.fail(&mut acc, events, iteration, audit, message.to_string());
                }
            }

            let appended = self.append_responses(conversation_id, &request.history, &mut acc, events).await;
            audit.extend(acc.tool_calls().iter().cloned());
            if let Err(e) = appended {
                return self.fail(&mut acc, events, iteration, audit, e.to_string());
            }
            if let Err(e) = self.checkpoint(conversation_id, iteration, events).await {
                return self.fail(&mut acc, events, iteration, audit, e.to_string());
            }

            if self.config.require_tool_success
                && acc.tool_calls().iter().all(|c| c.status == ToolCallStatus::Failed)
            {
                return self.fail(&mut acc, events, iteration, audit, "all tool calls failed".into());
            }
        }
    }

    fn check_budget(&self, iteration: u32, deadline: Option<Instant>) -> Result<()> {
        if let Ok(max) = u32::try_from(self.config.max_iterations) {
            if iteration >= max {
                return Err(AgentError::BudgetExceeded(format!("max iterations ({max}) reached")));
            }
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(AgentError::BudgetExceeded(format!(
                "max runtime of {}s reached",
                self.config.max_runtime_seconds
            )));
        }
        Ok(())
    }

    async fn model_call(
        &self,
        client: &ChannelClient,
        request: &GenerateRequest,
        acc: &mut StreamAccumulator,
        events: &EventSink,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> CallStep {
        if !request.stream {
            let response = tokio::select! {
                () = cancel.cancelled() => return CallStep::Cancelled,
                () = wait_deadline(deadline) => return CallStep::TimedOut,
                response = client.generate(request) => response,
            };
            match response {
                Ok(response) => {
                    for delta in response.into_deltas() {
                        emit(events, acc.push(delta));
                    }
                    emit(events, acc.end_of_stream());
                }
                Err(e) => emit(events, acc.fail(e.to_string())),
            }
            return CallStep::Done;
        }

        let mut stream = tokio::select! {
            () = cancel.cancelled() => return CallStep::Cancelled,
            () = wait_deadline(deadline) => return CallStep::TimedOut,
            stream = client.stream(request) => match stream {
                Ok(stream) => stream,
                Err(e) => {
                    emit(events, acc.fail(e.to_string()));
                    return CallStep::Done;
                }
            },
        };

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return CallStep::Cancelled,
                () = wait_deadline(deadline) => return CallStep::TimedOut,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(delta)) => emit(events, acc.push(delta)),
                Some(Err(e)) => {
                    emit(events, acc.fail(e.to_string()));
                    return CallStep::Done;
                }
                None => break,
            }
            if acc.is_terminal() {
                return CallStep::Done;
            }
        }
        emit(events, acc.end_of_stream());
        CallStep::Done
    }

    fn apply_policy(&self, acc: &mut StreamAccumulator, events: &EventSink, ctx: &policy::ToolPolicyContext) {
        let calls: Vec<(String, String, serde_json::Value)> = acc
            .tool_calls()
            .iter()
            .filter(|c| !c.is_terminal())
            .map(|c| (c.id.clone(), c.name.clone(), c.args.clone()))
            .collect();
        for (id, name, args) in calls {
            match policy::check(ctx, &name, &args) {
                PolicyDecision::Deny { reason } => {
                    tracing::warn!(tool = %name, mode = %ctx.mode, reason = %reason, "tool call denied by policy");
                    emit(events, acc.finish_call(&id, ToolOutcome::failure(reason)));
                }
                PolicyDecision::AllowWithException { reason } => {
                    tracing::debug!(tool = %name, reason = %reason, "tool call allowed by exception");
                }
                PolicyDecision::Allow => {}
            }
        }
    }

    /// Returns false when cancelled while waiting
    async fn confirm(
        &self,
        acc: &mut StreamAccumulator,
        events: &EventSink,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> bool {
        let needs: Vec<String> = acc
            .tool_calls()
            .iter()
            .filter(|c| {
                !c.is_terminal()
                    && (c.status == ToolCallStatus::AwaitingApproval || self.config.confirm_tools.contains(&c.name))
            })
            .map(|c| c.id.clone())
            .collect();
        if needs.is_empty() {
            return true;
        }

        emit(events, acc.await_confirmation(&needs));
        let pending: Vec<ToolCall> = acc
            .tool_calls()
            .iter()
            .filter(|c| c.status == ToolCallStatus::AwaitingApproval)
            .cloned()
            .collect();

        let decision = tokio::select! {
            () = cancel.cancelled() => return false,
            () = wait_deadline(deadline) => Ok(HashSet::new()),
            decision = self.approver.decide(acc.conversation_id(), &pending) => decision,
        };
        let approved = decision.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "approval gate failed, rejecting pending calls");
            HashSet::new()
        });
        emit(events, acc.resolve_confirmation(&approved));
        true
    }

    async fn dispatch(
        &self,
        acc: &mut StreamAccumulator,
        events: &EventSink,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
        channel: &ChannelConfig,
    ) -> CallStep {
        let runnable: Vec<ToolCall> = acc
            .tool_calls()
            .iter()
            .filter(|c| !c.is_terminal())
            .cloned()
            .collect();
        if runnable.is_empty() {
            return CallStep::Done;
        }

        let names = runnable.iter().map(|c| c.name.clone()).collect();
        emit(
            events,
            Some(StreamChunk::new(
                acc.conversation_id().clone(),
                StreamEvent::ToolsExecuting { names },
            )),
        );
        for call in &runnable {
            match acc.set_status(&call.id, ToolCallStatus::Executing) {
                Ok(chunk) => emit(events, Some(chunk)),
                Err(e) => tracing::warn!(tool = %call.name, error = %e, "unexpected tool call state"),
            }
        }

        let conversation_id = acc.conversation_id().clone();
        let tools = self.tools.clone();
        let executions = runnable.iter().map(|call| {
            let ctx = ToolContext::new(conversation_id.clone(), call.id.clone(), cancel.child_token())
                .with_channel(channel.clone());
            let tools = tools.clone();
            async move {
                tracing::debug!(tool = %call.name, call_id = %call.id, "dispatching tool");
                let outcome = tools.execute(&call.name, &call.args, &ctx).await;
                (call.id.clone(), outcome)
            }
        });

        let results = tokio::select! {
            () = cancel.cancelled() => return CallStep::Cancelled,
            () = wait_deadline(deadline) => return CallStep::TimedOut,
            results = futures::future::join_all(executions) => results,
        };
        for (id, outcome) in results {
            emit(events, acc.finish_call(&id, outcome));
        }
        CallStep::Done
    }

    /// Append one tool-role content with a response per finished call
    async fn append_responses(
        &self,
        conversation_id: &ConversationId,
        history: &[Content],
        acc: &mut StreamAccumulator,
        events: &EventSink,
    ) -> Result<()> {
        for id in unfinished_ids(acc) {
            emit(events, acc.finish_call(&id, ToolOutcome::failure("cancelled")));
        }
        let responses: Vec<Part> = acc
            .tool_calls()
            .iter()
            .filter_map(|call| {
                call.result.as_ref().map(|outcome| Part::FunctionResponse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    response: outcome.to_response(),
                    is_error: !outcome.success,
                })
            })
            .collect();
        let fresh = dedupe_function_responses(history, responses);
        if fresh.is_empty() {
            return Ok(());
        }
        self.store
            .append_content(conversation_id, Content::tool_responses(fresh))
            .await
    }

    /// Best-effort variant used on the way out of a turn
    async fn keep_responses(
        &self,
        conversation_id: &ConversationId,
        history: &[Content],
        acc: &mut StreamAccumulator,
        events: &EventSink,
    ) {
        if let Err(e) = self.append_responses(conversation_id, history, acc, events).await {
            tracing::warn!(conversation_id = %conversation_id, error = %e, "failed to append tool responses");
        }
    }

    async fn append(&self, conversation_id: &ConversationId, content: Content, iteration: u32, events: &EventSink) -> Result<()> {
        self.store.append_content(conversation_id, content).await?;
        self.checkpoint(conversation_id, iteration, events).await
    }

    async fn checkpoint(&self, conversation_id: &ConversationId, iteration: u32, events: &EventSink) -> Result<()> {
        let history_len = self.store.get_history(conversation_id).await?.len();
        let checkpoints = self
            .store
            .record_checkpoint(Checkpoint::new(conversation_id.clone(), history_len, iteration))
            .await?;
        emit(
            events,
            Some(StreamChunk::new(
                conversation_id.clone(),
                StreamEvent::Checkpoints { checkpoints },
            )),
        );
        Ok(())
    }

    fn cancelled(&self, acc: &mut StreamAccumulator, events: &EventSink, iteration: u32, mut audit: Vec<ToolCall>) -> LoopOutcome {
        emit(events, acc.cancel());
        tracing::info!(conversation_id = %acc.conversation_id(), iteration, "turn cancelled");
        // calls of the current model call that are not yet in the audit
        let recorded: HashSet<String> = audit.iter().map(|c| c.id.clone()).collect();
        audit.extend(acc.tool_calls().iter().filter(|c| !recorded.contains(&c.id)).cloned());
        self.outcome(acc, iteration, audit)
    }

    fn fail(&self, acc: &mut StreamAccumulator, events: &EventSink, iteration: u32, audit: Vec<ToolCall>, message: String) -> LoopOutcome {
        tracing::error!(conversation_id = %acc.conversation_id(), iteration, error = %message, "turn failed");
        emit(events, acc.fail(message.clone()));
        let mut outcome = self.outcome(acc, iteration, audit);
        outcome.status = LoopStatus::Error(message);
        outcome
    }

    fn outcome(&self, acc: &StreamAccumulator, iterations: u32, tool_calls: Vec<ToolCall>) -> LoopOutcome {
        let status = match acc.state() {
            AccumulatorState::Cancelled => LoopStatus::Cancelled,
            AccumulatorState::Errored => LoopStatus::Error(acc.error().unwrap_or("model call failed").to_string()),
            _ => LoopStatus::Completed,
        };
        let content = acc.content();
        LoopOutcome {
            status,
            final_content: (!content.parts.is_empty()).then_some(content),
            iterations,
            tool_calls,
            model_version: acc.model_version().map(str::to_string),
            usage: acc.total_usage().cloned(),
        }
    }
}

fn emit(events: &EventSink, chunks: impl IntoIterator<Item = StreamChunk>) {
    for chunk in chunks {
        let _ = events.send(chunk);
    }
}

fn unfinished_ids(acc: &StreamAccumulator) -> Vec<String> {
    acc.tool_calls()
        .iter()
        .filter(|c| !c.is_terminal())
        .map(|c| c.id.clone())
        .collect()
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Builder for [`ToolExecutionLoop`]
#[derive(Default)]
pub struct LoopBuilder {
    adapters: Option<Arc<AdapterRegistry>>,
    transport: Option<Arc<dyn Transport>>,
    tools: Option<Arc<ToolRegistry>>,
    store: Option<Arc<dyn ConversationStore>>,
    settings: Option<Arc<dyn Settings>>,
    approver: Option<Arc<dyn ApprovalGate>>,
    config: LoopConfig,
}

impl LoopBuilder {
    pub fn adapters(mut self, adapters: Arc<AdapterRegistry>) -> Self {
        self.adapters = Some(adapters);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn settings(mut self, settings: Arc<dyn Settings>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn approver(mut self, approver: Arc<dyn ApprovalGate>) -> Self {
        self.approver = Some(approver);
        self
    }

    pub fn config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<ToolExecutionLoop> {
        let missing = |what: &str| AgentError::Config(format!("{what} is required"));
        Ok(ToolExecutionLoop {
            adapters: self.adapters.ok_or_else(|| missing("Adapter registry"))?,
            transport: self.transport.ok_or_else(|| missing("Transport"))?,
            tools: self.tools.unwrap_or_default(),
            store: self.store.ok_or_else(|| missing("Conversation store"))?,
            settings: self.settings.ok_or_else(|| missing("Settings"))?,
            approver: self.approver.unwrap_or_else(|| Arc::new(AutoApprove)),
            config: self.config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;
    use crate::session::MemoryConversationStore;
    use crate::testing::*;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    struct Harness {
        store: Arc<MemoryConversationStore>,
        transport: Arc<ScriptedTransport>,
        lp: ToolExecutionLoop,
    }

    fn harness(transport: ScriptedTransport, tools: ToolRegistry, config: LoopConfig) -> Harness {
        harness_with(transport, tools, config, Arc::new(AutoApprove))
    }

    fn harness_with(transport: ScriptedTransport, tools: ToolRegistry, config: LoopConfig, approver: Arc<dyn ApprovalGate>) -> Harness {
        let store = Arc::new(MemoryConversationStore::new());
        let transport = Arc::new(transport);
        let lp = ToolExecutionLoop::builder()
            .adapters(Arc::new(script_adapters()))
            .transport(transport.clone())
            .tools(Arc::new(tools))
            .store(store.clone())
            .settings(Arc::new(script_settings()))
            .approver(approver)
            .config(config)
            .build()
            .unwrap();
        Harness { store, transport, lp }
    }

    async fn run(h: &Harness, message: &str) -> (LoopOutcome, Vec<StreamChunk>, ConversationId) {
        let id = ConversationId::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = h.lp.send(&id, message, script_channel(), &tx, CancellationToken::new()).await;
        drop(tx);
        let mut events = Vec::new();
        while let Some(chunk) = rx.recv().await {
            events.push(chunk);
        }
        (outcome, events, id)
    }

    fn terminal_count(events: &[StreamChunk]) -> usize {
        events.iter().filter(|c| c.is_terminal()).count()
    }

    #[tokio::test]
    async fn test_text_only_turn() {
        let transport = ScriptedTransport::new(vec![vec![text("Hi"), text(" there"), finish()]]);
        let h = harness(transport, ToolRegistry::new(), LoopConfig::default());

        let (outcome, events, id) = run(&h, "hello").await;

        assert!(outcome.is_completed());
        assert_eq!(outcome.text(), "Hi there");
        assert!(outcome.tool_calls.is_empty());
        assert_eq!(terminal_count(&events), 1);
        assert!(matches!(events.last().map(|c| &c.event), Some(StreamEvent::Complete { .. })));

        let history = h.store.get_history(&id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].text(), "Hi there");
    }

    #[tokio::test]
    async fn test_tool_round_trip() {
        let transport = ScriptedTransport::new(vec![
            vec![text("Let me check."), call("c1", "echo", json!({"text": "x"})), finish()],
            vec![text("Done."), finish()],
        ]);
        let (echo, hits) = CountingTool::new("echo");
        let mut tools = ToolRegistry::new();
        tools.register(echo);
        let h = harness(transport, tools, LoopConfig::default());

        let (outcome, events, id) = run(&h, "go").await;

        assert!(outcome.is_completed());
        assert_eq!(outcome.iterations, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.tool_calls.len(), 1);
        assert_eq!(outcome.tool_calls[0].status, ToolCallStatus::Completed);
        assert_eq!(terminal_count(&events), 1);
        assert!(events.iter().any(|c| matches!(&c.event, StreamEvent::ToolsExecuting { names } if names == &["echo"])));
        assert!(events.iter().any(|c| matches!(&c.event, StreamEvent::ToolIteration { iteration: 1, .. })));
        assert!(events.iter().any(|c| matches!(&c.event, StreamEvent::Checkpoints { .. })));

        let history = h.store.get_history(&id).await.unwrap();
        let roles: Vec<_> = history.iter().map(|c| c.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
        assert_eq!(history[2].parts[0].call_id(), Some("c1"));
    }

    #[tokio::test]
    async fn test_readonly_denial_never_dispatches() {
        let transport = ScriptedTransport::new(vec![
            vec![call("w1", "write_file", json!({"path": "a.rs", "content": ""})), finish()],
            vec![text("ok"), finish()],
        ]);
        let (writer, hits) = CountingTool::new("write_file");
        let mut tools = ToolRegistry::new();
        tools.register(writer);
        let h = harness(transport, tools, LoopConfig::default().with_mode(Mode::Readonly));

        let (outcome, _events, id) = run(&h, "write it").await;

        assert!(outcome.is_completed());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.tool_calls[0].status, ToolCallStatus::Failed);

        let history = h.store.get_history(&id).await.unwrap();
        let Part::FunctionResponse { response, is_error, .. } = &history[2].parts[0] else {
            panic!("expected function response");
        };
        assert!(*is_error);
        assert!(response["error"].as_str().unwrap().contains("readonly"));
    }

    #[tokio::test]
    async fn test_iteration_cap_stops_endless_tool_loop() {
        let transport = ScriptedTransport::endless(vec![call("", "echo", json!({"text": "again"})), finish()]);
        let (echo, _hits) = CountingTool::new("echo");
        let mut tools = ToolRegistry::new();
        tools.register(echo);
        let h = harness(transport, tools, LoopConfig::default().with_max_iterations(3));

        let (outcome, events, _id) = run(&h, "loop").await;

        assert!(outcome.error().unwrap().contains("max iterations"));
        assert_eq!(outcome.iterations, 3);
        assert_eq!(h.transport.calls.load(Ordering::SeqCst), 3);
        assert_eq!(terminal_count(&events), 1);
    }

    #[tokio::test]
    async fn test_cancel_mid_stream() {
        let transport = ScriptedTransport::new(vec![vec![text("par"), hang()]]);
        let h = harness(transport, ToolRegistry::new(), LoopConfig::default());
        let id = ConversationId::new();
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<StreamChunk>();

        let watcher = async {
            let mut seen = Vec::new();
            while let Some(chunk) = rx.recv().await {
                if matches!(chunk.event, StreamEvent::Chunk { .. }) {
                    cancel.cancel();
                }
                let done = chunk.is_terminal();
                seen.push(chunk);
                if done {
                    break;
                }
            }
            seen
        };
        let (outcome, seen) = tokio::join!(h.lp.send(&id, "hi", script_channel(), &tx, cancel.clone()), watcher);

        assert_eq!(outcome.status, LoopStatus::Cancelled);
        assert!(outcome.tool_calls.iter().all(ToolCall::is_terminal));
        assert_eq!(terminal_count(&seen), 1);
        assert!(matches!(seen.last().map(|c| &c.event), Some(StreamEvent::Cancelled)));

        let history = h.store.get_history(&id).await.unwrap();
        assert_eq!(history.last().map(Content::text).as_deref(), Some("par"));
    }

    #[tokio::test]
    async fn test_cancel_during_tool_execution() {
        let transport = ScriptedTransport::new(vec![vec![call("s1", "slow", json!({})), finish()]]);
        let mut tools = ToolRegistry::new();
        tools.register(BlockingTool);
        let h = harness(transport, tools, LoopConfig::default());
        let id = ConversationId::new();
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<StreamChunk>();

        let watcher = async {
            while let Some(chunk) = rx.recv().await {
                if matches!(chunk.event, StreamEvent::ToolsExecuting { .. }) {
                    cancel.cancel();
                }
                if chunk.is_terminal() {
                    break;
                }
            }
        };
        let (outcome, ()) = tokio::join!(h.lp.send(&id, "hi", script_channel(), &tx, cancel.clone()), watcher);

        assert_eq!(outcome.status, LoopStatus::Cancelled);
        assert_eq!(outcome.tool_calls.len(), 1);
        assert_eq!(outcome.tool_calls[0].status, ToolCallStatus::Failed);

        let history = h.store.get_history(&id).await.unwrap();
        assert_eq!(history.last().map(|c| c.role), Some(Role::Tool));
    }

    #[tokio::test]
    async fn test_rejected_confirmation_skips_tool() {
        struct RejectAll;

        #[async_trait]
        impl ApprovalGate for RejectAll {
            async fn decide(&self, _id: &ConversationId, _pending: &[ToolCall]) -> Result<HashSet<String>> {
                Ok(HashSet::new())
            }
        }

        let transport = ScriptedTransport::new(vec![
            vec![call("e1", "echo", json!({"text": "x"})), finish()],
            vec![text("fine"), finish()],
        ]);
        let (echo, hits) = CountingTool::new("echo");
        let mut tools = ToolRegistry::new();
        tools.register(echo);
        let config = LoopConfig::default().confirm_tool("echo");
        let h = harness_with(transport, tools, config, Arc::new(RejectAll));

        let (outcome, events, _id) = run(&h, "go").await;

        assert!(outcome.is_completed());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(events.iter().any(|c| matches!(c.event, StreamEvent::AwaitingConfirmation { .. })));
        assert_eq!(outcome.tool_calls[0].result.as_ref().and_then(|r| r.error.as_deref()), Some("rejected by user"));
    }

    #[tokio::test]
    async fn test_cancel_while_awaiting_confirmation_keeps_audit() {
        struct NeverAnswers;

        #[async_trait]
        impl ApprovalGate for NeverAnswers {
            async fn decide(&self, _id: &ConversationId, _pending: &[ToolCall]) -> Result<HashSet<String>> {
                futures::future::pending().await
            }
        }

        let transport = ScriptedTransport::new(vec![
            vec![call("e1", "echo", json!({})), finish()],
            vec![call("g2", "gated", json!({})), finish()],
        ]);
        let (echo, _) = CountingTool::new("echo");
        let (gated, gated_hits) = CountingTool::new("gated");
        let mut tools = ToolRegistry::new();
        tools.register(echo);
        tools.register(gated);
        let config = LoopConfig::default().confirm_tool("gated");
        let h = harness_with(transport, tools, config, Arc::new(NeverAnswers));
        let id = ConversationId::new();
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<StreamChunk>();

        let watcher = async {
            while let Some(chunk) = rx.recv().await {
                if matches!(chunk.event, StreamEvent::AwaitingConfirmation { .. }) {
                    cancel.cancel();
                }
                if chunk.is_terminal() {
                    break;
                }
            }
        };
        let (outcome, ()) = tokio::join!(h.lp.send(&id, "hi", script_channel(), &tx, cancel.clone()), watcher);

        assert_eq!(outcome.status, LoopStatus::Cancelled);
        assert_eq!(outcome.iterations, 2);
        let ids: Vec<&str> = outcome.tool_calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "g2"]);
        assert_eq!(outcome.tool_calls[1].status, ToolCallStatus::Failed);
        assert_eq!(gated_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_require_tool_success() {
        let transport = ScriptedTransport::new(vec![vec![call("m1", "missing_tool", json!({})), finish()]]);
        let mut config = LoopConfig::default();
        config.require_tool_success = true;
        let h = harness(transport, ToolRegistry::new(), config);

        let (outcome, events, _id) = run(&h, "go").await;

        assert_eq!(outcome.error(), Some("all tool calls failed"));
        assert_eq!(terminal_count(&events), 1);
    }

    #[tokio::test]
    async fn test_stream_without_finish_errors() {
        let transport = ScriptedTransport::new(vec![vec![text("cut off")]]);
        let h = harness(transport, ToolRegistry::new(), LoopConfig::default());

        let (outcome, events, _id) = run(&h, "go").await;

        assert!(matches!(outcome.status, LoopStatus::Error(_)));
        assert!(matches!(events.last().map(|c| &c.event), Some(StreamEvent::Error { .. })));
    }
}

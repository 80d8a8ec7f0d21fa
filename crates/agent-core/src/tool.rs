//! Tool System
//!
//! Tools are static [`Tool`] implementations registered explicitly at startup
//! and invoked by the tool-execution loop. Every call is tracked as a
//! [`ToolCall`] whose status only moves forward.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::ChannelConfig;
use crate::error::{AgentError, Result};
use crate::session::ConversationId;

/// Where a tool comes from
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ToolSource {
    #[default]
    Builtin,
    /// Provided by an external MCP server
    Mcp { server: String },
}

/// Tool declaration handed to the model
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDeclaration {
    /// Unique tool identifier
    pub name: String,

    /// Human-readable description (shown to LLM)
    pub description: String,

    /// JSON schema of the arguments object
    pub parameters: Value,

    /// Category for grouping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    #[serde(default)]
    pub source: ToolSource,
}

impl ToolDeclaration {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            category: None,
            source: ToolSource::Builtin,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_source(mut self, source: ToolSource) -> Self {
        self.source = source;
        self
    }

    pub fn is_mcp(&self) -> bool {
        matches!(self.source, ToolSource::Mcp { .. })
    }

    /// Names listed under the schema's `required` key
    pub fn required_params(&self) -> impl Iterator<Item = &str> {
        self.parameters
            .get("required")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
    }
}

/// Category used to recognize sub-agent tools
pub const SUBAGENT_CATEGORY: &str = "subagent";

/// Per-call execution context
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub conversation_id: ConversationId,
    pub call_id: String,
    /// Fires when the surrounding turn is cancelled
    pub cancel: CancellationToken,
    /// Channel of the calling loop
    pub channel: Option<ChannelConfig>,
}

impl ToolContext {
    pub fn new(conversation_id: ConversationId, call_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            conversation_id,
            call_id: call_id.into(),
            cancel,
            channel: None,
        }
    }

    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = Some(channel);
        self
    }
}

/// Result of one registry dispatch
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn success(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Payload for a `FunctionResponse` part
    pub fn to_response(&self) -> Value {
        match (&self.result, &self.error) {
            (Some(result), _) if self.success => result.clone(),
            (_, Some(error)) => serde_json::json!({ "error": error }),
            _ => serde_json::json!({ "error": "tool failed" }),
        }
    }
}

/// Tool trait - implement to add new capabilities
#[async_trait]
pub trait Tool: Send + Sync {
    /// Declaration for LLM function calling
    fn declaration(&self) -> ToolDeclaration;

    /// Execute the tool with given arguments
    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<Value>;

    /// Validate arguments before execution (optional)
    fn validate(&self, args: &Value) -> Result<()> {
        let declaration = self.declaration();
        for param in declaration.required_params() {
            if args.get(param).is_none() {
                return Err(AgentError::ToolValidation(format!(
                    "Missing required parameter: {param}"
                )));
            }
        }
        Ok(())
    }
}

/// Registry for available tools
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new tool
    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        self.register_arc(Arc::new(tool));
    }

    /// Register a shared tool
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.declaration().name;
        if self.tools.insert(name.clone(), tool).is_none() {
            self.order.push(name);
        }
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Validate and run a tool; every failure is folded into the outcome
    pub async fn execute(&self, name: &str, args: &Value, ctx: &ToolContext) -> ToolOutcome {
        let Some(tool) = self.get(name) else {
            return ToolOutcome::failure(AgentError::ToolNotFound(name.to_string()).to_string());
        };
        if let Err(e) = tool.validate(args) {
            return ToolOutcome::failure(e.to_string());
        }
        match tool.execute(args, ctx).await {
            Ok(result) => ToolOutcome::success(result),
            Err(e) => ToolOutcome::failure(e.to_string()),
        }
    }

    /// Declarations in registration order
    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|t| t.declaration())
            .collect()
    }

    /// New registry holding the tools whose declaration passes `keep`
    pub fn filtered(&self, mut keep: impl FnMut(&ToolDeclaration) -> bool) -> Self {
        let mut subset = Self::new();
        for name in &self.order {
            if let Some(tool) = self.tools.get(name) {
                if keep(&tool.declaration()) {
                    subset.register_arc(tool.clone());
                }
            }
        }
        subset
    }

    /// Get tool names
    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// ============================================================================
// Tool Call Lifecycle
// ============================================================================

/// Lifecycle of one tool call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    AwaitingApproval,
    Executing,
    Completed,
    Failed,
}

impl ToolCallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ToolCallStatus::Completed | ToolCallStatus::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            ToolCallStatus::Pending => 0,
            ToolCallStatus::AwaitingApproval => 1,
            ToolCallStatus::Executing => 2,
            ToolCallStatus::Completed | ToolCallStatus::Failed => 3,
        }
    }

    /// Forward-only; `Failed` is reachable from every non-terminal state
    pub fn can_transition_to(self, next: ToolCallStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            ToolCallStatus::Failed => true,
            ToolCallStatus::Completed => self == ToolCallStatus::Executing,
            _ => next.rank() > self.rank(),
        }
    }
}

impl std::fmt::Display for ToolCallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ToolCallStatus::Pending => "pending",
            ToolCallStatus::AwaitingApproval => "awaiting_approval",
            ToolCallStatus::Executing => "executing",
            ToolCallStatus::Completed => "completed",
            ToolCallStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A tool call requested by the model, tracked for one turn
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique within the turn
    pub id: String,

    pub name: String,

    pub args: Value,

    pub status: ToolCallStatus,

    /// Set only once the call is completed or failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolOutcome>,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
            status: ToolCallStatus::Pending,
            result: None,
        }
    }

    /// Validated status change
    pub fn transition(&mut self, next: ToolCallStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(AgentError::InvalidTransition {
                id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Record the outcome. A call that already finished keeps its first result.
    pub fn finish(&mut self, outcome: ToolOutcome) {
        if self.status.is_terminal() {
            return;
        }
        let next = if outcome.success {
            ToolCallStatus::Completed
        } else {
            ToolCallStatus::Failed
        };
        self.status = next;
        self.result = Some(outcome);
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.finish(ToolOutcome::failure(error));
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn declaration(&self) -> ToolDeclaration {
            ToolDeclaration::new(
                "echo",
                "Echo the input",
                json!({
                    "type": "object",
                    "properties": {"text": {"type": "string"}},
                    "required": ["text"]
                }),
            )
        }

        async fn execute(&self, args: &Value, _ctx: &ToolContext) -> Result<Value> {
            Ok(json!({ "echo": args["text"] }))
        }
    }

    struct McpTool;

    #[async_trait]
    impl Tool for McpTool {
        fn declaration(&self) -> ToolDeclaration {
            ToolDeclaration::new("remote", "Remote tool", json!({"type": "object"}))
                .with_source(ToolSource::Mcp { server: "srv".into() })
        }

        async fn execute(&self, _args: &Value, _ctx: &ToolContext) -> Result<Value> {
            Err(AgentError::ToolExecution("offline".into()))
        }
    }

    fn ctx() -> ToolContext {
        ToolContext::new(ConversationId::new(), "call_1", CancellationToken::new())
    }

    #[tokio::test]
    async fn test_registry_execute_outcomes() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(McpTool);

        let ok = registry.execute("echo", &json!({"text": "hi"}), &ctx()).await;
        assert!(ok.success);
        assert_eq!(ok.result, Some(json!({"echo": "hi"})));

        let invalid = registry.execute("echo", &json!({}), &ctx()).await;
        assert!(!invalid.success);
        assert!(invalid.error.unwrap().contains("text"));

        let failed = registry.execute("remote", &json!({}), &ctx()).await;
        assert_eq!(failed.to_response(), json!({"error": "Tool execution error: offline"}));

        let missing = registry.execute("nope", &json!({}), &ctx()).await;
        assert!(!missing.success);
    }

    #[test]
    fn test_registry_filtered_keeps_order() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(McpTool);

        assert_eq!(registry.names(), vec!["echo", "remote"]);
        let builtin = registry.filtered(|d| !d.is_mcp());
        assert_eq!(builtin.names(), vec!["echo"]);
    }

    #[test]
    fn test_status_transitions_are_monotonic() {
        let mut call = ToolCall::new("c1", "echo", json!({}));
        call.transition(ToolCallStatus::AwaitingApproval).unwrap();
        call.transition(ToolCallStatus::Executing).unwrap();
        assert!(call.transition(ToolCallStatus::Pending).is_err());
        call.transition(ToolCallStatus::Completed).unwrap();
        assert!(call.transition(ToolCallStatus::Failed).is_err());
    }

    #[test]
    fn test_pending_cannot_complete_directly() {
        let mut call = ToolCall::new("c1", "echo", json!({}));
        assert!(call.transition(ToolCallStatus::Completed).is_err());
        call.transition(ToolCallStatus::Failed).unwrap();
        assert!(call.is_terminal());
    }

    #[test]
    fn test_finish_keeps_first_result() {
        let mut call = ToolCall::new("c1", "echo", json!({}));
        call.transition(ToolCallStatus::Executing).unwrap();
        call.finish(ToolOutcome::success(json!(1)));
        call.fail("late");

        assert_eq!(call.status, ToolCallStatus::Completed);
        assert_eq!(call.result, Some(ToolOutcome::success(json!(1))));
    }
}

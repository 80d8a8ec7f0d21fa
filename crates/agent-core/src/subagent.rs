//! Sub-Agents
//!
//! A sub-agent is a constrained [`ToolExecutionLoop`] run on a private,
//! in-memory conversation. The outer loop reaches it through
//! [`SubAgentTool`], a regular tool whose cancellation is a child of the
//! calling tool's token.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{ChannelConfig, Settings};
use crate::error::{AgentError, Result};
use crate::policy::Mode;
use crate::provider::{AdapterRegistry, Transport};
use crate::reasoning::{
    ApprovalGate, AutoApprove, LoopConfig, LoopStatus, ToolExecutionLoop, DEFAULT_MAX_ITERATIONS,
    DEFAULT_MAX_RUNTIME_SECS,
};
use crate::session::{ConversationId, MemoryConversationStore};
use crate::tool::{Tool, ToolCall, ToolContext, ToolDeclaration, ToolRegistry, SUBAGENT_CATEGORY};

/// Which registry tools a sub-agent sees
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolFilterMode {
    #[default]
    All,
    BuiltinOnly,
    McpOnly,
    Whitelist,
    Blacklist,
}

/// What to do when the configured channel does not exist
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MissingChannelPolicy {
    #[default]
    Fail,
    /// Run on the calling loop's channel
    FallbackToParent,
}

fn default_max_iterations() -> i64 {
    DEFAULT_MAX_ITERATIONS
}

fn default_max_runtime() -> i64 {
    DEFAULT_MAX_RUNTIME_SECS
}

/// Sub-agent definition
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubAgentConfig {
    /// Short identifier, also used to name the tool
    pub agent_type: String,

    pub description: String,

    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Target channel id; `None` uses the parent's channel
    #[serde(default)]
    pub channel_id: Option<String>,

    /// Model override for the target channel
    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub tool_filter_mode: ToolFilterMode,

    #[serde(default)]
    pub whitelist: Vec<String>,

    #[serde(default)]
    pub blacklist: Vec<String>,

    /// Older single list, read as the active whitelist or blacklist
    #[serde(default)]
    pub list: Vec<String>,

    /// −1 disables the cap
    #[serde(default = "default_max_iterations")]
    pub max_iterations: i64,

    /// −1 disables the cap
    #[serde(default = "default_max_runtime")]
    pub max_runtime_seconds: i64,

    #[serde(default)]
    pub missing_channel: MissingChannelPolicy,

    #[serde(default)]
    pub mode: Mode,
}

impl SubAgentConfig {
    pub fn new(agent_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            description: description.into(),
            system_prompt: None,
            channel_id: None,
            model: None,
            tool_filter_mode: ToolFilterMode::All,
            whitelist: Vec::new(),
            blacklist: Vec::new(),
            list: Vec::new(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_runtime_seconds: DEFAULT_MAX_RUNTIME_SECS,
            missing_channel: MissingChannelPolicy::Fail,
            mode: Mode::Agent,
        }
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_tool_filter(mut self, mode: ToolFilterMode, list: Vec<String>) -> Self {
        self.tool_filter_mode = mode;
        match mode {
            ToolFilterMode::Whitelist => self.whitelist = list,
            ToolFilterMode::Blacklist => self.blacklist = list,
            _ => {}
        }
        self
    }

    pub fn with_max_iterations(mut self, max: i64) -> Self {
        self.max_iterations = max;
        self
    }

    /// Tool name exposed to the outer loop
    pub fn tool_name(&self) -> String {
        format!("subagent_{}", self.agent_type)
    }

    fn active_list(&self) -> &[String] {
        let explicit = match self.tool_filter_mode {
            ToolFilterMode::Whitelist => &self.whitelist,
            ToolFilterMode::Blacklist => &self.blacklist,
            _ => return &[],
        };
        if explicit.is_empty() { &self.list } else { explicit }
    }

    /// Whether the sub-agent may see `declaration`. Sub-agent tools never pass.
    pub fn allows(&self, declaration: &ToolDeclaration) -> bool {
        if declaration.category.as_deref() == Some(SUBAGENT_CATEGORY) {
            return false;
        }
        let listed = || self.active_list().iter().any(|n| n == &declaration.name);
        match self.tool_filter_mode {
            ToolFilterMode::All => true,
            ToolFilterMode::BuiltinOnly => !declaration.is_mcp(),
            ToolFilterMode::McpOnly => declaration.is_mcp(),
            ToolFilterMode::Whitelist => listed(),
            ToolFilterMode::Blacklist => !listed(),
        }
    }
}

/// What a sub-agent run produced
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubAgentResult {
    pub text: String,

    /// Provider-reported version when available, else the configured model
    pub model_version: Option<String>,

    /// Model calls made
    pub steps: u32,

    pub tool_calls: Vec<ToolCall>,

    pub success: bool,

    pub cancelled: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubAgentResult {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            model_version: None,
            steps: 0,
            tool_calls: Vec::new(),
            success: false,
            cancelled: false,
            error: Some(error.into()),
        }
    }
}

/// Runs sub-agents against shared registries
pub struct SubAgentExecutor {
    adapters: Arc<AdapterRegistry>,
    transport: Arc<dyn Transport>,
    tools: Arc<ToolRegistry>,
    settings: Arc<dyn Settings>,
    approver: Arc<dyn ApprovalGate>,
}

impl SubAgentExecutor {
    pub fn new(
        adapters: Arc<AdapterRegistry>,
        transport: Arc<dyn Transport>,
        tools: Arc<ToolRegistry>,
        settings: Arc<dyn Settings>,
    ) -> Self {
        Self {
            adapters,
            transport,
            tools,
            settings,
            approver: Arc::new(AutoApprove),
        }
    }

    pub fn with_approver(mut self, approver: Arc<dyn ApprovalGate>) -> Self {
        self.approver = approver;
        self
    }

    /// Tool set for `config`
    pub fn resolve_tools(&self, config: &SubAgentConfig) -> ToolRegistry {
        self.tools.filtered(|d| config.allows(d))
    }

    /// Channel for `config`, with the model override applied
    pub fn resolve_channel(&self, config: &SubAgentConfig, parent: Option<&ChannelConfig>) -> Result<ChannelConfig> {
        let fallback = || {
            parent
                .cloned()
                .or_else(|| self.settings.default_channel())
                .ok_or_else(|| AgentError::Config("no channel available for sub-agent".into()))
        };
        let mut channel = match config.channel_id.as_deref() {
            None => fallback()?,
            Some(id) => match (self.settings.channel(id), config.missing_channel) {
                (Some(channel), _) => channel,
                (None, MissingChannelPolicy::FallbackToParent) => {
                    tracing::warn!(agent_type = %config.agent_type, channel = id, "sub-agent channel missing, using parent channel");
                    fallback()?
                }
                (None, MissingChannelPolicy::Fail) => {
                    return Err(AgentError::Config(format!(
                        "sub-agent '{}' targets unknown channel '{id}'",
                        config.agent_type
                    )));
                }
            },
        };
        if let Some(model) = &config.model {
            channel.model.clone_from(model);
        }
        Ok(channel)
    }

    /// Run `prompt` on a private conversation
    pub async fn execute(
        &self,
        config: &SubAgentConfig,
        prompt: &str,
        parent_channel: Option<&ChannelConfig>,
        cancel: CancellationToken,
    ) -> SubAgentResult {
        let channel = match self.resolve_channel(config, parent_channel) {
            Ok(channel) => channel,
            Err(e) => return SubAgentResult::failed(e.to_string()),
        };
        let configured_model = channel.model.clone();

        let mut loop_config = LoopConfig::default()
            .with_mode(config.mode.clone())
            .with_max_iterations(config.max_iterations)
            .with_max_runtime_seconds(config.max_runtime_seconds);
        loop_config.system_instruction.clone_from(&config.system_prompt);

        let runner = ToolExecutionLoop::builder()
            .adapters(self.adapters.clone())
            .transport(self.transport.clone())
            .tools(Arc::new(self.resolve_tools(config)))
            .store(Arc::new(MemoryConversationStore::new()))
            .settings(self.settings.clone())
            .approver(self.approver.clone())
            .config(loop_config)
            .build();
        let runner = match runner {
            Ok(runner) => runner,
            Err(e) => return SubAgentResult::failed(e.to_string()),
        };

        tracing::info!(agent_type = %config.agent_type, channel = %channel.id, model = %channel.model, "starting sub-agent");
        let (events, receiver) = mpsc::unbounded_channel();
        drop(receiver);
        let outcome = runner
            .send(&ConversationId::new(), prompt, channel, &events, cancel)
            .await;

        let error = outcome.error().map(str::to_string);
        SubAgentResult {
            text: outcome.text(),
            model_version: outcome.model_version.clone().or(Some(configured_model)),
            steps: outcome.iterations,
            success: outcome.is_completed(),
            cancelled: outcome.status == LoopStatus::Cancelled,
            tool_calls: outcome.tool_calls,
            error,
        }
    }
}

/// Exposes a sub-agent to the outer loop as a tool
pub struct SubAgentTool {
    executor: Arc<SubAgentExecutor>,
    config: SubAgentConfig,
}

impl SubAgentTool {
    pub fn new(executor: Arc<SubAgentExecutor>, config: SubAgentConfig) -> Self {
        Self { executor, config }
    }
}

#[async_trait]
impl Tool for SubAgentTool {
    fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration::new(
            self.config.tool_name(),
            self.config.description.clone(),
            json!({
                "type": "object",
                "properties": {
                    "prompt": {
                        "type": "string",
                        "description": "Task for the sub-agent"
                    }
                },
                "required": ["prompt"]
            }),
        )
        .with_category(SUBAGENT_CATEGORY)
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<Value> {
        let prompt = args
            .get("prompt")
            .and_then(Value::as_str)
            .ok_or_else(|| AgentError::ToolValidation("prompt must be a string".into()))?;

        let result = self
            .executor
            .execute(&self.config, prompt, ctx.channel.as_ref(), ctx.cancel.child_token())
            .await;
        if result.cancelled {
            return Err(AgentError::Cancelled);
        }
        if !result.success {
            return Err(AgentError::ToolExecution(
                result.error.unwrap_or_else(|| "sub-agent failed".into()),
            ));
        }
        Ok(serde_json::to_value(&result)?)
    }
}

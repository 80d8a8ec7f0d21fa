//! Application State

use std::sync::Arc;

use agent_core::{
    config::{ChannelConfig, Settings},
    error::{AgentError, Result},
    policy::Mode,
    provider::{AdapterRegistry, ChannelClient, Transport},
    reasoning::{ApprovalGate, LoopConfig, ToolExecutionLoop},
    session::MemoryConversationStore,
    tool::ToolRegistry,
};

use crate::approvals::{ActiveTurns, PendingApprovals};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Configured backend channels
    pub settings: Arc<dyn Settings>,

    /// One protocol adapter per backend family
    pub adapters: Arc<AdapterRegistry>,

    pub transport: Arc<dyn Transport>,

    /// Tool registry with all available tools
    pub tools: Arc<ToolRegistry>,

    /// Conversation histories
    pub store: Arc<MemoryConversationStore>,

    /// Confirmations waiting on a WebSocket client
    pub approvals: Arc<PendingApprovals>,

    /// Cancel handles of running turns
    pub turns: Arc<ActiveTurns>,

    /// Loop defaults; requests may override the mode
    pub loop_config: LoopConfig,
}

impl AppState {
    /// Channel by id (default channel when `None`) with an optional model override
    pub fn channel(&self, id: Option<&str>, model: Option<&str>) -> Result<ChannelConfig> {
        let channel = match id {
            Some(id) => self.settings.channel(id),
            None => self.settings.default_channel(),
        }
        .ok_or_else(|| AgentError::Config(format!("unknown channel: {}", id.unwrap_or("<default>"))))?;

        Ok(match model.filter(|m| !m.is_empty()) {
            Some(model) => channel.with_model(model),
            None => channel,
        })
    }

    pub fn client(&self, channel: ChannelConfig) -> Result<ChannelClient> {
        ChannelClient::new(&self.adapters, self.transport.clone(), channel)
    }

    /// Loop for one turn
    pub fn agent(&self, mode: Option<Mode>, approver: Arc<dyn ApprovalGate>) -> Result<ToolExecutionLoop> {
        let mut config = self.loop_config.clone();
        if let Some(mode) = mode {
            config.mode = mode;
        }
        ToolExecutionLoop::builder()
            .adapters(self.adapters.clone())
            .transport(self.transport.clone())
            .tools(self.tools.clone())
            .store(self.store.clone())
            .settings(self.settings.clone())
            .approver(approver)
            .config(config)
            .build()
    }
}

//! # agent-core
//!
//! Backend-agnostic agent core: a unified conversation model, protocol
//! adapter and transport seams, stream accumulation, tool policy and the
//! multi-turn tool-execution loop.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      ToolExecutionLoop                           │
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────────────┐  │
//! │  │   Stream     │  │  ToolPolicy  │  │  ProtocolAdapter       │  │
//! │  │ Accumulator  │──│  + Registry  │──│  (Strategy) + Transport│  │
//! │  └──────────────┘  └──────────────┘  └────────────────────────┘  │
//! │          │                 │                                     │
//! │          ▼                 ▼                                     │
//! │   StreamChunk events   SubAgentExecutor (nested loop as a tool)  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `ProtocolAdapter` trait enables swapping between Gemini, OpenAI,
//! OpenAI Responses and Anthropic backends without changing loop logic.

pub mod config;
pub mod error;
pub mod message;
pub mod policy;
pub mod provider;
pub mod reasoning;
pub mod session;
pub mod stream;
pub mod subagent;
pub mod tool;

#[cfg(test)]
mod testing;

pub use config::{ChannelConfig, ChannelType, Settings, StaticSettings};
pub use error::{AgentError, Result};
pub use message::{Content, Conversation, Part, Role};
pub use policy::{Mode, PolicyDecision, ToolPolicyContext};
pub use provider::{AdapterRegistry, ChannelClient, ChunkDelta, ProtocolAdapter, Transport};
pub use reasoning::{ApprovalGate, LoopConfig, LoopOutcome, LoopStatus, ToolExecutionLoop};
pub use session::{ConversationId, ConversationStore, MemoryConversationStore};
pub use stream::{EventRouter, StreamAccumulator, StreamChunk, StreamEvent};
pub use subagent::{SubAgentConfig, SubAgentExecutor, SubAgentResult, SubAgentTool};
pub use tool::{Tool, ToolCall, ToolCallStatus, ToolDeclaration, ToolOutcome, ToolRegistry};

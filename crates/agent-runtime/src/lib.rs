//! # agent-runtime
//!
//! Backend bindings for the agent core.
//!
//! ## Adapters
//!
//! - **Gemini**: `generateContent` / `streamGenerateContent`
//! - **OpenAI**: Chat Completions
//! - **OpenAI Responses**: the `/responses` API
//! - **Anthropic**: Messages API
//!
//! The adapters only translate. [`HttpTransport`] sends their requests with
//! `reqwest` and turns SSE bodies into JSON events.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_runtime::{default_adapters, HttpTransport};
//!
//! let adapters = default_adapters();
//! let client = ChannelClient::new(&adapters, Arc::new(HttpTransport::new()), channel)?;
//! let models = client.list_models().await?;
//! ```

pub mod anthropic;
pub mod common;
pub mod gemini;
pub mod http;
pub mod openai;
pub mod responses;
pub mod sse;

pub use anthropic::AnthropicAdapter;
pub use gemini::GeminiAdapter;
pub use http::HttpTransport;
pub use openai::OpenAiAdapter;
pub use responses::OpenAiResponsesAdapter;

// Re-export core types for convenience
pub use agent_core::{AdapterRegistry, AgentError, ChannelClient, ChannelConfig, ChannelType, ProtocolAdapter, Result};

/// Registry with every built-in adapter
pub fn default_adapters() -> AdapterRegistry {
    let mut adapters = AdapterRegistry::new();
    adapters.register(GeminiAdapter);
    adapters.register(OpenAiAdapter);
    adapters.register(OpenAiResponsesAdapter);
    adapters.register(AnthropicAdapter);
    adapters
}

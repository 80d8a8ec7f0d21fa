//! Channel Configuration
//!
//! Read-only view of the settings the loop needs: which backends exist, how
//! to reach them, and the tool policy per mode.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::{AgentError, Result};
use crate::policy::{Mode, ToolPolicyContext};
use crate::provider::{option_keys, GenerationOptions};

/// Backend family
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelType {
    Gemini,
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "openai-responses")]
    OpenAiResponses,
    Anthropic,
}

impl ChannelType {
    pub fn default_base_url(self) -> &'static str {
        match self {
            ChannelType::Gemini => "https://generativelanguage.googleapis.com/v1beta",
            ChannelType::OpenAi | ChannelType::OpenAiResponses => "https://api.openai.com/v1",
            ChannelType::Anthropic => "https://api.anthropic.com/v1",
        }
    }

    /// Whether `Authorization: Bearer` is the native auth placement
    pub fn bearer_by_default(self) -> bool {
        matches!(self, ChannelType::OpenAi | ChannelType::OpenAiResponses)
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelType::Gemini => write!(f, "gemini"),
            ChannelType::OpenAi => write!(f, "openai"),
            ChannelType::OpenAiResponses => write!(f, "openai-responses"),
            ChannelType::Anthropic => write!(f, "anthropic"),
        }
    }
}

impl std::str::FromStr for ChannelType {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" | "google" => Ok(ChannelType::Gemini),
            "openai" => Ok(ChannelType::OpenAi),
            "openai-responses" | "responses" => Ok(ChannelType::OpenAiResponses),
            "anthropic" | "claude" => Ok(ChannelType::Anthropic),
            other => Err(AgentError::Config(format!("unknown channel type: {other}"))),
        }
    }
}

/// One configured backend endpoint
///
/// When deserialized, a missing `baseUrl` or `useBearerAuth` takes the
/// channel type's default, same as [`ChannelConfig::new`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "ChannelConfigFields")]
pub struct ChannelConfig {
    pub id: String,

    #[serde(rename = "type")]
    pub channel_type: ChannelType,

    pub base_url: String,

    pub api_key: String,

    pub model: String,

    /// `Authorization: Bearer` instead of the backend's custom key header
    pub use_bearer_auth: bool,

    pub timeout_secs: u64,

    pub options: GenerationOptions,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelConfigFields {
    id: String,
    #[serde(rename = "type")]
    channel_type: ChannelType,
    #[serde(default)]
    base_url: Option<String>,
    api_key: String,
    model: String,
    #[serde(default)]
    use_bearer_auth: Option<bool>,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
    #[serde(default)]
    options: GenerationOptions,
}

impl From<ChannelConfigFields> for ChannelConfig {
    fn from(fields: ChannelConfigFields) -> Self {
        let mut channel = Self::new(fields.id, fields.channel_type, fields.api_key, fields.model);
        if let Some(base_url) = fields.base_url {
            channel.base_url = base_url;
        }
        if let Some(bearer) = fields.use_bearer_auth {
            channel.use_bearer_auth = bearer;
        }
        channel.timeout_secs = fields.timeout_secs;
        channel.options = fields.options;
        channel
    }
}

fn default_timeout_secs() -> u64 {
    600
}

/// Env-style boolean: `1`, `true`, `yes`, `on` in any case
fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

impl ChannelConfig {
    pub fn new(
        id: impl Into<String>,
        channel_type: ChannelType,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            channel_type,
            base_url: channel_type.default_base_url().into(),
            api_key: api_key.into(),
            model: model.into(),
            use_bearer_auth: channel_type.bearer_by_default(),
            timeout_secs: default_timeout_secs(),
            options: GenerationOptions::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_bearer_auth(mut self, bearer: bool) -> Self {
        self.use_bearer_auth = bearer;
        self
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    /// Read `<PREFIX>_TYPE`, `_API_KEY`, `_MODEL`, `_BASE_URL`,
    /// `_BEARER_AUTH`, `_TIMEOUT_SECS`, `_TEMPERATURE`, `_MAX_TOKENS`.
    pub fn from_env(prefix: &str) -> Result<Self> {
        let var = |name: &str| std::env::var(format!("{prefix}_{name}")).ok();
        let require = |name: &str| {
            var(name).ok_or_else(|| AgentError::Config(format!("{prefix}_{name} is not set")))
        };

        let channel_type: ChannelType = require("TYPE")?.parse()?;
        let mut channel = Self::new(
            prefix.to_ascii_lowercase(),
            channel_type,
            require("API_KEY")?,
            require("MODEL")?,
        );
        if let Some(url) = var("BASE_URL") {
            channel.base_url = url;
        }
        if let Some(flag) = var("BEARER_AUTH") {
            channel.use_bearer_auth = parse_flag(&flag);
        }
        if let Some(secs) = var("TIMEOUT_SECS").and_then(|s| s.parse().ok()) {
            channel.timeout_secs = secs;
        }
        if let Some(temp) = var("TEMPERATURE").and_then(|s| s.parse().ok()) {
            channel.options.temperature = Some(temp);
            channel.options.enabled.insert(option_keys::TEMPERATURE.into(), true);
        }
        if let Some(max) = var("MAX_TOKENS").and_then(|s| s.parse().ok()) {
            channel.options.max_tokens = Some(max);
            channel.options.enabled.insert(option_keys::MAX_TOKENS.into(), true);
        }
        Ok(channel)
    }
}

/// Settings collaborator: read-only from the loop's perspective
pub trait Settings: Send + Sync {
    /// Channel by id
    fn channel(&self, id: &str) -> Option<ChannelConfig>;

    /// Channel used when nothing else is selected
    fn default_channel(&self) -> Option<ChannelConfig>;

    /// All configured channels
    fn channels(&self) -> Vec<ChannelConfig>;

    /// Policy inputs for a mode
    fn policy_context(&self, mode: &Mode) -> ToolPolicyContext;
}

/// In-memory settings, typically built from the environment at startup
#[derive(Clone, Debug, Default)]
pub struct StaticSettings {
    channels: Vec<ChannelConfig>,
    default_channel: Option<String>,
    custom_dangerous: HashMap<String, HashSet<String>>,
}

impl StaticSettings {
    pub fn new(channels: Vec<ChannelConfig>) -> Self {
        Self {
            channels,
            ..Default::default()
        }
    }

    pub fn with_default_channel(mut self, id: impl Into<String>) -> Self {
        self.default_channel = Some(id.into());
        self
    }

    /// Dangerous-tool set for a custom mode
    pub fn with_custom_mode(mut self, mode: impl Into<String>, dangerous: HashSet<String>) -> Self {
        self.custom_dangerous.insert(mode.into(), dangerous);
        self
    }

    /// `AGENT_CHANNELS` lists env prefixes (default `DEFAULT`);
    /// `AGENT_DEFAULT_CHANNEL` picks the default by id.
    pub fn from_env() -> Result<Self> {
        let prefixes = std::env::var("AGENT_CHANNELS").unwrap_or_else(|_| "DEFAULT".into());
        let mut channels = Vec::new();
        for prefix in prefixes.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match ChannelConfig::from_env(prefix) {
                Ok(channel) => channels.push(channel),
                Err(e) => tracing::warn!(prefix, error = %e, "skipping channel"),
            }
        }
        let mut settings = Self::new(channels);
        settings.default_channel = std::env::var("AGENT_DEFAULT_CHANNEL").ok();
        Ok(settings)
    }
}

impl Settings for StaticSettings {
    fn channel(&self, id: &str) -> Option<ChannelConfig> {
        self.channels.iter().find(|c| c.id == id).cloned()
    }

    fn default_channel(&self) -> Option<ChannelConfig> {
        self.default_channel
            .as_deref()
            .and_then(|id| self.channel(id))
            .or_else(|| self.channels.first().cloned())
    }

    fn channels(&self) -> Vec<ChannelConfig> {
        self.channels.clone()
    }

    fn policy_context(&self, mode: &Mode) -> ToolPolicyContext {
        let ctx = ToolPolicyContext::new(mode.clone());
        match mode {
            Mode::Custom(name) => match self.custom_dangerous.get(name) {
                Some(set) => ctx.with_custom_dangerous(set.clone()),
                None => ctx,
            },
            _ => ctx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_defaults_by_type() {
        let gemini = ChannelConfig::new("g", ChannelType::Gemini, "k", "gemini-2.5-pro");
        let openai = ChannelConfig::new("o", ChannelType::OpenAi, "k", "gpt-4o");

        assert!(!gemini.use_bearer_auth);
        assert!(openai.use_bearer_auth);
        assert_eq!(openai.base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn test_deserialized_channel_uses_type_defaults() {
        let openai: ChannelConfig =
            serde_json::from_str(r#"{"id": "o", "type": "openai", "apiKey": "k", "model": "gpt-4o"}"#).unwrap();
        assert!(openai.use_bearer_auth);
        assert_eq!(openai.base_url, "https://api.openai.com/v1");
        assert_eq!(openai.timeout_secs, 600);

        let anthropic: ChannelConfig =
            serde_json::from_str(r#"{"id": "a", "type": "anthropic", "apiKey": "k", "model": "m"}"#).unwrap();
        assert!(!anthropic.use_bearer_auth);

        let explicit: ChannelConfig = serde_json::from_str(
            r#"{"id": "o", "type": "openai", "apiKey": "k", "model": "m", "useBearerAuth": false, "baseUrl": "http://gw"}"#,
        )
        .unwrap();
        assert!(!explicit.use_bearer_auth);
        assert_eq!(explicit.base_url, "http://gw");
    }

    #[test]
    fn test_flag_parsing_ignores_case() {
        assert!(parse_flag("TRUE"));
        assert!(parse_flag(" Yes "));
        assert!(parse_flag("1"));
        assert!(!parse_flag("off"));
        assert!(!parse_flag(""));
    }

    #[test]
    fn test_channel_type_parse() {
        assert_eq!("Responses".parse::<ChannelType>().unwrap(), ChannelType::OpenAiResponses);
        assert!("bogus".parse::<ChannelType>().is_err());
    }

    #[test]
    fn test_default_channel_falls_back_to_first() {
        let settings = StaticSettings::new(vec![
            ChannelConfig::new("a", ChannelType::Anthropic, "k", "m"),
            ChannelConfig::new("b", ChannelType::Gemini, "k", "m"),
        ]);
        assert_eq!(settings.default_channel().map(|c| c.id), Some("a".into()));

        let settings = settings.with_default_channel("b");
        assert_eq!(settings.default_channel().map(|c| c.id), Some("b".into()));
    }

    #[test]
    fn test_channel_type_serde_names() {
        let json = serde_json::to_string(&ChannelType::OpenAiResponses).unwrap();
        assert_eq!(json, "\"openai-responses\"");
    }
}

//! Helpers shared by the protocol adapters

use agent_core::config::ChannelConfig;
use agent_core::provider::{GenerationOptions, HttpRequestSpec};
use serde_json::{Map, Value};

/// Base URL without trailing slashes
pub fn normalize_base_url(base_url: &str) -> &str {
    base_url.trim().trim_end_matches('/')
}

/// Add the channel's key either as a bearer token or under `header`
pub fn with_auth(spec: HttpRequestSpec, channel: &ChannelConfig, header: &str) -> HttpRequestSpec {
    if channel.use_bearer_auth {
        spec.header("Authorization", format!("Bearer {}", channel.api_key))
    } else {
        spec.header(header, channel.api_key.clone())
    }
}

/// Write enabled options into `target` using the backend's field names.
///
/// Extension fields are copied verbatim under their own keys.
pub fn write_options(
    target: &mut Map<String, Value>,
    options: &GenerationOptions,
    temperature: &str,
    max_tokens: &str,
    top_p: &str,
) {
    if let Some(t) = options.temperature() {
        target.insert(temperature.into(), Value::from(f64::from(t)));
    }
    if let Some(m) = options.max_tokens() {
        target.insert(max_tokens.into(), Value::from(m));
    }
    if let Some(p) = options.top_p() {
        target.insert(top_p.into(), Value::from(f64::from(p)));
    }
    for (key, value) in options.enabled_extra() {
        target.insert(key.clone(), value.clone());
    }
}

/// Arguments rendered as a JSON string, as OpenAI-style wire formats expect
pub fn args_to_string(args: &Value) -> String {
    match args {
        Value::String(s) => s.clone(),
        Value::Null => "{}".into(),
        other => other.to_string(),
    }
}

/// Parse a JSON-encoded arguments string; blank means no arguments
pub fn args_from_str(raw: &str) -> Option<Value> {
    if raw.trim().is_empty() {
        return Some(Value::Object(Map::new()));
    }
    serde_json::from_str(raw).ok()
}

/// Tool result as a string payload
pub fn response_to_string(response: &Value) -> String {
    match response {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::config::ChannelType;
    use agent_core::provider::option_keys;
    use serde_json::json;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("https://api.example.com/v1/"), "https://api.example.com/v1");
        assert_eq!(normalize_base_url("http://x//"), "http://x");
    }

    #[test]
    fn test_auth_placement_follows_flag() {
        let channel = ChannelConfig::new("a", ChannelType::Anthropic, "secret", "m");
        let spec = with_auth(HttpRequestSpec::get("http://x"), &channel, "x-api-key");
        assert_eq!(spec.header_value("x-api-key"), Some("secret"));
        assert_eq!(spec.header_value("authorization"), None);

        let channel = channel.with_bearer_auth(true);
        let spec = with_auth(HttpRequestSpec::get("http://x"), &channel, "x-api-key");
        assert_eq!(spec.header_value("authorization"), Some("Bearer secret"));
    }

    #[test]
    fn test_only_enabled_options_are_written() {
        let mut options = GenerationOptions {
            temperature: Some(0.5),
            max_tokens: Some(100),
            top_p: Some(0.9),
            ..Default::default()
        };
        options.extra.insert("seed".into(), json!(3));
        options.extra.insert("logprobs".into(), json!(true));
        let options = options.enable(option_keys::MAX_TOKENS).enable("seed");

        let mut body = Map::new();
        write_options(&mut body, &options, "temperature", "max_tokens", "top_p");

        assert_eq!(Value::Object(body), json!({ "max_tokens": 100, "seed": 3 }));
    }

    #[test]
    fn test_args_from_str() {
        assert_eq!(args_from_str(""), Some(json!({})));
        assert_eq!(args_from_str("{\"a\":1}"), Some(json!({"a": 1})));
        assert_eq!(args_from_str("{\"a\":"), None);
    }
}

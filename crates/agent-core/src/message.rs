//! Conversation Content
//!
//! Unified turn model shared by every backend adapter. A [`Content`] is one
//! turn segment; a conversation history is an append-only `Vec<Content>`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use crate::provider::{FinishReason, TokenUsage};

/// Role of a turn segment
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// User input or injected context
    User,
    /// Model output
    Assistant,
    /// Tool results fed back to the model
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// One ordered piece of a [`Content`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Part {
    Text {
        text: String,
    },
    FunctionCall {
        id: String,
        name: String,
        args: Value,
    },
    FunctionResponse {
        id: String,
        name: String,
        response: Value,
        /// The tool failed (or was denied); `response` carries the error
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Call id for function call/response parts
    pub fn call_id(&self) -> Option<&str> {
        match self {
            Part::FunctionCall { id, .. } | Part::FunctionResponse { id, .. } => Some(id),
            Part::Text { .. } => None,
        }
    }
}

/// Per-content bookkeeping reported by the backend
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,

    /// Model version the backend says actually produced this content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

/// A single turn segment
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    pub role: Role,

    pub parts: Vec<Part>,

    /// Marks segments typed by the user (as opposed to injected context)
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_user_input: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ContentMetadata>,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Content {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            parts: Vec::new(),
            is_user_input: false,
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    /// User-typed text
    pub fn user(text: impl Into<String>) -> Self {
        let mut content = Self::new(Role::User).with_text(text);
        content.is_user_input = true;
        content
    }

    /// Assistant text
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant).with_text(text)
    }

    /// Tool-role content carrying function responses
    pub fn tool_responses(parts: Vec<Part>) -> Self {
        Self {
            parts,
            ..Self::new(Role::Tool)
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.parts.push(Part::text(text));
        self
    }

    pub fn with_function_call(mut self, id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        self.parts.push(Part::FunctionCall {
            id: id.into(),
            name: name.into(),
            args,
        });
        self
    }

    pub fn with_metadata(mut self, metadata: ContentMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Concatenated text of all text parts
    pub fn text(&self) -> String {
        self.parts.iter().filter_map(Part::as_text).collect()
    }

    pub fn function_calls(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.parts.iter().filter_map(|p| match p {
            Part::FunctionCall { id, name, args } => Some((id.as_str(), name.as_str(), args)),
            _ => None,
        })
    }

    pub fn has_function_calls(&self) -> bool {
        self.function_calls().next().is_some()
    }

    pub fn usage(&self) -> Option<&TokenUsage> {
        self.metadata.as_ref().and_then(|m| m.usage.as_ref())
    }

    pub fn model_version(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.model_version.as_deref())
    }
}

/// Start index of the trailing contiguous run of user-input contents.
///
/// Dynamic prompt material is injected immediately before this index. `None`
/// means the history does not end in user input and callers append instead.
pub fn insertion_point(history: &[Content]) -> Option<usize> {
    let mut start = None;
    for (idx, content) in history.iter().enumerate().rev() {
        if content.is_user_input {
            start = Some(idx);
        } else {
            break;
        }
    }
    start
}

/// Copy of `history` with `context` inserted as a non-user-input user turn
/// at the insertion point (or appended when there is none).
pub fn inject_dynamic_context(history: &[Content], context: &str) -> Vec<Content> {
    let mut contents = history.to_vec();
    if context.trim().is_empty() {
        return contents;
    }
    let injected = Content::new(Role::User).with_text(context);
    match insertion_point(&contents) {
        Some(idx) => contents.insert(idx, injected),
        None => contents.push(injected),
    }
    contents
}

/// Ids that already have a function response somewhere in `history`
pub fn answered_call_ids(history: &[Content]) -> HashSet<String> {
    history
        .iter()
        .flat_map(|c| c.parts.iter())
        .filter_map(|p| match p {
            Part::FunctionResponse { id, .. } => Some(id.clone()),
            _ => None,
        })
        .collect()
}

/// Drop responses whose call id is already answered in `history` (or repeated
/// within `responses`), keeping the original order.
pub fn dedupe_function_responses(history: &[Content], responses: Vec<Part>) -> Vec<Part> {
    let mut seen = answered_call_ids(history);
    responses
        .into_iter()
        .filter(|part| match part {
            Part::FunctionResponse { id, .. } => seen.insert(id.clone()),
            _ => false,
        })
        .collect()
}

/// Append-only conversation history
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Conversation {
    contents: Vec<Content>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_contents(contents: Vec<Content>) -> Self {
        Self { contents }
    }

    /// Append a content
    pub fn push(&mut self, content: Content) {
        self.contents.push(content);
    }

    /// Append function responses, skipping ids already answered.
    ///
    /// Returns the number of responses actually appended.
    pub fn merge_function_responses(&mut self, responses: Vec<Part>) -> usize {
        let fresh = dedupe_function_responses(&self.contents, responses);
        let count = fresh.len();
        if count > 0 {
            self.contents.push(Content::tool_responses(fresh));
        }
        count
    }

    pub fn contents(&self) -> &[Content] {
        &self.contents
    }

    pub fn last(&self) -> Option<&Content> {
        self.contents.last()
    }

    pub fn len(&self) -> usize {
        self.contents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }
}

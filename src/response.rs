use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorCode;

/// A single block of content inside a [`ToolResponse`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text { text: String },
    Image { data: String, #[serde(rename = "mimeType")] mime_type: String },
    Audio { data: String, #[serde(rename = "mimeType")] mime_type: String },
    #[serde(rename = "resource")]
    Resource { resource: EmbeddedResource },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddedResource {
    pub uri: String,
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// The canonical structured error payload carried in an error response's
/// first text block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(rename = "availableActions", skip_serializing_if = "Option::is_none")]
    pub available_actions: Option<Vec<String>>,
}

/// The uniform response envelope returned by every dispatch call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResponse {
    pub content: Vec<ContentBlock>,
    #[serde(rename = "isError", skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl ToolResponse {
    /// Wrap a single text block as a successful response.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            is_error: None,
        }
    }

    /// The Rust-idiomatic rendering of "handler returned nothing": a single
    /// empty text block, not a `null` value and not an error. See open
    /// question #3 in DESIGN.md.
    pub fn empty() -> Self {
        Self::text(String::new())
    }

    /// Wrap an arbitrary JSON value that is not already a response envelope,
    /// per the "implicit success wrapping" rule in the dispatch contract.
    pub fn implicit(value: Value) -> Self {
        match value {
            Value::Null => Self::empty(),
            Value::String(s) => Self::text(s),
            other => Self::text(other.to_string()),
        }
    }

    pub fn error(
        code: ErrorCode,
        message: impl Into<String>,
        suggestion: Option<String>,
        available_actions: Option<Vec<String>>,
    ) -> Self {
        let payload = ErrorPayload {
            code: code.as_str().to_string(),
            message: message.into(),
            suggestion,
            available_actions,
        };
        let text = serde_json::to_string(&payload)
            .unwrap_or_else(|_| format!("{{\"code\":\"{}\",\"message\":\"serialization failed\"}}", code));
        Self {
            content: vec![ContentBlock::text(text)],
            is_error: Some(true),
        }
    }

    pub fn is_error(&self) -> bool {
        self.is_error.unwrap_or(false)
    }

    /// Re-parses the canonical structured error payload out of the first
    /// content block, for callers (e.g. the contract-awareness hook) that
    /// need to branch on the error kind without threading it through as a
    /// side channel. `None` for non-error responses or a malformed payload.
    pub fn error_code(&self) -> Option<String> {
        if !self.is_error() {
            return None;
        }
        let ContentBlock::Text { text } = self.content.first()? else {
            return None;
        };
        serde_json::from_str::<Value>(text).ok()?.get("code")?.as_str().map(String::from)
    }

    /// Whether this response should be treated as non-empty content for
    /// wire purposes (spec requires `content` be non-empty).
    pub fn ensure_non_empty(mut self) -> Self {
        if self.content.is_empty() {
            self.content.push(ContentBlock::text(String::new()));
        }
        self
    }
}

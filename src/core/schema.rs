//! Typed shapes for every externally sourced payload.
//!
//! Values of these types only come out of [`crate::core::validate`]; internal
//! logic never inspects raw JSON. Serializing a value reproduces the wire
//! spelling the validator accepts, so validation of the serialized form
//! yields an equal value.

use serde::Serialize;
use serde_json::{Map, Value};

/// A validated model response (one merged `generateContent` result).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelResponse {
    pub candidates: Vec<Candidate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<CandidateContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safety_response: Option<SafetyResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<Part>,
}

/// The safety gate attached to a candidate. When `require_confirmation` is
/// set, browser actions of that response wait for the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyResponse {
    pub require_confirmation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
}

/// One content part. Exactly one discriminating key is present on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Part {
    #[serde(rename = "text")]
    Text(String),
    #[serde(rename = "functionCall")]
    FunctionCall(FunctionCall),
    #[serde(rename = "function_response")]
    FunctionResponse(Value),
    #[serde(rename = "inline_data")]
    InlineData(InlineData),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionCall {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub args: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

impl ModelResponse {
    pub fn primary(&self) -> Option<&Candidate> {
        self.candidates.first()
    }

    pub fn block_reason(&self) -> Option<&str> {
        self.prompt_feedback
            .as_ref()
            .and_then(|feedback| feedback.block_reason.as_deref())
            .filter(|reason| !reason.trim().is_empty())
    }
}

impl Candidate {
    pub fn parts(&self) -> &[Part] {
        self.content
            .as_ref()
            .map(|content| content.parts.as_slice())
            .unwrap_or(&[])
    }

    /// Concatenated text of every text part, in order.
    pub fn text(&self) -> String {
        self.parts()
            .iter()
            .filter_map(|part| match part {
                Part::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Function calls in emission order.
    pub fn function_calls(&self) -> Vec<&FunctionCall> {
        self.parts()
            .iter()
            .filter_map(|part| match part {
                Part::FunctionCall(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    pub fn requires_confirmation(&self) -> bool {
        self.safety_response
            .as_ref()
            .is_some_and(|safety| safety.require_confirmation)
    }
}

/// A validated session-bootstrap response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionPayload {
    pub session_id: String,
    pub chat_session_mcp_url: String,
    #[serde(rename = "tool_router_instance_mcp_url")]
    pub tool_router_mcp_url: String,
    #[serde(rename = "expires_in", skip_serializing_if = "Option::is_none")]
    pub expires_in_secs: Option<u64>,
    #[serde(rename = "expires_at", skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<i64>,
}

/// Element geometry reported by the content script.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElementBounds {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

/// A validated browser action result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub element: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub element_bounds: Option<ElementBounds>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
}

/// A validated screenshot result. `screenshot` is always an image data URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScreenshotResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
}

/// The generic MCP `tools/call` result envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolEnvelope {
    pub content: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Map<String, Value>>,
}

impl ToolEnvelope {
    pub fn is_error(&self) -> bool {
        self.is_error.unwrap_or(false)
    }
}

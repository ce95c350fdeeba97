use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /// Role name on the model wire.
    pub fn to_api_role(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "model",
        }
    }

    pub fn is_user(self) -> bool {
        self == Role::User
    }

    pub fn is_assistant(self) -> bool {
        self == Role::Assistant
    }
}

impl TryFrom<&str> for Role {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "user" => Ok(Role::User),
            "assistant" | "model" => Ok(Role::Assistant),
            _ => Err(format!("invalid message role: {value}")),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl From<Role> for String {
    fn from(value: Role) -> Self {
        value.as_str().to_string()
    }
}

/// A function call issued by the model, materialized on an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolResultStatus {
    Success,
    Error,
    Denied,
    Blocked,
}

impl ToolResultStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolResultStatus::Success => "success",
            ToolResultStatus::Error => "error",
            ToolResultStatus::Denied => "denied",
            ToolResultStatus::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFailureKind {
    UnknownTool,
    /// The tool ran and reported failure.
    ToolError,
    /// The tool could not be invoked at all.
    ToolCallFailure,
    Timeout,
    InvalidResult,
    Cancelled,
}

impl ToolFailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolFailureKind::UnknownTool => "unknown_tool",
            ToolFailureKind::ToolError => "tool_error",
            ToolFailureKind::ToolCallFailure => "tool_call_failure",
            ToolFailureKind::Timeout => "timeout",
            ToolFailureKind::InvalidResult => "invalid_result",
            ToolFailureKind::Cancelled => "cancelled",
        }
    }
}

/// The observation for exactly one prior [`ToolCall`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub tool_name: String,
    pub status: ToolResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<ToolFailureKind>,
    pub result: Value,
}

impl ToolResult {
    pub fn success(call: &ToolCall, result: Value) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            status: ToolResultStatus::Success,
            failure_kind: None,
            result,
        }
    }

    pub fn failure(call: &ToolCall, kind: ToolFailureKind, message: impl Into<String>) -> Self {
        Self::failure_with_payload(call, kind, json!({ "error": message.into() }))
    }

    pub fn failure_with_payload(call: &ToolCall, kind: ToolFailureKind, payload: Value) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            status: ToolResultStatus::Error,
            failure_kind: Some(kind),
            result: payload,
        }
    }

    pub fn unknown_tool(call: &ToolCall) -> Self {
        Self::failure_with_payload(
            call,
            ToolFailureKind::UnknownTool,
            json!({
                "error": format!("Unknown tool: {}", call.name),
                "tool": call.name,
            }),
        )
    }

    pub fn denied(call: &ToolCall, message: impl Into<String>) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            status: ToolResultStatus::Denied,
            failure_kind: None,
            result: json!({ "error": message.into() }),
        }
    }

    pub fn blocked(call: &ToolCall, message: impl Into<String>) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            status: ToolResultStatus::Blocked,
            failure_kind: None,
            result: json!({ "error": message.into() }),
        }
    }

    pub fn cancelled(call: &ToolCall) -> Self {
        Self::failure(call, ToolFailureKind::Cancelled, "Turn was cancelled.")
    }

    pub fn is_success(&self) -> bool {
        self.status == ToolResultStatus::Success
    }

    /// The object handed back to the model as the function response.
    pub fn to_function_response(&self) -> Value {
        let mut response = Map::new();
        response.insert("status".to_string(), json!(self.status.as_str()));
        if let Some(kind) = self.failure_kind {
            response.insert("failure_kind".to_string(), json!(kind.as_str()));
        }
        response.insert("result".to_string(), self.result.clone());
        Value::Object(response)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_results: Option<Vec<ToolResult>>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            role: Role::User,
            content: content.into(),
            tool_calls: None,
            tool_results: None,
        }
    }

    /// The empty in-progress assistant message of a model round.
    pub fn assistant_placeholder() -> Self {
        Self {
            id: new_message_id(),
            role: Role::Assistant,
            content: String::new(),
            tool_calls: None,
            tool_results: None,
        }
    }

    /// Follow-up user message carrying one round's tool results.
    pub fn tool_results(results: Vec<ToolResult>) -> Self {
        Self {
            id: new_message_id(),
            role: Role::User,
            content: String::new(),
            tool_calls: None,
            tool_results: Some(results),
        }
    }

    pub fn calls(&self) -> &[ToolCall] {
        self.tool_calls.as_deref().unwrap_or(&[])
    }

    pub fn results(&self) -> &[ToolResult] {
        self.tool_results.as_deref().unwrap_or(&[])
    }

    /// True for an assistant message that never received content or calls.
    pub fn is_empty_assistant(&self) -> bool {
        self.role.is_assistant() && self.content.is_empty() && self.calls().is_empty()
    }
}

pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn new_tool_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str) -> ToolCall {
        ToolCall {
            id: "call-1".to_string(),
            name: name.to_string(),
            parameters: Map::new(),
        }
    }

    #[test]
    fn role_round_trips_through_strings() {
        assert_eq!(Role::try_from("model"), Ok(Role::Assistant));
        assert_eq!(String::from(Role::Assistant), "assistant");
        assert_eq!(Role::Assistant.to_api_role(), "model");
        assert!(Role::try_from("system").is_err());
    }

    #[test]
    fn unknown_tool_result_names_the_tool() {
        let result = ToolResult::unknown_tool(&call("teleport"));
        assert_eq!(result.status, ToolResultStatus::Error);
        assert_eq!(result.failure_kind, Some(ToolFailureKind::UnknownTool));
        assert_eq!(result.result["tool"], "teleport");
        assert_eq!(result.result["error"], "Unknown tool: teleport");
    }

    #[test]
    fn function_response_carries_status_and_kind() {
        let response =
            ToolResult::failure(&call("click"), ToolFailureKind::Timeout, "slow").to_function_response();
        assert_eq!(
            response,
            json!({"status": "error", "failure_kind": "timeout", "result": {"error": "slow"}})
        );

        let ok = ToolResult::success(&call("click"), json!({"success": true})).to_function_response();
        assert_eq!(ok, json!({"status": "success", "result": {"success": true}}));
    }

    #[test]
    fn placeholder_is_empty_assistant_until_filled() {
        let mut message = Message::assistant_placeholder();
        assert!(message.is_empty_assistant());
        message.content = "done".to_string();
        assert!(!message.is_empty_assistant());
        assert!(!Message::user("").is_empty_assistant());
    }

    #[test]
    fn tool_call_ids_are_distinct() {
        assert_ne!(new_tool_call_id(), new_tool_call_id());
    }
}

//! Model wire payloads and the model collaborator seam.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::core::message::Message;
use crate::core::page::PageContext;
use crate::core::settings::Settings;

pub mod gemini;

/// One tool advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Everything the model sees for one round.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub messages: Vec<Message>,
    pub page_context: Option<PageContext>,
    pub tools: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("Model request failed: {0}")]
    Transport(String),
    #[error("{0}")]
    Api(String),
    #[error("Model stream failed: {0}")]
    Stream(String),
}

/// The streaming model API. Returns the raw merged response; the caller
/// validates it.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn generate(&self, settings: &Settings, request: &ModelRequest)
        -> Result<Value, ModelError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDeclarations>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<RequestPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestPart {
    Text(String),
    FunctionCall(FunctionCallPayload),
    FunctionResponse(FunctionResponsePayload),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionCallPayload {
    pub id: String,
    pub name: String,
    pub args: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionResponsePayload {
    pub id: String,
    pub name: String,
    pub response: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDeclarations {
    pub function_declarations: Vec<FunctionDeclaration>,
}

/// Keys the model API rejects inside function parameter schemas.
const UNSUPPORTED_SCHEMA_KEYS: &[&str] = &["$schema", "$id", "additionalProperties", "$defs"];

/// Strip JSON Schema keywords the function-declaration dialect rejects.
pub fn sanitize_parameters(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !UNSUPPORTED_SCHEMA_KEYS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), sanitize_parameters(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_parameters).collect()),
        other => other.clone(),
    }
}

impl GenerateContentRequest {
    pub fn from_model_request(request: &ModelRequest) -> Self {
        let contents = request
            .messages
            .iter()
            .filter_map(message_content)
            .collect();

        let system_instruction = request.page_context.as_ref().map(|page| Content {
            role: None,
            parts: vec![RequestPart::Text(page.to_prompt_section())],
        });

        let tools = if request.tools.is_empty() {
            Vec::new()
        } else {
            vec![ToolDeclarations {
                function_declarations: request.tools.clone(),
            }]
        };

        Self {
            contents,
            system_instruction,
            tools,
        }
    }
}

fn message_content(message: &Message) -> Option<Content> {
    let mut parts = Vec::new();
    if !message.content.is_empty() {
        parts.push(RequestPart::Text(message.content.clone()));
    }
    for call in message.calls() {
        parts.push(RequestPart::FunctionCall(FunctionCallPayload {
            id: call.id.clone(),
            name: call.name.clone(),
            args: call.parameters.clone(),
        }));
    }
    for result in message.results() {
        parts.push(RequestPart::FunctionResponse(FunctionResponsePayload {
            id: result.tool_call_id.clone(),
            name: result.tool_name.clone(),
            response: result.to_function_response(),
        }));
    }

    if parts.is_empty() {
        return None;
    }
    Some(Content {
        role: Some(message.role.to_api_role().to_string()),
        parts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::{ToolCall, ToolResult};
    use serde_json::json;

    #[test]
    fn request_maps_transcript_to_contents() {
        let call = ToolCall {
            id: "call-1".to_string(),
            name: "click".to_string(),
            parameters: json!({"selector": "#submit"}).as_object().cloned().unwrap(),
        };
        let mut assistant = Message::assistant_placeholder();
        assistant.content = "Clicking.".to_string();
        assistant.tool_calls = Some(vec![call.clone()]);
        let messages = vec![
            Message::user("Submit the form"),
            assistant,
            Message::tool_results(vec![ToolResult::success(&call, json!({"success": true}))]),
            Message::assistant_placeholder(),
        ];

        let request = GenerateContentRequest::from_model_request(&ModelRequest {
            messages,
            page_context: None,
            tools: Vec::new(),
        });
        let wire = serde_json::to_value(&request).unwrap();

        assert_eq!(
            wire,
            json!({
                "contents": [
                    {"role": "user", "parts": [{"text": "Submit the form"}]},
                    {"role": "model", "parts": [
                        {"text": "Clicking."},
                        {"functionCall": {"id": "call-1", "name": "click", "args": {"selector": "#submit"}}}
                    ]},
                    {"role": "user", "parts": [
                        {"functionResponse": {"id": "call-1", "name": "click", "response": {
                            "status": "success", "result": {"success": true}
                        }}}
                    ]}
                ]
            })
        );
    }

    #[test]
    fn tools_and_page_context_are_attached() {
        let page = crate::core::page::PageContext {
            url: "https://example.com".to_string(),
            title: "Example".to_string(),
            text_content: "Hello".to_string(),
            links: Vec::new(),
            images: Vec::new(),
            forms: Vec::new(),
            metadata: Default::default(),
            viewport: None,
        };
        let request = GenerateContentRequest::from_model_request(&ModelRequest {
            messages: vec![Message::user("hi")],
            page_context: Some(page),
            tools: vec![FunctionDeclaration {
                name: "wait".to_string(),
                description: "Wait.".to_string(),
                parameters: json!({"type": "object", "properties": {}}),
            }],
        });
        let wire = serde_json::to_value(&request).unwrap();

        assert_eq!(wire["tools"][0]["functionDeclarations"][0]["name"], "wait");
        let instruction = wire["systemInstruction"]["parts"][0]["text"].as_str().unwrap();
        assert!(instruction.contains("URL: https://example.com"));
        assert!(wire["systemInstruction"].get("role").is_none());
    }

    #[test]
    fn sanitize_parameters_strips_unsupported_keywords_recursively() {
        let schema = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "filters": {"type": "object", "additionalProperties": {"type": "string"}}
            }
        });
        assert_eq!(
            sanitize_parameters(&schema),
            json!({
                "type": "object",
                "properties": {"filters": {"type": "object"}}
            })
        );
    }
}

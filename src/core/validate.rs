//! Runtime contract checks for payloads that cross a trust boundary.
//!
//! Every function here is pure: it takes a borrowed [`Value`] and returns
//! either a typed value from [`crate::core::schema`] / [`crate::core::page`]
//! or a [`ValidationError`] naming the schema and the offending field path.

use std::fmt;

use base64::Engine;
use serde_json::{Map, Value};
use tracing::warn;

use crate::core::page::{
    FormInput, PageContext, PageForm, PageImage, PageLink, PageMetadata, Viewport,
};
use crate::core::schema::{
    ActionResponse, Candidate, CandidateContent, ElementBounds, FunctionCall, InlineData,
    ModelResponse, Part, PromptFeedback, SafetyResponse, ScreenshotResponse, SessionPayload,
    ToolEnvelope,
};
use crate::utils::url::parse_absolute_http_url;

/// Names of the payload contracts the validator knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaName {
    ModelResponse,
    SessionBootstrap,
    PageContext,
    ActionResult,
    ScreenshotResult,
    ToolEnvelope,
    ToolArguments,
}

impl SchemaName {
    pub fn as_str(self) -> &'static str {
        match self {
            SchemaName::ModelResponse => "model response",
            SchemaName::SessionBootstrap => "session bootstrap",
            SchemaName::PageContext => "page context",
            SchemaName::ActionResult => "action result",
            SchemaName::ScreenshotResult => "screenshot result",
            SchemaName::ToolEnvelope => "tool result envelope",
            SchemaName::ToolArguments => "tool arguments",
        }
    }
}

impl fmt::Display for SchemaName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {schema} at {path}: {message}")]
pub struct ValidationError {
    pub schema: SchemaName,
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
struct FieldPath(String);

impl FieldPath {
    fn root() -> Self {
        Self::default()
    }

    fn field(&self, name: &str) -> Self {
        if self.0.is_empty() {
            Self(name.to_string())
        } else {
            Self(format!("{}.{}", self.0, name))
        }
    }

    fn index(&self, index: usize) -> Self {
        Self(format!("{}[{}]", self.0, index))
    }

    fn render(&self) -> String {
        if self.0.is_empty() {
            "<root>".to_string()
        } else {
            self.0.clone()
        }
    }
}

struct Checker {
    schema: SchemaName,
}

impl Checker {
    fn new(schema: SchemaName) -> Self {
        Self { schema }
    }

    fn error(&self, path: &FieldPath, message: impl Into<String>) -> ValidationError {
        ValidationError {
            schema: self.schema,
            path: path.render(),
            message: message.into(),
        }
    }

    fn object<'a>(
        &self,
        value: &'a Value,
        path: &FieldPath,
    ) -> Result<&'a Map<String, Value>, ValidationError> {
        value
            .as_object()
            .ok_or_else(|| self.error(path, format!("expected object, got {}", kind(value))))
    }

    fn array<'a>(&self, value: &'a Value, path: &FieldPath) -> Result<&'a [Value], ValidationError> {
        value
            .as_array()
            .map(Vec::as_slice)
            .ok_or_else(|| self.error(path, format!("expected array, got {}", kind(value))))
    }

    fn string(&self, value: &Value, path: &FieldPath) -> Result<String, ValidationError> {
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| self.error(path, format!("expected string, got {}", kind(value))))
    }

    fn boolean(&self, value: &Value, path: &FieldPath) -> Result<bool, ValidationError> {
        value
            .as_bool()
            .ok_or_else(|| self.error(path, format!("expected boolean, got {}", kind(value))))
    }

    fn number(&self, value: &Value, path: &FieldPath) -> Result<f64, ValidationError> {
        value
            .as_f64()
            .ok_or_else(|| self.error(path, format!("expected number, got {}", kind(value))))
    }

    fn required<'a>(
        &self,
        map: &'a Map<String, Value>,
        key: &str,
        path: &FieldPath,
    ) -> Result<&'a Value, ValidationError> {
        optional(map, key).ok_or_else(|| self.error(&path.field(key), "is required"))
    }

    fn required_string(
        &self,
        map: &Map<String, Value>,
        key: &str,
        path: &FieldPath,
    ) -> Result<String, ValidationError> {
        let value = self.required(map, key, path)?;
        self.string(value, &path.field(key))
    }

    fn optional_string(
        &self,
        map: &Map<String, Value>,
        key: &str,
        path: &FieldPath,
    ) -> Result<Option<String>, ValidationError> {
        optional(map, key)
            .map(|value| self.string(value, &path.field(key)))
            .transpose()
    }

    fn required_number(
        &self,
        map: &Map<String, Value>,
        key: &str,
        path: &FieldPath,
    ) -> Result<f64, ValidationError> {
        let value = self.required(map, key, path)?;
        self.number(value, &path.field(key))
    }

    fn positive_number(
        &self,
        map: &Map<String, Value>,
        key: &str,
        path: &FieldPath,
    ) -> Result<f64, ValidationError> {
        let number = self.required_number(map, key, path)?;
        if number > 0.0 {
            Ok(number)
        } else {
            Err(self.error(&path.field(key), "must be positive"))
        }
    }

    /// Absent arrays default to empty.
    fn optional_array<'a>(
        &self,
        map: &'a Map<String, Value>,
        key: &str,
        path: &FieldPath,
    ) -> Result<&'a [Value], ValidationError> {
        match optional(map, key) {
            Some(value) => self.array(value, &path.field(key)),
            None => Ok(&[]),
        }
    }

    fn http_url(
        &self,
        map: &Map<String, Value>,
        key: &str,
        path: &FieldPath,
    ) -> Result<String, ValidationError> {
        let raw = self.required_string(map, key, path)?;
        parse_absolute_http_url(&raw).map_err(|message| self.error(&path.field(key), message))?;
        Ok(raw)
    }
}

/// Null is treated the same as an absent key.
fn optional<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    map.get(key).filter(|value| !value.is_null())
}

/// First present spelling of a key that the wire may emit in either case.
fn either<'a>(map: &'a Map<String, Value>, camel: &'a str, snake: &'a str) -> Option<&'a str> {
    if optional(map, camel).is_some() {
        Some(camel)
    } else if optional(map, snake).is_some() {
        Some(snake)
    } else {
        None
    }
}

/// Reasoning the model emits alongside its reply; never part of the reply.
fn is_thought(part: &Value) -> bool {
    part.get("thought").and_then(Value::as_bool).unwrap_or(false)
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub fn validate_model_response(value: &Value) -> Result<ModelResponse, ValidationError> {
    let checker = Checker::new(SchemaName::ModelResponse);
    let root = FieldPath::root();
    let map = checker.object(value, &root)?;

    let candidates_path = root.field("candidates");
    let candidates = checker
        .optional_array(map, "candidates", &root)?
        .iter()
        .enumerate()
        .map(|(index, candidate)| {
            validate_candidate(&checker, candidate, &candidates_path.index(index))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let prompt_feedback = match either(map, "promptFeedback", "prompt_feedback") {
        Some(key) => {
            let path = root.field(key);
            let feedback = checker.object(&map[key], &path)?;
            let block_reason = match either(feedback, "blockReason", "block_reason") {
                Some(reason_key) => Some(checker.string(&feedback[reason_key], &path.field(reason_key))?),
                None => None,
            };
            Some(PromptFeedback { block_reason })
        }
        None => None,
    };

    Ok(ModelResponse {
        candidates,
        prompt_feedback,
    })
}

fn validate_candidate(
    checker: &Checker,
    value: &Value,
    path: &FieldPath,
) -> Result<Candidate, ValidationError> {
    let map = checker.object(value, path)?;

    let content = match optional(map, "content") {
        Some(content) => {
            let content_path = path.field("content");
            let content_map = checker.object(content, &content_path)?;
            let role = checker.optional_string(content_map, "role", &content_path)?;
            let parts_path = content_path.field("parts");
            let parts = checker
                .optional_array(content_map, "parts", &content_path)?
                .iter()
                .enumerate()
                .filter(|(_, part)| !is_thought(part))
                .map(|(index, part)| validate_part(checker, part, &parts_path.index(index)))
                .collect::<Result<Vec<_>, _>>()?;
            Some(CandidateContent { role, parts })
        }
        None => None,
    };

    let finish_reason = match either(map, "finishReason", "finish_reason") {
        Some(key) => Some(checker.string(&map[key], &path.field(key))?),
        None => None,
    };

    let safety_response = match either(map, "safetyResponse", "safety_response") {
        Some(key) => {
            let safety_path = path.field(key);
            let safety = checker.object(&map[key], &safety_path)?;
            let confirm_key =
                either(safety, "requireConfirmation", "require_confirmation")
                    .unwrap_or("requireConfirmation");
            let require_confirmation =
                checker.boolean(checker.required(safety, confirm_key, &safety_path)?, &safety_path.field(confirm_key))?;
            let message = checker.optional_string(safety, "message", &safety_path)?;
            Some(SafetyResponse {
                require_confirmation,
                message,
            })
        }
        None => None,
    };

    Ok(Candidate {
        content,
        finish_reason,
        safety_response,
    })
}

fn validate_part(checker: &Checker, value: &Value, path: &FieldPath) -> Result<Part, ValidationError> {
    let map = checker.object(value, path)?;

    let text = optional(map, "text").map(|_| "text");
    let function_call = either(map, "functionCall", "function_call");
    let function_response = either(map, "functionResponse", "function_response");
    let inline_data = either(map, "inlineData", "inline_data");

    let present: Vec<&str> = [text, function_call, function_response, inline_data]
        .into_iter()
        .flatten()
        .collect();

    match present.as_slice() {
        [] => Err(checker.error(
            path,
            "part has none of text, functionCall, function_response, inline_data",
        )),
        [key] => {
            let key = *key;
            let field_path = path.field(key);
            let raw = &map[key];
            if Some(key) == text {
                checker.string(raw, &field_path).map(Part::Text)
            } else if Some(key) == function_call {
                validate_function_call(checker, raw, &field_path).map(Part::FunctionCall)
            } else if Some(key) == function_response {
                Ok(Part::FunctionResponse(raw.clone()))
            } else {
                let data = checker.object(raw, &field_path)?;
                let mime_key = either(data, "mimeType", "mime_type").unwrap_or("mime_type");
                Ok(Part::InlineData(InlineData {
                    mime_type: checker.required_string(data, mime_key, &field_path)?,
                    data: checker.required_string(data, "data", &field_path)?,
                }))
            }
        }
        many => Err(checker.error(
            path,
            format!("ambiguous part carries {}", many.join(" and ")),
        )),
    }
}

fn validate_function_call(
    checker: &Checker,
    value: &Value,
    path: &FieldPath,
) -> Result<FunctionCall, ValidationError> {
    let map = checker.object(value, path)?;
    let name = checker.required_string(map, "name", path)?;
    if name.trim().is_empty() {
        return Err(checker.error(&path.field("name"), "must not be empty"));
    }
    let id = checker
        .optional_string(map, "id", path)?
        .filter(|id| !id.is_empty());
    let args = match optional(map, "args") {
        Some(args) => checker.object(args, &path.field("args"))?.clone(),
        None => Map::new(),
    };
    Ok(FunctionCall { id, name, args })
}

/// Heuristic for `expires_at`: values below 10^12 are epoch seconds.
const EPOCH_MILLIS_THRESHOLD: f64 = 1_000_000_000_000.0;

pub fn validate_session_bootstrap(value: &Value) -> Result<SessionPayload, ValidationError> {
    let checker = Checker::new(SchemaName::SessionBootstrap);
    let root = FieldPath::root();
    let map = checker.object(value, &root)?;

    let session_id = checker.required_string(map, "session_id", &root)?;
    if session_id.is_empty() {
        return Err(checker.error(&root.field("session_id"), "must not be empty"));
    }
    let chat_session_mcp_url = checker.http_url(map, "chat_session_mcp_url", &root)?;
    let tool_router_mcp_url = checker.http_url(map, "tool_router_instance_mcp_url", &root)?;

    let expires_in_secs = match optional(map, "expires_in") {
        Some(raw) => {
            let seconds = checker.number(raw, &root.field("expires_in"))?;
            if seconds <= 0.0 {
                return Err(checker.error(&root.field("expires_in"), "must be positive"));
            }
            Some(seconds.ceil() as u64)
        }
        None => None,
    };

    let expires_at_ms = match optional(map, "expires_at") {
        Some(raw) => {
            let at = checker.number(raw, &root.field("expires_at"))?;
            if at <= 0.0 {
                return Err(checker.error(&root.field("expires_at"), "must be positive"));
            }
            if at < EPOCH_MILLIS_THRESHOLD {
                Some((at * 1000.0) as i64)
            } else {
                Some(at as i64)
            }
        }
        None => None,
    };

    Ok(SessionPayload {
        session_id,
        chat_session_mcp_url,
        tool_router_mcp_url,
        expires_in_secs,
        expires_at_ms,
    })
}

pub fn validate_page_context(value: &Value) -> Result<PageContext, ValidationError> {
    let checker = Checker::new(SchemaName::PageContext);
    let root = FieldPath::root();
    let map = checker.object(value, &root)?;

    let url = checker.required_string(map, "url", &root)?;
    if !url.starts_with("data:") {
        absolute_url(&url).map_err(|message| checker.error(&root.field("url"), message))?;
    }
    let title = checker.required_string(map, "title", &root)?;
    let text_key = either(map, "textContent", "text_content").unwrap_or("textContent");
    let text_content = checker.required_string(map, text_key, &root)?;

    let links_path = root.field("links");
    let links = checker
        .optional_array(map, "links", &root)?
        .iter()
        .enumerate()
        .map(|(index, link)| {
            let path = links_path.index(index);
            let link = checker.object(link, &path)?;
            Ok(PageLink {
                text: checker.required_string(link, "text", &path)?,
                href: checker.required_string(link, "href", &path)?,
            })
        })
        .collect::<Result<Vec<_>, ValidationError>>()?;

    let images_path = root.field("images");
    let images = checker
        .optional_array(map, "images", &root)?
        .iter()
        .enumerate()
        .map(|(index, image)| {
            let path = images_path.index(index);
            let image = checker.object(image, &path)?;
            Ok(PageImage {
                alt: checker.required_string(image, "alt", &path)?,
                src: checker.required_string(image, "src", &path)?,
            })
        })
        .collect::<Result<Vec<_>, ValidationError>>()?;

    let forms_path = root.field("forms");
    let forms = checker
        .optional_array(map, "forms", &root)?
        .iter()
        .enumerate()
        .map(|(index, form)| {
            let path = forms_path.index(index);
            let form = checker.object(form, &path)?;
            let inputs_path = path.field("inputs");
            let inputs = checker
                .array(checker.required(form, "inputs", &path)?, &inputs_path)?
                .iter()
                .enumerate()
                .map(|(input_index, input)| {
                    let input_path = inputs_path.index(input_index);
                    let input = checker.object(input, &input_path)?;
                    Ok(FormInput {
                        name: checker.required_string(input, "name", &input_path)?,
                        input_type: checker.required_string(input, "type", &input_path)?,
                    })
                })
                .collect::<Result<Vec<_>, ValidationError>>()?;
            Ok(PageForm {
                id: checker.required_string(form, "id", &path)?,
                action: checker.required_string(form, "action", &path)?,
                inputs,
            })
        })
        .collect::<Result<Vec<_>, ValidationError>>()?;

    let metadata = match optional(map, "metadata") {
        Some(raw) => {
            let path = root.field("metadata");
            let meta = checker.object(raw, &path)?;
            PageMetadata {
                description: checker.optional_string(meta, "description", &path)?,
                keywords: checker.optional_string(meta, "keywords", &path)?,
                author: checker.optional_string(meta, "author", &path)?,
            }
        }
        None => PageMetadata::default(),
    };

    let viewport = match optional(map, "viewport") {
        Some(raw) => {
            let path = root.field("viewport");
            let view = checker.object(raw, &path)?;
            let scroll_x_key = either(view, "scrollX", "scroll_x").unwrap_or("scrollX");
            let scroll_y_key = either(view, "scrollY", "scroll_y").unwrap_or("scrollY");
            let ratio_key =
                either(view, "devicePixelRatio", "device_pixel_ratio").unwrap_or("devicePixelRatio");
            Some(Viewport {
                width: checker.positive_number(view, "width", &path)?,
                height: checker.positive_number(view, "height", &path)?,
                scroll_x: checker.required_number(view, scroll_x_key, &path)?,
                scroll_y: checker.required_number(view, scroll_y_key, &path)?,
                device_pixel_ratio: checker.positive_number(view, ratio_key, &path)?,
            })
        }
        None => None,
    };

    Ok(PageContext {
        url,
        title,
        text_content,
        links,
        images,
        forms,
        metadata,
        viewport,
    })
}

/// Pages may live on non-http schemes (`file:`, `chrome-extension:`); any
/// absolute URL is accepted for page context.
fn absolute_url(raw: &str) -> Result<(), String> {
    reqwest::Url::parse(raw)
        .map(|_| ())
        .map_err(|err| format!("is not an absolute URL ({err})"))
}

pub fn validate_action_response(value: &Value) -> Result<ActionResponse, ValidationError> {
    let checker = Checker::new(SchemaName::ActionResult);
    let root = FieldPath::root();
    let map = checker.object(value, &root)?;

    let success = checker.boolean(checker.required(map, "success", &root)?, &root.field("success"))?;
    let element_bounds = match either(map, "elementBounds", "element_bounds") {
        Some(key) => {
            let path = root.field(key);
            let bounds = checker.object(&map[key], &path)?;
            Some(ElementBounds {
                left: checker.required_number(bounds, "left", &path)?,
                top: checker.required_number(bounds, "top", &path)?,
                width: checker.required_number(bounds, "width", &path)?,
                height: checker.required_number(bounds, "height", &path)?,
            })
        }
        None => None,
    };

    Ok(ActionResponse {
        success,
        message: checker.optional_string(map, "message", &root)?,
        error: checker.optional_string(map, "error", &root)?,
        data: optional(map, "data").cloned(),
        element: checker.optional_string(map, "element", &root)?,
        element_bounds,
        text: checker.optional_string(map, "text", &root)?,
        screenshot: checker.optional_string(map, "screenshot", &root)?,
    })
}

pub fn validate_screenshot_response(value: &Value) -> Result<ScreenshotResponse, ValidationError> {
    let checker = Checker::new(SchemaName::ScreenshotResult);
    let root = FieldPath::root();
    let map = checker.object(value, &root)?;

    let success = checker.boolean(checker.required(map, "success", &root)?, &root.field("success"))?;
    let screenshot = checker.optional_string(map, "screenshot", &root)?;
    if let Some(data_url) = screenshot.as_deref() {
        check_image_data_url(data_url)
            .map_err(|message| checker.error(&root.field("screenshot"), message))?;
    }

    Ok(ScreenshotResponse {
        success,
        error: checker.optional_string(map, "error", &root)?,
        screenshot,
    })
}

/// Accepts `data:image/<subtype>;base64,<payload>` with a decodable payload.
pub fn check_image_data_url(data_url: &str) -> Result<(), String> {
    let rest = data_url
        .strip_prefix("data:")
        .ok_or_else(|| "is not a data URL".to_string())?;
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| "data URL has no payload separator".to_string())?;
    let media_type = meta
        .strip_suffix(";base64")
        .ok_or_else(|| "data URL is not base64 encoded".to_string())?;
    let subtype = media_type
        .strip_prefix("image/")
        .ok_or_else(|| format!("media type {media_type} is not an image"))?;
    if subtype.is_empty() {
        return Err("image media type has no subtype".to_string());
    }
    if payload.is_empty() {
        return Err("data URL payload is empty".to_string());
    }
    base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map(|_| ())
        .map_err(|err| format!("payload is not valid base64 ({err})"))
}

pub fn validate_tool_envelope(value: &Value) -> Result<ToolEnvelope, ValidationError> {
    let checker = Checker::new(SchemaName::ToolEnvelope);
    let root = FieldPath::root();
    let map = checker.object(value, &root)?;

    let content_path = root.field("content");
    let content = checker.array(checker.required(map, "content", &root)?, &content_path)?;
    for (index, item) in content.iter().enumerate() {
        let path = content_path.index(index);
        let item = checker.object(item, &path)?;
        checker.required_string(item, "type", &path)?;
    }

    let is_error = match optional(map, "isError") {
        Some(raw) => Some(checker.boolean(raw, &root.field("isError"))?),
        None => None,
    };
    let structured_content = match optional(map, "structuredContent") {
        Some(raw) => Some(checker.object(raw, &root.field("structuredContent"))?.clone()),
        None => None,
    };

    Ok(ToolEnvelope {
        content: content.to_vec(),
        is_error,
        structured_content,
    })
}

/// Checks MCP tool arguments against the tool's advertised input schema.
///
/// A schema that cannot be compiled is logged and treated as permissive; the
/// remote server still gets the final word.
pub fn validate_tool_arguments(
    schema: &Value,
    args: &Map<String, Value>,
) -> Result<(), ValidationError> {
    let validator = match jsonschema::validator_for(schema) {
        Ok(validator) => validator,
        Err(err) => {
            warn!(error = %err, "Skipping argument check for uncompilable tool schema");
            return Ok(());
        }
    };

    let instance = Value::Object(args.clone());
    let problems: Vec<String> = validator
        .iter_errors(&instance)
        .map(|err| err.to_string())
        .collect();
    if problems.is_empty() {
        Ok(())
    } else {
        Err(ValidationError {
            schema: SchemaName::ToolArguments,
            path: "args".to_string(),
            message: problems.join("; "),
        })
    }
}

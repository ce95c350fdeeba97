//! Streaming `generateContent` client.
//!
//! The SSE stream is merged into a single response value shaped like a
//! non-streaming reply, so the validator sees one payload per round.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::debug;

use super::{GenerateContentRequest, ModelClient, ModelError, ModelRequest};
use crate::core::settings::Settings;
use crate::utils::sse::{sse_data_payload, SseLineBuffer};
use crate::utils::url::construct_api_url;

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const GEMINI_CONNECT_TIMEOUT_SECONDS: u64 = 10;

/// Incremental output for hosts that render the reply as it arrives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamMessage {
    Chunk(String),
    Error(String),
    End,
}

pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    observer: Option<mpsc::UnboundedSender<StreamMessage>>,
}

impl GeminiClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ModelError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(GEMINI_CONNECT_TIMEOUT_SECONDS))
            .build()
            .map_err(|err| ModelError::Transport(err.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            observer: None,
        })
    }

    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<StreamMessage>) -> Self {
        self.observer = Some(observer);
        self
    }

    fn notify(&self, message: StreamMessage) {
        if let Some(observer) = &self.observer {
            let _ = observer.send(message);
        }
    }

    fn stream_url(&self, model: &str) -> String {
        construct_api_url(
            &self.base_url,
            &format!("models/{}:streamGenerateContent?alt=sse", model.trim()),
        )
    }
}

#[async_trait]
impl ModelClient for GeminiClient {
    async fn generate(
        &self,
        settings: &Settings,
        request: &ModelRequest,
    ) -> Result<Value, ModelError> {
        let body = GenerateContentRequest::from_model_request(request);
        let url = self.stream_url(&settings.model);
        debug!(
            model = %settings.model,
            messages = body.contents.len(),
            tools = request.tools.len(),
            "Sending model request"
        );

        let outcome = async {
            let response = self
                .http
                .post(&url)
                .header("Content-Type", "application/json")
                .header("x-goog-api-key", &settings.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|err| ModelError::Transport(err.to_string()))?;

            if !response.status().is_success() {
                let error_text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "<no body>".to_string());
                return Err(ModelError::Api(format_api_error(&error_text)));
            }

            let mut stream = response.bytes_stream();
            let mut buffer = SseLineBuffer::default();
            let mut merged = StreamAccumulator::default();

            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|err| ModelError::Stream(err.to_string()))?;
                for line in buffer.push(&chunk) {
                    self.absorb_line(&line, &mut merged)?;
                }
            }
            for line in buffer.finish() {
                self.absorb_line(&line, &mut merged)?;
            }

            Ok(merged.into_value())
        }
        .await;

        if let Err(err) = &outcome {
            self.notify(StreamMessage::Error(err.to_string()));
        }
        self.notify(StreamMessage::End);
        outcome
    }
}

impl GeminiClient {
    fn absorb_line(&self, line: &str, merged: &mut StreamAccumulator) -> Result<(), ModelError> {
        let Some(payload) = sse_data_payload(line) else {
            return Ok(());
        };
        if payload.is_empty() || payload == "[DONE]" {
            return Ok(());
        }

        let chunk: Value =
            serde_json::from_str(payload).map_err(|_| ModelError::Api(format_api_error(payload)))?;
        if chunk.get("error").is_some() {
            return Err(ModelError::Api(format_api_error(payload)));
        }

        for text in merged.merge(&chunk) {
            self.notify(StreamMessage::Chunk(text));
        }
        Ok(())
    }
}

/// Folds streamed chunks into one response.
///
/// Adjacent text parts are concatenated, every other part is kept in
/// emission order, and the last `finishReason`, `safetyResponse` and
/// `promptFeedback` seen win. Either key casing is read; thought parts are
/// dropped.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    parts: Vec<Value>,
    finish_reason: Option<Value>,
    safety_response: Option<Value>,
    prompt_feedback: Option<Value>,
    saw_candidate: bool,
}

impl StreamAccumulator {
    /// Absorb one chunk, returning the text deltas it carried.
    pub fn merge(&mut self, chunk: &Value) -> Vec<String> {
        if let Some(feedback) = either(chunk, "promptFeedback", "prompt_feedback") {
            self.prompt_feedback = Some(feedback.clone());
        }

        let Some(candidate) = chunk
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|candidates| candidates.first())
        else {
            return Vec::new();
        };
        self.saw_candidate = true;

        if let Some(reason) = either(candidate, "finishReason", "finish_reason") {
            self.finish_reason = Some(reason.clone());
        }
        if let Some(safety) = either(candidate, "safetyResponse", "safety_response") {
            self.safety_response = Some(safety.clone());
        }

        let mut deltas = Vec::new();
        let parts = candidate
            .pointer("/content/parts")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        for part in parts.iter().filter(|part| !is_thought(part)) {
            match plain_text(part) {
                Some(text) => {
                    deltas.push(text.to_string());
                    self.append_text(text);
                }
                None => self.parts.push(part.clone()),
            }
        }
        deltas
    }

    fn append_text(&mut self, text: &str) {
        if let Some(Value::String(existing)) = self
            .parts
            .last_mut()
            .filter(|last| plain_text(last).is_some())
            .and_then(|last| last.get_mut("text"))
        {
            existing.push_str(text);
            return;
        }
        self.parts.push(json!({ "text": text }));
    }

    pub fn into_value(self) -> Value {
        let mut response = Map::new();
        if self.saw_candidate {
            let mut candidate = Map::new();
            candidate.insert(
                "content".to_string(),
                json!({ "role": "model", "parts": self.parts }),
            );
            if let Some(reason) = self.finish_reason {
                candidate.insert("finishReason".to_string(), reason);
            }
            if let Some(safety) = self.safety_response {
                candidate.insert("safetyResponse".to_string(), safety);
            }
            response.insert("candidates".to_string(), json!([candidate]));
        } else {
            response.insert("candidates".to_string(), json!([]));
        }
        if let Some(feedback) = self.prompt_feedback {
            response.insert("promptFeedback".to_string(), feedback);
        }
        Value::Object(response)
    }
}

fn either<'a>(value: &'a Value, camel: &str, snake: &str) -> Option<&'a Value> {
    value
        .get(camel)
        .or_else(|| value.get(snake))
        .filter(|found| !found.is_null())
}

fn is_thought(part: &Value) -> bool {
    part.get("thought").and_then(Value::as_bool).unwrap_or(false)
}

/// A part that carries nothing but text, apart from a thought signature.
fn plain_text(part: &Value) -> Option<&str> {
    let map = part.as_object()?;
    let text = map.get("text")?.as_str()?;
    map.keys()
        .all(|key| matches!(key.as_str(), "text" | "thoughtSignature" | "thought_signature"))
        .then_some(text)
}

fn extract_error_summary(value: &Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| {
            value.get("error").and_then(|v| match v {
                Value::String(s) => Some(s.to_string()),
                _ => None,
            })
        })
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str().map(str::to_owned))
        });

    summary.map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
}

/// Render an API error body for humans: a one-line summary when one can be
/// found, followed by the body in a fenced block.
pub fn format_api_error(error_text: &str) -> String {
    let trimmed = error_text.trim();

    if trimmed.is_empty() {
        return "API Error:\n```\n<empty>\n```".to_string();
    }

    if let Ok(json_value) = serde_json::from_str::<Value>(trimmed) {
        if let Ok(pretty_json) = serde_json::to_string_pretty(&json_value) {
            if let Some(summary) = extract_error_summary(&json_value) {
                if !summary.is_empty() {
                    return format!("API Error: {}\n```json\n{}\n```", summary, pretty_json);
                }
            }
            return format!("API Error:\n```json\n{}\n```", pretty_json);
        }
    }

    if trimmed.starts_with('<') && trimmed.ends_with('>') {
        format!("API Error:\n```xml\n{}\n```", trimmed)
    } else {
        format!("API Error:\n```\n{}\n```", trimmed)
    }
}

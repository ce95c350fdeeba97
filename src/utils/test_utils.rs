//! In-memory collaborators for tests. Nothing here touches the network.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::api::{ModelClient, ModelError, ModelRequest};
use crate::core::browser::{BrowserAction, BrowserActionExecutor, BrowserActionParams};
use crate::core::clock::Clock;
use crate::core::page::PageContext;
use crate::core::session::{BootstrapError, SessionBootstrap};
use crate::core::settings::{Provider, Settings, ToolMode};
use crate::mcp::{McpClient, McpConnector, McpError, ToolMap, ToolSchema};

pub const TEST_START_MS: i64 = 1_700_000_000_000;
pub const TEST_SESSION_KEY: &str = "composio-test-key";
pub const TINY_PNG: &str = "data:image/png;base64,iVBORw0KGgo=";

#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(TEST_START_MS)
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

pub fn test_settings() -> Settings {
    Settings {
        provider: Provider::Google,
        api_key: "gemini-test-key".to_string(),
        model: "gemini-test".to_string(),
        tool_mode: None,
        composio_api_key: None,
    }
}

pub fn router_settings() -> Settings {
    Settings {
        tool_mode: Some(ToolMode::ToolRouter),
        composio_api_key: Some(TEST_SESSION_KEY.to_string()),
        ..test_settings()
    }
}

pub fn router_url(generation: usize) -> String {
    format!("https://mcp.example/router/{generation}")
}

pub fn chat_url(generation: usize) -> String {
    format!("https://mcp.example/chat/{generation}")
}

/// Bootstrap reply for the `generation`-th session.
pub fn session_payload(generation: usize) -> Value {
    json!({
        "session_id": format!("sess-{generation}"),
        "chat_session_mcp_url": chat_url(generation),
        "tool_router_instance_mcp_url": router_url(generation),
    })
}

pub fn text_response(text: &str) -> Value {
    json!({
        "candidates": [{
            "content": {"role": "model", "parts": [{"text": text}]},
            "finishReason": "STOP"
        }]
    })
}

/// A response whose only candidate issues `calls` in order.
pub fn call_response(calls: &[(&str, Value)]) -> Value {
    let parts: Vec<Value> = calls
        .iter()
        .map(|(name, args)| json!({"functionCall": {"name": name, "args": args}}))
        .collect();
    json!({
        "candidates": [{
            "content": {"role": "model", "parts": parts},
            "finishReason": "STOP"
        }]
    })
}

pub fn with_confirmation(mut response: Value, message: &str) -> Value {
    response["candidates"][0]["safetyResponse"] =
        json!({"requireConfirmation": true, "message": message});
    response
}

pub fn page_value(url: &str) -> Value {
    json!({
        "url": url,
        "title": "Checkout",
        "textContent": "Review your order and submit.",
        "links": [{"text": "Help", "href": "https://shop.example/help"}],
        "forms": [{"id": "order", "action": "/submit", "inputs": [{"name": "email", "type": "email"}]}],
        "metadata": {"description": "Checkout page"},
        "viewport": {"width": 1280, "height": 720, "scrollX": 0, "scrollY": 0, "devicePixelRatio": 2}
    })
}

pub fn sample_page(url: &str) -> PageContext {
    crate::core::validate::validate_page_context(&page_value(url))
        .expect("sample page is valid")
}

pub fn tool_schema(name: &str, input_schema: Value) -> ToolSchema {
    ToolSchema {
        name: name.to_string(),
        description: Some(format!("{name} tool")),
        input_schema,
    }
}

pub fn object_args(value: Value) -> Map<String, Value> {
    value.as_object().cloned().expect("object arguments")
}

/// Model that replays scripted responses and records every request.
#[derive(Default)]
pub struct ScriptedModel {
    responses: Mutex<VecDeque<Result<Value, ModelError>>>,
    requests: Mutex<Vec<ModelRequest>>,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<Value>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Ok).collect()),
            ..Self::default()
        }
    }

    pub fn push(&self, response: Result<Value, ModelError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn generate(
        &self,
        _settings: &Settings,
        request: &ModelRequest,
    ) -> Result<Value, ModelError> {
        self.requests.lock().unwrap().push(request.clone());
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ModelError::Api("script exhausted".to_string())))
    }
}

/// Browser executor that records calls and replays per-action replies.
/// Unscripted actions succeed.
#[derive(Default)]
pub struct RecordingExecutor {
    calls: Mutex<Vec<(BrowserAction, BrowserActionParams)>>,
    replies: Mutex<HashMap<BrowserAction, VecDeque<Result<Value, String>>>>,
    delay: Mutex<Option<Duration>>,
    page: Mutex<Option<Value>>,
}

impl RecordingExecutor {
    pub fn reply(&self, action: BrowserAction, reply: Result<Value, String>) {
        self.replies
            .lock()
            .unwrap()
            .entry(action)
            .or_default()
            .push_back(reply);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn set_page(&self, page: Value) {
        *self.page.lock().unwrap() = Some(page);
    }

    pub fn calls(&self) -> Vec<(BrowserAction, BrowserActionParams)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl BrowserActionExecutor for RecordingExecutor {
    async fn execute(
        &self,
        action: BrowserAction,
        params: &BrowserActionParams,
    ) -> Result<Value, String> {
        self.calls.lock().unwrap().push((action, params.clone()));
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self
            .replies
            .lock()
            .unwrap()
            .get_mut(&action)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| {
            Ok(match action {
                BrowserAction::Screenshot => json!({"success": true, "screenshot": TINY_PNG}),
                _ => json!({"success": true}),
            })
        })
    }

    async fn capture_page_context(&self) -> Result<Value, String> {
        self.page
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| "No page loaded.".to_string())
    }
}

/// Session service that counts calls. Unscripted calls return
/// [`session_payload`] for the call number, starting at 1.
#[derive(Default)]
pub struct CountingBootstrap {
    calls: AtomicUsize,
    scripted: Mutex<VecDeque<Result<Value, BootstrapError>>>,
    delay: Mutex<Option<Duration>>,
    expires_in: Mutex<Option<u64>>,
}

impl CountingBootstrap {
    pub fn push(&self, response: Result<Value, BootstrapError>) {
        self.scripted.lock().unwrap().push_back(response);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn set_expires_in(&self, secs: u64) {
        *self.expires_in.lock().unwrap() = Some(secs);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionBootstrap for CountingBootstrap {
    async fn bootstrap(&self, _api_key: &str) -> Result<Value, BootstrapError> {
        let generation = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(scripted) = self.scripted.lock().unwrap().pop_front() {
            return scripted;
        }
        let mut payload = session_payload(generation);
        if let Some(secs) = *self.expires_in.lock().unwrap() {
            payload["expires_in"] = json!(secs);
        }
        Ok(payload)
    }
}

#[derive(Default)]
struct FakeMcpState {
    tools: HashMap<String, Vec<ToolSchema>>,
    results: HashMap<String, VecDeque<Result<Value, McpError>>>,
    fail_close: HashSet<String>,
    fail_connect: HashSet<String>,
    dropped_sessions: HashSet<String>,
    connect_delays: HashMap<String, Duration>,
    connects: usize,
    lists: HashMap<String, usize>,
    close_attempts: usize,
    calls: Vec<(String, String, Map<String, Value>)>,
    call_delay: Option<Duration>,
}

/// In-memory MCP servers keyed by endpoint URL.
#[derive(Default)]
pub struct FakeConnector {
    state: Arc<Mutex<FakeMcpState>>,
}

impl FakeConnector {
    pub fn set_tools(&self, url: &str, tools: Vec<ToolSchema>) {
        self.state
            .lock()
            .unwrap()
            .tools
            .insert(url.to_string(), tools);
    }

    /// Queue the result of the next call of `tool` on any endpoint.
    pub fn push_call_result(&self, tool: &str, result: Result<Value, McpError>) {
        self.state
            .lock()
            .unwrap()
            .results
            .entry(tool.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn set_call_delay(&self, delay: Duration) {
        self.state.lock().unwrap().call_delay = Some(delay);
    }

    pub fn fail_close(&self, url: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_close
            .insert(url.to_string());
    }

    pub fn fail_connect(&self, url: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_connect
            .insert(url.to_string());
    }

    pub fn set_connect_delay(&self, url: &str, delay: Duration) {
        self.state
            .lock()
            .unwrap()
            .connect_delays
            .insert(url.to_string(), delay);
    }

    /// Every later list or call on `url` reports the server session as gone.
    pub fn drop_session(&self, url: &str) {
        self.state
            .lock()
            .unwrap()
            .dropped_sessions
            .insert(url.to_string());
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn list_count(&self, url: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .lists
            .get(url)
            .copied()
            .unwrap_or(0)
    }

    pub fn close_attempts(&self) -> usize {
        self.state.lock().unwrap().close_attempts
    }

    /// `(url, tool, arguments)` of every call, in order.
    pub fn tool_calls(&self) -> Vec<(String, String, Map<String, Value>)> {
        self.state.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl McpConnector for FakeConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn McpClient>, McpError> {
        let delay = self.state.lock().unwrap().connect_delays.get(url).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        if state.fail_connect.contains(url) {
            return Err(McpError::Transport(format!("connection refused: {url}")));
        }
        state.connects += 1;
        Ok(Arc::new(FakeMcpClient {
            url: url.to_string(),
            closed: AtomicBool::new(false),
            state: Arc::clone(&self.state),
        }))
    }
}

pub struct FakeMcpClient {
    url: String,
    closed: AtomicBool,
    state: Arc<Mutex<FakeMcpState>>,
}

impl FakeMcpClient {
    fn ensure_open(&self) -> Result<(), McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::Closed(self.url.clone()));
        }
        if self.state.lock().unwrap().dropped_sessions.contains(&self.url) {
            return Err(McpError::SessionGone(self.url.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl McpClient for FakeMcpClient {
    fn endpoint(&self) -> &str {
        &self.url
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn list_tools(&self) -> Result<ToolMap, McpError> {
        self.ensure_open()?;
        let mut state = self.state.lock().unwrap();
        *state.lists.entry(self.url.clone()).or_default() += 1;
        Ok(state
            .tools
            .get(&self.url)
            .into_iter()
            .flatten()
            .map(|schema| (schema.name.clone(), schema.clone()))
            .collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<Value, McpError> {
        self.ensure_open()?;
        let (delay, result) = {
            let mut state = self.state.lock().unwrap();
            state
                .calls
                .push((self.url.clone(), name.to_string(), arguments));
            let result = state
                .results
                .get_mut(name)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| Ok(json!({"content": [{"type": "text", "text": "ok"}]})));
            (state.call_delay, result)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }

    async fn close(&self) -> Result<(), McpError> {
        let mut state = self.state.lock().unwrap();
        state.close_attempts += 1;
        self.closed.store(true, Ordering::SeqCst);
        if state.fail_close.contains(&self.url) {
            Err(McpError::Transport(format!("close failed for {}", self.url)))
        } else {
            Ok(())
        }
    }
}

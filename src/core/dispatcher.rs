//! Routes model function calls to local browser actions or remote MCP tools.
//!
//! Every dispatch produces exactly one [`ToolResult`] for its call, or a
//! [`PendingAction`] that will produce one once the user answers the safety
//! prompt. Failures never escape as errors; they become result payloads.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::api::{sanitize_parameters, FunctionDeclaration};
use crate::core::browser::{BrowserAction, BrowserActionExecutor, BrowserActionParams};
use crate::core::message::{ToolCall, ToolFailureKind, ToolResult};
use crate::core::permissions::{ToolPermissionDecision, ToolPermissionStore};
use crate::core::schema::SafetyResponse;
use crate::core::session::{SessionError, SessionManager};
use crate::core::validate::{
    validate_action_response, validate_screenshot_response, validate_tool_arguments,
    validate_tool_envelope,
};
use crate::mcp::pool::McpClientPool;
use crate::mcp::{McpError, ToolSchema};

pub const DEFAULT_BROWSER_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MCP_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    pub browser_timeout: Duration,
    pub mcp_timeout: Duration,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            browser_timeout: Duration::from_secs(DEFAULT_BROWSER_TIMEOUT_SECS),
            mcp_timeout: Duration::from_secs(DEFAULT_MCP_TIMEOUT_SECS),
        }
    }
}

/// Where remote tools come from: the session for `session_key` names the
/// endpoints, the pool holds their clients.
#[derive(Clone)]
pub struct RemoteRouting {
    pub sessions: Arc<SessionManager>,
    pub pool: Arc<McpClientPool>,
    pub session_key: String,
}

/// A browser action held back until the user confirms it.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAction {
    pub call: ToolCall,
    pub action: BrowserAction,
    pub params: BrowserActionParams,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Completed(ToolResult),
    NeedsConfirmation(PendingAction),
}

/// Failures that end up inside a result payload.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
enum DispatchError {
    #[error("{0}")]
    Invocation(String),
    #[error("{0}")]
    Timeout(String),
    #[error("{0}")]
    InvalidResult(String),
}

impl DispatchError {
    fn into_result(self, call: &ToolCall) -> ToolResult {
        let kind = match &self {
            DispatchError::Invocation(_) => ToolFailureKind::ToolCallFailure,
            DispatchError::Timeout(_) => ToolFailureKind::Timeout,
            DispatchError::InvalidResult(_) => ToolFailureKind::InvalidResult,
        };
        ToolResult::failure(call, kind, self.to_string())
    }
}

pub struct ToolDispatcher {
    executor: Arc<dyn BrowserActionExecutor>,
    remote: Option<RemoteRouting>,
    policy: DispatchPolicy,
    browser_tools_enabled: bool,
    permissions: ToolPermissionStore,
    endpoints: Vec<String>,
}

impl ToolDispatcher {
    pub fn new(
        executor: Arc<dyn BrowserActionExecutor>,
        policy: DispatchPolicy,
        browser_tools_enabled: bool,
    ) -> Self {
        Self {
            executor,
            remote: None,
            policy,
            browser_tools_enabled,
            permissions: ToolPermissionStore::default(),
            endpoints: Vec::new(),
        }
    }

    pub fn with_remote(mut self, remote: RemoteRouting) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn set_remote(&mut self, remote: Option<RemoteRouting>) {
        self.remote = remote;
        self.endpoints.clear();
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    pub fn browser_tools_enabled(&self) -> bool {
        self.browser_tools_enabled
    }

    pub fn set_browser_tools_enabled(&mut self, enabled: bool) {
        self.browser_tools_enabled = enabled;
    }

    pub fn executor(&self) -> &Arc<dyn BrowserActionExecutor> {
        &self.executor
    }

    pub fn permissions(&self) -> &ToolPermissionStore {
        &self.permissions
    }

    /// Resolve and run one call. Browser actions wait for confirmation when
    /// `safety` asks for it.
    pub async fn dispatch(
        &mut self,
        call: &ToolCall,
        safety: Option<&SafetyResponse>,
    ) -> DispatchOutcome {
        if let Some(action) = BrowserAction::from_name(&call.name) {
            if !self.browser_tools_enabled {
                debug!(tool = %call.name, "Browser tools disabled; treating as unknown");
                return DispatchOutcome::Completed(ToolResult::unknown_tool(call));
            }
            return self.dispatch_browser(call, action, safety).await;
        }

        DispatchOutcome::Completed(self.dispatch_remote(call).await)
    }

    /// Apply the user's answer to a held-back action.
    pub async fn confirm(
        &mut self,
        pending: PendingAction,
        decision: ToolPermissionDecision,
    ) -> ToolResult {
        self.permissions.record(pending.action.name(), decision);
        info!(tool = %pending.action.name(), decision = %decision, "Safety confirmation answered");
        if decision.allows() {
            self.execute_browser(&pending.call, pending.action, &pending.params)
                .await
        } else if decision == ToolPermissionDecision::Block {
            blocked_result(&pending.call, pending.action)
        } else {
            self.decline(&pending)
        }
    }

    pub fn decline(&self, pending: &PendingAction) -> ToolResult {
        ToolResult::denied(&pending.call, "The user declined this action.")
    }

    /// Everything the model may call: browser actions when enabled, then
    /// remote tools in endpoint preference order. Remote tools that shadow a
    /// browser action or an earlier endpoint's tool are dropped. A session
    /// the server dropped during discovery is replaced once.
    pub async fn tool_declarations(&mut self) -> Result<Vec<FunctionDeclaration>, SessionError> {
        let mut declarations: Vec<FunctionDeclaration> = if self.browser_tools_enabled {
            BrowserAction::ALL
                .into_iter()
                .map(BrowserAction::declaration)
                .collect()
        } else {
            Vec::new()
        };

        let Some(remote) = self.remote.clone() else {
            return Ok(declarations);
        };

        let mut renewed = false;
        let remote_declarations = loop {
            let urls = self.remote_endpoints(&remote).await?;
            match self.discover(&remote, &urls).await {
                Ok(found) => break found,
                Err(endpoint) => {
                    warn!(url = %endpoint, "Remote endpoint dropped the session during discovery");
                    self.forget_session(&remote).await;
                    if renewed {
                        break Vec::new();
                    }
                    renewed = true;
                }
            }
        };
        declarations.extend(remote_declarations);

        debug!(count = declarations.len(), "Prepared tool advertisement");
        Ok(declarations)
    }

    /// Declarations for the tools of `urls`. Fails with the endpoint URL when
    /// its server session is gone.
    async fn discover(
        &self,
        remote: &RemoteRouting,
        urls: &[String],
    ) -> Result<Vec<FunctionDeclaration>, String> {
        let mut declarations = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for url in urls {
            let tools = match remote.pool.tools_for(url).await {
                Ok(tools) => tools,
                Err(McpError::SessionGone(endpoint)) => return Err(endpoint),
                Err(err) => {
                    warn!(url = %url, error = %err, "Tool discovery failed; endpoint skipped");
                    continue;
                }
            };
            for schema in tools.values() {
                if BrowserAction::from_name(&schema.name).is_some() {
                    debug!(tool = %schema.name, "Remote tool shadows a browser action; skipped");
                    continue;
                }
                if !seen.insert(schema.name.clone()) {
                    continue;
                }
                declarations.push(remote_declaration(schema));
            }
        }
        Ok(declarations)
    }

    async fn dispatch_browser(
        &mut self,
        call: &ToolCall,
        action: BrowserAction,
        safety: Option<&SafetyResponse>,
    ) -> DispatchOutcome {
        let params = match BrowserActionParams::for_action(action, &call.parameters) {
            Ok(params) => params,
            Err(err) => {
                return DispatchOutcome::Completed(ToolResult::failure(
                    call,
                    ToolFailureKind::ToolCallFailure,
                    err,
                ))
            }
        };

        match self.permissions.decision_for(action.name()) {
            Some(ToolPermissionDecision::Block) => {
                debug!(tool = %action.name(), "Browser action blocked for this conversation");
                return DispatchOutcome::Completed(blocked_result(call, action));
            }
            Some(ToolPermissionDecision::AllowSession) => {}
            _ => {
                if let Some(safety) = safety.filter(|safety| safety.require_confirmation) {
                    info!(tool = %action.name(), "Browser action awaits user confirmation");
                    return DispatchOutcome::NeedsConfirmation(PendingAction {
                        call: call.clone(),
                        action,
                        params,
                        message: safety.message.clone(),
                    });
                }
            }
        }

        DispatchOutcome::Completed(self.execute_browser(call, action, &params).await)
    }

    async fn execute_browser(
        &self,
        call: &ToolCall,
        action: BrowserAction,
        params: &BrowserActionParams,
    ) -> ToolResult {
        debug!(tool = %action.name(), call_id = %call.id, "Executing browser action");
        let raw = match tokio::time::timeout(
            self.policy.browser_timeout,
            self.executor.execute(action, params),
        )
        .await
        {
            Ok(Ok(raw)) => raw,
            Ok(Err(message)) => {
                warn!(tool = %action.name(), error = %message, "Browser action failed to run");
                return DispatchError::Invocation(message).into_result(call);
            }
            Err(_) => {
                warn!(tool = %action.name(), "Browser action timed out");
                return DispatchError::Timeout(format!(
                    "{} timed out after {}s",
                    action.name(),
                    self.policy.browser_timeout.as_secs()
                ))
                .into_result(call);
            }
        };

        let validated = if action == BrowserAction::Screenshot {
            validate_screenshot_response(&raw).map(|reply| (reply.success, payload(&reply, &raw)))
        } else {
            validate_action_response(&raw).map(|reply| (reply.success, payload(&reply, &raw)))
        };

        match validated {
            Ok((true, payload)) => ToolResult::success(call, payload),
            Ok((false, payload)) => {
                ToolResult::failure_with_payload(call, ToolFailureKind::ToolError, payload)
            }
            Err(err) => {
                warn!(tool = %action.name(), error = %err, "Browser returned an invalid result");
                DispatchError::InvalidResult(err.to_string()).into_result(call)
            }
        }
    }

    async fn dispatch_remote(&mut self, call: &ToolCall) -> ToolResult {
        let Some(remote) = self.remote.clone() else {
            debug!(tool = %call.name, "No remote tools configured");
            return ToolResult::unknown_tool(call);
        };

        let urls = match self.remote_endpoints(&remote).await {
            Ok(urls) => urls,
            Err(err) => return DispatchError::Invocation(err.to_string()).into_result(call),
        };
        let (url, schema) = match remote.pool.find_tool(&call.name, &urls).await {
            Ok(Some(found)) => found,
            Ok(None) => {
                debug!(tool = %call.name, "No endpoint advertises this tool");
                return ToolResult::unknown_tool(call);
            }
            Err(err) => return self.session_gone(&remote, call, err).await,
        };

        if let Err(err) = validate_tool_arguments(&schema.input_schema, &call.parameters) {
            return DispatchError::Invocation(err.to_string()).into_result(call);
        }

        let client = match remote.pool.get_client(&url).await {
            Ok(client) => client,
            Err(err) => return DispatchError::Invocation(err.to_string()).into_result(call),
        };

        debug!(tool = %call.name, url = %url, call_id = %call.id, "Calling remote tool");
        let raw = match tokio::time::timeout(
            self.policy.mcp_timeout,
            client.call_tool(&call.name, call.parameters.clone()),
        )
        .await
        {
            Ok(Ok(raw)) => raw,
            Ok(Err(err @ McpError::SessionGone(_))) => {
                return self.session_gone(&remote, call, err).await;
            }
            Ok(Err(err)) => {
                warn!(tool = %call.name, error = %err, "Remote tool call failed");
                return DispatchError::Invocation(err.to_string()).into_result(call);
            }
            Err(_) => {
                warn!(tool = %call.name, "Remote tool call timed out");
                return DispatchError::Timeout(format!(
                    "{} timed out after {}s",
                    call.name,
                    self.policy.mcp_timeout.as_secs()
                ))
                .into_result(call);
            }
        };

        match validate_tool_envelope(&raw) {
            Ok(envelope) if envelope.is_error() => ToolResult::failure_with_payload(
                call,
                ToolFailureKind::ToolError,
                payload(&envelope, &raw),
            ),
            Ok(envelope) => ToolResult::success(call, payload(&envelope, &raw)),
            Err(err) => DispatchError::InvalidResult(err.to_string()).into_result(call),
        }
    }

    /// Current session endpoints. Once a renewal replaces them, pooled
    /// clients no stored session names any more are closed.
    async fn remote_endpoints(&mut self, remote: &RemoteRouting) -> Result<Vec<String>, SessionError> {
        let session = remote.sessions.acquire(&remote.session_key).await?;
        let urls = session.endpoints();
        if self.endpoints != urls {
            if !self.endpoints.is_empty() {
                info!("Session endpoints changed; closing clients of replaced sessions");
                let known = remote.sessions.known_endpoints();
                if let Err(err) = remote.pool.retain(&known).await {
                    warn!(error = %err, "Failed to close clients of replaced endpoints");
                }
            }
            self.endpoints = urls.clone();
        }
        Ok(urls)
    }

    async fn session_gone(
        &mut self,
        remote: &RemoteRouting,
        call: &ToolCall,
        err: McpError,
    ) -> ToolResult {
        warn!(tool = %call.name, error = %err, "Remote endpoint dropped the session");
        self.forget_session(remote).await;
        DispatchError::Invocation(err.to_string()).into_result(call)
    }

    async fn forget_session(&mut self, remote: &RemoteRouting) {
        remote.sessions.invalidate(&remote.session_key);
        let stale = std::mem::take(&mut self.endpoints);
        if let Err(err) = remote.pool.release(&stale).await {
            warn!(error = %err, "Failed to close clients of a dropped session");
        }
    }
}

fn blocked_result(call: &ToolCall, action: BrowserAction) -> ToolResult {
    ToolResult::blocked(
        call,
        format!("The user blocked {} for this conversation.", action.name()),
    )
}

fn remote_declaration(schema: &ToolSchema) -> FunctionDeclaration {
    let mut parameters = sanitize_parameters(&schema.input_schema);
    if parameters.get("type").is_none() {
        parameters = json!({"type": "object", "properties": {}});
    }
    FunctionDeclaration {
        name: schema.name.clone(),
        description: schema.description.clone().unwrap_or_default(),
        parameters,
    }
}

/// The validated value in wire form, falling back to the raw reply.
fn payload<T: Serialize>(validated: &T, raw: &Value) -> Value {
    serde_json::to_value(validated).unwrap_or_else(|_| raw.clone())
}

#[cfg(test)]
mod tests;

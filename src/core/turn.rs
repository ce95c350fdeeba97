//! One conversation's turn loop.
//!
//! A turn alternates model rounds and tool dispatch until the model answers
//! without function calls. Every call of a round is answered by exactly one
//! result, and all results of a round land in one follow-up message before
//! the next model round starts.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ModelClient, ModelRequest};
use crate::core::browser::BrowserActionExecutor;
use crate::core::context::SharedContext;
use crate::core::dispatcher::{
    DispatchOutcome, DispatchPolicy, PendingAction, RemoteRouting, ToolDispatcher,
};
use crate::core::message::{
    new_tool_call_id, Message, ToolCall, ToolFailureKind, ToolResult,
};
use crate::core::page::PageContext;
use crate::core::permissions::ToolPermissionDecision;
use crate::core::schema::{FunctionCall, SafetyResponse};
use crate::core::session::SessionError;
use crate::core::settings::{key_fingerprint, Settings, SettingsError};
use crate::core::transcript::{check_round, pending_calls, unanswered_calls, ProtocolViolation};
use crate::core::validate::{validate_model_response, validate_page_context, ValidationError};

pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 10;
pub const DEFAULT_MODEL_TIMEOUT_SECS: u64 = 120;

const TOOL_LIMIT_MESSAGE: &str = "tool-call limit reached";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Loading,
    Ready,
    Streaming,
    Error,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Loading => "loading",
            Phase::Ready => "ready",
            Phase::Streaming => "streaming",
            Phase::Error => "error",
        }
    }

    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Loading, Ready)
                | (Loading, Error)
                | (Ready, Streaming)
                | (Ready, Loading)
                | (Streaming, Ready)
                | (Streaming, Error)
                | (Error, Ready)
                | (Error, Loading)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only snapshot handed to hosts.
#[derive(Debug, Clone)]
pub struct ChatState {
    phase: Phase,
    settings: Option<Settings>,
    messages: Vec<Message>,
    error: Option<String>,
    browser_tools_enabled: bool,
}

impl ChatState {
    fn new(browser_tools_enabled: bool) -> Self {
        Self {
            phase: Phase::Loading,
            settings: None,
            messages: Vec::new(),
            error: None,
            browser_tools_enabled,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Present once `initialize` confirmed them.
    pub fn settings(&self) -> Option<&Settings> {
        self.settings.as_ref()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.phase, Phase::Loading | Phase::Streaming)
    }

    pub fn browser_tools_enabled(&self) -> bool {
        self.browser_tools_enabled
    }
}

#[derive(Debug, Clone)]
pub struct TurnPolicy {
    /// Model rounds with function calls allowed in one turn.
    pub max_tool_rounds: usize,
    pub model_timeout: Duration,
    pub dispatch: DispatchPolicy,
    pub browser_tools: bool,
}

impl Default for TurnPolicy {
    fn default() -> Self {
        Self {
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            model_timeout: Duration::from_secs(DEFAULT_MODEL_TIMEOUT_SECS),
            dispatch: DispatchPolicy::default(),
            browser_tools: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed { reply: String },
    /// The turn is suspended with phase `streaming` until the host answers.
    AwaitingConfirmation(PendingAction),
    Failed { error: String },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TurnError {
    #[error("Conversation is {0}; send needs it ready")]
    NotReady(Phase),
    #[error("Conversation is busy with a turn")]
    Busy,
    #[error("No action is waiting for confirmation")]
    NoPendingConfirmation,
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PageCaptureError {
    #[error("Could not read the page: {0}")]
    Browser(String),
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Progress of the turn in flight.
#[derive(Debug, Default)]
struct RoundState {
    page_context: Option<PageContext>,
    rounds_with_calls: usize,
    safety: Option<SafetyResponse>,
    queue: VecDeque<ToolCall>,
    results: Vec<ToolResult>,
    pending: Option<PendingAction>,
}

/// Cancels whichever turn its conversation is running. One handle stays
/// valid for every later turn; cancelling while idle has no effect on the
/// next turn.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    current: Arc<Mutex<CancellationToken>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.lock().cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().is_cancelled()
    }

    fn token(&self) -> CancellationToken {
        self.lock().clone()
    }

    fn renew(&self) {
        *self.lock() = CancellationToken::new();
    }

    fn lock(&self) -> MutexGuard<'_, CancellationToken> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct Conversation {
    model: Arc<dyn ModelClient>,
    dispatcher: ToolDispatcher,
    shared: SharedContext,
    policy: TurnPolicy,
    state: ChatState,
    round: Option<RoundState>,
    cancel: CancelHandle,
}

impl Conversation {
    pub fn new(
        model: Arc<dyn ModelClient>,
        executor: Arc<dyn BrowserActionExecutor>,
        shared: SharedContext,
        policy: TurnPolicy,
    ) -> Self {
        let dispatcher = ToolDispatcher::new(executor, policy.dispatch.clone(), policy.browser_tools);
        Self {
            model,
            dispatcher,
            shared,
            state: ChatState::new(policy.browser_tools),
            policy,
            round: None,
            cancel: CancelHandle::default(),
        }
    }

    pub fn state(&self) -> &ChatState {
        &self.state
    }

    /// Handle that aborts the turn in flight when cancelled.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn set_browser_tools_enabled(&mut self, enabled: bool) {
        self.dispatcher.set_browser_tools_enabled(enabled);
        self.state.browser_tools_enabled = enabled;
    }

    /// Confirm `settings` and, in tool-router mode, the session and its tools.
    pub async fn initialize(&mut self, settings: Settings) -> Result<(), TurnError> {
        if self.state.phase == Phase::Streaming {
            return Err(TurnError::Busy);
        }
        self.transition(Phase::Loading);
        self.state.settings = None;
        self.state.error = None;

        if let Err(err) = settings.validate() {
            self.fail(err.to_string());
            return Err(err.into());
        }

        let remote = settings
            .session_key()
            .filter(|_| settings.tool_router_enabled())
            .map(|key| RemoteRouting {
                sessions: Arc::clone(&self.shared.sessions),
                pool: Arc::clone(&self.shared.pool),
                session_key: key.to_string(),
            });
        self.dispatcher.set_remote(remote);

        if self.dispatcher.has_remote() {
            match self.dispatcher.tool_declarations().await {
                Ok(tools) => debug!(count = tools.len(), "Discovered tools"),
                Err(err) => {
                    self.fail(err.to_string());
                    return Err(err.into());
                }
            }
        }

        info!(
            model = %settings.model,
            tool_mode = ?settings.tool_mode,
            key = %key_fingerprint(&settings.api_key),
            "Conversation ready"
        );
        self.state.settings = Some(settings);
        self.transition(Phase::Ready);
        Ok(())
    }

    /// Run one user turn.
    pub async fn send(
        &mut self,
        text: impl Into<String>,
        page_context: Option<PageContext>,
    ) -> Result<TurnOutcome, TurnError> {
        if self.state.phase != Phase::Ready {
            return Err(TurnError::NotReady(self.state.phase));
        }
        if self.cancel.is_cancelled() {
            self.cancel.renew();
        }

        self.state.messages.push(Message::user(text));
        self.transition(Phase::Streaming);

        let round = RoundState {
            page_context,
            ..RoundState::default()
        };
        Ok(self.drive(round).await)
    }

    /// Answer the safety prompt of a suspended turn and continue it.
    pub async fn resolve_confirmation(
        &mut self,
        decision: ToolPermissionDecision,
    ) -> Result<TurnOutcome, TurnError> {
        let (mut round, pending) = self.take_pending()?;

        let token = self.cancel.token();
        match until_cancelled(&token, self.dispatcher.confirm(pending.clone(), decision)).await {
            Some(result) => round.results.push(result),
            None => {
                round.queue.push_front(pending.call);
                return Ok(self.finish_cancelled(&mut round));
            }
        }
        Ok(self.drive(round).await)
    }

    /// Give up on a suspended turn. Every unanswered call is declined and the
    /// conversation moves to `error`.
    pub fn abandon_confirmation(&mut self) -> Result<TurnOutcome, TurnError> {
        let (mut round, pending) = self.take_pending()?;

        round.results.push(self.dispatcher.decline(&pending));
        let skipped: Vec<ToolCall> = round.queue.drain(..).collect();
        round.results.extend(
            skipped
                .iter()
                .map(|call| ToolResult::denied(call, "Skipped after the user stopped the turn.")),
        );
        if let Err(violation) = self.flush_results(&mut round) {
            return Ok(self.fail(violation.to_string()));
        }
        Ok(self.fail("The action was not confirmed; the turn was stopped."))
    }

    /// Cancel a turn suspended on a safety prompt. Turns in flight are
    /// cancelled through [`Conversation::cancel_handle`].
    pub fn cancel(&mut self) -> Option<TurnOutcome> {
        let mut round = self.round.take()?;
        Some(self.finish_cancelled(&mut round))
    }

    /// Acknowledge an error. Conversations whose settings were never
    /// confirmed go back to `loading`.
    pub fn reset(&mut self) {
        if self.state.phase != Phase::Error {
            return;
        }
        self.state.error = None;
        if self.state.settings.is_some() {
            self.transition(Phase::Ready);
        } else {
            self.transition(Phase::Loading);
        }
    }

    pub async fn capture_page_context(&self) -> Result<PageContext, PageCaptureError> {
        let raw = self
            .dispatcher
            .executor()
            .capture_page_context()
            .await
            .map_err(PageCaptureError::Browser)?;
        Ok(validate_page_context(&raw)?)
    }

    async fn drive(&mut self, mut round: RoundState) -> TurnOutcome {
        loop {
            while let Some(call) = round.queue.pop_front() {
                let token = self.cancel.token();
                let dispatched = until_cancelled(
                    &token,
                    self.dispatcher.dispatch(&call, round.safety.as_ref()),
                )
                .await;
                match dispatched {
                    Some(DispatchOutcome::Completed(result)) => round.results.push(result),
                    Some(DispatchOutcome::NeedsConfirmation(pending)) => {
                        info!(tool = %pending.call.name, "Turn suspended for confirmation");
                        round.pending = Some(pending.clone());
                        self.round = Some(round);
                        return TurnOutcome::AwaitingConfirmation(pending);
                    }
                    None => {
                        round.queue.push_front(call);
                        return self.finish_cancelled(&mut round);
                    }
                }
            }

            if !round.results.is_empty() {
                if let Err(violation) = self.flush_results(&mut round) {
                    return self.fail(violation.to_string());
                }
            }

            if self.cancel.is_cancelled() {
                return self.finish_cancelled(&mut round);
            }

            if let Some(outcome) = self.model_round(&mut round).await {
                return outcome;
            }
        }
    }

    /// One model request. `None` means calls were queued and the loop goes on.
    async fn model_round(&mut self, round: &mut RoundState) -> Option<TurnOutcome> {
        let Some(settings) = self.state.settings.clone() else {
            return Some(self.fail("Conversation has no confirmed settings."));
        };

        let token = self.cancel.token();
        let tools = match until_cancelled(&token, self.dispatcher.tool_declarations()).await {
            Some(Ok(tools)) => tools,
            Some(Err(err)) => return Some(self.fail(err.to_string())),
            None => return Some(self.finish_cancelled(round)),
        };

        let request = ModelRequest {
            messages: self.state.messages.clone(),
            page_context: round.page_context.clone(),
            tools,
        };
        self.state.messages.push(Message::assistant_placeholder());
        debug!(
            round = round.rounds_with_calls + 1,
            tools = request.tools.len(),
            "Requesting model round"
        );

        let generated = until_cancelled(
            &token,
            tokio::time::timeout(
                self.policy.model_timeout,
                self.model.generate(&settings, &request),
            ),
        )
        .await;
        let raw = match generated {
            Some(Ok(Ok(raw))) => raw,
            Some(Ok(Err(err))) => return Some(self.fail(err.to_string())),
            Some(Err(_)) => {
                return Some(self.fail(format!(
                    "The model did not answer within {}s.",
                    self.policy.model_timeout.as_secs()
                )))
            }
            None => return Some(self.finish_cancelled(round)),
        };

        let response = match validate_model_response(&raw) {
            Ok(response) => response,
            Err(err) => return Some(self.fail(format!("Invalid model response: {err}"))),
        };
        if let Some(reason) = response.block_reason() {
            return Some(self.fail(format!("The model blocked this request ({reason}).")));
        }
        let Some(candidate) = response.primary() else {
            return Some(self.fail("The model returned no candidates."));
        };

        let text = candidate.text();
        let calls = materialize_calls(&candidate.function_calls());
        round.safety = candidate.safety_response.clone();

        if let Some(message) = self.state.messages.last_mut() {
            message.content = text.clone();
            if !calls.is_empty() {
                message.tool_calls = Some(calls.clone());
            }
        }

        if calls.is_empty() {
            return Some(self.complete(round, text));
        }

        round.rounds_with_calls += 1;
        if round.rounds_with_calls > self.policy.max_tool_rounds {
            warn!(limit = self.policy.max_tool_rounds, "Tool-call limit reached");
            round.results = calls
                .iter()
                .map(|call| {
                    ToolResult::failure(call, ToolFailureKind::ToolCallFailure, TOOL_LIMIT_MESSAGE)
                })
                .collect();
            if let Err(violation) = self.flush_results(round) {
                return Some(self.fail(violation.to_string()));
            }
            return Some(self.fail(TOOL_LIMIT_MESSAGE));
        }

        debug!(count = calls.len(), "Model requested tool calls");
        round.queue = calls.into();
        None
    }

    fn complete(&mut self, round: &RoundState, reply: String) -> TurnOutcome {
        let missing = unanswered_calls(&self.state.messages)
            .first()
            .map(|call| call.id.clone());
        if let Some(id) = missing {
            let violation = ProtocolViolation::MissingResult(id);
            debug_assert!(false, "turn ended with {violation}");
            return self.fail(violation.to_string());
        }

        if let Some(page) = &round.page_context {
            self.shared.record_visit(page);
        }
        self.round = None;
        self.transition(Phase::Ready);
        TurnOutcome::Completed { reply }
    }

    /// Append the round's results as one message after checking they pair
    /// with the latest assistant calls.
    fn flush_results(&mut self, round: &mut RoundState) -> Result<(), ProtocolViolation> {
        let results = std::mem::take(&mut round.results);
        if let Err(violation) = check_round(pending_calls(&self.state.messages), &results) {
            debug_assert!(false, "tool round broke pairing: {violation}");
            return Err(violation);
        }
        self.state.messages.push(Message::tool_results(results));
        Ok(())
    }

    fn finish_cancelled(&mut self, round: &mut RoundState) -> TurnOutcome {
        let mut results = std::mem::take(&mut round.results);
        if let Some(pending) = round.pending.take() {
            results.push(ToolResult::cancelled(&pending.call));
        }
        results.extend(round.queue.drain(..).map(|call| ToolResult::cancelled(&call)));
        self.drop_empty_placeholder();

        if !results.is_empty() {
            round.results = results;
            if let Err(violation) = self.flush_results(round) {
                return self.fail(violation.to_string());
            }
        }

        info!("Turn cancelled");
        self.round = None;
        self.cancel.renew();
        self.transition(Phase::Ready);
        TurnOutcome::Cancelled
    }

    fn fail(&mut self, message: impl Into<String>) -> TurnOutcome {
        let message = message.into();
        warn!(error = %message, phase = %self.state.phase, "Turn failed");
        self.drop_empty_placeholder();
        self.round = None;
        self.state.error = Some(message.clone());
        self.transition(Phase::Error);
        TurnOutcome::Failed { error: message }
    }

    fn take_pending(&mut self) -> Result<(RoundState, PendingAction), TurnError> {
        let mut round = self.round.take().ok_or(TurnError::NoPendingConfirmation)?;
        match round.pending.take() {
            Some(pending) => Ok((round, pending)),
            None => {
                self.round = Some(round);
                Err(TurnError::NoPendingConfirmation)
            }
        }
    }

    fn drop_empty_placeholder(&mut self) {
        if self
            .state
            .messages
            .last()
            .is_some_and(Message::is_empty_assistant)
        {
            self.state.messages.pop();
        }
    }

    fn transition(&mut self, next: Phase) {
        let current = self.state.phase;
        if current == next {
            return;
        }
        debug_assert!(
            current.can_transition_to(next),
            "illegal phase transition {current} -> {next}"
        );
        debug!(from = %current, to = %next, "Phase transition");
        self.state.phase = next;
    }
}

/// Give every call an id unique within the round.
fn materialize_calls(calls: &[&FunctionCall]) -> Vec<ToolCall> {
    let mut seen = HashSet::new();
    calls
        .iter()
        .map(|call| {
            let id = call
                .id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty() && !seen.contains(*id))
                .map(str::to_string)
                .unwrap_or_else(new_tool_call_id);
            seen.insert(id.clone());
            ToolCall {
                id,
                name: call.name.clone(),
                parameters: call.args.clone(),
            }
        })
        .collect()
}

async fn until_cancelled<F: Future>(token: &CancellationToken, future: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = token.cancelled() => None,
        output = future => Some(output),
    }
}

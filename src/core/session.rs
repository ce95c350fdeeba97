//! Tool-router session lifecycle.
//!
//! A session is created by a bootstrap call, lives until its expiry and is
//! replaced wholesale on renewal. The manager is shared by every
//! conversation and keyed by session API key. At most one bootstrap per key
//! is in flight; concurrent callers await the same shared future.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::core::clock::Clock;
use crate::core::schema::SessionPayload;
use crate::core::settings::key_fingerprint;
use crate::core::validate::{validate_session_bootstrap, ValidationError};

pub const DEFAULT_SESSION_TTL_SECS: u64 = 3600;
pub const DEFAULT_BOOTSTRAP_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_RENEWAL_RETRIES: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub chat_session_mcp_url: String,
    pub tool_router_mcp_url: String,
    /// Epoch milliseconds.
    pub created_at: i64,
    /// Epoch milliseconds; always greater than `created_at`.
    pub expires_at: i64,
}

fn millis_i64(millis: u128) -> i64 {
    i64::try_from(millis).unwrap_or(i64::MAX)
}

impl Session {
    fn from_payload(
        payload: SessionPayload,
        now: i64,
        default_ttl: Duration,
    ) -> Result<Self, SessionError> {
        let expires_at = match (payload.expires_at_ms, payload.expires_in_secs) {
            (Some(at), _) => at,
            (None, Some(secs)) => now.saturating_add(millis_i64(u128::from(secs) * 1000)),
            (None, None) => now.saturating_add(millis_i64(default_ttl.as_millis())),
        };
        if expires_at <= now {
            return Err(SessionError::Unavailable(
                "Session service returned an already expired session.".to_string(),
            ));
        }
        Ok(Self {
            session_id: payload.session_id,
            chat_session_mcp_url: payload.chat_session_mcp_url,
            tool_router_mcp_url: payload.tool_router_mcp_url,
            created_at: now,
            expires_at,
        })
    }

    pub fn is_live_at(&self, now: i64) -> bool {
        now < self.expires_at
    }

    /// Both MCP endpoints, tool router first.
    pub fn endpoints(&self) -> Vec<String> {
        vec![
            self.tool_router_mcp_url.clone(),
            self.chat_session_mcp_url.clone(),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Absent,
    Active,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("No session API key configured.")]
    MissingApiKey,
    #[error("Session service returned an invalid response: {0}")]
    Validation(#[from] ValidationError),
    #[error("Tool-router session unavailable: {0}")]
    Unavailable(String),
}

/// Failures of one bootstrap call. All of these are retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BootstrapError {
    #[error("Session request failed: {0}")]
    Transport(String),
    #[error("Session service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

/// The remote collaborator that mints sessions.
#[async_trait]
pub trait SessionBootstrap: Send + Sync {
    async fn bootstrap(&self, api_key: &str) -> Result<Value, BootstrapError>;
}

#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub default_ttl: Duration,
    pub bootstrap_timeout: Duration,
    pub renewal_retries: u32,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
            bootstrap_timeout: Duration::from_secs(DEFAULT_BOOTSTRAP_TIMEOUT_SECS),
            renewal_retries: DEFAULT_RENEWAL_RETRIES,
        }
    }
}

type SharedBootstrap = Shared<BoxFuture<'static, Result<Session, SessionError>>>;

struct InFlight {
    generation: u64,
    future: SharedBootstrap,
}

#[derive(Default)]
struct SessionSlot {
    current: Option<Session>,
    in_flight: Option<InFlight>,
    generation: u64,
}

pub struct SessionManager {
    bootstrap: Arc<dyn SessionBootstrap>,
    clock: Arc<dyn Clock>,
    policy: SessionPolicy,
    slots: Mutex<HashMap<String, SessionSlot>>,
}

impl SessionManager {
    pub fn new(
        bootstrap: Arc<dyn SessionBootstrap>,
        clock: Arc<dyn Clock>,
        policy: SessionPolicy,
    ) -> Self {
        Self {
            bootstrap,
            clock,
            policy,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self, key: &str) -> SessionState {
        let now = self.clock.now_ms();
        match self.lock_slots().get(key).and_then(|slot| slot.current.as_ref()) {
            None => SessionState::Absent,
            Some(session) if session.is_live_at(now) => SessionState::Active,
            Some(_) => SessionState::Expired,
        }
    }

    /// The stored session if it is still live. Never bootstraps.
    pub fn current(&self, key: &str) -> Option<Session> {
        let now = self.clock.now_ms();
        self.lock_slots()
            .get(key)
            .and_then(|slot| slot.current.clone())
            .filter(|session| session.is_live_at(now))
    }

    /// A live session for `key`, bootstrapping or renewing as needed.
    pub async fn acquire(&self, key: &str) -> Result<Session, SessionError> {
        if key.trim().is_empty() {
            return Err(SessionError::MissingApiKey);
        }

        let (generation, future) = {
            let now = self.clock.now_ms();
            let mut slots = self.lock_slots();
            let slot = slots.entry(key.to_string()).or_default();
            match &slot.current {
                Some(session) if session.is_live_at(now) => return Ok(session.clone()),
                Some(session) => {
                    info!(
                        key = %key_fingerprint(key),
                        session_id = %session.session_id,
                        "Tool-router session expired; renewing"
                    );
                }
                None => {}
            }
            self.join_or_start(key, slot)
        };

        self.finish(key, generation, future.await)
    }

    /// Replace the session for `key` with a fresh one, even if the current
    /// one is live. Joins a bootstrap that is already in flight.
    pub async fn renew(&self, key: &str) -> Result<Session, SessionError> {
        if key.trim().is_empty() {
            return Err(SessionError::MissingApiKey);
        }

        let (generation, future) = {
            let mut slots = self.lock_slots();
            let slot = slots.entry(key.to_string()).or_default();
            self.join_or_start(key, slot)
        };

        self.finish(key, generation, future.await)
    }

    pub async fn chat_endpoint(&self, key: &str) -> Result<String, SessionError> {
        self.acquire(key)
            .await
            .map(|session| session.chat_session_mcp_url)
    }

    pub async fn tool_router_endpoint(&self, key: &str) -> Result<String, SessionError> {
        self.acquire(key)
            .await
            .map(|session| session.tool_router_mcp_url)
    }

    /// Endpoints of every stored session across keys, expired ones included
    /// until they are renewed.
    pub fn known_endpoints(&self) -> Vec<String> {
        self.lock_slots()
            .values()
            .filter_map(|slot| slot.current.as_ref())
            .flat_map(Session::endpoints)
            .collect()
    }

    /// Drop the stored session so the next request bootstraps again.
    pub fn invalidate(&self, key: &str) {
        if let Some(slot) = self.lock_slots().get_mut(key) {
            if let Some(session) = slot.current.take() {
                info!(
                    key = %key_fingerprint(key),
                    session_id = %session.session_id,
                    "Tool-router session invalidated"
                );
            }
        }
    }

    fn join_or_start(&self, key: &str, slot: &mut SessionSlot) -> (u64, SharedBootstrap) {
        if let Some(in_flight) = &slot.in_flight {
            debug!(key = %key_fingerprint(key), "Joining in-flight session bootstrap");
            return (in_flight.generation, in_flight.future.clone());
        }

        slot.generation += 1;
        let generation = slot.generation;
        let future = run_bootstrap(
            Arc::clone(&self.bootstrap),
            Arc::clone(&self.clock),
            self.policy.clone(),
            key.to_string(),
        )
        .boxed()
        .shared();
        slot.in_flight = Some(InFlight {
            generation,
            future: future.clone(),
        });
        (generation, future)
    }

    /// Store the outcome of a bootstrap exactly once per generation.
    fn finish(
        &self,
        key: &str,
        generation: u64,
        outcome: Result<Session, SessionError>,
    ) -> Result<Session, SessionError> {
        let mut slots = self.lock_slots();
        let slot = slots.entry(key.to_string()).or_default();
        let owns_flight = slot
            .in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.generation == generation);
        if owns_flight {
            slot.in_flight = None;
            if let Ok(session) = &outcome {
                slot.current = Some(session.clone());
            }
        }
        match outcome {
            Ok(session) if !session.is_live_at(self.clock.now_ms()) => Err(
                SessionError::Unavailable("Session expired before it could be used.".to_string()),
            ),
            other => other,
        }
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<String, SessionSlot>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn run_bootstrap(
    bootstrap: Arc<dyn SessionBootstrap>,
    clock: Arc<dyn Clock>,
    policy: SessionPolicy,
    key: String,
) -> Result<Session, SessionError> {
    let fingerprint = key_fingerprint(&key);
    let attempts = policy.renewal_retries.saturating_add(1);
    let mut last_failure = String::new();

    for attempt in 1..=attempts {
        debug!(key = %fingerprint, attempt, "Bootstrapping tool-router session");
        match tokio::time::timeout(policy.bootstrap_timeout, bootstrap.bootstrap(&key)).await {
            Ok(Ok(raw)) => {
                let payload = validate_session_bootstrap(&raw).inspect_err(|err| {
                    warn!(key = %fingerprint, error = %err, "Rejected session bootstrap response");
                })?;
                let session = Session::from_payload(payload, clock.now_ms(), policy.default_ttl)?;
                info!(
                    key = %fingerprint,
                    session_id = %session.session_id,
                    expires_at = session.expires_at,
                    "Tool-router session active"
                );
                return Ok(session);
            }
            Ok(Err(err)) => {
                warn!(key = %fingerprint, attempt, error = %err, "Session bootstrap failed");
                last_failure = err.to_string();
            }
            Err(_) => {
                warn!(key = %fingerprint, attempt, "Session bootstrap timed out");
                last_failure = format!(
                    "Session request timed out after {}s.",
                    policy.bootstrap_timeout.as_secs()
                );
            }
        }
    }

    Err(SessionError::Unavailable(last_failure))
}

const SESSION_HTTP_CONNECT_TIMEOUT_SECONDS: u64 = 10;

/// Bootstraps sessions by POSTing to the session service.
pub struct HttpSessionBootstrap {
    client: reqwest::Client,
    url: String,
}

impl HttpSessionBootstrap {
    pub fn new(url: impl Into<String>) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(SESSION_HTTP_CONNECT_TIMEOUT_SECONDS))
            .build()
            .map_err(|err| err.to_string())?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl SessionBootstrap for HttpSessionBootstrap {
    async fn bootstrap(&self, api_key: &str) -> Result<Value, BootstrapError> {
        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("x-api-key", api_key)
            .json(&json!({}))
            .send()
            .await
            .map_err(|err| BootstrapError::Transport(err.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| BootstrapError::Transport(err.to_string()))?;
        if !status.is_success() {
            return Err(BootstrapError::Status {
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }
        serde_json::from_str(&body).map_err(|err| {
            BootstrapError::Transport(format!("Session response is not JSON: {err}"))
        })
    }
}

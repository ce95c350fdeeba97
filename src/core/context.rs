//! State shared by every conversation in one host process.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::core::clock::{Clock, SystemClock};
use crate::core::config::Config;
use crate::core::page::{BrowserMemory, PageContext, VisitedPage};
use crate::core::session::{
    BootstrapError, HttpSessionBootstrap, SessionBootstrap, SessionManager, SessionPolicy,
};
use crate::mcp::client::HttpMcpConnector;
use crate::mcp::pool::McpClientPool;
use crate::mcp::McpConnector;

/// Bootstrap used when no session service URL is configured. Every attempt
/// fails with a message naming the missing setting.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredSessionService;

#[async_trait]
impl SessionBootstrap for UnconfiguredSessionService {
    async fn bootstrap(&self, _api_key: &str) -> Result<Value, BootstrapError> {
        Err(BootstrapError::Transport(
            "No session bootstrap URL configured. Set [session] bootstrap_url.".to_string(),
        ))
    }
}

#[derive(Clone)]
pub struct SharedContext {
    pub sessions: Arc<SessionManager>,
    pub pool: Arc<McpClientPool>,
    pub memory: Arc<Mutex<BrowserMemory>>,
    pub clock: Arc<dyn Clock>,
}

impl SharedContext {
    pub fn new(
        bootstrap: Arc<dyn SessionBootstrap>,
        connector: Arc<dyn McpConnector>,
        clock: Arc<dyn Clock>,
        session_policy: SessionPolicy,
        mcp_timeout: Duration,
    ) -> Self {
        Self {
            sessions: Arc::new(SessionManager::new(
                bootstrap,
                Arc::clone(&clock),
                session_policy,
            )),
            pool: Arc::new(McpClientPool::new(connector, mcp_timeout)),
            memory: Arc::new(Mutex::new(BrowserMemory::default())),
            clock,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, String> {
        let bootstrap: Arc<dyn SessionBootstrap> = match config.session.bootstrap_url.as_deref() {
            Some(url) if !url.trim().is_empty() => Arc::new(HttpSessionBootstrap::new(url.trim())?),
            _ => Arc::new(UnconfiguredSessionService),
        };
        Ok(Self::new(
            bootstrap,
            Arc::new(HttpMcpConnector::new()?),
            Arc::new(SystemClock),
            config.session_policy(),
            config.mcp_timeout(),
        ))
    }

    pub fn record_visit(&self, page: &PageContext) {
        let now = self.clock.now_ms();
        self.lock_memory().record_visit(page, now);
    }

    /// Oldest first.
    pub fn recent_pages(&self) -> Vec<VisitedPage> {
        self.lock_memory().recent_pages.iter().cloned().collect()
    }

    /// Close every pooled MCP client. Failures are logged, not returned.
    pub async fn shutdown(&self) {
        if let Err(err) = self.pool.close_all().await {
            warn!(failures = err.failure_count(), error = %err, "Some MCP clients failed to close");
        }
    }

    fn lock_memory(&self) -> MutexGuard<'_, BrowserMemory> {
        self.memory
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

//! Per-endpoint MCP client pool.
//!
//! Holds at most one live client per endpoint URL and caches each client's
//! tool map for that client's lifetime. Replacing a closed client also
//! replaces its cache. The pool lock only guards the slot table; connects
//! run on the URL's own slot, so a slow endpoint never holds up the others.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use super::{McpClient, McpConnector, McpError, ToolMap, ToolSchema};

struct Connected {
    client: Arc<dyn McpClient>,
    tools: Arc<OnceCell<ToolMap>>,
}

struct PoolEntry {
    url: String,
    slot: Arc<OnceCell<Connected>>,
}

impl PoolEntry {
    fn client(&self) -> Option<&Arc<dyn McpClient>> {
        self.slot.get().map(|connected| &connected.client)
    }
}

/// Every close that failed during [`McpClientPool::close_all`],
/// [`McpClientPool::retain`] or [`McpClientPool::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolCloseError {
    pub failures: Vec<(String, McpError)>,
}

impl PoolCloseError {
    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }
}

impl fmt::Display for PoolCloseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} MCP client(s) failed to close", self.failures.len())?;
        for (url, err) in &self.failures {
            write!(f, "\n- {url}: {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for PoolCloseError {}

pub struct McpClientPool {
    connector: Arc<dyn McpConnector>,
    request_timeout: Duration,
    entries: Mutex<Vec<PoolEntry>>,
}

impl McpClientPool {
    pub fn new(connector: Arc<dyn McpConnector>, request_timeout: Duration) -> Self {
        Self {
            connector,
            request_timeout,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// The live client for `url`, connecting one if none exists or the
    /// pooled one has been closed.
    pub async fn get_client(&self, url: &str) -> Result<Arc<dyn McpClient>, McpError> {
        self.entry(url).await.map(|(client, _)| client)
    }

    /// Tool map for `url`, fetched on first access per client.
    pub async fn tools_for(&self, url: &str) -> Result<ToolMap, McpError> {
        let (client, tools) = self.entry(url).await?;
        let timeout = self.request_timeout;
        let map = tools
            .get_or_try_init(|| async {
                match tokio::time::timeout(timeout, client.list_tools()).await {
                    Ok(result) => result,
                    Err(_) => Err(McpError::Timeout(timeout.as_secs())),
                }
            })
            .await?;
        Ok(map.clone())
    }

    /// Find `name` across `urls`, earliest URL first. Endpoints whose tool
    /// discovery fails are skipped, except for [`McpError::SessionGone`],
    /// which is returned so the caller can retire the session.
    pub async fn find_tool(
        &self,
        name: &str,
        urls: &[String],
    ) -> Result<Option<(String, ToolSchema)>, McpError> {
        for url in urls {
            match self.tools_for(url).await {
                Ok(tools) => {
                    if let Some(schema) = tools.get(name) {
                        debug!(url = %url, tool = %name, "Resolved remote tool");
                        return Ok(Some((url.clone(), schema.clone())));
                    }
                }
                Err(err @ McpError::SessionGone(_)) => return Err(err),
                Err(err) => {
                    warn!(url = %url, error = %err, "Skipping endpoint during tool lookup");
                }
            }
        }
        Ok(None)
    }

    /// URLs with a connected client.
    pub async fn urls(&self) -> Vec<String> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|entry| entry.client().is_some())
            .map(|entry| entry.url.clone())
            .collect()
    }

    /// Close every pooled client. Each close is attempted regardless of the
    /// others failing.
    pub async fn close_all(&self) -> Result<(), PoolCloseError> {
        let drained: Vec<PoolEntry> = std::mem::take(&mut *self.entries.lock().await);
        close_entries(drained).await
    }

    /// Close and drop clients whose URL is not in `keep`.
    pub async fn retain(&self, keep: &[String]) -> Result<(), PoolCloseError> {
        let stale = {
            let mut entries = self.entries.lock().await;
            let (kept, stale): (Vec<_>, Vec<_>) = std::mem::take(&mut *entries)
                .into_iter()
                .partition(|entry| keep.iter().any(|url| url == &entry.url));
            *entries = kept;
            stale
        };
        if !stale.is_empty() {
            info!(count = stale.len(), "Dropping MCP clients for stale endpoints");
        }
        close_entries(stale).await
    }

    /// Close and drop clients whose URL is in `urls`.
    pub async fn release(&self, urls: &[String]) -> Result<(), PoolCloseError> {
        let released = {
            let mut entries = self.entries.lock().await;
            let (released, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut *entries)
                .into_iter()
                .partition(|entry| urls.iter().any(|url| url == &entry.url));
            *entries = kept;
            released
        };
        close_entries(released).await
    }

    async fn entry(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn McpClient>, Arc<OnceCell<ToolMap>>), McpError> {
        let slot = {
            let mut entries = self.entries.lock().await;
            match entries.iter_mut().find(|entry| entry.url == url) {
                Some(entry) => {
                    if entry.client().is_some_and(|client| client.is_closed()) {
                        debug!(url = %url, "Replacing closed MCP client");
                        entry.slot = Arc::new(OnceCell::new());
                    }
                    Arc::clone(&entry.slot)
                }
                None => {
                    let slot = Arc::new(OnceCell::new());
                    entries.push(PoolEntry {
                        url: url.to_string(),
                        slot: Arc::clone(&slot),
                    });
                    slot
                }
            }
        };

        let timeout = self.request_timeout;
        let connected = slot
            .get_or_try_init(|| async {
                let client = match tokio::time::timeout(timeout, self.connector.connect(url)).await
                {
                    Ok(result) => result?,
                    Err(_) => return Err(McpError::Timeout(timeout.as_secs())),
                };
                Ok(Connected {
                    client,
                    tools: Arc::new(OnceCell::new()),
                })
            })
            .await?;
        Ok((Arc::clone(&connected.client), Arc::clone(&connected.tools)))
    }
}

async fn close_entries(entries: Vec<PoolEntry>) -> Result<(), PoolCloseError> {
    let mut failures = Vec::new();
    for entry in entries {
        let Some(client) = entry.client() else {
            continue;
        };
        if let Err(err) = client.close().await {
            warn!(url = %entry.url, error = %err, "MCP client failed to close");
            failures.push((entry.url.clone(), err));
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(PoolCloseError { failures })
    }
}

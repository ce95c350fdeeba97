//! Streamable HTTP MCP client.
//!
//! One [`HttpMcpClient`] wraps one endpoint URL. Requests on a client are
//! serialized through its connection state; the handshake runs on connect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_mcp_schema::schema_utils::RequestFromClient;
use rust_mcp_schema::CallToolRequestParams;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::mcp::transport::is_method_not_found;
use crate::mcp::{McpClient, McpConnector, McpError, ToolMap, MCP_MAX_TOOL_LIST};

mod protocol;
mod transport_http;

use transport_http::StreamableHttpContext;

const MCP_HTTP_CONNECT_TIMEOUT_SECONDS: u64 = 10;
const MCP_HTTP_REQUEST_TIMEOUT_SECONDS: u64 = 60;
const MCP_HTTP_POOL_IDLE_TIMEOUT_SECONDS: u64 = 90;
const MCP_HTTP_POOL_MAX_IDLE_PER_HOST: usize = 8;

pub fn build_mcp_http_client() -> Result<reqwest::Client, String> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(MCP_HTTP_CONNECT_TIMEOUT_SECONDS))
        .timeout(Duration::from_secs(MCP_HTTP_REQUEST_TIMEOUT_SECONDS))
        .pool_idle_timeout(Duration::from_secs(MCP_HTTP_POOL_IDLE_TIMEOUT_SECONDS))
        .pool_max_idle_per_host(MCP_HTTP_POOL_MAX_IDLE_PER_HOST)
        .build()
        .map_err(|err| err.to_string())
}

fn transport_error(endpoint: &str, message: String) -> McpError {
    if message == transport_http::SESSION_NOT_FOUND {
        McpError::SessionGone(endpoint.to_string())
    } else {
        McpError::Transport(message)
    }
}

struct HttpConnection {
    endpoint: String,
    http_client: reqwest::Client,
    session_id: Option<String>,
    negotiated_protocol_version: Option<String>,
    request_id: i64,
    initialized: bool,
}

impl StreamableHttpContext for HttpConnection {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn set_session_id(&mut self, session_id: Option<String>) {
        self.session_id = session_id;
    }

    fn next_request_id(&mut self) -> i64 {
        self.request_id += 1;
        self.request_id
    }

    fn negotiated_protocol_version(&self) -> Option<&str> {
        self.negotiated_protocol_version.as_deref()
    }

    fn set_negotiated_protocol_version(&mut self, protocol_version: Option<String>) {
        self.negotiated_protocol_version = protocol_version;
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn mark_initialized(&mut self) {
        self.initialized = true;
    }

    fn mark_uninitialized(&mut self) {
        self.initialized = false;
    }
}

pub struct HttpMcpClient {
    endpoint: String,
    connection: Mutex<HttpConnection>,
    closed: AtomicBool,
}

impl HttpMcpClient {
    pub fn new(endpoint: impl Into<String>, http_client: reqwest::Client) -> Self {
        let endpoint = endpoint.into();
        Self {
            connection: Mutex::new(HttpConnection {
                endpoint: endpoint.clone(),
                http_client,
                session_id: None,
                negotiated_protocol_version: None,
                request_id: 0,
                initialized: false,
            }),
            endpoint,
            closed: AtomicBool::new(false),
        }
    }

    pub async fn initialize(&self) -> Result<(), McpError> {
        self.ensure_open()?;
        let mut connection = self.connection.lock().await;
        transport_http::ensure_session(&mut *connection)
            .await
            .map_err(McpError::Transport)
    }

    fn ensure_open(&self) -> Result<(), McpError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(McpError::Closed(self.endpoint.clone()))
        } else {
            Ok(())
        }
    }

    async fn fetch_tools_page(
        connection: &mut HttpConnection,
        cursor: Option<String>,
    ) -> Result<Option<rust_mcp_schema::ListToolsResult>, McpError> {
        let params = protocol::paginated_params(cursor);
        let response =
            transport_http::send_request(connection, RequestFromClient::ListToolsRequest(params))
                .await
                .map_err(|err| transport_error(&connection.endpoint, err))?;
        if is_method_not_found(&response) {
            return Ok(None);
        }
        protocol::parse_list_tools(response)
            .map(Some)
            .map_err(McpError::Protocol)
    }
}

#[async_trait]
impl McpClient for HttpMcpClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn list_tools(&self) -> Result<ToolMap, McpError> {
        self.ensure_open()?;
        let mut connection = self.connection.lock().await;
        transport_http::ensure_session(&mut *connection)
            .await
            .map_err(McpError::Transport)?;

        let mut tools = ToolMap::new();
        let mut cursor = None;
        loop {
            let Some(page) = Self::fetch_tools_page(&mut connection, cursor.take()).await? else {
                debug!(url = %self.endpoint, "MCP endpoint does not support tools/list");
                break;
            };
            for tool in &page.tools {
                match protocol::tool_schema_from_listing(tool) {
                    Ok(schema) => {
                        tools.insert(schema.name.clone(), schema);
                    }
                    Err(err) => warn!(url = %self.endpoint, error = %err, "Skipping listed tool"),
                }
                if tools.len() >= MCP_MAX_TOOL_LIST {
                    break;
                }
            }
            match page.next_cursor {
                Some(next) if tools.len() < MCP_MAX_TOOL_LIST => cursor = Some(next),
                _ => break,
            }
        }

        debug!(url = %self.endpoint, count = tools.len(), "Listed MCP tools");
        Ok(tools)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<Value, McpError> {
        self.ensure_open()?;
        let mut connection = self.connection.lock().await;
        transport_http::ensure_session(&mut *connection)
            .await
            .map_err(McpError::Transport)?;

        let params = CallToolRequestParams::new(name).with_arguments(arguments);
        debug!(url = %self.endpoint, tool = %name, "Calling MCP tool");
        let response =
            transport_http::send_request(&mut *connection, RequestFromClient::CallToolRequest(params))
                .await
                .map_err(|err| transport_error(&self.endpoint, err))?;
        protocol::parse_response_value(response).map_err(McpError::Rpc)
    }

    async fn close(&self) -> Result<(), McpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut connection = self.connection.lock().await;
        let outcome = transport_http::terminate_session(&mut *connection).await;
        info!(url = %self.endpoint, ok = outcome.is_ok(), "Closed MCP client");
        outcome.map_err(McpError::Transport)
    }
}

/// Opens [`HttpMcpClient`]s sharing one pooled `reqwest::Client`.
pub struct HttpMcpConnector {
    http_client: reqwest::Client,
}

impl HttpMcpConnector {
    pub fn new() -> Result<Self, String> {
        Ok(Self {
            http_client: build_mcp_http_client()?,
        })
    }
}

#[async_trait]
impl McpConnector for HttpMcpConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn McpClient>, McpError> {
        let client = HttpMcpClient::new(url, self.http_client.clone());
        client.initialize().await?;
        info!(url = %url, "Connected MCP client");
        Ok(Arc::new(client))
    }
}

//! Model Context Protocol plumbing: the client capability, the streamable
//! HTTP implementation and the per-endpoint pool.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

pub mod client;
pub mod pool;
pub mod transport;

/// Cap on tools collected across `tools/list` pages for one endpoint.
pub const MCP_MAX_TOOL_LIST: usize = 100;

/// One advertised remote tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

/// Tool name to schema, ordered by name.
pub type ToolMap = BTreeMap<String, ToolSchema>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum McpError {
    #[error("MCP transport error: {0}")]
    Transport(String),
    #[error("{0}")]
    Rpc(String),
    #[error("MCP protocol error: {0}")]
    Protocol(String),
    #[error("MCP client for {0} is closed")]
    Closed(String),
    #[error("MCP request timed out after {0}s")]
    Timeout(u64),
    #[error("MCP session at {0} is gone")]
    SessionGone(String),
}

/// A live connection to one MCP endpoint.
#[async_trait]
pub trait McpClient: Send + Sync {
    fn endpoint(&self) -> &str;

    fn is_closed(&self) -> bool;

    async fn list_tools(&self) -> Result<ToolMap, McpError>;

    /// Returns the raw `tools/call` result; callers validate the envelope.
    async fn call_tool(&self, name: &str, arguments: Map<String, Value>)
        -> Result<Value, McpError>;

    async fn close(&self) -> Result<(), McpError>;
}

/// Opens clients for endpoint URLs.
#[async_trait]
pub trait McpConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn McpClient>, McpError>;
}

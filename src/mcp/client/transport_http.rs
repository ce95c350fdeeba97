use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::RequestId;
use tracing::debug;

use super::protocol;
use crate::mcp::transport::streamable_http::next_sse_server_message;
use crate::mcp::transport::{
    apply_post_headers, apply_protocol_version_header, apply_session_header,
    MCP_SESSION_ID_HEADER,
};
use crate::utils::sse::is_event_stream_content_type;

/// Error text for a 404 on a request that carried a session id: the server
/// has dropped the session.
pub(crate) const SESSION_NOT_FOUND: &str = "MCP session not found on server";

/// Per-connection state the streamable HTTP exchange reads and updates.
pub(crate) trait StreamableHttpContext {
    fn endpoint(&self) -> &str;
    fn http_client(&self) -> &reqwest::Client;
    fn session_id(&self) -> Option<&str>;
    fn set_session_id(&mut self, session_id: Option<String>);
    fn next_request_id(&mut self) -> i64;
    fn negotiated_protocol_version(&self) -> Option<&str>;
    fn set_negotiated_protocol_version(&mut self, protocol_version: Option<String>);
    fn is_initialized(&self) -> bool;
    fn mark_initialized(&mut self);
    fn mark_uninitialized(&mut self);

    fn effective_protocol_version(&self) -> String {
        protocol::effective_protocol_version(self.negotiated_protocol_version())
    }
}

/// Run the initialize handshake once per server session. A session the
/// server dropped leaves the connection uninitialized, so the next request
/// handshakes again.
pub(crate) async fn ensure_session<C: StreamableHttpContext>(context: &mut C) -> Result<(), String> {
    if context.is_initialized() {
        return Ok(());
    }

    let response = send_request(
        context,
        RequestFromClient::InitializeRequest(protocol::client_details()),
    )
    .await?;
    let initialize = protocol::parse_initialize_result(response)?;
    debug!(
        url = %context.endpoint(),
        protocol_version = %initialize.protocol_version,
        "MCP session initialized"
    );
    context.set_negotiated_protocol_version(Some(initialize.protocol_version));

    send_notification(context, NotificationFromClient::InitializedNotification(None)).await?;
    context.mark_initialized();
    Ok(())
}

pub(crate) async fn send_request<C: StreamableHttpContext>(
    context: &mut C,
    request: RequestFromClient,
) -> Result<ServerMessage, String> {
    let request_id = context.next_request_id();
    let message = ClientMessage::from_message(
        MessageFromClient::RequestFromClient(request),
        Some(RequestId::Integer(request_id)),
    )
    .map_err(|err| err.to_string())?;
    send_message(context, message).await
}

async fn send_notification<C: StreamableHttpContext>(
    context: &mut C,
    notification: NotificationFromClient,
) -> Result<(), String> {
    let message = ClientMessage::from_message(
        MessageFromClient::NotificationFromClient(notification),
        None,
    )
    .map_err(|err| err.to_string())?;
    let payload = serde_json::to_string(&message).map_err(|err| err.to_string())?;
    let response = build_post(context, payload)
        .send()
        .await
        .map_err(|err| err.to_string())?;
    if !response.status().is_success() {
        return Err(format!("HTTP error: {}", response.status()));
    }
    capture_session_id(context, &response);
    Ok(())
}

/// Tear down the server-side session. Servers that do not support explicit
/// termination answer 405, which counts as done.
pub(crate) async fn terminate_session<C: StreamableHttpContext>(
    context: &mut C,
) -> Result<(), String> {
    let Some(session_id) = context.session_id().map(str::to_string) else {
        return Ok(());
    };

    let protocol_version = context.effective_protocol_version();
    let request = apply_protocol_version_header(
        apply_session_header(
            context.http_client().delete(context.endpoint()),
            Some(&session_id),
        ),
        Some(protocol_version.as_str()),
    );
    let response = request.send().await.map_err(|err| err.to_string())?;
    context.set_session_id(None);

    let status = response.status();
    if status.is_success() || status == reqwest::StatusCode::METHOD_NOT_ALLOWED {
        Ok(())
    } else {
        Err(format!("HTTP error: {status}"))
    }
}

fn build_post<C: StreamableHttpContext>(context: &C, payload: String) -> reqwest::RequestBuilder {
    let protocol_version = context.effective_protocol_version();
    let request = apply_protocol_version_header(
        apply_post_headers(context.http_client().post(context.endpoint())),
        Some(protocol_version.as_str()),
    );
    apply_session_header(request, context.session_id()).body(payload)
}

fn capture_session_id<C: StreamableHttpContext>(context: &mut C, response: &reqwest::Response) {
    if let Some(session_id) = response
        .headers()
        .get(MCP_SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
    {
        context.set_session_id(Some(session_id));
    }
}

async fn send_message<C: StreamableHttpContext>(
    context: &mut C,
    message: ClientMessage,
) -> Result<ServerMessage, String> {
    let payload = serde_json::to_string(&message).map_err(|err| err.to_string())?;
    debug!(url = %context.endpoint(), "Sending MCP HTTP request");

    let response = build_post(context, payload)
        .send()
        .await
        .map_err(|err| err.to_string())?;
    if response.status() == reqwest::StatusCode::NOT_FOUND && context.session_id().is_some() {
        debug!(url = %context.endpoint(), "MCP server dropped the session");
        context.set_session_id(None);
        context.mark_uninitialized();
        return Err(SESSION_NOT_FOUND.to_string());
    }
    if !response.status().is_success() {
        return Err(format!("HTTP error: {}", response.status()));
    }
    capture_session_id(context, &response);

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();

    if is_event_stream_content_type(&content_type) {
        next_sse_server_message(response).await
    } else {
        let body = response.bytes().await.map_err(|err| err.to_string())?;
        serde_json::from_slice::<ServerMessage>(&body).map_err(|err| err.to_string())
    }
}

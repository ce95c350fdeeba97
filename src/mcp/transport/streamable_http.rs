use futures_util::StreamExt;
use rust_mcp_schema::schema_utils::ServerMessage;
use tracing::debug;

use crate::utils::sse::{sse_data_payload, SseLineBuffer};

/// Read an event-stream POST response until the JSON-RPC response or error
/// for our request arrives. Server-initiated requests and notifications on
/// the same stream are logged and skipped.
pub async fn next_sse_server_message(response: reqwest::Response) -> Result<ServerMessage, String> {
    let mut stream = response.bytes_stream();
    let mut buffer = SseLineBuffer::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| err.to_string())?;
        for line in buffer.push(&chunk) {
            if let Some(message) = terminal_message(&line)? {
                return Ok(message);
            }
        }
    }

    for line in buffer.finish() {
        if let Some(message) = terminal_message(&line)? {
            return Ok(message);
        }
    }

    Err("Empty event-stream response.".to_string())
}

fn terminal_message(line: &str) -> Result<Option<ServerMessage>, String> {
    match decode_sse_line(line)? {
        Some(message @ (ServerMessage::Response(_) | ServerMessage::Error(_))) => Ok(Some(message)),
        Some(other) => {
            debug!(message = ?other, "Skipping interleaved MCP server message");
            Ok(None)
        }
        None => Ok(None),
    }
}

fn decode_sse_line(line: &str) -> Result<Option<ServerMessage>, String> {
    let Some(payload) = sse_data_payload(line) else {
        return Ok(None);
    };

    if payload.is_empty() {
        return Ok(None);
    }

    serde_json::from_str::<ServerMessage>(payload)
        .map(Some)
        .map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_ignores_non_data_lines() {
        assert!(decode_sse_line("event: message").unwrap().is_none());
        assert!(decode_sse_line("data:").unwrap().is_none());
    }

    #[test]
    fn terminal_message_returns_responses_only() {
        let response = r#"data: {"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#;
        assert!(matches!(
            terminal_message(response).unwrap(),
            Some(ServerMessage::Response(_))
        ));

        let notification =
            r#"data: {"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#;
        assert!(terminal_message(notification).unwrap().is_none());
    }

    #[test]
    fn decode_reports_malformed_payloads() {
        assert!(decode_sse_line("data: {not json").is_err());
    }
}

//! Pairing rules between tool calls and tool results.
//!
//! A result must answer a call of the latest assistant message, at most one
//! result per call, and no call may be left unanswered when a turn ends.
//! Breaking any rule is a [`ProtocolViolation`]: a bug in the core, never a
//! model or tool failure.

use std::collections::HashSet;

use crate::core::message::{Message, ToolCall, ToolResult};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("tool result references unknown tool call {0}")]
    UnknownToolCall(String),
    #[error("tool call {0} received more than one result")]
    DuplicateResult(String),
    #[error("tool call {0} has no result")]
    MissingResult(String),
    #[error("tool results arrived with no assistant tool calls to answer")]
    NoPendingCalls,
}

/// Check that `results` answer `calls` exactly once each.
pub fn check_round(calls: &[ToolCall], results: &[ToolResult]) -> Result<(), ProtocolViolation> {
    if calls.is_empty() {
        return Err(ProtocolViolation::NoPendingCalls);
    }

    let known: HashSet<&str> = calls.iter().map(|call| call.id.as_str()).collect();
    let mut answered: HashSet<&str> = HashSet::new();
    for result in results {
        let id = result.tool_call_id.as_str();
        if !known.contains(id) {
            return Err(ProtocolViolation::UnknownToolCall(id.to_string()));
        }
        if !answered.insert(id) {
            return Err(ProtocolViolation::DuplicateResult(id.to_string()));
        }
    }

    match calls.iter().find(|call| !answered.contains(call.id.as_str())) {
        Some(missing) => Err(ProtocolViolation::MissingResult(missing.id.clone())),
        None => Ok(()),
    }
}

/// Tool calls of the latest assistant message that have no result message
/// following them.
pub fn unanswered_calls(messages: &[Message]) -> Vec<&ToolCall> {
    let Some(position) = messages
        .iter()
        .rposition(|message| message.role.is_assistant())
    else {
        return Vec::new();
    };

    let answered: HashSet<&str> = messages[position + 1..]
        .iter()
        .flat_map(|message| message.results())
        .map(|result| result.tool_call_id.as_str())
        .collect();

    messages[position]
        .calls()
        .iter()
        .filter(|call| !answered.contains(call.id.as_str()))
        .collect()
}

/// Latest assistant message's calls, the ones a new result round answers.
pub fn pending_calls(messages: &[Message]) -> &[ToolCall] {
    messages
        .iter()
        .rev()
        .find(|message| message.role.is_assistant())
        .map(Message::calls)
        .unwrap_or(&[])
}

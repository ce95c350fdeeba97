use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// A user's answer to a safety confirmation prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolPermissionDecision {
    AllowOnce,
    AllowSession,
    DenyOnce,
    Block,
}

impl ToolPermissionDecision {
    pub fn allows(self) -> bool {
        matches!(self, Self::AllowOnce | Self::AllowSession)
    }

    /// Whether the decision outlives the prompt that produced it.
    pub fn is_sticky(self) -> bool {
        matches!(self, Self::AllowSession | Self::Block)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AllowOnce => "allow_once",
            Self::AllowSession => "allow_session",
            Self::DenyOnce => "deny_once",
            Self::Block => "block",
        }
    }
}

impl fmt::Display for ToolPermissionDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolPermissionDecision {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" | "allow" | "allow_once" | "once" => Ok(Self::AllowOnce),
            "a" | "always" | "allow_session" | "session" => Ok(Self::AllowSession),
            "n" | "no" | "deny" | "deny_once" => Ok(Self::DenyOnce),
            "b" | "block" => Ok(Self::Block),
            other => Err(format!("Unknown permission decision: {other}")),
        }
    }
}

/// Per-conversation memory of sticky confirmation decisions, keyed by
/// browser action name.
#[derive(Debug, Default)]
pub struct ToolPermissionStore {
    decisions: HashMap<String, ToolPermissionDecision>,
}

impl ToolPermissionStore {
    pub fn record(&mut self, action: &str, decision: ToolPermissionDecision) {
        if !decision.is_sticky() {
            return;
        }
        self.decisions.insert(action.to_string(), decision);
    }

    pub fn decision_for(&self, action: &str) -> Option<ToolPermissionDecision> {
        self.decisions.get(action).copied()
    }
}

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Google,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolMode {
    ToolRouter,
}

impl ToolMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolMode::ToolRouter => "tool-router",
        }
    }
}

impl FromStr for ToolMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tool-router" | "tool_router" | "router" => Ok(ToolMode::ToolRouter),
            other => Err(format!("Unknown tool mode: {other}")),
        }
    }
}

impl fmt::Display for ToolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-conversation settings, read-only to the core.
#[derive(Clone, PartialEq, Eq)]
pub struct Settings {
    pub provider: Provider,
    pub api_key: String,
    pub model: String,
    pub tool_mode: Option<ToolMode>,
    pub composio_api_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("No model API key configured. Set GEMINI_API_KEY or [model] api_key.")]
    MissingApiKey,
    #[error("No model name configured.")]
    MissingModel,
    #[error("Tool-router mode needs a session API key. Set COMPOSIO_API_KEY or [session] api_key.")]
    MissingSessionApiKey,
}

impl Settings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.api_key.trim().is_empty() {
            return Err(SettingsError::MissingApiKey);
        }
        if self.model.trim().is_empty() {
            return Err(SettingsError::MissingModel);
        }
        if self.tool_router_enabled() && self.session_key().is_none() {
            return Err(SettingsError::MissingSessionApiKey);
        }
        Ok(())
    }

    pub fn tool_router_enabled(&self) -> bool {
        self.tool_mode == Some(ToolMode::ToolRouter)
    }

    /// Key the shared session manager indexes sessions by.
    pub fn session_key(&self) -> Option<&str> {
        self.composio_api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("provider", &self.provider)
            .field("api_key", &mask_secret(&self.api_key))
            .field("model", &self.model)
            .field("tool_mode", &self.tool_mode)
            .field(
                "composio_api_key",
                &self.composio_api_key.as_deref().map(mask_secret),
            )
            .finish()
    }
}

/// Stable, non-reversible label for a secret, safe to log.
pub fn key_fingerprint(secret: &str) -> String {
    format!("{:08x}", crc32fast::hash(secret.as_bytes()))
}

/// Show only the last four characters of a secret.
pub fn mask_secret(secret: &str) -> String {
    let count = secret.chars().count();
    if count <= 4 {
        return "*".repeat(count);
    }
    let tail: String = secret.chars().skip(count - 4).collect();
    format!("{}{}", "*".repeat(count - 4), tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings {
            provider: Provider::Google,
            api_key: "gemini-key".to_string(),
            model: "gemini-2.5-flash".to_string(),
            tool_mode: None,
            composio_api_key: None,
        }
    }

    #[test]
    fn validate_rejects_blank_api_key_and_model() {
        let mut blank_key = settings();
        blank_key.api_key = "  ".to_string();
        assert_eq!(blank_key.validate(), Err(SettingsError::MissingApiKey));

        let mut blank_model = settings();
        blank_model.model = String::new();
        assert_eq!(blank_model.validate(), Err(SettingsError::MissingModel));
    }

    #[test]
    fn tool_router_requires_session_key() {
        let mut router = settings();
        router.tool_mode = Some(ToolMode::ToolRouter);
        assert_eq!(router.validate(), Err(SettingsError::MissingSessionApiKey));

        router.composio_api_key = Some("cmp-key".to_string());
        assert_eq!(router.validate(), Ok(()));
        assert_eq!(router.session_key(), Some("cmp-key"));
    }

    #[test]
    fn debug_output_masks_keys() {
        let mut value = settings();
        value.composio_api_key = Some("composio-secret".to_string());
        let rendered = format!("{value:?}");
        assert!(!rendered.contains("gemini-key"));
        assert!(!rendered.contains("composio-secret"));
        assert!(rendered.contains("******-key"));
    }

    #[test]
    fn tool_mode_parses_common_spellings() {
        assert_eq!("tool-router".parse::<ToolMode>(), Ok(ToolMode::ToolRouter));
        assert_eq!("TOOL_ROUTER".parse::<ToolMode>(), Ok(ToolMode::ToolRouter));
        assert!("off".parse::<ToolMode>().is_err());
    }

    #[test]
    fn fingerprint_is_stable_and_hides_key() {
        let first = key_fingerprint("secret");
        assert_eq!(first, key_fingerprint("secret"));
        assert_eq!(first.len(), 8);
        assert_ne!(first, key_fingerprint("other"));
    }
}

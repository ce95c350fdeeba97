use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::api::gemini::DEFAULT_GEMINI_BASE_URL;
use crate::core::dispatcher::{DispatchPolicy, DEFAULT_BROWSER_TIMEOUT_SECS, DEFAULT_MCP_TIMEOUT_SECS};
use crate::core::session::{
    SessionPolicy, DEFAULT_BOOTSTRAP_TIMEOUT_SECS, DEFAULT_RENEWAL_RETRIES,
    DEFAULT_SESSION_TTL_SECS,
};
use crate::core::settings::{Provider, Settings, ToolMode};
use crate::core::turn::{TurnPolicy, DEFAULT_MAX_TOOL_ROUNDS, DEFAULT_MODEL_TIMEOUT_SECS};
use crate::utils::url::parse_absolute_http_url;

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

pub const ENV_MODEL_API_KEY: &str = "GEMINI_API_KEY";
pub const ENV_SESSION_API_KEY: &str = "COMPOSIO_API_KEY";
pub const ENV_TOOL_MODE: &str = "PAGEPILOT_TOOL_MODE";

/// Keys `pagepilot set` understands.
pub const SETTABLE_KEYS: &[&str] = &[
    "model",
    "tool-mode",
    "bootstrap-url",
    "max-tool-rounds",
    "browser-tools",
];

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    pub name: String,
    pub api_base: String,
    /// Used when `GEMINI_API_KEY` is unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_MODEL.to_string(),
            api_base: DEFAULT_GEMINI_BASE_URL.to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Session service endpoint that mints tool-router sessions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bootstrap_url: Option<String>,
    /// Used when `COMPOSIO_API_KEY` is unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub default_ttl_secs: u64,
    pub renewal_retries: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bootstrap_url: None,
            api_key: None,
            default_ttl_secs: DEFAULT_SESSION_TTL_SECS,
            renewal_retries: DEFAULT_RENEWAL_RETRIES,
        }
    }
}

/// Bounds in seconds for each external call.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub model: u64,
    pub bootstrap: u64,
    pub mcp: u64,
    pub browser: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL_TIMEOUT_SECS,
            bootstrap: DEFAULT_BOOTSTRAP_TIMEOUT_SECS,
            mcp: DEFAULT_MCP_TIMEOUT_SECS,
            browser: DEFAULT_BROWSER_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct TurnConfig {
    pub max_tool_rounds: usize,
    pub browser_tools: bool,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            browser_tools: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// `tool-router` routes remote tools through the session service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_mode: Option<ToolMode>,
    pub model: ModelConfig,
    pub session: SessionConfig,
    pub timeouts: TimeoutConfig,
    pub turn: TurnConfig,
}

pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl Config {
    /// Build per-conversation settings. Environment values win over the
    /// file; `env` is injected so tests never read the process environment.
    pub fn resolve_settings<F>(&self, env: F) -> Result<Settings, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = non_empty(env(ENV_MODEL_API_KEY))
            .or_else(|| non_empty(self.model.api_key.clone()))
            .unwrap_or_default();
        let composio_api_key = non_empty(env(ENV_SESSION_API_KEY))
            .or_else(|| non_empty(self.session.api_key.clone()));
        let tool_mode = match non_empty(env(ENV_TOOL_MODE)) {
            Some(raw) if raw.eq_ignore_ascii_case("none") || raw.eq_ignore_ascii_case("off") => None,
            Some(raw) => Some(raw.parse::<ToolMode>()?),
            None => self.tool_mode,
        };

        Ok(Settings {
            provider: Provider::Google,
            api_key,
            model: self.model.name.trim().to_string(),
            tool_mode,
            composio_api_key,
        })
    }

    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            default_ttl: Duration::from_secs(self.session.default_ttl_secs.max(1)),
            bootstrap_timeout: Duration::from_secs(self.timeouts.bootstrap.max(1)),
            renewal_retries: self.session.renewal_retries,
        }
    }

    pub fn dispatch_policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            browser_timeout: Duration::from_secs(self.timeouts.browser.max(1)),
            mcp_timeout: Duration::from_secs(self.timeouts.mcp.max(1)),
        }
    }

    pub fn turn_policy(&self) -> TurnPolicy {
        TurnPolicy {
            max_tool_rounds: self.turn.max_tool_rounds.max(1),
            model_timeout: Duration::from_secs(self.timeouts.model.max(1)),
            dispatch: self.dispatch_policy(),
            browser_tools: self.turn.browser_tools,
        }
    }

    pub fn mcp_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.mcp.max(1))
    }

    /// Apply one `pagepilot set` assignment. `tool-mode` and `bootstrap-url`
    /// accept `off` to clear the value.
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<(), String> {
        let value = value.trim();
        let clears = value.is_empty() || value.eq_ignore_ascii_case("off");
        match key {
            "model" => {
                if value.is_empty() {
                    return Err("model must not be empty".to_string());
                }
                self.model.name = value.to_string();
            }
            "tool-mode" => {
                self.tool_mode = if clears || value.eq_ignore_ascii_case("none") {
                    None
                } else {
                    Some(value.parse::<ToolMode>()?)
                };
            }
            "bootstrap-url" => {
                self.session.bootstrap_url = if clears {
                    None
                } else {
                    parse_absolute_http_url(value).map_err(|err| format!("bootstrap-url {err}"))?;
                    Some(value.to_string())
                };
            }
            "max-tool-rounds" => {
                let rounds = value
                    .parse::<usize>()
                    .ok()
                    .filter(|rounds| *rounds > 0)
                    .ok_or_else(|| format!("max-tool-rounds must be a positive integer, got {value:?}"))?;
                self.turn.max_tool_rounds = rounds;
            }
            "browser-tools" => {
                self.turn.browser_tools = match value.to_ascii_lowercase().as_str() {
                    "true" | "on" | "yes" => true,
                    "false" | "off" | "no" => false,
                    _ => return Err(format!("browser-tools must be on or off, got {value:?}")),
                };
            }
            _ => {
                return Err(format!(
                    "Unknown key: {key}. Settable keys: {}",
                    SETTABLE_KEYS.join(", ")
                ))
            }
        }
        Ok(())
    }
}

use std::fmt::Write;

use crate::core::config::data::Config;
use crate::core::settings::mask_secret;

fn masked(secret: Option<&str>) -> String {
    match secret {
        Some(secret) => mask_secret(secret),
        None => "(unset)".to_string(),
    }
}

impl Config {
    /// Human-readable dump with secrets masked.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Current configuration:");
        match self.tool_mode {
            Some(mode) => {
                let _ = writeln!(out, "  tool-mode: {mode}");
            }
            None => {
                let _ = writeln!(out, "  tool-mode: (off)");
            }
        }
        let _ = writeln!(out, "  [model]");
        let _ = writeln!(out, "    name: {}", self.model.name);
        let _ = writeln!(out, "    api-base: {}", self.model.api_base);
        let _ = writeln!(out, "    api-key: {}", masked(self.model.api_key.as_deref()));
        let _ = writeln!(out, "  [session]");
        let _ = writeln!(
            out,
            "    bootstrap-url: {}",
            self.session.bootstrap_url.as_deref().unwrap_or("(unset)")
        );
        let _ = writeln!(out, "    api-key: {}", masked(self.session.api_key.as_deref()));
        let _ = writeln!(out, "    default-ttl: {}s", self.session.default_ttl_secs);
        let _ = writeln!(out, "    renewal-retries: {}", self.session.renewal_retries);
        let _ = writeln!(out, "  [timeouts]");
        let _ = writeln!(
            out,
            "    model: {}s, bootstrap: {}s, mcp: {}s, browser: {}s",
            self.timeouts.model, self.timeouts.bootstrap, self.timeouts.mcp, self.timeouts.browser
        );
        let _ = writeln!(out, "  [turn]");
        let _ = writeln!(out, "    max-tool-rounds: {}", self.turn.max_tool_rounds);
        let _ = writeln!(
            out,
            "    browser-tools: {}",
            if self.turn.browser_tools { "on" } else { "off" }
        );
        out
    }

    pub fn print_all(&self) {
        print!("{}", self.render());
    }
}

//! Diagnostic logging setup for the command-line host.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_FILTER_ENV: &str = "PAGEPILOT_LOG";
pub const DEFAULT_LOG_FILTER: &str = "warn";

/// Filter directives from `PAGEPILOT_LOG`, then `RUST_LOG`, then `warn`.
pub fn filter_directives<F>(env: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    [LOG_FILTER_ENV, "RUST_LOG"]
        .into_iter()
        .filter_map(|name| env(name))
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string())
}

fn build_filter(directives: &str) -> EnvFilter {
    EnvFilter::try_new(directives).unwrap_or_else(|err| {
        eprintln!("Ignoring invalid log filter {directives:?}: {err}");
        EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

/// Install the global subscriber. Output goes to `log_file` when given
/// (appending), otherwise to stderr.
pub fn init_tracing(log_file: Option<&Path>) -> std::io::Result<()> {
    let filter = build_filter(&filter_directives(|name| std::env::var(name).ok()));
    let registry = tracing_subscriber::registry().with(filter);

    match log_file {
        Some(path) => {
            let file: File = OpenOptions::new().create(true).append(true).open(path)?;
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(Mutex::new(file));
            let _ = registry.with(layer).try_init();
        }
        None => {
            let layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr);
            let _ = registry.with(layer).try_init();
        }
    }
    Ok(())
}

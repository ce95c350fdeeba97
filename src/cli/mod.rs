//! Command-line interface parsing and handling
//!
//! This module handles parsing command-line arguments and executing the appropriate commands.

pub mod say;
pub mod session;

use std::error::Error;
use std::path::Path;

use clap::{Parser, Subcommand};

use crate::cli::say::run_say;
use crate::cli::session::{run_session, run_tools};
use crate::core::config::data::path_display;
use crate::core::config::Config;
use crate::utils::logging::init_tracing;

#[derive(Parser, Debug)]
#[command(name = "pagepilot")]
#[command(about = "Run browser-agent turns against Gemini and tool-router MCP endpoints")]
#[command(
    long_about = "pagepilot runs the turn loop of a browser-resident AI agent from a terminal. \
It streams model replies, dispatches tool calls to remote MCP endpoints of a tool-router \
session and keeps that session alive.\n\n\
Environment Variables:\n\
  GEMINI_API_KEY        Model API key (falls back to [model] api_key)\n\
  COMPOSIO_API_KEY      Session service key (falls back to [session] api_key)\n\
  PAGEPILOT_TOOL_MODE   Set to tool-router to route remote tools, or off\n\
  PAGEPILOT_LOG         Log filter directives (falls back to RUST_LOG, then warn)"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Model to use instead of the configured one
    #[arg(short = 'm', long, global = true, value_name = "MODEL")]
    pub model: Option<String>,

    /// Write diagnostic logs to this file instead of stderr
    #[arg(short = 'l', long, global = true, value_name = "FILE")]
    pub log: Option<String>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Run one turn and print the reply
    Say {
        /// Prompt text
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        prompt: Vec<String>,
    },
    /// Acquire a tool-router session and print its endpoints
    Session,
    /// List the remote tools of the current session
    Tools,
    /// Print the configuration file path and values
    Config,
    /// Set a configuration value (model, tool-mode, bootstrap-url,
    /// max-tool-rounds, browser-tools)
    Set {
        /// Configuration key to set
        key: String,
        /// Value for the key
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        value: Vec<String>,
    },
}

pub fn main() -> Result<(), Box<dyn Error>> {
    tokio::runtime::Runtime::new()?.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_tracing(args.log.as_deref().map(Path::new))?;

    let mut config = Config::load()?;
    if let Commands::Set { key, value } = &args.command {
        return run_set(config, key, &value.join(" "));
    }
    // Overrides apply to this run only and are never saved.
    if let Some(model) = args.model.filter(|model| !model.trim().is_empty()) {
        config.model.name = model;
    }

    match args.command {
        Commands::Say { prompt } => run_say(prompt, &config).await,
        Commands::Session => run_session(&config).await,
        Commands::Tools => run_tools(&config).await,
        Commands::Config => {
            println!("Config file: {}", path_display(Config::config_path()?));
            config.print_all();
            Ok(())
        }
        Commands::Set { .. } => Ok(()),
    }
}

fn run_set(mut config: Config, key: &str, value: &str) -> Result<(), Box<dyn Error>> {
    if let Err(message) = config.set_value(key, value) {
        eprintln!("❌ {message}");
        std::process::exit(1);
    }
    config.save()?;
    println!("✅ Set {key} to: {value}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn say_collects_prompt_words_and_global_flags() {
        let args = Args::try_parse_from([
            "pagepilot",
            "--model",
            "gemini-2.5-pro",
            "say",
            "open",
            "the",
            "docs",
        ])
        .unwrap();

        assert_eq!(args.model.as_deref(), Some("gemini-2.5-pro"));
        assert_eq!(
            args.command,
            Commands::Say {
                prompt: vec!["open".to_string(), "the".to_string(), "docs".to_string()]
            }
        );
    }

    #[test]
    fn log_flag_is_global() {
        let args = Args::try_parse_from(["pagepilot", "tools", "--log", "trace.log"]).unwrap();
        assert_eq!(args.log.as_deref(), Some("trace.log"));
        assert_eq!(args.command, Commands::Tools);
    }

    #[test]
    fn set_joins_value_words() {
        let args =
            Args::try_parse_from(["pagepilot", "set", "model", "gemini-2.5-pro"]).unwrap();
        assert_eq!(
            args.command,
            Commands::Set {
                key: "model".to_string(),
                value: vec!["gemini-2.5-pro".to_string()]
            }
        );
        assert!(Args::try_parse_from(["pagepilot", "set", "model"]).is_err());
    }

    #[test]
    fn a_command_is_required() {
        assert!(Args::try_parse_from(["pagepilot"]).is_err());
    }
}

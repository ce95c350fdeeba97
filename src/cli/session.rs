//! Session inspection commands

use std::error::Error;

use crate::core::clock::format_timestamp;
use crate::core::config::Config;
use crate::core::context::SharedContext;
use crate::core::session::Session;
use crate::core::settings::{key_fingerprint, SettingsError};

async fn acquire(config: &Config) -> Result<(SharedContext, Session), Box<dyn Error>> {
    let settings = config.resolve_settings(|name| std::env::var(name).ok())?;
    let Some(key) = settings.session_key() else {
        eprintln!("❌ {}", SettingsError::MissingSessionApiKey);
        std::process::exit(1);
    };

    let shared = SharedContext::from_config(config)?;
    match shared.sessions.acquire(key).await {
        Ok(session) => Ok((shared, session)),
        Err(err) => {
            eprintln!("❌ {err}");
            eprintln!("   (session key {})", key_fingerprint(key));
            std::process::exit(1);
        }
    }
}

pub async fn run_session(config: &Config) -> Result<(), Box<dyn Error>> {
    let (_, session) = acquire(config).await?;

    println!("Session {}", session.session_id);
    println!("  tool router: {}", session.tool_router_mcp_url);
    println!("  chat:        {}", session.chat_session_mcp_url);
    println!("  expires:     {}", format_timestamp(session.expires_at));
    Ok(())
}

pub async fn run_tools(config: &Config) -> Result<(), Box<dyn Error>> {
    let (shared, session) = acquire(config).await?;

    for url in session.endpoints() {
        println!("{url}");
        match shared.pool.tools_for(&url).await {
            Ok(tools) if tools.is_empty() => println!("  (no tools)"),
            Ok(tools) => {
                for tool in tools.values() {
                    let summary = tool
                        .description
                        .as_deref()
                        .and_then(|text| text.lines().next())
                        .unwrap_or("");
                    if summary.is_empty() {
                        println!("  {}", tool.name);
                    } else {
                        println!("  {} - {summary}", tool.name);
                    }
                }
            }
            Err(err) => eprintln!("  ⚠️  {err}"),
        }
    }

    shared.shutdown().await;
    Ok(())
}

//! Single-turn "say" command

use std::error::Error;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::api::gemini::{GeminiClient, StreamMessage};
use crate::core::browser::DetachedBrowser;
use crate::core::config::Config;
use crate::core::context::SharedContext;
use crate::core::dispatcher::PendingAction;
use crate::core::permissions::ToolPermissionDecision;
use crate::core::turn::{Conversation, TurnOutcome};

pub async fn run_say(prompt: Vec<String>, config: &Config) -> Result<(), Box<dyn Error>> {
    let prompt = prompt.join(" ");
    if prompt.trim().is_empty() {
        eprintln!("Usage: pagepilot say <prompt>");
        std::process::exit(1);
    }

    let settings = config.resolve_settings(|name| std::env::var(name).ok())?;
    let shared = SharedContext::from_config(config)?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let model = GeminiClient::new(config.model.api_base.clone())?.with_observer(tx);

    // No browser is attached to a terminal.
    let mut policy = config.turn_policy();
    policy.browser_tools = false;
    let mut conversation = Conversation::new(
        Arc::new(model),
        Arc::new(DetachedBrowser),
        shared.clone(),
        policy,
    );

    if let Err(err) = conversation.initialize(settings).await {
        eprintln!("❌ Error: {err}");
        shared.shutdown().await;
        std::process::exit(1);
    }

    let printer = tokio::spawn(async move {
        let mut printed = false;
        while let Some(message) = rx.recv().await {
            match message {
                StreamMessage::Chunk(content) => {
                    print!("{content}");
                    let _ = io::stdout().flush();
                    printed = true;
                }
                StreamMessage::End if printed => {
                    println!();
                    printed = false;
                }
                StreamMessage::End | StreamMessage::Error(_) => {}
            }
        }
    });

    let mut outcome = conversation.send(prompt, None).await?;
    let failure = loop {
        match outcome {
            TurnOutcome::Completed { .. } | TurnOutcome::Cancelled => break None,
            TurnOutcome::Failed { error } => break Some(error),
            TurnOutcome::AwaitingConfirmation(pending) => {
                let decision = ask_confirmation(&pending)?;
                outcome = conversation.resolve_confirmation(decision).await?;
            }
        }
    };

    drop(conversation);
    let _ = printer.await;
    shared.shutdown().await;

    if let Some(error) = failure {
        eprintln!("\n❌ Error: {error}");
        std::process::exit(1);
    }
    Ok(())
}

fn ask_confirmation(pending: &PendingAction) -> io::Result<ToolPermissionDecision> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        eprintln!();
        if let Some(message) = &pending.message {
            eprintln!("⚠️  {message}");
        }
        eprint!(
            "Run {}? [y]es / [a]lways / [n]o / [b]lock: ",
            pending.action.name()
        );
        io::stderr().flush()?;

        let Some(line) = lines.next().transpose()? else {
            return Ok(ToolPermissionDecision::DenyOnce);
        };
        match parse_answer(&line) {
            Some(decision) => return Ok(decision),
            None => eprintln!("Please answer y, a, n or b."),
        }
    }
}

fn parse_answer(line: &str) -> Option<ToolPermissionDecision> {
    let answer = line.trim();
    if answer.is_empty() {
        return None;
    }
    answer.parse().ok()
}

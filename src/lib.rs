//! pagepilot is the turn loop of a browser-resident AI agent.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns conversation state, the turn controller, tool dispatch,
//!   tool-router sessions and payload validation.
//! - [`mcp`] provides Model Context Protocol clients over streamable HTTP and
//!   the per-endpoint client pool.
//! - [`api`] defines model payloads and the streaming Gemini client.
//! - [`cli`] is a small host that runs turns from a terminal.
//!
//! Runtime entrypoints live in the binary crate (`src/main.rs`) and route
//! through [`crate::cli::main`].

pub mod api;
pub mod cli;
pub mod core;
pub mod mcp;
pub mod utils;

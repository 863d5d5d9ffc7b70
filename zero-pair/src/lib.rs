//! zero-pair - HTTP front-end for AI pair-programming sessions.
//!
//! Each session binds a working directory to a conversational coding
//! engine. `/api/v1` exposes chat and history; `/api/v2` adds the slash
//! command surface (file management, git, lint, test, shell).

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod commands;
pub mod engine;
pub mod error;
pub mod git;
pub mod llm;
pub mod routes;
pub mod session;
pub mod shell;

#[cfg(test)]
mod testing;

pub use commands::{CommandDispatcher, Invocation};
pub use engine::{ChatMode, Engine, EngineFactory, EngineSpec, Io, WorkspaceEngineFactory};
pub use error::PairError;
pub use llm::{CompletionClient, CompletionRequest, CompletionResponse, LlmError};
pub use routes::{build_router, AppState};
pub use session::{Capabilities, RegistrySettings, SessionConfig, SessionRegistry};
pub use shell::{CommandOutput, ShellRunner};

//! The pair-programming engine seam.
//!
//! An [`Engine`] owns one editing conversation: a root directory, the
//! files in the chat, model settings and history. Sessions hold exactly one
//! engine, built by an [`EngineFactory`].

pub mod io;
mod prompts;
mod workspace;

pub use io::{CaptureGuard, Io, OutputSink, TracingSink};
pub use workspace::{WorkspaceEngine, WorkspaceEngineFactory};

use crate::session::SessionConfig;
use crate::shell::CommandOutput;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// One turn of chat history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// How the engine treats a chat message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    /// Propose edits to the files in the chat.
    #[default]
    Code,
    /// Answer questions without editing.
    Ask,
    /// Discuss design, then hand off to the editor model.
    Architect,
    /// Questions about using the tool itself.
    Help,
}

impl ChatMode {
    pub const ALL: [ChatMode; 4] = [
        ChatMode::Code,
        ChatMode::Ask,
        ChatMode::Architect,
        ChatMode::Help,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChatMode::Code => "code",
            ChatMode::Ask => "ask",
            ChatMode::Architect => "architect",
            ChatMode::Help => "help",
        }
    }
}

impl fmt::Display for ChatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChatMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChatMode::ALL
            .into_iter()
            .find(|m| m.as_str() == s.trim())
            .ok_or_else(|| {
                let valid: Vec<&str> = ChatMode::ALL.iter().map(ChatMode::as_str).collect();
                format!("Unknown chat mode '{}'. Valid modes: {}", s.trim(), valid.join(", "))
            })
    }
}

/// Snapshot of an engine's configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    pub root: PathBuf,
    pub main_model: String,
    pub weak_model: Option<String>,
    pub editor_model: Option<String>,
    pub editor_edit_format: Option<String>,
    pub edit_format: String,
    pub chat_mode: ChatMode,
    pub git: bool,
    pub yes_always: bool,
    pub pretty: bool,
    pub verbose: bool,
    pub lint_cmd: Option<String>,
    pub test_cmd: Option<String>,
}

/// A single pair-programming conversation over a directory.
///
/// Methods that return nothing report only through [`Engine::io`]; callers
/// wanting that text wrap the call in [`Io::capture`].
#[async_trait]
pub trait Engine: Send + Sync {
    fn io(&self) -> Io;

    fn root(&self) -> &Path;

    fn settings(&self) -> EngineSettings;

    fn chat_mode(&self) -> ChatMode;

    fn set_chat_mode(&mut self, mode: ChatMode);

    fn history(&self) -> Vec<ChatMessage>;

    fn clear_history(&mut self);

    /// Editable files in the chat, relative to the root.
    fn chat_files(&self) -> Vec<String>;

    fn read_only_files(&self) -> Vec<String>;

    /// Every file the engine knows about under the root.
    async fn all_files(&self) -> anyhow::Result<Vec<String>>;

    /// Known files not yet in the chat.
    async fn addable_files(&self) -> anyhow::Result<Vec<String>> {
        let in_chat: BTreeSet<String> = self
            .chat_files()
            .into_iter()
            .chain(self.read_only_files())
            .collect();
        Ok(self
            .all_files()
            .await?
            .into_iter()
            .filter(|f| !in_chat.contains(f))
            .collect())
    }

    /// Send a message in the current chat mode and return the reply.
    async fn chat(&mut self, message: &str) -> anyhow::Result<String>;

    /// Send one message in `mode`, then return to the previous mode.
    async fn chat_in_mode(&mut self, mode: ChatMode, message: &str) -> anyhow::Result<String> {
        let previous = self.chat_mode();
        self.set_chat_mode(mode);
        let result = self.chat(message).await;
        self.set_chat_mode(previous);
        result
    }

    /// Answer one message in `mode` without reading or recording chat history.
    async fn consult(&mut self, mode: ChatMode, message: &str) -> anyhow::Result<String>;

    async fn switch_model(&mut self, model: &str) -> anyhow::Result<String>;

    /// Add editable files, creating missing ones when confirmations are automatic.
    async fn add_files(&mut self, files: &[String]) -> anyhow::Result<Vec<String>>;

    async fn add_read_only(&mut self, files: &[String]) -> anyhow::Result<Vec<String>>;

    /// Remove files from the chat. An empty list removes every file.
    fn drop_files(&mut self, files: &[String]) -> Vec<String>;

    async fn repo_map(&mut self, force_refresh: bool) -> anyhow::Result<String>;

    async fn lint(&mut self, files: &[String]) -> anyhow::Result<CommandOutput>;

    async fn test(&mut self, command: Option<&str>) -> anyhow::Result<CommandOutput>;

    async fn git(&mut self, args: &str) -> anyhow::Result<CommandOutput>;

    async fn diff(&mut self) -> anyhow::Result<String>;

    async fn commit(&mut self, message: Option<&str>) -> anyhow::Result<String>;

    async fn undo(&mut self) -> anyhow::Result<String>;

    /// Emit a context-window token report to the output sink.
    async fn report_tokens(&mut self) -> anyhow::Result<()>;

    /// Emit the current settings to the output sink.
    fn report_settings(&self);

    /// Flush any state that outlives the session.
    async fn shutdown(&mut self) -> anyhow::Result<()>;
}

/// What a factory needs to build an engine for a new session.
#[derive(Debug)]
pub struct EngineSpec {
    pub root: PathBuf,
    pub model: String,
    pub config: SessionConfig,
    pub io: Io,
}

#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(&self, spec: EngineSpec) -> anyhow::Result<Box<dyn Engine>>;
}

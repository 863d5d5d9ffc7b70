//! Reference engine over a local directory.
//!
//! Tracks which files are in the chat, keeps history, builds prompts from
//! file contents and sends them through a [`CompletionClient`]. It does not
//! apply edits proposed by the model.

use super::prompts;
use super::{ChatMessage, ChatMode, Engine, EngineFactory, EngineSettings, EngineSpec, Io};
use crate::error::PairError;
use crate::git::GitRepo;
use crate::llm::{estimate_tokens, CompletionClient, CompletionRequest, Message};
use crate::shell::{CommandOutput, ShellRunner};
use anyhow::{Context, Result};
use async_trait::async_trait;
use ignore::WalkBuilder;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use zero_common::util::truncate_with_ellipsis;

const DEFAULT_EDIT_FORMAT: &str = "diff";
const FALLBACK_COMMIT_MESSAGE: &str = "Update files";
const MAX_COMMIT_DIFF_CHARS: usize = 20_000;

/// Engine options carried in the session config's extra keys.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct EngineOptions {
    lint_cmd: Option<String>,
    test_cmd: Option<String>,
    read: Vec<String>,
    chat_history_file: Option<PathBuf>,
}

const OPTION_KEYS: &[&str] = &["lint_cmd", "test_cmd", "read", "chat_history_file"];

fn invalid(message: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(PairError::InvalidRequest(message.into()))
}

/// Lexically resolve `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Relative path with `/` separators.
fn rel_string(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn walk_files(root: &Path) -> Vec<String> {
    let walker = WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(true)
        .git_exclude(true)
        .require_git(false)
        .filter_entry(|entry| entry.file_name() != ".git")
        .build();

    let mut files: Vec<String> = walker
        .flatten()
        .filter(|e| e.file_type().is_some_and(|ft| ft.is_file()))
        .filter_map(|e| e.path().strip_prefix(root).ok().map(rel_string))
        .collect();
    files.sort();
    files
}

/// Engine that works directly on the files under a session root.
pub struct WorkspaceEngine {
    root: PathBuf,
    io: Io,
    client: Arc<dyn CompletionClient>,
    shell: ShellRunner,
    git: Option<GitRepo>,
    main_model: String,
    weak_model: Option<String>,
    editor_model: Option<String>,
    editor_edit_format: Option<String>,
    edit_format: String,
    chat_mode: ChatMode,
    yes_always: bool,
    pretty: bool,
    verbose: bool,
    options: EngineOptions,
    chat_files: BTreeSet<String>,
    read_only: BTreeSet<String>,
    history: Vec<ChatMessage>,
    flushed: usize,
    /// Last map with the file listing it was built from.
    repo_map: Option<(Vec<String>, String)>,
    session_commits: Vec<String>,
}

impl WorkspaceEngine {
    pub fn new(
        spec: EngineSpec,
        client: Arc<dyn CompletionClient>,
        shell: ShellRunner,
        git: Option<GitRepo>,
    ) -> Result<Self> {
        let config = spec.config;
        let options: EngineOptions =
            serde_json::from_value(serde_json::Value::Object(config.extra.clone()))
                .map_err(|e| invalid(format!("Invalid engine option: {e}")))?;

        let ignored: Vec<&str> = config
            .extra
            .keys()
            .map(String::as_str)
            .filter(|k| !OPTION_KEYS.contains(k))
            .collect();
        if !ignored.is_empty() {
            tracing::debug!(keys = ?ignored, "Ignoring unrecognised session options");
        }

        Ok(Self {
            root: spec.root,
            io: spec.io,
            client,
            shell,
            git,
            main_model: spec.model,
            weak_model: non_blank(config.weak_model),
            editor_model: non_blank(config.editor_model),
            editor_edit_format: non_blank(config.editor_edit_format),
            edit_format: non_blank(config.edit_format)
                .unwrap_or_else(|| DEFAULT_EDIT_FORMAT.to_string()),
            chat_mode: ChatMode::default(),
            yes_always: config.yes_always,
            pretty: config.pretty,
            verbose: config.verbose,
            options,
            chat_files: BTreeSet::new(),
            read_only: BTreeSet::new(),
            history: Vec::new(),
            flushed: 0,
            repo_map: None,
            session_commits: Vec::new(),
        })
    }

    fn git_repo(&self) -> Result<&GitRepo> {
        self.git
            .as_ref()
            .ok_or_else(|| invalid("Git is not enabled for this session"))
    }

    fn model_for(&self, mode: ChatMode) -> &str {
        match mode {
            ChatMode::Help => self.weak_model.as_deref().unwrap_or(&self.main_model),
            _ => &self.main_model,
        }
    }

    /// Absolute and root-relative form of a user-supplied path.
    fn resolve_path(&self, name: &str) -> Result<(PathBuf, String)> {
        let candidate = Path::new(name.trim());
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };
        let normalized = normalize(&joined);
        let rel = normalized
            .strip_prefix(&self.root)
            .map_err(|_| anyhow::anyhow!("Skipping {name}: outside the session directory"))?;
        let rel = rel_string(rel);
        Ok((normalized, rel))
    }

    /// Known files at or under `rel` (the whole tree when `rel` is empty).
    async fn files_under(&self, rel: &str) -> Result<Vec<String>> {
        let all = self.all_files().await?;
        if rel.is_empty() {
            return Ok(all);
        }
        let prefix = format!("{rel}/");
        Ok(all.into_iter().filter(|f| f.starts_with(&prefix)).collect())
    }

    /// Expand one name into root-relative files, creating it if allowed.
    async fn expand(&self, name: &str, create: bool) -> Result<std::result::Result<Vec<String>, String>> {
        if name.trim().is_empty() {
            return Ok(Err(format!("No files matched '{name}'")));
        }
        let (abs, rel) = match self.resolve_path(name) {
            Ok(resolved) => resolved,
            Err(e) => return Ok(Err(e.to_string())),
        };

        let files = if abs.is_dir() {
            self.files_under(&rel).await?
        } else if abs.is_file() {
            vec![rel]
        } else if create && self.yes_always && !rel.is_empty() {
            if let Some(parent) = abs.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            tokio::fs::write(&abs, "")
                .await
                .with_context(|| format!("Failed to create {}", abs.display()))?;
            self.io.tool_output(format!("Creating empty file {rel}"));
            vec![rel]
        } else {
            Vec::new()
        };

        if files.is_empty() {
            Ok(Err(format!("No files matched '{name}'")))
        } else {
            Ok(Ok(files))
        }
    }

    async fn read_file(&self, rel: &str) -> Option<String> {
        match tokio::fs::read_to_string(self.root.join(rel)).await {
            Ok(content) => Some(content),
            Err(e) => {
                self.io.tool_error(format!("Unable to read {rel}: {e}"));
                None
            }
        }
    }

    async fn fenced_files(&self, files: &BTreeSet<String>) -> String {
        let mut out = String::new();
        for rel in files {
            if let Some(content) = self.read_file(rel).await {
                out.push('\n');
                out.push_str(&prompts::fenced(rel, &content));
            }
        }
        out
    }

    async fn build_messages(
        &mut self,
        mode: ChatMode,
        message: &str,
        with_history: bool,
    ) -> Result<Vec<Message>> {
        let mut messages = vec![Message::system(prompts::system_prompt(mode, &self.edit_format))];

        if !self.read_only.is_empty() {
            let body = self.fenced_files(&self.read_only).await;
            messages.push(Message::user(format!("{}\n{body}", prompts::READ_ONLY_PREFIX)));
            messages.push(Message::assistant(prompts::READ_ONLY_ACK));
        }

        if !self.chat_files.is_empty() {
            let body = self.fenced_files(&self.chat_files).await;
            messages.push(Message::user(format!("{}\n{body}", prompts::FILES_PREFIX)));
            messages.push(Message::assistant(prompts::FILES_ACK));
        } else {
            let map = self.repo_map(false).await?;
            if !map.is_empty() {
                messages.push(Message::user(format!("{}\n\n{map}", prompts::MAP_PREFIX)));
                messages.push(Message::assistant(prompts::MAP_ACK));
            }
        }

        if with_history {
            messages.extend(
                self.history
                    .iter()
                    .map(|m| Message::new(m.role.clone(), m.content.clone())),
            );
        }
        messages.push(Message::user(message));
        Ok(messages)
    }

    async fn complete(&mut self, mode: ChatMode, message: &str, with_history: bool) -> Result<String> {
        let messages = self.build_messages(mode, message, with_history).await?;
        let model = self.model_for(mode).to_string();

        tracing::info!(
            model = %model,
            mode = %mode,
            files = self.chat_files.len(),
            history = if with_history { self.history.len() } else { 0 },
            "Sending chat message"
        );

        let response = self
            .client
            .completion(CompletionRequest::new(model, messages))
            .await
            .context("Completion request failed")?;

        if self.verbose {
            tracing::info!(
                prompt_tokens = response.usage.prompt_tokens,
                completion_tokens = response.usage.completion_tokens,
                "Completion usage"
            );
        }
        Ok(response.content().to_string())
    }

    async fn generate_commit_message(&self, git: &GitRepo) -> String {
        let diff = match git.diff().await {
            Ok(diff) => diff,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "Could not read diff for commit message");
                return FALLBACK_COMMIT_MESSAGE.to_string();
            }
        };

        let model = self.weak_model.as_deref().unwrap_or(&self.main_model);
        let request = CompletionRequest::new(
            model,
            vec![
                Message::system(prompts::commit_prompt()),
                Message::user(format!(
                    "Diff:\n{}",
                    truncate_with_ellipsis(&diff, MAX_COMMIT_DIFF_CHARS)
                )),
            ],
        );

        match self.client.completion(request).await {
            Ok(response) => {
                let line = response
                    .content()
                    .lines()
                    .map(|l| l.trim().trim_matches('"').trim())
                    .find(|l| !l.is_empty())
                    .unwrap_or(FALLBACK_COMMIT_MESSAGE);
                line.to_string()
            }
            Err(e) => {
                tracing::warn!(error = %e, "Commit message generation failed, using fallback");
                FALLBACK_COMMIT_MESSAGE.to_string()
            }
        }
    }

    async fn run_and_report(&self, command: &str) -> Result<CommandOutput> {
        let output = self.shell.run(&self.root, command).await?;
        let combined = output.combined();
        if !combined.is_empty() {
            if output.success() {
                self.io.tool_output(&combined);
            } else {
                self.io.tool_error(&combined);
            }
        }
        Ok(output)
    }

    fn history_markdown(messages: &[ChatMessage]) -> String {
        let mut out = String::new();
        for message in messages {
            if message.role == "user" {
                for line in message.content.lines() {
                    out.push_str("#### ");
                    out.push_str(line);
                    out.push('\n');
                }
            } else {
                out.push_str(&message.content);
                out.push('\n');
            }
            out.push('\n');
        }
        out
    }
}

#[async_trait]
impl Engine for WorkspaceEngine {
    fn io(&self) -> Io {
        self.io.clone()
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn settings(&self) -> EngineSettings {
        EngineSettings {
            root: self.root.clone(),
            main_model: self.main_model.clone(),
            weak_model: self.weak_model.clone(),
            editor_model: self.editor_model.clone(),
            editor_edit_format: self.editor_edit_format.clone(),
            edit_format: self.edit_format.clone(),
            chat_mode: self.chat_mode,
            git: self.git.is_some(),
            yes_always: self.yes_always,
            pretty: self.pretty,
            verbose: self.verbose,
            lint_cmd: self.options.lint_cmd.clone(),
            test_cmd: self.options.test_cmd.clone(),
        }
    }

    fn chat_mode(&self) -> ChatMode {
        self.chat_mode
    }

    fn set_chat_mode(&mut self, mode: ChatMode) {
        self.chat_mode = mode;
    }

    fn history(&self) -> Vec<ChatMessage> {
        self.history.clone()
    }

    fn clear_history(&mut self) {
        self.history.clear();
        self.flushed = 0;
    }

    fn chat_files(&self) -> Vec<String> {
        self.chat_files.iter().cloned().collect()
    }

    fn read_only_files(&self) -> Vec<String> {
        self.read_only.iter().cloned().collect()
    }

    async fn all_files(&self) -> Result<Vec<String>> {
        if let Some(git) = &self.git {
            return git.files().await;
        }
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || walk_files(&root))
            .await
            .context("File listing task failed")
    }

    async fn chat(&mut self, message: &str) -> Result<String> {
        let reply = self.complete(self.chat_mode, message, true).await?;
        self.history.push(ChatMessage::user(message));
        self.history.push(ChatMessage::assistant(reply.clone()));
        Ok(reply)
    }

    async fn consult(&mut self, mode: ChatMode, message: &str) -> Result<String> {
        self.complete(mode, message, false).await
    }

    async fn switch_model(&mut self, model: &str) -> Result<String> {
        let model = model.trim();
        if model.is_empty() {
            return Err(invalid("Model name is required"));
        }
        self.main_model = model.to_string();
        let message = format!("Model switched to {model}");
        self.io.tool_output(&message);
        Ok(message)
    }

    async fn add_files(&mut self, files: &[String]) -> Result<Vec<String>> {
        let mut results = Vec::new();
        for name in files {
            let matched = match self.expand(name, true).await? {
                Ok(matched) => matched,
                Err(message) => {
                    results.push(message);
                    continue;
                }
            };
            for rel in matched {
                if self.chat_files.contains(&rel) {
                    results.push(format!("{rel} is already in the chat"));
                } else if self.read_only.remove(&rel) {
                    results.push(format!(
                        "Moved {rel} from read-only to editable files in the chat"
                    ));
                    self.chat_files.insert(rel);
                } else {
                    results.push(format!("Added {rel} to the chat"));
                    self.chat_files.insert(rel);
                }
            }
        }

        self.repo_map = None;
        for line in &results {
            self.io.tool_output(line);
        }
        Ok(results)
    }

    async fn add_read_only(&mut self, files: &[String]) -> Result<Vec<String>> {
        let mut results = Vec::new();
        for name in files {
            let matched = match self.expand(name, false).await? {
                Ok(matched) => matched,
                Err(message) => {
                    results.push(message);
                    continue;
                }
            };
            for rel in matched {
                if self.chat_files.contains(&rel) {
                    results.push(format!("{rel} is already in the chat as an editable file"));
                } else if !self.read_only.insert(rel.clone()) {
                    results.push(format!("{rel} is already in the chat as a read-only file"));
                } else {
                    results.push(format!("Added {rel} to read-only files."));
                }
            }
        }

        self.repo_map = None;
        for line in &results {
            self.io.tool_output(line);
        }
        Ok(results)
    }

    fn drop_files(&mut self, files: &[String]) -> Vec<String> {
        let results = if files.is_empty() {
            self.chat_files.clear();
            self.read_only.clear();
            vec!["Dropping all files from the chat session.".to_string()]
        } else {
            let mut results = Vec::with_capacity(files.len());
            for name in files {
                let rel = self
                    .resolve_path(name)
                    .map(|(_, rel)| rel)
                    .unwrap_or_else(|_| name.clone());
                if self.chat_files.remove(&rel) || self.read_only.remove(&rel) {
                    results.push(format!("Removed {rel} from the chat"));
                } else {
                    results.push(format!("{name} is not in the chat"));
                }
            }
            results
        };

        self.repo_map = None;
        for line in &results {
            self.io.tool_output(line);
        }
        results
    }

    async fn repo_map(&mut self, force_refresh: bool) -> Result<String> {
        let files = self.addable_files().await?;
        if !force_refresh {
            if let Some((listed, map)) = &self.repo_map {
                if *listed == files {
                    return Ok(map.clone());
                }
            }
        }

        let mut map = String::new();
        for file in &files {
            map.push_str(file);
            map.push('\n');
        }
        tracing::debug!(files = files.len(), "Built repository map");
        self.repo_map = Some((files, map.clone()));
        Ok(map)
    }

    async fn lint(&mut self, files: &[String]) -> Result<CommandOutput> {
        let lint_cmd = self.options.lint_cmd.clone().ok_or_else(|| {
            invalid("No lint command configured; set \"lint_cmd\" when creating the session")
        })?;

        let targets: Vec<String> = if files.is_empty() {
            self.chat_files()
        } else {
            files.to_vec()
        };
        let command = if targets.is_empty() {
            lint_cmd
        } else {
            let quoted: Vec<String> = targets.iter().map(|f| shell_quote(f)).collect();
            format!("{lint_cmd} {}", quoted.join(" "))
        };
        self.run_and_report(&command).await
    }

    async fn test(&mut self, command: Option<&str>) -> Result<CommandOutput> {
        let command = command
            .map(ToString::to_string)
            .or_else(|| self.options.test_cmd.clone())
            .ok_or_else(|| {
                invalid("No test command given or configured; set \"test_cmd\" when creating the session")
            })?;
        self.run_and_report(&command).await
    }

    async fn git(&mut self, args: &str) -> Result<CommandOutput> {
        let args = args.trim();
        if args.is_empty() {
            return Err(invalid("Git command is required"));
        }
        self.run_and_report(&format!("git {args}")).await
    }

    async fn diff(&mut self) -> Result<String> {
        self.git_repo()?.diff().await
    }

    async fn commit(&mut self, message: Option<&str>) -> Result<String> {
        let git = self.git_repo()?.clone();
        if !git.is_dirty().await? {
            return Err(invalid("No changes to commit"));
        }

        let message = match message.map(str::trim).filter(|m| !m.is_empty()) {
            Some(message) => message.to_string(),
            None => self.generate_commit_message(&git).await,
        };

        let commit = git.commit(&message).await?;
        self.session_commits.push(commit.hash.clone());
        let result = format!("Commit {} {}", commit.hash, commit.message);
        self.io.tool_output(&result);
        Ok(result)
    }

    async fn undo(&mut self) -> Result<String> {
        let git = self.git_repo()?.clone();
        let head = git.head().await?.ok_or_else(|| invalid("The repository has no commits"))?;
        if !self.session_commits.contains(&head) {
            return Err(invalid(
                "The last commit was not made in this session, refusing to undo",
            ));
        }

        let undone = git.undo_last_commit().await?;
        self.session_commits.retain(|h| h != &undone.hash);
        let now_at = git.head().await?.unwrap_or_default();

        let result = format!(
            "Removed: {} {}\nNow at: {}",
            undone.hash, undone.message, now_at
        );
        for line in result.lines() {
            self.io.tool_output(line);
        }
        Ok(result)
    }

    async fn report_tokens(&mut self) -> Result<()> {
        let mut rows: Vec<(usize, String, &str)> = Vec::new();

        let system = prompts::system_prompt(self.chat_mode, &self.edit_format);
        rows.push((estimate_tokens(&system), "system messages".to_string(), ""));

        let history: usize = self.history.iter().map(|m| estimate_tokens(&m.content)).sum();
        if history > 0 {
            rows.push((history, "chat history".to_string(), "use /clear to clear"));
        }

        if self.chat_files.is_empty() {
            let map = self.repo_map(false).await?;
            if !map.is_empty() {
                rows.push((estimate_tokens(&map), "repository map".to_string(), ""));
            }
        }

        for rel in &self.chat_files {
            if let Some(content) = self.read_file(rel).await {
                let tokens = estimate_tokens(&prompts::fenced(rel, &content));
                rows.push((tokens, rel.clone(), "/drop to remove"));
            }
        }
        for rel in &self.read_only {
            if let Some(content) = self.read_file(rel).await {
                let tokens = estimate_tokens(&prompts::fenced(rel, &content));
                rows.push((tokens, format!("{rel} (read-only)"), "/drop to remove"));
            }
        }

        let total: usize = rows.iter().map(|(tokens, _, _)| tokens).sum();

        self.io.tool_output(format!(
            "Approximate context window usage for {}, in tokens:",
            self.main_model
        ));
        self.io.tool_output("");
        for (tokens, label, hint) in &rows {
            let line = format!("{tokens:>8} {label:<40} {hint}");
            self.io.tool_output(line.trim_end());
        }
        self.io.tool_output("=".repeat(8));
        self.io.tool_output(format!("{total:>8} tokens total"));
        Ok(())
    }

    fn report_settings(&self) {
        let settings = self.settings();
        let optional = |value: &Option<String>| value.clone().unwrap_or_else(|| "-".to_string());

        let lines = [
            format!("Root: {}", settings.root.display()),
            format!("Main model: {}", settings.main_model),
            format!("Weak model: {}", optional(&settings.weak_model)),
            format!("Editor model: {}", optional(&settings.editor_model)),
            format!("Editor edit format: {}", optional(&settings.editor_edit_format)),
            format!("Edit format: {}", settings.edit_format),
            format!("Chat mode: {}", settings.chat_mode),
            format!("Git: {}", if settings.git { "enabled" } else { "disabled" }),
            format!("Yes always: {}", settings.yes_always),
            format!("Pretty: {}", settings.pretty),
            format!("Verbose: {}", settings.verbose),
            format!("Lint command: {}", optional(&settings.lint_cmd)),
            format!("Test command: {}", optional(&settings.test_cmd)),
        ];
        for line in lines {
            self.io.tool_output(line);
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        let Some(file) = self.options.chat_history_file.clone() else {
            return Ok(());
        };
        if self.flushed >= self.history.len() {
            return Ok(());
        }

        let path = self.root.join(file);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut handle = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open chat history {}", path.display()))?;
        let text = Self::history_markdown(&self.history[self.flushed..]);
        handle
            .write_all(text.as_bytes())
            .await
            .with_context(|| format!("Failed to write chat history {}", path.display()))?;
        handle.flush().await?;

        tracing::debug!(path = %path.display(), messages = self.history.len() - self.flushed, "Flushed chat history");
        self.flushed = self.history.len();
        Ok(())
    }
}

/// Builds [`WorkspaceEngine`]s for new sessions.
pub struct WorkspaceEngineFactory {
    client: Arc<dyn CompletionClient>,
    shell: ShellRunner,
}

impl WorkspaceEngineFactory {
    pub fn new(client: Arc<dyn CompletionClient>, shell: ShellRunner) -> Self {
        Self { client, shell }
    }
}

#[async_trait]
impl EngineFactory for WorkspaceEngineFactory {
    async fn create(&self, spec: EngineSpec) -> Result<Box<dyn Engine>> {
        let git = if spec.config.git {
            match GitRepo::open(&spec.root).await {
                Ok(repo) => Some(repo),
                Err(e) => {
                    tracing::warn!(root = %spec.root.display(), error = %format!("{e:#}"), "Git unavailable, continuing without it");
                    None
                }
            }
        } else {
            None
        };

        let mut engine = WorkspaceEngine::new(spec, Arc::clone(&self.client), self.shell.clone(), git)?;
        let read = engine.options.read.clone();
        if !read.is_empty() {
            engine.add_read_only(&read).await?;
        }
        Ok(Box::new(engine))
    }
}

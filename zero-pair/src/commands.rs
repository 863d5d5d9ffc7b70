//! Slash-command dispatcher.
//!
//! Interprets lines such as `/add src/main.rs`, `/tok` or `!cargo test`
//! against one engine. Command names resolve by exact match first, then by
//! unique prefix.

use crate::engine::{ChatMode, Engine};
use crate::error::{PairError, Result};
use crate::shell::{CommandOutput, ShellRunner};
use serde_json::{json, Value};

/// Command names and their help text, sorted by name.
const COMMANDS: &[(&str, &str)] = &[
    ("add", "Add files to the chat so the engine can edit them"),
    ("architect", "Enter architect mode to discuss high-level design, or send one message in it"),
    ("ask", "Ask questions about the code base without editing any files"),
    ("chat-mode", "Switch to a new chat mode"),
    ("clear", "Clear the chat history"),
    ("code", "Ask for changes to your code"),
    ("commit", "Commit edits to the repo made outside the chat"),
    ("diff", "Display the diff of changes since the last commit"),
    ("drop", "Remove files from the chat session to free up context space"),
    ("exit", "End the session"),
    ("git", "Run a git command"),
    ("help", "Ask questions about commands, or list them"),
    ("lint", "Lint the given files, or the in-chat files if none are given"),
    ("ls", "List all known files and indicate which are included in the chat session"),
    ("map", "Print out the current repository map"),
    ("model", "Switch to a new main model"),
    ("read-only", "Add files to the chat that are for reference only"),
    ("reset", "Drop all files and clear the chat history"),
    ("run", "Run a shell command (alias: !)"),
    ("settings", "Print out the current settings"),
    ("test", "Run a shell command, or the configured test command"),
    ("tokens", "Report on the number of tokens used by the current chat context"),
    ("undo", "Undo the last git commit if it was made in this session"),
];

/// A parsed input line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invocation<'a> {
    Command { name: &'static str, args: &'a str },
    Chat(&'a str),
}

/// Resolve a (possibly abbreviated) command name.
pub fn resolve(name: &str) -> Result<&'static str> {
    if name.is_empty() {
        return Err(PairError::InvalidRequest("Invalid command: /".to_string()));
    }
    if let Some((exact, _)) = COMMANDS.iter().find(|(n, _)| *n == name) {
        return Ok(*exact);
    }

    let matches: Vec<&'static str> = COMMANDS
        .iter()
        .map(|(n, _)| *n)
        .filter(|n| n.starts_with(name))
        .collect();
    match matches.as_slice() {
        [only] => Ok(*only),
        [] => Err(PairError::InvalidRequest(format!("Invalid command: /{name}"))),
        many => Err(PairError::InvalidRequest(format!(
            "Ambiguous command: /{name} matches {}",
            many.iter()
                .map(|n| format!("/{n}"))
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

/// Split command arguments on whitespace, honouring single and double quotes.
pub fn split_args(args: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_token = false;

    for c in args.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    out.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        out.push(current);
    }
    out
}

fn required<'a>(args: &'a str, what: &str) -> Result<&'a str> {
    let args = args.trim();
    if args.is_empty() {
        Err(PairError::InvalidRequest(format!("{what} is required")))
    } else {
        Ok(args)
    }
}

/// Runs slash commands against an engine.
#[derive(Debug, Clone, Default)]
pub struct CommandDispatcher {
    shell: ShellRunner,
}

impl CommandDispatcher {
    pub fn new(shell: ShellRunner) -> Self {
        Self { shell }
    }

    /// Every command as `/name`.
    pub fn commands() -> Vec<String> {
        COMMANDS.iter().map(|(n, _)| format!("/{n}")).collect()
    }

    pub fn parse(line: &str) -> Result<Invocation<'_>> {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix('!') {
            return Ok(Invocation::Command {
                name: "run",
                args: rest.trim(),
            });
        }
        if let Some(rest) = line.strip_prefix('/') {
            let (name, args) = match rest.split_once(char::is_whitespace) {
                Some((name, args)) => (name, args.trim()),
                None => (rest, ""),
            };
            return Ok(Invocation::Command {
                name: resolve(name)?,
                args,
            });
        }
        Ok(Invocation::Chat(line))
    }

    /// Interpret one input line. Plain text is a chat message.
    pub async fn run(&self, engine: &mut dyn Engine, line: &str) -> Result<Value> {
        match Self::parse(line)? {
            Invocation::Command { name, args } => self.execute(engine, name, args).await,
            Invocation::Chat(message) => {
                let message = required(message, "Message")?;
                Ok(json!({ "response": engine.chat(message).await? }))
            }
        }
    }

    /// Run a resolved command.
    pub async fn execute(&self, engine: &mut dyn Engine, name: &str, args: &str) -> Result<Value> {
        tracing::debug!(command = name, "Dispatching command");
        let io = engine.io();

        let value = match name {
            "add" => json!({ "results": self.cmd_add(engine, &split_args(args)).await? }),
            "drop" => json!({ "results": self.cmd_drop(engine, &split_args(args)) }),
            "read-only" => json!({ "results": self.cmd_read_only(engine, &split_args(args)).await? }),
            "ls" => {
                let (result, lines) = io.capture_during(self.cmd_ls(engine)).await;
                result?;
                json!({ "output": lines })
            }
            "tokens" => {
                let (result, lines) = io.capture_during(self.cmd_tokens(engine)).await;
                result?;
                json!({ "output": lines })
            }
            "settings" => {
                let guard = io.capture();
                self.cmd_settings(engine);
                json!({ "output": guard.finish() })
            }
            "help" => {
                let (result, lines) = io.capture_during(self.cmd_help(engine, args)).await;
                result?;
                json!({ "output": lines })
            }
            "map" => {
                let (result, lines) = io.capture_during(self.cmd_map(engine)).await;
                result?;
                json!({ "output": lines })
            }
            "model" => {
                let model = required(args, "Model name")?;
                json!({ "model": model, "result": self.cmd_model(engine, model).await? })
            }
            "chat-mode" => json!({ "chat_mode": self.cmd_chat_mode(engine, args)? }),
            "clear" => json!({ "result": self.cmd_clear(engine) }),
            "reset" => json!({ "result": self.cmd_reset(engine) }),
            "run" => to_value(self.cmd_run(engine, args).await?)?,
            "test" => to_value(self.cmd_test(engine, args).await?)?,
            "lint" => to_value(self.cmd_lint(engine, &split_args(args)).await?)?,
            "git" => to_value(self.cmd_git(engine, args).await?)?,
            "diff" => json!({ "diff": self.cmd_diff(engine).await? }),
            "undo" => json!({ "result": self.cmd_undo(engine).await? }),
            "commit" => json!({ "result": self.cmd_commit(engine, args).await? }),
            "code" => self.switch_or_chat(engine, ChatMode::Code, args).await?,
            "ask" => self.switch_or_chat(engine, ChatMode::Ask, args).await?,
            "architect" => self.switch_or_chat(engine, ChatMode::Architect, args).await?,
            "exit" => json!({ "result": self.cmd_exit(engine).await? }),
            other => return Err(PairError::InvalidRequest(format!("Invalid command: /{other}"))),
        };
        Ok(value)
    }

    async fn switch_or_chat(&self, engine: &mut dyn Engine, mode: ChatMode, args: &str) -> Result<Value> {
        if args.trim().is_empty() {
            engine.set_chat_mode(mode);
            engine.io().tool_output(format!("Chat mode: {mode}"));
            return Ok(json!({ "chat_mode": mode }));
        }
        Ok(json!({ "response": engine.chat_in_mode(mode, args.trim()).await? }))
    }

    pub async fn cmd_add(&self, engine: &mut dyn Engine, files: &[String]) -> Result<Vec<String>> {
        if files.is_empty() {
            return Err(PairError::InvalidRequest("Files list is required".to_string()));
        }
        Ok(engine.add_files(files).await?)
    }

    pub fn cmd_drop(&self, engine: &mut dyn Engine, files: &[String]) -> Vec<String> {
        engine.drop_files(files)
    }

    pub async fn cmd_read_only(&self, engine: &mut dyn Engine, files: &[String]) -> Result<Vec<String>> {
        if files.is_empty() {
            return Err(PairError::InvalidRequest("Files list is required".to_string()));
        }
        Ok(engine.add_read_only(files).await?)
    }

    /// Emits the file listing to the engine's output sink.
    pub async fn cmd_ls(&self, engine: &mut dyn Engine) -> Result<()> {
        let io = engine.io();
        let chat_files = engine.chat_files();
        let read_only = engine.read_only_files();
        let other_files = engine.addable_files().await?;

        if chat_files.is_empty() && read_only.is_empty() && other_files.is_empty() {
            io.tool_output("No files in chat, git repo, or read-only list.");
            return Ok(());
        }

        let sections = [
            ("Repo files not in the chat:", other_files),
            ("Read-only files:", read_only),
            ("Files in chat:", chat_files),
        ];
        for (title, files) in sections {
            if files.is_empty() {
                continue;
            }
            io.tool_output(title);
            for file in files {
                io.tool_output(format!("  {file}"));
            }
        }
        Ok(())
    }

    pub async fn cmd_tokens(&self, engine: &mut dyn Engine) -> Result<()> {
        Ok(engine.report_tokens().await?)
    }

    pub fn cmd_settings(&self, engine: &mut dyn Engine) {
        engine.report_settings();
    }

    /// Lists commands, describes one, or asks the engine a usage question.
    pub async fn cmd_help(&self, engine: &mut dyn Engine, topic: &str) -> Result<()> {
        let io = engine.io();
        let topic = topic.trim().trim_start_matches('/');

        if topic.is_empty() {
            for (name, help) in COMMANDS {
                io.tool_output(format!("/{name:<12} {help}"));
            }
            io.tool_output("Use `/help <question>` to ask questions about usage.");
            return Ok(());
        }

        if let Some((name, help)) = COMMANDS.iter().find(|(n, _)| *n == topic) {
            io.tool_output(format!("/{name:<12} {help}"));
            return Ok(());
        }

        let answer = engine.consult(ChatMode::Help, topic).await?;
        for line in answer.lines() {
            io.tool_output(line);
        }
        Ok(())
    }

    pub async fn cmd_map(&self, engine: &mut dyn Engine) -> Result<()> {
        let io = engine.io();
        let map = engine.repo_map(false).await?;
        if map.trim().is_empty() {
            io.tool_output("No repository map available.");
        } else {
            for line in map.lines() {
                io.tool_output(line);
            }
        }
        Ok(())
    }

    pub async fn cmd_model(&self, engine: &mut dyn Engine, model: &str) -> Result<String> {
        let model = required(model, "Model name")?;
        Ok(engine.switch_model(model).await?)
    }

    pub fn cmd_chat_mode(&self, engine: &mut dyn Engine, mode: &str) -> Result<ChatMode> {
        let mode: ChatMode = required(mode, "Chat mode")?
            .parse()
            .map_err(PairError::InvalidRequest)?;
        engine.set_chat_mode(mode);
        engine.io().tool_output(format!("Chat mode: {mode}"));
        Ok(mode)
    }

    pub fn cmd_clear(&self, engine: &mut dyn Engine) -> String {
        engine.clear_history();
        "All chat history cleared.".to_string()
    }

    pub fn cmd_reset(&self, engine: &mut dyn Engine) -> String {
        engine.drop_files(&[]);
        engine.clear_history();
        "All files dropped and chat history cleared.".to_string()
    }

    pub async fn cmd_run(&self, engine: &mut dyn Engine, command: &str) -> Result<CommandOutput> {
        let command = required(command, "Command")?;
        let output = self.shell.run(engine.root(), command).await?;
        let combined = output.combined();
        if !combined.is_empty() {
            engine.io().tool_output(combined);
        }
        Ok(output)
    }

    pub async fn cmd_test(&self, engine: &mut dyn Engine, command: &str) -> Result<CommandOutput> {
        let command = command.trim();
        let command = (!command.is_empty()).then_some(command);
        Ok(engine.test(command).await?)
    }

    pub async fn cmd_lint(&self, engine: &mut dyn Engine, files: &[String]) -> Result<CommandOutput> {
        Ok(engine.lint(files).await?)
    }

    pub async fn cmd_git(&self, engine: &mut dyn Engine, args: &str) -> Result<CommandOutput> {
        let args = required(args, "Git command")?;
        Ok(engine.git(args).await?)
    }

    pub async fn cmd_diff(&self, engine: &mut dyn Engine) -> Result<String> {
        let diff = engine.diff().await?;
        if diff.trim().is_empty() {
            engine.io().tool_output("No changes to display since the last commit.");
        } else {
            engine.io().tool_output(&diff);
        }
        Ok(diff)
    }

    pub async fn cmd_undo(&self, engine: &mut dyn Engine) -> Result<String> {
        Ok(engine.undo().await?)
    }

    pub async fn cmd_commit(&self, engine: &mut dyn Engine, message: &str) -> Result<String> {
        let message = message.trim();
        let message = (!message.is_empty()).then_some(message);
        Ok(engine.commit(message).await?)
    }

    pub async fn cmd_exit(&self, engine: &mut dyn Engine) -> Result<String> {
        engine.shutdown().await?;
        Ok("Session closed".to_string())
    }
}

fn to_value(output: CommandOutput) -> Result<Value> {
    serde_json::to_value(output).map_err(|e| PairError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{workspace_engine, StubClient};

    #[test]
    fn resolve_exact_and_prefix() {
        assert_eq!(resolve("add").unwrap(), "add");
        assert_eq!(resolve("tok").unwrap(), "tokens");
        assert_eq!(resolve("read").unwrap(), "read-only");
        // "ask" and "architect" share a prefix but "ask" is still exact.
        assert_eq!(resolve("ask").unwrap(), "ask");
    }

    #[test]
    fn resolve_rejects_ambiguous_and_unknown() {
        let err = resolve("a").unwrap_err().to_string();
        assert!(err.starts_with("Ambiguous command: /a"));
        assert!(err.contains("/add") && err.contains("/architect"));

        let err = resolve("frobnicate").unwrap_err();
        assert!(matches!(err, PairError::InvalidRequest(_)));
        assert!(resolve("").is_err());
    }

    #[test]
    fn parse_lines() {
        assert_eq!(
            CommandDispatcher::parse("!ls -la").unwrap(),
            Invocation::Command {
                name: "run",
                args: "ls -la"
            }
        );
        assert_eq!(
            CommandDispatcher::parse("/add  a.py b.py ").unwrap(),
            Invocation::Command {
                name: "add",
                args: "a.py b.py"
            }
        );
        assert_eq!(
            CommandDispatcher::parse("/settings").unwrap(),
            Invocation::Command {
                name: "settings",
                args: ""
            }
        );
        assert_eq!(
            CommandDispatcher::parse("fix the bug").unwrap(),
            Invocation::Chat("fix the bug")
        );
    }

    #[test]
    fn split_args_honours_quotes() {
        assert_eq!(split_args("a.py  b.py"), vec!["a.py", "b.py"]);
        assert_eq!(
            split_args(r#""my file.py" 'other one.rs' plain"#),
            vec!["my file.py", "other one.rs", "plain"]
        );
        assert!(split_args("   ").is_empty());
    }

    #[test]
    fn commands_are_slash_prefixed() {
        let commands = CommandDispatcher::commands();
        assert!(commands.contains(&"/add".to_string()));
        assert!(commands.contains(&"/exit".to_string()));
        assert!(commands.iter().all(|c| c.starts_with('/')));
    }

    #[tokio::test]
    async fn run_add_then_ls() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.py"), "print('hi')\n").unwrap();
        std::fs::write(dir.path().join("util.py"), "").unwrap();
        let mut engine = workspace_engine(dir.path(), StubClient::replying("ok")).await;
        let dispatcher = CommandDispatcher::default();

        let added = dispatcher.run(engine.as_mut(), "/add main.py").await.unwrap();
        assert_eq!(added["results"][0], "Added main.py to the chat");

        let listing = dispatcher.run(engine.as_mut(), "/ls").await.unwrap();
        let lines: Vec<String> = serde_json::from_value(listing["output"].clone()).unwrap();
        assert_eq!(
            lines,
            vec![
                "Repo files not in the chat:",
                "  util.py",
                "Files in chat:",
                "  main.py"
            ]
        );
    }

    #[tokio::test]
    async fn run_bang_executes_shell() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = workspace_engine(dir.path(), StubClient::replying("ok")).await;
        let dispatcher = CommandDispatcher::default();

        let output = dispatcher.run(engine.as_mut(), "!echo hi").await.unwrap();
        assert_eq!(output["stdout"], "hi\n");
        assert_eq!(output["exit_code"], 0);
    }

    #[tokio::test]
    async fn mode_commands_switch_or_send_once() {
        let dir = tempfile::tempdir().unwrap();
        let client = StubClient::replying("because");
        let mut engine = workspace_engine(dir.path(), client.clone()).await;
        let dispatcher = CommandDispatcher::default();

        let answer = dispatcher.run(engine.as_mut(), "/ask why?").await.unwrap();
        assert_eq!(answer["response"], "because");
        assert_eq!(engine.chat_mode(), ChatMode::Code);
        assert_eq!(client.calls(), 1);

        let switched = dispatcher.run(engine.as_mut(), "/architect").await.unwrap();
        assert_eq!(switched["chat_mode"], "architect");
        assert_eq!(engine.chat_mode(), ChatMode::Architect);
    }

    #[tokio::test]
    async fn missing_arguments_are_bad_requests() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = workspace_engine(dir.path(), StubClient::replying("ok")).await;
        let dispatcher = CommandDispatcher::default();

        for line in ["/add", "/read-only", "/model", "/git", "/run", "/chat-mode nonsense"] {
            let err = dispatcher.run(engine.as_mut(), line).await.unwrap_err();
            assert!(matches!(err, PairError::InvalidRequest(_)), "{line}: {err}");
        }
    }

    #[tokio::test]
    async fn help_lists_commands() {
        let dir = tempfile::tempdir().unwrap();
        let client = StubClient::replying("ok");
        let mut engine = workspace_engine(dir.path(), client.clone()).await;
        let dispatcher = CommandDispatcher::default();

        let help = dispatcher.run(engine.as_mut(), "/help").await.unwrap();
        let lines = help["output"].as_array().unwrap();
        assert_eq!(lines.len(), COMMANDS.len() + 1);
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn help_question_is_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let client = StubClient::replying("Use /add <file>");
        let mut engine = workspace_engine(dir.path(), client.clone()).await;
        let dispatcher = CommandDispatcher::default();

        let help = dispatcher
            .run(engine.as_mut(), "/help how do I add a file")
            .await
            .unwrap();
        assert_eq!(help["output"], serde_json::json!(["Use /add <file>"]));
        assert_eq!(client.calls(), 1);
        assert!(engine.history().is_empty());
    }

    #[tokio::test]
    async fn reset_drops_files_and_history() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        let mut engine = workspace_engine(dir.path(), StubClient::replying("ok")).await;
        let dispatcher = CommandDispatcher::default();

        dispatcher.run(engine.as_mut(), "/add a.txt").await.unwrap();
        dispatcher.run(engine.as_mut(), "hello").await.unwrap();
        assert_eq!(engine.history().len(), 2);

        dispatcher.run(engine.as_mut(), "/reset").await.unwrap();
        assert!(engine.chat_files().is_empty());
        assert!(engine.history().is_empty());
    }
}

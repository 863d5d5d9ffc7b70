//! Shell command execution for sessions.
//!
//! Commands run through `sh -c` inside the session root with:
//! - a per-command timeout (the child is killed when it expires)
//! - credential environment variables filtered out
//!
//! There is no command allow-list; callers of the HTTP surface are trusted.

use crate::error::{PairError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use zero_common::util::log_preview;

/// Default command timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Environment variables never passed to child processes.
const FILTERED_ENV_VARS: &[&str] = &[
    "OPENAI_API_KEY",
    "ANTHROPIC_API_KEY",
    "GOOGLE_API_KEY",
    "ZERO_PAIR_LLM_API_KEY",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_ACCESS_KEY_ID",
    "GITHUB_TOKEN",
    "GH_TOKEN",
    "SSH_AUTH_SOCK",
    "GPG_AGENT_INFO",
];

/// Result of running a shell command to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout and stderr joined, for emitting to an output sink.
    pub fn combined(&self) -> String {
        match (self.stdout.trim_end(), self.stderr.trim_end()) {
            (out, "") => out.to_string(),
            ("", err) => err.to_string(),
            (out, err) => format!("{out}\n{err}"),
        }
    }
}

/// Runs shell commands with a timeout and a filtered environment.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    timeout: Duration,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }
}

impl ShellRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn from_config(config: &zero_common::ShellConfig) -> Self {
        Self::new(Duration::from_secs(config.timeout_secs))
    }

    fn build_env(&self) -> HashMap<String, String> {
        std::env::vars()
            .filter(|(k, _)| !FILTERED_ENV_VARS.contains(&k.as_str()))
            .collect()
    }

    /// Run `command` in `cwd`. A non-zero exit is reported in the output, not as an error.
    pub async fn run(&self, cwd: &Path, command: &str) -> Result<CommandOutput> {
        tracing::debug!(command = %log_preview(command, 200), cwd = %cwd.display(), "Running shell command");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .env_clear()
            .envs(self.build_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(cwd)
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(PairError::Internal(format!(
                    "Failed to execute command: {e}"
                )))
            }
            Err(_) => {
                tracing::warn!(command = %log_preview(command, 200), secs = self.timeout.as_secs(), "Shell command timed out");
                return Err(PairError::Timeout {
                    command: command.to_string(),
                    secs: self.timeout.as_secs(),
                });
            }
        };

        let result = CommandOutput {
            command: command.to_string(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        };
        tracing::debug!(exit_code = result.exit_code, "Shell command finished");
        Ok(result)
    }
}

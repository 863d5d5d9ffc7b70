//! Git adapter backed by the `git` command-line tool.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Identity used when the repository has no committer configured.
const FALLBACK_NAME: &str = "zero-pair";
const FALLBACK_EMAIL: &str = "zero-pair@localhost";

/// A git working tree rooted at (or containing) a session directory.
#[derive(Debug, Clone)]
pub struct GitRepo {
    root: PathBuf,
    workdir: PathBuf,
}

/// A commit created through [`GitRepo::commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub hash: String,
    pub message: String,
}

impl GitRepo {
    /// Open the repository containing `dir`, initialising one there if none exists.
    pub async fn open(dir: &Path) -> Result<Self> {
        let toplevel = Command::new("git")
            .args(["rev-parse", "--show-toplevel"])
            .current_dir(dir)
            .stdin(Stdio::null())
            .output()
            .await
            .context("Failed to run git")?;

        if toplevel.status.success() {
            let top = String::from_utf8_lossy(&toplevel.stdout).trim().to_string();
            tracing::debug!(root = %top, "Using existing git repository");
            return Ok(Self {
                root: PathBuf::from(top),
                workdir: dir.to_path_buf(),
            });
        }

        let init = Command::new("git")
            .arg("init")
            .current_dir(dir)
            .stdin(Stdio::null())
            .output()
            .await
            .context("Failed to run git init")?;
        if !init.status.success() {
            bail!(
                "git init failed: {}",
                String::from_utf8_lossy(&init.stderr).trim()
            );
        }

        tracing::info!(root = %dir.display(), "Initialized git repository");
        Ok(Self {
            root: dir.to_path_buf(),
            workdir: dir.to_path_buf(),
        })
    }

    async fn output(&self, args: &[&str]) -> Result<std::process::Output> {
        self.output_in(&self.root, args).await
    }

    async fn output_in(&self, dir: &Path, args: &[&str]) -> Result<std::process::Output> {
        Command::new("git")
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to run git {}", args.join(" ")))
    }

    /// Run a git command, failing on non-zero exit. Returns stdout.
    pub async fn run(&self, args: &[&str]) -> Result<String> {
        let output = self.output(args).await?;
        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Short hash of HEAD, or `None` on an unborn branch.
    pub async fn head(&self) -> Result<Option<String>> {
        let output = self.output(&["rev-parse", "--short", "HEAD"]).await?;
        if output.status.success() {
            Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
        } else {
            Ok(None)
        }
    }

    /// Tracked plus untracked-but-not-ignored files under the session
    /// directory, relative to it.
    pub async fn files(&self) -> Result<Vec<String>> {
        let output = self
            .output_in(
                &self.workdir,
                &["ls-files", "--cached", "--others", "--exclude-standard"],
            )
            .await?;
        if !output.status.success() {
            bail!(
                "git ls-files failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let mut files: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect();
        files.sort();
        files.dedup();
        Ok(files)
    }

    pub async fn is_dirty(&self) -> Result<bool> {
        let status = self.run(&["status", "--porcelain"]).await?;
        Ok(!status.trim().is_empty())
    }

    /// Working tree and index changes against HEAD.
    pub async fn diff(&self) -> Result<String> {
        if self.head().await?.is_some() {
            return self.run(&["diff", "HEAD"]).await;
        }
        let staged = self.run(&["diff", "--cached"]).await?;
        let unstaged = self.run(&["diff"]).await?;
        Ok(format!("{staged}{unstaged}"))
    }

    async fn identity_args(&self) -> Vec<String> {
        let configured = self
            .output(&["config", "user.email"])
            .await
            .map(|o| o.status.success() && !String::from_utf8_lossy(&o.stdout).trim().is_empty())
            .unwrap_or(false);
        if configured {
            Vec::new()
        } else {
            vec![
                "-c".to_string(),
                format!("user.name={FALLBACK_NAME}"),
                "-c".to_string(),
                format!("user.email={FALLBACK_EMAIL}"),
            ]
        }
    }

    /// Stage everything and commit it.
    pub async fn commit(&self, message: &str) -> Result<CommitInfo> {
        if !self.is_dirty().await? {
            bail!("No changes to commit");
        }
        self.run(&["add", "-A"]).await?;

        let mut args = self.identity_args().await;
        args.extend(["commit".to_string(), "-m".to_string(), message.to_string()]);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&args).await?;

        let hash = self
            .head()
            .await?
            .context("HEAD missing after commit")?;
        tracing::info!(hash = %hash, "Created commit");
        Ok(CommitInfo {
            hash,
            message: message.to_string(),
        })
    }

    /// Files touched by the HEAD commit.
    async fn head_files(&self) -> Result<Vec<String>> {
        let stdout = self
            .run(&["diff-tree", "--no-commit-id", "--name-only", "-r", "HEAD"])
            .await?;
        Ok(stdout.lines().map(str::to_string).collect())
    }

    /// Revert the files of the HEAD commit and move HEAD back one commit.
    ///
    /// Refuses when HEAD is the root commit or when any of its files have
    /// uncommitted changes.
    pub async fn undo_last_commit(&self) -> Result<CommitInfo> {
        let Some(hash) = self.head().await? else {
            bail!("The repository has no commits");
        };
        let has_parent = self
            .output(&["rev-parse", "--verify", "--quiet", "HEAD~1"])
            .await?
            .status
            .success();
        if !has_parent {
            bail!("Cannot undo the initial commit");
        }

        let files = self.head_files().await?;
        let mut dirty_args = vec!["status", "--porcelain", "--"];
        dirty_args.extend(files.iter().map(String::as_str));
        if !self.run(&dirty_args).await?.trim().is_empty() {
            bail!("The files in the last commit have uncommitted changes, refusing to undo");
        }

        let message = self.run(&["log", "-1", "--format=%s"]).await?.trim().to_string();

        // Files added by the commit do not exist in HEAD~1.
        for file in &files {
            let exists = self
                .output(&["cat-file", "-e", &format!("HEAD~1:{file}")])
                .await?
                .status
                .success();
            if exists {
                self.run(&["checkout", "HEAD~1", "--", file]).await?;
            } else {
                self.run(&["rm", "-q", "--cached", "--", file]).await?;
                let path = self.root.join(file);
                if path.exists() {
                    tokio::fs::remove_file(&path)
                        .await
                        .with_context(|| format!("Failed to remove {}", path.display()))?;
                }
            }
        }
        self.run(&["reset", "--soft", "HEAD~1"]).await?;

        tracing::info!(hash = %hash, "Undid commit");
        Ok(CommitInfo { hash, message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn open_initializes_missing_repo() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let repo = GitRepo::open(dir.path()).await.unwrap();

        assert!(dir.path().join(".git").exists());
        assert_eq!(repo.head().await.unwrap(), None);
        assert!(!repo.is_dirty().await.unwrap());
    }

    #[tokio::test]
    async fn commit_diff_and_undo() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let repo = GitRepo::open(dir.path()).await.unwrap();

        std::fs::write(dir.path().join("a.txt"), "one\n").unwrap();
        let first = repo.commit("first").await.unwrap();
        assert_eq!(first.message, "first");

        std::fs::write(dir.path().join("a.txt"), "two\n").unwrap();
        std::fs::write(dir.path().join("b.txt"), "new\n").unwrap();
        assert!(repo.is_dirty().await.unwrap());
        assert!(repo.diff().await.unwrap().contains("+two"));

        let second = repo.commit("second").await.unwrap();
        assert_ne!(first.hash, second.hash);

        let undone = repo.undo_last_commit().await.unwrap();
        assert_eq!(undone.hash, second.hash);
        assert_eq!(undone.message, "second");
        assert_eq!(repo.head().await.unwrap(), Some(first.hash));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
            "one\n"
        );
        assert!(!dir.path().join("b.txt").exists());
    }

    #[tokio::test]
    async fn commit_without_changes_fails() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let repo = GitRepo::open(dir.path()).await.unwrap();

        let err = repo.commit("nothing").await.unwrap_err();
        assert!(err.to_string().contains("No changes"));
    }

    #[tokio::test]
    async fn undo_refuses_initial_commit() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let repo = GitRepo::open(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\n").unwrap();
        repo.commit("first").await.unwrap();

        assert!(repo.undo_last_commit().await.is_err());
    }
}

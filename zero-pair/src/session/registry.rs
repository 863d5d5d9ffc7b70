//! Session registry.
//!
//! Maps session ids to live sessions. Membership sits behind an `RwLock`
//! that is only held for lookups, inserts and removals; each session has
//! its own `Mutex` held for the whole of an operation, so work on one
//! session is serialized while different sessions proceed in parallel.

use super::config::SessionConfig;
use crate::commands::CommandDispatcher;
use crate::engine::{ChatMode, Engine, EngineFactory, EngineSpec, Io, TracingSink};
use crate::error::{PairError, Result};
use crate::shell::ShellRunner;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{MutexGuard, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// What a session can do beyond raw engine calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capabilities {
    /// Plain engine.
    Engine,
    /// Engine plus a slash-command dispatcher.
    Commands,
}

/// Registry-wide defaults and limits.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub default_work_dir: PathBuf,
    pub default_model: String,
    pub max_sessions: Option<usize>,
    pub idle_timeout: Option<Duration>,
    pub sweep_interval: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self::from_config(&zero_common::Config::default())
    }
}

impl RegistrySettings {
    pub fn from_config(config: &zero_common::Config) -> Self {
        Self {
            default_work_dir: config.sessions.default_work_dir.clone(),
            default_model: config.llm.default_model.clone(),
            max_sessions: config.sessions.max_sessions,
            idle_timeout: config.sessions.idle_timeout_secs.map(Duration::from_secs),
            sweep_interval: Duration::from_secs(config.sessions.sweep_interval_secs.max(1)),
        }
    }
}

/// Point-in-time description of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub root: PathBuf,
    pub model: String,
    pub weak_model: Option<String>,
    pub editor_model: Option<String>,
    pub edit_format: String,
    pub chat_mode: ChatMode,
    pub capabilities: Capabilities,
    pub git: bool,
    pub mode: Option<String>,
    pub chat_files: Vec<String>,
    pub read_only_files: Vec<String>,
    pub history_len: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Mutable part of a session, reachable only through [`SessionHandle::lock`].
pub struct SessionState {
    engine: Box<dyn Engine>,
    commands: Option<CommandDispatcher>,
    closed: bool,
}

impl SessionState {
    pub fn engine(&mut self) -> &mut dyn Engine {
        self.engine.as_mut()
    }

    /// The dispatcher together with the engine it drives.
    pub fn with_commands(&mut self) -> Result<(&CommandDispatcher, &mut dyn Engine)> {
        match &self.commands {
            Some(commands) => Ok((commands, self.engine.as_mut())),
            None => Err(PairError::InvalidRequest(
                "Session was created without command support".to_string(),
            )),
        }
    }
}

/// One live session.
pub struct SessionHandle {
    id: String,
    root: PathBuf,
    capabilities: Capabilities,
    mode: Option<String>,
    created_at: DateTime<Utc>,
    seq: u64,
    last_activity: Mutex<DateTime<Utc>>,
    state: tokio::sync::Mutex<SessionState>,
}

impl SessionHandle {
    pub fn last_activity(&self) -> DateTime<Utc> {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Utc::now();
    }

    /// Wait for exclusive access. Fails if the session ended meanwhile.
    pub async fn lock(&self) -> Result<MutexGuard<'_, SessionState>> {
        let guard = self.state.lock().await;
        if guard.closed {
            return Err(PairError::SessionNotFound(self.id.clone()));
        }
        self.touch();
        Ok(guard)
    }
}

struct RegistryInner {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    factory: Arc<dyn EngineFactory>,
    shell: ShellRunner,
    settings: RegistrySettings,
    next_seq: AtomicU64,
}

/// Shared, cloneable registry of live sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(factory: Arc<dyn EngineFactory>, shell: ShellRunner, settings: RegistrySettings) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: RwLock::new(HashMap::new()),
                factory,
                shell,
                settings,
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.inner.settings
    }

    pub async fn len(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn at_capacity(&self, live: usize) -> bool {
        self.inner
            .settings
            .max_sessions
            .is_some_and(|max| live >= max)
    }

    fn capacity_error(&self) -> PairError {
        PairError::Unavailable(format!(
            "Session limit of {} reached",
            self.inner.settings.max_sessions.unwrap_or_default()
        ))
    }

    async fn prepare_root(work_dir: &Path) -> Result<PathBuf> {
        let root = if work_dir.is_absolute() {
            work_dir.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|e| PairError::Internal(format!("Cannot read current directory: {e}")))?
                .join(work_dir)
        };

        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            PairError::Config(format!("Cannot create work_dir {}: {e}", root.display()))
        })?;
        let root = tokio::fs::canonicalize(&root).await.map_err(|e| {
            PairError::Config(format!("Cannot resolve work_dir {}: {e}", root.display()))
        })?;
        if !root.is_dir() {
            return Err(PairError::Config(format!(
                "work_dir {} is not a directory",
                root.display()
            )));
        }
        Ok(root)
    }

    /// Build a session and publish it. Nothing is visible until it is complete.
    pub async fn create(&self, config: SessionConfig, capabilities: Capabilities) -> Result<String> {
        if self.at_capacity(self.len().await) {
            return Err(self.capacity_error());
        }

        let work_dir = config
            .work_dir()
            .cloned()
            .ok_or_else(|| PairError::InvalidRequest("work_dir is required".to_string()))?;
        let root = Self::prepare_root(&work_dir).await?;

        let mut id = Uuid::new_v4().to_string();
        let model = config
            .model()
            .map(str::to_string)
            .unwrap_or_else(|| self.inner.settings.default_model.clone());
        let mode = config.mode.clone();
        let git = config.git;

        let engine = self
            .inner
            .factory
            .create(EngineSpec {
                root: root.clone(),
                model,
                config,
                io: Io::new(TracingSink::new(id.clone())),
            })
            .await?;

        let commands = match capabilities {
            Capabilities::Commands => Some(CommandDispatcher::new(self.inner.shell.clone())),
            Capabilities::Engine => None,
        };

        let now = Utc::now();
        let mut sessions = self.inner.sessions.write().await;
        if self.at_capacity(sessions.len()) {
            return Err(self.capacity_error());
        }
        while sessions.contains_key(&id) {
            id = Uuid::new_v4().to_string();
        }

        let handle = SessionHandle {
            id: id.clone(),
            root: root.clone(),
            capabilities,
            mode,
            created_at: now,
            seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
            last_activity: Mutex::new(now),
            state: tokio::sync::Mutex::new(SessionState {
                engine,
                commands,
                closed: false,
            }),
        };
        sessions.insert(id.clone(), Arc::new(handle));
        drop(sessions);

        tracing::info!(session_id = %id, root = %root.display(), ?capabilities, git, "Session created");
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Result<Arc<SessionHandle>> {
        self.inner
            .sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| PairError::SessionNotFound(id.to_string()))
    }

    /// Shut the engine down and remove the session.
    ///
    /// Shutdown failures are logged; the session is removed regardless.
    pub async fn end(&self, id: &str) -> Result<()> {
        let handle = self.get(id).await?;
        {
            let mut state = handle.lock().await?;
            let SessionState {
                engine, commands, ..
            } = &mut *state;
            let result = match commands {
                Some(commands) => commands.cmd_exit(engine.as_mut()).await.map(|_| ()),
                None => engine.shutdown().await.map_err(PairError::from),
            };
            if let Err(e) = result {
                tracing::warn!(session_id = %id, error = %e, "Engine shutdown failed");
            }
            state.closed = true;
        }

        self.inner.sessions.write().await.remove(id);
        tracing::info!(session_id = %id, "Session ended");
        Ok(())
    }

    /// Live session ids in creation order.
    pub async fn list(&self) -> Vec<String> {
        let sessions = self.inner.sessions.read().await;
        let mut handles: Vec<&Arc<SessionHandle>> = sessions.values().collect();
        handles.sort_by_key(|h| h.seq);
        handles.into_iter().map(|h| h.id.clone()).collect()
    }

    pub async fn info(&self, id: &str) -> Result<SessionInfo> {
        let handle = self.get(id).await?;
        let state = handle.lock().await?;
        let settings = state.engine.settings();

        Ok(SessionInfo {
            session_id: handle.id.clone(),
            root: handle.root.clone(),
            model: settings.main_model,
            weak_model: settings.weak_model,
            editor_model: settings.editor_model,
            edit_format: settings.edit_format,
            chat_mode: settings.chat_mode,
            capabilities: handle.capabilities,
            git: settings.git,
            mode: handle.mode.clone(),
            chat_files: state.engine.chat_files(),
            read_only_files: state.engine.read_only_files(),
            history_len: state.engine.history().len(),
            created_at: handle.created_at,
            last_activity: handle.last_activity(),
        })
    }

    /// End sessions idle for longer than the configured timeout. Busy
    /// sessions are skipped. Returns the ids that were ended.
    pub async fn sweep_idle(&self, now: DateTime<Utc>) -> Vec<String> {
        let Some(timeout) = self.inner.settings.idle_timeout else {
            return Vec::new();
        };

        let candidates: Vec<String> = {
            let sessions = self.inner.sessions.read().await;
            sessions
                .values()
                .filter(|h| {
                    (now - h.last_activity())
                        .to_std()
                        .is_ok_and(|idle| idle >= timeout)
                })
                .filter(|h| h.state.try_lock().is_ok())
                .map(|h| h.id.clone())
                .collect()
        };

        let mut ended = Vec::new();
        for id in candidates {
            match self.end(&id).await {
                Ok(()) => ended.push(id),
                Err(PairError::SessionNotFound(_)) => {}
                Err(e) => tracing::warn!(session_id = %id, error = %e, "Failed to end idle session"),
            }
        }
        if !ended.is_empty() {
            tracing::info!(count = ended.len(), "Ended idle sessions");
        }
        ended
    }

    /// Run [`Self::sweep_idle`] periodically. `None` when no idle timeout is set.
    pub fn spawn_sweeper(&self) -> Option<JoinHandle<()>> {
        self.inner.settings.idle_timeout?;
        let registry = self.clone();
        let period = self.inner.settings.sweep_interval;

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                registry.sweep_idle(Utc::now()).await;
            }
        }))
    }

    /// End every live session.
    pub async fn shutdown_all(&self) {
        let ids = self.list().await;
        let count = ids.len();
        for id in ids {
            if let Err(e) = self.end(&id).await {
                tracing::warn!(session_id = %id, error = %e, "Failed to end session during shutdown");
            }
        }
        tracing::info!(count, "All sessions ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{stub_factory, StubClient};
    use std::collections::HashSet;

    fn registry_with(settings: RegistrySettings) -> SessionRegistry {
        SessionRegistry::new(
            stub_factory(StubClient::replying("ok")),
            ShellRunner::default(),
            settings,
        )
    }

    fn registry() -> SessionRegistry {
        registry_with(RegistrySettings::default())
    }

    fn config_in(dir: &Path) -> SessionConfig {
        SessionConfig::default().with_work_dir(dir)
    }

    #[tokio::test]
    async fn create_list_and_end() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();

        let first = registry
            .create(config_in(dir.path()), Capabilities::Engine)
            .await
            .unwrap();
        let second = registry
            .create(config_in(dir.path()), Capabilities::Commands)
            .await
            .unwrap();
        assert_eq!(registry.list().await, vec![first.clone(), second.clone()]);

        registry.end(&first).await.unwrap();
        assert_eq!(registry.list().await, vec![second]);
        assert!(matches!(
            registry.get(&first).await,
            Err(PairError::SessionNotFound(_))
        ));
        assert!(matches!(
            registry.end(&first).await,
            Err(PairError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn create_makes_missing_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        let registry = registry();

        let id = registry
            .create(config_in(&nested), Capabilities::Engine)
            .await
            .unwrap();
        assert!(nested.is_dir());
        assert_eq!(registry.info(&id).await.unwrap().root, nested.canonicalize().unwrap());
    }

    #[tokio::test]
    async fn create_rejects_bad_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file.txt");
        std::fs::write(&file, "x").unwrap();
        let registry = registry();

        let err = registry
            .create(SessionConfig::default(), Capabilities::Commands)
            .await
            .unwrap_err();
        assert!(matches!(err, PairError::InvalidRequest(_)));

        let err = registry
            .create(config_in(&file.join("sub")), Capabilities::Engine)
            .await
            .unwrap_err();
        assert!(matches!(err, PairError::Config(_)));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn create_respects_session_limit() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with(RegistrySettings {
            max_sessions: Some(1),
            ..RegistrySettings::default()
        });

        registry
            .create(config_in(dir.path()), Capabilities::Engine)
            .await
            .unwrap();
        let err = registry
            .create(config_in(dir.path()), Capabilities::Engine)
            .await
            .unwrap_err();
        assert!(matches!(err, PairError::Unavailable(_)));
        assert_eq!(err.status_code(), axum::http::StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();

        let mut ids = HashSet::new();
        for _ in 0..50 {
            let id = registry
                .create(config_in(dir.path()), Capabilities::Engine)
                .await
                .unwrap();
            assert!(ids.insert(id));
        }
        assert_eq!(registry.len().await, 50);
    }

    #[tokio::test]
    async fn operations_on_one_session_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        let a = registry
            .create(config_in(dir.path()), Capabilities::Engine)
            .await
            .unwrap();
        let b = registry
            .create(config_in(dir.path()), Capabilities::Engine)
            .await
            .unwrap();

        let handle_a = registry.get(&a).await.unwrap();
        let held = handle_a.lock().await.unwrap();

        let contender = registry.get(&a).await.unwrap();
        let blocked =
            tokio::time::timeout(Duration::from_millis(100), async move { contender.lock().await.map(|_| ()) })
                .await;
        assert!(blocked.is_err(), "second operation should wait for the lock");

        // Another session is unaffected.
        let handle_b = registry.get(&b).await.unwrap();
        assert!(handle_b.lock().await.is_ok());

        drop(held);
        assert!(handle_a.lock().await.is_ok());
    }

    #[tokio::test]
    async fn locked_after_end_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        let id = registry
            .create(config_in(dir.path()), Capabilities::Engine)
            .await
            .unwrap();

        let stale = registry.get(&id).await.unwrap();
        registry.end(&id).await.unwrap();
        assert!(matches!(stale.lock().await, Err(PairError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn info_reports_session_details() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        let config = SessionConfig {
            model: Some("gpt-4o".to_string()),
            mode: Some("legacy".to_string()),
            ..config_in(dir.path())
        };
        let id = registry.create(config, Capabilities::Commands).await.unwrap();

        let info = registry.info(&id).await.unwrap();
        assert_eq!(info.session_id, id);
        assert_eq!(info.model, "gpt-4o");
        assert_eq!(info.edit_format, "diff");
        assert_eq!(info.capabilities, Capabilities::Commands);
        assert_eq!(info.mode.as_deref(), Some("legacy"));
        assert_eq!(info.history_len, 0);
        assert!(!info.git);
        assert_eq!(info.root, dir.path().canonicalize().unwrap());
    }

    #[tokio::test]
    async fn blank_model_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with(RegistrySettings {
            default_model: "default-model".to_string(),
            ..RegistrySettings::default()
        });
        let config = SessionConfig {
            model: Some("   ".to_string()),
            ..config_in(dir.path())
        };
        let id = registry.create(config, Capabilities::Engine).await.unwrap();

        assert_eq!(registry.info(&id).await.unwrap().model, "default-model");
    }

    #[tokio::test]
    async fn sweep_ends_only_idle_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with(RegistrySettings {
            idle_timeout: Some(Duration::from_secs(60)),
            ..RegistrySettings::default()
        });
        let id = registry
            .create(config_in(dir.path()), Capabilities::Engine)
            .await
            .unwrap();

        assert!(registry.sweep_idle(Utc::now()).await.is_empty());

        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(registry.sweep_idle(later).await, vec![id]);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn sweep_disabled_without_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        registry
            .create(config_in(dir.path()), Capabilities::Engine)
            .await
            .unwrap();

        let later = Utc::now() + chrono::Duration::days(365);
        assert!(registry.sweep_idle(later).await.is_empty());
        assert!(registry.spawn_sweeper().is_none());
    }

    #[tokio::test]
    async fn shutdown_all_empties_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        for _ in 0..3 {
            registry
                .create(config_in(dir.path()), Capabilities::Commands)
                .await
                .unwrap();
        }
        registry.shutdown_all().await;
        assert!(registry.is_empty().await);
    }
}

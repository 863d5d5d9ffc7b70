//! HTTP API routes.
//!
//! Both API versions share one set of handlers. `/api/v1` sessions wrap a
//! plain engine; `/api/v2` sessions also carry a command dispatcher and
//! expose the full command surface.

use crate::commands::{CommandDispatcher, Invocation};
use crate::engine::{ChatMode, WorkspaceEngineFactory};
use crate::error::{PairError, Result};
use crate::llm::build_client;
use crate::session::{Capabilities, RegistrySettings, SessionConfig, SessionRegistry};
use crate::shell::ShellRunner;
use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, rejection::QueryRejection, Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;
use zero_common::logging::generate_trace_id;
use zero_common::Config;

/// Application state.
#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
}

impl AppState {
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }

    /// Wire the workspace engine, completion client and shell runner from config.
    pub fn from_config(config: &Config) -> Self {
        let client = build_client(&config.llm);
        let shell = ShellRunner::from_config(&config.shell);
        let factory = Arc::new(WorkspaceEngineFactory::new(client, shell.clone()));
        Self::new(SessionRegistry::new(
            factory,
            shell,
            RegistrySettings::from_config(config),
        ))
    }
}

/// Which API surface a request came through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApiVersion {
    V1,
    V2,
}

impl ApiVersion {
    fn capabilities(self) -> Capabilities {
        match self {
            ApiVersion::V1 => Capabilities::Engine,
            ApiVersion::V2 => Capabilities::Commands,
        }
    }
}

/// Build the application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api_routes(ApiVersion::V1))
        .nest("/api/v2", api_routes(ApiVersion::V2))
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

fn api_routes(version: ApiVersion) -> Router<AppState> {
    let router = Router::new()
        .route("/sessions", get(list_sessions))
        .route("/sessions/:id", get(get_session).delete(end_session))
        .route("/sessions/:id/history", get(get_history));

    match version {
        ApiVersion::V1 => router
            .route("/sessions", post(create_session_v1))
            .route("/sessions/:id/chat", post(chat_v1)),
        ApiVersion::V2 => router
            .route("/sessions", post(create_session_v2))
            .route("/sessions/:id/chat", post(chat_v2))
            .route("/sessions/:id/map", post(repo_map))
            .route("/sessions/:id/map2", post(repo_map_output))
            .route("/sessions/:id/add", post(add_files))
            .route("/sessions/:id/drop", post(drop_files))
            .route("/sessions/:id/read-only", post(add_read_only))
            .route("/sessions/:id/ls", get(list_files))
            .route("/sessions/:id/tokens", get(tokens))
            .route("/sessions/:id/settings", get(settings))
            .route("/sessions/:id/diff", get(diff))
            .route("/sessions/:id/help", get(help))
            .route("/sessions/:id/model", post(switch_model))
            .route("/sessions/:id/chat-mode", post(chat_mode))
            .route("/sessions/:id/clear", post(clear_history))
            .route("/sessions/:id/reset", post(reset))
            .route("/sessions/:id/run", post(run_command))
            .route("/sessions/:id/lint", post(lint))
            .route("/sessions/:id/test", post(test))
            .route("/sessions/:id/git", post(git))
            .route("/sessions/:id/commit", post(commit))
            .route("/sessions/:id/undo", post(undo))
            .route("/sessions/:id/command", post(command))
            .route("/sessions/:id/commands", get(list_commands).post(command))
            .route("/sessions/:id/code", post(code))
            .route("/sessions/:id/ask", post(ask))
            .route("/sessions/:id/architect", post(architect)),
    }
}

/// Log method, path, status and latency for every request.
async fn log_requests(request: Request, next: Next) -> Response {
    let trace_id = generate_trace_id();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let span = zero_common::request_span!("http_request", trace_id, method = %method, path = %path);

    let start = Instant::now();
    let response = next.run(request).instrument(span.clone()).await;
    tracing::info!(
        parent: &span,
        status = response.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Request completed"
    );
    response
}

// ============ Request Bodies ============

type Payload<T> = std::result::Result<Json<T>, JsonRejection>;

/// Unwrap a JSON body. A request without a JSON body reads as the default.
fn body<T: Default>(payload: Payload<T>) -> Result<T> {
    match payload {
        Ok(Json(value)) => Ok(value),
        Err(JsonRejection::MissingJsonContentType(_)) => Ok(T::default()),
        Err(rejection) => Err(PairError::InvalidRequest(rejection.body_text())),
    }
}

/// Parse an optional JSON body: empty reads as the default.
fn optional_body<T: Default + DeserializeOwned>(bytes: &Bytes) -> Result<T> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(bytes)
        .map_err(|e| PairError::InvalidRequest(format!("Invalid JSON body: {e}")))
}

fn required(value: Option<String>, what: &str) -> Result<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| PairError::InvalidRequest(format!("{what} is required")))
}

/// File names from a request body. Blank names are rejected.
fn file_names(files: Vec<String>, allow_empty: bool) -> Result<Vec<String>> {
    if files.is_empty() && !allow_empty {
        return Err(PairError::InvalidRequest("Files list is required".to_string()));
    }
    if files.iter().any(|f| f.trim().is_empty()) {
        return Err(PairError::InvalidRequest(
            "File names must not be blank".to_string(),
        ));
    }
    Ok(files)
}

#[derive(Debug, Default, Deserialize)]
struct MessageRequest {
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FilesRequest {
    #[serde(default)]
    files: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CommandRequest {
    command: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelRequest {
    model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatModeRequest {
    mode: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CommitRequest {
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct HelpQuery {
    topic: Option<String>,
}

// ============ Health Check ============

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "zero-pair",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.registry.len().await
    }))
}

// ============ Session Lifecycle ============

async fn create_session(state: AppState, version: ApiVersion, bytes: Bytes) -> Result<Response> {
    let mut config: SessionConfig = optional_body(&bytes)?;
    if config.work_dir().is_none() {
        match version {
            ApiVersion::V1 => {
                config.work_dir = Some(state.registry.settings().default_work_dir.clone());
            }
            ApiVersion::V2 => {
                return Err(PairError::InvalidRequest("work_dir is required".to_string()));
            }
        }
    }

    let session_id = state
        .registry
        .create(config, version.capabilities())
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "session_id": session_id }))).into_response())
}

async fn create_session_v1(State(state): State<AppState>, bytes: Bytes) -> Result<Response> {
    create_session(state, ApiVersion::V1, bytes).await
}

async fn create_session_v2(State(state): State<AppState>, bytes: Bytes) -> Result<Response> {
    create_session(state, ApiVersion::V2, bytes).await
}

async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "sessions": state.registry.list().await }))
}

async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
    let info = state.registry.info(&id).await?;
    Ok(Json(json!(info)))
}

async fn end_session(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode> {
    state.registry.end(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_history(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
    let session = state.registry.get(&id).await?;
    let mut guard = session.lock().await?;
    Ok(Json(json!({ "history": guard.engine().history() })))
}

// ============ Chat ============

async fn chat_v1(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Payload<MessageRequest>,
) -> Result<Json<Value>> {
    let message = required(body(payload)?.message, "Message")?;

    let session = state.registry.get(&id).await?;
    let mut guard = session.lock().await?;
    let response = guard.engine().chat(&message).await?;
    Ok(Json(json!({ "response": response })))
}

async fn chat_v2(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Payload<MessageRequest>,
) -> Result<Json<Value>> {
    let message = required(body(payload)?.message, "Message")?;

    if message.trim_start().starts_with(['/', '!']) {
        let response = dispatch_line(&state, &id, &message).await?;
        return Ok(Json(json!({ "response": response })));
    }

    let session = state.registry.get(&id).await?;
    let mut guard = session.lock().await?;
    let response = guard.engine().chat(&message).await?;
    Ok(Json(json!({ "response": response })))
}

/// Run one command line through the session's dispatcher. `/exit` ends the session.
async fn dispatch_line(state: &AppState, id: &str, line: &str) -> Result<Value> {
    let invocation = CommandDispatcher::parse(line)?;
    let session = state.registry.get(id).await?;

    if let Invocation::Command { name: "exit", .. } = invocation {
        {
            let mut guard = session.lock().await?;
            guard.with_commands()?;
        }
        state.registry.end(id).await?;
        return Ok(json!("Session ended"));
    }

    let mut guard = session.lock().await?;
    let (commands, engine) = guard.with_commands()?;
    commands.run(engine, line).await
}

// ============ Repository Map & Files ============

async fn repo_map(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
    let session = state.registry.get(&id).await?;
    let mut guard = session.lock().await?;
    let engine = guard.engine();

    let repo_map = engine.repo_map(true).await?;
    Ok(Json(json!({
        "repo_map": repo_map,
        "all_files": engine.all_files().await?,
        "chat_files": engine.chat_files(),
        "addable_files": engine.addable_files().await?,
        "root": engine.root(),
    })))
}

async fn repo_map_output(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
    let session = state.registry.get(&id).await?;
    let mut guard = session.lock().await?;
    let (commands, engine) = guard.with_commands()?;

    let io = engine.io();
    let (result, map_output) = io.capture_during(commands.cmd_map(engine)).await;
    result?;

    Ok(Json(json!({
        "map_output": map_output,
        "root": engine.root(),
        "files": {
            "all_files": engine.all_files().await?,
            "chat_files": engine.chat_files(),
            "addable_files": engine.addable_files().await?,
        },
    })))
}

async fn add_files(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Payload<FilesRequest>,
) -> Result<Json<Value>> {
    let files = file_names(body(payload)?.files, false)?;

    let session = state.registry.get(&id).await?;
    let mut guard = session.lock().await?;
    let (commands, engine) = guard.with_commands()?;
    let results = commands.cmd_add(engine, &files).await?;
    Ok(Json(json!({ "results": results })))
}

async fn drop_files(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Payload<FilesRequest>,
) -> Result<Json<Value>> {
    let files = file_names(body(payload)?.files, true)?;

    let session = state.registry.get(&id).await?;
    let mut guard = session.lock().await?;
    let (commands, engine) = guard.with_commands()?;
    let results = commands.cmd_drop(engine, &files);
    Ok(Json(json!({ "results": results })))
}

async fn add_read_only(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Payload<FilesRequest>,
) -> Result<Json<Value>> {
    let files = file_names(body(payload)?.files, false)?;

    let session = state.registry.get(&id).await?;
    let mut guard = session.lock().await?;
    let (commands, engine) = guard.with_commands()?;
    let results = commands.cmd_read_only(engine, &files).await?;
    Ok(Json(json!({ "results": results })))
}

// ============ Reports ============

async fn list_files(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
    let session = state.registry.get(&id).await?;
    let mut guard = session.lock().await?;
    let (commands, engine) = guard.with_commands()?;

    let io = engine.io();
    let (result, lines) = io.capture_during(commands.cmd_ls(engine)).await;
    result?;
    Ok(Json(json!({ "ls_output": lines })))
}

async fn tokens(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
    let session = state.registry.get(&id).await?;
    let mut guard = session.lock().await?;
    let (commands, engine) = guard.with_commands()?;

    let io = engine.io();
    let (result, lines) = io.capture_during(commands.cmd_tokens(engine)).await;
    result?;
    Ok(Json(json!({ "token_info": lines })))
}

async fn settings(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
    let session = state.registry.get(&id).await?;
    let mut guard = session.lock().await?;
    let (commands, engine) = guard.with_commands()?;

    let capture = engine.io().capture();
    commands.cmd_settings(engine);
    Ok(Json(json!({ "settings_output": capture.finish() })))
}

async fn diff(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
    let session = state.registry.get(&id).await?;
    let mut guard = session.lock().await?;
    let (commands, engine) = guard.with_commands()?;

    let diff = commands.cmd_diff(engine).await?;
    Ok(Json(json!({ "diff_output": diff })))
}

async fn help(
    State(state): State<AppState>,
    Path(id): Path<String>,
    query: std::result::Result<Query<HelpQuery>, QueryRejection>,
) -> Result<Json<Value>> {
    let Query(query) = query.map_err(|e| PairError::InvalidRequest(e.body_text()))?;
    let topic = query.topic.unwrap_or_default();

    let session = state.registry.get(&id).await?;
    let mut guard = session.lock().await?;
    let (commands, engine) = guard.with_commands()?;

    let io = engine.io();
    let (result, lines) = io.capture_during(commands.cmd_help(engine, &topic)).await;
    result?;
    Ok(Json(json!({ "help_output": lines })))
}

// ============ Engine Settings ============

async fn switch_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Payload<ModelRequest>,
) -> Result<Json<Value>> {
    let model = required(body(payload)?.model, "Model name")?;

    let session = state.registry.get(&id).await?;
    let mut guard = session.lock().await?;
    let (commands, engine) = guard.with_commands()?;
    let result = commands.cmd_model(engine, &model).await?;
    Ok(Json(json!({ "model": model.trim(), "result": result })))
}

async fn chat_mode(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Payload<ChatModeRequest>,
) -> Result<Json<Value>> {
    let mode = required(body(payload)?.mode, "Chat mode")?;

    let session = state.registry.get(&id).await?;
    let mut guard = session.lock().await?;
    let (commands, engine) = guard.with_commands()?;
    let mode = commands.cmd_chat_mode(engine, &mode)?;
    Ok(Json(json!({ "chat_mode": mode })))
}

async fn clear_history(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
    let session = state.registry.get(&id).await?;
    let mut guard = session.lock().await?;
    let (commands, engine) = guard.with_commands()?;
    Ok(Json(json!({ "result": commands.cmd_clear(engine) })))
}

async fn reset(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
    let session = state.registry.get(&id).await?;
    let mut guard = session.lock().await?;
    let (commands, engine) = guard.with_commands()?;
    Ok(Json(json!({ "result": commands.cmd_reset(engine) })))
}

// ============ Shell, Lint, Test, Git ============

async fn run_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Payload<CommandRequest>,
) -> Result<Json<Value>> {
    let command = required(body(payload)?.command, "Command")?;

    let session = state.registry.get(&id).await?;
    let mut guard = session.lock().await?;
    let (commands, engine) = guard.with_commands()?;
    let output = commands.cmd_run(engine, &command).await?;
    Ok(Json(json!(output)))
}

async fn lint(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Payload<FilesRequest>,
) -> Result<Json<Value>> {
    let request = body(payload)?;

    let session = state.registry.get(&id).await?;
    let mut guard = session.lock().await?;
    let (commands, engine) = guard.with_commands()?;
    let output = commands.cmd_lint(engine, &request.files).await?;
    Ok(Json(json!(output)))
}

async fn test(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Payload<CommandRequest>,
) -> Result<Json<Value>> {
    let command = body(payload)?.command.unwrap_or_default();

    let session = state.registry.get(&id).await?;
    let mut guard = session.lock().await?;
    let (commands, engine) = guard.with_commands()?;
    let output = commands.cmd_test(engine, &command).await?;
    Ok(Json(json!(output)))
}

async fn git(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Payload<CommandRequest>,
) -> Result<Json<Value>> {
    let command = required(body(payload)?.command, "Git command")?;

    let session = state.registry.get(&id).await?;
    let mut guard = session.lock().await?;
    let (commands, engine) = guard.with_commands()?;
    let output = commands.cmd_git(engine, &command).await?;
    Ok(Json(json!(output)))
}

async fn commit(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Payload<CommitRequest>,
) -> Result<Json<Value>> {
    let message = body(payload)?.message.unwrap_or_default();

    let session = state.registry.get(&id).await?;
    let mut guard = session.lock().await?;
    let (commands, engine) = guard.with_commands()?;
    let result = commands.cmd_commit(engine, &message).await?;
    Ok(Json(json!({ "result": result })))
}

async fn undo(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
    let session = state.registry.get(&id).await?;
    let mut guard = session.lock().await?;
    let (commands, engine) = guard.with_commands()?;
    let result = commands.cmd_undo(engine).await?;
    Ok(Json(json!({ "result": result })))
}

// ============ Commands ============

async fn command(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Payload<CommandRequest>,
) -> Result<Json<Value>> {
    let line = required(body(payload)?.command, "Command")?;
    let result = dispatch_line(&state, &id, &line).await?;
    Ok(Json(json!({ "result": result })))
}

async fn list_commands(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
    let session = state.registry.get(&id).await?;
    let mut guard = session.lock().await?;
    guard.with_commands()?;
    Ok(Json(json!({ "commands": CommandDispatcher::commands() })))
}

async fn mode_message(
    state: AppState,
    id: String,
    mode: ChatMode,
    payload: Payload<MessageRequest>,
) -> Result<Json<Value>> {
    let message = required(body(payload)?.message, "Message")?;

    let session = state.registry.get(&id).await?;
    let mut guard = session.lock().await?;
    let (commands, engine) = guard.with_commands()?;
    let result = commands.execute(engine, mode.as_str(), &message).await?;
    Ok(Json(json!({ "result": result })))
}

async fn code(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Payload<MessageRequest>,
) -> Result<Json<Value>> {
    mode_message(state, id, ChatMode::Code, payload).await
}

async fn ask(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Payload<MessageRequest>,
) -> Result<Json<Value>> {
    mode_message(state, id, ChatMode::Ask, payload).await
}

async fn architect(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Payload<MessageRequest>,
) -> Result<Json<Value>> {
    mode_message(state, id, ChatMode::Architect, payload).await
}

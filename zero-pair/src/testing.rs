//! Test doubles shared by unit tests.

use crate::engine::{
    Engine, EngineFactory, EngineSpec, Io, OutputSink, TracingSink, WorkspaceEngineFactory,
};
use crate::llm::{
    Choice, ChoiceMessage, CompletionClient, CompletionRequest, CompletionResponse, LlmError,
    Usage,
};
use crate::session::SessionConfig;
use crate::shell::ShellRunner;
use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Completion client that records requests and answers with a fixed reply.
#[derive(Clone)]
pub(crate) struct StubClient {
    reply: Option<String>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl StubClient {
    pub(crate) fn replying(reply: &str) -> Self {
        Self {
            reply: Some(reply.to_string()),
            requests: Arc::default(),
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            reply: None,
            requests: Arc::default(),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub(crate) fn last_request(&self) -> Option<CompletionRequest> {
        self.requests.lock().unwrap().last().cloned()
    }

    pub(crate) fn into_arc(self) -> Arc<dyn CompletionClient> {
        Arc::new(self)
    }
}

#[async_trait]
impl CompletionClient for StubClient {
    fn name(&self) -> &str {
        "stub"
    }

    async fn completion(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let model = request.model.clone();
        self.requests.lock().unwrap().push(request);
        match &self.reply {
            Some(reply) => Ok(CompletionResponse {
                model,
                choices: vec![Choice {
                    message: ChoiceMessage::text(reply.clone()),
                    finish_reason: Some("stop".to_string()),
                }],
                usage: Usage::default(),
            }),
            None => Err(LlmError::Api {
                status: 503,
                body: "stub failure".to_string(),
            }),
        }
    }
}

pub(crate) fn stub_factory(client: StubClient) -> Arc<dyn EngineFactory> {
    Arc::new(WorkspaceEngineFactory::new(
        client.into_arc(),
        ShellRunner::default(),
    ))
}

/// Sink that keeps every line it receives.
#[derive(Clone, Default)]
pub(crate) struct RecordingSink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl RecordingSink {
    pub(crate) fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl OutputSink for RecordingSink {
    fn tool_output(&mut self, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }
}

/// Factory whose engines all write to one [`RecordingSink`].
pub(crate) struct RecordingFactory {
    inner: WorkspaceEngineFactory,
    sink: RecordingSink,
}

#[async_trait]
impl EngineFactory for RecordingFactory {
    async fn create(&self, mut spec: EngineSpec) -> anyhow::Result<Box<dyn Engine>> {
        spec.io = Io::new(self.sink.clone());
        self.inner.create(spec).await
    }
}

pub(crate) fn recording_factory(client: StubClient) -> (Arc<dyn EngineFactory>, RecordingSink) {
    let sink = RecordingSink::default();
    let factory = RecordingFactory {
        inner: WorkspaceEngineFactory::new(client.into_arc(), ShellRunner::default()),
        sink: sink.clone(),
    };
    (Arc::new(factory), sink)
}

pub(crate) async fn workspace_engine(dir: &Path, client: StubClient) -> Box<dyn Engine> {
    workspace_engine_with(dir, client, SessionConfig::default()).await
}

pub(crate) async fn workspace_engine_with(
    dir: &Path,
    client: StubClient,
    config: SessionConfig,
) -> Box<dyn Engine> {
    let spec = EngineSpec {
        root: dir.canonicalize().unwrap(),
        model: config.model.clone().unwrap_or_else(|| "gpt-4".to_string()),
        config,
        io: Io::new(TracingSink::new("test")),
    };
    stub_factory(client).create(spec).await.unwrap()
}

//! Tool-output side channel for engines.
//!
//! Several engine operations report only by emitting lines to their output
//! sink. `Io::capture` swaps in a collecting sink for the lifetime of a
//! [`CaptureGuard`]; the previous sink is put back when the guard is
//! finished or dropped, including during unwinding.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

/// Receiver for lines an engine wants shown to the user.
pub trait OutputSink: Send {
    fn tool_output(&mut self, line: &str);

    fn tool_error(&mut self, line: &str) {
        self.tool_output(line);
    }
}

/// Default sink: forwards engine output to the log.
#[derive(Debug, Clone)]
pub struct TracingSink {
    session: String,
}

impl TracingSink {
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
        }
    }
}

impl OutputSink for TracingSink {
    fn tool_output(&mut self, line: &str) {
        tracing::debug!(target: "engine_output", session = %self.session, "{}", line);
    }

    fn tool_error(&mut self, line: &str) {
        tracing::warn!(target: "engine_output", session = %self.session, "{}", line);
    }
}

/// Sink that appends every line to a shared buffer.
struct CaptureSink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl OutputSink for CaptureSink {
    fn tool_output(&mut self, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.to_string());
    }
}

/// Cloneable handle to an engine's output sink.
#[derive(Clone)]
pub struct Io {
    sink: Arc<Mutex<Box<dyn OutputSink>>>,
}

impl Io {
    pub fn new(sink: impl OutputSink + 'static) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Box::new(sink))),
        }
    }

    pub fn tool_output(&self, line: impl AsRef<str>) {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tool_output(line.as_ref());
    }

    pub fn tool_error(&self, line: impl AsRef<str>) {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tool_error(line.as_ref());
    }

    fn replace(&self, sink: Box<dyn OutputSink>) -> Box<dyn OutputSink> {
        let mut current = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, sink)
    }

    /// Start collecting output until the returned guard is finished or dropped.
    pub fn capture(&self) -> CaptureGuard {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let original = self.replace(Box::new(CaptureSink {
            lines: Arc::clone(&lines),
        }));
        CaptureGuard {
            io: self.clone(),
            original: Some(original),
            lines,
        }
    }

    /// Drive `fut` with output captured, returning its result and the lines.
    pub async fn capture_during<F: Future>(&self, fut: F) -> (F::Output, Vec<String>) {
        let guard = self.capture();
        let output = fut.await;
        (output, guard.finish())
    }
}

impl std::fmt::Debug for Io {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Io").finish_non_exhaustive()
    }
}

/// Scoped output capture. Restores the original sink on every exit path.
#[must_use = "output is only captured while the guard is alive"]
pub struct CaptureGuard {
    io: Io,
    original: Option<Box<dyn OutputSink>>,
    lines: Arc<Mutex<Vec<String>>>,
}

impl CaptureGuard {
    fn restore(&mut self) {
        if let Some(original) = self.original.take() {
            self.io.replace(original);
        }
    }

    /// Restore the original sink and return the captured lines in order.
    pub fn finish(mut self) -> Vec<String> {
        self.restore();
        std::mem::take(&mut *self.lines.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        self.restore();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl OutputSink for Recorder {
        fn tool_output(&mut self, line: &str) {
            self.0.lock().unwrap().push(line.to_string());
        }
    }

    impl Recorder {
        fn lines(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    #[test]
    fn test_capture_collects_in_order_and_restores() {
        let recorder = Recorder::default();
        let io = Io::new(recorder.clone());

        io.tool_output("before");
        let guard = io.capture();
        io.tool_output("one");
        io.tool_error("two");
        let captured = guard.finish();
        io.tool_output("after");

        assert_eq!(captured, vec!["one", "two"]);
        assert_eq!(recorder.lines(), vec!["before", "after"]);
    }

    #[test]
    fn test_capture_restores_on_early_return() {
        fn failing(io: &Io) -> Result<Vec<String>, String> {
            let guard = io.capture();
            io.tool_output("partial");
            Err("induced failure".to_string())?;
            Ok(guard.finish())
        }

        let recorder = Recorder::default();
        let io = Io::new(recorder.clone());

        assert!(failing(&io).is_err());
        io.tool_output("visible");
        assert_eq!(recorder.lines(), vec!["visible"]);
    }

    #[test]
    fn test_capture_restores_on_panic() {
        let recorder = Recorder::default();
        let io = Io::new(recorder.clone());

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = io.capture();
            io.tool_output("lost");
            panic!("engine blew up");
        }));

        assert!(result.is_err());
        io.tool_output("still works");
        assert_eq!(recorder.lines(), vec!["still works"]);
    }

    #[tokio::test]
    async fn test_capture_during_returns_result_and_lines() {
        let recorder = Recorder::default();
        let io = Io::new(recorder.clone());

        let emitter = io.clone();
        let (result, lines) = io
            .capture_during(async move {
                emitter.tool_output("Files in chat:");
                Err::<(), _>("no repo")
            })
            .await;

        assert_eq!(result, Err("no repo"));
        assert_eq!(lines, vec!["Files in chat:"]);
        io.tool_output("restored");
        assert_eq!(recorder.lines(), vec!["restored"]);
    }

    #[test]
    fn test_nested_captures_unwind_in_order() {
        let recorder = Recorder::default();
        let io = Io::new(recorder.clone());

        let outer = io.capture();
        io.tool_output("outer-1");
        let inner = io.capture();
        io.tool_output("inner");
        assert_eq!(inner.finish(), vec!["inner"]);
        io.tool_output("outer-2");
        assert_eq!(outer.finish(), vec!["outer-1", "outer-2"]);

        io.tool_output("root");
        assert_eq!(recorder.lines(), vec!["root"]);
    }
}

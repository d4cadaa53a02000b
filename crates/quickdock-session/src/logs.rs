//! Per-client container log streams.
//!
//! A [`LogTail`] opens one follow-mode engine log connection per client and
//! re-opens it whenever the engine drops it while the container is still alive.
//! Payloads are split into lines but otherwise untouched, so ANSI colour codes
//! reach the client as the container wrote them.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use futures::StreamExt;
use quickdock_core::{ContainerStatus, Engine, EngineError, LogCursor, LogSource, LogStream};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::SessionError;

/// Log tail configuration.
#[derive(Debug, Clone)]
pub struct LogTailConfig {
    /// Lines replayed on the first connection when the client does not ask
    /// for a specific amount.
    pub backlog: u32,
    /// Pause before re-opening a dropped engine connection.
    pub reconnect_delay: Duration,
    /// How far before the last received frame a reconnect resumes. Covers
    /// clock skew between this host and the engine; replayed lines are
    /// preferred over lost ones.
    pub resume_overlap: Duration,
    /// Queued lines per client.
    pub buffer: usize,
}

impl Default for LogTailConfig {
    fn default() -> Self {
        Self {
            backlog: 200,
            reconnect_delay: Duration::from_secs(1),
            resume_overlap: Duration::from_secs(5),
            buffer: 256,
        }
    }
}

/// Why a log stream ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum LogEnd {
    /// The container is no longer running and will not come back by itself.
    ContainerStopped { status: ContainerStatus },
    ContainerRemoved,
    ClientDisconnected,
    /// The stream was closed by its owner or by server shutdown.
    Closed,
    /// The engine refused to serve the logs, e.g. an unreadable log driver.
    EngineFailed { message: String },
}

/// One line (or partial line) of container output, newline included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    pub source: LogSource,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogMessage {
    Line(LogLine),
    /// Final notice; nothing follows it.
    Ended(LogEnd),
}

/// Opens log streams against an engine.
#[derive(Clone)]
pub struct LogTail {
    engine: Arc<dyn Engine>,
    config: LogTailConfig,
    shutdown: CancellationToken,
}

impl LogTail {
    #[must_use]
    pub fn new(engine: Arc<dyn Engine>, config: LogTailConfig) -> Self {
        Self {
            engine,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Start tailing `container_id`, replaying `backlog` lines (or the
    /// configured default) before following.
    ///
    /// # Errors
    /// `ContainerNotFound` for unknown containers, `Unavailable` if the engine
    /// cannot be reached.
    pub async fn open(
        &self,
        container_id: &str,
        backlog: Option<u32>,
    ) -> Result<LogTailHandle, SessionError> {
        self.engine.container_status(container_id).await?;
        let backlog = backlog.unwrap_or(self.config.backlog);
        let opened_at = unix_now();
        let stream = self
            .engine
            .tail_logs(container_id, LogCursor::Tail(backlog))
            .await?;

        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.config.buffer.max(1));
        let cancel = self.shutdown.child_token();

        tracing::info!(stream_id = %id, container_id, backlog, "Log stream opened");

        let actor = TailActor {
            id,
            container_id: container_id.to_string(),
            engine: Arc::clone(&self.engine),
            reconnect_delay: self.config.reconnect_delay,
            resume_overlap: i64::try_from(self.config.resume_overlap.as_secs())
                .unwrap_or(i64::MAX),
            out: tx,
            cancel: cancel.clone(),
            cursor: opened_at,
            carry: Utf8Carry::default(),
        };
        tokio::spawn(actor.run(stream));

        Ok(LogTailHandle {
            id,
            container_id: container_id.to_string(),
            rx,
            cancel,
            closed: false,
        })
    }
}

/// Client side of a log stream. Dropping it tears down the engine connection.
pub struct LogTailHandle {
    id: Uuid,
    container_id: String,
    rx: mpsc::Receiver<LogMessage>,
    cancel: CancellationToken,
    closed: bool,
}

impl LogTailHandle {
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// Next line or the final notice; `None` after close.
    pub async fn recv(&mut self) -> Option<LogMessage> {
        if self.closed {
            return None;
        }
        self.rx.recv().await
    }

    /// Stop the stream. Idempotent; nothing is yielded afterwards.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.cancel.cancel();
        self.rx.close();
    }
}

impl Drop for LogTailHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Interrupted {
    /// The engine connection ended or failed transiently.
    Dropped,
    Stop(LogEnd),
}

/// Engine errors that retrying cannot fix end the stream.
fn terminal(e: &EngineError) -> Option<LogEnd> {
    match e {
        _ if e.is_transient() => None,
        EngineError::ContainerNotFound(_) => Some(LogEnd::ContainerRemoved),
        e => Some(LogEnd::EngineFailed {
            message: e.to_string(),
        }),
    }
}

struct TailActor {
    id: Uuid,
    container_id: String,
    engine: Arc<dyn Engine>,
    reconnect_delay: Duration,
    resume_overlap: i64,
    out: mpsc::Sender<LogMessage>,
    cancel: CancellationToken,
    /// Unix seconds of the last frame seen; reconnects resume from here.
    cursor: i64,
    carry: Utf8Carry,
}

impl TailActor {
    async fn run(mut self, mut stream: LogStream) {
        let end = loop {
            match self.pump(&mut stream).await {
                Interrupted::Stop(end) => break end,
                Interrupted::Dropped => {}
            }
            // Release the old connection before opening a new one.
            stream = futures::stream::empty().boxed();
            match self.reconnect().await {
                Ok(next) => stream = next,
                Err(end) => break end,
            }
        };
        drop(stream);

        tracing::info!(
            stream_id = %self.id,
            container_id = %self.container_id,
            end = ?end,
            "Log stream ended"
        );
        if end != LogEnd::ClientDisconnected {
            let _ = self.out.send(LogMessage::Ended(end)).await;
        }
    }

    async fn pump(&mut self, stream: &mut LogStream) -> Interrupted {
        let interrupted = loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Interrupted::Stop(LogEnd::Closed),
                () = self.out.closed() => return Interrupted::Stop(LogEnd::ClientDisconnected),
                frame = stream.next() => match frame {
                    Some(Ok(frame)) => {
                        self.cursor = unix_now();
                        let text = self.carry.decode(frame.source, &frame.payload);
                        if !self.emit(frame.source, &text).await {
                            return Interrupted::Stop(LogEnd::ClientDisconnected);
                        }
                    }
                    Some(Err(e)) => {
                        tracing::debug!(stream_id = %self.id, error = %e, "Log connection failed");
                        break terminal(&e).map_or(Interrupted::Dropped, Interrupted::Stop);
                    }
                    None => break Interrupted::Dropped,
                },
            }
        };

        // Bytes left over from a finished connection can never complete.
        for (source, rest) in self.carry.flush() {
            if !self.emit(source, &rest).await {
                return Interrupted::Stop(LogEnd::ClientDisconnected);
            }
        }
        interrupted
    }

    /// Send every line of `text`; false once the client is gone.
    async fn emit(&self, source: LogSource, text: &str) -> bool {
        for line in text.split_inclusive('\n') {
            let line = LogLine {
                source,
                text: line.to_string(),
            };
            if self.out.send(LogMessage::Line(line)).await.is_err() {
                return false;
            }
        }
        true
    }

    /// Re-open the engine connection if the container is still alive.
    async fn reconnect(&self) -> Result<LogStream, LogEnd> {
        loop {
            match self.engine.container_status(&self.container_id).await {
                Ok(status) if status.is_alive() => {}
                Ok(status) => return Err(LogEnd::ContainerStopped { status }),
                Err(e) => {
                    if let Some(end) = terminal(&e) {
                        return Err(end);
                    }
                    tracing::warn!(stream_id = %self.id, error = %e, "Log reconnect check failed");
                }
            }

            self.pause().await?;

            let since = self.cursor.saturating_sub(self.resume_overlap);
            match self
                .engine
                .tail_logs(&self.container_id, LogCursor::Since(since))
                .await
            {
                Ok(stream) => {
                    tracing::debug!(
                        stream_id = %self.id,
                        container_id = %self.container_id,
                        since,
                        "Log stream reconnected"
                    );
                    return Ok(stream);
                }
                Err(e) => {
                    if let Some(end) = terminal(&e) {
                        return Err(end);
                    }
                    tracing::warn!(stream_id = %self.id, error = %e, "Log reconnect failed");
                }
            }
        }
    }

    async fn pause(&self) -> Result<(), LogEnd> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(LogEnd::Closed),
            () = self.out.closed() => Err(LogEnd::ClientDisconnected),
            () = tokio::time::sleep(self.reconnect_delay) => Ok(()),
        }
    }
}

/// Incremental UTF-8 decoder, one per log source.
///
/// Engine frames are arbitrary byte chunks, so a multibyte character may be
/// split across two of them. Incomplete trailing bytes wait for the next
/// frame; only genuinely invalid bytes become U+FFFD.
#[derive(Default)]
struct Utf8Carry {
    pending: Vec<(LogSource, Vec<u8>)>,
}

impl Utf8Carry {
    fn decode(&mut self, source: LogSource, payload: &[u8]) -> String {
        let mut bytes = match self.pending.iter().position(|(s, _)| *s == source) {
            Some(i) => self.pending.swap_remove(i).1,
            None => Vec::new(),
        };
        bytes.extend_from_slice(payload);

        let mut text = String::with_capacity(bytes.len());
        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        if !rest.is_empty() {
            self.pending.push((source, rest.to_vec()));
        }
        text
    }

    /// Drain incomplete sequences, replaced lossily.
    fn flush(&mut self) -> Vec<(LogSource, String)> {
        self.pending
            .drain(..)
            .map(|(source, bytes)| (source, String::from_utf8_lossy(&bytes).into_owned()))
            .collect()
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use quickdock_core::{
        LogFrame,
        testing::{ScriptedEngine, container_view},
    };
    use tokio_test::{assert_pending, task};

    use super::*;

    fn engine() -> Arc<ScriptedEngine> {
        ScriptedEngine::new(vec![container_view(
            "web",
            ContainerStatus::Running,
            Some("shop"),
        )])
    }

    fn tail(engine: &Arc<ScriptedEngine>) -> LogTail {
        LogTail::new(
            engine.clone(),
            LogTailConfig {
                reconnect_delay: Duration::from_millis(10),
                ..LogTailConfig::default()
            },
        )
    }

    async fn next(handle: &mut LogTailHandle) -> LogMessage {
        tokio::time::timeout(Duration::from_secs(1), handle.recv())
            .await
            .expect("timed out waiting for log message")
            .expect("stream closed")
    }

    fn line(text: &str) -> LogMessage {
        LogMessage::Line(LogLine {
            source: LogSource::Stdout,
            text: text.to_string(),
        })
    }

    #[tokio::test]
    async fn test_unknown_container_is_rejected() {
        let engine = engine();
        let err = tail(&engine).open("nope", None).await.err().unwrap();
        assert!(matches!(err, SessionError::Engine(EngineError::ContainerNotFound(_))));
        assert!(engine.tail_calls().is_empty());
    }

    #[tokio::test]
    async fn test_first_connection_uses_backlog() {
        let engine = engine();
        let tail = tail(&engine);
        let _default = tail.open("web", None).await.unwrap();
        let _custom = tail.open("web", Some(5)).await.unwrap();

        let calls = engine.tail_calls();
        assert_eq!(calls[0].1, LogCursor::Tail(200));
        assert_eq!(calls[1].1, LogCursor::Tail(5));
    }

    #[tokio::test]
    async fn test_frames_are_split_into_lines_with_ansi_intact() {
        let engine = engine();
        let feed = engine.push_log_feed("web");
        let mut handle = tail(&engine).open("web", None).await.unwrap();

        feed.send(Ok(LogFrame::stdout("\x1b[31mred\x1b[0m\nplain\n"))).unwrap();
        feed.send(Ok(LogFrame::stderr("partial"))).unwrap();

        assert_eq!(next(&mut handle).await, line("\x1b[31mred\x1b[0m\n"));
        assert_eq!(next(&mut handle).await, line("plain\n"));
        assert_eq!(
            next(&mut handle).await,
            LogMessage::Line(LogLine {
                source: LogSource::Stderr,
                text: "partial".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_multibyte_characters_survive_frame_boundaries() {
        let engine = engine();
        let feed = engine.push_log_feed("web");
        let mut handle = tail(&engine).open("web", None).await.unwrap();

        feed.send(Ok(LogFrame::stdout(&b"caf\xc3"[..]))).unwrap();
        feed.send(Ok(LogFrame::stdout(&b"\xa9\n"[..]))).unwrap();
        assert_eq!(next(&mut handle).await, line("caf"));
        assert_eq!(next(&mut handle).await, line("\u{e9}\n"));

        feed.send(Ok(LogFrame::stdout(&b"bad\xff\n"[..]))).unwrap();
        assert_eq!(next(&mut handle).await, line("bad\u{fffd}\n"));

        feed.send(Ok(LogFrame::stdout(&b"cut \xe2\x82"[..]))).unwrap();
        assert_eq!(next(&mut handle).await, line("cut "));
        engine.set_status("web", ContainerStatus::Exited);
        drop(feed);
        assert_eq!(next(&mut handle).await, line("\u{fffd}"));
        assert!(matches!(
            next(&mut handle).await,
            LogMessage::Ended(LogEnd::ContainerStopped { .. })
        ));
    }

    #[tokio::test]
    async fn test_reconnects_while_container_runs() {
        let engine = engine();
        let first = engine.push_log_feed("web");
        let second = engine.push_log_feed("web");
        let mut handle = tail(&engine).open("web", None).await.unwrap();

        first.send(Ok(LogFrame::stdout("before\n"))).unwrap();
        assert_eq!(next(&mut handle).await, line("before\n"));

        drop(first);
        second.send(Ok(LogFrame::stdout("after\n"))).unwrap();
        assert_eq!(next(&mut handle).await, line("after\n"));

        let calls = engine.tail_calls();
        assert_eq!(calls.len(), 2);
        assert!(matches!(calls[1].1, LogCursor::Since(_)));
    }

    #[tokio::test]
    async fn test_engine_error_mid_stream_reconnects() {
        let engine = engine();
        let first = engine.push_log_feed("web");
        let second = engine.push_log_feed("web");
        let mut handle = tail(&engine).open("web", None).await.unwrap();

        first
            .send(Err(EngineError::Unavailable("connection reset".to_string())))
            .unwrap();
        second.send(Ok(LogFrame::stdout("back\n"))).unwrap();
        assert_eq!(next(&mut handle).await, line("back\n"));
    }

    #[tokio::test]
    async fn test_reconnect_resumes_before_last_frame() {
        let engine = engine();
        let first = engine.push_log_feed("web");
        let _second = engine.push_log_feed("web");
        let mut handle = LogTail::new(
            engine.clone(),
            LogTailConfig {
                reconnect_delay: Duration::from_millis(10),
                resume_overlap: Duration::from_secs(30),
                ..LogTailConfig::default()
            },
        )
        .open("web", None)
        .await
        .unwrap();

        first.send(Ok(LogFrame::stdout("tick\n"))).unwrap();
        assert_eq!(next(&mut handle).await, line("tick\n"));
        drop(first);

        tokio::time::timeout(Duration::from_secs(1), async {
            while engine.tail_calls().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let now = unix_now();
        match engine.tail_calls()[1].1 {
            LogCursor::Since(since) => assert!((now - 31..=now - 30).contains(&since)),
            other => panic!("expected a since cursor, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejected_stream_ends_without_retry() {
        let engine = engine();
        let feed = engine.push_log_feed("web");
        let _unused = engine.push_log_feed("web");
        let mut handle = tail(&engine).open("web", None).await.unwrap();

        feed.send(Ok(LogFrame::stdout("last\n"))).unwrap();
        feed.send(Err(EngineError::Rejected(
            "configured logging driver does not support reading".to_string(),
        )))
        .unwrap();

        assert_eq!(next(&mut handle).await, line("last\n"));
        assert_eq!(
            next(&mut handle).await,
            LogMessage::Ended(LogEnd::EngineFailed {
                message: "Engine rejected request: configured logging driver does not support reading"
                    .to_string()
            })
        );
        assert!(handle.recv().await.is_none());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.tail_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_reconnect_ends_stream() {
        let engine = engine();
        let first = engine.push_log_feed("web");
        engine.push_log_failure("web", EngineError::Rejected("no".to_string()));
        let mut handle = tail(&engine).open("web", None).await.unwrap();

        drop(first);
        assert!(matches!(
            next(&mut handle).await,
            LogMessage::Ended(LogEnd::EngineFailed { .. })
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.tail_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_stopped_container_ends_stream_without_retry() {
        let engine = engine();
        let feed = engine.push_log_feed("web");
        let mut handle = tail(&engine).open("web", None).await.unwrap();

        engine.set_status("web", ContainerStatus::Exited);
        drop(feed);

        assert_eq!(
            next(&mut handle).await,
            LogMessage::Ended(LogEnd::ContainerStopped {
                status: ContainerStatus::Exited
            })
        );
        assert!(handle.recv().await.is_none());
        assert_eq!(engine.tail_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_removed_container_ends_stream() {
        let engine = engine();
        let feed = engine.push_log_feed("web");
        let mut handle = tail(&engine).open("web", None).await.unwrap();

        engine.set_containers(Vec::new());
        drop(feed);

        assert_eq!(next(&mut handle).await, LogMessage::Ended(LogEnd::ContainerRemoved));
    }

    #[tokio::test]
    async fn test_outage_during_reconnect_keeps_retrying() {
        let engine = engine();
        let first = engine.push_log_feed("web");
        let second = engine.push_log_feed("web");
        let mut handle = tail(&engine).open("web", None).await.unwrap();

        engine.set_unavailable(true);
        drop(first);
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.set_unavailable(false);

        second.send(Ok(LogFrame::stdout("recovered\n"))).unwrap();
        assert_eq!(next(&mut handle).await, line("recovered\n"));
    }

    #[tokio::test]
    async fn test_close_tears_down_engine_connection() {
        let engine = engine();
        let feed = engine.push_log_feed("web");
        let mut handle = tail(&engine).open("web", None).await.unwrap();

        {
            let mut recv = task::spawn(handle.recv());
            assert_pending!(recv.poll());
        }

        feed.send(Ok(LogFrame::stdout("unread\n"))).unwrap();
        handle.close();
        handle.close();
        assert!(handle.recv().await.is_none());

        tokio::time::timeout(Duration::from_secs(1), feed.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_drop_tears_down_engine_connection() {
        let engine = engine();
        let feed = engine.push_log_feed("web");
        let handle = tail(&engine).open("web", None).await.unwrap();
        assert_eq!(handle.container_id(), "web");
        drop(handle);

        tokio::time::timeout(Duration::from_secs(1), feed.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_sends_closed_notice() {
        let engine = engine();
        let shutdown = CancellationToken::new();
        let mut handle = tail(&engine)
            .with_shutdown(shutdown.clone())
            .open("web", None)
            .await
            .unwrap();

        shutdown.cancel();
        assert_eq!(next(&mut handle).await, LogMessage::Ended(LogEnd::Closed));
    }

    #[test]
    fn test_end_notice_serialization() {
        let json = serde_json::to_value(LogEnd::ContainerStopped {
            status: ContainerStatus::Exited,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"reason": "container_stopped", "status": "exited"}));

        let json = serde_json::to_value(LogEnd::EngineFailed {
            message: "no".to_string(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"reason": "engine_failed", "message": "no"}));
    }
}

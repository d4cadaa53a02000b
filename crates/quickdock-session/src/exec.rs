//! Interactive exec sessions.
//!
//! Every session is an independent actor task that owns the engine exec handle
//! and its attached byte stream. The caller talks to it through an
//! [`ExecSession`] handle: keystrokes and resize commands travel on one ordered
//! input channel, so a resize is always applied before any data sent after it
//! reaches the process. Output travels back as raw bytes.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use futures::StreamExt;
use quickdock_core::{Engine, EngineError, ExecHandle, ExecIo, TermSize};
use serde::Serialize;
use tokio::{
    io::AsyncWriteExt,
    sync::{mpsc, watch},
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::SessionError;

/// Exec bridge configuration.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// Command started inside the container.
    pub command: Vec<String>,
    /// Queued inbound messages per session.
    pub input_buffer: usize,
    /// Queued outbound chunks per session.
    pub output_buffer: usize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            command: vec!["/bin/sh".to_string()],
            input_buffer: 64,
            output_buffer: 64,
        }
    }
}

/// Lifecycle of one exec session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Attached,
    Streaming,
    Closing,
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ExecEnd {
    /// The process inside the container exited.
    ProcessExited { exit_code: Option<i64> },
    /// The client went away.
    ClientDisconnected,
    /// The session was closed explicitly.
    Closed,
    /// The engine connection failed.
    EngineFailed { message: String },
}

/// Outbound message of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutput {
    Data(Bytes),
    /// Final notice; nothing follows it.
    Ended(ExecEnd),
}

enum SessionInput {
    Data(Bytes),
    Resize(TermSize),
}

/// Opens exec sessions against an engine.
#[derive(Clone)]
pub struct ExecBridge {
    engine: Arc<dyn Engine>,
    config: ExecConfig,
    shutdown: CancellationToken,
}

impl ExecBridge {
    #[must_use]
    pub fn new(engine: Arc<dyn Engine>, config: ExecConfig) -> Self {
        Self {
            engine,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Tie every session to `shutdown`; cancelling it closes them all.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Start a shell in `container_id` and attach to it.
    ///
    /// # Errors
    /// `ContainerNotFound`/`ContainerNotRunning` if the target cannot host a
    /// shell, `Unavailable` if the engine fails.
    pub async fn open(&self, container_id: &str, size: TermSize) -> Result<ExecSession, SessionError> {
        let status = self.engine.container_status(container_id).await?;
        if !status.is_running() {
            return Err(EngineError::ContainerNotRunning(container_id.to_string()).into());
        }

        let id = Uuid::new_v4();
        let (state_tx, state_rx) = watch::channel(SessionState::Created);
        let exec = self
            .engine
            .create_exec(container_id, &self.config.command, size)
            .await?;
        let io = self.engine.attach_exec(&exec).await?;
        state_tx.send_replace(SessionState::Attached);

        if let Err(e) = self.engine.resize_exec(&exec, size).await {
            tracing::debug!(session_id = %id, error = %e, "Initial resize failed");
        }

        let (input_tx, input_rx) = mpsc::channel(self.config.input_buffer.max(1));
        let (output_tx, output_rx) = mpsc::channel(self.config.output_buffer.max(1));
        let (size_tx, size_rx) = watch::channel(size);
        let (end_tx, end_rx) = watch::channel(None);
        let cancel = self.shutdown.child_token();

        tracing::info!(
            session_id = %id,
            container_id,
            exec_id = %exec.id,
            cols = size.cols,
            rows = size.rows,
            "Exec session opened"
        );

        let actor = SessionActor {
            id,
            engine: Arc::clone(&self.engine),
            exec,
            state: state_tx,
            size: size_tx,
            end: end_tx,
            input: input_rx,
            output: output_tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(actor.run(io));

        Ok(ExecSession {
            id,
            container_id: container_id.to_string(),
            input: input_tx,
            output: output_rx,
            state: state_rx,
            size: size_rx,
            end: end_rx,
            cancel,
            closed: false,
        })
    }
}

/// Caller side of an exec session.
///
/// Dropping the handle counts as a client disconnect.
pub struct ExecSession {
    id: Uuid,
    container_id: String,
    input: mpsc::Sender<SessionInput>,
    output: mpsc::Receiver<ExecOutput>,
    state: watch::Receiver<SessionState>,
    size: watch::Receiver<TermSize>,
    end: watch::Receiver<Option<ExecEnd>>,
    cancel: CancellationToken,
    closed: bool,
}

impl ExecSession {
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Terminal size last applied to the process.
    #[must_use]
    pub fn size(&self) -> TermSize {
        *self.size.borrow()
    }

    /// Forward bytes to the process's stdin.
    ///
    /// # Errors
    /// `AlreadyClosed` once the session has ended.
    pub async fn send(&self, data: impl Into<Bytes>) -> Result<(), SessionError> {
        self.push(SessionInput::Data(data.into())).await
    }

    /// Resize the terminal. Takes effect before any data sent afterwards.
    ///
    /// # Errors
    /// `AlreadyClosed` once the session has ended.
    pub async fn resize(&self, size: TermSize) -> Result<(), SessionError> {
        self.push(SessionInput::Resize(size)).await
    }

    async fn push(&self, input: SessionInput) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::AlreadyClosed);
        }
        push(&self.input, input).await
    }

    /// Input side of the session for a task that writes while another reads.
    #[must_use]
    pub fn writer(&self) -> ExecWriter {
        ExecWriter {
            input: self.input.clone(),
        }
    }

    /// Next output chunk or the final notice; `None` after close or once the
    /// final notice has been taken.
    pub async fn recv(&mut self) -> Option<ExecOutput> {
        if self.closed {
            return None;
        }
        self.output.recv().await
    }

    /// Close the session. Returns immediately; nothing is yielded afterwards
    /// even though engine teardown finishes in the background. Closing twice
    /// is a no-op.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.cancel.cancel();
        self.output.close();
    }

    /// End the session because the client went away. Same as dropping the
    /// handle, but keeps it around to observe teardown.
    pub fn disconnect(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.output.close();
    }

    /// How the session ended, once the actor has finished.
    #[must_use]
    pub fn end_reason(&self) -> Option<ExecEnd> {
        self.end.borrow().clone()
    }

    /// Wait until the actor has released the engine exec.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
    }
}

/// Cloneable input side of an [`ExecSession`].
///
/// Shares the session's ordered input channel, so resizes and data stay in
/// the order they were sent across the handle and every writer.
#[derive(Clone)]
pub struct ExecWriter {
    input: mpsc::Sender<SessionInput>,
}

impl ExecWriter {
    /// # Errors
    /// `AlreadyClosed` once the session has ended.
    pub async fn send(&self, data: impl Into<Bytes>) -> Result<(), SessionError> {
        push(&self.input, SessionInput::Data(data.into())).await
    }

    /// # Errors
    /// `AlreadyClosed` once the session has ended.
    pub async fn resize(&self, size: TermSize) -> Result<(), SessionError> {
        push(&self.input, SessionInput::Resize(size)).await
    }
}

async fn push(input: &mpsc::Sender<SessionInput>, msg: SessionInput) -> Result<(), SessionError> {
    input.send(msg).await.map_err(|_| SessionError::AlreadyClosed)
}

struct SessionActor {
    id: Uuid,
    engine: Arc<dyn Engine>,
    exec: ExecHandle,
    state: watch::Sender<SessionState>,
    size: watch::Sender<TermSize>,
    end: watch::Sender<Option<ExecEnd>>,
    input: mpsc::Receiver<SessionInput>,
    output: mpsc::Sender<ExecOutput>,
    cancel: CancellationToken,
}

impl SessionActor {
    async fn run(mut self, io: ExecIo) {
        let ExecIo {
            output: mut process_out,
            input: mut process_in,
        } = io;

        let end = loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break ExecEnd::Closed,
                () = self.output.closed() => break ExecEnd::ClientDisconnected,
                input = self.input.recv() => match input {
                    None => break ExecEnd::ClientDisconnected,
                    Some(SessionInput::Resize(size)) => self.apply_resize(size).await,
                    Some(SessionInput::Data(data)) => {
                        let written = async {
                            process_in.write_all(&data).await?;
                            process_in.flush().await
                        };
                        if let Err(e) = written.await {
                            break ExecEnd::EngineFailed { message: e.to_string() };
                        }
                        self.mark_streaming();
                    }
                },
                chunk = process_out.next() => match chunk {
                    Some(Ok(data)) => {
                        self.mark_streaming();
                        if self.output.send(ExecOutput::Data(data)).await.is_err() {
                            break ExecEnd::ClientDisconnected;
                        }
                    }
                    Some(Err(e)) => break ExecEnd::EngineFailed { message: e.to_string() },
                    None => break ExecEnd::ProcessExited { exit_code: self.exit_code().await },
                },
            }
        };

        self.state.send_replace(SessionState::Closing);
        self.input.close();
        // Dropping the attached stream closes stdin and the engine connection,
        // which ends the shell.
        drop(process_in);
        drop(process_out);

        tracing::info!(
            session_id = %self.id,
            container_id = %self.exec.container_id,
            exec_id = %self.exec.id,
            end = ?end,
            "Exec session ended"
        );

        // A handle closed by its owner has already shut the channel.
        self.end.send_replace(Some(end.clone()));
        if end != ExecEnd::ClientDisconnected {
            let _ = self.output.send(ExecOutput::Ended(end)).await;
        }
        self.state.send_replace(SessionState::Closed);
    }

    async fn apply_resize(&self, size: TermSize) {
        match self.engine.resize_exec(&self.exec, size).await {
            Ok(()) => {
                self.size.send_replace(size);
            }
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "Resize failed");
            }
        }
    }

    fn mark_streaming(&self) {
        self.state.send_if_modified(|s| {
            if *s == SessionState::Attached {
                *s = SessionState::Streaming;
                true
            } else {
                false
            }
        });
    }

    /// The engine may report the exec as running for a moment after its
    /// output closes.
    async fn exit_code(&self) -> Option<i64> {
        for _ in 0..5 {
            match self.engine.exec_exit_code(&self.exec).await {
                Ok(Some(code)) => return Some(code),
                Ok(None) => tokio::time::sleep(Duration::from_millis(50)).await,
                Err(e) => {
                    tracing::debug!(session_id = %self.id, error = %e, "Exit code unavailable");
                    return None;
                }
            }
        }
        None
    }
}

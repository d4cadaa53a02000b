//! Contracts for the external collaborators: the container engine and the
//! compose project runner.

use std::{path::Path, pin::Pin};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::io::AsyncWrite;

use crate::model::{
    ComposeAction, ContainerAction, ContainerStatus, ContainerView, EngineHealth, ExecHandle,
    LogCursor, LogFrame, TermSize,
};

/// Engine error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("Container engine unavailable: {0}")]
    Unavailable(String),
    #[error("Container not found: {0}")]
    ContainerNotFound(String),
    #[error("Container is not running: {0}")]
    ContainerNotRunning(String),
    #[error("Engine rejected request: {0}")]
    Rejected(String),
}

impl EngineError {
    /// Transient failures are worth retrying on the next tick or reconnect.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Raw output of an attached exec process.
pub type ByteStream = BoxStream<'static, Result<Bytes, EngineError>>;

/// Lazy, follow-mode sequence of log frames. Ends when the engine closes the
/// connection; it is not restartable.
pub type LogStream = BoxStream<'static, Result<LogFrame, EngineError>>;

/// Stdin writer of an attached exec process.
pub type ExecInput = Pin<Box<dyn AsyncWrite + Send>>;

/// Bidirectional byte stream attached to an exec process.
pub struct ExecIo {
    pub output: ByteStream,
    pub input: ExecInput,
}

/// Facade over the container engine.
///
/// Implementations are shared read-mostly by the hub and every session, so all
/// methods take `&self`.
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    /// Enumerate every container, running or not.
    async fn list_containers(&self) -> Result<Vec<ContainerView>, EngineError>;

    /// Current status of one container.
    async fn container_status(&self, container_id: &str) -> Result<ContainerStatus, EngineError>;

    /// Create an interactive TTY exec process inside a running container.
    async fn create_exec(
        &self,
        container_id: &str,
        command: &[String],
        size: TermSize,
    ) -> Result<ExecHandle, EngineError>;

    /// Start the exec process and attach to its stdin/stdout.
    async fn attach_exec(&self, exec: &ExecHandle) -> Result<ExecIo, EngineError>;

    /// Resize the pseudo-terminal of an exec process.
    async fn resize_exec(&self, exec: &ExecHandle, size: TermSize) -> Result<(), EngineError>;

    /// Exit code of a finished exec process, `None` while it is still running.
    async fn exec_exit_code(&self, exec: &ExecHandle) -> Result<Option<i64>, EngineError>;

    /// Open a follow-mode log connection.
    async fn tail_logs(&self, container_id: &str, cursor: LogCursor)
    -> Result<LogStream, EngineError>;

    /// Start, stop, restart or remove a container.
    async fn container_action(
        &self,
        container_id: &str,
        action: ContainerAction,
    ) -> Result<(), EngineError>;

    /// Ping the daemon and summarise it.
    async fn health(&self) -> Result<EngineHealth, EngineError>;
}

/// Compose runner error.
#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("Project '{0}' not found")]
    ProjectNotFound(String),
    #[error("No workdir for project '{0}'")]
    NoWorkingDir(String),
    #[error("Compose failed: {0}")]
    Failed(String),
    #[error("Failed to spawn compose: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("Compose timed out after {0}s")]
    Timeout(u64),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Runs compose lifecycle commands for a project.
#[async_trait]
pub trait ComposeRunner: Send + Sync + 'static {
    /// Run `action` for `project` from its working directory and return stdout.
    async fn run(
        &self,
        working_dir: &Path,
        project: &str,
        action: ComposeAction,
    ) -> Result<String, ComposeError>;
}

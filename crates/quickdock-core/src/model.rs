//! Snapshot data model shared by every quickdock crate.

use std::{collections::BTreeMap, fmt, path::PathBuf, str::FromStr, sync::Arc};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Group name used for containers without a compose project label.
///
/// Compose project names must start with a letter or digit, so this can never
/// collide with a real project.
pub const STANDALONE_PROJECT: &str = "_standalone";

/// Engine label carrying the compose project name.
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
/// Engine label carrying the compose service name.
pub const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";
/// Engine label carrying the compose project working directory.
pub const COMPOSE_WORKDIR_LABEL: &str = "com.docker.compose.project.working_dir";

/// Lifecycle state of a single container as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    #[serde(other)]
    Unknown,
}

impl ContainerStatus {
    /// Engine spelling of this status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        }
    }

    /// Parse the engine's state string. Unrecognised values map to `Unknown`.
    #[must_use]
    pub fn from_engine(state: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }

    /// Whether a log or exec consumer should expect the container to come back
    /// without outside intervention.
    #[must_use]
    pub const fn is_alive(self) -> bool {
        matches!(self, Self::Running | Self::Restarting)
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable view of one container, rebuilt every poll cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerView {
    /// Short (12 character) container id.
    pub id: String,
    pub full_id: String,
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    /// Raw engine status line, e.g. `Up 3 minutes`.
    pub state: String,
    /// Container port (`80/tcp`) to first published host port.
    pub ports: BTreeMap<String, String>,
    /// Compose project affiliation, taken from the engine label.
    pub project: Option<String>,
    pub service: Option<String>,
    pub working_dir: Option<PathBuf>,
}

impl ContainerView {
    /// Key used to group this container into a project.
    #[must_use]
    pub fn project_key(&self) -> &str {
        self.project
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(STANDALONE_PROJECT)
    }
}

/// Aggregate status of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Running,
    Restarting,
    Paused,
    Stopped,
}

impl ProjectStatus {
    /// Aggregate member statuses.
    ///
    /// Precedence is `running > restarting > paused > stopped`: the project takes
    /// the highest-ranked state present among its members, and every other
    /// member state (exited, created, dead, ...) counts as stopped. An empty
    /// project is stopped.
    #[must_use]
    pub fn aggregate<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = ContainerStatus>,
    {
        statuses
            .into_iter()
            .map(|s| match s {
                ContainerStatus::Running => Self::Running,
                ContainerStatus::Restarting => Self::Restarting,
                ContainerStatus::Paused => Self::Paused,
                _ => Self::Stopped,
            })
            .min_by_key(|s| s.rank())
            .unwrap_or(Self::Stopped)
    }

    const fn rank(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::Restarting => 1,
            Self::Paused => 2,
            Self::Stopped => 3,
        }
    }
}

/// A compose project (or the standalone group) and its members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectView {
    pub name: String,
    pub status: ProjectStatus,
    pub working_dir: Option<PathBuf>,
    pub containers: Vec<ContainerView>,
}

impl ProjectView {
    #[must_use]
    pub fn is_standalone(&self) -> bool {
        self.name == STANDALONE_PROJECT
    }
}

/// One consistent point-in-time view of every container, grouped by project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Tick sequence number, assigned by the hub. Zero for unsequenced builds.
    pub seq: u64,
    /// Unix epoch milliseconds at which the engine was queried.
    pub taken_at: i64,
    pub projects: Vec<ProjectView>,
}

/// Shared handle to a published snapshot.
pub type SharedSnapshot = Arc<StateSnapshot>;

impl StateSnapshot {
    /// Stamp a sequence number onto a freshly built snapshot.
    #[must_use]
    pub fn sequenced(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    #[must_use]
    pub fn project(&self, name: &str) -> Option<&ProjectView> {
        self.projects.iter().find(|p| p.name == name)
    }

    /// Iterate every container in project order.
    pub fn containers(&self) -> impl Iterator<Item = &ContainerView> {
        self.projects.iter().flat_map(|p| p.containers.iter())
    }
}

/// Terminal dimensions of an exec session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl TermSize {
    #[must_use]
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for TermSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

/// Engine-side handle to a created exec process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecHandle {
    pub id: String,
    pub container_id: String,
}

/// Which output stream of a container a log frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
    Console,
}

/// A single demultiplexed engine log frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFrame {
    pub source: LogSource,
    pub payload: Bytes,
}

impl LogFrame {
    #[must_use]
    pub fn stdout(payload: impl Into<Bytes>) -> Self {
        Self {
            source: LogSource::Stdout,
            payload: payload.into(),
        }
    }

    #[must_use]
    pub fn stderr(payload: impl Into<Bytes>) -> Self {
        Self {
            source: LogSource::Stderr,
            payload: payload.into(),
        }
    }
}

/// Where a log connection starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCursor {
    /// Last `n` lines, then follow.
    Tail(u32),
    /// Everything since the given unix timestamp (seconds), then follow.
    Since(i64),
}

/// Engine daemon summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineHealth {
    pub containers: i64,
    pub images: i64,
    pub server_version: String,
}

/// Lifecycle action on a single container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerAction {
    Start,
    Stop,
    Restart,
    Remove,
}

impl ContainerAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Remove => "remove",
        }
    }
}

impl FromStr for ContainerAction {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "restart" => Ok(Self::Restart),
            "remove" => Ok(Self::Remove),
            other => Err(UnknownAction(other.to_string())),
        }
    }
}

/// Compose project action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComposeAction {
    Up,
    Down,
    Restart,
}

impl ComposeAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Restart => "restart",
        }
    }
}

impl FromStr for ComposeAction {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            "restart" => Ok(Self::Restart),
            other => Err(UnknownAction(other.to_string())),
        }
    }
}

/// Action name that did not parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid action: {0}")]
pub struct UnknownAction(pub String);

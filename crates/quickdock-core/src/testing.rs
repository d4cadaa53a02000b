//! Scripted in-memory engine for tests.
//!
//! Exec sessions run a tiny echo "process": every chunk written to stdin is
//! echoed back prefixed with the terminal size the process sees at that moment,
//! e.g. `[120x40] ls\n`. Writing `exit\n` or closing stdin ends the process
//! with exit code 0.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::{
    io::{AsyncReadExt, DuplexStream},
    sync::mpsc,
};

use crate::{
    model::{
        ContainerAction, ContainerStatus, ContainerView, EngineHealth, ExecHandle, LogCursor,
        LogFrame, TermSize,
    },
    traits::{Engine, EngineError, ExecIo, LogStream},
};

/// Something the scripted exec process observed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    Resized(TermSize),
    Input(Bytes),
    Exited(i64),
}

struct ExecState {
    container_id: String,
    size: Arc<Mutex<TermSize>>,
    events: Arc<Mutex<Vec<ExecEvent>>>,
    exit_code: Arc<Mutex<Option<i64>>>,
}

#[derive(Default)]
struct State {
    containers: Vec<ContainerView>,
    unavailable: bool,
    list_calls: usize,
    next_exec: u64,
    execs: HashMap<String, ExecState>,
    log_feeds: HashMap<String, VecDeque<Result<LogStream, EngineError>>>,
    tail_calls: Vec<(String, LogCursor)>,
    actions: Vec<(String, ContainerAction)>,
}

/// In-memory engine whose behaviour is driven by the test.
#[derive(Default)]
pub struct ScriptedEngine {
    state: Mutex<State>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Build a container view with sensible defaults.
#[must_use]
pub fn container_view(id: &str, status: ContainerStatus, project: Option<&str>) -> ContainerView {
    ContainerView {
        id: id.to_string(),
        full_id: id.to_string(),
        name: format!("{id}-name"),
        image: "alpine:3".to_string(),
        status,
        state: status.to_string(),
        ports: BTreeMap::new(),
        project: project.map(str::to_string),
        service: None,
        working_dir: project.map(|p| format!("/srv/{p}").into()),
    }
}

impl ScriptedEngine {
    #[must_use]
    pub fn new(containers: Vec<ContainerView>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                containers,
                ..State::default()
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    pub fn set_containers(&self, containers: Vec<ContainerView>) {
        self.state().containers = containers;
    }

    /// Change the status of one container.
    pub fn set_status(&self, container_id: &str, status: ContainerStatus) {
        for c in &mut self.state().containers {
            if c.id == container_id {
                c.status = status;
                c.state = status.to_string();
            }
        }
    }

    /// Make every call fail with `Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    #[must_use]
    pub fn list_calls(&self) -> usize {
        self.state().list_calls
    }

    /// Queue a log connection for `container_id`; the returned sender feeds it.
    ///
    /// Dropping the sender ends the connection, as the engine does when it
    /// drops a follow stream.
    pub fn push_log_feed(&self, container_id: &str) -> mpsc::UnboundedSender<Result<LogFrame, EngineError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        self.state()
            .log_feeds
            .entry(container_id.to_string())
            .or_default()
            .push_back(Ok(stream));
        tx
    }

    /// Make the next `tail_logs` call for `container_id` fail with `err`.
    pub fn push_log_failure(&self, container_id: &str, err: EngineError) {
        self.state()
            .log_feeds
            .entry(container_id.to_string())
            .or_default()
            .push_back(Err(err));
    }

    /// Every `tail_logs` call made so far.
    #[must_use]
    pub fn tail_calls(&self) -> Vec<(String, LogCursor)> {
        self.state().tail_calls.clone()
    }

    #[must_use]
    pub fn actions(&self) -> Vec<(String, ContainerAction)> {
        self.state().actions.clone()
    }

    /// Handle of the most recently created exec process.
    #[must_use]
    pub fn last_exec(&self) -> Option<ExecHandle> {
        let state = self.state();
        let id = state.next_exec.checked_sub(1)?;
        let id = format!("exec-{id}");
        state.execs.get(&id).map(|e| ExecHandle {
            id,
            container_id: e.container_id.clone(),
        })
    }

    /// What the exec process has observed so far.
    #[must_use]
    pub fn exec_events(&self, exec: &ExecHandle) -> Vec<ExecEvent> {
        self.state()
            .execs
            .get(&exec.id)
            .map(|e| lock(&e.events).clone())
            .unwrap_or_default()
    }

    /// Number of exec processes that have not exited.
    #[must_use]
    pub fn live_execs(&self) -> usize {
        self.state()
            .execs
            .values()
            .filter(|e| lock(&e.exit_code).is_none())
            .count()
    }

    fn check_available(&self) -> Result<(), EngineError> {
        if self.state().unavailable {
            Err(EngineError::Unavailable("scripted outage".to_string()))
        } else {
            Ok(())
        }
    }

    fn status_of(&self, container_id: &str) -> Result<ContainerStatus, EngineError> {
        self.state()
            .containers
            .iter()
            .find(|c| c.id == container_id || c.full_id == container_id)
            .map(|c| c.status)
            .ok_or_else(|| EngineError::ContainerNotFound(container_id.to_string()))
    }
}

async fn echo_process(
    mut stdin: DuplexStream,
    stdout: mpsc::UnboundedSender<Result<Bytes, EngineError>>,
    size: Arc<Mutex<TermSize>>,
    events: Arc<Mutex<Vec<ExecEvent>>>,
    exit_code: Arc<Mutex<Option<i64>>>,
) {
    let mut buf = vec![0u8; 4096];
    loop {
        let n = match stdin.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let chunk = Bytes::copy_from_slice(&buf[..n]);
        lock(&events).push(ExecEvent::Input(chunk.clone()));
        if chunk.as_ref() == b"exit\n" {
            break;
        }
        let TermSize { cols, rows } = *lock(&size);
        let mut out = format!("[{cols}x{rows}] ").into_bytes();
        out.extend_from_slice(&chunk);
        if stdout.send(Ok(Bytes::from(out))).is_err() {
            break;
        }
    }
    lock(&events).push(ExecEvent::Exited(0));
    *lock(&exit_code) = Some(0);
}

#[async_trait]
impl Engine for ScriptedEngine {
    async fn list_containers(&self) -> Result<Vec<ContainerView>, EngineError> {
        self.check_available()?;
        let mut state = self.state();
        state.list_calls += 1;
        Ok(state.containers.clone())
    }

    async fn container_status(&self, container_id: &str) -> Result<ContainerStatus, EngineError> {
        self.check_available()?;
        self.status_of(container_id)
    }

    async fn create_exec(
        &self,
        container_id: &str,
        _command: &[String],
        size: TermSize,
    ) -> Result<ExecHandle, EngineError> {
        self.check_available()?;
        if !self.status_of(container_id)?.is_running() {
            return Err(EngineError::ContainerNotRunning(container_id.to_string()));
        }
        let mut state = self.state();
        let id = format!("exec-{}", state.next_exec);
        state.next_exec += 1;
        state.execs.insert(
            id.clone(),
            ExecState {
                container_id: container_id.to_string(),
                size: Arc::new(Mutex::new(size)),
                events: Arc::new(Mutex::new(Vec::new())),
                exit_code: Arc::new(Mutex::new(None)),
            },
        );
        Ok(ExecHandle {
            id,
            container_id: container_id.to_string(),
        })
    }

    async fn attach_exec(&self, exec: &ExecHandle) -> Result<ExecIo, EngineError> {
        self.check_available()?;
        let (size, events, exit_code) = {
            let state = self.state();
            let e = state
                .execs
                .get(&exec.id)
                .ok_or_else(|| EngineError::Rejected(format!("no such exec {}", exec.id)))?;
            (
                Arc::clone(&e.size),
                Arc::clone(&e.events),
                Arc::clone(&e.exit_code),
            )
        };

        let (client_side, process_side) = tokio::io::duplex(4096);
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        tokio::spawn(echo_process(process_side, stdout_tx, size, events, exit_code));

        let output = futures::stream::unfold(stdout_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();

        Ok(ExecIo {
            output,
            input: Box::pin(client_side),
        })
    }

    async fn resize_exec(&self, exec: &ExecHandle, size: TermSize) -> Result<(), EngineError> {
        self.check_available()?;
        let state = self.state();
        let e = state
            .execs
            .get(&exec.id)
            .ok_or_else(|| EngineError::Rejected(format!("no such exec {}", exec.id)))?;
        *lock(&e.size) = size;
        lock(&e.events).push(ExecEvent::Resized(size));
        Ok(())
    }

    async fn exec_exit_code(&self, exec: &ExecHandle) -> Result<Option<i64>, EngineError> {
        Ok(self
            .state()
            .execs
            .get(&exec.id)
            .and_then(|e| *lock(&e.exit_code)))
    }

    async fn tail_logs(
        &self,
        container_id: &str,
        cursor: LogCursor,
    ) -> Result<LogStream, EngineError> {
        self.check_available()?;
        self.status_of(container_id)?;
        let mut state = self.state();
        state.tail_calls.push((container_id.to_string(), cursor));
        state
            .log_feeds
            .get_mut(container_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(futures::stream::pending().boxed()))
    }

    async fn container_action(
        &self,
        container_id: &str,
        action: ContainerAction,
    ) -> Result<(), EngineError> {
        self.check_available()?;
        self.status_of(container_id)?;
        match action {
            ContainerAction::Start | ContainerAction::Restart => {
                self.set_status(container_id, ContainerStatus::Running);
            }
            ContainerAction::Stop => self.set_status(container_id, ContainerStatus::Exited),
            ContainerAction::Remove => self
                .state()
                .containers
                .retain(|c| c.id != container_id && c.full_id != container_id),
        }
        self.state()
            .actions
            .push((container_id.to_string(), action));
        Ok(())
    }

    async fn health(&self) -> Result<EngineHealth, EngineError> {
        self.check_available()?;
        let containers = i64::try_from(self.state().containers.len()).unwrap_or(i64::MAX);
        Ok(EngineHealth {
            containers,
            images: 1,
            server_version: "scripted".to_string(),
        })
    }
}

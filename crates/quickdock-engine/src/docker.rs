//! `Engine` implementation over the Docker Engine API.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bollard::{
    Docker,
    container::{
        InspectContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
        RemoveContainerOptions, RestartContainerOptions, StartContainerOptions,
        StopContainerOptions,
    },
    errors::Error as BollardError,
    exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults},
    models::{ContainerStateStatusEnum, ContainerSummary, Port, PortTypeEnum},
};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use quickdock_core::{
    ContainerAction, ContainerStatus, ContainerView, Engine, EngineError, EngineHealth,
    ExecHandle, ExecIo, LogCursor, LogFrame, LogSource, LogStream, TermSize,
    model::{COMPOSE_PROJECT_LABEL, COMPOSE_SERVICE_LABEL, COMPOSE_WORKDIR_LABEL},
};

/// Docker Engine client.
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect using `DOCKER_HOST` or the platform default socket.
    ///
    /// # Errors
    /// Returns `Unavailable` if the client cannot be configured.
    pub fn connect() -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    #[must_use]
    pub const fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

/// Classify a bollard error against the container it concerned.
fn map_error(err: BollardError, container_id: &str) -> EngineError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => EngineError::ContainerNotFound(container_id.to_string()),
        BollardError::DockerResponseServerError {
            status_code: 409,
            message,
        } if message.contains("not running") || message.contains("is paused") => {
            EngineError::ContainerNotRunning(container_id.to_string())
        }
        // Unsupported on this daemon, e.g. a log driver without read support.
        BollardError::DockerResponseServerError {
            status_code: 501,
            message,
        } => EngineError::Rejected(message),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } if status_code >= 500 => EngineError::Unavailable(message),
        BollardError::DockerResponseServerError { message, .. } => EngineError::Rejected(message),
        other => EngineError::Unavailable(other.to_string()),
    }
}

fn status_from_enum(status: Option<ContainerStateStatusEnum>) -> ContainerStatus {
    match status {
        Some(ContainerStateStatusEnum::CREATED) => ContainerStatus::Created,
        Some(ContainerStateStatusEnum::RUNNING) => ContainerStatus::Running,
        Some(ContainerStateStatusEnum::PAUSED) => ContainerStatus::Paused,
        Some(ContainerStateStatusEnum::RESTARTING) => ContainerStatus::Restarting,
        Some(ContainerStateStatusEnum::REMOVING) => ContainerStatus::Removing,
        Some(ContainerStateStatusEnum::EXITED) => ContainerStatus::Exited,
        Some(ContainerStateStatusEnum::DEAD) => ContainerStatus::Dead,
        _ => ContainerStatus::Unknown,
    }
}

fn port_key(port: &Port) -> String {
    let proto = match port.typ {
        Some(PortTypeEnum::UDP) => "udp",
        Some(PortTypeEnum::SCTP) => "sctp",
        _ => "tcp",
    };
    format!("{}/{proto}", port.private_port)
}

/// Map published ports, keeping the first binding of each container port.
fn published_ports(ports: &[Port]) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for port in ports {
        if let Some(public) = port.public_port {
            map.entry(port_key(port)).or_insert_with(|| public.to_string());
        }
    }
    map
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.is_empty()).cloned()
}

/// Normalise a container list entry.
fn container_from_summary(summary: ContainerSummary) -> ContainerView {
    let full_id = summary.id.unwrap_or_default();
    let labels = summary.labels.unwrap_or_default();
    let name = summary
        .names
        .and_then(|names| names.into_iter().next())
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_default();
    let status = ContainerStatus::from_engine(summary.state.as_deref().unwrap_or_default());

    ContainerView {
        id: full_id.chars().take(12).collect(),
        name,
        image: summary.image.unwrap_or_default(),
        status,
        state: summary.status.unwrap_or_else(|| status.to_string()),
        ports: published_ports(summary.ports.as_deref().unwrap_or_default()),
        project: non_empty(labels.get(COMPOSE_PROJECT_LABEL)),
        service: non_empty(labels.get(COMPOSE_SERVICE_LABEL)),
        working_dir: non_empty(labels.get(COMPOSE_WORKDIR_LABEL)).map(Into::into),
        full_id,
    }
}

fn frame_from_output(output: LogOutput) -> LogFrame {
    match output {
        LogOutput::StdErr { message } => LogFrame {
            source: LogSource::Stderr,
            payload: message,
        },
        LogOutput::StdOut { message } | LogOutput::StdIn { message } => LogFrame {
            source: LogSource::Stdout,
            payload: message,
        },
        LogOutput::Console { message } => LogFrame {
            source: LogSource::Console,
            payload: message,
        },
    }
}

fn output_bytes(output: LogOutput) -> Bytes {
    match output {
        LogOutput::StdErr { message }
        | LogOutput::StdOut { message }
        | LogOutput::StdIn { message }
        | LogOutput::Console { message } => message,
    }
}

#[async_trait]
impl Engine for DockerEngine {
    async fn list_containers(&self) -> Result<Vec<ContainerView>, EngineError> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        Ok(summaries.into_iter().map(container_from_summary).collect())
    }

    async fn container_status(&self, container_id: &str) -> Result<ContainerStatus, EngineError> {
        let inspect = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_error(e, container_id))?;
        Ok(status_from_enum(inspect.state.and_then(|s| s.status)))
    }

    async fn create_exec(
        &self,
        container_id: &str,
        command: &[String],
        size: TermSize,
    ) -> Result<ExecHandle, EngineError> {
        let options = CreateExecOptions::<String> {
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(true),
            cmd: Some(command.to_vec()),
            env: Some(vec![
                "TERM=xterm-256color".to_string(),
                format!("COLUMNS={}", size.cols),
                format!("LINES={}", size.rows),
            ]),
            ..Default::default()
        };
        let created = self
            .docker
            .create_exec(container_id, options)
            .await
            .map_err(|e| map_error(e, container_id))?;
        Ok(ExecHandle {
            id: created.id,
            container_id: container_id.to_string(),
        })
    }

    async fn attach_exec(&self, exec: &ExecHandle) -> Result<ExecIo, EngineError> {
        let options = StartExecOptions {
            detach: false,
            tty: true,
            ..Default::default()
        };
        let started = self
            .docker
            .start_exec(&exec.id, Some(options))
            .await
            .map_err(|e| map_error(e, &exec.container_id))?;

        match started {
            StartExecResults::Attached { output, input } => {
                let output = output
                    .map_ok(output_bytes)
                    .map_err(|e| EngineError::Unavailable(e.to_string()))
                    .boxed();
                Ok(ExecIo { output, input })
            }
            StartExecResults::Detached => Err(EngineError::Rejected(format!(
                "exec {} started detached",
                exec.id
            ))),
        }
    }

    async fn resize_exec(&self, exec: &ExecHandle, size: TermSize) -> Result<(), EngineError> {
        self.docker
            .resize_exec(
                &exec.id,
                ResizeExecOptions {
                    height: size.rows,
                    width: size.cols,
                },
            )
            .await
            .map_err(|e| map_error(e, &exec.container_id))
    }

    async fn exec_exit_code(&self, exec: &ExecHandle) -> Result<Option<i64>, EngineError> {
        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| map_error(e, &exec.container_id))?;
        if inspect.running.unwrap_or(false) {
            return Ok(None);
        }
        Ok(inspect.exit_code)
    }

    async fn tail_logs(
        &self,
        container_id: &str,
        cursor: LogCursor,
    ) -> Result<LogStream, EngineError> {
        // The log endpoint only reports a missing container lazily.
        self.container_status(container_id).await?;

        let options = match cursor {
            LogCursor::Tail(lines) => LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                tail: lines.to_string(),
                ..Default::default()
            },
            LogCursor::Since(since) => LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                since,
                tail: "all".to_string(),
                ..Default::default()
            },
        };

        let id = container_id.to_string();
        let stream = self
            .docker
            .logs(container_id, Some(options))
            .map_ok(frame_from_output)
            .map_err(move |e| map_error(e, &id))
            .boxed();
        Ok(stream)
    }

    async fn container_action(
        &self,
        container_id: &str,
        action: ContainerAction,
    ) -> Result<(), EngineError> {
        // Stop and restart give the process a 10 s grace period.
        let result = match action {
            ContainerAction::Start => {
                self.docker
                    .start_container(container_id, None::<StartContainerOptions<String>>)
                    .await
            }
            ContainerAction::Stop => {
                self.docker
                    .stop_container(
                        container_id,
                        Some(StopContainerOptions { t: 10 }),
                    )
                    .await
            }
            ContainerAction::Restart => {
                self.docker
                    .restart_container(
                        container_id,
                        Some(RestartContainerOptions { t: 10 }),
                    )
                    .await
            }
            ContainerAction::Remove => {
                self.docker
                    .remove_container(
                        container_id,
                        Some(RemoveContainerOptions {
                            force: true,
                            ..Default::default()
                        }),
                    )
                    .await
            }
        };
        result.map_err(|e| map_error(e, container_id))?;
        tracing::info!(container_id, action = action.as_str(), "Container action applied");
        Ok(())
    }

    async fn health(&self) -> Result<EngineHealth, EngineError> {
        self.docker
            .ping()
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        let info = self
            .docker
            .info()
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        Ok(EngineHealth {
            containers: info.containers.unwrap_or(0),
            images: info.images.unwrap_or(0),
            server_version: info.server_version.unwrap_or_else(|| "unknown".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn port(private: u16, public: Option<u16>, typ: PortTypeEnum) -> Port {
        Port {
            ip: Some("0.0.0.0".to_string()),
            private_port: private,
            public_port: public,
            typ: Some(typ),
        }
    }

    #[test]
    fn test_summary_is_normalised() {
        let labels = HashMap::from([
            (COMPOSE_PROJECT_LABEL.to_string(), "shop".to_string()),
            (COMPOSE_SERVICE_LABEL.to_string(), "web".to_string()),
            (COMPOSE_WORKDIR_LABEL.to_string(), "/srv/shop".to_string()),
        ]);
        let summary = ContainerSummary {
            id: Some("0123456789abcdef0123".to_string()),
            names: Some(vec!["/shop-web-1".to_string()]),
            image: Some("nginx:1.27".to_string()),
            state: Some("running".to_string()),
            status: Some("Up 3 minutes".to_string()),
            labels: Some(labels),
            ports: Some(vec![port(80, Some(8080), PortTypeEnum::TCP)]),
            ..Default::default()
        };

        let view = container_from_summary(summary);
        assert_eq!(view.id, "0123456789ab");
        assert_eq!(view.full_id, "0123456789abcdef0123");
        assert_eq!(view.name, "shop-web-1");
        assert_eq!(view.status, ContainerStatus::Running);
        assert_eq!(view.state, "Up 3 minutes");
        assert_eq!(view.project.as_deref(), Some("shop"));
        assert_eq!(view.service.as_deref(), Some("web"));
        assert_eq!(view.project_key(), "shop");
        assert_eq!(view.ports.get("80/tcp").map(String::as_str), Some("8080"));
    }

    #[test]
    fn test_unlabelled_container_has_no_project() {
        let summary = ContainerSummary {
            id: Some("abc".to_string()),
            state: Some("exited".to_string()),
            labels: Some(HashMap::from([(
                COMPOSE_PROJECT_LABEL.to_string(),
                String::new(),
            )])),
            ..Default::default()
        };
        let view = container_from_summary(summary);
        assert_eq!(view.project, None);
        assert_eq!(view.status, ContainerStatus::Exited);
        assert_eq!(view.state, "exited");
    }

    #[test]
    fn test_ports_keep_first_binding_and_skip_unpublished() {
        let ports = [
            port(80, Some(8080), PortTypeEnum::TCP),
            port(80, Some(9090), PortTypeEnum::TCP),
            port(53, Some(5353), PortTypeEnum::UDP),
            port(443, None, PortTypeEnum::TCP),
        ];
        let map = published_ports(&ports);
        assert_eq!(map.len(), 2);
        assert_eq!(map["80/tcp"], "8080");
        assert_eq!(map["53/udp"], "5353");
    }

    #[test]
    fn test_error_classification() {
        let not_found = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container".to_string(),
        };
        assert_eq!(
            map_error(not_found, "c1"),
            EngineError::ContainerNotFound("c1".to_string())
        );

        let not_running = BollardError::DockerResponseServerError {
            status_code: 409,
            message: "Container c1 is not running".to_string(),
        };
        assert_eq!(
            map_error(not_running, "c1"),
            EngineError::ContainerNotRunning("c1".to_string())
        );

        let daemon = BollardError::DockerResponseServerError {
            status_code: 500,
            message: "boom".to_string(),
        };
        assert!(map_error(daemon, "c1").is_transient());

        let conflict = BollardError::DockerResponseServerError {
            status_code: 409,
            message: "name in use".to_string(),
        };
        assert!(matches!(map_error(conflict, "c1"), EngineError::Rejected(_)));

        let unreadable_logs = BollardError::DockerResponseServerError {
            status_code: 501,
            message: "configured logging driver does not support reading".to_string(),
        };
        let err = map_error(unreadable_logs, "c1");
        assert!(matches!(err, EngineError::Rejected(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_log_output_sources() {
        let frame = frame_from_output(LogOutput::StdErr {
            message: Bytes::from_static(b"\x1b[31merr\x1b[0m\n"),
        });
        assert_eq!(frame.source, LogSource::Stderr);
        assert_eq!(frame.payload.as_ref(), b"\x1b[31merr\x1b[0m\n");
    }
}

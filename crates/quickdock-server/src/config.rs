//! Command line and environment configuration.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use clap::Parser;
use quickdock_engine::ComposeConfig;
use quickdock_session::{ExecConfig, HubConfig, LogTailConfig};

#[derive(Debug, Parser)]
#[command(name = "quickdock")]
#[command(about = "Live Docker state, container terminals and log tails over HTTP")]
pub struct Config {
    /// Address to bind to
    #[arg(short = 'b', long, env = "QUICKDOCK_HOST", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub host: IpAddr,

    /// Port for the web server
    #[arg(short, long, env = "QUICKDOCK_PORT", default_value_t = 8000)]
    pub port: u16,

    /// How often the container state is polled
    #[arg(
        long,
        env = "QUICKDOCK_POLL_INTERVAL_MS",
        default_value_t = 2000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub poll_interval_ms: u64,

    /// Snapshots queued per events client before it is dropped
    #[arg(
        long,
        env = "QUICKDOCK_SUBSCRIBER_BUFFER",
        default_value_t = 8,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub subscriber_buffer: u16,

    /// Lines of history replayed when a log stream opens
    #[arg(long, env = "QUICKDOCK_LOG_BACKLOG", default_value_t = 200)]
    pub log_backlog: u32,

    /// Pause before re-opening a dropped log connection
    #[arg(long, env = "QUICKDOCK_LOG_RECONNECT_DELAY_MS", default_value_t = 1000)]
    pub log_reconnect_delay_ms: u64,

    /// Shell started by exec sessions
    #[arg(long, env = "QUICKDOCK_EXEC_SHELL", default_value = "/bin/sh")]
    pub exec_shell: String,

    /// Compose command line
    #[arg(long, env = "QUICKDOCK_COMPOSE_COMMAND", default_value = "docker compose")]
    pub compose_command: String,

    /// Upper bound on a compose invocation
    #[arg(long, env = "QUICKDOCK_COMPOSE_TIMEOUT_SECS", default_value_t = 120)]
    pub compose_timeout_secs: u64,

    /// Static frontend served for every non-API path
    #[arg(long, env = "QUICKDOCK_FRONTEND_DIR")]
    pub frontend_dir: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `quickdock_session=trace` (overrides `RUST_LOG`)
    #[arg(long, env = "QUICKDOCK_LOG_LEVEL")]
    pub log_level: Option<String>,
}

impl Config {
    pub const fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn hub(&self) -> HubConfig {
        HubConfig {
            interval: Duration::from_millis(self.poll_interval_ms),
            subscriber_buffer: usize::from(self.subscriber_buffer),
        }
    }

    pub fn exec(&self) -> ExecConfig {
        ExecConfig {
            command: vec![self.exec_shell.clone()],
            ..ExecConfig::default()
        }
    }

    pub fn logs(&self) -> LogTailConfig {
        LogTailConfig {
            backlog: self.log_backlog,
            reconnect_delay: Duration::from_millis(self.log_reconnect_delay_ms),
            ..LogTailConfig::default()
        }
    }

    pub fn compose(&self) -> ComposeConfig {
        ComposeConfig {
            command: self.compose_command.clone(),
            timeout: Duration::from_secs(self.compose_timeout_secs),
        }
    }
}

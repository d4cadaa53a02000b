//! Compose project lifecycle via the `docker compose` CLI.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use quickdock_core::{ComposeAction, ComposeError, ComposeRunner};
use tokio::process::Command;

use crate::resolve::resolve_executable_path;

/// Compose runner configuration.
#[derive(Debug, Clone)]
pub struct ComposeConfig {
    /// Base command line, split with shell quoting rules.
    pub command: String,
    /// Upper bound on a single compose invocation.
    pub timeout: Duration,
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            command: "docker compose".to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Parsed command parts (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Resolve the program to an absolute path.
    ///
    /// # Errors
    /// Returns error if executable not found.
    pub async fn into_resolved(self) -> Result<(PathBuf, Vec<String>), ComposeError> {
        let Self { program, args } = self;
        let executable = resolve_executable_path(&program).await.ok_or_else(|| {
            ComposeError::Spawn(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Executable not found: {program}"),
            ))
        })?;
        Ok((executable, args))
    }
}

/// Builder for compose command lines.
#[derive(Debug, Clone)]
pub struct ComposeCommand {
    base: String,
}

impl ComposeCommand {
    #[must_use]
    pub fn new<S: Into<String>>(base: S) -> Self {
        Self { base: base.into() }
    }

    /// Build `<base> -p <project> <action> [-d]`.
    ///
    /// # Errors
    /// Returns error if the base command cannot be parsed or is empty.
    pub fn build(&self, project: &str, action: ComposeAction) -> Result<CommandParts, ComposeError> {
        let mut parts = shlex::split(&self.base)
            .ok_or_else(|| ComposeError::Failed(format!("Base command cannot be parsed: {}", self.base)))?;
        if parts.is_empty() {
            return Err(ComposeError::Failed("Base command is empty".to_string()));
        }
        parts.extend(["-p".to_string(), project.to_string(), action.as_str().to_string()]);
        if action == ComposeAction::Up {
            parts.push("-d".to_string());
        }

        let program = parts.remove(0);
        Ok(CommandParts {
            program,
            args: parts,
        })
    }
}

/// `ComposeRunner` that spawns the compose CLI in the project working dir.
#[derive(Debug, Clone)]
pub struct ComposeCli {
    command: ComposeCommand,
    timeout: Duration,
}

impl ComposeCli {
    #[must_use]
    pub fn new(config: ComposeConfig) -> Self {
        Self {
            command: ComposeCommand::new(config.command),
            timeout: config.timeout,
        }
    }
}

impl Default for ComposeCli {
    fn default() -> Self {
        Self::new(ComposeConfig::default())
    }
}

#[async_trait]
impl ComposeRunner for ComposeCli {
    async fn run(
        &self,
        working_dir: &Path,
        project: &str,
        action: ComposeAction,
    ) -> Result<String, ComposeError> {
        let (program, args) = self.command.build(project, action)?.into_resolved().await?;

        tracing::info!(
            project,
            action = action.as_str(),
            working_dir = %working_dir.display(),
            "Running compose"
        );

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| ComposeError::Timeout(self.timeout.as_secs()))??;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            tracing::warn!(project, action = action.as_str(), %stderr, "Compose failed");
            return Err(ComposeError::Failed(if stderr.is_empty() { stdout } else { stderr }));
        }
        Ok(stdout)
    }
}

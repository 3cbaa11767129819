//! relaydock Executor
//!
//! Executes the actions a remote agent delegates to the local host (shell
//! commands and file operations) and packages each outcome as an
//! [`Observation`] correlated to the action that caused it.
//!
//! `execute` never fails: validation and I/O errors become a failure
//! observation, so every action yields exactly one observation.

pub mod shell;

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use relaydock_protocol::{ActionKind, DelegatedAction, Observation};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur while performing a delegated action.
///
/// Never leaves the executor; it is rendered into the observation content.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("{action}: Missing {argument} argument.")]
    MissingArgument {
        action: &'static str,
        argument: &'static str,
    },

    #[error("Failed to {operation} '{path}': {source}")]
    FileSystem {
        operation: &'static str,
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to spawn shell: {0}")]
    Spawn(#[source] io::Error),

    #[error("Unsupported action type: {0}")]
    Unsupported(String),

    #[error("action queue full")]
    QueueFull,

    #[error("action worker stopped")]
    WorkerStopped,
}

/// Executor settings
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Where commands run and relative paths resolve
    pub working_dir: PathBuf,
    /// Commands still running after this are killed
    pub command_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
            command_timeout: Duration::from_secs(30),
        }
    }
}

/// Successful outcome, before it is turned into an observation
struct Completed {
    content: String,
    extras: Map<String, Value>,
    message: String,
}

/// Runs delegated actions against the local filesystem and shell.
///
/// Holds no per-action state, so independent actions may run concurrently.
#[derive(Debug, Clone, Default)]
pub struct ActionExecutor {
    config: ExecutorConfig,
}

impl ActionExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute one action and return its observation.
    pub async fn execute(&self, action: &DelegatedAction) -> Observation {
        info!(
            component = "executor",
            event = "executor.action.received",
            action = %action.action,
            cause = %action.id,
            "Received delegated action"
        );

        match self.perform(action).await {
            Ok(done) => {
                info!(
                    component = "executor",
                    event = "executor.action.completed",
                    action = %action.action,
                    cause = %action.id,
                    summary = %done.message,
                );
                Observation::new(
                    action.id.clone(),
                    action.action.clone(),
                    done.content,
                    done.extras,
                    done.message,
                )
            }
            Err(err) => {
                warn!(
                    component = "executor",
                    event = "executor.action.failed",
                    action = %action.action,
                    cause = %action.id,
                    error = %err,
                    "Delegated action failed"
                );
                failure_observation(action, &err)
            }
        }
    }

    async fn perform(&self, action: &DelegatedAction) -> Result<Completed, ExecutionError> {
        match action.kind() {
            Some(ActionKind::Run) => self.run(action).await,
            Some(ActionKind::Read) => self.read(action).await,
            Some(ActionKind::Write) => self.write(action).await,
            Some(ActionKind::Mkdir) => self.mkdir(action).await,
            Some(ActionKind::Rmdir) => self.rmdir(action).await,
            Some(ActionKind::Rm) => self.rm(action).await,
            Some(ActionKind::RunIpython | ActionKind::Browse) | None => {
                Err(ExecutionError::Unsupported(action.action.clone()))
            }
        }
    }

    async fn run(&self, action: &DelegatedAction) -> Result<Completed, ExecutionError> {
        let command = action
            .arg_str("command")
            .filter(|c| !c.trim().is_empty())
            .ok_or(ExecutionError::MissingArgument {
                action: "CmdRunAction",
                argument: "command",
            })?;

        debug!(
            component = "executor",
            event = "executor.run.start",
            command = %command,
            cwd = %self.config.working_dir.display(),
        );

        let result = shell::execute(
            command,
            &self.config.working_dir,
            self.config.command_timeout,
        )
        .await
        .map_err(ExecutionError::Spawn)?;

        let message = if result.timed_out {
            format!("Command '{command}' timed out. Exit code: {}", result.exit_code)
        } else {
            format!("Command '{command}' executed. Exit code: {}", result.exit_code)
        };

        Ok(Completed {
            content: result.combined_output(),
            extras: extras([
                ("command", json!(command)),
                ("exit_code", json!(result.exit_code)),
            ]),
            message,
        })
    }

    async fn read(&self, action: &DelegatedAction) -> Result<Completed, ExecutionError> {
        let raw = required_path(action, "FileReadAction")?;
        let path = self.resolve(raw);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| fs_error("read file", &path, source))?;

        Ok(Completed {
            content: String::from_utf8_lossy(&bytes).into_owned(),
            extras: extras([("path", json!(raw))]),
            message: format!("File '{raw}' read successfully."),
        })
    }

    async fn write(&self, action: &DelegatedAction) -> Result<Completed, ExecutionError> {
        let missing = ExecutionError::MissingArgument {
            action: "FileWriteAction",
            argument: "path or content",
        };
        let (Some(raw), Some(content)) = (
            action.arg_str("path").filter(|p| !p.is_empty()),
            action.arg_str("content"),
        ) else {
            return Err(missing);
        };

        let path = self.resolve(raw);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| fs_error("write file", &path, source))?;
        }
        tokio::fs::write(&path, content.as_bytes())
            .await
            .map_err(|source| fs_error("write file", &path, source))?;

        let message = format!("File '{raw}' written successfully.");
        Ok(Completed {
            content: message.clone(),
            extras: extras([("path", json!(raw))]),
            message,
        })
    }

    async fn mkdir(&self, action: &DelegatedAction) -> Result<Completed, ExecutionError> {
        let raw = required_path(action, "MkdirAction")?;
        let path = self.resolve(raw);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|source| fs_error("create directory", &path, source))?;
        Ok(path_completed(raw, format!("Directory '{raw}' created successfully.")))
    }

    async fn rmdir(&self, action: &DelegatedAction) -> Result<Completed, ExecutionError> {
        let raw = required_path(action, "RmdirAction")?;
        let path = self.resolve(raw);
        tokio::fs::remove_dir(&path)
            .await
            .map_err(|source| fs_error("remove directory", &path, source))?;
        Ok(path_completed(raw, format!("Directory '{raw}' removed successfully.")))
    }

    async fn rm(&self, action: &DelegatedAction) -> Result<Completed, ExecutionError> {
        let raw = required_path(action, "RmAction")?;
        let path = self.resolve(raw);
        tokio::fs::remove_file(&path)
            .await
            .map_err(|source| fs_error("remove file", &path, source))?;
        Ok(path_completed(raw, format!("File '{raw}' removed successfully.")))
    }

    fn resolve(&self, raw: &str) -> PathBuf {
        let path = Path::new(raw);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config.working_dir.join(path)
        }
    }
}

/// Failure observation answering `action`.
pub fn failure_observation(action: &DelegatedAction, err: &ExecutionError) -> Observation {
    Observation::new(
        action.id.clone(),
        action.action.clone(),
        format!("Error executing action '{}': {}", action.action, err),
        action.args.clone(),
        format!("Failed to execute {}.", action.action),
    )
}

fn required_path<'a>(
    action: &'a DelegatedAction,
    name: &'static str,
) -> Result<&'a str, ExecutionError> {
    action
        .arg_str("path")
        .filter(|p| !p.is_empty())
        .ok_or(ExecutionError::MissingArgument {
            action: name,
            argument: "path",
        })
}

fn fs_error(operation: &'static str, path: &Path, source: io::Error) -> ExecutionError {
    ExecutionError::FileSystem {
        operation,
        path: path.display().to_string(),
        source,
    }
}

fn path_completed(raw: &str, message: String) -> Completed {
    Completed {
        content: message.clone(),
        extras: extras([("path", json!(raw))]),
        message,
    }
}

fn extras<const N: usize>(pairs: [(&str, Value); N]) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

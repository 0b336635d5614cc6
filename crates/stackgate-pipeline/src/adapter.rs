//! Stage tool adapters.
//!
//! Each pipeline stage calls out to a pluggable [`ToolAdapter`]. The
//! production adapter runs the configured command as a subprocess with a
//! bounded wall-clock timeout; tests substitute scripted adapters.

use std::io::Write;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;

use stackgate_core::domain::{ExecutionError, Stage};
use stackgate_state::{RunId, StackId};

/// Result of one tool invocation.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Exit code (0 = success).
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,
}

impl ExecutionOutcome {
    /// Whether the tool itself reported success.
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// An input artifact materialized for the tool (e.g. the plan preview
/// consumed by Apply).
#[derive(Debug, Clone)]
pub struct InputArtifact {
    /// Name of the producing stage
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Everything an adapter gets to see for one invocation.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub run_id: RunId,
    pub stack_id: StackId,
    pub stage: Stage,
    /// 1-based attempt counter, part of the correlation identifier
    pub attempt: u32,
    pub revision: String,
    pub inputs: Vec<InputArtifact>,
}

/// A pluggable stage tool.
///
/// Adapters are supplied by configuration, not by the core: the engine only
/// depends on this contract.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    async fn run(&self, ctx: &AdapterContext) -> Result<ExecutionOutcome, ExecutionError>;
}

/// Runs the configured argv as an isolated subprocess.
///
/// Input artifacts are written to a private temp directory and exposed via
/// `STACKGATE_INPUT_<STAGE>` environment variables holding file paths; the
/// run/stack/revision identifiers are exported as well so tools can
/// correlate their own logs.
pub struct CommandAdapter {
    command: Vec<String>,
    timeout_secs: u64,
}

impl CommandAdapter {
    pub fn new(command: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            command,
            timeout_secs,
        }
    }
}

#[async_trait]
impl ToolAdapter for CommandAdapter {
    async fn run(&self, ctx: &AdapterContext) -> Result<ExecutionOutcome, ExecutionError> {
        let start = Instant::now();

        if self.command.is_empty() {
            return Err(ExecutionError::Spawn {
                message: format!("stage {} has an empty command", ctx.stage),
            });
        }

        // Materialize input artifacts for the tool.
        let input_dir = tempfile::tempdir().map_err(|e| ExecutionError::Io {
            message: e.to_string(),
        })?;
        let mut input_env = Vec::new();
        for input in &ctx.inputs {
            let path = input_dir.path().join(&input.name);
            let mut file = std::fs::File::create(&path).map_err(|e| ExecutionError::Io {
                message: e.to_string(),
            })?;
            file.write_all(&input.bytes).map_err(|e| ExecutionError::Io {
                message: e.to_string(),
            })?;
            input_env.push((
                format!("STACKGATE_INPUT_{}", input.name.to_ascii_uppercase()),
                path,
            ));
        }

        let exe = &self.command[0];
        let args = &self.command[1..];

        let mut cmd = Command::new(exe);
        cmd.args(args)
            .env("STACKGATE_RUN_ID", &ctx.run_id.0)
            .env("STACKGATE_STACK_ID", &ctx.stack_id.0)
            .env("STACKGATE_REVISION", &ctx.revision)
            .env("STACKGATE_STAGE", ctx.stage.name())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the wait future (timeout) must reap the process.
            .kill_on_drop(true);
        for (key, path) in &input_env {
            cmd.env(key, path);
        }

        let child = cmd.spawn().map_err(|e| ExecutionError::Spawn {
            message: e.to_string(),
        })?;

        let output = if self.timeout_secs > 0 {
            match tokio::time::timeout(
                std::time::Duration::from_secs(self.timeout_secs),
                child.wait_with_output(),
            )
            .await
            {
                Ok(result) => result.map_err(|e| ExecutionError::Io {
                    message: e.to_string(),
                })?,
                Err(_) => {
                    return Err(ExecutionError::Timeout {
                        timeout_secs: self.timeout_secs,
                    })
                }
            }
        } else {
            child
                .wait_with_output()
                .await
                .map_err(|e| ExecutionError::Io {
                    message: e.to_string(),
                })?
        };

        Ok(ExecutionOutcome {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

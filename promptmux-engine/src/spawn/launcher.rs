//! Real engine launcher
//!
//! Builds the engine's fixed argument vector, merges the environment, and
//! hands the prepared command to the process layer.

use super::ProcessSpawner;
use crate::credentials::{Credentials, OAUTH_TOKEN_ENV};
use crate::errors::{EngineError, Result};
use crate::process::{self, ProcessHandle, MAX_LINE_BYTES};
use crate::types::SessionConfig;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;

/// Default engine executable name looked up on `PATH`
pub const DEFAULT_ENGINE_COMMAND: &str = "claude";

/// Spawns the real engine executable.
pub struct EngineLauncher {
    command: PathBuf,
    credentials: Arc<dyn Credentials>,
    max_line_bytes: usize,
}

impl std::fmt::Debug for EngineLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineLauncher")
            .field("command", &self.command)
            .field("max_line_bytes", &self.max_line_bytes)
            .finish()
    }
}

impl EngineLauncher {
    /// Resolve the engine executable and build a launcher.
    ///
    /// Bare names are looked up on `PATH`; explicit paths must exist.
    pub fn new(command: impl Into<PathBuf>, credentials: Arc<dyn Credentials>) -> Result<Self> {
        let command = command.into();
        let resolved = if command.components().count() > 1 || command.is_absolute() {
            if !command.is_file() {
                return Err(EngineError::SpawnFailed {
                    detail: format!("engine executable not found: {}", command.display()),
                });
            }
            command
        } else {
            which::which(&command).map_err(|e| EngineError::SpawnFailed {
                detail: format!("engine executable not found on PATH: {e}"),
            })?
        };
        debug!("using engine executable at {}", resolved.display());
        Ok(Self {
            command: resolved,
            credentials,
            max_line_bytes: MAX_LINE_BYTES,
        })
    }

    /// Override the stdout line cap
    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }

    /// Wire-level invocation contract: `chat` subcommand, streaming JSON
    /// output, turn budget, auto permission mode, optional system prompt and
    /// tool allowlist.
    fn build_command(&self, config: &SessionConfig) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.arg("chat");
        cmd.arg("--output-format=stream-json");
        cmd.arg(format!("--max-turns={}", config.max_turns));
        cmd.arg("--permission-mode=auto");
        if let Some(ref prompt) = config.system_prompt {
            cmd.arg(format!("--system-prompt={prompt}"));
        }
        if !config.allowed_tools.is_empty() {
            let csv: Vec<&str> = config.allowed_tools.iter().map(String::as_str).collect();
            cmd.arg(format!("--allowed-tools={}", csv.join(",")));
        }
        cmd.current_dir(&config.working_dir);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        if let Some(token) = config
            .oauth_token
            .clone()
            .or_else(|| self.credentials.oauth_token())
        {
            cmd.env(OAUTH_TOKEN_ENV, token);
        }
        cmd
    }
}

#[async_trait]
impl ProcessSpawner for EngineLauncher {
    async fn spawn(&self, config: &SessionConfig) -> Result<ProcessHandle> {
        if !config.working_dir.is_dir() {
            return Err(EngineError::SpawnFailed {
                detail: format!(
                    "working directory does not exist: {}",
                    config.working_dir.display()
                ),
            });
        }
        let cmd = self.build_command(config);
        debug!(
            "starting engine: {} {:?}",
            self.command.display(),
            cmd.as_std().get_args().collect::<Vec<_>>()
        );
        process::launch(cmd, self.max_line_bytes)
    }
}

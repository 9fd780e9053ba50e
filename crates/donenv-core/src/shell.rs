//! Subprocess execution
//!
//! `ShellRunner` is the seam every shell-driven collaborator goes through.
//! `ProcessShell` runs commands with `tokio::process`, optionally inside a
//! `nix develop` session rooted at a project folder.

use crate::error::ShellError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// A command to run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellCommand {
    /// Program
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// Extra environment
    pub env: BTreeMap<String, String>,
    /// Working directory
    pub current_dir: Option<PathBuf>,
}

impl ShellCommand {
    /// Create a command for a program
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Append an argument
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append arguments
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the working directory
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Runs commands and returns their stdout
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ShellRunner: Send + Sync {
    /// Run to completion
    async fn run(&self, command: &ShellCommand, cancel: &CancellationToken) -> Result<String, ShellError>;
}

/// Runs commands as local processes
#[derive(Debug, Clone, Default)]
pub struct ProcessShell {
    nix_dir: Option<PathBuf>,
}

impl ProcessShell {
    /// Run commands directly
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run commands inside `nix develop` in the given flake directory
    #[must_use]
    pub fn nix(flake_dir: impl Into<PathBuf>) -> Self {
        Self {
            nix_dir: Some(flake_dir.into()),
        }
    }

    /// The command actually spawned
    #[must_use]
    pub fn wrap(&self, command: &ShellCommand) -> ShellCommand {
        match &self.nix_dir {
            None => command.clone(),
            Some(dir) => ShellCommand {
                program: "nix".to_string(),
                args: ["develop", "--command", command.program.as_str()]
                    .into_iter()
                    .map(str::to_string)
                    .chain(command.args.iter().cloned())
                    .collect(),
                env: command.env.clone(),
                current_dir: Some(command.current_dir.clone().unwrap_or_else(|| dir.clone())),
            },
        }
    }
}

#[async_trait]
impl ShellRunner for ProcessShell {
    async fn run(&self, command: &ShellCommand, cancel: &CancellationToken) -> Result<String, ShellError> {
        let command = self.wrap(command);
        let line = command.to_string();
        tracing::debug!(command = %line, "running command");

        let mut process = Command::new(&command.program);
        process
            .args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.current_dir {
            process.current_dir(dir);
        }

        let child = process.spawn().map_err(|source| ShellError::Spawn {
            command: line.clone(),
            source,
        })?;

        let output = tokio::select! {
            () = cancel.cancelled() => return Err(ShellError::Cancelled(line)),
            output = child.wait_with_output() => output.map_err(|source| ShellError::Spawn {
                command: line.clone(),
                source,
            })?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            return match output.status.code() {
                Some(code) => {
                    tracing::error!(command = %line, code, stderr = %stderr.trim(), "command failed");
                    Err(ShellError::CommandFailed {
                        command: line,
                        code,
                        stderr,
                    })
                }
                None => Err(ShellError::Terminated(line)),
            };
        }

        String::from_utf8(output.stdout).map_err(|_| ShellError::InvalidOutput(line))
    }
}

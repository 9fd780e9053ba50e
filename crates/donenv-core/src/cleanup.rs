//! Test container removal

use crate::error::ShellError;
use crate::shell::{ShellCommand, ShellRunner};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Label carried by every container the environment starts
pub const CONTAINER_LABEL: &str = "framework=ctf";

/// Removes whatever the environment left running
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerCleaner: Send + Sync {
    /// Remove all labelled containers and their volumes; returns how many
    async fn remove_test_containers(&self, cancel: &CancellationToken) -> Result<usize, ShellError>;
}

/// Removes labelled containers through the docker CLI
#[derive(Clone)]
pub struct DockerCleaner {
    shell: Arc<dyn ShellRunner>,
}

impl std::fmt::Debug for DockerCleaner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerCleaner").finish_non_exhaustive()
    }
}

impl DockerCleaner {
    /// Create with a shell runner
    #[must_use]
    pub fn new(shell: Arc<dyn ShellRunner>) -> Self {
        Self { shell }
    }
}

#[async_trait]
impl ContainerCleaner for DockerCleaner {
    async fn remove_test_containers(&self, cancel: &CancellationToken) -> Result<usize, ShellError> {
        let list = ShellCommand::new("docker")
            .args(["ps", "-aq", "--filter"])
            .arg(format!("label={CONTAINER_LABEL}"));
        let output = self.shell.run(&list, cancel).await?;

        let ids: Vec<&str> = output.split_whitespace().collect();
        if ids.is_empty() {
            tracing::info!("no test containers to remove");
            return Ok(0);
        }

        let remove = ShellCommand::new("docker").args(["rm", "-f", "-v"]).args(ids.iter().copied());
        self.shell.run(&remove, cancel).await?;
        tracing::info!(count = ids.len(), "removed test containers and their volumes");
        Ok(ids.len())
    }
}

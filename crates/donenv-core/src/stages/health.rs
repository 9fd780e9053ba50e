//! Waiting for OCR3 nodes to report a healthy config watcher

use super::link_jd::DonTopology;
use crate::error::{EnvError, ProviderError, VerificationError};
use crate::flags::CapabilityFlag;
use crate::operation::{Operation, OperationContext};
use crate::provider::{HealthCheck, NodeApi};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Check name nodes report once OCR3 config tracking works
pub const CONFIG_WATCHER_PATTERN: &str = ".*ConfigWatcher";
/// Status of a healthy check
pub const PASSING: &str = "passing";

static CONFIG_WATCHER: Lazy<Result<Regex, regex::Error>> = Lazy::new(|| Regex::new(CONFIG_WATCHER_PATTERN));

/// Polling settings
#[derive(Debug, Clone, Copy)]
pub struct HealthWaitInput {
    /// Polls per node
    pub attempts: u32,
    /// Delay between polls
    pub interval: Duration,
}

impl Default for HealthWaitInput {
    fn default() -> Self {
        Self {
            attempts: 100,
            interval: Duration::from_secs(1),
        }
    }
}

/// Whether any check matches the pattern with the wanted status
#[must_use]
pub fn is_healthy(checks: &[HealthCheck], pattern: &Regex, status: &str) -> bool {
    checks
        .iter()
        .any(|check| pattern.is_match(&check.name) && check.status == status)
}

async fn wait_node(
    name: String,
    api: Arc<dyn NodeApi>,
    pattern: Regex,
    input: HealthWaitInput,
    cancel: CancellationToken,
) -> Result<(), VerificationError> {
    for attempt in 1..=input.attempts {
        match api.health_checks().await {
            Ok(checks) if is_healthy(&checks, &pattern, PASSING) => {
                tracing::debug!(node = %name, attempt, "node healthy");
                return Ok(());
            }
            Ok(_) => {}
            Err(err) => tracing::debug!(node = %name, attempt, error = %err, "health check query failed"),
        }

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(input.interval) => {}
        }
    }

    Err(VerificationError::Unhealthy {
        node: name,
        check: pattern.as_str().to_string(),
        attempts: input.attempts,
    })
}

/// Wait until every node of every OCR3 DON passes the config watcher check
///
/// # Errors
/// Returns the first node that never became healthy.
pub async fn wait_for_config_watchers(
    don_topology: &DonTopology,
    input: HealthWaitInput,
    cancel: &CancellationToken,
) -> Result<(), VerificationError> {
    let pattern = CONFIG_WATCHER.as_ref().map_err(Clone::clone)?.clone();
    let mut tasks = JoinSet::new();

    for (don, nodes) in don_topology.dons().filter(|(don, _)| don.has(CapabilityFlag::Ocr3)) {
        tracing::info!(don = %don.name, nodes = nodes.len(), "waiting for config watcher health checks");
        for node in nodes {
            tasks.spawn(wait_node(
                node.started.name.clone(),
                Arc::clone(&node.started.api),
                pattern.clone(),
                input,
                cancel.clone(),
            ));
        }
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(error = %err, "node did not become healthy");
                first_error.get_or_insert(err);
            }
            Err(join) => {
                tracing::error!(error = %join, "health wait task failed");
                first_error.get_or_insert(VerificationError::Node {
                    node: "health wait task".to_string(),
                    source: ProviderError::failed("health wait", join.to_string()),
                });
            }
        }
    }

    first_error.map_or(Ok(()), Err)
}

/// Waits for OCR3 DONs to become healthy
#[derive(Debug, Clone, Copy, Default)]
pub struct WaitForHealthyNodes;

#[async_trait]
impl Operation for WaitForHealthyNodes {
    const NAME: &'static str = "wait-for-healthy-nodes";
    const VERSION: &'static str = "1.0.0";
    type Input = HealthWaitInput;
    type Deps = DonTopology;
    type Output = ();

    async fn execute(&self, ctx: &OperationContext, deps: &DonTopology, input: HealthWaitInput) -> Result<(), EnvError> {
        wait_for_config_watchers(deps, input, &ctx.cancel).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::InfraInput;
    use crate::provider::{MockNodeApi, StartedNode};
    use crate::stages::link_jd::LinkedNode;
    use crate::topology::{build_topology, NodeSetInput};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn check(name: &str, status: &str) -> HealthCheck {
        HealthCheck {
            name: name.to_string(),
            status: status.to_string(),
            output: String::new(),
        }
    }

    fn don_topology(flags: &[CapabilityFlag], api: impl Fn(usize) -> MockNodeApi) -> DonTopology {
        let set = NodeSetInput::new("workflow", 2)
            .with_don_types([CapabilityFlag::Workflow, CapabilityFlag::Gateway])
            .with_capabilities(flags.iter().copied());
        let topology = build_topology(&[set], &InfraInput::Docker, 1).unwrap();
        let linked = topology.dons[0]
            .nodes
            .iter()
            .map(|metadata| LinkedNode {
                metadata: metadata.clone(),
                started: StartedNode {
                    name: metadata.name(),
                    host: metadata.host.clone(),
                    external_url: String::new(),
                    api: Arc::new(api(metadata.index)),
                },
                jd_node_id: metadata.name(),
            })
            .collect();
        DonTopology {
            topology: Arc::new(topology),
            nodes: BTreeMap::from([(1, linked)]),
        }
    }

    fn fast(attempts: u32) -> HealthWaitInput {
        HealthWaitInput {
            attempts,
            interval: Duration::from_millis(1),
        }
    }

    #[test]
    fn health_requires_matching_name_and_status() {
        let pattern = Regex::new(CONFIG_WATCHER_PATTERN).unwrap();
        assert!(is_healthy(&[check("EVM.1337.ConfigWatcher", "passing")], &pattern, PASSING));
        assert!(!is_healthy(&[check("EVM.1337.ConfigWatcher", "failing")], &pattern, PASSING));
        assert!(!is_healthy(&[check("HeadTracker", "passing")], &pattern, PASSING));
    }

    #[tokio::test]
    async fn waits_until_checks_pass() {
        let topology = don_topology(&[CapabilityFlag::Ocr3], |_| {
            let polls = AtomicU32::new(0);
            let mut api = MockNodeApi::new();
            api.expect_health_checks().returning(move || {
                if polls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::failed("node", "starting"))
                } else {
                    Ok(vec![check("OCR3.ConfigWatcher", "passing")])
                }
            });
            api
        });

        wait_for_config_watchers(&topology, fast(10), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unhealthy_node_fails_after_attempts() {
        let topology = don_topology(&[CapabilityFlag::Ocr3], |index| {
            let mut api = MockNodeApi::new();
            api.expect_health_checks().returning(move || {
                let status = if index == 1 { "failing" } else { "passing" };
                Ok(vec![check("OCR3.ConfigWatcher", status)])
            });
            api
        });

        let err = wait_for_config_watchers(&topology, fast(3), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::Unhealthy { ref node, attempts: 3, .. } if node == "workflow-node1"));
    }

    #[tokio::test]
    async fn dons_without_ocr3_are_not_polled() {
        let topology = don_topology(&[], |_| {
            let mut api = MockNodeApi::new();
            api.expect_health_checks().never();
            api
        });
        wait_for_config_watchers(&topology, fast(1), &CancellationToken::new())
            .await
            .unwrap();
    }
}

//! Log-poller filter verification for the workflow DON

use super::link_jd::{DonTopology, LinkedNode};
use crate::error::{EnvError, ProviderError, VerificationError};
use crate::flags::CapabilityFlag;
use crate::operation::{Operation, OperationContext};
use crate::provider::FilterInfo;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Events of the workflow registry each workflow node tracks
pub const TRACKED_WORKFLOW_REGISTRY_EVENTS: usize = 6;

/// Polling settings
#[derive(Debug, Clone, Copy)]
pub struct FilterWaitInput {
    /// Registry chain id
    pub home_chain_id: u64,
    /// Delay between polls
    pub interval: Duration,
    /// Give up after this long
    pub timeout: Duration,
}

impl FilterWaitInput {
    /// Default polling for a registry chain
    #[must_use]
    pub fn new(home_chain_id: u64) -> Self {
        Self {
            home_chain_id,
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Whether the node tracks every workflow registry event
#[must_use]
pub fn has_workflow_registry_filters(filters: &[FilterInfo]) -> bool {
    filters.iter().any(|filter| {
        filter.name.contains("WorkflowRegistry") && filter.event_sigs.len() == TRACKED_WORKFLOW_REGISTRY_EVENTS
    })
}

async fn poll_workers(
    workers: &[&LinkedNode],
    input: FilterWaitInput,
    cancel: &CancellationToken,
) -> Result<(), VerificationError> {
    let mut ready = BTreeSet::new();
    let mut ticker = tokio::time::interval(input.interval);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                return Err(VerificationError::Node {
                    node: "filter verification".to_string(),
                    source: ProviderError::Cancelled("filter verification"),
                });
            }
            _ = ticker.tick() => {}
        }

        for node in workers {
            if ready.contains(&node.metadata.index) {
                continue;
            }
            let filters = node
                .started
                .api
                .registered_filters(input.home_chain_id)
                .await
                .map_err(|source| VerificationError::Node {
                    node: node.started.name.clone(),
                    source,
                })?;
            if has_workflow_registry_filters(&filters) {
                tracing::debug!(node = %node.started.name, "workflow registry filters registered");
                ready.insert(node.metadata.index);
            }
        }

        if ready.len() == workers.len() {
            return Ok(());
        }
    }
}

/// Wait until every worker of the workflow DON registered the workflow
/// registry filters
///
/// # Errors
/// Returns `VerificationError::Timeout` when the deadline passes, or the
/// first failed filter query.
pub async fn wait_for_expected_filters(
    don_topology: &DonTopology,
    input: FilterWaitInput,
    cancel: &CancellationToken,
) -> Result<(), VerificationError> {
    for (don, nodes) in don_topology.dons().filter(|(don, _)| don.has(CapabilityFlag::Workflow)) {
        let workers: Vec<&LinkedNode> = nodes.iter().filter(|node| !node.metadata.is_bootstrap()).collect();

        tokio::time::timeout(input.timeout, poll_workers(&workers, input, cancel))
            .await
            .map_err(|_| VerificationError::Timeout {
                seconds: input.timeout.as_secs_f64(),
                what: "waiting for all nodes to have expected filters registered".to_string(),
            })??;

        tracing::info!(don = %don.name, nodes = workers.len(), "all nodes have expected filters registered");
    }

    Ok(())
}

/// Verifies log-poller filters; runs as a background stage
#[derive(Debug, Clone, Copy, Default)]
pub struct VerifyFilters;

#[async_trait]
impl Operation for VerifyFilters {
    const NAME: &'static str = "verify-log-poller-filters";
    const VERSION: &'static str = "1.0.0";
    type Input = FilterWaitInput;
    type Deps = DonTopology;
    type Output = ();

    async fn execute(&self, ctx: &OperationContext, deps: &DonTopology, input: FilterWaitInput) -> Result<(), EnvError> {
        wait_for_expected_filters(deps, input, &ctx.cancel).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::InfraInput;
    use crate::provider::{MockNodeApi, StartedNode};
    use crate::topology::{build_topology, NodeSetInput};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn filter(name: &str, sigs: usize) -> FilterInfo {
        FilterInfo {
            name: name.to_string(),
            event_sigs: (0..sigs).map(|i| format!("0x{i:064x}")).collect(),
            addresses: Vec::new(),
        }
    }

    fn don_topology(api: impl Fn(usize) -> MockNodeApi) -> DonTopology {
        let set = NodeSetInput::new("workflow", 3)
            .with_don_types([CapabilityFlag::Workflow, CapabilityFlag::Gateway]);
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

    fn fast(timeout: Duration) -> FilterWaitInput {
        FilterWaitInput {
            home_chain_id: 1337,
            interval: Duration::from_millis(5),
            timeout,
        }
    }

    #[test]
    fn needs_exact_event_count() {
        assert!(has_workflow_registry_filters(&[filter("WorkflowRegistry-0xabc", 6)]));
        assert!(!has_workflow_registry_filters(&[filter("WorkflowRegistry-0xabc", 5)]));
        assert!(!has_workflow_registry_filters(&[filter("Forwarder", 6)]));
    }

    #[tokio::test]
    async fn bootstrap_is_not_checked() {
        let topology = don_topology(|index| {
            let mut api = MockNodeApi::new();
            if index == 0 {
                api.expect_registered_filters().never();
            } else {
                let polls = AtomicU32::new(0);
                api.expect_registered_filters().returning(move |chain_id| {
                    assert_eq!(chain_id, 1337);
                    let sigs = if polls.fetch_add(1, Ordering::SeqCst) == 0 { 3 } else { 6 };
                    Ok(vec![filter("WorkflowRegistry", sigs)])
                });
            }
            api
        });

        wait_for_expected_filters(&topology, fast(Duration::from_secs(5)), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn times_out_with_message() {
        let topology = don_topology(|_| {
            let mut api = MockNodeApi::new();
            api.expect_registered_filters().returning(|_| Ok(Vec::new()));
            api
        });

        let err = wait_for_expected_filters(&topology, fast(Duration::from_millis(50)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "timed out, when waiting for 0.05 seconds, waiting for all nodes to have expected filters registered"
        );
    }
}

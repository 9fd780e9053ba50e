//! Registering started nodes with the Job Distributor

use super::dons_and_jd::StartedEnvironment;
use crate::error::{EnvError, JobError, ProviderError};
use crate::infra::NodeRole;
use crate::operation::{Operation, OperationContext};
use crate::provider::{JobDistributor, NodeRegistration, StartedNode};
use crate::topology::{DonMetadata, NodeMetadata, Topology};
use async_trait::async_trait;
use futures::future::try_join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// A started node registered with the Job Distributor
#[derive(Debug, Clone)]
pub struct LinkedNode {
    /// Metadata from the topology
    pub metadata: NodeMetadata,
    /// Started node handle
    pub started: StartedNode,
    /// Node id assigned by the JD
    pub jd_node_id: String,
}

/// Topology plus started, JD-linked nodes per DON
#[derive(Debug, Clone)]
pub struct DonTopology {
    /// Frozen topology
    pub topology: Arc<Topology>,
    /// Linked nodes by DON id, in node index order
    pub nodes: BTreeMap<u32, Vec<LinkedNode>>,
}

impl DonTopology {
    /// Linked nodes of a DON
    #[must_use]
    pub fn don_nodes(&self, don_id: u32) -> &[LinkedNode] {
        self.nodes.get(&don_id).map_or(&[], Vec::as_slice)
    }

    /// DONs with their linked nodes
    pub fn dons(&self) -> impl Iterator<Item = (&DonMetadata, &[LinkedNode])> {
        self.topology.dons.iter().map(|don| (don, self.don_nodes(don.id)))
    }
}

/// Registers every started node with the Job Distributor
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkNodesToJd;

/// Retry settings of `LinkNodesToJd`
#[derive(Debug, Clone, Copy)]
pub struct LinkJdInput {
    /// Attempts per node
    pub attempts: u32,
    /// Delay between attempts
    pub backoff: Duration,
}

impl Default for LinkJdInput {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

/// Outputs of earlier stages needed by `LinkNodesToJd`
#[derive(Debug, Clone)]
pub struct LinkJdDeps {
    /// Topology with keys
    pub topology: Arc<Topology>,
    /// Started nodes and JD
    pub started: StartedEnvironment,
}

#[async_trait]
impl Operation for LinkNodesToJd {
    const NAME: &'static str = "link-nodes-to-jd";
    const VERSION: &'static str = "1.0.0";
    type Input = LinkJdInput;
    type Deps = LinkJdDeps;
    type Output = DonTopology;

    async fn execute(
        &self,
        ctx: &OperationContext,
        deps: &LinkJdDeps,
        input: LinkJdInput,
    ) -> Result<DonTopology, EnvError> {
        let jd = &deps.started.jd.client;
        let mut nodes = BTreeMap::new();

        for (don, output) in deps.topology.dons.iter().zip(&deps.started.node_sets) {
            let linked = try_join_all(
                don.nodes
                    .iter()
                    .zip(&output.nodes)
                    .map(|(metadata, started)| link_node(ctx, jd.as_ref(), input, don, metadata, started)),
            )
            .await?;
            tracing::info!(don = %don.name, nodes = linked.len(), "linked DON to job distributor");
            nodes.insert(don.id, linked);
        }

        Ok(DonTopology {
            topology: Arc::clone(&deps.topology),
            nodes,
        })
    }
}

/// JD labels of a node
#[must_use]
pub fn node_labels(don: &DonMetadata, node: &NodeMetadata) -> BTreeMap<String, String> {
    let node_type = match node.role {
        NodeRole::Bootstrap => "bootstrap",
        NodeRole::Worker => "plugin",
    };
    let mut labels = BTreeMap::from([
        ("type".to_string(), node_type.to_string()),
        ("node_index".to_string(), node.index.to_string()),
        ("don_id".to_string(), don.id.to_string()),
        ("don_name".to_string(), don.name.clone()),
    ]);
    if let Some(peer_id) = &node.p2p_peer_id {
        labels.insert("p2p_id".to_string(), peer_id.to_string());
    }
    labels
}

async fn link_node(
    ctx: &OperationContext,
    jd: &dyn JobDistributor,
    input: LinkJdInput,
    don: &DonMetadata,
    metadata: &NodeMetadata,
    started: &StartedNode,
) -> Result<LinkedNode, EnvError> {
    let attempts = input.attempts.max(1);
    let mut last_error = ProviderError::Cancelled("job distributor");

    for attempt in 1..=attempts {
        match register(jd, don, metadata, started).await {
            Ok(jd_node_id) => {
                tracing::debug!(node = %started.name, jd_node_id, attempt, "node registered");
                return Ok(LinkedNode {
                    metadata: metadata.clone(),
                    started: started.clone(),
                    jd_node_id,
                });
            }
            Err(err) => {
                tracing::warn!(node = %started.name, attempt, error = %err, "node registration failed");
                last_error = err;
            }
        }

        if attempt < attempts {
            tokio::select! {
                () = ctx.cancel.cancelled() => return Err(EnvError::Cancelled),
                () = tokio::time::sleep(input.backoff) => {}
            }
        }
    }

    Err(JobError::Link {
        node: started.name.clone(),
        attempts,
        source: last_error,
    }
    .into())
}

async fn register(
    jd: &dyn JobDistributor,
    don: &DonMetadata,
    metadata: &NodeMetadata,
    started: &StartedNode,
) -> Result<String, ProviderError> {
    let public_key = started.api.csa_public_key().await?;
    jd.register_node(&NodeRegistration {
        name: started.name.clone(),
        public_key,
        labels: node_labels(don, metadata),
    })
    .await
}

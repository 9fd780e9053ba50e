//! Concurrent DON and Job Distributor startup

use crate::chain::WrappedBlockchainOutput;
use crate::error::{EnvError, ProviderError, JD_IMAGE_PULL_HINT};
use crate::operation::{Operation, OperationContext};
use crate::provider::{JdInput, JdOutput, JobDistributorLauncher, NodeSetLauncher, NodeSetOutput, NodeSetSpec};
use async_trait::async_trait;
use futures::future::try_join_all;
use std::sync::Arc;

/// Starts every node set and the Job Distributor at the same time
#[derive(Debug, Clone, Copy, Default)]
pub struct StartDonsAndJd;

/// Collaborators of `StartDonsAndJd`
#[derive(Clone)]
pub struct StartDonsDeps {
    /// Node set launcher
    pub node_sets: Arc<dyn NodeSetLauncher>,
    /// JD launcher
    pub jd: Arc<dyn JobDistributorLauncher>,
    /// Home chain, passed to node sets
    pub registry_chain: WrappedBlockchainOutput,
}

/// Input of `StartDonsAndJd`
#[derive(Debug, Clone)]
pub struct StartDonsInput {
    /// Node sets in DON order
    pub node_sets: Vec<NodeSetSpec>,
    /// JD settings
    pub jd: JdInput,
}

/// Result of `StartDonsAndJd`
#[derive(Debug, Clone)]
pub struct StartedEnvironment {
    /// Started node sets in DON order
    pub node_sets: Vec<NodeSetOutput>,
    /// Started JD
    pub jd: JdOutput,
}

#[async_trait]
impl Operation for StartDonsAndJd {
    const NAME: &'static str = "start-dons-and-jd";
    const VERSION: &'static str = "1.0.0";
    type Input = StartDonsInput;
    type Deps = StartDonsDeps;
    type Output = StartedEnvironment;

    async fn execute(
        &self,
        ctx: &OperationContext,
        deps: &StartDonsDeps,
        input: StartDonsInput,
    ) -> Result<StartedEnvironment, EnvError> {
        let jd = async {
            deps.jd.start(&input.jd, &ctx.cancel).await.map_err(jd_error)
        };
        let dons = async {
            try_join_all(input.node_sets.iter().map(|spec| start_node_set(ctx, deps, spec))).await
        };

        let (jd, node_sets) = tokio::try_join!(jd, dons)?;
        tracing::info!(
            node_sets = node_sets.len(),
            jd = %jd.external_grpc_url,
            "DONs and job distributor started"
        );

        Ok(StartedEnvironment { node_sets, jd })
    }
}

async fn start_node_set(
    ctx: &OperationContext,
    deps: &StartDonsDeps,
    spec: &NodeSetSpec,
) -> Result<NodeSetOutput, EnvError> {
    tracing::info!(node_set = %spec.name, nodes = spec.nodes.len(), "starting node set");
    let output = deps.node_sets.start(spec, &deps.registry_chain, &ctx.cancel).await?;
    if output.nodes.len() != spec.nodes.len() {
        return Err(ProviderError::InvalidResponse {
            component: "node set",
            reason: format!(
                "node set {} started {} nodes, expected {}",
                spec.name,
                output.nodes.len(),
                spec.nodes.len()
            ),
        }
        .into());
    }
    Ok(output)
}

fn jd_error(err: ProviderError) -> EnvError {
    let message = err.to_string();
    let pull_denied = message.contains("pull access denied") || message.contains("may require 'docker login'");
    let err = EnvError::from(err);
    if pull_denied {
        err.with_hint(JD_IMAGE_PULL_HINT)
    } else {
        err
    }
}

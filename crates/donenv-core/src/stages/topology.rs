//! Topology, keys, peering and node-set assembly

use crate::chain::{AddressBook, ChainClient, WrappedBlockchainOutput};
use crate::error::{EnvError, OverlayError};
use crate::infra::InfraInput;
use crate::keys::{add_keys_to_topology, generate_keys, GeneratedKeys, KeyRequest};
use crate::operation::{Operation, OperationContext};
use crate::overlay::{
    merge_env_vars, prepare_node_set, ConfigTransformer, EvmChainConfig, GenerateConfigsInput, PreparedNodeSetInput,
    SolanaChainConfig,
};
use crate::provider::{NodeLaunchSpec, NodeSetSpec};
use crate::topology::{build_topology, find_peering_data, NodeSetInput, OcrPeeringData, PeeringData, Topology};
use async_trait::async_trait;
use std::sync::Arc;

/// Builds the topology, injects keys and renders every node's config and secrets
#[derive(Debug, Clone, Copy, Default)]
pub struct PrepareTopology;

/// Input of `PrepareTopology`
#[derive(Clone)]
pub struct PrepareTopologyInput {
    /// Declared node sets
    pub node_sets: Vec<NodeSetInput>,
    /// Infra descriptor
    pub infra: InfraInput,
    /// Registry chain
    pub home_chain_selector: u64,
    /// Password sealing node keys
    pub key_password: String,
    /// Extra config transformers
    pub transformers: Vec<Arc<dyn ConfigTransformer>>,
    /// Extra host ports to expose on every node set
    pub extra_allowed_ports: Vec<u16>,
}

impl std::fmt::Debug for PrepareTopologyInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrepareTopologyInput")
            .field("node_sets", &self.node_sets)
            .field("infra", &self.infra)
            .field("home_chain_selector", &self.home_chain_selector)
            .field("transformers", &self.transformers.len())
            .field("extra_allowed_ports", &self.extra_allowed_ports)
            .finish_non_exhaustive()
    }
}

/// Outputs of earlier stages needed by `PrepareTopology`
#[derive(Debug, Clone)]
pub struct PrepareTopologyDeps {
    /// Started chains
    pub blockchains: Vec<WrappedBlockchainOutput>,
    /// Deployed contracts
    pub addresses: AddressBook,
}

/// Result of `PrepareTopology`
#[derive(Debug, Clone)]
pub struct PreparedEnvironment {
    /// Topology with keys injected, frozen from here on
    pub topology: Arc<Topology>,
    /// Generated keys
    pub keys: GeneratedKeys,
    /// Capabilities peering
    pub peering: PeeringData,
    /// OCR peering
    pub ocr_peering: OcrPeeringData,
    /// Node sets ready to launch, in DON order
    pub node_sets: Vec<NodeSetSpec>,
}

#[async_trait]
impl Operation for PrepareTopology {
    const NAME: &'static str = "prepare-topology";
    const VERSION: &'static str = "1.0.0";
    type Input = PrepareTopologyInput;
    type Deps = PrepareTopologyDeps;
    type Output = PreparedEnvironment;

    async fn execute(
        &self,
        _ctx: &OperationContext,
        deps: &PrepareTopologyDeps,
        mut input: PrepareTopologyInput,
    ) -> Result<PreparedEnvironment, EnvError> {
        for set in &mut input.node_sets {
            merge_env_vars(set)?;
        }

        let topology = build_topology(&input.node_sets, &input.infra, input.home_chain_selector)?;

        let (evm_chains, solana_chains) = chain_configs(&deps.blockchains).await?;
        let home_chain_id = evm_chains
            .iter()
            .find(|chain| chain.chain_selector == input.home_chain_selector)
            .map(|chain| chain.chain_id)
            .ok_or(OverlayError::MissingHomeChain(input.home_chain_selector))?;

        let request = KeyRequest {
            password: input.key_password.clone(),
            p2p: true,
            evm_chain_ids: evm_chains.iter().map(|chain| chain.chain_id).collect(),
            solana_chain_ids: solana_chains.iter().map(|chain| chain.numeric_id).collect(),
        };
        let keys = generate_keys(&topology, &request)?;
        let topology = add_keys_to_topology(topology, &keys)?;
        let (peering, ocr_peering) = find_peering_data(&topology)?;

        let mut node_sets = Vec::with_capacity(topology.dons.len());
        for (set, don) in input.node_sets.iter().zip(&topology.dons) {
            let prepared = prepare_node_set(&PreparedNodeSetInput {
                set,
                configs: GenerateConfigsInput {
                    don,
                    home_chain_selector: input.home_chain_selector,
                    home_chain_id,
                    evm_chains: &evm_chains,
                    solana_chains: &solana_chains,
                    addresses: &deps.addresses,
                    peering: &peering,
                    ocr_peering: &ocr_peering,
                    gateway_connector: topology.gateway_connector.as_ref(),
                },
                keys: &keys,
                transformers: &input.transformers,
            })?;

            let nodes = prepared
                .into_iter()
                .zip(&don.nodes)
                .zip(&set.nodes)
                .map(|((node, metadata), spec)| NodeLaunchSpec {
                    index: node.index,
                    role: metadata.role,
                    host: metadata.host.clone(),
                    image: spec.image.clone(),
                    config: node.config,
                    secrets: node.secrets,
                    env_vars: node.env_vars,
                })
                .collect();

            node_sets.push(NodeSetSpec {
                name: don.name.clone(),
                don_id: don.id,
                nodes,
                extra_allowed_ports: input.extra_allowed_ports.clone(),
            });
        }

        tracing::info!(
            dons = topology.dons.len(),
            nodes = topology.node_count(),
            bootstrapper = %peering.global_bootstrapper_host,
            "topology prepared"
        );

        Ok(PreparedEnvironment {
            topology: Arc::new(topology),
            keys,
            peering,
            ocr_peering,
            node_sets,
        })
    }
}

async fn chain_configs(
    blockchains: &[WrappedBlockchainOutput],
) -> Result<(Vec<EvmChainConfig>, Vec<SolanaChainConfig>), EnvError> {
    let mut evm = Vec::new();
    let mut solana = Vec::new();

    for chain in blockchains {
        match &chain.client {
            ChainClient::Evm(_) => evm.push(EvmChainConfig {
                name: format!("node-{}", chain.chain_id),
                chain_id: chain.chain_id,
                chain_selector: chain.chain_selector,
                http_url: chain.endpoints.internal_http_url.clone(),
                ws_url: chain.endpoints.internal_ws_url.clone(),
            }),
            ChainClient::Solana { client, .. } => solana.push(SolanaChainConfig {
                name: format!("solana-{}", chain.chain_id),
                numeric_id: chain.chain_id,
                chain_id: client.genesis_hash().await?,
                chain_selector: chain.chain_selector,
                http_url: chain.endpoints.internal_http_url.clone(),
            }),
        }
    }

    Ok((evm, solana))
}

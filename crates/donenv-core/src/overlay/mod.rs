//! Per-node config overlays
//!
//! `generate` renders one TOML overlay per node of a DON from the topology,
//! peering data, deployed contracts and capability flags. Registered
//! transformers then get a chance to replace whole node entries. The result
//! must cover every node index.

mod prepare;
mod templates;

pub use prepare::{
    merge_env_vars, prepare_node_set, validate_override_pairing, OverridePairing, PreparedNode,
    PreparedNodeSetInput,
};

use crate::chain::{AddressBook, ContractKind};
use crate::error::OverlayError;
use crate::flags::CapabilityFlag;
use crate::topology::{DonMetadata, GatewayConnectorOutput, NodeMetadata, OcrPeeringData, PeeringData};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use templates::EvmWorkflow;

/// Node index to config TOML
pub type NodeIndexToOverride = BTreeMap<usize, String>;

/// EVM chain as seen from node containers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvmChainConfig {
    /// Node-side chain name
    pub name: String,
    /// Chain id
    pub chain_id: u64,
    /// Chain selector
    pub chain_selector: u64,
    /// Internal HTTP URL
    pub http_url: String,
    /// Internal WS URL
    pub ws_url: String,
}

/// Solana chain as seen from node containers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolanaChainConfig {
    /// Node-side chain name
    pub name: String,
    /// Numeric id used for key registration
    pub numeric_id: u64,
    /// Genesis hash, the chain id nodes use
    pub chain_id: String,
    /// Chain selector
    pub chain_selector: u64,
    /// Internal HTTP URL
    pub http_url: String,
}

/// Everything needed to render one DON's overlays
#[derive(Debug, Clone)]
pub struct GenerateConfigsInput<'a> {
    /// DON being rendered
    pub don: &'a DonMetadata,
    /// Registry chain selector
    pub home_chain_selector: u64,
    /// Registry chain id
    pub home_chain_id: u64,
    /// All EVM chains; filtered by the DON's supported chains
    pub evm_chains: &'a [EvmChainConfig],
    /// All Solana chains
    pub solana_chains: &'a [SolanaChainConfig],
    /// Deployed contracts
    pub addresses: &'a AddressBook,
    /// Capabilities peering
    pub peering: &'a PeeringData,
    /// Global OCR peering
    pub ocr_peering: &'a OcrPeeringData,
    /// Gateway wiring
    pub gateway_connector: Option<&'a GatewayConnectorOutput>,
}

impl GenerateConfigsInput<'_> {
    fn contract(&self, selector: u64, kind: ContractKind) -> Result<&str, OverlayError> {
        self.addresses
            .get(selector, kind)
            .ok_or_else(|| OverlayError::MissingContract {
                contract: kind.to_string(),
                selector,
            })
    }

    fn don_evm_chains(&self) -> Vec<&EvmChainConfig> {
        self.evm_chains
            .iter()
            .filter(|chain| self.don.supports_chain(chain.chain_id))
            .collect()
    }

    fn solana_chain(&self) -> Result<Option<&SolanaChainConfig>, OverlayError> {
        match self.solana_chains {
            [] => Ok(None),
            [chain] => Ok(Some(chain)),
            _ => Err(OverlayError::MultipleSolanaChains),
        }
    }

    fn node_address(&self, node: &NodeMetadata, chain_id: u64) -> Result<String, OverlayError> {
        node.address(chain_id)
            .map(str::to_string)
            .ok_or_else(|| OverlayError::MissingNodeAddress {
                don: self.don.name.clone(),
                index: node.index,
                chain_id,
            })
    }
}

/// Replaces whole node entries after the base overlays are rendered
pub trait ConfigTransformer: Send + Sync {
    /// Name used in errors
    fn name(&self) -> &str;

    /// Return the entries to replace
    ///
    /// # Errors
    /// Any error aborts generation.
    fn transform(
        &self,
        input: &GenerateConfigsInput<'_>,
        current: &NodeIndexToOverride,
    ) -> Result<NodeIndexToOverride, OverlayError>;
}

/// Render the config overlays of one DON
///
/// # Errors
/// Fails on more than one bootstrap node, more than one Solana chain, missing
/// contracts or addresses, transformer errors, or an incomplete result.
pub fn generate(
    input: &GenerateConfigsInput<'_>,
    transformers: &[Arc<dyn ConfigTransformer>],
) -> Result<NodeIndexToOverride, OverlayError> {
    let don = input.don;
    let evm_chains = input.don_evm_chains();
    let mut overrides = NodeIndexToOverride::new();

    if don.flags.is_gateway_only() {
        for node in &don.nodes {
            overrides.insert(node.index, templates::gateway_only(&evm_chains));
        }
    } else {
        render_don(input, &evm_chains, &mut overrides)?;
    }

    for transformer in transformers {
        let replaced = transformer
            .transform(input, &overrides)
            .map_err(|err| match err {
                OverlayError::Transformer { .. } => err,
                other => OverlayError::Transformer {
                    name: transformer.name().to_string(),
                    reason: other.to_string(),
                },
            })?;
        overrides.extend(replaced);
    }

    if let Some(&index) = overrides.keys().find(|index| **index >= don.nodes.len()) {
        return Err(OverlayError::UnexpectedNodeIndex {
            don: don.name.clone(),
            index,
            nodes: don.nodes.len(),
        });
    }
    for index in 0..don.nodes.len() {
        if !overrides.contains_key(&index) {
            return Err(OverlayError::MissingNodeIndex {
                don: don.name.clone(),
                index,
            });
        }
    }

    tracing::debug!(don = %don.name, nodes = overrides.len(), "generated config overlays");
    Ok(overrides)
}

fn render_don(
    input: &GenerateConfigsInput<'_>,
    evm_chains: &[&EvmChainConfig],
    overrides: &mut NodeIndexToOverride,
) -> Result<(), OverlayError> {
    let don = input.don;
    let solana = input.solana_chain()?;
    let registry = input.contract(input.home_chain_selector, ContractKind::CapabilitiesRegistry)?;

    let bootstraps: Vec<&NodeMetadata> = don.bootstraps().collect();
    let don_ocr = match bootstraps.as_slice() {
        [] => input.ocr_peering.clone(),
        [bootstrap] => {
            let peer_id = bootstrap
                .p2p_peer_id
                .clone()
                .ok_or_else(|| OverlayError::UnresolvedBootstrap(don.name.clone(), "peer id"))?;
            let mut config = templates::bootstrap_evm(
                peer_id.raw(),
                input.home_chain_id,
                registry,
                evm_chains,
            );
            if don.has(CapabilityFlag::Workflow) {
                config.push_str(&templates::bootstrap_don2don_peering(input.peering));
            }
            overrides.insert(bootstrap.index, config);

            OcrPeeringData {
                ocr_bootstrapper_peer_id: peer_id,
                ocr_bootstrapper_host: bootstrap.host.clone(),
                port: input.ocr_peering.port,
            }
        }
        _ => return Err(OverlayError::MultipleBootstraps),
    };

    for node in don.workers() {
        let mut chains = Vec::with_capacity(evm_chains.len());
        let mut from_addresses = Vec::with_capacity(evm_chains.len());
        for chain in evm_chains {
            let forwarder = input
                .addresses
                .get(chain.chain_selector, ContractKind::KeystoneForwarder);
            let from = match forwarder {
                Some(_) => Some(input.node_address(node, chain.chain_id)?),
                None => None,
            };
            from_addresses.push((forwarder, from));
        }
        for (chain, (forwarder, from)) in evm_chains.iter().zip(&from_addresses) {
            let workflow = match (forwarder, from) {
                (Some(forwarder_address), Some(from_address)) => Some(EvmWorkflow {
                    from_address,
                    forwarder_address,
                }),
                _ => None,
            };
            chains.push((*chain, workflow));
        }

        let mut config = templates::worker_evm(
            &don_ocr,
            input.peering,
            registry,
            input.home_chain_id,
            &chains,
        );
        if let Some(solana) = solana {
            config.push_str(&templates::worker_solana(solana));
        }
        config.push_str(&flag_sections(input, node, solana)?);
        overrides.insert(node.index, config);
    }

    Ok(())
}

/// Worker sections contributed by the DON's flags
fn flag_sections(
    input: &GenerateConfigsInput<'_>,
    node: &NodeMetadata,
    solana: Option<&SolanaChainConfig>,
) -> Result<String, OverlayError> {
    let don = input.don;
    let mut out = String::new();
    let mut needs_gateway = false;

    for flag in don.flags.iter() {
        match flag {
            CapabilityFlag::Workflow => {
                let registry = input.contract(input.home_chain_selector, ContractKind::WorkflowRegistry)?;
                out.push_str(&templates::worker_workflow_registry(registry, input.home_chain_id));
                needs_gateway = true;
            }
            // EVM writer blocks follow each chain's forwarder, see `render_don`.
            CapabilityFlag::WriteEvm => {}
            CapabilityFlag::WriteSolana => {
                if let Some(chain) = solana {
                    let forwarder = input.contract(chain.chain_selector, ContractKind::KeystoneForwarder)?;
                    let from = input.node_address(node, chain.numeric_id)?;
                    out.push_str(&templates::worker_solana_writer(&from, forwarder));
                }
            }
            CapabilityFlag::WebApiTrigger
            | CapabilityFlag::WebApiTarget
            | CapabilityFlag::CustomCompute
            | CapabilityFlag::Vault
            | CapabilityFlag::HttpTrigger
            | CapabilityFlag::HttpAction => needs_gateway = true,
            CapabilityFlag::Gateway
            | CapabilityFlag::Capabilities
            | CapabilityFlag::Ocr3
            | CapabilityFlag::Cron
            | CapabilityFlag::LogTrigger
            | CapabilityFlag::ReadContract => {}
        }
    }

    if needs_gateway {
        let gateway = input
            .gateway_connector
            .ok_or_else(|| OverlayError::MissingGatewayConnector(don.name.clone()))?;
        let node_address = input.node_address(node, input.home_chain_id)?;
        out.push_str(&templates::worker_gateway(
            &node_address,
            input.home_chain_id,
            &don.name,
            gateway,
        ));
    }

    Ok(out)
}

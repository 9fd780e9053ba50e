//! Node config TOML fragments

use super::{EvmChainConfig, SolanaChainConfig};
use crate::topology::{GatewayConnectorOutput, OcrPeeringData, PeeringData};

/// Forwarder wiring of one EVM chain for a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EvmWorkflow<'a> {
    pub(crate) from_address: &'a str,
    pub(crate) forwarder_address: &'a str,
}

const FEATURES: &str = "[Feature]
LogPoller = true

[OCR2]
Enabled = true
DatabaseTimeout = '1s'
ContractPollInterval = '1s'
";

fn evm_chain(chain: &EvmChainConfig, worker: bool, workflow: Option<&EvmWorkflow<'_>>) -> String {
    let mut out = format!(
        "\n[[EVM]]\nChainID = '{}'\nAutoCreateKey = false\n",
        chain.chain_id
    );
    if worker {
        out.push_str("FinalityDepth = 1\nLogPollInterval = '5s'\n");
    }
    out.push_str(&format!(
        "\n[[EVM.Nodes]]\nName = '{}'\nWSURL = '{}'\nHTTPURL = '{}'\n",
        chain.name, chain.ws_url, chain.http_url
    ));
    if let Some(workflow) = workflow {
        out.push_str(&format!(
            "
[EVM.Workflow]
FromAddress = '{}'
ForwarderAddress = '{}'
GasLimitDefault = 400_000
TxAcceptanceState = 2
PollPeriod = '2s'
AcceptanceTimeout = '30s'

[EVM.Transactions]
ForwardersEnabled = true
",
            workflow.from_address, workflow.forwarder_address
        ));
    }
    out
}

fn external_registry(registry_address: &str, home_chain_id: u64) -> String {
    format!(
        "
[Capabilities.ExternalRegistry]
Address = '{registry_address}'
NetworkID = 'evm'
ChainID = '{home_chain_id}'
"
    )
}

/// Bootstrap node: points at itself for OCR peering
pub(crate) fn bootstrap_evm(
    own_peer_id: &str,
    home_chain_id: u64,
    registry_address: &str,
    chains: &[&EvmChainConfig],
) -> String {
    let mut out = String::from(FEATURES);
    out.push_str(&format!(
        "
[P2P.V2]
Enabled = true
ListenAddresses = ['0.0.0.0:5001']
DefaultBootstrappers = ['{own_peer_id}@localhost:5001']
"
    ));
    for chain in chains {
        out.push_str(&evm_chain(chain, false, None));
    }
    out.push_str(&external_registry(registry_address, home_chain_id));
    out
}

/// Bootstrap node of the workflow DON: serves don2don peering on itself
pub(crate) fn bootstrap_don2don_peering(peering: &PeeringData) -> String {
    format!(
        "
[Capabilities.Peering.V2]
Enabled = true
ListenAddresses = ['0.0.0.0:6690']
DefaultBootstrappers = ['{}@localhost:{}']
",
        peering.global_bootstrapper_peer_id.raw(),
        peering.port
    )
}

/// Worker node: OCR peering through the DON bootstrap, capabilities peering
/// through the global bootstrap
pub(crate) fn worker_evm(
    ocr: &OcrPeeringData,
    peering: &PeeringData,
    registry_address: &str,
    home_chain_id: u64,
    chains: &[(&EvmChainConfig, Option<EvmWorkflow<'_>>)],
) -> String {
    let mut out = String::from(FEATURES);
    out.push_str(&format!(
        "
[P2P.V2]
Enabled = true
ListenAddresses = ['0.0.0.0:5001']
DefaultBootstrappers = ['{}']

[Capabilities.Peering.V2]
Enabled = true
ListenAddresses = ['0.0.0.0:6690']
DefaultBootstrappers = ['{}']
",
        ocr.locator(),
        peering.locator()
    ));
    for (chain, workflow) in chains {
        out.push_str(&evm_chain(chain, true, workflow.as_ref()));
    }
    out.push_str(&external_registry(registry_address, home_chain_id));
    out
}

/// Node of a DON that only hosts the gateway
pub(crate) fn gateway_only(chains: &[&EvmChainConfig]) -> String {
    let mut out = String::from(FEATURES);
    for chain in chains {
        out.push_str(&evm_chain(chain, false, None));
    }
    out
}

pub(crate) fn worker_solana(chain: &SolanaChainConfig) -> String {
    format!(
        "
[[Solana]]
ChainID = '{}'
Enabled = true

[[Solana.Nodes]]
Name = '{}'
URL = '{}'
",
        chain.chain_id, chain.name, chain.http_url
    )
}

pub(crate) fn worker_solana_writer(from_address: &str, forwarder_program: &str) -> String {
    format!(
        "
[Solana.Workflow]
FromAddress = '{from_address}'
ForwarderProgramID = '{forwarder_program}'
PollPeriod = '2s'
AcceptanceTimeout = '30s'
"
    )
}

pub(crate) fn worker_workflow_registry(registry_address: &str, home_chain_id: u64) -> String {
    format!(
        "
[Capabilities.WorkflowRegistry]
Address = '{registry_address}'
NetworkID = 'evm'
ChainID = '{home_chain_id}'
"
    )
}

pub(crate) fn worker_gateway(
    node_address: &str,
    home_chain_id: u64,
    don_name: &str,
    gateway: &GatewayConnectorOutput,
) -> String {
    format!(
        "
[Capabilities.GatewayConnector]
DonID = '{don_name}'
ChainIDForNodeKey = '{home_chain_id}'
NodeAddress = '{node_address}'

[[Capabilities.GatewayConnector.Gateways]]
Id = 'gateway0'
URL = '{}'
",
        gateway.node_url()
    )
}

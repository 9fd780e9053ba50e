//! External collaborator interfaces
//!
//! Every system the engine talks to (chains, contract tooling, node
//! containers, the Job Distributor) sits behind an `async_trait` trait held
//! as `Arc<dyn Trait>`. Stages depend only on these traits.

use crate::chain::{AddressBook, BlockchainInput, SignedTransfer, WrappedBlockchainOutput};
use crate::error::ProviderError;
use crate::flags::CapabilityFlag;
use crate::infra::NodeRole;
use crate::keys::PeerId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Starts chains
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlockchainProvisioner: Send + Sync {
    /// Start one chain and return its endpoints and client
    async fn start(
        &self,
        input: &BlockchainInput,
        cancel: &CancellationToken,
    ) -> Result<WrappedBlockchainOutput, ProviderError>;
}

/// EVM client bound to the shared funding key
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EvmClient: Send + Sync {
    /// Chain id
    fn chain_id(&self) -> u64;

    /// Address of the funding key
    fn funding_address(&self) -> String;

    /// Pending nonce of the funding key
    async fn pending_nonce(&self, cancel: &CancellationToken) -> Result<u64, ProviderError>;

    /// Send a value transfer and wait for it to be mined; returns the tx hash
    async fn send_value(
        &self,
        to: &str,
        amount: u128,
        nonce: u64,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError>;
}

/// Solana RPC client
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SolanaClient: Send + Sync {
    /// Genesis hash, identifying the cluster
    async fn genesis_hash(&self) -> Result<String, ProviderError>;

    /// Recent blockhash for transaction signing
    async fn latest_blockhash(&self) -> Result<[u8; 32], ProviderError>;

    /// Submit a signed transfer; returns the signature
    async fn send_transaction(&self, transfer: SignedTransfer) -> Result<String, ProviderError>;
}

/// Workflow registry configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRegistryConfig {
    /// Registry chain
    pub chain_selector: u64,
    /// Registry contract
    pub registry_address: String,
    /// DONs allowed to run workflows
    pub allowed_don_ids: Vec<u32>,
    /// Authorized workflow owners
    pub workflow_owners: Vec<String>,
}

/// Capability registered for a DON
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCapability {
    /// Labelled name
    pub labelled_name: String,
    /// Version
    pub version: String,
    /// Capability type (0 trigger, 1 action, 2 consensus, 3 target)
    pub capability_type: u8,
    /// Response type (0 report, 1 observation identical)
    pub response_type: u8,
}

/// DON registration in the capabilities registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonCapabilities {
    /// Registered name
    pub name: String,
    /// Fault tolerance
    pub f: u8,
    /// Node operator name
    pub nop: String,
    /// Worker peer ids
    pub peer_ids: Vec<PeerId>,
    /// Hosted capabilities
    pub capabilities: Vec<RegistryCapability>,
}

/// OCR3 oracle configuration
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ocr3Config {
    pub delta_progress_ms: u32,
    pub delta_resend_ms: u32,
    pub delta_initial_ms: u32,
    pub delta_round_ms: u32,
    pub delta_grace_ms: u32,
    pub delta_certified_commit_request_ms: u32,
    pub delta_stage_ms: u32,
    pub max_rounds_per_epoch: u64,
    pub transmission_schedule: Vec<usize>,
    pub max_duration_query_ms: u32,
    pub max_duration_observation_ms: u32,
    pub max_duration_should_accept_ms: u32,
    pub max_duration_should_transmit_ms: u32,
    pub max_faulty_oracles: u8,
    pub max_query_length_bytes: u32,
    pub max_observation_length_bytes: u32,
    pub max_report_length_bytes: u32,
    pub max_batch_size: u32,
    pub unique_reports: bool,
}

impl Ocr3Config {
    /// Defaults with every worker transmitting
    #[must_use]
    pub fn with_workers(workers: usize) -> Self {
        Self {
            delta_progress_ms: 5000,
            delta_resend_ms: 5000,
            delta_initial_ms: 5000,
            delta_round_ms: 2000,
            delta_grace_ms: 500,
            delta_certified_commit_request_ms: 1000,
            delta_stage_ms: 30000,
            max_rounds_per_epoch: 10,
            transmission_schedule: vec![workers],
            max_duration_query_ms: 1000,
            max_duration_observation_ms: 1000,
            max_duration_should_accept_ms: 1000,
            max_duration_should_transmit_ms: 1000,
            max_faulty_oracles: 1,
            max_query_length_bytes: 1_000_000,
            max_observation_length_bytes: 1_000_000,
            max_report_length_bytes: 1_000_000,
            max_batch_size: 1000,
            unique_reports: true,
        }
    }
}

/// Keystone contract configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeystoneConfig {
    /// Registry chain
    pub chain_selector: u64,
    /// Deployed contracts
    pub addresses: AddressBook,
    /// DONs to register
    pub dons: Vec<DonCapabilities>,
    /// OCR3 oracle config
    pub ocr3: Ocr3Config,
}

/// Deploys and configures contracts
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContractDeployer: Send + Sync {
    /// Deploy registry contracts on the home chain and forwarders on every
    /// listed chain
    async fn deploy_keystone(
        &self,
        registry_selector: u64,
        forwarder_selectors: &[u64],
        cancel: &CancellationToken,
    ) -> Result<AddressBook, ProviderError>;

    /// Configure the workflow registry
    async fn configure_workflow_registry(
        &self,
        config: &WorkflowRegistryConfig,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError>;

    /// Register DONs, capabilities and OCR3 config
    async fn configure_keystone(
        &self,
        config: &KeystoneConfig,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError>;
}

/// One node to launch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeLaunchSpec {
    /// Position in the DON
    pub index: usize,
    /// Bootstrap or worker
    pub role: NodeRole,
    /// Internal host
    pub host: String,
    /// Image with tag
    pub image: String,
    /// Config overlay TOML
    pub config: String,
    /// Secrets TOML
    pub secrets: String,
    /// Environment
    pub env_vars: BTreeMap<String, String>,
}

/// A DON's node set, ready to launch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSetSpec {
    /// Node set name
    pub name: String,
    /// DON id
    pub don_id: u32,
    /// Nodes in index order
    pub nodes: Vec<NodeLaunchSpec>,
    /// Host ports to expose besides the defaults
    pub extra_allowed_ports: Vec<u16>,
}

/// Node health check entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Check name
    pub name: String,
    /// "passing" or "failing"
    pub status: String,
    /// Details
    #[serde(default)]
    pub output: String,
}

/// Log-poller filter registered by a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterInfo {
    /// Filter name
    pub name: String,
    /// Watched event signatures
    pub event_sigs: Vec<String>,
    /// Watched addresses
    #[serde(default)]
    pub addresses: Vec<String>,
}

/// Job proposed by the Job Distributor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProposal {
    /// Proposal id
    pub id: String,
    /// JD node id
    pub node_id: String,
    /// Job spec TOML
    pub spec: String,
}

/// Node operator API
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeApi: Send + Sync {
    /// CSA public key used to register with the Job Distributor
    async fn csa_public_key(&self) -> Result<String, ProviderError>;

    /// Current health checks
    async fn health_checks(&self) -> Result<Vec<HealthCheck>, ProviderError>;

    /// Log-poller filters on a chain
    async fn registered_filters(&self, chain_id: u64) -> Result<Vec<FilterInfo>, ProviderError>;

    /// Accept a proposed job
    async fn accept_job(&self, proposal: &JobProposal) -> Result<(), ProviderError>;
}

/// Started node handle
#[derive(Clone)]
pub struct StartedNode {
    /// Container/pod name
    pub name: String,
    /// Internal host
    pub host: String,
    /// URL reachable from the test process
    pub external_url: String,
    /// Operator API
    pub api: Arc<dyn NodeApi>,
}

impl fmt::Debug for StartedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartedNode")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("external_url", &self.external_url)
            .finish_non_exhaustive()
    }
}

/// Started node set
#[derive(Debug, Clone)]
pub struct NodeSetOutput {
    /// Node set name
    pub name: String,
    /// Nodes in index order
    pub nodes: Vec<StartedNode>,
}

/// Launches node sets
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeSetLauncher: Send + Sync {
    /// Start every node of a set
    async fn start(
        &self,
        spec: &NodeSetSpec,
        registry_chain: &WrappedBlockchainOutput,
        cancel: &CancellationToken,
    ) -> Result<NodeSetOutput, ProviderError>;
}

/// Job Distributor settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JdInput {
    /// Image with tag
    #[serde(default)]
    pub image: String,
    /// Environment
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
}

/// Node registration request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRegistration {
    /// Node name
    pub name: String,
    /// CSA public key
    pub public_key: String,
    /// Labels
    pub labels: BTreeMap<String, String>,
}

/// Job Distributor client
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobDistributor: Send + Sync {
    /// Register a node; returns the JD node id
    async fn register_node(&self, registration: &NodeRegistration) -> Result<String, ProviderError>;

    /// Propose a job to a node
    async fn propose_job(&self, node_id: &str, spec: &str) -> Result<JobProposal, ProviderError>;
}

/// Started Job Distributor
#[derive(Clone)]
pub struct JdOutput {
    /// gRPC URL reachable from the test process
    pub external_grpc_url: String,
    /// WSRPC URL reachable from nodes
    pub internal_wsrpc_url: String,
    /// Client
    pub client: Arc<dyn JobDistributor>,
}

impl fmt::Debug for JdOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JdOutput")
            .field("external_grpc_url", &self.external_grpc_url)
            .field("internal_wsrpc_url", &self.internal_wsrpc_url)
            .finish_non_exhaustive()
    }
}

/// Launches the Job Distributor
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobDistributorLauncher: Send + Sync {
    /// Start the Job Distributor
    async fn start(&self, input: &JdInput, cancel: &CancellationToken) -> Result<JdOutput, ProviderError>;
}

/// Capability registered for a flag on a chain, if the flag maps to one
#[must_use]
pub fn registry_capability(flag: CapabilityFlag, chain_id: u64) -> Option<RegistryCapability> {
    let capability = |name: String, capability_type: u8, response_type: u8| RegistryCapability {
        labelled_name: name,
        version: "1.0.0".to_string(),
        capability_type,
        response_type,
    };

    match flag {
        CapabilityFlag::Workflow | CapabilityFlag::Gateway | CapabilityFlag::Capabilities => None,
        CapabilityFlag::Ocr3 => Some(capability("offchain_reporting".into(), 2, 0)),
        CapabilityFlag::Cron => Some(capability("cron-trigger".into(), 0, 0)),
        CapabilityFlag::CustomCompute => Some(capability("custom-compute".into(), 1, 0)),
        CapabilityFlag::WebApiTrigger => Some(capability("web-api-trigger".into(), 0, 0)),
        CapabilityFlag::WebApiTarget => Some(capability("web-api-target".into(), 3, 1)),
        CapabilityFlag::WriteEvm => Some(capability(format!("write_evm-{chain_id}"), 3, 1)),
        CapabilityFlag::WriteSolana => Some(capability(format!("write_solana-{chain_id}"), 3, 1)),
        CapabilityFlag::LogTrigger => Some(capability(format!("log-event-trigger-evm-{chain_id}"), 0, 0)),
        CapabilityFlag::ReadContract => Some(capability(format!("read-contract-evm-{chain_id}"), 1, 0)),
        CapabilityFlag::Vault => Some(capability("vault".into(), 1, 0)),
        CapabilityFlag::HttpTrigger => Some(capability("http-trigger".into(), 0, 0)),
        CapabilityFlag::HttpAction => Some(capability("http-actions".into(), 1, 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn don_types_register_no_capability() {
        for flag in CapabilityFlag::ALL.into_iter().filter(|flag| flag.is_don_type()) {
            assert!(registry_capability(flag, 1337).is_none());
        }
    }

    #[test]
    fn chain_scoped_capabilities_carry_chain_id() {
        let write = registry_capability(CapabilityFlag::WriteEvm, 1337).unwrap();
        assert_eq!(write.labelled_name, "write_evm-1337");
        assert_eq!(write.capability_type, 3);

        let ocr = registry_capability(CapabilityFlag::Ocr3, 1337).unwrap();
        assert_eq!(ocr.capability_type, 2);
    }

    #[test]
    fn default_ocr3_config_schedules_all_workers() {
        let config = Ocr3Config::with_workers(3);
        assert_eq!(config.transmission_schedule, vec![3]);
        assert_eq!(config.delta_stage_ms, 30000);
    }
}

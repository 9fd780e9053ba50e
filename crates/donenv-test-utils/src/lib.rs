//! Testing utilities for the donenv workspace
//!
//! In-memory fakes of every collaborator trait plus fixture builders for
//! node sets and pipeline inputs.

#![allow(missing_docs)]

use async_trait::async_trait;
use donenv_core::chain::{
    AddressBook, BlockchainInput, ChainClient, ChainEndpoints, ChainFamily, ContractKind, SignedTransfer,
    WrappedBlockchainOutput,
};
use donenv_core::cleanup::ContainerCleaner;
use donenv_core::error::{ProviderError, ShellError};
use donenv_core::keys::SolanaKeypair;
use donenv_core::pipeline::{Collaborators, SetupInput, VerificationSettings};
use donenv_core::provider::{
    BlockchainProvisioner, ContractDeployer, EvmClient, FilterInfo, HealthCheck, JdInput, JdOutput, JobDistributor,
    JobDistributorLauncher, JobProposal, KeystoneConfig, NodeApi, NodeRegistration, NodeSetLauncher, NodeSetOutput,
    NodeSetSpec, SolanaClient, StartedNode, WorkflowRegistryConfig,
};
use donenv_core::shell::{ShellCommand, ShellRunner};
use donenv_core::stages::{default_job_spec_factories, FundingAmounts, HealthWaitInput, LinkJdInput};
use donenv_core::{CapabilityFlag, InfraInput, NodeSetInput};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const HOME_CHAIN_ID: u64 = 1337;
pub const HOME_CHAIN_SELECTOR: u64 = 3_379_446_385_462_418_246;
pub const FUNDING_ADDRESS: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentValue {
    pub to: String,
    pub amount: u128,
    pub nonce: u64,
}

/// EVM chain that accepts every transfer
#[derive(Debug)]
pub struct FakeEvmClient {
    chain_id: u64,
    pending: AtomicU64,
    pub sent: Mutex<Vec<SentValue>>,
}

impl FakeEvmClient {
    pub fn new(chain_id: u64, pending_nonce: u64) -> Self {
        Self {
            chain_id,
            pending: AtomicU64::new(pending_nonce),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent_nonces(&self) -> Vec<u64> {
        let mut nonces: Vec<u64> = self.sent.lock().iter().map(|sent| sent.nonce).collect();
        nonces.sort_unstable();
        nonces
    }
}

#[async_trait]
impl EvmClient for FakeEvmClient {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn funding_address(&self) -> String {
        FUNDING_ADDRESS.to_string()
    }

    async fn pending_nonce(&self, _cancel: &CancellationToken) -> Result<u64, ProviderError> {
        Ok(self.pending.load(Ordering::SeqCst))
    }

    async fn send_value(
        &self,
        to: &str,
        amount: u128,
        nonce: u64,
        _cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        self.sent.lock().push(SentValue {
            to: to.to_string(),
            amount,
            nonce,
        });
        Ok(format!("0x{:064x}", nonce))
    }
}

/// Solana cluster that accepts every transfer
#[derive(Debug, Default)]
pub struct FakeSolanaClient {
    pub sent: Mutex<Vec<SignedTransfer>>,
}

#[async_trait]
impl SolanaClient for FakeSolanaClient {
    async fn genesis_hash(&self) -> Result<String, ProviderError> {
        Ok("5eykt4UsFv8P8NJdTREpY1vzqKqZKvdpKuc147dw2N9d".to_string())
    }

    async fn latest_blockhash(&self) -> Result<[u8; 32], ProviderError> {
        Ok([7; 32])
    }

    async fn send_transaction(&self, transfer: SignedTransfer) -> Result<String, ProviderError> {
        let id = transfer.id();
        self.sent.lock().push(transfer);
        Ok(id)
    }
}

/// Starts fake chains and keeps their clients for inspection
#[derive(Debug, Default)]
pub struct FakeBlockchainProvisioner {
    pub pending_nonce: u64,
    pub evm: Mutex<BTreeMap<u64, Arc<FakeEvmClient>>>,
    pub solana: Mutex<BTreeMap<u64, Arc<FakeSolanaClient>>>,
}

impl FakeBlockchainProvisioner {
    pub fn evm_client(&self, chain_id: u64) -> Option<Arc<FakeEvmClient>> {
        self.evm.lock().get(&chain_id).cloned()
    }

    pub fn solana_client(&self, chain_id: u64) -> Option<Arc<FakeSolanaClient>> {
        self.solana.lock().get(&chain_id).cloned()
    }
}

pub fn endpoints(chain_id: u64) -> ChainEndpoints {
    ChainEndpoints {
        external_http_url: format!("http://localhost:{chain_id}"),
        external_ws_url: format!("ws://localhost:{chain_id}"),
        internal_http_url: format!("http://blockchain-{chain_id}:8545"),
        internal_ws_url: format!("ws://blockchain-{chain_id}:8546"),
    }
}

#[async_trait]
impl BlockchainProvisioner for FakeBlockchainProvisioner {
    async fn start(
        &self,
        input: &BlockchainInput,
        _cancel: &CancellationToken,
    ) -> Result<WrappedBlockchainOutput, ProviderError> {
        let client = match input.family {
            ChainFamily::Evm => {
                let client = Arc::new(FakeEvmClient::new(input.chain_id, self.pending_nonce));
                self.evm.lock().insert(input.chain_id, Arc::clone(&client));
                ChainClient::Evm(client)
            }
            ChainFamily::Solana => {
                let client = Arc::new(FakeSolanaClient::default());
                self.solana.lock().insert(input.chain_id, Arc::clone(&client));
                let seed = u8::try_from(input.chain_id % 251).unwrap_or(1);
                ChainClient::Solana {
                    client,
                    funder: Arc::new(SolanaKeypair::from_secret(&[seed; 32])),
                }
            }
        };

        Ok(WrappedBlockchainOutput {
            chain_id: input.chain_id,
            chain_selector: input.chain_selector,
            read_only: input.read_only,
            endpoints: endpoints(input.chain_id),
            client,
        })
    }
}

/// Deploys contracts at predictable addresses and records configuration
#[derive(Debug, Default)]
pub struct FakeContractDeployer {
    pub workflow_registry: Mutex<Vec<WorkflowRegistryConfig>>,
    pub keystone: Mutex<Vec<KeystoneConfig>>,
}

#[async_trait]
impl ContractDeployer for FakeContractDeployer {
    async fn deploy_keystone(
        &self,
        registry_selector: u64,
        forwarder_selectors: &[u64],
        _cancel: &CancellationToken,
    ) -> Result<AddressBook, ProviderError> {
        let mut book = AddressBook::new();
        book.insert(registry_selector, ContractKind::CapabilitiesRegistry, "0x00000000000000000000000000000000000000c1");
        book.insert(registry_selector, ContractKind::WorkflowRegistry, "0x00000000000000000000000000000000000000c2");
        book.insert(registry_selector, ContractKind::Ocr3Capability, "0x00000000000000000000000000000000000000c3");
        for selector in forwarder_selectors {
            book.insert(*selector, ContractKind::KeystoneForwarder, format!("0x{:040x}", selector % 0xffff));
        }
        Ok(book)
    }

    async fn configure_workflow_registry(
        &self,
        config: &WorkflowRegistryConfig,
        _cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        self.workflow_registry.lock().push(config.clone());
        Ok(())
    }

    async fn configure_keystone(&self, config: &KeystoneConfig, _cancel: &CancellationToken) -> Result<(), ProviderError> {
        self.keystone.lock().push(config.clone());
        Ok(())
    }
}

/// Node that is healthy and tracks every workflow registry event
#[derive(Debug, Default)]
pub struct FakeNodeApi {
    pub name: String,
    pub accepted: Mutex<Vec<JobProposal>>,
}

#[async_trait]
impl NodeApi for FakeNodeApi {
    async fn csa_public_key(&self) -> Result<String, ProviderError> {
        Ok(format!("csa_{}", self.name))
    }

    async fn health_checks(&self) -> Result<Vec<HealthCheck>, ProviderError> {
        Ok(vec![HealthCheck {
            name: format!("EVM.{HOME_CHAIN_ID}.OCR3.ConfigWatcher"),
            status: "passing".to_string(),
            output: String::new(),
        }])
    }

    async fn registered_filters(&self, _chain_id: u64) -> Result<Vec<FilterInfo>, ProviderError> {
        Ok(vec![FilterInfo {
            name: "WorkflowRegistry-events".to_string(),
            event_sigs: (0..6).map(|i| format!("0x{i:064x}")).collect(),
            addresses: Vec::new(),
        }])
    }

    async fn accept_job(&self, proposal: &JobProposal) -> Result<(), ProviderError> {
        self.accepted.lock().push(proposal.clone());
        Ok(())
    }
}

/// Starts fake nodes and keeps them for inspection
#[derive(Debug, Default)]
pub struct FakeNodeSetLauncher {
    pub specs: Mutex<Vec<NodeSetSpec>>,
    pub nodes: Mutex<BTreeMap<String, Arc<FakeNodeApi>>>,
}

impl FakeNodeSetLauncher {
    pub fn node(&self, name: &str) -> Option<Arc<FakeNodeApi>> {
        self.nodes.lock().get(name).cloned()
    }
}

#[async_trait]
impl NodeSetLauncher for FakeNodeSetLauncher {
    async fn start(
        &self,
        spec: &NodeSetSpec,
        _registry_chain: &WrappedBlockchainOutput,
        _cancel: &CancellationToken,
    ) -> Result<NodeSetOutput, ProviderError> {
        self.specs.lock().push(spec.clone());
        let nodes = spec
            .nodes
            .iter()
            .map(|node| {
                let name = format!("{}-node{}", spec.name, node.index);
                let api = Arc::new(FakeNodeApi {
                    name: name.clone(),
                    accepted: Mutex::new(Vec::new()),
                });
                self.nodes.lock().insert(name.clone(), Arc::clone(&api));
                StartedNode {
                    name,
                    host: node.host.clone(),
                    external_url: format!("http://localhost:{}", 10_000 + node.index),
                    api,
                }
            })
            .collect();

        Ok(NodeSetOutput {
            name: spec.name.clone(),
            nodes,
        })
    }
}

/// Job Distributor that hands out sequential ids
#[derive(Debug, Default)]
pub struct FakeJobDistributor {
    pub registrations: Mutex<Vec<NodeRegistration>>,
    pub proposals: Mutex<Vec<JobProposal>>,
}

#[async_trait]
impl JobDistributor for FakeJobDistributor {
    async fn register_node(&self, registration: &NodeRegistration) -> Result<String, ProviderError> {
        let mut registrations = self.registrations.lock();
        registrations.push(registration.clone());
        Ok(format!("node_{}", registrations.len()))
    }

    async fn propose_job(&self, node_id: &str, spec: &str) -> Result<JobProposal, ProviderError> {
        let mut proposals = self.proposals.lock();
        let proposal = JobProposal {
            id: format!("proposal_{}", proposals.len() + 1),
            node_id: node_id.to_string(),
            spec: spec.to_string(),
        };
        proposals.push(proposal.clone());
        Ok(proposal)
    }
}

/// Launches one shared fake Job Distributor
#[derive(Debug, Default)]
pub struct FakeJdLauncher {
    pub client: Arc<FakeJobDistributor>,
}

#[async_trait]
impl JobDistributorLauncher for FakeJdLauncher {
    async fn start(&self, _input: &JdInput, _cancel: &CancellationToken) -> Result<JdOutput, ProviderError> {
        Ok(JdOutput {
            external_grpc_url: "localhost:14231".to_string(),
            internal_wsrpc_url: "jd:8080".to_string(),
            client: Arc::clone(&self.client) as Arc<dyn JobDistributor>,
        })
    }
}

/// Shell that answers commands from a script and records every call
///
/// A command matches a scripted entry when its command line contains the
/// entry's key; the first match wins. Unmatched commands exit with code 1.
#[derive(Debug, Default)]
pub struct ScriptedShell {
    responses: Vec<(String, Result<String, i32>)>,
    calls: Mutex<Vec<ShellCommand>>,
}

impl ScriptedShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, key: &str, stdout: &str) -> Self {
        self.responses.push((key.to_string(), Ok(stdout.to_string())));
        self
    }

    pub fn fail(mut self, key: &str, code: i32) -> Self {
        self.responses.push((key.to_string(), Err(code)));
        self
    }

    pub fn calls(&self) -> Vec<ShellCommand> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ShellRunner for ScriptedShell {
    async fn run(&self, command: &ShellCommand, _cancel: &CancellationToken) -> Result<String, ShellError> {
        self.calls.lock().push(command.clone());
        let line = command.to_string();

        match self.responses.iter().find(|(key, _)| line.contains(key.as_str())) {
            Some((_, Ok(stdout))) => Ok(stdout.clone()),
            Some((_, Err(code))) => Err(ShellError::CommandFailed {
                command: line,
                code: *code,
                stderr: String::new(),
            }),
            None => Err(ShellError::CommandFailed {
                command: line,
                code: 1,
                stderr: "no scripted response".to_string(),
            }),
        }
    }
}

/// Cleaner with nothing to remove
#[derive(Debug, Default)]
pub struct FakeCleaner {
    fail: bool,
    calls: AtomicUsize,
}

impl FakeCleaner {
    pub fn failing() -> Self {
        Self {
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerCleaner for FakeCleaner {
    async fn remove_test_containers(&self, _cancel: &CancellationToken) -> Result<usize, ShellError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ShellError::CommandFailed {
                command: "docker ps -aq".to_string(),
                code: 1,
                stderr: "Cannot connect to the Docker daemon".to_string(),
            });
        }
        Ok(0)
    }
}

/// Every fake, kept for assertions after the pipeline ran
#[derive(Debug, Default, Clone)]
pub struct FakeEnvironment {
    pub blockchains: Arc<FakeBlockchainProvisioner>,
    pub contracts: Arc<FakeContractDeployer>,
    pub node_sets: Arc<FakeNodeSetLauncher>,
    pub jd: Arc<FakeJdLauncher>,
}

impl FakeEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            blockchains: Arc::clone(&self.blockchains) as Arc<dyn BlockchainProvisioner>,
            contracts: Arc::clone(&self.contracts) as Arc<dyn ContractDeployer>,
            node_sets: Arc::clone(&self.node_sets) as Arc<dyn NodeSetLauncher>,
            jd: Arc::clone(&self.jd) as Arc<dyn JobDistributorLauncher>,
        }
    }
}

/// A `workflow` DON with the gateway on node 0
pub fn workflow_node_set(nodes: usize) -> NodeSetInput {
    NodeSetInput::new("workflow", nodes)
        .with_don_types([CapabilityFlag::Workflow, CapabilityFlag::Gateway])
        .with_capabilities([CapabilityFlag::Ocr3, CapabilityFlag::Cron])
        .with_image("chainlink:2.23.0")
}

/// Workflow, capabilities and gateway DONs
pub fn full_node_sets() -> Vec<NodeSetInput> {
    vec![
        NodeSetInput::new("workflow", 5)
            .with_don_types([CapabilityFlag::Workflow])
            .with_capabilities([CapabilityFlag::Ocr3, CapabilityFlag::Cron, CapabilityFlag::CustomCompute])
            .with_image("chainlink:2.23.0"),
        NodeSetInput::new("capabilities", 3)
            .with_don_types([CapabilityFlag::Capabilities])
            .with_capabilities([CapabilityFlag::WriteEvm])
            .with_image("chainlink:2.23.0"),
        NodeSetInput::new("gateway", 1)
            .with_don_types([CapabilityFlag::Gateway])
            .with_bootstrap_index(-1)
            .with_gateway_index(0)
            .with_image("chainlink:2.23.0"),
    ]
}

/// Pipeline input with fast polling, one home chain and the given DONs
pub fn setup_input(node_sets: Vec<NodeSetInput>) -> SetupInput {
    SetupInput {
        blockchains: vec![BlockchainInput::evm(HOME_CHAIN_ID, HOME_CHAIN_SELECTOR)],
        home_chain_selector: HOME_CHAIN_SELECTOR,
        node_sets,
        jd: JdInput {
            image: "job-distributor:0.9.0".to_string(),
            env_vars: BTreeMap::new(),
        },
        infra: InfraInput::Docker,
        key_password: "password".to_string(),
        funding: FundingAmounts::default(),
        transformers: Vec::new(),
        job_factories: default_job_spec_factories(),
        extra_allowed_ports: Vec::new(),
        link: LinkJdInput {
            attempts: 1,
            backoff: Duration::from_millis(1),
        },
        health: HealthWaitInput {
            attempts: 3,
            interval: Duration::from_millis(1),
        },
        verification: VerificationSettings {
            interval: Duration::from_millis(5),
            timeout: Duration::from_secs(5),
        },
        ocr3: None,
    }
}

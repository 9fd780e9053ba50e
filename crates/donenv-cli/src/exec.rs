//! Collaborators backed by an external program
//!
//! Every call runs `<backend> <area> <action>` with the JSON request in the
//! `DONENV_REQUEST` environment variable and reads a JSON response from
//! stdout. Infrastructure tooling plugs in by implementing that protocol.

use async_trait::async_trait;
use donenv_core::chain::{
    AddressBook, BlockchainInput, ChainClient, ChainEndpoints, ChainFamily, SignedTransfer, WrappedBlockchainOutput,
};
use donenv_core::crib::{CribConnector, CribJdOutput, CribNodeOutput};
use donenv_core::keys::SolanaKeypair;
use donenv_core::provider::{
    BlockchainProvisioner, ContractDeployer, EvmClient, FilterInfo, HealthCheck, JdInput, JdOutput, JobDistributor,
    JobDistributorLauncher, JobProposal, KeystoneConfig, NodeApi, NodeRegistration, NodeSetLauncher, NodeSetOutput,
    NodeSetSpec, SolanaClient, StartedNode, WorkflowRegistryConfig,
};
use donenv_core::shell::{ShellCommand, ShellRunner};
use donenv_core::{ProviderError, ShellError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Environment variable carrying the JSON request
pub const REQUEST_ENV: &str = "DONENV_REQUEST";

/// Runs backend commands
#[derive(Clone)]
pub struct ExecBackend {
    shell: Arc<dyn ShellRunner>,
    program: String,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ExecBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecBackend")
            .field("program", &self.program)
            .finish_non_exhaustive()
    }
}

impl ExecBackend {
    /// Create a backend; `cancel` bounds calls that take no token of their own
    #[must_use]
    pub fn new(shell: Arc<dyn ShellRunner>, program: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            shell,
            program: program.into(),
            cancel,
        }
    }

    /// The backend command for one call
    #[must_use]
    pub fn command(&self, area: &str, action: &str, request: String) -> ShellCommand {
        ShellCommand::new(self.program.as_str())
            .args([area, action])
            .env(REQUEST_ENV, request)
    }

    async fn call<Req, Resp>(
        &self,
        component: &'static str,
        action: &str,
        request: &Req,
        cancel: &CancellationToken,
    ) -> Result<Resp, ProviderError>
    where
        Req: Serialize + ?Sized + Sync,
        Resp: DeserializeOwned,
    {
        let request = serde_json::to_string(request)
            .map_err(|err| ProviderError::failed(component, format!("encoding {action} request: {err}")))?;
        let command = self.command(component, action, request);

        let stdout = self.shell.run(&command, cancel).await.map_err(|err| {
            let reason = match &err {
                ShellError::Cancelled(_) => return ProviderError::Cancelled(component),
                ShellError::CommandFailed { stderr, .. } if !stderr.trim().is_empty() => {
                    format!("{action}: {err}: {}", stderr.trim())
                }
                _ => format!("{action}: {err}"),
            };
            ProviderError::failed(component, reason)
        })?;

        let body = stdout.trim();
        let body = if body.is_empty() { "null" } else { body };
        serde_json::from_str(body).map_err(|err| ProviderError::InvalidResponse {
            component,
            reason: format!("{action}: {err}"),
        })
    }

    async fn connect_chain(
        &self,
        input: &BlockchainInput,
        endpoints: ChainEndpoints,
        cancel: &CancellationToken,
    ) -> Result<WrappedBlockchainOutput, ProviderError> {
        let client = match input.family {
            ChainFamily::Evm => {
                let response: AddressResponse = self
                    .call("evm", "funding-address", &json!({ "chain_id": input.chain_id }), cancel)
                    .await?;
                ChainClient::Evm(Arc::new(ExecEvmClient {
                    backend: self.clone(),
                    chain_id: input.chain_id,
                    funding_address: response.address,
                }))
            }
            ChainFamily::Solana => {
                let response: FunderResponse = self
                    .call("solana", "funder", &json!({ "chain_id": input.chain_id }), cancel)
                    .await?;
                ChainClient::Solana {
                    client: Arc::new(ExecSolanaClient {
                        backend: self.clone(),
                        chain_id: input.chain_id,
                    }),
                    funder: Arc::new(response.keypair()?),
                }
            }
        };

        Ok(WrappedBlockchainOutput {
            chain_id: input.chain_id,
            chain_selector: input.chain_selector,
            read_only: input.read_only,
            endpoints,
            client,
        })
    }

    fn node_client(&self, node: &CribNodeOutput) -> Arc<dyn NodeApi> {
        Arc::new(ExecNodeApi {
            backend: self.clone(),
            node: node.name.clone(),
            url: node.external_url.clone(),
        })
    }

    fn jd_client(&self, grpc_url: &str) -> Arc<dyn JobDistributor> {
        Arc::new(ExecJobDistributor {
            backend: self.clone(),
            grpc_url: grpc_url.to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChainResponse {
    endpoints: ChainEndpoints,
}

#[derive(Debug, Deserialize)]
struct AddressResponse {
    address: String,
}

#[derive(Debug, Deserialize)]
struct FunderResponse {
    /// Hex-encoded 32-byte ed25519 seed
    secret: String,
}

impl FunderResponse {
    fn keypair(&self) -> Result<SolanaKeypair, ProviderError> {
        let invalid = |reason: String| ProviderError::InvalidResponse {
            component: "solana",
            reason,
        };
        let bytes = hex::decode(self.secret.trim_start_matches("0x")).map_err(|err| invalid(err.to_string()))?;
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|bytes: Vec<u8>| invalid(format!("funder secret has {} bytes, expected 32", bytes.len())))?;
        Ok(SolanaKeypair::from_secret(&secret))
    }
}

#[derive(Debug, Deserialize)]
struct NonceResponse {
    nonce: u64,
}

#[derive(Debug, Deserialize)]
struct TxResponse {
    tx_hash: String,
}

#[derive(Debug, Deserialize)]
struct HashResponse {
    hash: String,
}

#[derive(Debug, Deserialize)]
struct SignatureResponse {
    signature: String,
}

#[derive(Debug, Deserialize)]
struct NodesResponse {
    nodes: Vec<CribNodeOutput>,
}

#[derive(Debug, Deserialize)]
struct PublicKeyResponse {
    public_key: String,
}

#[derive(Debug, Deserialize)]
struct NodeIdResponse {
    node_id: String,
}

#[async_trait]
impl BlockchainProvisioner for ExecBackend {
    async fn start(
        &self,
        input: &BlockchainInput,
        cancel: &CancellationToken,
    ) -> Result<WrappedBlockchainOutput, ProviderError> {
        let response: ChainResponse = self.call("blockchain", "start", input, cancel).await?;
        self.connect_chain(input, response.endpoints, cancel).await
    }
}

/// EVM chain driven through the backend
#[derive(Debug)]
pub struct ExecEvmClient {
    backend: ExecBackend,
    chain_id: u64,
    funding_address: String,
}

#[async_trait]
impl EvmClient for ExecEvmClient {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn funding_address(&self) -> String {
        self.funding_address.clone()
    }

    async fn pending_nonce(&self, cancel: &CancellationToken) -> Result<u64, ProviderError> {
        let response: NonceResponse = self
            .backend
            .call("evm", "pending-nonce", &json!({ "chain_id": self.chain_id }), cancel)
            .await?;
        Ok(response.nonce)
    }

    async fn send_value(
        &self,
        to: &str,
        amount: u128,
        nonce: u64,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let request = json!({
            "chain_id": self.chain_id,
            "to": to,
            "amount": amount.to_string(),
            "nonce": nonce,
        });
        let response: TxResponse = self.backend.call("evm", "send-value", &request, cancel).await?;
        Ok(response.tx_hash)
    }
}

/// Solana cluster driven through the backend
#[derive(Debug)]
pub struct ExecSolanaClient {
    backend: ExecBackend,
    chain_id: u64,
}

#[async_trait]
impl SolanaClient for ExecSolanaClient {
    async fn genesis_hash(&self) -> Result<String, ProviderError> {
        let response: HashResponse = self
            .backend
            .call("solana", "genesis-hash", &json!({ "chain_id": self.chain_id }), &self.backend.cancel)
            .await?;
        Ok(response.hash)
    }

    async fn latest_blockhash(&self) -> Result<[u8; 32], ProviderError> {
        let response: HashResponse = self
            .backend
            .call("solana", "latest-blockhash", &json!({ "chain_id": self.chain_id }), &self.backend.cancel)
            .await?;
        let invalid = |reason: String| ProviderError::InvalidResponse {
            component: "solana",
            reason,
        };
        let bytes = bs58::decode(&response.hash)
            .into_vec()
            .map_err(|err| invalid(err.to_string()))?;
        bytes
            .try_into()
            .map_err(|bytes: Vec<u8>| invalid(format!("blockhash has {} bytes, expected 32", bytes.len())))
    }

    async fn send_transaction(&self, transfer: SignedTransfer) -> Result<String, ProviderError> {
        let request = json!({
            "chain_id": self.chain_id,
            "transaction": bs58::encode(transfer.to_wire()).into_string(),
        });
        let response: SignatureResponse = self
            .backend
            .call("solana", "send-transaction", &request, &self.backend.cancel)
            .await?;
        Ok(response.signature)
    }
}

#[async_trait]
impl ContractDeployer for ExecBackend {
    async fn deploy_keystone(
        &self,
        registry_selector: u64,
        forwarder_selectors: &[u64],
        cancel: &CancellationToken,
    ) -> Result<AddressBook, ProviderError> {
        let request = json!({
            "registry_selector": registry_selector,
            "forwarder_selectors": forwarder_selectors,
        });
        self.call("contracts", "deploy-keystone", &request, cancel).await
    }

    async fn configure_workflow_registry(
        &self,
        config: &WorkflowRegistryConfig,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        self.call("contracts", "configure-workflow-registry", config, cancel).await
    }

    async fn configure_keystone(&self, config: &KeystoneConfig, cancel: &CancellationToken) -> Result<(), ProviderError> {
        self.call("contracts", "configure-keystone", config, cancel).await
    }
}

#[async_trait]
impl NodeSetLauncher for ExecBackend {
    async fn start(
        &self,
        spec: &NodeSetSpec,
        registry_chain: &WrappedBlockchainOutput,
        cancel: &CancellationToken,
    ) -> Result<NodeSetOutput, ProviderError> {
        let request = json!({
            "spec": spec,
            "registry_chain": {
                "chain_id": registry_chain.chain_id,
                "chain_selector": registry_chain.chain_selector,
                "endpoints": registry_chain.endpoints,
            },
        });
        let response: NodesResponse = self.call("nodeset", "start", &request, cancel).await?;

        Ok(NodeSetOutput {
            name: spec.name.clone(),
            nodes: response
                .nodes
                .iter()
                .map(|node| StartedNode {
                    name: node.name.clone(),
                    host: node.internal_host.clone(),
                    external_url: node.external_url.clone(),
                    api: self.node_client(node),
                })
                .collect(),
        })
    }
}

/// Node operator API reached through the backend
#[derive(Debug)]
pub struct ExecNodeApi {
    backend: ExecBackend,
    node: String,
    url: String,
}

impl ExecNodeApi {
    fn request(&self, extra: serde_json::Value) -> serde_json::Value {
        let mut request = json!({ "node": self.node, "url": self.url });
        if let (Some(request), serde_json::Value::Object(extra)) = (request.as_object_mut(), extra) {
            request.extend(extra);
        }
        request
    }
}

#[async_trait]
impl NodeApi for ExecNodeApi {
    async fn csa_public_key(&self) -> Result<String, ProviderError> {
        let response: PublicKeyResponse = self
            .backend
            .call("node", "csa-key", &self.request(json!({})), &self.backend.cancel)
            .await?;
        Ok(response.public_key)
    }

    async fn health_checks(&self) -> Result<Vec<HealthCheck>, ProviderError> {
        self.backend
            .call("node", "health-checks", &self.request(json!({})), &self.backend.cancel)
            .await
    }

    async fn registered_filters(&self, chain_id: u64) -> Result<Vec<FilterInfo>, ProviderError> {
        self.backend
            .call("node", "filters", &self.request(json!({ "chain_id": chain_id })), &self.backend.cancel)
            .await
    }

    async fn accept_job(&self, proposal: &JobProposal) -> Result<(), ProviderError> {
        self.backend
            .call("node", "accept-job", &self.request(json!({ "proposal": proposal })), &self.backend.cancel)
            .await
    }
}

#[async_trait]
impl JobDistributorLauncher for ExecBackend {
    async fn start(&self, input: &JdInput, cancel: &CancellationToken) -> Result<JdOutput, ProviderError> {
        let response: CribJdOutput = self.call("jd", "start", input, cancel).await?;
        Ok(JdOutput {
            client: self.jd_client(&response.external_grpc_url),
            external_grpc_url: response.external_grpc_url,
            internal_wsrpc_url: response.internal_wsrpc_url,
        })
    }
}

/// Job Distributor reached through the backend
#[derive(Debug)]
pub struct ExecJobDistributor {
    backend: ExecBackend,
    grpc_url: String,
}

#[async_trait]
impl JobDistributor for ExecJobDistributor {
    async fn register_node(&self, registration: &NodeRegistration) -> Result<String, ProviderError> {
        let request = json!({ "grpc_url": self.grpc_url, "registration": registration });
        let response: NodeIdResponse = self
            .backend
            .call("jd", "register-node", &request, &self.backend.cancel)
            .await?;
        Ok(response.node_id)
    }

    async fn propose_job(&self, node_id: &str, spec: &str) -> Result<JobProposal, ProviderError> {
        let request = json!({ "grpc_url": self.grpc_url, "node_id": node_id, "spec": spec });
        self.backend
            .call("jd", "propose-job", &request, &self.backend.cancel)
            .await
    }
}

#[async_trait]
impl CribConnector for ExecBackend {
    async fn chain(
        &self,
        input: &BlockchainInput,
        endpoints: ChainEndpoints,
    ) -> Result<WrappedBlockchainOutput, ProviderError> {
        self.connect_chain(input, endpoints, &self.cancel).await
    }

    fn node_api(&self, node: &CribNodeOutput) -> Result<Arc<dyn NodeApi>, ProviderError> {
        Ok(self.node_client(node))
    }

    fn job_distributor(&self, output: &CribJdOutput) -> Result<Arc<dyn JobDistributor>, ProviderError> {
        Ok(self.jd_client(&output.external_grpc_url))
    }
}

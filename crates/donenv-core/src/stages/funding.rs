//! Node funding
//!
//! Every (DON, chain, node) triple with a node address on a writable chain
//! becomes one task in a `JoinSet`. EVM transfers draw nonces from a fresh
//! `ConcurrentNonceMap`; Solana transfers are signed with the chain's funder
//! keypair. All dispatched transfers run to completion and the first error
//! is returned.

use crate::chain::{ChainClient, SystemTransfer, WrappedBlockchainOutput};
use crate::error::{EnvError, FundingError};
use crate::keys::solana::decode_address;
use crate::nonce::ConcurrentNonceMap;
use crate::operation::{Operation, OperationContext};
use crate::topology::Topology;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Default EVM funding amount (5 ETH)
pub const DEFAULT_EVM_FUNDING_WEI: u128 = 5_000_000_000_000_000_000;
/// Default Solana funding amount
pub const DEFAULT_SOLANA_FUNDING_LAMPORTS: u64 = 50_000_000;

/// How much each node receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingAmounts {
    /// Per node on every EVM chain
    #[serde(default = "default_evm_wei")]
    pub evm_wei: u128,
    /// Per node on every Solana chain
    #[serde(default = "default_solana_lamports")]
    pub solana_lamports: u64,
}

fn default_evm_wei() -> u128 {
    DEFAULT_EVM_FUNDING_WEI
}

fn default_solana_lamports() -> u64 {
    DEFAULT_SOLANA_FUNDING_LAMPORTS
}

impl Default for FundingAmounts {
    fn default() -> Self {
        Self {
            evm_wei: DEFAULT_EVM_FUNDING_WEI,
            solana_lamports: DEFAULT_SOLANA_FUNDING_LAMPORTS,
        }
    }
}

/// Fund every node on every writable chain it has an address on
///
/// # Errors
/// Returns the first failed transfer after all dispatched transfers finish,
/// or a nonce map error before anything is sent.
pub async fn fund_nodes(
    topology: &Topology,
    outputs: &[WrappedBlockchainOutput],
    amounts: FundingAmounts,
    cancel: &CancellationToken,
) -> Result<(), FundingError> {
    let nonces = Arc::new(ConcurrentNonceMap::new(cancel, outputs).await?);
    for chain_id in nonces.chains() {
        nonces.decrement(chain_id)?;
    }

    let mut tasks = JoinSet::new();
    for don in &topology.dons {
        for output in outputs.iter().filter(|output| !output.read_only) {
            for node in &don.nodes {
                let Some(address) = node.address(output.chain_id) else {
                    continue;
                };
                let address = address.to_string();
                let chain_id = output.chain_id;
                let cancel = cancel.clone();

                match &output.client {
                    ChainClient::Evm(client) => {
                        let client = Arc::clone(client);
                        let nonces = Arc::clone(&nonces);
                        tasks.spawn(async move {
                            let nonce = nonces.increment(chain_id)?;
                            let tx = client
                                .send_value(&address, amounts.evm_wei, nonce, &cancel)
                                .await
                                .map_err(|source| FundingError::Transfer {
                                    address: address.clone(),
                                    chain_id,
                                    source,
                                })?;
                            tracing::info!(chain_id, address, nonce, tx, "funded node");
                            Ok::<_, FundingError>(())
                        });
                    }
                    ChainClient::Solana { client, funder } => {
                        let client = Arc::clone(client);
                        let funder = Arc::clone(funder);
                        tasks.spawn(async move {
                            let to = decode_address(&address)
                                .map_err(|_| FundingError::InvalidSolanaAddress(address.clone()))?;
                            let transfer_error = |source| FundingError::Transfer {
                                address: address.clone(),
                                chain_id,
                                source,
                            };
                            let recent_blockhash = client.latest_blockhash().await.map_err(transfer_error)?;
                            let signed = SystemTransfer {
                                from: funder.public_key(),
                                to,
                                lamports: amounts.solana_lamports,
                                recent_blockhash,
                            }
                            .sign(&funder);
                            let signature = client.send_transaction(signed).await.map_err(transfer_error)?;
                            tracing::info!(chain_id, address, signature, "funded node");
                            Ok::<_, FundingError>(())
                        });
                    }
                }
            }
        }
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let err = match joined {
            Ok(Ok(())) => continue,
            Ok(Err(err)) => err,
            Err(join) => FundingError::Task(join.to_string()),
        };
        tracing::error!(error = %err, "funding transfer failed");
        first_error.get_or_insert(err);
    }

    first_error.map_or(Ok(()), Err)
}

/// Funds every node; runs as a background stage
#[derive(Debug, Clone, Copy, Default)]
pub struct FundNodes;

/// Outputs of earlier stages needed by `FundNodes`
#[derive(Debug, Clone)]
pub struct FundingDeps {
    /// Topology with addresses
    pub topology: Arc<Topology>,
    /// Started chains
    pub blockchains: Vec<WrappedBlockchainOutput>,
}

#[async_trait]
impl Operation for FundNodes {
    const NAME: &'static str = "fund-nodes";
    const VERSION: &'static str = "1.0.0";
    type Input = FundingAmounts;
    type Deps = FundingDeps;
    type Output = ();

    async fn execute(&self, ctx: &OperationContext, deps: &FundingDeps, input: FundingAmounts) -> Result<(), EnvError> {
        fund_nodes(&deps.topology, &deps.blockchains, input, &ctx.cancel).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainEndpoints;
    use crate::error::ProviderError;
    use crate::flags::CapabilityFlag;
    use crate::infra::InfraInput;
    use crate::keys::SolanaKeypair;
    use crate::provider::{MockEvmClient, MockSolanaClient};
    use crate::topology::{build_topology, NodeSetInput};
    use parking_lot::Mutex;

    fn topology(chains: &[u64]) -> Topology {
        let set = NodeSetInput::new("workflow", 2)
            .with_don_types([CapabilityFlag::Workflow, CapabilityFlag::Gateway]);
        let mut topology = build_topology(&[set], &InfraInput::Docker, 1).unwrap();
        for node in &mut topology.dons[0].nodes {
            for chain_id in chains {
                node.addresses.insert(*chain_id, format!("0xnode{}", node.index));
            }
        }
        topology
    }

    fn evm(chain_id: u64, read_only: bool, client: MockEvmClient) -> WrappedBlockchainOutput {
        WrappedBlockchainOutput {
            chain_id,
            chain_selector: chain_id,
            read_only,
            endpoints: ChainEndpoints::default(),
            client: ChainClient::Evm(Arc::new(client)),
        }
    }

    #[tokio::test]
    async fn read_only_chains_are_skipped() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut writable = MockEvmClient::new();
        writable.expect_pending_nonce().returning(|_| Ok(7));
        let record = Arc::clone(&sent);
        writable.expect_send_value().times(2).returning(move |to, amount, nonce, _| {
            assert_eq!(amount, DEFAULT_EVM_FUNDING_WEI);
            record.lock().push((to.to_string(), nonce));
            Ok(format!("0xtx{nonce}"))
        });

        let outputs = vec![evm(1, true, MockEvmClient::new()), evm(2, false, writable)];
        fund_nodes(&topology(&[1, 2]), &outputs, FundingAmounts::default(), &CancellationToken::new())
            .await
            .unwrap();

        let mut nonces: Vec<u64> = sent.lock().iter().map(|(_, nonce)| *nonce).collect();
        nonces.sort_unstable();
        assert_eq!(nonces, vec![7, 8]);
    }

    #[tokio::test]
    async fn nodes_without_address_are_skipped() {
        let mut client = MockEvmClient::new();
        client.expect_pending_nonce().returning(|_| Ok(0));
        client.expect_send_value().never();

        let outputs = vec![evm(5, false, client)];
        fund_nodes(&topology(&[]), &outputs, FundingAmounts::default(), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn all_transfers_finish_and_first_error_wins() {
        let mut client = MockEvmClient::new();
        client.expect_pending_nonce().returning(|_| Ok(0));
        client.expect_send_value().times(2).returning(|to, _, _, _| {
            if to == "0xnode1" {
                Err(ProviderError::failed("evm", "insufficient funds"))
            } else {
                Ok("0xtx".to_string())
            }
        });

        let outputs = vec![evm(1, false, client)];
        let err = fund_nodes(&topology(&[1]), &outputs, FundingAmounts::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to fund node 0xnode1 on chain 1"));
    }

    #[tokio::test]
    async fn solana_transfers_are_signed_by_funder() {
        let funder = Arc::new(SolanaKeypair::from_secret(&[3; 32]));
        let node = SolanaKeypair::from_secret(&[4; 32]);
        let mut set_topology = topology(&[]);
        for n in &mut set_topology.dons[0].nodes {
            n.addresses.insert(900, node.address());
        }

        let funder_key = funder.public_key();
        let mut client = MockSolanaClient::new();
        client.expect_latest_blockhash().returning(|| Ok([8; 32]));
        client.expect_send_transaction().times(2).returning(move |signed| {
            assert_eq!(signed.transfer.from, funder_key);
            assert_eq!(signed.transfer.lamports, DEFAULT_SOLANA_FUNDING_LAMPORTS);
            assert_eq!(signed.transfer.recent_blockhash, [8; 32]);
            Ok(signed.id())
        });

        let outputs = vec![WrappedBlockchainOutput {
            chain_id: 900,
            chain_selector: 900,
            read_only: false,
            endpoints: ChainEndpoints::default(),
            client: ChainClient::Solana {
                client: Arc::new(client),
                funder,
            },
        }];
        fund_nodes(&set_topology, &outputs, FundingAmounts::default(), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn invalid_solana_address_fails() {
        let mut set_topology = topology(&[]);
        set_topology.dons[0].nodes[0].addresses.insert(900, "not-base58!".into());

        let outputs = vec![WrappedBlockchainOutput {
            chain_id: 900,
            chain_selector: 900,
            read_only: false,
            endpoints: ChainEndpoints::default(),
            client: ChainClient::Solana {
                client: Arc::new(MockSolanaClient::new()),
                funder: Arc::new(SolanaKeypair::from_secret(&[3; 32])),
            },
        }];
        let err = fund_nodes(&set_topology, &outputs, FundingAmounts::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FundingError::InvalidSolanaAddress(_)));
    }
}

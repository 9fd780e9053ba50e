//! Keystone contract deployment

use crate::chain::{AddressBook, ContractKind, WrappedBlockchainOutput};
use crate::error::{EnvError, ProviderError};
use crate::operation::{Operation, OperationContext};
use crate::provider::ContractDeployer;
use async_trait::async_trait;
use std::sync::Arc;

/// Deploys registries on the home chain and forwarders on writable chains
#[derive(Debug, Clone, Copy, Default)]
pub struct DeployKeystoneContracts;

/// Collaborators of `DeployKeystoneContracts`
#[derive(Clone)]
pub struct ContractDeps {
    /// Contract tooling
    pub deployer: Arc<dyn ContractDeployer>,
}

/// Input of `DeployKeystoneContracts`
#[derive(Debug, Clone)]
pub struct DeployContractsInput {
    /// Registry chain
    pub home_chain_selector: u64,
    /// Started chains
    pub blockchains: Vec<WrappedBlockchainOutput>,
}

impl DeployContractsInput {
    /// Chains that receive a forwarder
    #[must_use]
    pub fn forwarder_selectors(&self) -> Vec<u64> {
        self.blockchains
            .iter()
            .filter(|chain| !chain.read_only)
            .map(|chain| chain.chain_selector)
            .collect()
    }
}

#[async_trait]
impl Operation for DeployKeystoneContracts {
    const NAME: &'static str = "deploy-keystone-contracts";
    const VERSION: &'static str = "1.0.0";
    type Input = DeployContractsInput;
    type Deps = ContractDeps;
    type Output = AddressBook;

    async fn execute(
        &self,
        ctx: &OperationContext,
        deps: &ContractDeps,
        input: DeployContractsInput,
    ) -> Result<AddressBook, EnvError> {
        if !input
            .blockchains
            .iter()
            .any(|chain| chain.chain_selector == input.home_chain_selector)
        {
            return Err(EnvError::MissingDependency {
                stage: Self::NAME,
                dependency: format!("started home chain {}", input.home_chain_selector),
            });
        }

        let forwarders = input.forwarder_selectors();
        let addresses = deps
            .deployer
            .deploy_keystone(input.home_chain_selector, &forwarders, &ctx.cancel)
            .await?;

        for kind in [
            ContractKind::CapabilitiesRegistry,
            ContractKind::WorkflowRegistry,
            ContractKind::Ocr3Capability,
        ] {
            let address = require(&addresses, input.home_chain_selector, kind)?;
            tracing::info!(contract = %kind, chain_selector = input.home_chain_selector, address, "deployed contract");
        }
        for selector in forwarders {
            let address = require(&addresses, selector, ContractKind::KeystoneForwarder)?;
            tracing::info!(contract = "KeystoneForwarder", chain_selector = selector, address, "deployed contract");
        }

        Ok(addresses)
    }
}

fn require(addresses: &AddressBook, selector: u64, kind: ContractKind) -> Result<&str, ProviderError> {
    addresses.get(selector, kind).ok_or_else(|| ProviderError::InvalidResponse {
        component: "contract deployer",
        reason: format!("no {kind} deployed on chain selector {selector}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainClient, ChainEndpoints};
    use crate::operation::execute_operation;
    use crate::provider::{MockContractDeployer, MockEvmClient};
    use tokio_util::sync::CancellationToken;

    fn chain(selector: u64, read_only: bool) -> WrappedBlockchainOutput {
        WrappedBlockchainOutput {
            chain_id: selector + 1000,
            chain_selector: selector,
            read_only,
            endpoints: ChainEndpoints::default(),
            client: ChainClient::Evm(Arc::new(MockEvmClient::new())),
        }
    }

    #[tokio::test]
    async fn forwarders_skip_read_only_chains() {
        let mut deployer = MockContractDeployer::new();
        deployer
            .expect_deploy_keystone()
            .withf(|home, forwarders, _| *home == 1 && forwarders == [1, 3])
            .times(1)
            .returning(|home, forwarders, _| {
                let mut book = AddressBook::new();
                book.insert(home, ContractKind::CapabilitiesRegistry, "0x1");
                book.insert(home, ContractKind::WorkflowRegistry, "0x2");
                book.insert(home, ContractKind::Ocr3Capability, "0x3");
                for selector in forwarders {
                    book.insert(*selector, ContractKind::KeystoneForwarder, "0x4");
                }
                Ok(book)
            });

        let ctx = OperationContext::new(CancellationToken::new());
        let input = DeployContractsInput {
            home_chain_selector: 1,
            blockchains: vec![chain(1, false), chain(2, true), chain(3, false)],
        };
        let deps = ContractDeps {
            deployer: Arc::new(deployer),
        };
        let book = execute_operation(&ctx, &DeployKeystoneContracts, &deps, input).await.unwrap();
        assert_eq!(book.len(), 5);
        assert!(book.get(2, ContractKind::KeystoneForwarder).is_none());
    }

    #[tokio::test]
    async fn incomplete_deployment_fails() {
        let mut deployer = MockContractDeployer::new();
        deployer.expect_deploy_keystone().returning(|home, _, _| {
            let mut book = AddressBook::new();
            book.insert(home, ContractKind::CapabilitiesRegistry, "0x1");
            Ok(book)
        });

        let ctx = OperationContext::new(CancellationToken::new());
        let input = DeployContractsInput {
            home_chain_selector: 1,
            blockchains: vec![chain(1, false)],
        };
        let deps = ContractDeps {
            deployer: Arc::new(deployer),
        };
        let err = execute_operation(&ctx, &DeployKeystoneContracts, &deps, input).await.unwrap_err();
        assert!(err.to_string().contains("no WorkflowRegistry deployed"));
    }
}

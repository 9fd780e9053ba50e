//! Blockchain provisioning

use crate::chain::{BlockchainInput, ChainClient, ChainFamily, WrappedBlockchainOutput};
use crate::error::{EnvError, ProviderError};
use crate::operation::{Operation, OperationContext};
use crate::provider::BlockchainProvisioner;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

/// Starts every declared chain
#[derive(Debug, Clone, Copy, Default)]
pub struct StartBlockchains;

/// Collaborators of `StartBlockchains`
#[derive(Clone)]
pub struct BlockchainDeps {
    /// Chain provisioner
    pub provisioner: Arc<dyn BlockchainProvisioner>,
}

/// Input of `StartBlockchains`
#[derive(Debug, Clone)]
pub struct BlockchainsInput {
    /// Chains to start
    pub blockchains: Vec<BlockchainInput>,
    /// Registry chain, must be one of the chains
    pub home_chain_selector: u64,
}

#[async_trait]
impl Operation for StartBlockchains {
    const NAME: &'static str = "start-blockchains";
    const VERSION: &'static str = "1.0.0";
    type Input = BlockchainsInput;
    type Deps = BlockchainDeps;
    type Output = Vec<WrappedBlockchainOutput>;

    async fn execute(
        &self,
        ctx: &OperationContext,
        deps: &BlockchainDeps,
        input: BlockchainsInput,
    ) -> Result<Self::Output, EnvError> {
        let home = input
            .blockchains
            .iter()
            .find(|chain| chain.chain_selector == input.home_chain_selector)
            .ok_or_else(|| EnvError::MissingDependency {
                stage: Self::NAME,
                dependency: format!("home chain with selector {}", input.home_chain_selector),
            })?;
        if home.family != ChainFamily::Evm || home.read_only {
            return Err(EnvError::MissingDependency {
                stage: Self::NAME,
                dependency: "a writable EVM home chain".to_string(),
            });
        }

        let mut selectors = HashSet::new();
        let mut outputs = Vec::with_capacity(input.blockchains.len());
        for chain in &input.blockchains {
            if !selectors.insert(chain.chain_selector) {
                return Err(ProviderError::InvalidResponse {
                    component: "blockchain",
                    reason: format!("chain selector {} declared twice", chain.chain_selector),
                }
                .into());
            }

            tracing::info!(chain_id = chain.chain_id, family = %chain.family, "starting blockchain");
            let output = deps.provisioner.start(chain, &ctx.cancel).await?;
            check_output(chain, &output)?;
            outputs.push(output);
        }

        Ok(outputs)
    }
}

fn check_output(input: &BlockchainInput, output: &WrappedBlockchainOutput) -> Result<(), ProviderError> {
    let mismatch = |reason: String| ProviderError::InvalidResponse {
        component: "blockchain",
        reason,
    };

    if output.family() != input.family {
        return Err(mismatch(format!(
            "chain {} started as {} but was declared {}",
            input.chain_id,
            output.family(),
            input.family
        )));
    }
    if output.chain_id != input.chain_id || output.chain_selector != input.chain_selector {
        return Err(mismatch(format!(
            "chain {} came back as chain {} (selector {})",
            input.chain_id, output.chain_id, output.chain_selector
        )));
    }
    if let ChainClient::Evm(client) = &output.client {
        if client.chain_id() != input.chain_id {
            return Err(mismatch(format!(
                "client of chain {} reports chain id {}",
                input.chain_id,
                client.chain_id()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainEndpoints;
    use crate::operation::execute_operation;
    use crate::provider::{MockBlockchainProvisioner, MockEvmClient};
    use tokio_util::sync::CancellationToken;

    fn provisioner() -> MockBlockchainProvisioner {
        let mut provisioner = MockBlockchainProvisioner::new();
        provisioner.expect_start().returning(|input, _| {
            let chain_id = input.chain_id;
            let mut client = MockEvmClient::new();
            client.expect_chain_id().return_const(chain_id);
            Ok(WrappedBlockchainOutput {
                chain_id,
                chain_selector: input.chain_selector,
                read_only: input.read_only,
                endpoints: ChainEndpoints::default(),
                client: ChainClient::Evm(Arc::new(client)),
            })
        });
        provisioner
    }

    #[tokio::test]
    async fn starts_chains_in_order() {
        let ctx = OperationContext::new(CancellationToken::new());
        let deps = BlockchainDeps {
            provisioner: Arc::new(provisioner()),
        };
        let input = BlockchainsInput {
            blockchains: vec![BlockchainInput::evm(1337, 10), BlockchainInput::evm(2337, 20).read_only()],
            home_chain_selector: 10,
        };

        let outputs = execute_operation(&ctx, &StartBlockchains, &deps, input).await.unwrap();
        assert_eq!(outputs.iter().map(|o| o.chain_id).collect::<Vec<_>>(), vec![1337, 2337]);
        assert!(outputs[1].read_only);
    }

    #[tokio::test]
    async fn home_chain_must_be_declared() {
        let ctx = OperationContext::new(CancellationToken::new());
        let deps = BlockchainDeps {
            provisioner: Arc::new(MockBlockchainProvisioner::new()),
        };
        let input = BlockchainsInput {
            blockchains: vec![BlockchainInput::evm(1337, 10)],
            home_chain_selector: 99,
        };
        let err = execute_operation(&ctx, &StartBlockchains, &deps, input).await.unwrap_err();
        assert!(err.to_string().contains("home chain with selector 99"));
    }

    #[tokio::test]
    async fn family_mismatch_is_rejected() {
        let ctx = OperationContext::new(CancellationToken::new());
        let deps = BlockchainDeps {
            provisioner: Arc::new(provisioner()),
        };
        let input = BlockchainsInput {
            blockchains: vec![BlockchainInput::evm(1337, 10), BlockchainInput::solana(900, 30)],
            home_chain_selector: 10,
        };
        let err = execute_operation(&ctx, &StartBlockchains, &deps, input).await.unwrap_err();
        assert!(err.to_string().contains("started as evm but was declared solana"));
    }
}

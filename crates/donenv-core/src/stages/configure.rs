//! Workflow registry and capabilities registry configuration

use super::jobs::fault_tolerance;
use crate::chain::{AddressBook, ChainFamily, ContractKind, WrappedBlockchainOutput};
use crate::error::{EnvError, ProviderError};
use crate::flags::CapabilityFlag;
use crate::operation::{Operation, OperationContext};
use crate::provider::{
    registry_capability, ContractDeployer, DonCapabilities, KeystoneConfig, Ocr3Config, RegistryCapability,
    WorkflowRegistryConfig,
};
use crate::topology::{DonMetadata, Topology};
use async_trait::async_trait;
use std::sync::Arc;

/// Configures the workflow registry, then registers DONs and OCR3 config
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigureContracts;

/// Outputs of earlier stages needed by `ConfigureContracts`
#[derive(Clone)]
pub struct ConfigureDeps {
    /// Contract tooling
    pub deployer: Arc<dyn ContractDeployer>,
    /// Topology with keys
    pub topology: Arc<Topology>,
    /// Deployed contracts
    pub addresses: AddressBook,
    /// Started chains
    pub blockchains: Vec<WrappedBlockchainOutput>,
}

impl std::fmt::Debug for ConfigureDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigureDeps")
            .field("addresses", &self.addresses)
            .field("blockchains", &self.blockchains)
            .finish_non_exhaustive()
    }
}

/// Input of `ConfigureContracts`
#[derive(Debug, Clone, Default)]
pub struct ConfigureContractsInput {
    /// Replaces the default OCR3 config
    pub ocr3: Option<Ocr3Config>,
}

/// What was written to the registries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfiguredContracts {
    /// Workflow registry settings
    pub workflow_registry: WorkflowRegistryConfig,
    /// Capabilities registry settings
    pub keystone: KeystoneConfig,
}

fn chain_scoped(flag: CapabilityFlag) -> Option<(ChainFamily, bool)> {
    match flag {
        CapabilityFlag::WriteEvm => Some((ChainFamily::Evm, true)),
        CapabilityFlag::WriteSolana => Some((ChainFamily::Solana, true)),
        CapabilityFlag::LogTrigger | CapabilityFlag::ReadContract => Some((ChainFamily::Evm, false)),
        _ => None,
    }
}

/// Capabilities a DON registers, one per chain for chain-scoped flags
#[must_use]
pub fn don_registry_capabilities(
    don: &DonMetadata,
    blockchains: &[WrappedBlockchainOutput],
    home_chain_id: u64,
) -> Vec<RegistryCapability> {
    let mut capabilities = Vec::new();
    for flag in don.flags.iter() {
        match chain_scoped(flag) {
            Some((family, writes)) => {
                let chains = blockchains.iter().filter(|chain| {
                    chain.family() == family && !(writes && chain.read_only) && don.supports_chain(chain.chain_id)
                });
                capabilities.extend(chains.filter_map(|chain| registry_capability(flag, chain.chain_id)));
            }
            None => capabilities.extend(registry_capability(flag, home_chain_id)),
        }
    }
    capabilities
}

/// Registry entry of a DON; gateway-only DONs register nothing
#[must_use]
pub fn don_capabilities(
    don: &DonMetadata,
    blockchains: &[WrappedBlockchainOutput],
    home_chain_id: u64,
) -> Option<DonCapabilities> {
    if don.flags.is_gateway_only() {
        return None;
    }

    Some(DonCapabilities {
        name: format!("{}-don", don.name),
        f: u8::try_from(fault_tolerance(don)).unwrap_or(u8::MAX),
        nop: format!("NOP for {} DON", don.name),
        peer_ids: don.workers().filter_map(|node| node.p2p_peer_id.clone()).collect(),
        capabilities: don_registry_capabilities(don, blockchains, home_chain_id),
    })
}

fn missing(dependency: String) -> EnvError {
    EnvError::MissingDependency {
        stage: ConfigureContracts::NAME,
        dependency,
    }
}

#[async_trait]
impl Operation for ConfigureContracts {
    const NAME: &'static str = "configure-contracts";
    const VERSION: &'static str = "1.0.0";
    type Input = ConfigureContractsInput;
    type Deps = ConfigureDeps;
    type Output = ConfiguredContracts;

    async fn execute(
        &self,
        ctx: &OperationContext,
        deps: &ConfigureDeps,
        input: ConfigureContractsInput,
    ) -> Result<ConfiguredContracts, EnvError> {
        let topology = &deps.topology;
        let selector = topology.home_chain_selector;

        let home = deps
            .blockchains
            .iter()
            .find(|chain| chain.chain_selector == selector)
            .ok_or_else(|| missing(format!("started home chain {selector}")))?;
        let home_client = home
            .evm()
            .ok_or_else(|| missing(format!("EVM client for home chain {selector}")))?;
        let workflow_don = topology
            .workflow_don()
            .ok_or_else(|| missing("workflow DON".to_string()))?;
        if !topology.has_keys() {
            return Err(missing("node keys in topology".to_string()));
        }

        let registry_address = deps
            .addresses
            .get(selector, ContractKind::WorkflowRegistry)
            .ok_or_else(|| ProviderError::InvalidResponse {
                component: "contract deployer",
                reason: format!("no {} deployed on chain selector {selector}", ContractKind::WorkflowRegistry),
            })?;

        let workflow_registry = WorkflowRegistryConfig {
            chain_selector: selector,
            registry_address: registry_address.to_string(),
            allowed_don_ids: vec![workflow_don.id],
            workflow_owners: vec![home_client.funding_address()],
        };
        deps.deployer
            .configure_workflow_registry(&workflow_registry, &ctx.cancel)
            .await?;
        tracing::info!(registry = %workflow_registry.registry_address, don_id = workflow_don.id, "workflow registry configured");

        let keystone = KeystoneConfig {
            chain_selector: selector,
            addresses: deps.addresses.clone(),
            dons: topology
                .dons
                .iter()
                .filter_map(|don| don_capabilities(don, &deps.blockchains, home.chain_id))
                .collect(),
            ocr3: input
                .ocr3
                .unwrap_or_else(|| Ocr3Config::with_workers(workflow_don.workers().count())),
        };
        deps.deployer.configure_keystone(&keystone, &ctx.cancel).await?;
        tracing::info!(dons = keystone.dons.len(), "capabilities registry configured");

        Ok(ConfiguredContracts {
            workflow_registry,
            keystone,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainClient, ChainEndpoints};
    use crate::infra::InfraInput;
    use crate::keys::PeerId;
    use crate::operation::execute_operation;
    use crate::provider::{MockContractDeployer, MockEvmClient};
    use crate::topology::{build_topology, NodeSetInput};
    use pretty_assertions::assert_eq;
    use tokio_util::sync::CancellationToken;

    fn keyed_topology() -> Topology {
        let sets = [
            NodeSetInput::new("workflow", 5)
                .with_don_types([CapabilityFlag::Workflow])
                .with_capabilities([CapabilityFlag::Ocr3, CapabilityFlag::Cron]),
            NodeSetInput::new("capabilities", 2)
                .with_don_types([CapabilityFlag::Capabilities])
                .with_capabilities([CapabilityFlag::WriteEvm])
                .with_bootstrap_index(-1),
            NodeSetInput::new("gateway", 1)
                .with_don_types([CapabilityFlag::Gateway])
                .with_bootstrap_index(-1)
                .with_gateway_index(0),
        ];
        let mut topology = build_topology(&sets, &InfraInput::Docker, 10).unwrap();
        for don in &mut topology.dons {
            for node in &mut don.nodes {
                let seed = u8::try_from(don.id * 10).unwrap() + u8::try_from(node.index).unwrap();
                node.p2p_peer_id = Some(PeerId::from_public_key(&[seed; 32]));
            }
        }
        topology.keys_injected = true;
        topology
    }

    fn evm(selector: u64, read_only: bool) -> WrappedBlockchainOutput {
        let mut client = MockEvmClient::new();
        client.expect_funding_address().returning(|| "0xfunder".to_string());
        WrappedBlockchainOutput {
            chain_id: selector + 1000,
            chain_selector: selector,
            read_only,
            endpoints: ChainEndpoints::default(),
            client: ChainClient::Evm(Arc::new(client)),
        }
    }

    fn addresses() -> AddressBook {
        let mut book = AddressBook::new();
        book.insert(10, ContractKind::CapabilitiesRegistry, "0xcap");
        book.insert(10, ContractKind::WorkflowRegistry, "0xwf");
        book.insert(10, ContractKind::Ocr3Capability, "0xocr");
        book
    }

    #[test]
    fn write_capability_skips_read_only_chains() {
        let topology = keyed_topology();
        let chains = [evm(10, false), evm(20, true)];
        let capabilities = don_registry_capabilities(&topology.dons[1], &chains, 1010);
        let names: Vec<&str> = capabilities.iter().map(|c| c.labelled_name.as_str()).collect();
        assert_eq!(names, vec!["write_evm-1010"]);
    }

    #[test]
    fn gateway_only_don_is_not_registered() {
        let topology = keyed_topology();
        assert!(don_capabilities(&topology.dons[2], &[], 1010).is_none());

        let workflow = don_capabilities(&topology.dons[0], &[], 1010).unwrap();
        assert_eq!(workflow.name, "workflow-don");
        assert_eq!(workflow.nop, "NOP for workflow DON");
        assert_eq!(workflow.f, 1);
        assert_eq!(workflow.peer_ids.len(), 4);
    }

    #[tokio::test]
    async fn registries_are_configured_in_order() {
        let mut seq = mockall::Sequence::new();
        let mut deployer = MockContractDeployer::new();
        deployer
            .expect_configure_workflow_registry()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|config, _| {
                assert_eq!(config.registry_address, "0xwf");
                assert_eq!(config.allowed_don_ids, vec![1]);
                assert_eq!(config.workflow_owners, vec!["0xfunder".to_string()]);
                Ok(())
            });
        deployer
            .expect_configure_keystone()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|config, _| {
                assert_eq!(config.dons.len(), 2);
                assert_eq!(config.ocr3.transmission_schedule, vec![4]);
                Ok(())
            });

        let deps = ConfigureDeps {
            deployer: Arc::new(deployer),
            topology: Arc::new(keyed_topology()),
            addresses: addresses(),
            blockchains: vec![evm(10, false)],
        };
        let ctx = OperationContext::new(CancellationToken::new());
        let configured = execute_operation(&ctx, &ConfigureContracts, &deps, ConfigureContractsInput::default())
            .await
            .unwrap();
        assert_eq!(configured.keystone.dons[1].name, "capabilities-don");
    }

    #[tokio::test]
    async fn missing_workflow_registry_fails_before_configuring() {
        let mut deployer = MockContractDeployer::new();
        deployer.expect_configure_workflow_registry().never();
        deployer.expect_configure_keystone().never();

        let deps = ConfigureDeps {
            deployer: Arc::new(deployer),
            topology: Arc::new(keyed_topology()),
            addresses: AddressBook::new(),
            blockchains: vec![evm(10, false)],
        };
        let ctx = OperationContext::new(CancellationToken::new());
        let err = execute_operation(&ctx, &ConfigureContracts, &deps, ConfigureContractsInput::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no WorkflowRegistry deployed"));
    }
}

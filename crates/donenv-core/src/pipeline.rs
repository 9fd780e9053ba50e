//! End-to-end environment setup
//!
//! Chains the provisioning stages in dependency order:
//!
//! 1. validate inputs (no side effects)
//! 2. start blockchains, deploy keystone contracts
//! 3. build topology, keys and node configs
//! 4. start DONs and the Job Distributor concurrently, link nodes to the JD
//! 5. fund nodes in the background, create jobs, wait for healthy nodes
//! 6. verify log-poller filters in the background (docker with a gateway only)
//! 7. configure contracts, then join background stages
//!
//! Any stage failure aborts the pipeline. Side effects are never rolled back;
//! cleanup is left to the caller.

use crate::chain::{AddressBook, BlockchainInput, WrappedBlockchainOutput};
use crate::crib::validate_node_set_images;
use crate::error::EnvError;
use crate::infra::InfraInput;
use crate::keys::GeneratedKeys;
use crate::operation::{execute_operation, Operation, OperationContext};
use crate::overlay::{validate_override_pairing, ConfigTransformer};
use crate::provider::{
    BlockchainProvisioner, ContractDeployer, JdInput, JdOutput, JobDistributorLauncher, NodeSetLauncher, Ocr3Config,
};
use crate::stages::{
    BlockchainDeps, BlockchainsInput, ConfigureContracts, ConfigureContractsInput, ConfigureDeps, ConfiguredContracts,
    ContractDeps, CreateJobs, CreateJobsDeps, CreateJobsStageInput, DeployContractsInput, DeployKeystoneContracts,
    DonTopology, DonsToJobSpecs, FilterWaitInput, FundNodes, FundingAmounts, FundingDeps, HealthWaitInput,
    JobSpecFactory, LinkJdDeps, LinkJdInput, LinkNodesToJd, PrepareTopology, PrepareTopologyDeps,
    PrepareTopologyInput, StartBlockchains, StartDonsAndJd, StartDonsDeps, StartDonsInput, VerifyFilters,
    WaitForHealthyNodes,
};
use crate::topology::{validate_topology, NodeSetInput};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// External systems the pipeline drives
#[derive(Clone)]
pub struct Collaborators {
    /// Chain provisioner
    pub blockchains: Arc<dyn BlockchainProvisioner>,
    /// Contract tooling
    pub contracts: Arc<dyn ContractDeployer>,
    /// Node set launcher
    pub node_sets: Arc<dyn NodeSetLauncher>,
    /// JD launcher
    pub jd: Arc<dyn JobDistributorLauncher>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Filter verification timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationSettings {
    /// Delay between polls
    pub interval: Duration,
    /// Give up after this long
    pub timeout: Duration,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Everything the caller declares
#[derive(Clone)]
pub struct SetupInput {
    /// Chains to start
    pub blockchains: Vec<BlockchainInput>,
    /// Registry chain
    pub home_chain_selector: u64,
    /// DON declarations
    pub node_sets: Vec<NodeSetInput>,
    /// JD settings
    pub jd: JdInput,
    /// Where everything runs
    pub infra: InfraInput,
    /// Password sealing node keys
    pub key_password: String,
    /// Per-node funding
    pub funding: FundingAmounts,
    /// Extra config transformers
    pub transformers: Vec<Arc<dyn ConfigTransformer>>,
    /// Job spec factories
    pub job_factories: Vec<Arc<dyn JobSpecFactory>>,
    /// Extra host ports
    pub extra_allowed_ports: Vec<u16>,
    /// JD registration retries
    pub link: LinkJdInput,
    /// Health wait polling
    pub health: HealthWaitInput,
    /// Filter verification timing
    pub verification: VerificationSettings,
    /// Replaces the default OCR3 config
    pub ocr3: Option<Ocr3Config>,
}

impl std::fmt::Debug for SetupInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetupInput")
            .field("blockchains", &self.blockchains)
            .field("home_chain_selector", &self.home_chain_selector)
            .field("node_sets", &self.node_sets)
            .field("jd", &self.jd)
            .field("infra", &self.infra)
            .field("funding", &self.funding)
            .field("extra_allowed_ports", &self.extra_allowed_ports)
            .finish_non_exhaustive()
    }
}

/// Provisioned environment
#[derive(Debug, Clone)]
pub struct SetupOutput {
    /// Started chains
    pub blockchains: Vec<WrappedBlockchainOutput>,
    /// Deployed contracts
    pub addresses: AddressBook,
    /// Topology with started, JD-linked nodes
    pub don_topology: DonTopology,
    /// Started JD
    pub jd: JdOutput,
    /// Node keys
    pub keys: GeneratedKeys,
    /// Job specs created per DON and node
    pub job_specs: DonsToJobSpecs,
    /// Registry configuration written
    pub contracts: ConfiguredContracts,
}

/// Input checks that run before anything is started
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidateInputs;

/// Input of `ValidateInputs`
#[derive(Debug, Clone)]
pub struct ValidationInput {
    /// DON declarations
    pub node_sets: Vec<NodeSetInput>,
    /// Where everything runs
    pub infra: InfraInput,
}

#[async_trait]
impl Operation for ValidateInputs {
    const NAME: &'static str = "validate-inputs";
    const VERSION: &'static str = "1.0.0";
    type Input = ValidationInput;
    type Deps = ();
    type Output = ();

    async fn execute(&self, _ctx: &OperationContext, _deps: &(), input: ValidationInput) -> Result<(), EnvError> {
        validate_inputs(&input.node_sets, &input.infra)
    }
}

/// Validate node sets against topology, override and infra rules
///
/// # Errors
/// Returns the first validation error; all of them satisfy
/// [`EnvError::is_validation`].
pub fn validate_inputs(node_sets: &[NodeSetInput], infra: &InfraInput) -> Result<(), EnvError> {
    validate_topology(node_sets)?;
    for (position, set) in node_sets.iter().enumerate() {
        let don_id = u32::try_from(position + 1).unwrap_or(u32::MAX);
        validate_override_pairing(don_id, &set.nodes)?;
        if infra.is_crib() {
            validate_node_set_images(set)?;
        }
    }
    Ok(())
}

type Background = JoinSet<(&'static str, Result<(), EnvError>)>;

async fn join_background(mut tasks: Background) -> Result<(), EnvError> {
    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let err = match joined {
            Ok((stage, Ok(()))) => {
                tracing::info!(stage, "background stage finished");
                continue;
            }
            Ok((_, Err(err))) => err,
            Err(join) => EnvError::Join(join.to_string()),
        };
        tracing::error!(error = %err, "background stage failed");
        first_error.get_or_insert(err);
    }

    first_error.map_or(Ok(()), |err| Err(EnvError::Background(Box::new(err))))
}

/// Provision the whole environment
///
/// Background stages still running when a foreground stage fails are
/// aborted.
///
/// # Errors
/// Returns the first failing stage, wrapped with its identity, or
/// `EnvError::Background` for a failed background stage.
pub async fn setup_test_environment(
    ctx: &OperationContext,
    collaborators: &Collaborators,
    input: SetupInput,
) -> Result<SetupOutput, EnvError> {
    let validation = ValidationInput {
        node_sets: input.node_sets.clone(),
        infra: input.infra.clone(),
    };
    execute_operation(ctx, &ValidateInputs, &(), validation).await?;

    let blockchains = execute_operation(
        ctx,
        &StartBlockchains,
        &BlockchainDeps {
            provisioner: Arc::clone(&collaborators.blockchains),
        },
        BlockchainsInput {
            blockchains: input.blockchains.clone(),
            home_chain_selector: input.home_chain_selector,
        },
    )
    .await?;

    let addresses = execute_operation(
        ctx,
        &DeployKeystoneContracts,
        &ContractDeps {
            deployer: Arc::clone(&collaborators.contracts),
        },
        DeployContractsInput {
            home_chain_selector: input.home_chain_selector,
            blockchains: blockchains.clone(),
        },
    )
    .await?;

    let prepared = execute_operation(
        ctx,
        &PrepareTopology,
        &PrepareTopologyDeps {
            blockchains: blockchains.clone(),
            addresses: addresses.clone(),
        },
        PrepareTopologyInput {
            node_sets: input.node_sets.clone(),
            infra: input.infra.clone(),
            home_chain_selector: input.home_chain_selector,
            key_password: input.key_password.clone(),
            transformers: input.transformers.clone(),
            extra_allowed_ports: input.extra_allowed_ports.clone(),
        },
    )
    .await?;

    let home = blockchains
        .iter()
        .find(|chain| chain.chain_selector == input.home_chain_selector)
        .cloned()
        .ok_or_else(|| EnvError::MissingDependency {
            stage: StartDonsAndJd::NAME,
            dependency: format!("started home chain {}", input.home_chain_selector),
        })?;
    let home_chain_id = home.chain_id;

    let started = execute_operation(
        ctx,
        &StartDonsAndJd,
        &StartDonsDeps {
            node_sets: Arc::clone(&collaborators.node_sets),
            jd: Arc::clone(&collaborators.jd),
            registry_chain: home,
        },
        StartDonsInput {
            node_sets: prepared.node_sets.clone(),
            jd: input.jd.clone(),
        },
    )
    .await?;
    let jd = started.jd.clone();

    let don_topology = execute_operation(
        ctx,
        &LinkNodesToJd,
        &LinkJdDeps {
            topology: Arc::clone(&prepared.topology),
            started,
        },
        input.link,
    )
    .await?;

    let mut background = Background::new();
    {
        let ctx = ctx.clone();
        let deps = FundingDeps {
            topology: Arc::clone(&prepared.topology),
            blockchains: blockchains.clone(),
        };
        let amounts = input.funding;
        background.spawn(async move {
            (FundNodes::NAME, execute_operation(&ctx, &FundNodes, &deps, amounts).await)
        });
    }

    let job_specs = execute_operation(
        ctx,
        &CreateJobs,
        &CreateJobsDeps {
            don_topology: don_topology.clone(),
            addresses: addresses.clone(),
            ocr_peering: prepared.ocr_peering.clone(),
            jd: Arc::clone(&jd.client),
        },
        CreateJobsStageInput {
            factories: input.job_factories.clone(),
            home_chain_selector: input.home_chain_selector,
            home_chain_id,
            extra_allowed_ports: input.extra_allowed_ports.clone(),
        },
    )
    .await?;

    execute_operation(ctx, &WaitForHealthyNodes, &don_topology, input.health).await?;

    if prepared.topology.gateway_connector.is_some() && !input.infra.is_crib() {
        let ctx = ctx.clone();
        let deps = don_topology.clone();
        let filters = FilterWaitInput {
            home_chain_id,
            interval: input.verification.interval,
            timeout: input.verification.timeout,
        };
        background.spawn(async move {
            (VerifyFilters::NAME, execute_operation(&ctx, &VerifyFilters, &deps, filters).await)
        });
    } else {
        tracing::info!("skipping log-poller filter verification");
    }

    let contracts = execute_operation(
        ctx,
        &ConfigureContracts,
        &ConfigureDeps {
            deployer: Arc::clone(&collaborators.contracts),
            topology: Arc::clone(&prepared.topology),
            addresses: addresses.clone(),
            blockchains: blockchains.clone(),
        },
        ConfigureContractsInput { ocr3: input.ocr3 },
    )
    .await?;

    join_background(background).await?;
    tracing::info!(
        dons = don_topology.topology.dons.len(),
        nodes = don_topology.topology.node_count(),
        "environment ready"
    );

    Ok(SetupOutput {
        blockchains,
        addresses,
        don_topology,
        jd,
        keys: prepared.keys,
        job_specs,
        contracts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FundingError;
    use crate::flags::CapabilityFlag;
    use crate::topology::NodeSpec;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn crib_requires_tagged_images() {
        let set = NodeSetInput::new("workflow", 2)
            .with_don_types([CapabilityFlag::Workflow, CapabilityFlag::Gateway])
            .with_image("repo/node");
        let crib = InfraInput::Crib(crate::infra::CribInput {
            namespace: "ns".into(),
            folder_location: "/crib".into(),
            provider: "kind".into(),
            configs_dir: "configs".into(),
            team: None,
        });

        assert!(validate_inputs(std::slice::from_ref(&set), &InfraInput::Docker).is_ok());
        let err = validate_inputs(&[set], &crib).unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("explicit tag"));
    }

    #[test]
    fn partial_overrides_are_rejected() {
        let mut set = NodeSetInput::new("workflow", 2)
            .with_don_types([CapabilityFlag::Workflow, CapabilityFlag::Gateway]);
        set.nodes[0] = NodeSpec {
            config_override: Some("[Log]".into()),
            secrets_override: Some(String::new()),
            ..NodeSpec::default()
        };

        let err = validate_inputs(&[set], &InfraInput::Docker).unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("1 out of 2 node specs have config overrides"));
    }

    #[tokio::test]
    async fn first_background_failure_is_reported() {
        let mut tasks = Background::new();
        tasks.spawn(async { ("fund-nodes", Err(EnvError::from(FundingError::Task("boom".into())))) });
        tasks.spawn(async { ("verify-log-poller-filters", Ok(())) });

        let err = join_background(tasks).await.unwrap_err();
        assert!(err.to_string().starts_with("background stage failed"));
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn background_stages_all_pass() {
        let mut tasks = Background::new();
        tasks.spawn(async { ("a", Ok(())) });
        tasks.spawn(async { ("b", Ok(())) });
        join_background(tasks).await.unwrap();
    }

    #[tokio::test]
    async fn validation_runs_as_an_operation() {
        let ctx = OperationContext::new(CancellationToken::new());
        let input = ValidationInput {
            node_sets: Vec::new(),
            infra: InfraInput::Docker,
        };
        let err = execute_operation(&ctx, &ValidateInputs, &(), input).await.unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("validate-inputs"));
    }
}

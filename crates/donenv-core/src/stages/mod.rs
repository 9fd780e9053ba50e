//! Provisioning stages
//!
//! Each stage is an [`Operation`](crate::operation::Operation) with typed
//! input, dependencies and output. The pipeline in [`crate::pipeline`]
//! chains them in dependency order.

pub mod blockchains;
pub mod configure;
pub mod contracts;
pub mod dons_and_jd;
pub mod funding;
pub mod health;
pub mod jobs;
pub mod link_jd;
pub mod topology;
pub mod verification;

pub use blockchains::{BlockchainDeps, BlockchainsInput, StartBlockchains};
pub use configure::{ConfigureContracts, ConfigureContractsInput, ConfigureDeps, ConfiguredContracts};
pub use contracts::{ContractDeps, DeployContractsInput, DeployKeystoneContracts};
pub use dons_and_jd::{StartDonsAndJd, StartDonsDeps, StartDonsInput, StartedEnvironment};
pub use funding::{fund_nodes, FundNodes, FundingAmounts, FundingDeps};
pub use health::{wait_for_config_watchers, HealthWaitInput, WaitForHealthyNodes};
pub use jobs::{
    create_jobs, default_job_spec_factories, merge_job_spec_maps, CreateJobs, CreateJobsDeps, CreateJobsInput,
    CreateJobsStageInput, DonsToJobSpecs, JobSpecFactory, JobSpecInput,
};
pub use link_jd::{DonTopology, LinkJdDeps, LinkJdInput, LinkNodesToJd, LinkedNode};
pub use topology::{PrepareTopology, PrepareTopologyDeps, PrepareTopologyInput, PreparedEnvironment};
pub use verification::{wait_for_expected_filters, FilterWaitInput, VerifyFilters};

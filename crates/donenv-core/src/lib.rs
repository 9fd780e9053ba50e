//! donenv core - staged provisioning of ephemeral multi-chain DON test environments
//!
//! The engine:
//! - Builds a DON topology from node-set declarations
//! - Starts chains, deploys and configures registry contracts
//! - Generates node keys, secrets and config overlays
//! - Starts node sets and the Job Distributor concurrently
//! - Creates jobs, funds node accounts and verifies node health
//!
//! Every external system sits behind a trait in [`provider`]; stages run as
//! named, versioned [`operation`]s.
//!
//! # Example
//!
//! ```rust,ignore
//! use donenv_core::prelude::*;
//!
//! # async fn example(collaborators: Collaborators, input: SetupInput) -> Result<(), EnvError> {
//! let ctx = OperationContext::new(CancellationToken::new());
//! let env = setup_test_environment(&ctx, &collaborators, input).await?;
//! println!("{} nodes ready", env.don_topology.topology.node_count());
//! # Ok(())
//! # }
//! ```

pub mod chain;
pub mod cleanup;
pub mod crib;
pub mod error;
pub mod flags;
pub mod infra;
pub mod keys;
pub mod nonce;
pub mod operation;
pub mod overlay;
pub mod pipeline;
pub mod provider;
pub mod shell;
pub mod stages;
pub mod topology;

pub use chain::{AddressBook, BlockchainInput, ChainClient, ChainEndpoints, ChainFamily, ContractKind, WrappedBlockchainOutput};
pub use error::{
    CribError, EnvError, FundingError, JobError, KeyError, NonceError, OverlayError, ProviderError, ShellError,
    TopologyError, VerificationError,
};
pub use flags::{CapabilityFlag, FlagSet};
pub use infra::{CribInput, InfraInput, NodeRole};
pub use nonce::ConcurrentNonceMap;
pub use operation::{execute_operation, Operation, OperationContext};
pub use pipeline::{setup_test_environment, Collaborators, SetupInput, SetupOutput, VerificationSettings};
pub use topology::{build_topology, NodeSetInput, NodeSpec, Topology};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving the pipeline
    pub use crate::cleanup::{ContainerCleaner, DockerCleaner};
    pub use crate::provider::{
        BlockchainProvisioner, ContractDeployer, EvmClient, JobDistributor, JobDistributorLauncher, NodeApi,
        NodeSetLauncher, SolanaClient,
    };
    pub use crate::shell::{ProcessShell, ShellRunner};
    pub use crate::stages::{FundingAmounts, HealthWaitInput, LinkJdInput};
    pub use crate::{
        setup_test_environment, BlockchainInput, CapabilityFlag, Collaborators, EnvError, InfraInput, NodeSetInput,
        OperationContext, SetupInput, SetupOutput,
    };
    pub use tokio_util::sync::CancellationToken;
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

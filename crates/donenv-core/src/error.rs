//! Error types for donenv core
//!
//! Provides error handling for:
//! - Topology and node-set validation
//! - Key generation and encryption
//! - Config overlay generation
//! - Collaborator (provider, shell) failures
//! - Funding, job creation and verification stages
//! - Operation wrapping with stage identity

use crate::flags::CapabilityFlag;

/// Hint appended to Job Distributor startup failures caused by image pulls
pub const JD_IMAGE_PULL_HINT: &str = "ensure that you either you have built the local image or you are logged into AWS with a profile that can read it (`aws sso login --profile <foo>`)";

/// Main environment error type
#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    /// Topology or node-set declaration is invalid
    #[error("invalid topology: {0}")]
    Topology(#[from] TopologyError),

    /// Nonce allocation failed
    #[error("nonce allocation failed: {0}")]
    Nonce(#[from] NonceError),

    /// Key generation or injection failed
    #[error("key generation failed: {0}")]
    Keys(#[from] KeyError),

    /// Config overlay generation failed
    #[error("config overlay generation failed: {0}")]
    Overlay(#[from] OverlayError),

    /// External collaborator failed
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Shell command failed
    #[error("shell error: {0}")]
    Shell(#[from] ShellError),

    /// CRIB provisioning failed
    #[error("crib error: {0}")]
    Crib(#[from] CribError),

    /// Funding stage failed
    #[error("funding failed: {0}")]
    Funding(#[from] FundingError),

    /// Job creation failed
    #[error("job creation failed: {0}")]
    Jobs(#[from] JobError),

    /// Post-setup verification failed
    #[error("verification failed: {0}")]
    Verification(#[from] VerificationError),

    /// A declared dependency of a stage has not completed
    #[error("missing dependency for {stage}: {dependency}")]
    MissingDependency {
        /// Stage that needed the dependency
        stage: &'static str,
        /// What was missing
        dependency: String,
    },

    /// Operation failed, wrapped with its identity
    #[error("operation '{name}' (v{version}) failed: {source}")]
    Operation {
        /// Operation name
        name: &'static str,
        /// Operation version
        version: &'static str,
        /// Underlying cause
        #[source]
        source: Box<EnvError>,
    },

    /// Stage failed with a human-readable hint attached
    #[error("{source}; {hint}")]
    WithHint {
        /// Underlying cause
        #[source]
        source: Box<EnvError>,
        /// What the user can do about it
        hint: String,
    },

    /// A background stage failed
    #[error("background stage failed: {0}")]
    Background(Box<EnvError>),

    /// A spawned task panicked or was aborted
    #[error("task join failed: {0}")]
    Join(String),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Cancelled through the cancellation token
    #[error("operation cancelled")]
    Cancelled,
}

impl EnvError {
    /// Check if error is an input-validation error (raised before side effects)
    #[inline]
    #[must_use]
    pub fn is_validation(&self) -> bool {
        match self {
            Self::Topology(_) => true,
            Self::Overlay(err) => err.is_validation(),
            Self::Crib(err) => err.is_validation(),
            Self::Operation { source, .. } | Self::WithHint { source, .. } => {
                source.is_validation()
            }
            _ => false,
        }
    }

    /// Wrap with operation identity
    #[inline]
    #[must_use]
    pub fn in_operation(self, name: &'static str, version: &'static str) -> Self {
        Self::Operation {
            name,
            version,
            source: Box::new(self),
        }
    }

    /// Attach a hint for the user
    #[inline]
    #[must_use]
    pub fn with_hint(self, hint: impl Into<String>) -> Self {
        Self::WithHint {
            source: Box::new(self),
            hint: hint.into(),
        }
    }

    /// Render the full cause chain on one line
    #[must_use]
    pub fn chain(&self) -> String {
        let mut out = self.to_string();
        let mut current: Option<&dyn std::error::Error> = std::error::Error::source(self);
        while let Some(cause) = current {
            let text = cause.to_string();
            if !out.contains(&text) {
                out.push_str(": ");
                out.push_str(&text);
            }
            current = cause.source();
        }
        out
    }
}

/// Topology validation and construction errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    /// No node sets were declared
    #[error("at least one node set is required")]
    NoNodeSets,

    /// Node set has no nodes
    #[error("node set '{0}' has no nodes")]
    EmptyNodeSet(String),

    /// Node set names must be unique
    #[error("duplicate node set name '{0}'")]
    DuplicateName(String),

    /// Bootstrap index outside node range
    #[error("node set '{name}' declares bootstrap node index {index}, but has only {count} nodes")]
    InvalidBootstrapIndex {
        /// Node set name
        name: String,
        /// Declared index
        index: i32,
        /// Node count
        count: usize,
    },

    /// Gateway index outside node range
    #[error("node set '{name}' declares gateway node index {index}, but has only {count} nodes")]
    InvalidGatewayIndex {
        /// Node set name
        name: String,
        /// Declared index
        index: i32,
        /// Node count
        count: usize,
    },

    /// Node set has no DON type
    #[error("node set '{0}' must declare at least one DON type (workflow, gateway, capabilities)")]
    MissingDonType(String),

    /// Flag used as DON type is a capability
    #[error("flag '{flag}' in node set '{name}' is not a DON type")]
    NotADonType {
        /// Node set name
        name: String,
        /// Offending flag
        flag: CapabilityFlag,
    },

    /// Unknown flag string
    #[error("unknown capability flag '{0}'")]
    UnknownFlag(String),

    /// Workflow DON exists but no gateway DON
    #[error("workflow DON '{0}' requires a gateway DON, but none was declared")]
    MissingGateway(String),

    /// More than one gateway DON
    #[error("expected exactly one gateway DON, found {0}")]
    MultipleGateways(usize),

    /// Workflow DON count other than one
    #[error("expected exactly one workflow DON, found {0}")]
    WorkflowDonCount(usize),

    /// Workflow DON declared without a bootstrap node
    #[error("workflow DON '{0}' must have a bootstrap node, bootstrap node index -1 is only allowed for other DONs")]
    WorkflowWithoutBootstrap(String),

    /// No bootstrap node to derive global peering from
    #[error("no bootstrap node found in workflow DON '{0}'")]
    MissingBootstrap(String),

    /// Peer id not yet injected into the topology
    #[error("node {index} of DON '{don}' has no p2p peer id, keys must be added before peering is derived")]
    MissingPeerId {
        /// DON name
        don: String,
        /// Node index
        index: usize,
    },

    /// Env vars set in two places
    #[error("extra env vars for nodes are provided in the config for the {0} DON, but you tried to provide them programmatically. Please set them only in one place")]
    ConflictingEnvVars(String),
}

/// Nonce allocator errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NonceError {
    /// Chain was not seeded
    #[error("no nonce tracked for chain {0}")]
    UnknownChain(u64),

    /// Decrement below zero
    #[error("nonce for chain {0} cannot go below zero")]
    Underflow(u64),

    /// Pending nonce query failed
    #[error("failed to get nonce for chain {chain_id}: {reason}")]
    Query {
        /// Chain id
        chain_id: u64,
        /// Cause
        reason: String,
    },
}

/// Key generation errors
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// Keys already injected
    #[error("keys have already been added to this topology")]
    AlreadyInjected,

    /// Generated keys do not match topology shape
    #[error("no generated {kind} key for node {index} of DON {don_id}")]
    MissingKey {
        /// Key kind
        kind: &'static str,
        /// DON id
        don_id: u32,
        /// Node index
        index: usize,
    },

    /// Passphrase expansion failed
    #[error("failed to expand the password: {0}")]
    Kdf(String),

    /// Encryption failed
    #[error("failed to encrypt/decrypt key material")]
    Cipher,

    /// Password did not decrypt
    #[error("the provided password was invalid")]
    InvalidPassword,

    /// Key material malformed
    #[error("malformed key material: {0}")]
    Malformed(String),

    /// Keystore JSON failure
    #[error("keystore serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Secrets TOML failure
    #[error("secrets serialization failed: {0}")]
    Toml(#[from] toml::ser::Error),
}

/// Config overlay errors
#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    /// Partial override set
    #[error("{found} out of {total} node specs have {kind} overrides. Either provide overrides for all nodes or none at all")]
    PartialOverrides {
        /// "config" or "secrets"
        kind: &'static str,
        /// Nodes with overrides
        found: usize,
        /// Node count
        total: usize,
    },

    /// Configs without secrets
    #[error("node config overrides are provided for DON {0}, but not secrets. You need to either provide both, only secrets or nothing at all")]
    ConfigsWithoutSecrets(u32),

    /// More than one bootstrap
    #[error("multiple bootstrap nodes within a DON found, expected only one")]
    MultipleBootstraps,

    /// More than one Solana chain
    #[error("multiple Solana chains found, expected only one")]
    MultipleSolanaChains,

    /// Missing node index in generated overlay set
    #[error("no config overlay generated for node index {index} in DON '{don}'")]
    MissingNodeIndex {
        /// DON name
        don: String,
        /// Node index
        index: usize,
    },

    /// Overlay keyed by an index the DON does not have
    #[error("config overlay generated for node index {index} in DON '{don}', which has only {nodes} nodes")]
    UnexpectedNodeIndex {
        /// DON name
        don: String,
        /// Node index
        index: usize,
        /// Node count
        nodes: usize,
    },

    /// Required contract not in address book
    #[error("no {contract} address found for chain selector {selector}")]
    MissingContract {
        /// Contract kind
        contract: String,
        /// Chain selector
        selector: u64,
    },

    /// Home chain not provisioned
    #[error("home chain with selector {0} not found in blockchain outputs")]
    MissingHomeChain(u64),

    /// Bootstrap host/peer not resolved
    #[error("bootstrap node of DON '{0}' has no resolved {1}")]
    UnresolvedBootstrap(String, &'static str),

    /// Node without a required address
    #[error("node {index} of DON '{don}' has no address for chain {chain_id}")]
    MissingNodeAddress {
        /// DON name
        don: String,
        /// Node index
        index: usize,
        /// Chain id
        chain_id: u64,
    },

    /// Gateway connector not set but required
    #[error("DON '{0}' has the workflow flag but the topology has no gateway connector")]
    MissingGatewayConnector(String),

    /// Transformer failed
    #[error("config transformer '{name}' failed: {reason}")]
    Transformer {
        /// Transformer name
        name: String,
        /// Cause
        reason: String,
    },

    /// Secrets generation failed
    #[error("failed to generate secrets: {0}")]
    Secrets(#[from] KeyError),
}

impl OverlayError {
    /// Check if this is an input-validation failure
    #[inline]
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::PartialOverrides { .. }
                | Self::ConfigsWithoutSecrets(_)
                | Self::MultipleBootstraps
                | Self::MultipleSolanaChains
        )
    }
}

/// External collaborator errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Collaborator call failed
    #[error("{component}: {reason}")]
    Failed {
        /// Component name
        component: &'static str,
        /// Cause
        reason: String,
    },

    /// Capability not supported by this collaborator
    #[error("{component} does not support {what}")]
    Unsupported {
        /// Component name
        component: &'static str,
        /// Missing feature
        what: String,
    },

    /// Response could not be decoded
    #[error("{component} returned an invalid response: {reason}")]
    InvalidResponse {
        /// Component name
        component: &'static str,
        /// Cause
        reason: String,
    },

    /// Cancelled
    #[error("{0} call cancelled")]
    Cancelled(&'static str),
}

impl ProviderError {
    /// Create a failure for a component
    #[inline]
    pub fn failed(component: &'static str, reason: impl Into<String>) -> Self {
        Self::Failed {
            component,
            reason: reason.into(),
        }
    }
}

/// Shell runner errors
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    /// Non-zero exit
    #[error("command failed with exit code {code}")]
    CommandFailed {
        /// Command line
        command: String,
        /// Exit code
        code: i32,
        /// Captured stderr
        stderr: String,
    },

    /// Killed by signal
    #[error("command '{0}' terminated by signal")]
    Terminated(String),

    /// Spawn failure
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        /// Command line
        command: String,
        /// Cause
        #[source]
        source: std::io::Error,
    },

    /// Output not UTF-8
    #[error("command '{0}' produced non UTF-8 output")]
    InvalidOutput(String),

    /// Cancelled
    #[error("command '{0}' cancelled")]
    Cancelled(String),
}

/// Funding errors
#[derive(Debug, thiserror::Error)]
pub enum FundingError {
    /// Nonce map construction failed
    #[error("failed to create concurrent nonce map: {0}")]
    NonceMap(#[from] NonceError),

    /// A single transfer failed
    #[error("failed to fund node {address} on chain {chain_id}: {source}")]
    Transfer {
        /// Recipient
        address: String,
        /// Chain id
        chain_id: u64,
        /// Cause
        #[source]
        source: ProviderError,
    },

    /// Solana address could not be decoded
    #[error("invalid solana address '{0}'")]
    InvalidSolanaAddress(String),

    /// Solana chain without funder key
    #[error("solana chain {0} has no funder keypair")]
    MissingFunder(u64),

    /// Worker task failed
    #[error("funding task failed: {0}")]
    Task(String),
}

/// Job creation errors
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Nothing to create
    #[error("invalid create jobs input: {0}")]
    InvalidInput(String),

    /// Job spec factory failed
    #[error("failed to generate job specs: {0}")]
    Factory(String),

    /// Linking to JD failed
    #[error("failed to link node {node} to job distributor after {attempts} attempts: {source}")]
    Link {
        /// Node name
        node: String,
        /// Attempts made
        attempts: u32,
        /// Last cause
        #[source]
        source: ProviderError,
    },

    /// Proposal or acceptance failed
    #[error("failed to create job on node {node}: {source}")]
    Create {
        /// Node name
        node: String,
        /// Cause
        #[source]
        source: ProviderError,
    },

    /// Node without JD id
    #[error("node {0} is not registered with the job distributor")]
    NotLinked(String),
}

/// Verification errors
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    /// Timed out
    #[error("timed out, when waiting for {seconds:.2} seconds, {what}")]
    Timeout {
        /// Seconds waited
        seconds: f64,
        /// What was awaited
        what: String,
    },

    /// Health check never passed
    #[error("node {node} did not report a passing '{check}' health check after {attempts} attempts")]
    Unhealthy {
        /// Node name
        node: String,
        /// Check pattern
        check: String,
        /// Attempts made
        attempts: u32,
    },

    /// Node API failure
    #[error("node {node}: {source}")]
    Node {
        /// Node name
        node: String,
        /// Cause
        #[source]
        source: ProviderError,
    },

    /// Invalid check pattern
    #[error("invalid health check pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// CRIB provisioning errors
#[derive(Debug, thiserror::Error)]
pub enum CribError {
    /// Image reference without a tag
    #[error("docker image must have an explicit tag, but it was: {0}")]
    UntaggedImage(String),

    /// Node set mixes images
    #[error("all nodes in each nodeset must use the same Docker image, but {0} different images were found")]
    MixedImages(usize),

    /// Cloud provider needs team tags
    #[error("team input is required when the crib provider is '{0}'")]
    MissingTeam(String),

    /// Chain family CRIB cannot deploy
    #[error("crib cannot deploy {0} chains")]
    UnsupportedFamily(String),

    /// Reading or writing a file in the configs directory
    #[error("{path}: {source}")]
    Io {
        /// File path
        path: String,
        /// Cause
        #[source]
        source: std::io::Error,
    },

    /// Output file could not be decoded
    #[error("failed to read {path}: {source}")]
    Output {
        /// File path
        path: String,
        /// Cause
        #[source]
        source: serde_json::Error,
    },

    /// Override is not valid TOML
    #[error("failed to normalize TOML override for node {index}: {reason}")]
    InvalidOverride {
        /// Node index
        index: usize,
        /// Cause
        reason: String,
    },

    /// devspace command failed
    #[error("failed to run {step}: {source}")]
    Step {
        /// devspace step
        step: &'static str,
        /// Cause
        #[source]
        source: ShellError,
    },
}

impl CribError {
    /// Check if this is an input-validation failure
    #[inline]
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::UntaggedImage(_) | Self::MixedImages(_) | Self::MissingTeam(_) | Self::UnsupportedFamily(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_override_message_matches_wording() {
        let err = OverlayError::PartialOverrides {
            kind: "config",
            found: 2,
            total: 4,
        };
        assert_eq!(
            err.to_string(),
            "2 out of 4 node specs have config overrides. Either provide overrides for all nodes or none at all"
        );
    }

    #[test]
    fn shell_failure_reports_exit_code() {
        let err = ShellError::CommandFailed {
            command: "devspace run deploy-jd".into(),
            code: 3,
            stderr: String::new(),
        };
        assert_eq!(err.to_string(), "command failed with exit code 3");
    }

    #[test]
    fn operation_wrapping_keeps_validation_class() {
        let err = EnvError::from(TopologyError::NoNodeSets).in_operation("build-topology", "1.0.0");
        assert!(err.is_validation());
        assert!(err.to_string().contains("build-topology"));

        let err = EnvError::Cancelled.in_operation("fund-nodes", "1.0.0");
        assert!(!err.is_validation());
    }

    #[test]
    fn hint_is_appended() {
        let err = EnvError::from(ProviderError::failed("jd", "pull access denied"))
            .with_hint(JD_IMAGE_PULL_HINT);
        assert!(err.to_string().ends_with(JD_IMAGE_PULL_HINT));
    }

    #[test]
    fn chain_renders_causes_once() {
        let err = EnvError::from(FundingError::Task("boom".into())).in_operation("fund-nodes", "1.0.0");
        let chain = err.chain();
        assert_eq!(chain.matches("boom").count(), 1);
    }
}

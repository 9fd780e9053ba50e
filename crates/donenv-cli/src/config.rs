//! Environment configuration file and built-in topology presets

use anyhow::{Context, Result};
use donenv_core::provider::JdInput;
use donenv_core::stages::{default_job_spec_factories, FundingAmounts, HealthWaitInput, LinkJdInput};
use donenv_core::{BlockchainInput, CapabilityFlag, InfraInput, NodeSetInput, SetupInput, VerificationSettings};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Local simulated geth chain
pub const DEFAULT_CHAIN_ID: u64 = 1337;
/// Selector of the local simulated geth chain
pub const DEFAULT_CHAIN_SELECTOR: u64 = 3_379_446_385_462_418_246;

const WEI_PER_GWEI: u128 = 1_000_000_000;

/// Built-in DON layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyPreset {
    /// One workflow DON that also hosts the gateway
    Simplified,
    /// Separate workflow, capabilities and gateway DONs
    Full,
}

impl TopologyPreset {
    /// Names accepted on the command line
    pub const NAMES: [&'static str; 2] = ["simplified", "full"];

    /// Node sets of the preset, every node running `image`
    #[must_use]
    pub fn node_sets(self, image: &str) -> Vec<NodeSetInput> {
        let workflow_capabilities = [CapabilityFlag::Ocr3, CapabilityFlag::Cron, CapabilityFlag::CustomCompute];

        match self {
            Self::Simplified => vec![NodeSetInput::new("workflow", 4)
                .with_don_types([CapabilityFlag::Workflow, CapabilityFlag::Gateway])
                .with_capabilities(workflow_capabilities)
                .with_bootstrap_index(0)
                .with_gateway_index(0)
                .with_image(image)],
            Self::Full => vec![
                NodeSetInput::new("workflow", 4)
                    .with_don_types([CapabilityFlag::Workflow])
                    .with_capabilities(workflow_capabilities)
                    .with_bootstrap_index(0)
                    .with_image(image),
                NodeSetInput::new("capabilities", 4)
                    .with_don_types([CapabilityFlag::Capabilities])
                    .with_capabilities([CapabilityFlag::WriteEvm])
                    .with_bootstrap_index(0)
                    .with_image(image),
                NodeSetInput::new("gateway", 1)
                    .with_don_types([CapabilityFlag::Gateway])
                    .with_bootstrap_index(-1)
                    .with_gateway_index(0)
                    .with_image(image),
            ],
        }
    }
}

impl FromStr for TopologyPreset {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "simplified" => Ok(Self::Simplified),
            "full" => Ok(Self::Full),
            other => anyhow::bail!("unknown topology '{other}', expected one of: {}", Self::NAMES.join(", ")),
        }
    }
}

impl fmt::Display for TopologyPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simplified => f.write_str("simplified"),
            Self::Full => f.write_str("full"),
        }
    }
}

/// Funding amounts as written in the config file
///
/// TOML integers are 64-bit, so EVM amounts are given in gwei.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingConfig {
    /// Per node on every EVM chain, in gwei
    #[serde(default = "default_evm_gwei")]
    pub evm_gwei: u64,
    /// Per node on every Solana chain
    #[serde(default = "default_solana_lamports")]
    pub solana_lamports: u64,
}

fn default_evm_gwei() -> u64 {
    5_000_000_000
}

fn default_solana_lamports() -> u64 {
    FundingAmounts::default().solana_lamports
}

impl Default for FundingConfig {
    fn default() -> Self {
        Self {
            evm_gwei: default_evm_gwei(),
            solana_lamports: default_solana_lamports(),
        }
    }
}

impl From<FundingConfig> for FundingAmounts {
    fn from(config: FundingConfig) -> Self {
        Self {
            evm_wei: u128::from(config.evm_gwei) * WEI_PER_GWEI,
            solana_lamports: config.solana_lamports,
        }
    }
}

/// Everything `env start` needs besides the command-line flags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvConfig {
    /// Chains to start
    #[serde(default = "default_blockchains")]
    pub blockchains: Vec<BlockchainInput>,
    /// Registry chain; defaults to the first chain
    #[serde(default)]
    pub home_chain_selector: Option<u64>,
    /// DONs; the selected preset fills this when empty
    #[serde(default)]
    pub node_sets: Vec<NodeSetInput>,
    /// Image used by preset node sets
    #[serde(default = "default_node_image")]
    pub node_image: String,
    /// Job Distributor
    #[serde(default = "default_jd")]
    pub jd: JdInput,
    /// Docker or CRIB
    #[serde(default)]
    pub infra: InfraInput,
    /// Funding amounts
    #[serde(default)]
    pub funding: FundingConfig,
    /// Password sealing generated node keys
    #[serde(default = "default_key_password")]
    pub key_password: String,
    /// Program every collaborator call is delegated to
    #[serde(default = "default_backend")]
    pub backend: String,
}

fn default_blockchains() -> Vec<BlockchainInput> {
    vec![BlockchainInput::evm(DEFAULT_CHAIN_ID, DEFAULT_CHAIN_SELECTOR)]
}

fn default_node_image() -> String {
    "chainlink:latest".to_string()
}

fn default_jd() -> JdInput {
    JdInput {
        image: "job-distributor:latest".to_string(),
        ..JdInput::default()
    }
}

fn default_key_password() -> String {
    "password".to_string()
}

fn default_backend() -> String {
    "donenv-backend".to_string()
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            blockchains: default_blockchains(),
            home_chain_selector: None,
            node_sets: Vec::new(),
            node_image: default_node_image(),
            jd: default_jd(),
            infra: InfraInput::default(),
            funding: FundingConfig::default(),
            key_password: default_key_password(),
            backend: default_backend(),
        }
    }
}

impl EnvConfig {
    /// Read a TOML config file
    ///
    /// # Errors
    /// Fails if the file cannot be read or is not a valid config.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Config file if given, defaults otherwise, with empty node sets
    /// replaced by the preset
    ///
    /// # Errors
    /// Fails if the config file cannot be loaded.
    pub fn resolve(path: Option<&Path>, preset: TopologyPreset) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        if config.node_sets.is_empty() {
            config.node_sets = preset.node_sets(&config.node_image);
        }
        Ok(config)
    }

    /// Registry chain selector
    ///
    /// # Errors
    /// Fails if no chain is configured.
    pub fn home_chain_selector(&self) -> Result<u64> {
        self.home_chain_selector
            .or_else(|| self.blockchains.first().map(|chain| chain.chain_selector))
            .context("at least one blockchain must be configured")
    }

    /// Pipeline input with default stage settings
    ///
    /// # Errors
    /// Fails if no chain is configured.
    pub fn setup_input(&self, extra_allowed_ports: Vec<u16>) -> Result<SetupInput> {
        Ok(SetupInput {
            blockchains: self.blockchains.clone(),
            home_chain_selector: self.home_chain_selector()?,
            node_sets: self.node_sets.clone(),
            jd: self.jd.clone(),
            infra: self.infra.clone(),
            key_password: self.key_password.clone(),
            funding: self.funding.into(),
            transformers: Vec::new(),
            job_factories: default_job_spec_factories(),
            extra_allowed_ports,
            link: LinkJdInput::default(),
            health: HealthWaitInput::default(),
            verification: VerificationSettings::default(),
            ocr3: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use donenv_core::topology::validate_topology;
    use pretty_assertions::assert_eq;

    #[test]
    fn presets_are_valid_topologies() {
        for preset in [TopologyPreset::Simplified, TopologyPreset::Full] {
            let sets = preset.node_sets("chainlink:2.23.0");
            validate_topology(&sets).unwrap();
        }
    }

    #[test]
    fn simplified_preset_is_one_four_node_don() {
        let sets = TopologyPreset::Simplified.node_sets("chainlink:2.23.0");
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].nodes.len(), 4);
        assert!(sets[0].don_types.has(CapabilityFlag::Gateway));
        assert!(sets[0].nodes.iter().all(|node| node.image == "chainlink:2.23.0"));
    }

    #[test]
    fn full_preset_gateway_has_no_bootstrap() {
        let sets = TopologyPreset::Full.node_sets("chainlink:2.23.0");
        let names: Vec<&str> = sets.iter().map(|set| set.name.as_str()).collect();
        assert_eq!(names, vec!["workflow", "capabilities", "gateway"]);
        assert_eq!(sets[2].bootstrap_node_index, -1);
        assert!(sets[1].capabilities.has(CapabilityFlag::WriteEvm));
    }

    #[test]
    fn preset_names_parse() {
        assert_eq!("full".parse::<TopologyPreset>().unwrap(), TopologyPreset::Full);
        assert!("tiny".parse::<TopologyPreset>().is_err());
    }

    #[test]
    fn funding_gwei_converts_to_wei() {
        let amounts: FundingAmounts = FundingConfig {
            evm_gwei: 2,
            solana_lamports: 7,
        }
        .into();
        assert_eq!(amounts.evm_wei, 2_000_000_000);
        assert_eq!(amounts.solana_lamports, 7);
        assert_eq!(FundingAmounts::from(FundingConfig::default()), FundingAmounts::default());
    }

    #[test]
    fn home_chain_defaults_to_first_chain() {
        let config = EnvConfig::default();
        assert_eq!(config.home_chain_selector().unwrap(), DEFAULT_CHAIN_SELECTOR);

        let empty = EnvConfig {
            blockchains: Vec::new(),
            ..EnvConfig::default()
        };
        assert!(empty.home_chain_selector().is_err());
    }
}

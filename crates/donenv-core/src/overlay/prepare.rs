//! Combining user overrides with generated overlays and secrets

use super::{generate, ConfigTransformer, GenerateConfigsInput};
use crate::error::{OverlayError, TopologyError};
use crate::keys::{node_secrets, GeneratedKeys};
use crate::topology::{NodeSetInput, NodeSpec};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Which overrides a node set brings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverridePairing {
    /// Every node has a config override
    pub configs: bool,
    /// Every node has a secrets override
    pub secrets: bool,
}

/// Check that overrides are all-or-nothing and that configs come with secrets
///
/// # Errors
/// Returns `OverlayError::PartialOverrides` or `OverlayError::ConfigsWithoutSecrets`.
pub fn validate_override_pairing(don_id: u32, nodes: &[NodeSpec]) -> Result<OverridePairing, OverlayError> {
    let total = nodes.len();
    let configs = nodes.iter().filter(|node| node.config_override.is_some()).count();
    let secrets = nodes.iter().filter(|node| node.secrets_override.is_some()).count();

    if configs != 0 && configs != total {
        return Err(OverlayError::PartialOverrides {
            kind: "config",
            found: configs,
            total,
        });
    }
    if secrets != 0 && secrets != total {
        return Err(OverlayError::PartialOverrides {
            kind: "secrets",
            found: secrets,
            total,
        });
    }
    if configs == total && secrets == 0 && total > 0 {
        return Err(OverlayError::ConfigsWithoutSecrets(don_id));
    }

    Ok(OverridePairing {
        configs: configs == total && total > 0,
        secrets: secrets == total && total > 0,
    })
}

/// Copy the node set's env vars onto every node
///
/// # Errors
/// Returns `TopologyError::ConflictingEnvVars` if nodes already declare env vars.
pub fn merge_env_vars(set: &mut NodeSetInput) -> Result<(), TopologyError> {
    if set.env_vars.is_empty() {
        return Ok(());
    }
    if set.nodes.iter().any(|node| !node.env_vars.is_empty()) {
        return Err(TopologyError::ConflictingEnvVars(set.name.clone()));
    }
    for node in &mut set.nodes {
        node.env_vars.clone_from(&set.env_vars);
    }
    Ok(())
}

/// Everything to assemble one node set
pub struct PreparedNodeSetInput<'a> {
    /// Declared node set (env vars already merged)
    pub set: &'a NodeSetInput,
    /// Overlay inputs for the set's DON
    pub configs: GenerateConfigsInput<'a>,
    /// Generated keys
    pub keys: &'a GeneratedKeys,
    /// Extra config transformers
    pub transformers: &'a [Arc<dyn ConfigTransformer>],
}

/// Final config and secrets of one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedNode {
    /// Node index
    pub index: usize,
    /// Config TOML
    pub config: String,
    /// Secrets TOML
    pub secrets: String,
    /// Environment
    pub env_vars: BTreeMap<String, String>,
}

/// Resolve configs and secrets for every node, generating what the user
/// did not provide
///
/// # Errors
/// Returns pairing, generation or secrets errors.
pub fn prepare_node_set(input: &PreparedNodeSetInput<'_>) -> Result<Vec<PreparedNode>, OverlayError> {
    let set = input.set;
    let don = input.configs.don;
    let pairing = validate_override_pairing(don.id, &set.nodes)?;

    let configs: Vec<String> = if pairing.configs {
        set.nodes
            .iter()
            .map(|node| node.config_override.clone().unwrap_or_default())
            .collect()
    } else {
        let generated = generate(&input.configs, input.transformers)?;
        (0..set.nodes.len())
            .map(|index| {
                generated
                    .get(&index)
                    .cloned()
                    .ok_or_else(|| OverlayError::MissingNodeIndex {
                        don: don.name.clone(),
                        index,
                    })
            })
            .collect::<Result<_, _>>()?
    };

    let secrets: Vec<String> = if pairing.secrets {
        set.nodes
            .iter()
            .map(|node| node.secrets_override.clone().unwrap_or_default())
            .collect()
    } else {
        node_secrets(don, input.keys)?
    };

    tracing::debug!(
        don = %don.name,
        user_configs = pairing.configs,
        user_secrets = pairing.secrets,
        "prepared node set"
    );

    Ok(set
        .nodes
        .iter()
        .zip(configs.into_iter().zip(secrets))
        .enumerate()
        .map(|(index, (node, (config, secrets)))| PreparedNode {
            index,
            config,
            secrets,
            env_vars: node.env_vars.clone(),
        })
        .collect())
}

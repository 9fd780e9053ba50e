//! Infrastructure descriptor
//!
//! Decides how node hosts are named and which provisioning variant
//! (local containers or CRIB) is used.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where the environment runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InfraInput {
    /// Local containers
    Docker,
    /// Kubernetes namespace driven by devspace inside a nix shell
    Crib(CribInput),
}

impl Default for InfraInput {
    fn default() -> Self {
        Self::Docker
    }
}

/// CRIB settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CribInput {
    /// Kubernetes namespace
    pub namespace: String,
    /// Folder holding the devspace project and flake
    pub folder_location: PathBuf,
    /// Cloud provider ("kind" or "aws")
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Directory for generated overrides and output files
    #[serde(default = "default_configs_dir")]
    pub configs_dir: PathBuf,
    /// Team tags, required when provider is "aws"
    #[serde(default)]
    pub team: Option<TeamInput>,
}

fn default_provider() -> String {
    "kind".to_string()
}

fn default_configs_dir() -> PathBuf {
    PathBuf::from("crib-configs")
}

/// Cost-allocation tags for cloud CRIB
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamInput {
    /// Team
    pub team: String,
    /// Product
    pub product: String,
    /// Cost center
    pub cost_center: String,
    /// Component
    pub component: String,
}

/// Role a node plays within its DON
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Peering bootstrapper
    Bootstrap,
    /// Regular worker
    Worker,
}

impl NodeRole {
    /// Label value
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap",
            Self::Worker => "worker",
        }
    }
}

impl InfraInput {
    /// Host name a node is reachable under from other nodes
    #[must_use]
    pub fn internal_host(&self, node_index: usize, role: NodeRole, don_name: &str) -> String {
        match self {
            Self::Docker => format!("{don_name}-node{node_index}"),
            Self::Crib(crib) => match role {
                NodeRole::Bootstrap => format!("{}-{don_name}-bt-{node_index}", crib.namespace),
                NodeRole::Worker => format!("{}-{don_name}-{node_index}", crib.namespace),
            },
        }
    }

    /// Whether this is the CRIB variant
    #[inline]
    #[must_use]
    pub fn is_crib(&self) -> bool {
        matches!(self, Self::Crib(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_hosts_follow_don_name() {
        let infra = InfraInput::Docker;
        assert_eq!(infra.internal_host(2, NodeRole::Worker, "workflow"), "workflow-node2");
        assert_eq!(infra.internal_host(0, NodeRole::Bootstrap, "gateway"), "gateway-node0");
    }

    #[test]
    fn crib_hosts_are_namespaced() {
        let infra = InfraInput::Crib(CribInput {
            namespace: "crib-local".into(),
            folder_location: PathBuf::from("/tmp/crib"),
            provider: default_provider(),
            configs_dir: default_configs_dir(),
            team: None,
        });
        assert_eq!(infra.internal_host(0, NodeRole::Bootstrap, "workflow"), "crib-local-workflow-bt-0");
        assert_eq!(infra.internal_host(3, NodeRole::Worker, "workflow"), "crib-local-workflow-3");
    }

    #[test]
    fn infra_parses_from_toml() {
        let infra: InfraInput = toml::from_str("type = \"docker\"").unwrap();
        assert_eq!(infra, InfraInput::Docker);

        let infra: InfraInput =
            toml::from_str("type = \"crib\"\nnamespace = \"ns\"\nfolder_location = \"/crib\"").unwrap();
        assert!(infra.is_crib());
    }
}

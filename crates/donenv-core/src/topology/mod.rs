//! DON topology model
//!
//! Provides:
//! - Node-set declarations as read from config
//! - The built topology (DONs, node roles, hosts, gateway wiring)
//! - Typed per-node metadata filled in by later stages
//! - Peering data derived from the workflow DON's bootstrap node

mod builder;
mod peering;

pub use builder::{build_topology, validate_topology};
pub use peering::{find_peering_data, OcrPeeringData, PeeringData, CAPABILITIES_PEERING_PORT, OCR_PEERING_PORT};

use crate::flags::{CapabilityFlag, FlagSet};
use crate::infra::NodeRole;
use crate::keys::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Port nodes accept gateway connections on
pub const GATEWAY_OUTGOING_PORT: u16 = 5003;
/// Gateway's user-facing port
pub const GATEWAY_INCOMING_PORT: u16 = 5002;

/// One node process within a node set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Container image, including tag
    #[serde(default)]
    pub image: String,
    /// User-provided config TOML
    #[serde(default)]
    pub config_override: Option<String>,
    /// User-provided secrets TOML
    #[serde(default)]
    pub secrets_override: Option<String>,
    /// Extra environment variables
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
}

/// Declaration of one DON and its node set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSetInput {
    /// Unique name
    pub name: String,
    /// Node processes
    pub nodes: Vec<NodeSpec>,
    /// DON types (workflow, gateway, capabilities)
    #[serde(default)]
    pub don_types: FlagSet,
    /// Capabilities hosted by the DON
    #[serde(default)]
    pub capabilities: FlagSet,
    /// Bootstrap node index, -1 for none
    #[serde(default)]
    pub bootstrap_node_index: i32,
    /// Gateway node index, used when the gateway flag is set
    #[serde(default)]
    pub gateway_node_index: i32,
    /// Env vars copied onto every node
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    /// Chain ids the DON participates in; empty means all
    #[serde(default)]
    pub supported_chains: Vec<u64>,
}

impl NodeSetInput {
    /// Create a node set of `count` default nodes
    #[must_use]
    pub fn new(name: impl Into<String>, count: usize) -> Self {
        Self {
            name: name.into(),
            nodes: vec![NodeSpec::default(); count],
            don_types: FlagSet::new(),
            capabilities: FlagSet::new(),
            bootstrap_node_index: 0,
            gateway_node_index: 0,
            env_vars: BTreeMap::new(),
            supported_chains: Vec::new(),
        }
    }

    /// Set DON types
    #[must_use]
    pub fn with_don_types(mut self, flags: impl IntoIterator<Item = CapabilityFlag>) -> Self {
        self.don_types.extend(flags);
        self
    }

    /// Set capabilities
    #[must_use]
    pub fn with_capabilities(mut self, flags: impl IntoIterator<Item = CapabilityFlag>) -> Self {
        self.capabilities.extend(flags);
        self
    }

    /// Set bootstrap index
    #[inline]
    #[must_use]
    pub fn with_bootstrap_index(mut self, index: i32) -> Self {
        self.bootstrap_node_index = index;
        self
    }

    /// Set gateway index
    #[inline]
    #[must_use]
    pub fn with_gateway_index(mut self, index: i32) -> Self {
        self.gateway_node_index = index;
        self
    }

    /// Set image on every node
    #[must_use]
    pub fn with_image(mut self, image: &str) -> Self {
        for node in &mut self.nodes {
            node.image = image.to_string();
        }
        self
    }

    /// Restrict to chain ids
    #[must_use]
    pub fn with_supported_chains(mut self, chains: impl IntoIterator<Item = u64>) -> Self {
        self.supported_chains.extend(chains);
        self
    }

    /// DON types plus capabilities
    #[must_use]
    pub fn flags(&self) -> FlagSet {
        self.don_types.iter().chain(self.capabilities.iter()).collect()
    }
}

/// Typed per-node record, accumulated by stages and queried by name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    /// Position within the DON
    pub index: usize,
    /// Bootstrap or worker
    pub role: NodeRole,
    /// Extra gateway role
    pub is_gateway: bool,
    /// Host reachable from other nodes
    pub host: String,
    /// Owning DON id
    pub don_id: u32,
    /// Owning DON name
    pub don_name: String,
    /// Injected with keys
    pub p2p_peer_id: Option<PeerId>,
    /// Injected with keys, keyed by chain id
    pub addresses: BTreeMap<u64, String>,
}

impl NodeMetadata {
    /// Whether this is the DON's bootstrap node
    #[inline]
    #[must_use]
    pub fn is_bootstrap(&self) -> bool {
        self.role == NodeRole::Bootstrap
    }

    /// Account address on a chain
    #[must_use]
    pub fn address(&self, chain_id: u64) -> Option<&str> {
        self.addresses.get(&chain_id).map(String::as_str)
    }

    /// Container/pod name
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}-node{}", self.don_name, self.index)
    }
}

/// One DON in the built topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonMetadata {
    /// 1-based id, in input order
    pub id: u32,
    /// Name
    pub name: String,
    /// DON types and capabilities
    pub flags: FlagSet,
    /// Nodes in index order
    pub nodes: Vec<NodeMetadata>,
    /// Chain ids the DON participates in; empty means all
    pub supported_chains: Vec<u64>,
}

impl DonMetadata {
    /// Check a flag
    #[inline]
    #[must_use]
    pub fn has(&self, flag: CapabilityFlag) -> bool {
        self.flags.has(flag)
    }

    /// Whether the DON uses a chain
    #[must_use]
    pub fn supports_chain(&self, chain_id: u64) -> bool {
        self.supported_chains.is_empty() || self.supported_chains.contains(&chain_id)
    }

    /// Bootstrap nodes (at most one in a valid topology)
    pub fn bootstraps(&self) -> impl Iterator<Item = &NodeMetadata> {
        self.nodes.iter().filter(|node| node.is_bootstrap())
    }

    /// Worker nodes
    pub fn workers(&self) -> impl Iterator<Item = &NodeMetadata> {
        self.nodes.iter().filter(|node| !node.is_bootstrap())
    }

    /// Node with the gateway role
    #[must_use]
    pub fn gateway_node(&self) -> Option<&NodeMetadata> {
        self.nodes.iter().find(|node| node.is_gateway)
    }
}

/// Where nodes reach the gateway and where users reach it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConnectorOutput {
    /// Gateway node host
    pub host: String,
    /// Path nodes connect to
    pub path: String,
    /// Port nodes connect to
    pub port: u16,
    /// Path users connect to
    pub incoming_path: String,
    /// Port users connect to
    pub incoming_port: u16,
}

impl GatewayConnectorOutput {
    /// Create for a gateway host with the default ports and paths
    #[must_use]
    pub fn for_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            path: "/node".to_string(),
            port: GATEWAY_OUTGOING_PORT,
            incoming_path: "/".to_string(),
            incoming_port: GATEWAY_INCOMING_PORT,
        }
    }

    /// URL nodes dial
    #[must_use]
    pub fn node_url(&self) -> String {
        format!("ws://{}:{}{}", self.host, self.port, self.path)
    }
}

/// Built topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    /// Id of the workflow DON
    pub workflow_don_id: u32,
    /// Selector of the registry chain
    pub home_chain_selector: u64,
    /// DONs in input order
    pub dons: Vec<DonMetadata>,
    /// Gateway wiring, when a gateway DON exists
    pub gateway_connector: Option<GatewayConnectorOutput>,
    #[serde(default)]
    pub(crate) keys_injected: bool,
}

impl Topology {
    /// Look up a DON by id
    #[must_use]
    pub fn don(&self, id: u32) -> Option<&DonMetadata> {
        self.dons.iter().find(|don| don.id == id)
    }

    /// Look up a DON by name
    #[must_use]
    pub fn don_by_name(&self, name: &str) -> Option<&DonMetadata> {
        self.dons.iter().find(|don| don.name == name)
    }

    /// The workflow DON
    #[must_use]
    pub fn workflow_don(&self) -> Option<&DonMetadata> {
        self.don(self.workflow_don_id)
    }

    /// DONs carrying a flag
    pub fn dons_with(&self, flag: CapabilityFlag) -> impl Iterator<Item = &DonMetadata> {
        self.dons.iter().filter(move |don| don.has(flag))
    }

    /// Total node count
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.dons.iter().map(|don| don.nodes.len()).sum()
    }

    /// Whether keys have been injected
    #[inline]
    #[must_use]
    pub fn has_keys(&self) -> bool {
        self.keys_injected
    }
}

//! Topology validation and construction

use super::{DonMetadata, GatewayConnectorOutput, NodeMetadata, NodeSetInput, Topology};
use crate::error::TopologyError;
use crate::flags::CapabilityFlag;
use crate::infra::{InfraInput, NodeRole};
use std::collections::{BTreeMap, HashSet};

/// Check node-set declarations before anything is built
///
/// # Errors
/// Returns the first violated rule.
pub fn validate_topology(node_sets: &[NodeSetInput]) -> Result<(), TopologyError> {
    if node_sets.is_empty() {
        return Err(TopologyError::NoNodeSets);
    }

    let mut names = HashSet::new();
    let mut workflow_dons = Vec::new();
    let mut gateway_dons = 0usize;

    for set in node_sets {
        if !names.insert(set.name.as_str()) {
            return Err(TopologyError::DuplicateName(set.name.clone()));
        }
        if set.nodes.is_empty() {
            return Err(TopologyError::EmptyNodeSet(set.name.clone()));
        }

        let count = set.nodes.len();
        if !index_in_range(set.bootstrap_node_index, count, true) {
            return Err(TopologyError::InvalidBootstrapIndex {
                name: set.name.clone(),
                index: set.bootstrap_node_index,
                count,
            });
        }

        if set.don_types.is_empty() {
            return Err(TopologyError::MissingDonType(set.name.clone()));
        }
        if let Some(flag) = set.don_types.iter().find(|flag| !flag.is_don_type()) {
            return Err(TopologyError::NotADonType {
                name: set.name.clone(),
                flag,
            });
        }

        if set.don_types.has(CapabilityFlag::Gateway) {
            if !index_in_range(set.gateway_node_index, count, false) {
                return Err(TopologyError::InvalidGatewayIndex {
                    name: set.name.clone(),
                    index: set.gateway_node_index,
                    count,
                });
            }
            gateway_dons += 1;
        }
        if set.don_types.has(CapabilityFlag::Workflow) {
            if set.bootstrap_node_index == -1 {
                return Err(TopologyError::WorkflowWithoutBootstrap(set.name.clone()));
            }
            workflow_dons.push(set.name.as_str());
        }
    }

    match workflow_dons.as_slice() {
        [workflow] => match gateway_dons {
            0 => Err(TopologyError::MissingGateway((*workflow).to_string())),
            1 => Ok(()),
            n => Err(TopologyError::MultipleGateways(n)),
        },
        other => Err(TopologyError::WorkflowDonCount(other.len())),
    }
}

fn index_in_range(index: i32, count: usize, allow_none: bool) -> bool {
    if index == -1 {
        return allow_none;
    }
    usize::try_from(index).is_ok_and(|index| index < count)
}

/// Build the topology from node sets
///
/// DON ids follow input order starting at 1. The result only depends on
/// the inputs.
///
/// # Errors
/// Returns the validation error if the node sets are invalid.
pub fn build_topology(
    node_sets: &[NodeSetInput],
    infra: &InfraInput,
    home_chain_selector: u64,
) -> Result<Topology, TopologyError> {
    validate_topology(node_sets)?;

    let mut dons = Vec::with_capacity(node_sets.len());
    let mut workflow_don_id = 0;
    let mut gateway_connector = None;

    for (position, set) in node_sets.iter().enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        let id = position as u32 + 1;
        let flags = set.flags();
        let is_gateway_don = flags.has(CapabilityFlag::Gateway);

        let nodes: Vec<NodeMetadata> = (0..set.nodes.len())
            .map(|index| {
                let role = if i32::try_from(index).is_ok_and(|i| i == set.bootstrap_node_index) {
                    NodeRole::Bootstrap
                } else {
                    NodeRole::Worker
                };
                NodeMetadata {
                    index,
                    role,
                    is_gateway: is_gateway_don
                        && i32::try_from(index).is_ok_and(|i| i == set.gateway_node_index),
                    host: infra.internal_host(index, role, &set.name),
                    don_id: id,
                    don_name: set.name.clone(),
                    p2p_peer_id: None,
                    addresses: BTreeMap::new(),
                }
            })
            .collect();

        if flags.has(CapabilityFlag::Workflow) {
            workflow_don_id = id;
        }
        if let Some(gateway) = nodes.iter().find(|node| node.is_gateway) {
            gateway_connector = Some(GatewayConnectorOutput::for_host(gateway.host.clone()));
        }

        tracing::debug!(don = %set.name, id, nodes = nodes.len(), flags = %flags, "built DON");
        dons.push(DonMetadata {
            id,
            name: set.name.clone(),
            flags,
            nodes,
            supported_chains: set.supported_chains.clone(),
        });
    }

    Ok(Topology {
        workflow_don_id,
        home_chain_selector,
        dons,
        gateway_connector,
        keys_injected: false,
    })
}

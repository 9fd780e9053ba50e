//! Global peering data
//!
//! Every DON joins the capabilities mesh and the OCR mesh through the
//! workflow DON's bootstrap node.

use super::Topology;
use crate::error::TopologyError;
use crate::keys::PeerId;
use serde::{Deserialize, Serialize};

/// Port of the don2don / capabilities mesh
pub const CAPABILITIES_PEERING_PORT: u16 = 6690;
/// Port of the OCR mesh
pub const OCR_PEERING_PORT: u16 = 5001;

/// Capabilities peering endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeeringData {
    /// Bootstrap peer id
    pub global_bootstrapper_peer_id: PeerId,
    /// Bootstrap host
    pub global_bootstrapper_host: String,
    /// Port
    pub port: u16,
}

/// OCR peering endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcrPeeringData {
    /// Bootstrap peer id
    pub ocr_bootstrapper_peer_id: PeerId,
    /// Bootstrap host
    pub ocr_bootstrapper_host: String,
    /// Port
    pub port: u16,
}

impl PeeringData {
    /// `<peer>@<host>:<port>` locator
    #[must_use]
    pub fn locator(&self) -> String {
        format!(
            "{}@{}:{}",
            self.global_bootstrapper_peer_id.raw(),
            self.global_bootstrapper_host,
            self.port
        )
    }
}

impl OcrPeeringData {
    /// `<peer>@<host>:<port>` locator
    #[must_use]
    pub fn locator(&self) -> String {
        format!(
            "{}@{}:{}",
            self.ocr_bootstrapper_peer_id.raw(),
            self.ocr_bootstrapper_host,
            self.port
        )
    }
}

/// Derive peering data from the workflow DON's bootstrap node
///
/// # Errors
/// Fails if the workflow DON has no bootstrap node or keys were not injected.
pub fn find_peering_data(topology: &Topology) -> Result<(PeeringData, OcrPeeringData), TopologyError> {
    let workflow = topology
        .workflow_don()
        .ok_or(TopologyError::WorkflowDonCount(0))?;
    let bootstrap = workflow
        .bootstraps()
        .next()
        .ok_or_else(|| TopologyError::MissingBootstrap(workflow.name.clone()))?;
    let peer_id = bootstrap
        .p2p_peer_id
        .clone()
        .ok_or_else(|| TopologyError::MissingPeerId {
            don: workflow.name.clone(),
            index: bootstrap.index,
        })?;

    Ok((
        PeeringData {
            global_bootstrapper_peer_id: peer_id.clone(),
            global_bootstrapper_host: bootstrap.host.clone(),
            port: CAPABILITIES_PEERING_PORT,
        },
        OcrPeeringData {
            ocr_bootstrapper_peer_id: peer_id,
            ocr_bootstrapper_host: bootstrap.host.clone(),
            port: OCR_PEERING_PORT,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::CapabilityFlag;
    use crate::infra::{InfraInput, NodeRole};
    use crate::topology::{build_topology, NodeSetInput};

    fn topology() -> Topology {
        let set = NodeSetInput::new("workflow", 3)
            .with_don_types([CapabilityFlag::Workflow, CapabilityFlag::Gateway])
            .with_bootstrap_index(1);
        build_topology(&[set], &InfraInput::Docker, 1).unwrap()
    }

    #[test]
    fn peering_requires_injected_keys() {
        let err = find_peering_data(&topology()).unwrap_err();
        assert_eq!(
            err,
            TopologyError::MissingPeerId {
                don: "workflow".into(),
                index: 1
            }
        );
    }

    #[test]
    fn peering_points_at_bootstrap() {
        let mut topology = topology();
        let peer = PeerId::from_public_key(&[1u8; 32]);
        topology.dons[0].nodes[1].p2p_peer_id = Some(peer.clone());

        let (global, ocr) = find_peering_data(&topology).unwrap();
        assert_eq!(global.locator(), format!("{}@workflow-node1:6690", peer.raw()));
        assert_eq!(ocr.locator(), format!("{}@workflow-node1:5001", peer.raw()));
    }

    #[test]
    fn no_bootstrap_in_workflow_don() {
        let mut topology = topology();
        for node in &mut topology.dons[0].nodes {
            node.role = NodeRole::Worker;
        }
        assert_eq!(
            find_peering_data(&topology).unwrap_err(),
            TopologyError::MissingBootstrap("workflow".into())
        );
    }
}

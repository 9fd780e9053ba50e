//! Node key material
//!
//! Generates P2P, EVM and Solana keys for every node of a topology, encrypts
//! them under one password and injects the public parts (peer ids and
//! per-chain addresses) into the topology. Injection happens once, before
//! the topology is shared with concurrent stages.

pub mod evm;
pub mod keystore;
pub mod p2p;
pub mod secrets;
pub mod solana;

pub use evm::EvmKey;
pub use keystore::{EncryptedKey, KeyCipher};
pub use p2p::{P2PKey, PeerId};
pub use secrets::node_secrets;
pub use solana::{SolanaKey, SolanaKeypair};

use crate::error::KeyError;
use crate::topology::Topology;
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-chain keys of one DON, indexed by node position
pub type ChainKeys<K> = BTreeMap<u64, Vec<K>>;

/// Which keys to generate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRequest {
    /// Password sealing every key
    #[serde(default)]
    pub password: String,
    /// Generate a P2P key per node
    #[serde(default = "default_true")]
    pub p2p: bool,
    /// EVM chain ids that need a key per node
    #[serde(default)]
    pub evm_chain_ids: Vec<u64>,
    /// Solana chain ids that need a key per node
    #[serde(default)]
    pub solana_chain_ids: Vec<u64>,
}

fn default_true() -> bool {
    true
}

/// Generated keys, indexed by DON id
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneratedKeys {
    /// Password the keys are sealed with
    pub password: String,
    /// P2P keys per DON
    pub p2p: BTreeMap<u32, Vec<P2PKey>>,
    /// EVM keys per DON and chain
    pub evm: BTreeMap<u32, ChainKeys<EvmKey>>,
    /// Solana keys per DON and chain
    pub solana: BTreeMap<u32, ChainKeys<SolanaKey>>,
}

/// Generate keys for every node of the topology using the OS rng
///
/// # Errors
/// Returns an error if password expansion or key sealing fails.
pub fn generate_keys(topology: &Topology, request: &KeyRequest) -> Result<GeneratedKeys, KeyError> {
    generate_keys_with_rng(topology, request, &mut OsRng)
}

/// Generate keys with a caller-provided rng
///
/// # Errors
/// Returns an error if password expansion or key sealing fails.
pub fn generate_keys_with_rng<R: RngCore + CryptoRng>(
    topology: &Topology,
    request: &KeyRequest,
    rng: &mut R,
) -> Result<GeneratedKeys, KeyError> {
    let cipher = KeyCipher::new(&request.password, rng)?;
    let mut keys = GeneratedKeys {
        password: request.password.clone(),
        ..GeneratedKeys::default()
    };

    for don in &topology.dons {
        let count = don.nodes.len();

        if request.p2p {
            let peers = (0..count)
                .map(|_| P2PKey::generate(&cipher, rng))
                .collect::<Result<Vec<_>, _>>()?;
            keys.p2p.insert(don.id, peers);
        }

        let mut evm = ChainKeys::new();
        for &chain_id in request.evm_chain_ids.iter().filter(|id| don.supports_chain(**id)) {
            let per_node = (0..count)
                .map(|_| EvmKey::generate(chain_id, &cipher, rng))
                .collect::<Result<Vec<_>, _>>()?;
            evm.insert(chain_id, per_node);
        }
        if !evm.is_empty() {
            keys.evm.insert(don.id, evm);
        }

        let mut solana = ChainKeys::new();
        for &chain_id in request.solana_chain_ids.iter().filter(|id| don.supports_chain(**id)) {
            let per_node = (0..count)
                .map(|_| SolanaKey::generate(chain_id, &cipher, rng))
                .collect::<Result<Vec<_>, _>>()?;
            solana.insert(chain_id, per_node);
        }
        if !solana.is_empty() {
            keys.solana.insert(don.id, solana);
        }

        tracing::debug!(don = %don.name, nodes = count, "generated node keys");
    }

    Ok(keys)
}

/// Inject peer ids and chain addresses into the topology
///
/// # Errors
/// Returns `KeyError::AlreadyInjected` on a second call, or
/// `KeyError::MissingKey` if a node has no generated key.
pub fn add_keys_to_topology(mut topology: Topology, keys: &GeneratedKeys) -> Result<Topology, KeyError> {
    if topology.keys_injected {
        return Err(KeyError::AlreadyInjected);
    }

    for don in &mut topology.dons {
        let don_id = don.id;
        for node in &mut don.nodes {
            let index = node.index;
            let missing = |kind| KeyError::MissingKey { kind, don_id, index };

            if let Some(peers) = keys.p2p.get(&don_id) {
                let key = peers.get(index).ok_or_else(|| missing("p2p"))?;
                node.p2p_peer_id = Some(key.peer_id.clone());
            }

            for (chain_id, per_node) in keys.evm.get(&don_id).into_iter().flatten() {
                let key = per_node.get(index).ok_or_else(|| missing("evm"))?;
                node.addresses.insert(*chain_id, key.address.clone());
            }

            for (chain_id, per_node) in keys.solana.get(&don_id).into_iter().flatten() {
                let key = per_node.get(index).ok_or_else(|| missing("solana"))?;
                node.addresses.insert(*chain_id, key.address.clone());
            }
        }
    }

    topology.keys_injected = true;
    Ok(topology)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::CapabilityFlag;
    use crate::infra::InfraInput;
    use crate::topology::{build_topology, NodeSetInput};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn topology() -> Topology {
        let sets = vec![
            NodeSetInput::new("workflow", 3)
                .with_don_types([CapabilityFlag::Workflow])
                .with_capabilities([CapabilityFlag::Ocr3]),
            NodeSetInput::new("gateway", 1)
                .with_don_types([CapabilityFlag::Gateway])
                .with_bootstrap_index(-1),
        ];
        build_topology(&sets, &InfraInput::Docker, 1).unwrap()
    }

    fn request() -> KeyRequest {
        KeyRequest {
            password: String::new(),
            p2p: true,
            evm_chain_ids: vec![1337, 2337],
            solana_chain_ids: vec![],
        }
    }

    #[test]
    fn keys_cover_every_node_and_chain() {
        let topology = topology();
        let keys = generate_keys_with_rng(&topology, &request(), &mut StdRng::seed_from_u64(11)).unwrap();

        assert_eq!(keys.p2p[&1].len(), 3);
        assert_eq!(keys.p2p[&2].len(), 1);
        assert_eq!(keys.evm[&1][&1337].len(), 3);
        assert_eq!(keys.evm[&1][&2337].len(), 3);
    }

    #[test]
    fn injection_fills_metadata_once() {
        let topology = topology();
        let keys = generate_keys_with_rng(&topology, &request(), &mut StdRng::seed_from_u64(12)).unwrap();
        let topology = add_keys_to_topology(topology, &keys).unwrap();

        let workflow = &topology.dons[0];
        for node in &workflow.nodes {
            let expected = &keys.p2p[&1][node.index].peer_id;
            assert_eq!(node.p2p_peer_id.as_ref(), Some(expected));
            assert_eq!(node.addresses.len(), 2);
        }

        let err = add_keys_to_topology(topology, &keys).unwrap_err();
        assert!(matches!(err, KeyError::AlreadyInjected));
    }

    #[test]
    fn secrets_carry_one_evm_key_per_chain() {
        let topology = topology();
        let keys = generate_keys_with_rng(&topology, &request(), &mut StdRng::seed_from_u64(13)).unwrap();
        let secrets = node_secrets(&topology.dons[0], &keys).unwrap();

        assert_eq!(secrets.len(), 3);
        let parsed: toml::Value = toml::from_str(&secrets[1]).unwrap();
        let evm_keys = parsed["EVM"]["Keys"].as_array().unwrap();
        assert_eq!(evm_keys.len(), 2);
        assert_eq!(evm_keys[0]["ID"].as_integer(), Some(1337));
        assert!(parsed["P2PKey"]["JSON"].as_str().unwrap().contains("aes-256-gcm"));
    }

    #[test]
    fn injection_with_short_key_list_fails() {
        let topology = topology();
        let mut keys = generate_keys_with_rng(&topology, &request(), &mut StdRng::seed_from_u64(14)).unwrap();
        keys.p2p.get_mut(&1).unwrap().pop();
        let err = add_keys_to_topology(topology, &keys).unwrap_err();
        assert!(matches!(err, KeyError::MissingKey { kind: "p2p", index: 2, .. }));
    }
}

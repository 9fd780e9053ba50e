//! Node secrets rendering
//!
//! Each node receives a TOML document with its encrypted EVM keys (one per
//! chain), its P2P key and, when present, its Solana key.

use super::GeneratedKeys;
use crate::error::KeyError;
use crate::topology::DonMetadata;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct NodeSecretsToml {
    #[serde(rename = "EVM", skip_serializing_if = "Option::is_none")]
    evm: Option<ChainKeysToml>,
    #[serde(rename = "P2PKey", skip_serializing_if = "Option::is_none")]
    p2p_key: Option<KeyToml>,
    #[serde(rename = "Solana", skip_serializing_if = "Option::is_none")]
    solana: Option<ChainKeysToml>,
}

#[derive(Debug, Serialize)]
struct ChainKeysToml {
    #[serde(rename = "Keys")]
    keys: Vec<ChainKeyToml>,
}

#[derive(Debug, Serialize)]
struct ChainKeyToml {
    #[serde(rename = "JSON")]
    json: String,
    #[serde(rename = "Password")]
    password: String,
    #[serde(rename = "ID")]
    id: u64,
}

#[derive(Debug, Serialize)]
struct KeyToml {
    #[serde(rename = "JSON")]
    json: String,
    #[serde(rename = "Password")]
    password: String,
}

/// Render the secrets TOML of every node in a DON, indexed by node position
///
/// # Errors
/// Returns `KeyError::MissingKey` if the generated keys do not cover a node.
pub fn node_secrets(don: &DonMetadata, keys: &GeneratedKeys) -> Result<Vec<String>, KeyError> {
    (0..don.nodes.len())
        .map(|index| render_node(don, index, keys))
        .collect()
}

fn render_node(don: &DonMetadata, index: usize, keys: &GeneratedKeys) -> Result<String, KeyError> {
    let missing = |kind| KeyError::MissingKey {
        kind,
        don_id: don.id,
        index,
    };

    let p2p_key = match keys.p2p.get(&don.id) {
        Some(peers) => {
            let key = peers.get(index).ok_or_else(|| missing("p2p"))?;
            Some(KeyToml {
                json: key.encrypted.to_json()?,
                password: keys.password.clone(),
            })
        }
        None => None,
    };

    let mut evm = Vec::new();
    for (chain_id, per_node) in keys.evm.get(&don.id).into_iter().flatten() {
        let key = per_node.get(index).ok_or_else(|| missing("evm"))?;
        evm.push(ChainKeyToml {
            json: key.encrypted.to_json()?,
            password: keys.password.clone(),
            id: *chain_id,
        });
    }

    let mut solana = Vec::new();
    for (chain_id, per_node) in keys.solana.get(&don.id).into_iter().flatten() {
        let key = per_node.get(index).ok_or_else(|| missing("solana"))?;
        solana.push(ChainKeyToml {
            json: key.encrypted.to_json()?,
            password: keys.password.clone(),
            id: *chain_id,
        });
    }

    let document = NodeSecretsToml {
        evm: (!evm.is_empty()).then_some(ChainKeysToml { keys: evm }),
        p2p_key,
        solana: (!solana.is_empty()).then_some(ChainKeysToml { keys: solana }),
    };
    Ok(toml::to_string(&document)?)
}

//! P2P identity keys and peer ids

use super::keystore::{EncryptedKey, KeyCipher};
use crate::error::KeyError;
use ed25519_dalek::SigningKey;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Multihash prefix for an inline (identity) hash of a protobuf-encoded
/// ed25519 public key: identity code, length 36, key type 1, field 2, 32 bytes.
const PEER_ID_PREFIX: [u8; 6] = [0x00, 0x24, 0x08, 0x01, 0x12, 0x20];

/// Prefix used by nodes when printing a peer id
pub const PEER_ID_DISPLAY_PREFIX: &str = "p2p_";

/// Libp2p peer id of an ed25519 key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Derive from a 32-byte ed25519 public key
    #[must_use]
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        let mut bytes = Vec::with_capacity(PEER_ID_PREFIX.len() + public_key.len());
        bytes.extend_from_slice(&PEER_ID_PREFIX);
        bytes.extend_from_slice(public_key);
        Self(bs58::encode(bytes).into_string())
    }

    /// Parse from base58, with or without the `p2p_` prefix
    ///
    /// # Errors
    /// Returns `KeyError::Malformed` if the string is not a valid ed25519 peer id.
    pub fn parse(value: &str) -> Result<Self, KeyError> {
        let raw = value.strip_prefix(PEER_ID_DISPLAY_PREFIX).unwrap_or(value);
        let bytes = bs58::decode(raw)
            .into_vec()
            .map_err(|err| KeyError::Malformed(format!("peer id '{value}': {err}")))?;
        if bytes.len() != PEER_ID_PREFIX.len() + 32 || !bytes.starts_with(&PEER_ID_PREFIX) {
            return Err(KeyError::Malformed(format!(
                "peer id '{value}' is not an ed25519 identity multihash"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    /// Base58 form without prefix
    #[inline]
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PEER_ID_DISPLAY_PREFIX}{}", self.0)
    }
}

/// Generated P2P key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct P2PKey {
    /// Peer id derived from the public key
    pub peer_id: PeerId,
    /// Hex public key
    pub public_key: String,
    /// Encrypted private key
    pub encrypted: EncryptedKey,
}

impl P2PKey {
    /// Generate a fresh key
    ///
    /// # Errors
    /// Returns an error if sealing the private key fails.
    pub fn generate<R: RngCore + CryptoRng>(
        cipher: &KeyCipher,
        rng: &mut R,
    ) -> Result<Self, KeyError> {
        let signing = SigningKey::generate(&mut *rng);
        let public = signing.verifying_key().to_bytes();
        let peer_id = PeerId::from_public_key(&public);
        let encrypted = cipher.seal(peer_id.to_string(), &signing.to_keypair_bytes(), rng)?;

        Ok(Self {
            peer_id,
            public_key: hex::encode(public),
            encrypted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn peer_id_has_libp2p_shape() {
        let peer = PeerId::from_public_key(&[7u8; 32]);
        assert!(peer.raw().starts_with("12D3KooW"));
        assert_eq!(peer.to_string(), format!("p2p_{}", peer.raw()));
        assert_eq!(PeerId::parse(&peer.to_string()).unwrap(), peer);
    }

    #[test]
    fn parse_rejects_foreign_multihash() {
        let bogus = bs58::encode([0x12u8, 0x20, 1, 2, 3]).into_string();
        assert!(PeerId::parse(&bogus).is_err());
        assert!(PeerId::parse("not-base58-0OIl").is_err());
    }

    #[test]
    fn generated_key_seals_keypair() {
        let mut rng = StdRng::seed_from_u64(1);
        let cipher = KeyCipher::new("", &mut rng).unwrap();
        let key = P2PKey::generate(&cipher, &mut rng).unwrap();

        let secret = key.encrypted.decrypt("").unwrap();
        assert_eq!(secret.len(), 64);
        assert_eq!(hex::encode(&secret[32..]), key.public_key);
        assert_eq!(key.encrypted.address, key.peer_id.to_string());
    }
}

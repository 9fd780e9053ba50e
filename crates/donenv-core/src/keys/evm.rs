//! EVM transaction keys

use super::keystore::{EncryptedKey, KeyCipher};
use crate::error::KeyError;
use alloy_primitives::{keccak256, Address};
use k256::ecdsa::{SigningKey, VerifyingKey};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

/// Generated EVM key for one chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvmKey {
    /// Chain the key is registered on
    pub chain_id: u64,
    /// Checksummed address
    pub address: String,
    /// Encrypted private key
    pub encrypted: EncryptedKey,
}

impl EvmKey {
    /// Generate a fresh key
    ///
    /// # Errors
    /// Returns an error if sealing the private key fails.
    pub fn generate<R: RngCore + CryptoRng>(
        chain_id: u64,
        cipher: &KeyCipher,
        rng: &mut R,
    ) -> Result<Self, KeyError> {
        let signing = SigningKey::random(&mut *rng);
        let address = address_of(signing.verifying_key()).to_checksum(None);
        let encrypted = cipher.seal(address.clone(), &signing.to_bytes(), rng)?;

        Ok(Self {
            chain_id,
            address,
            encrypted,
        })
    }
}

/// Ethereum address of a secp256k1 public key
#[must_use]
pub fn address_of(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn known_key_maps_to_known_address() {
        // Private key 1 is the generator point.
        let mut secret = [0u8; 32];
        secret[31] = 1;
        let signing = SigningKey::from_bytes(&secret.into()).unwrap();
        assert_eq!(
            address_of(signing.verifying_key()).to_checksum(None),
            "0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf"
        );
    }

    #[test]
    fn generated_key_decrypts_to_matching_address() {
        let mut rng = StdRng::seed_from_u64(3);
        let cipher = KeyCipher::new("pw", &mut rng).unwrap();
        let key = EvmKey::generate(1337, &cipher, &mut rng).unwrap();

        let secret = key.encrypted.decrypt("pw").unwrap();
        let signing = SigningKey::from_slice(&secret).unwrap();
        assert_eq!(address_of(signing.verifying_key()).to_checksum(None), key.address);
        assert_eq!(key.chain_id, 1337);
    }
}

//! Solana keypairs

use super::keystore::{EncryptedKey, KeyCipher};
use crate::error::KeyError;
use ed25519_dalek::{Signature, Signer, SigningKey};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ed25519 keypair addressed by its base58 public key
#[derive(Clone)]
pub struct SolanaKeypair {
    signing: SigningKey,
}

impl fmt::Debug for SolanaKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SolanaKeypair")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

impl SolanaKeypair {
    /// Generate a fresh keypair
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            signing: SigningKey::generate(rng),
        }
    }

    /// Build from a 32-byte secret
    #[must_use]
    pub fn from_secret(secret: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(secret),
        }
    }

    /// Build from the 64-byte keypair encoding used by solana tooling
    ///
    /// # Errors
    /// Returns `KeyError::Malformed` if the bytes are not a consistent keypair.
    pub fn from_keypair_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let bytes: &[u8; 64] = bytes
            .try_into()
            .map_err(|_| KeyError::Malformed(format!("expected 64 keypair bytes, got {}", bytes.len())))?;
        SigningKey::from_keypair_bytes(bytes)
            .map(|signing| Self { signing })
            .map_err(|err| KeyError::Malformed(err.to_string()))
    }

    /// Base58 public key
    #[must_use]
    pub fn address(&self) -> String {
        bs58::encode(self.public_key()).into_string()
    }

    /// Raw public key
    #[must_use]
    pub fn public_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Sign a message
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    /// 64-byte keypair encoding
    #[must_use]
    pub fn to_keypair_bytes(&self) -> [u8; 64] {
        self.signing.to_keypair_bytes()
    }
}

/// Decode a base58 Solana address into raw public key bytes
///
/// # Errors
/// Returns `KeyError::Malformed` unless the address decodes to 32 bytes.
pub fn decode_address(address: &str) -> Result<[u8; 32], KeyError> {
    let bytes = bs58::decode(address)
        .into_vec()
        .map_err(|err| KeyError::Malformed(format!("solana address '{address}': {err}")))?;
    bytes
        .try_into()
        .map_err(|_| KeyError::Malformed(format!("solana address '{address}' is not 32 bytes")))
}

/// Generated Solana key for one chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolanaKey {
    /// Chain the key is registered on
    pub chain_id: u64,
    /// Base58 address
    pub address: String,
    /// Encrypted keypair bytes
    pub encrypted: EncryptedKey,
}

impl SolanaKey {
    /// Generate a fresh key
    ///
    /// # Errors
    /// Returns an error if sealing the keypair fails.
    pub fn generate<R: RngCore + CryptoRng>(
        chain_id: u64,
        cipher: &KeyCipher,
        rng: &mut R,
    ) -> Result<Self, KeyError> {
        let keypair = SolanaKeypair::generate(&mut *rng);
        let address = keypair.address();
        let encrypted = cipher.seal(address.clone(), &keypair.to_keypair_bytes(), rng)?;
        Ok(Self {
            chain_id,
            address,
            encrypted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Verifier;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn address_decodes_back_to_public_key() {
        let keypair = SolanaKeypair::from_secret(&[9u8; 32]);
        let decoded = decode_address(&keypair.address()).unwrap();
        assert_eq!(decoded, keypair.public_key());
        assert!(decode_address("abc").is_err());
    }

    #[test]
    fn signatures_verify() {
        let mut rng = StdRng::seed_from_u64(5);
        let keypair = SolanaKeypair::generate(&mut rng);
        let signature = keypair.sign(b"transfer");
        let verifying = ed25519_dalek::VerifyingKey::from_bytes(&keypair.public_key()).unwrap();
        assert!(verifying.verify(b"transfer", &signature).is_ok());
    }

    #[test]
    fn sealed_keypair_restores() {
        let mut rng = StdRng::seed_from_u64(6);
        let cipher = KeyCipher::new("", &mut rng).unwrap();
        let key = SolanaKey::generate(900, &cipher, &mut rng).unwrap();
        let restored = SolanaKeypair::from_keypair_bytes(&key.encrypted.decrypt("").unwrap()).unwrap();
        assert_eq!(restored.address(), key.address);
    }
}

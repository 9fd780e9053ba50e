//! Password-encrypted key storage
//!
//! The password is expanded once per generation round with Argon2id; every
//! key is then sealed with AES-256-GCM under a fresh nonce.

use crate::error::KeyError;
use aes_gcm::aead::{Aead, AeadCore, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::Argon2;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

/// Salt length for the password KDF
pub const SALT_SIZE: usize = 16;
/// AES-256-GCM nonce length
pub const NONCE_SIZE: usize = 12;

const CIPHER_NAME: &str = "aes-256-gcm";
const KDF_NAME: &str = "argon2id";

/// Encrypted private key, serialized as JSON into node secrets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedKey {
    /// Public identity of the key (address or peer id)
    pub address: String,
    /// Cipher parameters and ciphertext
    pub crypto: CryptoParams,
}

/// Cipher parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoParams {
    /// Cipher name
    pub cipher: String,
    /// KDF name
    pub kdf: String,
    /// Hex-encoded KDF salt
    pub salt: String,
    /// Hex-encoded nonce
    pub nonce: String,
    /// Hex-encoded ciphertext with tag
    pub ciphertext: String,
}

impl EncryptedKey {
    /// Serialize to the JSON form used in secrets
    ///
    /// # Errors
    /// Returns `KeyError::Json` if serialization fails.
    pub fn to_json(&self) -> Result<String, KeyError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decrypt with the password
    ///
    /// # Errors
    /// Returns `KeyError::InvalidPassword` if the password does not match.
    pub fn decrypt(&self, password: &str) -> Result<Vec<u8>, KeyError> {
        let salt = decode_hex("salt", &self.crypto.salt)?;
        let nonce = decode_hex("nonce", &self.crypto.nonce)?;
        let ciphertext = decode_hex("ciphertext", &self.crypto.ciphertext)?;
        if nonce.len() != NONCE_SIZE {
            return Err(KeyError::Malformed(format!(
                "nonce must be {NONCE_SIZE} bytes, got {}",
                nonce.len()
            )));
        }

        let key = expand_password(password, &salt)?;
        Aes256Gcm::new(&key)
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| KeyError::InvalidPassword)
    }
}

/// Cipher keyed by one password expansion
pub struct KeyCipher {
    salt: [u8; SALT_SIZE],
    key: Key<Aes256Gcm>,
}

impl std::fmt::Debug for KeyCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCipher")
            .field("salt", &hex::encode(self.salt))
            .finish_non_exhaustive()
    }
}

impl KeyCipher {
    /// Expand the password under a random salt
    ///
    /// # Errors
    /// Returns `KeyError::Kdf` if Argon2 rejects the input.
    pub fn new<R: RngCore + CryptoRng>(password: &str, rng: &mut R) -> Result<Self, KeyError> {
        let mut salt = [0u8; SALT_SIZE];
        rng.fill_bytes(&mut salt);
        let key = expand_password(password, &salt)?;
        Ok(Self { salt, key })
    }

    /// Seal a private key
    ///
    /// # Errors
    /// Returns `KeyError::Cipher` if encryption fails.
    pub fn seal<R: RngCore + CryptoRng>(
        &self,
        address: impl Into<String>,
        secret: &[u8],
        rng: &mut R,
    ) -> Result<EncryptedKey, KeyError> {
        let nonce = Aes256Gcm::generate_nonce(&mut *rng);
        let ciphertext = Aes256Gcm::new(&self.key)
            .encrypt(&nonce, secret)
            .map_err(|_| KeyError::Cipher)?;

        Ok(EncryptedKey {
            address: address.into(),
            crypto: CryptoParams {
                cipher: CIPHER_NAME.to_string(),
                kdf: KDF_NAME.to_string(),
                salt: hex::encode(self.salt),
                nonce: hex::encode(nonce),
                ciphertext: hex::encode(ciphertext),
            },
        })
    }
}

fn expand_password(password: &str, salt: &[u8]) -> Result<Key<Aes256Gcm>, KeyError> {
    let mut key = Key::<Aes256Gcm>::default();
    Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|err| KeyError::Kdf(err.to_string()))?;
    Ok(key)
}

fn decode_hex(field: &str, value: &str) -> Result<Vec<u8>, KeyError> {
    hex::decode(value).map_err(|err| KeyError::Malformed(format!("{field}: {err}")))
}

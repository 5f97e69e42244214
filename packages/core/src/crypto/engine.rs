//! CryptoEngine: stateless authenticated encryption.
//!
//! ```text
//! encrypt(key, plaintext, aad) ──► Sealed { algorithm, nonce, ciphertext‖tag }
//! decrypt(key, ciphertext, nonce, aad) ──► SecureBuffer | AuthenticationFailed
//! ```
//!
//! Nonces come from the OS CSPRNG inside `encrypt` and are never accepted from
//! the caller. The engine holds no key or plaintext between calls.

use crate::crypto::provider::AeadSuite;
use crate::crypto::secure_buffer::SecureBuffer;
use crate::crypto::suites::{aes::AesGcmSuite, classic::ClassicSuite};
use crate::crypto::KeyVersion;
use crate::error::CryptoError;
use crate::utils::error::ConclaveError;
use rand::rngs::OsRng;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of conversation key material, identical for every suite.
pub const KEY_LENGTH: usize = 32;

/// Domain separation tag for message associated data.
const MESSAGE_AAD_DOMAIN: &[u8] = b"conclave/message/v1";

/// AEAD algorithm used for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
}

impl Algorithm {
    pub fn nonce_length(&self) -> usize {
        match self {
            Algorithm::ChaCha20Poly1305 => ClassicSuite::NONCE_LEN,
            Algorithm::Aes256Gcm => AesGcmSuite::NONCE_LEN,
        }
    }

    pub fn tag_length(&self) -> usize {
        match self {
            Algorithm::ChaCha20Poly1305 => ClassicSuite::TAG_LEN,
            Algorithm::Aes256Gcm => AesGcmSuite::TAG_LEN,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::ChaCha20Poly1305 => write!(f, "chacha20-poly1305"),
            Algorithm::Aes256Gcm => write!(f, "aes-256-gcm"),
        }
    }
}

impl FromStr for Algorithm {
    type Err = ConclaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chacha20-poly1305" | "chacha20poly1305" => Ok(Algorithm::ChaCha20Poly1305),
            "aes-256-gcm" | "aes256gcm" => Ok(Algorithm::Aes256Gcm),
            other => Err(ConclaveError::ConfigError(format!(
                "Unknown algorithm: {}",
                other
            ))),
        }
    }
}

/// Output of a single encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub algorithm: Algorithm,
    pub nonce: Vec<u8>,
    /// Ciphertext with the authentication tag appended.
    pub ciphertext: Vec<u8>,
}

/// Associated data binding a ciphertext to its conversation and key epoch.
///
/// Layout: domain tag ‖ u32 BE length of id ‖ id ‖ u32 BE version.
pub fn associated_data(conversation_id: &str, version: KeyVersion) -> Vec<u8> {
    let id = conversation_id.as_bytes();
    let mut aad = Vec::with_capacity(MESSAGE_AAD_DOMAIN.len() + 4 + id.len() + 4);
    aad.extend_from_slice(MESSAGE_AAD_DOMAIN);
    aad.extend_from_slice(&(id.len() as u32).to_be_bytes());
    aad.extend_from_slice(id);
    aad.extend_from_slice(&version.to_be_bytes());
    aad
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoEngine {
    algorithm: Algorithm,
}

impl CryptoEngine {
    pub fn new(algorithm: Algorithm) -> Self {
        Self { algorithm }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Fresh key material from the OS CSPRNG.
    pub fn generate_key(&self) -> Result<SecureBuffer, CryptoError> {
        let mut key = SecureBuffer::zeroed(KEY_LENGTH);
        OsRng.try_fill_bytes(key.as_mut_slice())?;
        Ok(key)
    }

    pub fn encrypt(
        &self,
        key: &SecureBuffer,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<Sealed, CryptoError> {
        let mut nonce = vec![0u8; self.algorithm.nonce_length()];
        OsRng.try_fill_bytes(&mut nonce)?;

        let ciphertext = match self.algorithm {
            Algorithm::ChaCha20Poly1305 => {
                ClassicSuite::seal(key.as_slice(), &nonce, plaintext, associated_data)?
            }
            Algorithm::Aes256Gcm => {
                AesGcmSuite::seal(key.as_slice(), &nonce, plaintext, associated_data)?
            }
        };

        Ok(Sealed {
            algorithm: self.algorithm,
            nonce,
            ciphertext,
        })
    }

    pub fn decrypt(
        &self,
        key: &SecureBuffer,
        ciphertext: &[u8],
        nonce: &[u8],
        associated_data: &[u8],
    ) -> Result<SecureBuffer, CryptoError> {
        let plaintext = match self.algorithm {
            Algorithm::ChaCha20Poly1305 => {
                ClassicSuite::open(key.as_slice(), nonce, ciphertext, associated_data)?
            }
            Algorithm::Aes256Gcm => {
                AesGcmSuite::open(key.as_slice(), nonce, ciphertext, associated_data)?
            }
        };
        Ok(SecureBuffer::from_vec(plaintext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engines() -> [CryptoEngine; 2] {
        [
            CryptoEngine::new(Algorithm::ChaCha20Poly1305),
            CryptoEngine::new(Algorithm::Aes256Gcm),
        ]
    }

    #[test]
    fn test_round_trip_for_every_suite() {
        for engine in engines() {
            let key = engine.generate_key().unwrap();
            let aad = associated_data("conv-1", 1);
            let sealed = engine.encrypt(&key, b"hello", &aad).unwrap();

            assert_eq!(sealed.algorithm, engine.algorithm());
            assert_eq!(sealed.ciphertext.len(), 5 + engine.algorithm().tag_length());

            let plaintext = engine
                .decrypt(&key, &sealed.ciphertext, &sealed.nonce, &aad)
                .unwrap();
            assert_eq!(plaintext.as_slice(), b"hello");
        }
    }

    #[test]
    fn test_nonce_is_fresh_per_call() {
        let engine = CryptoEngine::new(Algorithm::ChaCha20Poly1305);
        let key = engine.generate_key().unwrap();
        let aad = associated_data("conv-1", 1);

        let a = engine.encrypt(&key, b"same", &aad).unwrap();
        let b = engine.encrypt(&key, b"same", &aad).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_wrong_key_and_tamper_are_indistinguishable() {
        let engine = CryptoEngine::new(Algorithm::ChaCha20Poly1305);
        let key = engine.generate_key().unwrap();
        let other_key = engine.generate_key().unwrap();
        let aad = associated_data("conv-1", 1);
        let sealed = engine.encrypt(&key, b"secret", &aad).unwrap();

        let wrong_key = engine.decrypt(&other_key, &sealed.ciphertext, &sealed.nonce, &aad);
        assert_eq!(wrong_key.unwrap_err(), CryptoError::AuthenticationFailed);

        let mut tampered = sealed.ciphertext.clone();
        tampered[0] ^= 0x01;
        let tamper = engine.decrypt(&key, &tampered, &sealed.nonce, &aad);
        assert_eq!(tamper.unwrap_err(), CryptoError::AuthenticationFailed);

        let bad_nonce = engine.decrypt(&key, &sealed.ciphertext, &[0u8; 3], &aad);
        assert_eq!(bad_nonce.unwrap_err(), CryptoError::AuthenticationFailed);
    }

    #[test]
    fn test_associated_data_binds_conversation_and_version() {
        let engine = CryptoEngine::new(Algorithm::Aes256Gcm);
        let key = engine.generate_key().unwrap();
        let sealed = engine
            .encrypt(&key, b"bound", &associated_data("conv-1", 1))
            .unwrap();

        for aad in [associated_data("conv-2", 1), associated_data("conv-1", 2)] {
            let result = engine.decrypt(&key, &sealed.ciphertext, &sealed.nonce, &aad);
            assert_eq!(result.unwrap_err(), CryptoError::AuthenticationFailed);
        }
    }

    #[test]
    fn test_associated_data_is_unambiguous() {
        // Длина id в префиксе: "ab"+v vs "a"+... не совпадают
        assert_ne!(associated_data("ab", 1), associated_data("a", 1));
        assert_ne!(associated_data("conv", 1), associated_data("conv", 256));
    }

    #[test]
    fn test_invalid_key_length_rejected_on_encrypt() {
        let engine = CryptoEngine::new(Algorithm::ChaCha20Poly1305);
        let short = SecureBuffer::zeroed(16);
        let result = engine.encrypt(&short, b"x", b"");
        assert_eq!(
            result.unwrap_err(),
            CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 16
            }
        );
    }

    #[test]
    fn test_wrong_key_length_on_decrypt_is_authentication_failure() {
        for engine in engines() {
            let key = engine.generate_key().unwrap();
            let aad = associated_data("conv-1", 1);
            let sealed = engine.encrypt(&key, b"hello", &aad).unwrap();

            let short = SecureBuffer::copy_from_slice(&key.as_slice()[..16]);
            let result = engine.decrypt(&short, &sealed.ciphertext, &sealed.nonce, &aad);
            assert_eq!(result.unwrap_err(), CryptoError::AuthenticationFailed);
        }
    }

    #[test]
    fn test_algorithm_parsing() {
        assert_eq!(
            "AES-256-GCM".parse::<Algorithm>().unwrap(),
            Algorithm::Aes256Gcm
        );
        assert_eq!(
            "chacha20-poly1305".parse::<Algorithm>().unwrap(),
            Algorithm::ChaCha20Poly1305
        );
        assert!("rot13".parse::<Algorithm>().is_err());
        assert_eq!(Algorithm::Aes256Gcm.to_string(), "aes-256-gcm");
    }
}

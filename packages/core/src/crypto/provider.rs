//! Defines the AeadSuite trait for crypto-agility.
//!
//! The trait takes an explicit nonce and is therefore crate-private: the only
//! caller is [`CryptoEngine`](super::engine::CryptoEngine), which generates a
//! fresh nonce for every encryption. Nothing outside the crate can encrypt
//! with a nonce of its own choosing.

use crate::error::CryptoError;

/// Formalizes the AEAD operations of one cipher suite.
pub(crate) trait AeadSuite {
    /// Symmetric key length in bytes.
    const KEY_LEN: usize;

    /// Nonce length in bytes.
    const NONCE_LEN: usize;

    /// Authentication tag length appended to the ciphertext.
    const TAG_LEN: usize;

    /// Performs AEAD encryption. Returns ciphertext with the tag appended.
    fn seal(key: &[u8], nonce: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Performs AEAD decryption. Any failure is `AuthenticationFailed`.
    fn open(key: &[u8], nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

pub(crate) fn check_key_len<S: AeadSuite>(key: &[u8]) -> Result<(), CryptoError> {
    if key.len() != S::KEY_LEN {
        return Err(CryptoError::InvalidKeyLength {
            expected: S::KEY_LEN,
            actual: key.len(),
        });
    }
    Ok(())
}

use crate::crypto::provider::{check_key_len, AeadSuite};
use crate::error::CryptoError;
use chacha20poly1305::{
    aead::{Aead, Payload},
    ChaCha20Poly1305, KeyInit, Nonce,
};

/// ChaCha20-Poly1305, the default suite.
pub struct ClassicSuite;

impl AeadSuite for ClassicSuite {
    const KEY_LEN: usize = 32;
    const NONCE_LEN: usize = 12;
    const TAG_LEN: usize = 16;

    fn seal(key: &[u8], nonce: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        check_key_len::<Self>(key)?;
        if nonce.len() != Self::NONCE_LEN {
            return Err(CryptoError::InvalidInput("Invalid nonce length".to_string()));
        }

        let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| {
            CryptoError::InvalidKeyLength {
                expected: Self::KEY_LEN,
                actual: key.len(),
            }
        })?;

        cipher
            .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
    }

    fn open(key: &[u8], nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        // Битый ключ или nonce неотличимы от подмены
        if key.len() != Self::KEY_LEN
            || nonce.len() != Self::NONCE_LEN
            || ciphertext.len() < Self::TAG_LEN
        {
            return Err(CryptoError::AuthenticationFailed);
        }

        let cipher = ChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| CryptoError::AuthenticationFailed)?;

        cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| CryptoError::AuthenticationFailed)
    }
}

// Мастер-ключ для хранения ключей бесед на диске
// PBKDF2 для деривации ключа + AES-256-GCM для обёртки

use crate::config::Config;
use crate::crypto::provider::AeadSuite;
use crate::crypto::secure_buffer::SecureBuffer;
use crate::crypto::suites::aes::AesGcmSuite;
use crate::crypto::KeyVersion;
use crate::utils::error::{ConclaveError, Result};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand_core::RngCore;
use sha2::Sha256;
use std::fmt;
use zeroize::Zeroizing;

const KEY_LENGTH: usize = 32;

/// Минимальная длина соли для PBKDF2 (в байтах)
pub const MIN_SALT_LENGTH: usize = 16;

const WRAP_AAD_DOMAIN: &[u8] = b"conclave/key-wrap/v1";

/// 256-битный ключ, которым обёрнуты ключи бесед в файловом хранилище.
///
/// Затирается при drop. `Clone` не реализован.
pub struct MasterKey {
    key: Zeroizing<[u8; KEY_LENGTH]>,
}

impl MasterKey {
    /// Случайный мастер-ключ из OS CSPRNG
    pub fn generate() -> Result<Self> {
        let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
        OsRng
            .try_fill_bytes(&mut *key)
            .map_err(|e| ConclaveError::CryptoError(format!("Random source failed: {}", e)))?;
        Ok(Self { key })
    }

    /// Деривировать мастер-ключ из пароля с использованием PBKDF2-HMAC-SHA256
    ///
    /// # Arguments
    /// * `passphrase` - Пароль, см. [`validate_passphrase`]
    /// * `salt` - Соль, не короче [`MIN_SALT_LENGTH`]
    /// * `config` - Число итераций берётся из `pbkdf2_iterations`
    pub fn derive(passphrase: &str, salt: &[u8], config: &Config) -> Result<Self> {
        if salt.len() < MIN_SALT_LENGTH {
            return Err(ConclaveError::CryptoError(format!(
                "Invalid salt length: expected at least {}, got {}",
                MIN_SALT_LENGTH,
                salt.len()
            )));
        }

        validate_passphrase(passphrase)?;

        if config.pbkdf2_iterations == 0 {
            return Err(ConclaveError::ConfigError(
                "pbkdf2_iterations must be positive".to_string(),
            ));
        }

        let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
        pbkdf2_hmac::<Sha256>(
            passphrase.as_bytes(),
            salt,
            config.pbkdf2_iterations,
            &mut *key,
        );

        Ok(Self { key })
    }

    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self {
            key: Zeroizing::new(bytes),
        }
    }

    /// Обернуть ключ беседы: nonce ‖ AES-256-GCM(material).
    ///
    /// AAD привязывает результат к беседе и версии, подмена строк между
    /// беседами или версиями не расшифруется.
    pub(crate) fn wrap(
        &self,
        conversation_id: &str,
        version: KeyVersion,
        material: &SecureBuffer,
    ) -> Result<Vec<u8>> {
        let mut nonce = [0u8; AesGcmSuite::NONCE_LEN];
        OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|e| ConclaveError::CryptoError(format!("Random source failed: {}", e)))?;

        let aad = wrap_aad(conversation_id, version);
        let ciphertext = AesGcmSuite::seal(&*self.key, &nonce, material.as_slice(), &aad)
            .map_err(|e| ConclaveError::CryptoError(format!("Key wrap failed: {}", e)))?;

        let mut wrapped = Vec::with_capacity(nonce.len() + ciphertext.len());
        wrapped.extend_from_slice(&nonce);
        wrapped.extend_from_slice(&ciphertext);
        Ok(wrapped)
    }

    pub(crate) fn unwrap_key(
        &self,
        conversation_id: &str,
        version: KeyVersion,
        wrapped: &[u8],
    ) -> Result<SecureBuffer> {
        if wrapped.len() < AesGcmSuite::NONCE_LEN + AesGcmSuite::TAG_LEN {
            return Err(ConclaveError::CryptoError(
                "Wrapped key too short".to_string(),
            ));
        }

        let (nonce, ciphertext) = wrapped.split_at(AesGcmSuite::NONCE_LEN);
        let aad = wrap_aad(conversation_id, version);
        let material = AesGcmSuite::open(&*self.key, nonce, ciphertext, &aad).map_err(|_| {
            ConclaveError::CryptoError(format!(
                "Cannot unwrap key version {} of conversation {}",
                version, conversation_id
            ))
        })?;

        Ok(SecureBuffer::from_vec(material))
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

fn wrap_aad(conversation_id: &str, version: KeyVersion) -> Vec<u8> {
    let id = conversation_id.as_bytes();
    let mut aad = Vec::with_capacity(WRAP_AAD_DOMAIN.len() + 4 + id.len() + 4);
    aad.extend_from_slice(WRAP_AAD_DOMAIN);
    aad.extend_from_slice(&(id.len() as u32).to_be_bytes());
    aad.extend_from_slice(id);
    aad.extend_from_slice(&version.to_be_bytes());
    aad
}

/// Генерировать случайную соль длиной `config.salt_length`
pub fn generate_salt(config: &Config) -> Result<Vec<u8>> {
    let mut salt = vec![0u8; config.salt_length.max(MIN_SALT_LENGTH)];
    OsRng
        .try_fill_bytes(&mut salt)
        .map_err(|e| ConclaveError::CryptoError(format!("Random source failed: {}", e)))?;
    Ok(salt)
}

/// Валидация силы пароля
///
/// Минимальные требования:
/// - Длина >= 8 символов
/// - Содержит буквы и цифры
pub fn validate_passphrase(passphrase: &str) -> Result<()> {
    if passphrase.chars().count() < 8 {
        return Err(ConclaveError::InvalidInput(
            "Passphrase must be at least 8 characters long".to_string(),
        ));
    }

    let has_letter = passphrase.chars().any(|c| c.is_alphabetic());
    let has_digit = passphrase.chars().any(|c| c.is_numeric());

    if !has_letter || !has_digit {
        return Err(ConclaveError::InvalidInput(
            "Passphrase must contain both letters and numbers".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> Config {
        Config {
            pbkdf2_iterations: 1_000,
            ..Config::default()
        }
    }

    #[test]
    fn test_derive_master_key() {
        let config = fast_config();
        let salt = generate_salt(&config).unwrap();

        let key1 = MasterKey::derive("test_password_123", &salt, &config).unwrap();
        let key2 = MasterKey::derive("test_password_123", &salt, &config).unwrap();

        // Одинаковый пароль и соль должны давать одинаковый ключ
        assert_eq!(*key1.key, *key2.key);
    }

    #[test]
    fn test_derive_master_key_different_salt() {
        let config = fast_config();
        let key1 = MasterKey::derive("test_password_123", &generate_salt(&config).unwrap(), &config)
            .unwrap();
        let key2 = MasterKey::derive("test_password_123", &generate_salt(&config).unwrap(), &config)
            .unwrap();

        assert_ne!(*key1.key, *key2.key);
    }

    #[test]
    fn test_derive_rejects_short_salt_and_empty_passphrase() {
        let config = fast_config();
        assert!(MasterKey::derive("pw", &[0u8; 8], &config).is_err());
        assert!(MasterKey::derive("", &[0u8; 32], &config).is_err());
    }

    #[test]
    fn test_derive_rejects_weak_passphrase() {
        let config = fast_config();
        let salt = generate_salt(&config).unwrap();

        for weak in ["short1", "onlyletters", "12345678"] {
            assert!(matches!(
                MasterKey::derive(weak, &salt, &config),
                Err(ConclaveError::InvalidInput(_))
            ));
        }
        assert!(MasterKey::derive("letters and 1 digit", &salt, &config).is_ok());
    }

    #[test]
    fn test_salt_length_follows_config() {
        let config = Config {
            salt_length: 48,
            ..fast_config()
        };
        let a = generate_salt(&config).unwrap();
        let b = generate_salt(&config).unwrap();
        assert_eq!(a.len(), 48);
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrap_unwrap_key() {
        let master = MasterKey::generate().unwrap();
        let material = SecureBuffer::copy_from_slice(&[3u8; 32]);

        let wrapped = master.wrap("conv1", 1, &material).unwrap();

        // nonce + ciphertext + tag
        assert_eq!(
            wrapped.len(),
            AesGcmSuite::NONCE_LEN + 32 + AesGcmSuite::TAG_LEN
        );
        assert!(!wrapped.windows(32).any(|w| w == material.as_slice()));

        let unwrapped = master.unwrap_key("conv1", 1, &wrapped).unwrap();
        assert_eq!(unwrapped, material);
    }

    #[test]
    fn test_unwrap_is_bound_to_conversation_and_version() {
        let master = MasterKey::generate().unwrap();
        let wrapped = master
            .wrap("conv1", 1, &SecureBuffer::zeroed(32))
            .unwrap();

        assert!(master.unwrap_key("conv2", 1, &wrapped).is_err());
        assert!(master.unwrap_key("conv1", 2, &wrapped).is_err());
    }

    #[test]
    fn test_unwrap_with_wrong_master_key() {
        let config = fast_config();
        let salt = generate_salt(&config).unwrap();
        let correct = MasterKey::derive("correct_password_123", &salt, &config).unwrap();
        let wrong = MasterKey::derive("wrong_password_456", &salt, &config).unwrap();

        let wrapped = correct
            .wrap("conv1", 1, &SecureBuffer::zeroed(32))
            .unwrap();
        let result = wrong.unwrap_key("conv1", 1, &wrapped);
        assert!(matches!(result, Err(ConclaveError::CryptoError(_))));
    }

    #[test]
    fn test_validate_passphrase() {
        assert!(validate_passphrase("password123").is_ok());
        assert!(validate_passphrase("MyPass123").is_ok());

        assert!(validate_passphrase("short1").is_err());
        assert!(validate_passphrase("onlyletters").is_err());
        assert!(validate_passphrase("12345678").is_err());
        assert!(validate_passphrase("").is_err());
    }

    #[test]
    fn test_debug_is_redacted() {
        let master = MasterKey::from_bytes([0x42; 32]);
        assert_eq!(format!("{:?}", master), "MasterKey([REDACTED])");
    }
}

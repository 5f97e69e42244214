// Типы ошибок ядра

use crate::crypto::KeyVersion;
use crate::error::CryptoError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConclaveError {
    // === Валидация (до любых побочных эффектов) ===
    #[error("Invalid participants: {0}")]
    InvalidParticipants(String),

    #[error("{participant_id} is not a participant of conversation {conversation_id}")]
    NotAParticipant {
        conversation_id: String,
        participant_id: String,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // === Поиск ===
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Conversation {0} already has an initial key")]
    ConversationAlreadyKeyed(String),

    #[error("Key not found: conversation {conversation_id}, version {version:?}")]
    KeyNotFound {
        conversation_id: String,
        version: Option<KeyVersion>,
    },

    #[error("Duplicate key version {version} for conversation {conversation_id}")]
    DuplicateVersion {
        conversation_id: String,
        version: KeyVersion,
    },

    // === Криптография ===
    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Cryptography error: {0}")]
    CryptoError(String),

    // === Хранилище ===
    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Storage unavailable after {attempts} attempts: {last_error}")]
    StorageUnavailable { attempts: u32, last_error: String },

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ConclaveError {
    pub fn key_not_found(conversation_id: &str, version: Option<KeyVersion>) -> Self {
        ConclaveError::KeyNotFound {
            conversation_id: conversation_id.to_string(),
            version,
        }
    }

    /// Временные ошибки записи, которые имеет смысл повторить с backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConclaveError::StorageError(_))
    }
}

impl From<CryptoError> for ConclaveError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::AuthenticationFailed => ConclaveError::AuthenticationFailed,
            CryptoError::EncryptionFailed(msg) => ConclaveError::EncryptionFailed(msg),
            other => ConclaveError::CryptoError(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ConclaveError {
    fn from(err: std::io::Error) -> Self {
        ConclaveError::StorageError(err.to_string())
    }
}

impl From<serde_json::Error> for ConclaveError {
    fn from(err: serde_json::Error) -> Self {
        ConclaveError::SerializationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ConclaveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypto_errors_map_to_core_taxonomy() {
        assert_eq!(
            ConclaveError::from(CryptoError::AuthenticationFailed),
            ConclaveError::AuthenticationFailed
        );
        assert!(matches!(
            ConclaveError::from(CryptoError::EncryptionFailed("x".into())),
            ConclaveError::EncryptionFailed(_)
        ));
    }

    #[test]
    fn test_only_storage_errors_are_retryable() {
        assert!(ConclaveError::StorageError("disk full".into()).is_retryable());
        assert!(!ConclaveError::AuthenticationFailed.is_retryable());
        assert!(!ConclaveError::key_not_found("c1", Some(2)).is_retryable());
    }
}

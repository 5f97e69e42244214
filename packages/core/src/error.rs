use thiserror::Error;

/// Ошибки криптографических примитивов.
///
/// Любая ошибка расшифровки становится `AuthenticationFailed`, без уточнения причины.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Authentication failed")]
    AuthenticationFailed,
    #[error("AEAD encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
    #[error("Random source failure: {0}")]
    RandomSourceFailed(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<rand::Error> for CryptoError {
    fn from(err: rand::Error) -> Self {
        CryptoError::RandomSourceFailed(err.to_string())
    }
}

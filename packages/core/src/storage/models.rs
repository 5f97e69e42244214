// Модели данных для хранилища

use crate::crypto::{Algorithm, KeyVersion, SecureBuffer};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Порядковый номер сообщения внутри беседы, начиная с 1
pub type SequenceNumber = u64;

/// Версия ключа беседы.
///
/// Материал ключа живёт в `SecureBuffer` и затирается при drop. `Clone` не
/// реализован: копия только через [`ConversationKey::duplicate`].
pub struct ConversationKey {
    pub conversation_id: String,
    pub version: KeyVersion,
    material: SecureBuffer,
    pub created_at: DateTime<Utc>,
    /// Время вытеснения следующей версией. `None`, пока ключ активен.
    pub superseded_at: Option<DateTime<Utc>>,
}

impl ConversationKey {
    pub fn new(
        conversation_id: impl Into<String>,
        version: KeyVersion,
        material: SecureBuffer,
        created_at: DateTime<Utc>,
        superseded_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            version,
            material,
            created_at,
            superseded_at,
        }
    }

    pub fn material(&self) -> &SecureBuffer {
        &self.material
    }

    pub fn is_active(&self) -> bool {
        self.superseded_at.is_none()
    }

    /// Короткий отпечаток для логов и диагностики. Сам материал не раскрывает.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"conclave/key-fingerprint/v1");
        hasher.update(self.material.as_slice());
        let digest = hasher.finalize();
        hex::encode(&digest[..8])
    }

    /// Явная копия, включая материал ключа
    pub fn duplicate(&self) -> Self {
        Self {
            conversation_id: self.conversation_id.clone(),
            version: self.version,
            material: self.material.duplicate(),
            created_at: self.created_at,
            superseded_at: self.superseded_at,
        }
    }
}

impl fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationKey")
            .field("conversation_id", &self.conversation_id)
            .field("version", &self.version)
            .field("fingerprint", &self.fingerprint())
            .field("created_at", &self.created_at)
            .field("superseded_at", &self.superseded_at)
            .finish()
    }
}

/// Сообщение в хранилище. Открытого текста и ключей не содержит.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub conversation_id: String,
    pub sender_id: String,
    pub sequence: SequenceNumber,
    pub key_version: KeyVersion,
    pub algorithm: Algorithm,
    #[serde(with = "serde_bytes")]
    pub nonce: Vec<u8>,
    /// Шифртекст с auth tag в конце
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
    pub sent_at: DateTime<Utc>,
}

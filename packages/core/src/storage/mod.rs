//! Модуль хранилища
//!
//! Два контракта, за которыми скрыт бэкенд:
//!
//! - [`KeyStore`]: версии ключей бесед, write-once по (conversation, version)
//! - [`MessageStore`]: шифртексты, упорядоченные по sequence внутри беседы
//!
//! Реализации: [`memory`] (тесты, один процесс) и [`file`] (JSON-lines журнал
//! на беседу, `sync_all` перед возвратом). [`retry`] добавляет bounded backoff
//! поверх любой реализации.

pub mod file;
pub mod memory;
pub mod models;
pub mod retry;

pub use file::{FileKeyStore, FileMessageStore};
pub use memory::{MemoryKeyStore, MemoryMessageStore};
pub use models::{ConversationKey, Message, SequenceNumber};
pub use retry::{RetryConfig, RetryingKeyStore, RetryingMessageStore};

use crate::crypto::{KeyVersion, Sealed, SecureBuffer};
use crate::utils::error::{ConclaveError, Result};
use chrono::{DateTime, Utc};

/// Хранилище версий ключей.
///
/// `put` возвращает `Ok` только после того, как ключ записан надёжно:
/// сообщение под этим ключом может быть сохранено только после этого.
pub trait KeyStore: Send + Sync {
    /// `DuplicateVersion`, если пара (conversation, version) уже существует.
    fn put(
        &self,
        conversation_id: &str,
        version: KeyVersion,
        material: &SecureBuffer,
        created_at: DateTime<Utc>,
    ) -> Result<()>;

    fn get(&self, conversation_id: &str, version: KeyVersion) -> Result<ConversationKey>;

    /// Самая новая версия без `superseded_at`.
    fn get_active(&self, conversation_id: &str) -> Result<ConversationKey>;

    /// Идемпотентно: уже вытесненная версия не ошибка.
    fn mark_superseded(
        &self,
        conversation_id: &str,
        version: KeyVersion,
        at: DateTime<Utc>,
    ) -> Result<()>;
}

/// Хранилище шифртекстов.
pub trait MessageStore: Send + Sync {
    /// Присваивает следующий sequence беседы. `sent_at` задаёт вызывающий.
    fn append(
        &self,
        conversation_id: &str,
        sender_id: &str,
        key_version: KeyVersion,
        sealed: Sealed,
        sent_at: DateTime<Utc>,
    ) -> Result<Message>;

    /// Сообщения с `sequence < before` (или последние, если `None`),
    /// от новых к старым, не больше `limit` (ограничен максимумом хранилища).
    fn fetch(
        &self,
        conversation_id: &str,
        before: Option<SequenceNumber>,
        limit: usize,
    ) -> Result<Vec<Message>>;
}

/// Проверка перед append: версия ключа существует в `KeyStore`.
/// Беседа без ключей вовсе даёт `ConversationNotFound`.
pub(crate) fn ensure_key_exists(
    keys: &dyn KeyStore,
    conversation_id: &str,
    version: KeyVersion,
) -> Result<()> {
    match keys.get(conversation_id, version) {
        Ok(_) => Ok(()),
        Err(ConclaveError::KeyNotFound { .. }) => {
            ensure_conversation_keyed(keys, conversation_id)?;
            Err(ConclaveError::key_not_found(conversation_id, Some(version)))
        }
        Err(e) => Err(e),
    }
}

pub(crate) fn ensure_conversation_keyed(keys: &dyn KeyStore, conversation_id: &str) -> Result<()> {
    match keys.get_active(conversation_id) {
        Ok(_) => Ok(()),
        Err(ConclaveError::KeyNotFound { .. }) => Err(ConclaveError::ConversationNotFound(
            conversation_id.to_string(),
        )),
        Err(e) => Err(e),
    }
}

pub(crate) fn clamp_limit(limit: usize, max_page_size: usize) -> usize {
    limit.clamp(1, max_page_size.max(1))
}

pub(crate) fn lock_poisoned(what: &str) -> ConclaveError {
    ConclaveError::StorageError(format!("{} lock poisoned", what))
}

// In-memory storage для тестов и однопроцессного использования

use crate::crypto::{KeyVersion, Sealed, SecureBuffer};
use crate::storage::models::{ConversationKey, Message, SequenceNumber};
use crate::storage::{
    clamp_limit, ensure_conversation_keyed, ensure_key_exists, lock_poisoned, KeyStore,
    MessageStore,
};
use crate::utils::error::{ConclaveError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

pub(super) struct KeyRow {
    pub(super) material: SecureBuffer,
    pub(super) created_at: DateTime<Utc>,
    pub(super) superseded_at: Option<DateTime<Utc>>,
}

pub(super) type KeyChain = BTreeMap<KeyVersion, KeyRow>;

fn to_key(conversation_id: &str, version: KeyVersion, row: &KeyRow) -> ConversationKey {
    ConversationKey::new(
        conversation_id,
        version,
        row.material.duplicate(),
        row.created_at,
        row.superseded_at,
    )
}

pub(super) fn find_version(
    chain: &KeyChain,
    conversation_id: &str,
    version: KeyVersion,
) -> Result<ConversationKey> {
    chain
        .get(&version)
        .map(|row| to_key(conversation_id, version, row))
        .ok_or_else(|| ConclaveError::key_not_found(conversation_id, Some(version)))
}

/// Самая новая версия без `superseded_at`
pub(super) fn find_active(chain: &KeyChain, conversation_id: &str) -> Result<ConversationKey> {
    chain
        .iter()
        .rev()
        .find(|(_, row)| row.superseded_at.is_none())
        .map(|(version, row)| to_key(conversation_id, *version, row))
        .ok_or_else(|| ConclaveError::key_not_found(conversation_id, None))
}

// ============================================================================
// Ключи
// ============================================================================

/// In-memory `KeyStore`. Блокировка на беседу, беседы не мешают друг другу.
#[derive(Default)]
pub struct MemoryKeyStore {
    chains: DashMap<String, Arc<Mutex<KeyChain>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Arc клонируется из DashMap до взятия Mutex: shard не держится под блокировкой
    fn chain(&self, conversation_id: &str) -> Option<Arc<Mutex<KeyChain>>> {
        self.chains.get(conversation_id).map(|c| Arc::clone(c.value()))
    }
}

impl KeyStore for MemoryKeyStore {
    fn put(
        &self,
        conversation_id: &str,
        version: KeyVersion,
        material: &SecureBuffer,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        let chain = Arc::clone(
            self.chains
                .entry(conversation_id.to_string())
                .or_default()
                .value(),
        );
        let mut chain = chain.lock().map_err(|_| lock_poisoned("key chain"))?;

        if chain.contains_key(&version) {
            return Err(ConclaveError::DuplicateVersion {
                conversation_id: conversation_id.to_string(),
                version,
            });
        }

        chain.insert(
            version,
            KeyRow {
                material: material.duplicate(),
                created_at,
                superseded_at: None,
            },
        );
        Ok(())
    }

    fn get(&self, conversation_id: &str, version: KeyVersion) -> Result<ConversationKey> {
        let chain = self
            .chain(conversation_id)
            .ok_or_else(|| ConclaveError::key_not_found(conversation_id, Some(version)))?;
        let chain = chain.lock().map_err(|_| lock_poisoned("key chain"))?;
        find_version(&chain, conversation_id, version)
    }

    fn get_active(&self, conversation_id: &str) -> Result<ConversationKey> {
        let chain = self
            .chain(conversation_id)
            .ok_or_else(|| ConclaveError::key_not_found(conversation_id, None))?;
        let chain = chain.lock().map_err(|_| lock_poisoned("key chain"))?;
        find_active(&chain, conversation_id)
    }

    fn mark_superseded(
        &self,
        conversation_id: &str,
        version: KeyVersion,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let chain = self
            .chain(conversation_id)
            .ok_or_else(|| ConclaveError::key_not_found(conversation_id, Some(version)))?;
        let mut chain = chain.lock().map_err(|_| lock_poisoned("key chain"))?;

        let row = chain
            .get_mut(&version)
            .ok_or_else(|| ConclaveError::key_not_found(conversation_id, Some(version)))?;
        if row.superseded_at.is_none() {
            row.superseded_at = Some(at);
        }
        Ok(())
    }
}

// ============================================================================
// Сообщения
// ============================================================================

/// Срез `log` (по возрастанию sequence) с `sequence < before`, от новых к старым
pub(super) fn page_newest_first(
    log: &[Message],
    before: Option<SequenceNumber>,
    limit: usize,
) -> Vec<Message> {
    let end = match before {
        Some(before) => log.partition_point(|m| m.sequence < before),
        None => log.len(),
    };
    let start = end.saturating_sub(limit);
    log[start..end].iter().rev().cloned().collect()
}

/// In-memory `MessageStore`. Сообщения беседы лежат по возрастанию sequence,
/// `sequence == index + 1`.
pub struct MemoryMessageStore {
    keys: Arc<dyn KeyStore>,
    max_page_size: usize,
    logs: DashMap<String, Arc<RwLock<Vec<Message>>>>,
}

impl MemoryMessageStore {
    pub fn new(keys: Arc<dyn KeyStore>, max_page_size: usize) -> Self {
        Self {
            keys,
            max_page_size,
            logs: DashMap::new(),
        }
    }
}

impl MessageStore for MemoryMessageStore {
    fn append(
        &self,
        conversation_id: &str,
        sender_id: &str,
        key_version: KeyVersion,
        sealed: Sealed,
        sent_at: DateTime<Utc>,
    ) -> Result<Message> {
        ensure_key_exists(self.keys.as_ref(), conversation_id, key_version)?;

        let log = Arc::clone(
            self.logs
                .entry(conversation_id.to_string())
                .or_default()
                .value(),
        );
        let mut log = log.write().map_err(|_| lock_poisoned("message log"))?;

        let message = Message {
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            sequence: log.len() as SequenceNumber + 1,
            key_version,
            algorithm: sealed.algorithm,
            nonce: sealed.nonce,
            ciphertext: sealed.ciphertext,
            sent_at,
        };
        log.push(message.clone());
        Ok(message)
    }

    fn fetch(
        &self,
        conversation_id: &str,
        before: Option<SequenceNumber>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        ensure_conversation_keyed(self.keys.as_ref(), conversation_id)?;

        let log = match self.logs.get(conversation_id) {
            Some(log) => Arc::clone(log.value()),
            None => return Ok(Vec::new()),
        };
        let log = log.read().map_err(|_| lock_poisoned("message log"))?;

        Ok(page_newest_first(
            &log,
            before,
            clamp_limit(limit, self.max_page_size),
        ))
    }
}

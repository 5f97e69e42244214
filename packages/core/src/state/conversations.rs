// Состояние бесед

use crate::crypto::KeyVersion;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Беседа: неизменяемый состав участников и текущая версия ключа
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub creator_id: String,
    pub participants: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    /// Последняя известная активная версия ключа
    pub key_version: KeyVersion,
}

impl Conversation {
    pub fn new(
        id: String,
        creator_id: String,
        participants: BTreeSet<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            creator_id,
            participants,
            created_at,
            key_version: crate::crypto::INITIAL_KEY_VERSION,
        }
    }

    pub fn is_participant(&self, participant_id: &str) -> bool {
        self.participants.contains(participant_id)
    }

    /// Тот же создатель и тот же состав
    pub fn matches(&self, creator_id: &str, participants: &BTreeSet<String>) -> bool {
        self.creator_id == creator_id && &self.participants == participants
    }
}

/// Результат попытки занять idempotency token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenClaim {
    /// Токен свободен и теперь закреплён за переданным id
    Claimed,
    /// Токен уже закреплён за беседой с этим id
    Existing(String),
}

/// Реестр всех бесед процесса
#[derive(Debug, Default)]
pub struct ConversationRegistry {
    conversations: DashMap<String, Conversation>,
    tokens: DashMap<String, String>,
}

impl ConversationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Получить беседу
    pub fn get(&self, conversation_id: &str) -> Option<Conversation> {
        self.conversations
            .get(conversation_id)
            .map(|c| c.value().clone())
    }

    /// Добавить беседу (например, восстановленную вызывающим после рестарта)
    pub fn insert(&self, conversation: Conversation) {
        self.conversations
            .insert(conversation.id.clone(), conversation);
    }

    /// Удалить беседу
    pub fn remove(&self, conversation_id: &str) -> Option<Conversation> {
        self.conversations
            .remove(conversation_id)
            .map(|(_, c)| c)
    }

    /// Запомнить версию ключа. Версия только растёт.
    pub fn observe_key_version(&self, conversation_id: &str, version: KeyVersion) {
        if let Some(mut conversation) = self.conversations.get_mut(conversation_id) {
            if version > conversation.key_version {
                conversation.key_version = version;
            }
        }
    }

    /// Атомарно закрепить токен за `conversation_id`, если он свободен
    pub fn claim_token(&self, token: &str, conversation_id: &str) -> TokenClaim {
        match self.tokens.entry(token.to_string()) {
            Entry::Occupied(existing) => TokenClaim::Existing(existing.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(conversation_id.to_string());
                TokenClaim::Claimed
            }
        }
    }

    /// Освободить токен после неудачного создания
    pub fn release_token(&self, token: &str) {
        self.tokens.remove(token);
    }
}

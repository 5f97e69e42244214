//! Каналы присутствия
//!
//! Канал это отметка «участник сейчас на связи в этой беседе». Хранится только
//! в памяти процесса, секретов не содержит и после рестарта не восстанавливается.
//! Доставка уведомлений: дело внешнего [`PresenceNotifier`].

use crate::storage::models::Message;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub conversation_id: String,
    pub participant_id: String,
    pub state: ChannelState,
}

/// Получатель событий присутствия. Все методы вызываются после фиксации
/// изменения и по умолчанию ничего не делают.
pub trait PresenceNotifier: Send + Sync {
    fn channel_opened(&self, _channel: &Channel) {}

    fn channel_closed(&self, _channel: &Channel) {}

    /// Сообщение сохранено. `recipients`: участники с открытым каналом,
    /// кроме отправителя.
    fn message_committed(&self, _message: &Message, _recipients: &[String]) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl PresenceNotifier for NoopNotifier {}

/// Открытые каналы по беседам
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    open: DashMap<String, BTreeSet<String>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true`, если канал не был открыт
    pub fn open(&self, conversation_id: &str, participant_id: &str) -> bool {
        self.open
            .entry(conversation_id.to_string())
            .or_default()
            .insert(participant_id.to_string())
    }

    /// `true`, если канал был открыт
    pub fn close(&self, conversation_id: &str, participant_id: &str) -> bool {
        let removed = match self.open.get_mut(conversation_id) {
            Some(mut participants) => participants.remove(participant_id),
            None => false,
        };
        self.open
            .remove_if(conversation_id, |_, participants| participants.is_empty());
        removed
    }

    pub fn state(&self, conversation_id: &str, participant_id: &str) -> ChannelState {
        let is_open = self
            .open
            .get(conversation_id)
            .map(|participants| participants.contains(participant_id))
            .unwrap_or(false);
        if is_open {
            ChannelState::Open
        } else {
            ChannelState::Closed
        }
    }

    /// Участники с открытым каналом, по возрастанию id
    pub fn open_participants(&self, conversation_id: &str) -> Vec<String> {
        self.open
            .get(conversation_id)
            .map(|participants| participants.iter().cloned().collect())
            .unwrap_or_default()
    }
}

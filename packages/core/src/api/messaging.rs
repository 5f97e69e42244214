// API для отправки и получения сообщений
//
// ConversationService: единственная точка входа: создание бесед, отправка,
// чтение с расшифровкой, ротация ключей и каналы присутствия.

use crate::config::Config;
use crate::crypto::{
    associated_data, CryptoEngine, KeyManager, KeyVersion, MasterKey, RotationPolicy, SecureBuffer,
};
use crate::state::channels::{Channel, ChannelRegistry, ChannelState, NoopNotifier, PresenceNotifier};
use crate::state::conversations::{Conversation, ConversationRegistry, TokenClaim};
use crate::storage::models::{ConversationKey, Message, SequenceNumber};
use crate::storage::retry::{RetryConfig, RetryingKeyStore, RetryingMessageStore};
use crate::storage::{
    FileKeyStore, FileMessageStore, KeyStore, MemoryKeyStore, MemoryMessageStore, MessageStore,
};
use crate::utils::error::{ConclaveError, Result};
use crate::utils::time::{Clock, SystemClock};
use crate::utils::uuid::generate_v4;
use crate::utils::validation::validate_participants;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Результат расшифровки одного сообщения
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Открытый текст, затирается при drop
    Plaintext(SecureBuffer),
    /// Неверный тег, подмена, отсутствующий ключ. Причина наружу не выдаётся.
    DecryptionFailed,
}

impl ReadOutcome {
    pub fn plaintext(&self) -> Option<&[u8]> {
        match self {
            ReadOutcome::Plaintext(buffer) => Some(buffer.as_slice()),
            ReadOutcome::DecryptionFailed => None,
        }
    }

    pub fn is_decrypted(&self) -> bool {
        matches!(self, ReadOutcome::Plaintext(_))
    }
}

#[derive(Debug)]
pub struct ReadItem {
    pub message: Message,
    pub outcome: ReadOutcome,
}

/// Страница истории, от новых сообщений к старым
#[derive(Debug)]
pub struct ReadPage {
    pub items: Vec<ReadItem>,
    /// `before_sequence` для следующей страницы: sequence самого старого
    /// сообщения. `None`, если страница пуста или дошла до sequence 1.
    pub next_before: Option<SequenceNumber>,
}

impl ReadPage {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Главный сервис бесед
pub struct ConversationService {
    config: Config,
    engine: CryptoEngine,
    key_store: Arc<dyn KeyStore>,
    keys: KeyManager,
    messages: Arc<dyn MessageStore>,
    conversations: ConversationRegistry,
    channels: ChannelRegistry,
    notifier: Arc<dyn PresenceNotifier>,
    clock: Arc<dyn Clock>,
    rotation_policy: RotationPolicy,
}

impl ConversationService {
    /// Собрать сервис поверх готовых хранилищ.
    ///
    /// Хранилища оборачиваются в повтор временных ошибок по настройкам `config`.
    pub fn new(
        config: Config,
        key_store: Arc<dyn KeyStore>,
        message_store: Arc<dyn MessageStore>,
    ) -> Result<Self> {
        config.validate()?;

        let retry = RetryConfig::from_config(&config);
        let key_store: Arc<dyn KeyStore> = Arc::new(RetryingKeyStore::new(key_store, retry.clone()));
        let messages: Arc<dyn MessageStore> =
            Arc::new(RetryingMessageStore::new(message_store, retry));

        let engine = CryptoEngine::new(config.algorithm);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        Ok(Self {
            keys: KeyManager::with_clock(key_store.clone(), engine, clock.clone()),
            rotation_policy: RotationPolicy::from_config(&config),
            config,
            engine,
            key_store,
            messages,
            conversations: ConversationRegistry::new(),
            channels: ChannelRegistry::new(),
            notifier: Arc::new(NoopNotifier),
            clock,
        })
    }

    /// Хранилища в памяти
    pub fn in_memory(config: Config) -> Result<Self> {
        let keys: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::new());
        let messages = Arc::new(MemoryMessageStore::new(keys.clone(), config.max_page_size));
        Self::new(config, keys, messages)
    }

    /// Файловые хранилища в `root`. Ключи бесед обёрнуты `master_key`.
    ///
    /// Реестр бесед в памяти: после рестарта вызывающий восстанавливает его
    /// через [`ConversationService::register_conversation`].
    pub fn open_file_backed(
        config: Config,
        root: impl AsRef<Path>,
        master_key: MasterKey,
    ) -> Result<Self> {
        let root = root.as_ref();
        let keys: Arc<dyn KeyStore> = Arc::new(FileKeyStore::open(root, master_key)?);
        let messages = Arc::new(FileMessageStore::open(
            root,
            keys.clone(),
            config.max_page_size,
        )?);
        Self::new(config, keys, messages)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.keys = KeyManager::with_clock(self.key_store.clone(), self.engine, clock.clone());
        self.clock = clock;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn PresenceNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn key_manager(&self) -> &KeyManager {
        &self.keys
    }

    // ========================================================================
    // Беседы
    // ========================================================================

    /// Создать беседу и её ключ версии 1.
    ///
    /// Участники: `participant_ids` ∪ {creator}. С `idempotency_token` повторный
    /// вызов с теми же входными данными возвращает уже созданную беседу.
    pub fn create_conversation<S: AsRef<str>>(
        &self,
        creator_id: &str,
        participant_ids: &[S],
        idempotency_token: Option<&str>,
    ) -> Result<Conversation> {
        use tracing::{info, warn};

        let participants = validate_participants(creator_id, participant_ids)?;
        let conversation_id = generate_v4();

        if let Some(token) = idempotency_token {
            if token.trim().is_empty() {
                return Err(ConclaveError::InvalidInput(
                    "Idempotency token must not be blank".to_string(),
                ));
            }
            if let TokenClaim::Existing(existing_id) =
                self.conversations.claim_token(token, &conversation_id)
            {
                let existing = self.conversations.get(&existing_id).ok_or_else(|| {
                    ConclaveError::InvalidInput(
                        "Conversation for this idempotency token is still being created"
                            .to_string(),
                    )
                })?;
                if existing.matches(creator_id, &participants) {
                    return Ok(existing);
                }
                return Err(ConclaveError::InvalidParticipants(
                    "Idempotency token was used with different participants".to_string(),
                ));
            }
        }

        let conversation = Conversation::new(
            conversation_id.clone(),
            creator_id.to_string(),
            participants,
            self.clock.now(),
        );
        self.conversations.insert(conversation.clone());

        if let Err(e) = self.keys.create_initial_key(&conversation_id) {
            self.conversations.remove(&conversation_id);
            if let Some(token) = idempotency_token {
                self.conversations.release_token(token);
            }
            warn!(
                target: "conclave::messaging",
                conversation_id = %conversation_id,
                error = %e,
                "Conversation creation rolled back"
            );
            return Err(e);
        }

        info!(
            target: "conclave::messaging",
            conversation_id = %conversation_id,
            creator_id = %creator_id,
            participants = conversation.participants.len(),
            "Conversation created"
        );

        Ok(conversation)
    }

    pub fn conversation(&self, conversation_id: &str) -> Result<Conversation> {
        self.conversations
            .get(conversation_id)
            .ok_or_else(|| ConclaveError::ConversationNotFound(conversation_id.to_string()))
    }

    /// Вернуть в реестр беседу, созданную до рестарта. Ключ беседы должен
    /// уже быть в хранилище.
    pub fn register_conversation(&self, mut conversation: Conversation) -> Result<Conversation> {
        if conversation.participants.len() < crate::utils::validation::MIN_PARTICIPANTS
            || !conversation.is_participant(&conversation.creator_id)
        {
            return Err(ConclaveError::InvalidParticipants(format!(
                "Conversation {} has an invalid participant set",
                conversation.id
            )));
        }

        let active = match self.keys.active_key(&conversation.id) {
            Ok(key) => key,
            Err(ConclaveError::KeyNotFound { .. }) => {
                return Err(ConclaveError::ConversationNotFound(conversation.id))
            }
            Err(e) => return Err(e),
        };
        conversation.key_version = active.version;
        self.conversations.insert(conversation.clone());
        Ok(conversation)
    }

    // ========================================================================
    // Сообщения
    // ========================================================================

    /// Зашифровать и сохранить сообщение. Возвращает только метаданные.
    pub fn send_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        plaintext: &[u8],
    ) -> Result<Message> {
        use tracing::debug;

        let conversation = self.participant_conversation(conversation_id, sender_id)?;

        let key = self.keys.active_key(conversation_id)?;
        let plaintext = SecureBuffer::copy_from_slice(plaintext);
        let aad = associated_data(conversation_id, key.version);
        let sealed = self.engine.encrypt(key.material(), plaintext.as_slice(), &aad)?;
        plaintext.wipe();

        let message = self
            .messages
            .append(conversation_id, sender_id, key.version, sealed, self.clock.now())?;
        drop(key);

        self.conversations
            .observe_key_version(conversation_id, message.key_version);

        let recipients: Vec<String> = self
            .channels
            .open_participants(conversation_id)
            .into_iter()
            .filter(|p| p != sender_id && conversation.is_participant(p))
            .collect();
        self.notifier.message_committed(&message, &recipients);

        debug!(
            target: "conclave::messaging",
            conversation_id = %conversation_id,
            sequence = message.sequence,
            key_version = message.key_version,
            algorithm = %message.algorithm,
            "Message committed"
        );

        Ok(message)
    }

    /// Прочитать страницу истории.
    ///
    /// Каждое сообщение расшифровывается отдельно: испорченная запись или
    /// потерянный ключ дают `DecryptionFailed` у этого элемента, остальные
    /// читаются как обычно. Ошибки хранилища прерывают страницу целиком.
    pub fn read_messages(
        &self,
        conversation_id: &str,
        reader_id: &str,
        before: Option<SequenceNumber>,
        limit: Option<usize>,
    ) -> Result<ReadPage> {
        self.participant_conversation(conversation_id, reader_id)?;

        let max = self.config.max_page_size;
        let limit = limit.unwrap_or(max).clamp(1, max);
        let messages = self.messages.fetch(conversation_id, before, limit)?;

        let mut keys: HashMap<KeyVersion, Option<ConversationKey>> = HashMap::new();
        let mut items = Vec::with_capacity(messages.len());

        for message in messages {
            let key = match keys.entry(message.key_version) {
                Entry::Occupied(slot) => slot.into_mut(),
                Entry::Vacant(slot) => {
                    let key = match self.keys.key_for_version(conversation_id, message.key_version)
                    {
                        Ok(key) => Some(key),
                        Err(ConclaveError::KeyNotFound { .. }) => None,
                        Err(e) => return Err(e),
                    };
                    slot.insert(key)
                }
            };

            let outcome = match key {
                Some(key) => self.open_message(conversation_id, key, &message),
                None => ReadOutcome::DecryptionFailed,
            };
            items.push(ReadItem { message, outcome });
        }

        // Хранилище может урезать страницу своим лимитом: конец истории
        // определяется по sequence 1, а не по длине страницы
        let next_before = items
            .last()
            .map(|oldest| oldest.message.sequence)
            .filter(|sequence| *sequence > 1);

        Ok(ReadPage { items, next_before })
    }

    /// Ленивый обход истории страницами. Продолжить с места остановки:
    /// `pages(.., cursor.position(), ..)`.
    pub fn pages(
        &self,
        conversation_id: &str,
        reader_id: &str,
        before: Option<SequenceNumber>,
        page_size: Option<usize>,
    ) -> PageCursor<'_> {
        PageCursor {
            service: self,
            conversation_id: conversation_id.to_string(),
            reader_id: reader_id.to_string(),
            before,
            page_size,
            exhausted: false,
        }
    }

    fn open_message(
        &self,
        conversation_id: &str,
        key: &ConversationKey,
        message: &Message,
    ) -> ReadOutcome {
        use tracing::warn;

        let aad = associated_data(conversation_id, message.key_version);
        match CryptoEngine::new(message.algorithm).decrypt(
            key.material(),
            &message.ciphertext,
            &message.nonce,
            &aad,
        ) {
            Ok(plaintext) => ReadOutcome::Plaintext(plaintext),
            Err(e) => {
                warn!(
                    target: "conclave::messaging",
                    conversation_id = %conversation_id,
                    sequence = message.sequence,
                    key_version = message.key_version,
                    error = %e,
                    "Message failed to decrypt"
                );
                ReadOutcome::DecryptionFailed
            }
        }
    }

    // ========================================================================
    // Ключи
    // ========================================================================

    /// Ротация ключа беседы. Старые сообщения остаются читаемыми.
    pub fn rotate_key(&self, conversation_id: &str) -> Result<KeyVersion> {
        let version = self.keys.rotate(conversation_id)?;
        self.conversations
            .observe_key_version(conversation_id, version);
        Ok(version)
    }

    /// Ротация, если активный ключ старше `key_rotation_max_age_secs`.
    pub fn rotate_if_due(&self, conversation_id: &str) -> Result<Option<KeyVersion>> {
        let active = self.keys.active_key(conversation_id)?;
        if !self.rotation_policy.is_due(&active, self.clock.now()) {
            return Ok(None);
        }
        drop(active);
        self.rotate_key(conversation_id).map(Some)
    }

    // ========================================================================
    // Каналы
    // ========================================================================

    pub fn open_channel(&self, conversation_id: &str, participant_id: &str) -> Result<Channel> {
        self.participant_conversation(conversation_id, participant_id)?;

        let channel = Channel {
            conversation_id: conversation_id.to_string(),
            participant_id: participant_id.to_string(),
            state: ChannelState::Open,
        };
        if self.channels.open(conversation_id, participant_id) {
            self.notifier.channel_opened(&channel);
        }
        Ok(channel)
    }

    pub fn close_channel(&self, conversation_id: &str, participant_id: &str) -> Result<Channel> {
        self.participant_conversation(conversation_id, participant_id)?;

        let channel = Channel {
            conversation_id: conversation_id.to_string(),
            participant_id: participant_id.to_string(),
            state: ChannelState::Closed,
        };
        if self.channels.close(conversation_id, participant_id) {
            self.notifier.channel_closed(&channel);
        }
        Ok(channel)
    }

    pub fn channel_state(&self, conversation_id: &str, participant_id: &str) -> Result<Channel> {
        self.participant_conversation(conversation_id, participant_id)?;

        Ok(Channel {
            conversation_id: conversation_id.to_string(),
            participant_id: participant_id.to_string(),
            state: self.channels.state(conversation_id, participant_id),
        })
    }

    pub fn open_channels(&self, conversation_id: &str) -> Result<Vec<Channel>> {
        self.conversation(conversation_id)?;

        Ok(self
            .channels
            .open_participants(conversation_id)
            .into_iter()
            .map(|participant_id| Channel {
                conversation_id: conversation_id.to_string(),
                participant_id,
                state: ChannelState::Open,
            })
            .collect())
    }

    fn participant_conversation(
        &self,
        conversation_id: &str,
        participant_id: &str,
    ) -> Result<Conversation> {
        let conversation = self.conversation(conversation_id)?;
        if !conversation.is_participant(participant_id) {
            return Err(ConclaveError::NotAParticipant {
                conversation_id: conversation_id.to_string(),
                participant_id: participant_id.to_string(),
            });
        }
        Ok(conversation)
    }
}

/// Итератор по страницам истории, см. [`ConversationService::pages`].
///
/// Каждая страница читается только при вызове `next`. После ошибки итератор
/// останавливается.
pub struct PageCursor<'a> {
    service: &'a ConversationService,
    conversation_id: String,
    reader_id: String,
    before: Option<SequenceNumber>,
    page_size: Option<usize>,
    exhausted: bool,
}

impl PageCursor<'_> {
    /// `before_sequence` следующей страницы
    pub fn position(&self) -> Option<SequenceNumber> {
        self.before
    }
}

impl Iterator for PageCursor<'_> {
    type Item = Result<ReadPage>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }

        match self.service.read_messages(
            &self.conversation_id,
            &self.reader_id,
            self.before,
            self.page_size,
        ) {
            Err(e) => {
                self.exhausted = true;
                Some(Err(e))
            }
            Ok(page) if page.is_empty() => {
                self.exhausted = true;
                None
            }
            Ok(page) => {
                self.before = page.next_before;
                self.exhausted = page.next_before.is_none();
                Some(Ok(page))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Algorithm;
    use std::sync::Mutex;

    fn service() -> ConversationService {
        ConversationService::in_memory(Config::default()).unwrap()
    }

    #[derive(Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<String>>,
    }

    impl PresenceNotifier for RecordingNotifier {
        fn channel_opened(&self, channel: &Channel) {
            self.events
                .lock()
                .unwrap()
                .push(format!("open:{}", channel.participant_id));
        }

        fn channel_closed(&self, channel: &Channel) {
            self.events
                .lock()
                .unwrap()
                .push(format!("close:{}", channel.participant_id));
        }

        fn message_committed(&self, message: &Message, recipients: &[String]) {
            self.events.lock().unwrap().push(format!(
                "message:{}:{}",
                message.sequence,
                recipients.join(",")
            ));
        }
    }

    #[test]
    fn test_send_and_read_round_trip() {
        let service = service();
        let conv = service
            .create_conversation("alice", &["bob"], None)
            .unwrap();

        let sent = service.send_message(&conv.id, "alice", b"hi").unwrap();
        assert_eq!(sent.sequence, 1);
        assert_eq!(sent.key_version, 1);
        assert_ne!(sent.ciphertext, b"hi".to_vec());

        let page = service.read_messages(&conv.id, "bob", None, None).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page.items[0].outcome.plaintext(), Some(&b"hi"[..]));
        assert_eq!(page.next_before, None);
    }

    #[test]
    fn test_create_rejects_bad_participants() {
        let service = service();
        let err = service
            .create_conversation("alice", &["alice"], None)
            .unwrap_err();
        assert!(matches!(err, ConclaveError::InvalidParticipants(_)));
    }

    #[test]
    fn test_idempotent_create() {
        let service = service();
        let first = service
            .create_conversation("alice", &["bob"], Some("req-1"))
            .unwrap();
        let again = service
            .create_conversation("alice", &["bob"], Some("req-1"))
            .unwrap();
        assert_eq!(first.id, again.id);

        let err = service
            .create_conversation("alice", &["carol"], Some("req-1"))
            .unwrap_err();
        assert!(matches!(err, ConclaveError::InvalidParticipants(_)));
    }

    #[test]
    fn test_messages_use_configured_algorithm() {
        let config = Config {
            algorithm: Algorithm::Aes256Gcm,
            ..Config::default()
        };
        let service = ConversationService::in_memory(config).unwrap();
        let conv = service
            .create_conversation("alice", &["bob"], None)
            .unwrap();

        let sent = service.send_message(&conv.id, "bob", b"gcm").unwrap();
        assert_eq!(sent.algorithm, Algorithm::Aes256Gcm);

        let page = service.read_messages(&conv.id, "alice", None, None).unwrap();
        assert_eq!(page.items[0].outcome.plaintext(), Some(&b"gcm"[..]));
    }

    #[test]
    fn test_presence_fan_out_excludes_sender() {
        let notifier = Arc::new(RecordingNotifier::default());
        let service = service().with_notifier(notifier.clone());
        let conv = service
            .create_conversation("alice", &["bob", "carol"], None)
            .unwrap();

        service.open_channel(&conv.id, "alice").unwrap();
        service.open_channel(&conv.id, "bob").unwrap();
        service.send_message(&conv.id, "alice", b"hey").unwrap();
        service.close_channel(&conv.id, "bob").unwrap();
        service.send_message(&conv.id, "alice", b"anyone?").unwrap();

        let events = notifier.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "open:alice".to_string(),
                "open:bob".to_string(),
                "message:1:bob".to_string(),
                "close:bob".to_string(),
                "message:2:".to_string(),
            ]
        );
    }

    #[test]
    fn test_channels_require_participant() {
        let service = service();
        let conv = service
            .create_conversation("alice", &["bob"], None)
            .unwrap();

        assert!(matches!(
            service.open_channel(&conv.id, "mallory"),
            Err(ConclaveError::NotAParticipant { .. })
        ));
        assert!(service.open_channels(&conv.id).unwrap().is_empty());

        service.open_channel(&conv.id, "bob").unwrap();
        let open = service.open_channels(&conv.id).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].participant_id, "bob");

        assert_eq!(
            service.channel_state(&conv.id, "bob").unwrap().state,
            ChannelState::Open
        );
        assert_eq!(
            service.channel_state(&conv.id, "alice").unwrap().state,
            ChannelState::Closed
        );
        assert!(matches!(
            service.channel_state(&conv.id, "mallory"),
            Err(ConclaveError::NotAParticipant { .. })
        ));
    }
}

// Управление ключами бесед
// Создание, выдача по версии и ротация симметричных ключей

use crate::config::Config;
use crate::crypto::engine::CryptoEngine;
use crate::crypto::KeyVersion;
use crate::storage::models::ConversationKey;
use crate::storage::KeyStore;
use crate::utils::error::{ConclaveError, Result};
use crate::utils::time::{Clock, SystemClock};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Первая версия ключа беседы
pub const INITIAL_KEY_VERSION: KeyVersion = 1;

/// Жизненный цикл ключей бесед поверх `KeyStore`.
///
/// Ротации одной беседы сериализованы, разные беседы ротируются параллельно.
/// Отправка сообщений эту блокировку не берёт.
pub struct KeyManager {
    store: Arc<dyn KeyStore>,
    engine: CryptoEngine,
    clock: Arc<dyn Clock>,
    rotation_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyManager {
    pub fn new(store: Arc<dyn KeyStore>, engine: CryptoEngine) -> Self {
        Self::with_clock(store, engine, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn KeyStore>, engine: CryptoEngine, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            engine,
            clock,
            rotation_locks: DashMap::new(),
        }
    }

    /// Сгенерировать и сохранить версию 1.
    pub fn create_initial_key(&self, conversation_id: &str) -> Result<ConversationKey> {
        use tracing::info;

        let material = self.engine.generate_key()?;
        let created_at = self.clock.now();

        match self
            .store
            .put(conversation_id, INITIAL_KEY_VERSION, &material, created_at)
        {
            Ok(()) => {}
            Err(ConclaveError::DuplicateVersion { .. }) => {
                return Err(ConclaveError::ConversationAlreadyKeyed(
                    conversation_id.to_string(),
                ))
            }
            Err(e) => return Err(e),
        }

        let key = ConversationKey::new(
            conversation_id,
            INITIAL_KEY_VERSION,
            material,
            created_at,
            None,
        );

        info!(
            target: "conclave::keys",
            conversation_id = %conversation_id,
            version = INITIAL_KEY_VERSION,
            fingerprint = %key.fingerprint(),
            "Initial conversation key created"
        );

        Ok(key)
    }

    pub fn active_key(&self, conversation_id: &str) -> Result<ConversationKey> {
        self.store.get_active(conversation_id)
    }

    pub fn key_for_version(&self, conversation_id: &str, version: KeyVersion) -> Result<ConversationKey> {
        self.store.get(conversation_id, version)
    }

    /// Ротация: новая версия `active + 1`, предыдущая вытесняется.
    ///
    /// # Процесс
    ///
    /// 1. Ремонт: вытеснить все невытесненные версии кроме самой новой
    ///    (след прерванной ротации)
    /// 2. `put(active + 1)`
    /// 3. `mark_superseded(active)`
    /// 4. Повторный ремонт
    ///
    /// `DuplicateVersion` на шаге 2 означает, что ту же версию записал другой
    /// процесс: ротация считается состоявшейся, возвращается выжившая активная
    /// версия. Сообщения не удаляются и не перешифровываются.
    pub fn rotate(&self, conversation_id: &str) -> Result<KeyVersion> {
        use tracing::{info, warn};

        let lock = self.rotation_lock(conversation_id);
        let _guard = lock.lock().map_err(|_| {
            ConclaveError::StorageError(format!("Rotation lock poisoned for {}", conversation_id))
        })?;

        let now = self.clock.now();
        let current = self.store.get_active(conversation_id)?;
        self.repair(conversation_id, current.version, now)?;

        let next = current.version + 1;
        let material = self.engine.generate_key()?;

        match self.store.put(conversation_id, next, &material, now) {
            Ok(()) => {}
            Err(ConclaveError::DuplicateVersion { .. }) => {
                warn!(
                    target: "conclave::keys",
                    conversation_id = %conversation_id,
                    version = next,
                    "Key version written concurrently, repairing"
                );
                let survivor = self.store.get_active(conversation_id)?;
                self.repair(conversation_id, survivor.version, now)?;
                return Ok(survivor.version);
            }
            Err(e) => return Err(e),
        }

        self.store
            .mark_superseded(conversation_id, current.version, now)?;
        self.repair(conversation_id, next, now)?;

        let new_key = ConversationKey::new(conversation_id, next, material, now, None);
        info!(
            target: "conclave::keys",
            conversation_id = %conversation_id,
            previous_version = current.version,
            version = next,
            fingerprint = %new_key.fingerprint(),
            "Conversation key rotated"
        );

        Ok(next)
    }

    /// Вытеснить активные версии ниже `newest`. Возвращает число исправленных.
    ///
    /// Идёт вниз от `newest - 1` и останавливается на первой вытесненной:
    /// всё ниже неё уже исправлено предыдущими ротациями.
    fn repair(&self, conversation_id: &str, newest: KeyVersion, at: DateTime<Utc>) -> Result<usize> {
        use tracing::warn;

        let mut repaired = 0;
        for version in (INITIAL_KEY_VERSION..newest).rev() {
            let key = match self.store.get(conversation_id, version) {
                Ok(key) => key,
                Err(ConclaveError::KeyNotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            if !key.is_active() {
                break;
            }
            self.store.mark_superseded(conversation_id, version, at)?;
            repaired += 1;
        }

        if repaired > 0 {
            warn!(
                target: "conclave::keys",
                conversation_id = %conversation_id,
                active_version = newest,
                repaired,
                "Superseded stale active key versions"
            );
        }
        Ok(repaired)
    }

    fn rotation_lock(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.rotation_locks
                .entry(conversation_id.to_string())
                .or_default()
                .value(),
        )
    }
}

// ============================================================================
// Политика ротации
// ============================================================================

/// Рекомендательная политика: когда активный ключ пора менять.
/// Запуск ротации остаётся решением вызывающего.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RotationPolicy {
    pub max_key_age: Option<Duration>,
}

impl RotationPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_key_age: config.key_rotation_max_age(),
        }
    }

    pub fn is_due(&self, key: &ConversationKey, now: DateTime<Utc>) -> bool {
        let max_age = match self.max_key_age {
            Some(max_age) => max_age,
            None => return false,
        };
        if !key.is_active() {
            return false;
        }
        match (now - key.created_at).to_std() {
            Ok(age) => age >= max_age,
            // created_at в будущем
            Err(_) => false,
        }
    }
}

// Повтор операций хранилища с экспоненциальным backoff и jitter

use crate::config::Config;
use crate::crypto::{KeyVersion, Sealed, SecureBuffer};
use crate::storage::models::{ConversationKey, Message, SequenceNumber};
use crate::storage::{KeyStore, MessageStore};
use crate::utils::error::{ConclaveError, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Общее число попыток, включая первую
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Случайный разброс задержки (±30%)
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(25),
            max_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.storage_retry_attempts.max(1),
            initial_backoff: Duration::from_millis(config.storage_retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(config.storage_retry_max_backoff_ms),
            ..Default::default()
        }
    }
}

/// Выполнить операцию, повторяя только временные ошибки хранилища.
///
/// Остальные ошибки возвращаются сразу. После исчерпания попыток:
/// `StorageUnavailable` с текстом последней ошибки.
pub fn with_retry<T, F>(config: &RetryConfig, op_name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    use tracing::warn;

    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    let mut backoff = config.initial_backoff;

    loop {
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                if attempt >= max_attempts {
                    warn!(
                        target: "conclave::storage",
                        op = op_name,
                        attempts = attempt,
                        error = %e,
                        "Storage retries exhausted"
                    );
                    return Err(ConclaveError::StorageUnavailable {
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }

                let delay = calculate_backoff(backoff, config.jitter);
                warn!(
                    target: "conclave::storage",
                    op = op_name,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying storage operation"
                );
                thread::sleep(delay);

                backoff = Duration::from_millis(
                    ((backoff.as_millis() as f64 * config.backoff_multiplier)
                        .min(config.max_backoff.as_millis() as f64)) as u64,
                );
            }
        }
    }
}

fn calculate_backoff(base: Duration, jitter: bool) -> Duration {
    if jitter {
        let factor = 1.0 + rand::thread_rng().gen_range(-0.3..0.3);
        Duration::from_millis((base.as_millis() as f64 * factor) as u64)
    } else {
        base
    }
}

// ============================================================================
// Декораторы
// ============================================================================

/// `KeyStore` с повтором временных ошибок
pub struct RetryingKeyStore {
    inner: Arc<dyn KeyStore>,
    config: RetryConfig,
}

impl RetryingKeyStore {
    pub fn new(inner: Arc<dyn KeyStore>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

impl KeyStore for RetryingKeyStore {
    fn put(
        &self,
        conversation_id: &str,
        version: KeyVersion,
        material: &SecureBuffer,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        with_retry(&self.config, "key_store.put", || {
            self.inner.put(conversation_id, version, material, created_at)
        })
    }

    fn get(&self, conversation_id: &str, version: KeyVersion) -> Result<ConversationKey> {
        with_retry(&self.config, "key_store.get", || {
            self.inner.get(conversation_id, version)
        })
    }

    fn get_active(&self, conversation_id: &str) -> Result<ConversationKey> {
        with_retry(&self.config, "key_store.get_active", || {
            self.inner.get_active(conversation_id)
        })
    }

    fn mark_superseded(
        &self,
        conversation_id: &str,
        version: KeyVersion,
        at: DateTime<Utc>,
    ) -> Result<()> {
        with_retry(&self.config, "key_store.mark_superseded", || {
            self.inner.mark_superseded(conversation_id, version, at)
        })
    }
}

/// `MessageStore` с повтором временных ошибок
pub struct RetryingMessageStore {
    inner: Arc<dyn MessageStore>,
    config: RetryConfig,
}

impl RetryingMessageStore {
    pub fn new(inner: Arc<dyn MessageStore>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

impl MessageStore for RetryingMessageStore {
    fn append(
        &self,
        conversation_id: &str,
        sender_id: &str,
        key_version: KeyVersion,
        sealed: Sealed,
        sent_at: DateTime<Utc>,
    ) -> Result<Message> {
        with_retry(&self.config, "message_store.append", || {
            self.inner
                .append(conversation_id, sender_id, key_version, sealed.clone(), sent_at)
        })
    }

    fn fetch(
        &self,
        conversation_id: &str,
        before: Option<SequenceNumber>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        with_retry(&self.config, "message_store.fetch", || {
            self.inner.fetch(conversation_id, before, limit)
        })
    }
}

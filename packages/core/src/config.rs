//! Конфигурация ядра Conclave
//!
//! Все константы и настройки определены здесь. Конфигурация передаётся
//! явно в конструкторы (`CryptoEngine`, `KeyManager`, хранилища,
//! `ConversationService`), глобального состояния нет.

use crate::crypto::Algorithm;
use crate::utils::error::{ConclaveError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Основная структура конфигурации
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // ============================================
    // КРИПТОГРАФИЧЕСКИЕ ПАРАМЕТРЫ
    // ============================================

    /// AEAD алгоритм для новых сообщений
    pub algorithm: Algorithm,

    /// PBKDF2: количество итераций для деривации мастер-ключа из пароля
    pub pbkdf2_iterations: u32,

    /// Длина соли для PBKDF2 (в байтах)
    pub salt_length: usize,

    // ============================================
    // РОТАЦИЯ
    // ============================================

    /// Максимальный возраст активного ключа (в секундах), после которого
    /// `rotate_if_due` выполняет ротацию. `None`: ротация только по запросу.
    pub key_rotation_max_age_secs: Option<u64>,

    // ============================================
    // ХРАНИЛИЩЕ
    // ============================================

    /// Максимальный размер страницы при чтении сообщений
    pub max_page_size: usize,

    /// Количество попыток записи при временных ошибках хранилища
    pub storage_retry_attempts: u32,

    /// Начальная задержка backoff (в миллисекундах)
    pub storage_retry_initial_backoff_ms: u64,

    /// Максимальная задержка backoff (в миллисекундах)
    pub storage_retry_max_backoff_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Криптография
            algorithm: Algorithm::ChaCha20Poly1305,
            pbkdf2_iterations: 100_000,
            salt_length: 32,

            // Ротация
            key_rotation_max_age_secs: None,

            // Хранилище
            max_page_size: 50,
            storage_retry_attempts: 3,
            storage_retry_initial_backoff_ms: 25,
            storage_retry_max_backoff_ms: 1000,
        }
    }
}

impl Config {
    /// Создать конфигурацию из переменных окружения (`CONCLAVE_*`)
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("CONCLAVE_ALGORITHM") {
            config.algorithm = val.parse()?;
        }

        if let Ok(val) = std::env::var("CONCLAVE_MAX_PAGE_SIZE") {
            config.max_page_size = parse_env("CONCLAVE_MAX_PAGE_SIZE", &val)?;
        }

        if let Ok(val) = std::env::var("CONCLAVE_KEY_ROTATION_MAX_AGE_SECS") {
            config.key_rotation_max_age_secs =
                Some(parse_env("CONCLAVE_KEY_ROTATION_MAX_AGE_SECS", &val)?);
        }

        if let Ok(val) = std::env::var("CONCLAVE_PBKDF2_ITERATIONS") {
            config.pbkdf2_iterations = parse_env("CONCLAVE_PBKDF2_ITERATIONS", &val)?;
        }

        if let Ok(val) = std::env::var("CONCLAVE_STORAGE_RETRY_ATTEMPTS") {
            config.storage_retry_attempts = parse_env("CONCLAVE_STORAGE_RETRY_ATTEMPTS", &val)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Загрузить конфигурацию из JSON файла; отсутствующие поля берутся по умолчанию
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ConclaveError::ConfigError(format!(
                "Failed to read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| ConclaveError::ConfigError(format!("Invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_page_size == 0 {
            return Err(ConclaveError::ConfigError(
                "max_page_size must be positive".to_string(),
            ));
        }
        if self.pbkdf2_iterations == 0 {
            return Err(ConclaveError::ConfigError(
                "pbkdf2_iterations must be positive".to_string(),
            ));
        }
        if self.salt_length < 16 {
            return Err(ConclaveError::ConfigError(
                "salt_length must be at least 16 bytes".to_string(),
            ));
        }
        Ok(())
    }

    pub fn key_rotation_max_age(&self) -> Option<Duration> {
        self.key_rotation_max_age_secs.map(Duration::from_secs)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, val: &str) -> Result<T> {
    val.parse()
        .map_err(|_| ConclaveError::ConfigError(format!("Invalid value for {}: {:?}", name, val)))
}

//! Криптографические наборы (AEAD Suites)
//!
//! Реализации `AeadSuite`. Выбор набора через [`Algorithm`](crate::crypto::Algorithm)
//! в конфигурации; набор записывается в каждое сообщение, поэтому смена
//! конфигурации не ломает чтение истории.
//!
//! ### Classic Suite (по умолчанию)
//! - **AEAD**: ChaCha20-Poly1305
//! - **Key**: 32 байта, **Nonce**: 12 байт, **Tag**: 16 байт
//! - **Suite ID**: 1
//!
//! ### AES-GCM Suite
//! - **AEAD**: AES-256-GCM
//! - **Key**: 32 байта, **Nonce**: 12 байт, **Tag**: 16 байт
//! - **Suite ID**: 2

pub mod aes;
pub mod classic;

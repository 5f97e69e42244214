//! Криптографический модуль
//!
//! # Архитектура
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ConversationService                      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                ┌─────────────┴─────────────┐
//!                ▼                           ▼
//! ┌───────────────────────────┐  ┌──────────────────────────┐
//! │        KeyManager         │  │       CryptoEngine       │
//! │  - версия 1 при создании  │  │  - encrypt / decrypt     │
//! │  - ротация, ремонт        │  │  - свежий nonce          │
//! │  - ключ по версии         │  │  - AAD: беседа + версия  │
//! └───────────────────────────┘  └──────────────────────────┘
//!                │                           │
//!                ▼                           ▼
//! ┌───────────────────────────┐  ┌──────────────────────────┐
//! │    KeyStore (storage)     │  │   AeadSuite (suites)     │
//! │  - MasterKey на диске     │  │  - ChaCha20-Poly1305     │
//! │                           │  │  - AES-256-GCM           │
//! └───────────────────────────┘  └──────────────────────────┘
//! ```
//!
//! Ключи и открытый текст живут только в [`SecureBuffer`].
//!
//! ## Модули
//!
//! - [`secure_buffer`]: буфер с затиранием при drop
//! - [`engine`]: CryptoEngine, `Algorithm`, associated data
//! - [`keys`]: KeyManager и RotationPolicy
//! - [`master_key`]: мастер-ключ для обёртки ключей бесед на диске

// ============================================================================
// Core
// ============================================================================

/// AeadSuite trait для crypto-agility
pub(crate) mod provider;

/// Криптографические наборы (ChaCha20-Poly1305, AES-256-GCM)
pub(crate) mod suites;

pub mod engine;

pub mod secure_buffer;

// ============================================================================
// Ключи
// ============================================================================

pub mod keys;

pub mod master_key;

// ============================================================================
// Re-exports для удобства
// ============================================================================

pub use engine::{associated_data, Algorithm, CryptoEngine, Sealed, KEY_LENGTH};
pub use keys::{KeyManager, RotationPolicy, INITIAL_KEY_VERSION};
pub use master_key::MasterKey;
pub use secure_buffer::SecureBuffer;

/// Номер поколения ключа беседы, начиная с 1
pub type KeyVersion = u32;

// Conclave Core
// Per-conversation encryption engine: keys, rotation, encrypted history

#![warn(clippy::all)]

// Модули
pub mod api;
pub mod config;
pub mod crypto;
pub mod error;
pub mod state;
pub mod storage;
pub mod utils;

// Re-exports для удобства
pub use api::{ConversationService, PageCursor, ReadItem, ReadOutcome, ReadPage};
pub use config::Config;
pub use crypto::{Algorithm, KeyVersion, MasterKey, SecureBuffer};
pub use state::{Channel, ChannelState, Conversation, PresenceNotifier};
pub use storage::{ConversationKey, Message, SequenceNumber};
pub use utils::error::{ConclaveError, Result};

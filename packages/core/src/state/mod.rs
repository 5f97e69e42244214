// Состояние процесса: реестр бесед и каналы присутствия

pub mod channels;
pub mod conversations;

pub use channels::{Channel, ChannelRegistry, ChannelState, NoopNotifier, PresenceNotifier};
pub use conversations::{Conversation, ConversationRegistry, TokenClaim};

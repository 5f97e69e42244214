// Публичный API ядра
// Высокоуровневые операции над беседами

pub mod messaging;

pub use messaging::{ConversationService, PageCursor, ReadItem, ReadOutcome, ReadPage};

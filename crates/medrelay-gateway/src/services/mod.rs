//! Built-in business handlers.

pub mod chat;
pub mod echo;
pub mod long_poll;
pub mod store;

pub use chat::ChatService;
pub use echo::EchoService;
pub use long_poll::{LongPollCoordinator, PollData, PollOutcome, PollParams};
pub use store::{ChatMessage, Contact, MemoryMessageStore, MessageStore, NewMessage};

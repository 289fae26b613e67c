//! Conversation memory for agents served over the protocol

mod in_memory;

pub use in_memory::{ConversationHistory, Turn};

//! In-memory conversation history

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Turns kept per conversation before the oldest are trimmed
pub const DEFAULT_MAX_TURNS_PER_CONVERSATION: usize = 200;

/// One line of a conversation, already labelled (`User: ...`, `Agent: ...`)
pub type Turn = String;

/// Append-only turn log keyed by conversation id.
///
/// Owned by a single agent adapter, so the agent half of the
/// (agent, conversation) key is implicit. Lives for the process lifetime.
#[derive(Clone)]
pub struct ConversationHistory {
    conversations: Arc<RwLock<HashMap<String, Vec<Turn>>>>,
    max_turns_per_conversation: usize,
}

impl ConversationHistory {
    pub fn new(max_turns_per_conversation: usize) -> Self {
        Self {
            conversations: Arc::new(RwLock::new(HashMap::new())),
            max_turns_per_conversation: max_turns_per_conversation.max(1),
        }
    }

    /// Append turns in order, trimming the oldest past the storage cap.
    pub async fn append<I>(&self, conversation_id: &str, turns: I)
    where
        I: IntoIterator<Item = Turn>,
    {
        let mut conversations = self.conversations.write().await;
        let log = conversations.entry(conversation_id.to_string()).or_default();
        log.extend(turns);

        if log.len() > self.max_turns_per_conversation {
            let remove_count = log.len() - self.max_turns_per_conversation;
            log.drain(0..remove_count);
        }
    }

    /// The most recent `n` turns, oldest first.
    pub async fn recent(&self, conversation_id: &str, n: usize) -> Vec<Turn> {
        let conversations = self.conversations.read().await;
        conversations
            .get(conversation_id)
            .map(|log| log[log.len().saturating_sub(n)..].to_vec())
            .unwrap_or_default()
    }

    pub async fn conversation_count(&self) -> usize {
        self.conversations.read().await.len()
    }
}

impl Default for ConversationHistory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TURNS_PER_CONVERSATION)
    }
}

use async_trait::async_trait;
use chatgate_common::{Conversation, ConversationId, ConversationUpdate, HistoryEntry, Result};
use chrono::{DateTime, Utc};

/// Load/save contract the answer engine persists conversations through.
///
/// Every call is atomic on its own; the engine never needs a multi-entry transaction.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn load_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>>;

    async fn create_conversation(&self, conversation: &Conversation) -> Result<()>;

    async fn update_conversation(
        &self,
        id: &ConversationId,
        update: &ConversationUpdate,
    ) -> Result<()>;

    /// Explicit thread deletion: removes the conversation and all of its entries.
    async fn delete_conversation(&self, id: &ConversationId) -> Result<()>;

    /// Live entries of a conversation, ordered by creation time then insertion order.
    async fn load_live_history(&self, id: &ConversationId) -> Result<Vec<HistoryEntry>>;

    /// Persist a new entry and return its storage identifier.
    async fn append_entry(&self, id: &ConversationId, entry: &HistoryEntry) -> Result<i64>;

    async fn mark_not_live(&self, entry_ids: &[i64]) -> Result<()>;

    async fn delete_entries(&self, entry_ids: &[i64]) -> Result<usize>;

    /// Delete entries of a conversation that are retired or older than `cutoff`.
    async fn prune_expired(&self, id: &ConversationId, cutoff: DateTime<Utc>) -> Result<usize>;
}

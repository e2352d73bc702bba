pub mod conversation;
pub mod error;
pub mod model;
pub mod types;

pub use conversation::{
    Conversation, ConversationUpdate, EntryKind, EntryRole, HistoryEntry, MAX_RETENTION_DAYS,
    SystemPrompt, TokenUsage, ToolCallRequest,
};
pub use error::{Error, Result};
pub use model::{ModelDescriptor, ProviderFamily};
pub use types::{ConversationId, MessageRef};

pub mod context;
pub mod conversation;
pub mod display;
pub mod orchestrator;
pub mod providers;
pub mod registry;
pub mod stream;
pub mod tools;

pub use context::{ContextWindowManager, SummarySettings};
pub use conversation::{ConversationHandle, ConversationRegistry, ConversationTemplate};
pub use display::{DisplayChannel, DisplayUpdate, Transport};
pub use orchestrator::{AnswerOrchestrator, EngineSettings, TurnInput, TurnState};
pub use providers::{
    ChatMessage, ChatRole, ContentBlock, EventStream, LlmRequest, MessagePart, ProviderAdapter,
    ProviderEvent, ToolDefinition,
};
pub use registry::ProviderRegistry;
pub use stream::{AggregatedTurn, StreamAggregator, StreamOutcome};
pub use tools::{Tool, ToolContext, ToolOutput, ToolRegistry};

use async_trait::async_trait;
use chatgate_common::{ConversationId, Result};

pub mod clock;
pub mod registry;

pub use clock::CurrentTime;
pub use registry::ToolRegistry;

/// A function the model may call. Implementations interpret their own arguments.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the arguments object.
    fn input_schema(&self) -> serde_json::Value;

    async fn execute(&self, context: &ToolContext, args: serde_json::Value) -> Result<ToolOutput>;
}

#[derive(Debug, Clone)]
pub struct ToolContext {
    pub conversation_id: ConversationId,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Shorten raw arguments for status lines, cutting on a char boundary.
pub fn args_summary(arguments: &str, max_chars: usize) -> String {
    let compact = arguments.split_whitespace().collect::<Vec<_>>().join(" ");
    if compact.chars().count() <= max_chars {
        return compact;
    }
    let mut cut: String = compact.chars().take(max_chars).collect();
    cut.push('…');
    cut
}

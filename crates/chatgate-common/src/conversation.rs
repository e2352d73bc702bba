use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ConversationId, MessageRef};

/// Longest history retention a conversation accepts, about a century.
pub const MAX_RETENTION_DAYS: u32 = 36_500;

/// System prompt a conversation runs with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SystemPrompt {
    /// Free-form prompt stored on the conversation.
    Master { prompt: String },
    /// Prompt of a named role.
    Role { name: String, prompt: String },
}

impl SystemPrompt {
    pub fn text(&self) -> &str {
        match self {
            SystemPrompt::Master { prompt } | SystemPrompt::Role { prompt, .. } => prompt,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, input_tokens: u64, output_tokens: u64) {
        self.input_tokens += input_tokens;
        self.output_tokens += output_tokens;
    }
}

/// One ongoing dialogue and its settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub user_id: String,
    /// Catalog name of the selected model.
    pub model: String,
    pub temperature: f64,
    pub system_prompt: Option<SystemPrompt>,
    pub retention_days: u32,
    /// Maximum number of live entries before summarization kicks in.
    pub context_limit: usize,
    pub streaming: bool,
    pub usage: TokenUsage,
    /// Message currently being edited with progress for the running turn.
    pub in_flight_message: Option<MessageRef>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: ConversationId, user_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id,
            user_id: user_id.into(),
            model: model.into(),
            temperature: 0.7,
            system_prompt: None,
            retention_days: 30,
            context_limit: 100,
            streaming: true,
            usage: TokenUsage::default(),
            in_flight_message: None,
            created_at: Utc::now(),
        }
    }

    /// Oldest creation time still inside the retention window. A window
    /// reaching past the earliest representable time keeps everything.
    pub fn retention_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(Duration::days(i64::from(self.retention_days)))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn apply(&mut self, update: &ConversationUpdate) {
        if let Some(model) = &update.model {
            self.model = model.clone();
        }
        if let Some(temperature) = update.temperature {
            self.temperature = temperature;
        }
        if let Some(prompt) = &update.system_prompt {
            self.system_prompt = prompt.clone();
        }
        if let Some(days) = update.retention_days {
            self.retention_days = days;
        }
        if let Some(limit) = update.context_limit {
            self.context_limit = limit;
        }
        if let Some(streaming) = update.streaming {
            self.streaming = streaming;
        }
        if let Some(usage) = update.usage {
            self.usage = usage;
        }
        if let Some(message) = &update.in_flight_message {
            self.in_flight_message = message.clone();
        }
    }
}

/// Partial update of conversation fields. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationUpdate {
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub system_prompt: Option<Option<SystemPrompt>>,
    pub retention_days: Option<u32>,
    pub context_limit: Option<usize>,
    pub streaming: Option<bool>,
    pub usage: Option<TokenUsage>,
    pub in_flight_message: Option<Option<MessageRef>>,
}

impl ConversationUpdate {
    pub fn in_flight(message: Option<MessageRef>) -> Self {
        Self {
            in_flight_message: Some(message),
            ..Self::default()
        }
    }

    pub fn usage(usage: TokenUsage) -> Self {
        Self {
            usage: Some(usage),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryRole {
    System,
    User,
    Assistant,
    Tool,
}

impl EntryRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryRole::System => "system",
            EntryRole::User => "user",
            EntryRole::Assistant => "assistant",
            EntryRole::Tool => "tool",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "system" => Some(EntryRole::System),
            "user" => Some(EntryRole::User),
            "assistant" => Some(EntryRole::Assistant),
            "tool" => Some(EntryRole::Tool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Normal,
    Summary,
    System,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Normal => "normal",
            EntryKind::Summary => "summary",
            EntryKind::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "normal" => Some(EntryKind::Normal),
            "summary" => Some(EntryKind::Summary),
            "system" => Some(EntryKind::System),
            _ => None,
        }
    }
}

/// A tool invocation requested by the model. Arguments are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// One turn in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Storage identifier; `None` until the entry has been persisted.
    pub id: Option<i64>,
    pub role: EntryRole,
    pub content: Option<String>,
    pub tool_call_id: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub attachment: Option<String>,
    pub live: bool,
    pub kind: EntryKind,
    pub created_at: DateTime<Utc>,
}

impl HistoryEntry {
    fn base(role: EntryRole, content: Option<String>) -> Self {
        Self {
            id: None,
            role,
            content,
            tool_call_id: None,
            tool_calls: Vec::new(),
            attachment: None,
            live: true,
            kind: EntryKind::Normal,
            created_at: Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::base(EntryRole::User, Some(text.into()))
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::base(EntryRole::Assistant, Some(text.into()))
    }

    /// Assistant turn that requested tools. Empty text is stored as no content.
    pub fn assistant_tool_calls(text: &str, tool_calls: Vec<ToolCallRequest>) -> Self {
        let content = (!text.is_empty()).then(|| text.to_string());
        Self {
            tool_calls,
            ..Self::base(EntryRole::Assistant, content)
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::base(EntryRole::Tool, Some(content.into()))
        }
    }

    pub fn summary(text: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            kind: EntryKind::Summary,
            created_at,
            ..Self::base(EntryRole::Assistant, Some(text.into()))
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            kind: EntryKind::System,
            ..Self::base(EntryRole::System, Some(text.into()))
        }
    }

    pub fn with_attachment(mut self, attachment: impl Into<String>) -> Self {
        self.attachment = Some(attachment.into());
        self
    }

    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }
}

use chatgate_common::{Conversation, EntryKind, EntryRole, Error, HistoryEntry, Result};
use chatgate_db::ConversationStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::providers::{
    ChatMessage, ChatRole, ContentBlock, LlmRequest, MessagePart, send_with_deadline,
};
use crate::registry::ProviderRegistry;
use crate::stream::{StreamAggregator, StreamOutcome};

const SUMMARY_INSTRUCTION: &str = "Summarize this conversation concisely, in the language the \
     conversation is written in. Preserve key facts, user identity, decisions, and ongoing \
     topics. Be brief.";

const SUMMARY_PREFIX: &str = "Summary of the earlier conversation:\n";

/// Entries kept verbatim at the very least, whatever `keep_recent` says.
const MIN_KEEP_RECENT: usize = 2;

#[derive(Debug, Clone)]
pub struct SummarySettings {
    /// Catalog name of the model that writes summaries.
    pub model: String,
    /// Newest live entries always kept verbatim.
    pub keep_recent: usize,
    pub max_tokens: u32,
    pub timeout: Duration,
}

/// Decides which history entries reach the model and keeps the live set bounded.
pub struct ContextWindowManager {
    store: Arc<dyn ConversationStore>,
    providers: Arc<ProviderRegistry>,
    settings: SummarySettings,
}

impl ContextWindowManager {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        providers: Arc<ProviderRegistry>,
        settings: SummarySettings,
    ) -> Self {
        Self {
            store,
            providers,
            settings,
        }
    }

    /// Live entries inside the retention window, oldest first. Equal timestamps
    /// keep insertion order; entries not yet persisted sort last.
    pub fn select(
        conversation: &Conversation,
        entries: Vec<HistoryEntry>,
        now: DateTime<Utc>,
    ) -> Vec<HistoryEntry> {
        let cutoff = conversation.retention_cutoff(now);
        let mut selected: Vec<HistoryEntry> = entries
            .into_iter()
            .filter(|e| e.live && e.created_at >= cutoff)
            .collect();
        selected.sort_by(history_order);
        selected
    }

    pub async fn load(&self, conversation: &Conversation) -> Result<Vec<HistoryEntry>> {
        let entries = self.store.load_live_history(&conversation.id).await?;
        Ok(Self::select(conversation, entries, Utc::now()))
    }

    pub fn needs_summary(conversation: &Conversation, live: &[HistoryEntry]) -> bool {
        live.len() > conversation.context_limit
    }

    /// Replace the oldest block of `live` with one summary entry.
    ///
    /// On error `live` is unchanged and no summary is left live in the store.
    /// Retired rows that fail to delete stay non-live until the next prune.
    pub async fn summarize(
        &self,
        conversation: &Conversation,
        live: &mut Vec<HistoryEntry>,
    ) -> Result<()> {
        let split = self.block_end(live);
        if split == 0 {
            return Ok(());
        }

        let transcript = transcript(&live[..split]);
        let text = self.request_summary(conversation, transcript).await?;

        let created_at = match live.get(split) {
            Some(first_kept) => first_kept.created_at - ChronoDuration::nanoseconds(1),
            None => live[split - 1].created_at + ChronoDuration::nanoseconds(1),
        };
        let mut summary = HistoryEntry::summary(text, created_at);
        let summary_id = self
            .store
            .append_entry(&conversation.id, &summary)
            .await
            .map_err(|e| Error::SummarizationFailed(format!("failed to store summary: {e}")))?;
        summary.id = Some(summary_id);

        let retired: Vec<i64> = live[..split].iter().filter_map(|e| e.id).collect();
        if let Err(e) = self.store.mark_not_live(&retired).await {
            self.discard_summary(conversation, summary_id).await;
            return Err(e);
        }
        let deleted = match self.store.delete_entries(&retired).await {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!(
                    conversation_id = %conversation.id,
                    error = %e,
                    "failed to delete summarized entries, leaving them for pruning"
                );
                0
            }
        };

        let kept = live.split_off(split);
        *live = std::iter::once(summary).chain(kept).collect();

        info!(
            conversation_id = %conversation.id,
            summarized = split,
            deleted,
            live = live.len(),
            "summarized conversation history"
        );
        Ok(())
    }

    async fn discard_summary(&self, conversation: &Conversation, summary_id: i64) {
        if let Err(e) = self.store.delete_entries(&[summary_id]).await {
            warn!(
                conversation_id = %conversation.id,
                summary_id,
                error = %e,
                "failed to remove orphaned summary"
            );
        }
    }

    /// Index of the first entry kept verbatim. Never splits a tool result from
    /// the assistant entry that requested it.
    fn block_end(&self, live: &[HistoryEntry]) -> usize {
        let keep = self.settings.keep_recent.max(MIN_KEEP_RECENT);
        let mut split = live.len().saturating_sub(keep);
        while split > 0 && split < live.len() && live[split].role == EntryRole::Tool {
            split -= 1;
        }
        split
    }

    async fn request_summary(&self, conversation: &Conversation, transcript: String) -> Result<String> {
        let (model, adapter) = self
            .providers
            .resolve(&self.settings.model)
            .map_err(|e| Error::SummarizationFailed(e.to_string()))?;

        let mut request = LlmRequest::new(model.id.clone(), vec![ChatMessage::user(transcript)]);
        request.system = Some(SUMMARY_INSTRUCTION.to_string());
        request.max_tokens = Some(self.settings.max_tokens);
        request.temperature = model.effective_temperature(0.0);
        request.user = Some(conversation.user_id.clone());
        request.stream = false;

        debug!(conversation_id = %conversation.id, model = %model.name, "requesting summary");
        let events = send_with_deadline(adapter, request, self.settings.timeout);
        match StreamAggregator::new(usize::MAX).drive(events, |_| {}).await {
            StreamOutcome::Completed(turn) if !turn.text.trim().is_empty() => {
                Ok(turn.text.trim().to_string())
            }
            StreamOutcome::Completed(_) => Err(Error::SummarizationFailed(
                "summary model returned no text".to_string(),
            )),
            StreamOutcome::Failed { error, .. } => Err(Error::SummarizationFailed(error.to_string())),
        }
    }

    /// Drop retired and expired persisted entries from `buffer`, then from the store.
    /// Entries never persisted stay, whatever their age.
    pub async fn prune(
        &self,
        conversation: &Conversation,
        buffer: &mut Vec<HistoryEntry>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let cutoff = conversation.retention_cutoff(now);
        buffer.retain(|e| !e.is_persisted() || (e.live && e.created_at >= cutoff));
        let removed = self.store.prune_expired(&conversation.id, cutoff).await?;
        if removed > 0 {
            debug!(conversation_id = %conversation.id, removed, "pruned history entries");
        }
        Ok(removed)
    }
}

fn history_order(a: &HistoryEntry, b: &HistoryEntry) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.id.unwrap_or(i64::MAX).cmp(&b.id.unwrap_or(i64::MAX)))
}

fn transcript(block: &[HistoryEntry]) -> String {
    let mut out = String::new();
    for summary in block.iter().filter(|e| e.kind == EntryKind::Summary) {
        out.push_str("Previous summary:\n");
        out.push_str(summary.text());
        out.push_str("\n\n");
    }

    out.push_str("Recent conversation to incorporate:\n");
    for entry in block.iter().filter(|e| e.kind != EntryKind::Summary) {
        let role = match entry.role {
            EntryRole::User => "User",
            EntryRole::Assistant => "Assistant",
            EntryRole::System => "System",
            EntryRole::Tool => "Tool",
        };
        let mut text = entry.text().to_string();
        for call in &entry.tool_calls {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(&format!("[called {}({})]", call.name, call.arguments));
        }
        out.push_str(&format!("{role}: {text}\n"));
    }
    out
}

/// Render history entries as provider messages.
pub fn to_chat_messages(entries: &[HistoryEntry]) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.kind == EntryKind::Summary {
            messages.push(ChatMessage::user(format!("{SUMMARY_PREFIX}{}", entry.text())));
            continue;
        }

        match entry.role {
            EntryRole::System => {}
            EntryRole::User => match &entry.attachment {
                Some(attachment) => messages.push(ChatMessage {
                    role: ChatRole::User,
                    content: MessagePart::Parts(vec![
                        ContentBlock::Text {
                            text: entry.text().to_string(),
                        },
                        ContentBlock::Image {
                            url: attachment.clone(),
                        },
                    ]),
                }),
                None => messages.push(ChatMessage::user(entry.text())),
            },
            EntryRole::Assistant if entry.tool_calls.is_empty() => {
                messages.push(ChatMessage::assistant(entry.text()));
            }
            EntryRole::Assistant => {
                let mut blocks = Vec::with_capacity(entry.tool_calls.len() + 1);
                if !entry.text().is_empty() {
                    blocks.push(ContentBlock::Text {
                        text: entry.text().to_string(),
                    });
                }
                blocks.extend(entry.tool_calls.iter().map(|call| ContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                }));
                messages.push(ChatMessage {
                    role: ChatRole::Assistant,
                    content: MessagePart::Parts(blocks),
                });
            }
            EntryRole::Tool => messages.push(ChatMessage {
                role: ChatRole::Tool,
                content: MessagePart::Parts(vec![ContentBlock::ToolResult {
                    tool_use_id: entry.tool_call_id.clone().unwrap_or_default(),
                    content: entry.text().to_string(),
                }]),
            }),
        }
    }
    messages
}

/// System text for a turn: the conversation prompt followed by system entries.
pub fn system_text(conversation: &Conversation, entries: &[HistoryEntry]) -> Option<String> {
    let parts: Vec<&str> = conversation
        .system_prompt
        .as_ref()
        .map(|p| p.text())
        .into_iter()
        .chain(
            entries
                .iter()
                .filter(|e| e.role == EntryRole::System)
                .map(HistoryEntry::text),
        )
        .filter(|text| !text.trim().is_empty())
        .collect();

    (!parts.is_empty()).then(|| parts.join("\n\n"))
}

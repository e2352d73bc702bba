use chatgate_common::{ConversationId, ConversationUpdate, Error, HistoryEntry, Result, TokenUsage};
use chatgate_db::ConversationStore;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::context::{ContextWindowManager, system_text, to_chat_messages};
use crate::conversation::ConversationHandle;
use crate::display::{DisplayChannel, DisplayUpdate, Transport};
use crate::providers::{LlmRequest, send_with_deadline};
use crate::registry::ProviderRegistry;
use crate::stream::{StreamAggregator, StreamOutcome};
use crate::tools::{ToolContext, ToolRegistry, args_summary};

const ARGS_SUMMARY_CHARS: usize = 80;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Provider calls allowed per turn before giving up.
    pub max_tool_iterations: usize,
    /// Text fragments between two progress updates.
    pub progress_every: usize,
    pub provider_timeout: Duration,
    pub max_output_tokens: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_tool_iterations: 10,
            progress_every: 10,
            provider_timeout: Duration::from_secs(300),
            max_output_tokens: 4096,
        }
    }
}

/// New user input for one turn.
#[derive(Debug, Clone, Default)]
pub struct TurnInput {
    pub text: String,
    /// Image reference: URL, data URL, or local path.
    pub attachment: Option<String>,
}

impl TurnInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachment: None,
        }
    }

    pub fn with_attachment(mut self, attachment: impl Into<String>) -> Self {
        self.attachment = Some(attachment.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Building,
    Streaming,
    ToolExecuting,
    Finalizing,
    Done,
    Failed,
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TurnState::Building => "building",
            TurnState::Streaming => "streaming",
            TurnState::ToolExecuting => "tool_executing",
            TurnState::Finalizing => "finalizing",
            TurnState::Done => "done",
            TurnState::Failed => "failed",
        };
        f.write_str(name)
    }
}

fn transition(state: &mut TurnState, next: TurnState) {
    debug!(from = %state, to = %next, "turn state");
    *state = next;
}

/// Runs one conversation turn: history, provider streaming, the tool loop,
/// persistence, and the display updates that go with them.
pub struct AnswerOrchestrator {
    providers: Arc<ProviderRegistry>,
    tools: Arc<ToolRegistry>,
    context: Arc<ContextWindowManager>,
    store: Arc<dyn ConversationStore>,
    settings: EngineSettings,
}

impl AnswerOrchestrator {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        tools: Arc<ToolRegistry>,
        context: Arc<ContextWindowManager>,
        store: Arc<dyn ConversationStore>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            providers,
            tools,
            context,
            store,
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    /// Run a turn on its own task. Progress reaches the caller only through `transport`.
    pub fn spawn_turn(
        self: &Arc<Self>,
        handle: ConversationHandle,
        input: TurnInput,
        transport: Arc<dyn Transport>,
    ) -> JoinHandle<Result<String>> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.answer(&handle, input, transport).await })
    }

    /// Answer `input` within the conversation. Turns on the same conversation run
    /// one after another.
    #[instrument(skip(self, handle, input, transport), fields(conversation_id = %handle.id()))]
    pub async fn answer(
        &self,
        handle: &ConversationHandle,
        input: TurnInput,
        transport: Arc<dyn Transport>,
    ) -> Result<String> {
        let _turn = handle.begin_turn().await;
        self.clear_stale_in_flight(handle).await;

        let display = DisplayChannel::spawn(handle.clone(), Arc::clone(&self.store), transport);
        let mut state = TurnState::Building;
        let mut usage = TokenUsage::default();
        let mut live = Vec::new();

        let result = self
            .run_turn(handle, input, &display, &mut state, &mut usage, &mut live)
            .await;

        match &result {
            Ok(text) => display.send(DisplayUpdate::Final(text.clone())),
            Err(e) => {
                transition(&mut state, TurnState::Failed);
                warn!("turn failed: {e}");
                display.send(DisplayUpdate::Failed(e.user_message()));
            }
        }
        display.finish().await;
        self.record_usage(handle, usage).await;

        if result.is_ok() {
            let conversation = handle.snapshot();
            if let Err(e) = self.context.prune(&conversation, &mut live, Utc::now()).await {
                warn!("history pruning failed: {e}");
            }
            transition(&mut state, TurnState::Done);
        }
        result
    }

    async fn run_turn(
        &self,
        handle: &ConversationHandle,
        input: TurnInput,
        display: &DisplayChannel,
        state: &mut TurnState,
        usage: &mut TokenUsage,
        live: &mut Vec<HistoryEntry>,
    ) -> Result<String> {
        let conversation = handle.snapshot();
        *live = self.context.load(&conversation).await?;

        let mut user_entry = HistoryEntry::user(input.text);
        if let Some(attachment) = input.attachment {
            user_entry = user_entry.with_attachment(attachment);
        }
        self.persist(&conversation.id, live, user_entry).await?;

        if ContextWindowManager::needs_summary(&conversation, live) {
            if let Err(e) = self.context.summarize(&conversation, live).await {
                warn!("summarization deferred to a later turn: {e}");
            }
        }

        transition(state, TurnState::Streaming);
        let (model, adapter) = self.providers.resolve(&conversation.model)?;
        info!(model = %model.name, family = %model.family, history = live.len(), "answering");

        let tools = self.tools.definitions();
        let tool_context = ToolContext {
            conversation_id: conversation.id.clone(),
            user_id: conversation.user_id.clone(),
        };
        let aggregator = StreamAggregator::new(self.settings.progress_every);

        for iteration in 1..=self.settings.max_tool_iterations {
            let mut request = LlmRequest::new(model.id.clone(), to_chat_messages(live));
            request.system = system_text(&conversation, live);
            request.max_tokens = Some(self.settings.max_output_tokens);
            request.temperature = model.effective_temperature(conversation.temperature);
            request.tools = tools.clone();
            request.user = Some(conversation.user_id.clone());
            request.search = model.search.clone();
            request.stream = conversation.streaming;

            debug!(iteration, messages = request.messages.len(), "calling provider");
            let events = send_with_deadline(
                Arc::clone(&adapter),
                request,
                self.settings.provider_timeout,
            );
            let outcome = aggregator
                .drive(events, |text| display.send(DisplayUpdate::Progress(text.to_string())))
                .await;

            let turn = match outcome {
                StreamOutcome::Completed(turn) => turn,
                StreamOutcome::Failed { error, partial } => {
                    if !partial.is_empty() {
                        display.send(DisplayUpdate::Progress(partial));
                    }
                    return Err(error);
                }
            };
            if let Some(reported) = turn.usage {
                usage.add(reported.input_tokens, reported.output_tokens);
            }

            if turn.tool_calls.is_empty() {
                transition(state, TurnState::Finalizing);
                self.persist(&conversation.id, live, HistoryEntry::assistant(turn.text.clone()))
                    .await?;
                return Ok(turn.text);
            }

            transition(state, TurnState::ToolExecuting);
            let calls = turn.tool_calls;
            self.persist(
                &conversation.id,
                live,
                HistoryEntry::assistant_tool_calls(&turn.text, calls.clone()),
            )
            .await?;

            for call in &calls {
                display.send(DisplayUpdate::ToolStarted {
                    name: call.name.clone(),
                    args_summary: args_summary(&call.arguments, ARGS_SUMMARY_CHARS),
                });
                let output = self.tools.invoke(&tool_context, call).await;
                info!(tool = %call.name, call_id = %call.id, is_error = output.is_error, "tool call finished");
                self.persist(
                    &conversation.id,
                    live,
                    HistoryEntry::tool_result(call.id.clone(), output.content),
                )
                .await?;
            }
            transition(state, TurnState::Streaming);
        }

        Err(Error::IterationLimitExceeded(self.settings.max_tool_iterations))
    }

    async fn persist(
        &self,
        conversation_id: &ConversationId,
        live: &mut Vec<HistoryEntry>,
        mut entry: HistoryEntry,
    ) -> Result<()> {
        entry.id = Some(self.store.append_entry(conversation_id, &entry).await?);
        live.push(entry);
        Ok(())
    }

    async fn clear_stale_in_flight(&self, handle: &ConversationHandle) {
        let stale = handle.update(|c| c.in_flight_message.take());
        if stale.is_none() {
            return;
        }
        debug!("dropping in-flight message left by an earlier turn");
        if let Err(e) = self
            .store
            .update_conversation(handle.id(), &ConversationUpdate::in_flight(None))
            .await
        {
            warn!("failed to clear in-flight message: {e}");
        }
    }

    async fn record_usage(&self, handle: &ConversationHandle, usage: TokenUsage) {
        if usage == TokenUsage::default() {
            return;
        }
        let total = handle.update(|c| {
            c.usage.add(usage.input_tokens, usage.output_tokens);
            c.usage
        });
        if let Err(e) = self
            .store
            .update_conversation(handle.id(), &ConversationUpdate::usage(total))
            .await
        {
            warn!("failed to persist token usage: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_input_carries_attachment() {
        let input = TurnInput::text("what is this?").with_attachment("/tmp/cat.png");
        assert_eq!(input.text, "what is this?");
        assert_eq!(input.attachment.as_deref(), Some("/tmp/cat.png"));
    }

    #[test]
    fn transitions_update_state() {
        let mut state = TurnState::Building;
        transition(&mut state, TurnState::Streaming);
        assert_eq!(state, TurnState::Streaming);
        assert_eq!(TurnState::ToolExecuting.to_string(), "tool_executing");
    }
}

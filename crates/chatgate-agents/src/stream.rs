use chatgate_common::{Error, TokenUsage, ToolCallRequest};
use futures::StreamExt;

use crate::providers::{EventStream, ProviderEvent};

/// Everything one provider call produced, once it finished cleanly.
#[derive(Debug, Default, Clone)]
pub struct AggregatedTurn {
    pub text: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Option<TokenUsage>,
    /// Number of non-empty text fragments received.
    pub fragments: usize,
}

#[derive(Debug)]
pub enum StreamOutcome {
    Completed(AggregatedTurn),
    Failed { error: Error, partial: String },
}

/// Folds a provider event stream into one answer, reporting progress every
/// `progress_every` text fragments with the full text so far.
#[derive(Debug, Clone, Copy)]
pub struct StreamAggregator {
    progress_every: usize,
}

impl StreamAggregator {
    pub fn new(progress_every: usize) -> Self {
        Self {
            progress_every: progress_every.max(1),
        }
    }

    pub async fn drive(&self, mut events: EventStream, mut progress: impl FnMut(&str)) -> StreamOutcome {
        let mut turn = AggregatedTurn::default();

        while let Some(event) = events.next().await {
            match event {
                ProviderEvent::TextDelta(fragment) => {
                    if fragment.is_empty() {
                        continue;
                    }
                    turn.text.push_str(&fragment);
                    turn.fragments += 1;
                    if turn.fragments % self.progress_every == 0 {
                        progress(&turn.text);
                    }
                }
                ProviderEvent::ToolCallRequested(call) => turn.tool_calls.push(call),
                ProviderEvent::Usage(usage) => {
                    let total = turn.usage.get_or_insert_with(TokenUsage::default);
                    total.add(usage.input_tokens, usage.output_tokens);
                }
                ProviderEvent::Done => return StreamOutcome::Completed(turn),
                ProviderEvent::Failed(error) => {
                    return StreamOutcome::Failed {
                        error,
                        partial: turn.text,
                    };
                }
            }
        }

        StreamOutcome::Failed {
            error: Error::Agent("provider stream ended without completing".to_string()),
            partial: turn.text,
        }
    }
}

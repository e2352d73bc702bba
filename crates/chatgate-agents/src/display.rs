use async_trait::async_trait;
use chatgate_common::{ConversationId, ConversationUpdate, MessageRef, Result};
use chatgate_db::ConversationStore;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::conversation::ConversationHandle;

/// Outward callbacks of the engine. Rendering is entirely the transport's business.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Show `text` as the current answer, replacing what was shown before.
    /// Edits `existing` when given, otherwise creates a message. Returns its reference.
    async fn on_progress(
        &self,
        conversation: &ConversationId,
        existing: Option<&str>,
        text: &str,
    ) -> Result<MessageRef>;

    async fn on_tool_started(
        &self,
        conversation: &ConversationId,
        name: &str,
        args_summary: &str,
    ) -> Result<()>;

    async fn on_final(
        &self,
        conversation: &ConversationId,
        existing: Option<&str>,
        text: &str,
    ) -> Result<()>;

    async fn on_error(
        &self,
        conversation: &ConversationId,
        existing: Option<&str>,
        message: &str,
    ) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum DisplayUpdate {
    Progress(String),
    ToolStarted { name: String, args_summary: String },
    Final(String),
    Failed(String),
}

/// Sequential queue of display updates for one turn.
///
/// A single worker applies updates in send order, so the final update always
/// lands after every progress update queued before it.
pub struct DisplayChannel {
    tx: mpsc::UnboundedSender<DisplayUpdate>,
    worker: JoinHandle<()>,
}

impl DisplayChannel {
    pub fn spawn(
        handle: ConversationHandle,
        store: Arc<dyn ConversationStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(
            DisplayWorker {
                handle,
                store,
                transport,
                last_progress: None,
            }
            .run(rx),
        );
        Self { tx, worker }
    }

    pub fn send(&self, update: DisplayUpdate) {
        if self.tx.send(update).is_err() {
            debug!("display worker already stopped, update dropped");
        }
    }

    /// Close the queue and wait until every queued update has been applied.
    pub async fn finish(self) {
        drop(self.tx);
        if let Err(e) = self.worker.await {
            warn!("display worker failed: {e}");
        }
    }
}

struct DisplayWorker {
    handle: ConversationHandle,
    store: Arc<dyn ConversationStore>,
    transport: Arc<dyn Transport>,
    last_progress: Option<String>,
}

impl DisplayWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<DisplayUpdate>) {
        while let Some(update) = rx.recv().await {
            match update {
                DisplayUpdate::Progress(text) => self.progress(text).await,
                DisplayUpdate::ToolStarted { name, args_summary } => {
                    if let Err(e) = self
                        .transport
                        .on_tool_started(self.handle.id(), &name, &args_summary)
                        .await
                    {
                        warn!(conversation_id = %self.handle.id(), "tool status update failed: {e}");
                    }
                }
                DisplayUpdate::Final(text) => {
                    let existing = self.in_flight();
                    if let Err(e) = self
                        .transport
                        .on_final(self.handle.id(), existing.as_deref(), &text)
                        .await
                    {
                        warn!(conversation_id = %self.handle.id(), "final display update failed: {e}");
                    }
                    self.set_in_flight(None).await;
                }
                DisplayUpdate::Failed(message) => {
                    let existing = self.in_flight();
                    if let Err(e) = self
                        .transport
                        .on_error(self.handle.id(), existing.as_deref(), &message)
                        .await
                    {
                        warn!(conversation_id = %self.handle.id(), "error display update failed: {e}");
                    }
                    self.set_in_flight(None).await;
                }
            }
        }
    }

    async fn progress(&mut self, text: String) {
        if text.is_empty() || self.last_progress.as_deref() == Some(text.as_str()) {
            return;
        }

        let existing = self.in_flight();
        match self
            .transport
            .on_progress(self.handle.id(), existing.as_deref(), &text)
            .await
        {
            Ok(reference) => {
                if existing.as_deref() != Some(reference.as_str()) {
                    self.set_in_flight(Some(reference)).await;
                }
                self.last_progress = Some(text);
            }
            Err(e) => warn!(conversation_id = %self.handle.id(), "progress update failed: {e}"),
        }
    }

    fn in_flight(&self) -> Option<MessageRef> {
        self.handle.read(|c| c.in_flight_message.clone())
    }

    async fn set_in_flight(&self, reference: Option<MessageRef>) {
        let changed = self.handle.update(|c| {
            if c.in_flight_message == reference {
                false
            } else {
                c.in_flight_message = reference.clone();
                true
            }
        });
        if !changed {
            return;
        }
        if let Err(e) = self
            .store
            .update_conversation(self.handle.id(), &ConversationUpdate::in_flight(reference))
            .await
        {
            warn!(conversation_id = %self.handle.id(), "failed to persist in-flight message: {e}");
        }
    }
}

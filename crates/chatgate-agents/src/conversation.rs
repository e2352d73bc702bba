use chatgate_common::{
    Conversation, ConversationId, ConversationUpdate, Error, Result, SystemPrompt,
};
use chatgate_db::ConversationStore;
use dashmap::DashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

/// Shared access to one conversation record.
///
/// `read` and `update` take synchronous closures, so the record lock cannot be
/// held across an await point. Turns are serialized separately with `begin_turn`.
#[derive(Clone)]
pub struct ConversationHandle {
    id: ConversationId,
    inner: Arc<Mutex<Conversation>>,
    turn_lock: Arc<AsyncMutex<()>>,
}

impl ConversationHandle {
    pub fn new(conversation: Conversation) -> Self {
        Self {
            id: conversation.id.clone(),
            inner: Arc::new(Mutex::new(conversation)),
            turn_lock: Arc::new(AsyncMutex::new(())),
        }
    }

    pub fn id(&self) -> &ConversationId {
        &self.id
    }

    pub fn read<R>(&self, f: impl FnOnce(&Conversation) -> R) -> R {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut Conversation) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn snapshot(&self) -> Conversation {
        self.read(Conversation::clone)
    }

    /// Wait until no other turn runs on this conversation.
    pub async fn begin_turn(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.turn_lock).lock_owned().await
    }

    fn is_busy(&self) -> bool {
        self.turn_lock.try_lock().is_err()
    }
}

/// Settings applied to newly created conversations.
#[derive(Debug, Clone)]
pub struct ConversationTemplate {
    pub model: String,
    pub temperature: f64,
    pub retention_days: u32,
    pub context_limit: usize,
    pub streaming: bool,
    pub system_prompt: Option<SystemPrompt>,
}

impl Default for ConversationTemplate {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            retention_days: 30,
            context_limit: 100,
            streaming: true,
            system_prompt: None,
        }
    }
}

impl ConversationTemplate {
    pub fn instantiate(&self, id: ConversationId, user_id: &str) -> Conversation {
        let mut conversation = Conversation::new(id, user_id, self.model.clone());
        conversation.temperature = self.temperature;
        conversation.retention_days = self.retention_days;
        conversation.context_limit = self.context_limit;
        conversation.streaming = self.streaming;
        conversation.system_prompt = self.system_prompt.clone();
        conversation
    }
}

struct RegistryEntry {
    handle: ConversationHandle,
    last_used: Instant,
}

/// Process-wide cache of conversation handles, backed by the store.
///
/// Handles are loaded lazily and live until evicted; idle eviction skips
/// conversations with a turn in progress.
pub struct ConversationRegistry {
    store: Arc<dyn ConversationStore>,
    template: ConversationTemplate,
    entries: DashMap<ConversationId, RegistryEntry>,
}

impl ConversationRegistry {
    pub fn new(store: Arc<dyn ConversationStore>, template: ConversationTemplate) -> Self {
        Self {
            store,
            template,
            entries: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn cached(&self, id: &ConversationId) -> Option<ConversationHandle> {
        self.entries.get_mut(id).map(|mut entry| {
            entry.last_used = Instant::now();
            entry.handle.clone()
        })
    }

    fn insert(&self, conversation: Conversation) -> ConversationHandle {
        let id = conversation.id.clone();
        let mut entry = self.entries.entry(id).or_insert_with(|| RegistryEntry {
            handle: ConversationHandle::new(conversation),
            last_used: Instant::now(),
        });
        entry.last_used = Instant::now();
        entry.handle.clone()
    }

    /// Cached handle, or the stored conversation if there is one.
    pub async fn get(&self, id: &ConversationId) -> Result<Option<ConversationHandle>> {
        if let Some(handle) = self.cached(id) {
            return Ok(Some(handle));
        }
        let loaded = self.store.load_conversation(id).await?;
        Ok(loaded.map(|conversation| {
            debug!(conversation_id = %id, "loaded conversation from store");
            self.insert(conversation)
        }))
    }

    pub async fn get_or_create(&self, id: &ConversationId, user_id: &str) -> Result<ConversationHandle> {
        match self.get(id).await? {
            Some(handle) => Ok(handle),
            None => self.create(id.clone(), user_id).await,
        }
    }

    /// Create a conversation from the configured defaults and persist it.
    pub async fn create(&self, id: ConversationId, user_id: &str) -> Result<ConversationHandle> {
        let conversation = self.template.instantiate(id, user_id);
        self.store.create_conversation(&conversation).await?;
        info!(conversation_id = %conversation.id, model = %conversation.model, "created conversation");
        Ok(self.insert(conversation))
    }

    /// Apply a settings change under the conversation lock, then persist it.
    pub async fn update_settings(
        &self,
        id: &ConversationId,
        update: ConversationUpdate,
    ) -> Result<Conversation> {
        let handle = self
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conversation {id}")))?;
        if update.is_empty() {
            return Ok(handle.snapshot());
        }
        let updated = handle.update(|conversation| {
            conversation.apply(&update);
            conversation.clone()
        });
        self.store.update_conversation(id, &update).await?;
        Ok(updated)
    }

    /// Explicit thread deletion: store rows and cache entry.
    pub async fn delete(&self, id: &ConversationId) -> Result<()> {
        self.store.delete_conversation(id).await?;
        self.entries.remove(id);
        info!(conversation_id = %id, "deleted conversation");
        Ok(())
    }

    pub fn evict(&self, id: &ConversationId) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Drop handles unused for at least `max_idle`. Returns how many were evicted.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.last_used.elapsed() < max_idle || entry.handle.is_busy());
        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            debug!(evicted, "evicted idle conversations");
        }
        evicted
    }
}

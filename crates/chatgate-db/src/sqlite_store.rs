use async_trait::async_trait;
use chatgate_common::{
    Conversation, ConversationId, ConversationUpdate, EntryKind, EntryRole, Error, HistoryEntry,
    Result, SystemPrompt, TokenUsage, ToolCallRequest,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::store::ConversationStore;

/// SQLite-backed conversation and history storage.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening conversation store at {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        self.lock()?
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS conversations (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    model TEXT NOT NULL,
                    temperature REAL NOT NULL,
                    system_prompt TEXT,
                    retention_days INTEGER NOT NULL,
                    context_limit INTEGER NOT NULL,
                    streaming INTEGER NOT NULL DEFAULT 1,
                    input_tokens INTEGER NOT NULL DEFAULT 0,
                    output_tokens INTEGER NOT NULL DEFAULT 0,
                    in_flight_message TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS history_entries (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                    role TEXT NOT NULL,
                    content TEXT,
                    tool_call_id TEXT,
                    tool_calls TEXT NOT NULL DEFAULT '[]',
                    attachment TEXT,
                    live INTEGER NOT NULL DEFAULT 1,
                    kind TEXT NOT NULL DEFAULT 'normal',
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_history_live
                    ON history_entries(conversation_id, live, created_at, id);",
            )
            .map_err(|e| Error::Database(format!("migration failed: {e}")))?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("connection lock poisoned".to_string()))
    }

    /// Run a raw closure against the connection. Intended for tests and maintenance.
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&conn).map_err(|e| Error::Database(e.to_string()))
    }

    /// Number of entries stored for a conversation, live or not.
    pub fn count_entries(&self, id: &ConversationId) -> Result<usize> {
        let count: i64 = self
            .lock()?
            .query_row(
                "SELECT COUNT(*) FROM history_entries WHERE conversation_id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(format!("failed to count entries: {e}")))?;
        Ok(count as usize)
    }

    fn read_conversation(conn: &Connection, id: &ConversationId) -> Result<Option<Conversation>> {
        let row = conn
            .query_row(
                "SELECT user_id, model, temperature, system_prompt, retention_days, context_limit,
                        streaming, input_tokens, output_tokens, in_flight_message, created_at
                 FROM conversations WHERE id = ?1",
                params![id.as_str()],
                |row| {
                    Ok(ConversationRow {
                        user_id: row.get(0)?,
                        model: row.get(1)?,
                        temperature: row.get(2)?,
                        system_prompt: row.get(3)?,
                        retention_days: row.get(4)?,
                        context_limit: row.get(5)?,
                        streaming: row.get(6)?,
                        input_tokens: row.get(7)?,
                        output_tokens: row.get(8)?,
                        in_flight_message: row.get(9)?,
                        created_at: row.get(10)?,
                    })
                },
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to load conversation: {e}")))?;

        row.map(|row| row.into_conversation(id.clone())).transpose()
    }

    fn write_conversation(conn: &Connection, conversation: &Conversation) -> Result<()> {
        let system_prompt = conversation
            .system_prompt
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        conn.execute(
            "INSERT INTO conversations (id, user_id, model, temperature, system_prompt,
                retention_days, context_limit, streaming, input_tokens, output_tokens,
                in_flight_message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
               model = excluded.model,
               temperature = excluded.temperature,
               system_prompt = excluded.system_prompt,
               retention_days = excluded.retention_days,
               context_limit = excluded.context_limit,
               streaming = excluded.streaming,
               input_tokens = excluded.input_tokens,
               output_tokens = excluded.output_tokens,
               in_flight_message = excluded.in_flight_message,
               updated_at = datetime('now')",
            params![
                conversation.id.as_str(),
                conversation.user_id,
                conversation.model,
                conversation.temperature,
                system_prompt,
                conversation.retention_days,
                conversation.context_limit as i64,
                conversation.streaming,
                conversation.usage.input_tokens as i64,
                conversation.usage.output_tokens as i64,
                conversation.in_flight_message,
                format_timestamp(conversation.created_at),
            ],
        )
        .map_err(|e| Error::Database(format!("failed to save conversation: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn load_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>> {
        let conn = self.lock()?;
        Self::read_conversation(&conn, id)
    }

    async fn create_conversation(&self, conversation: &Conversation) -> Result<()> {
        let conn = self.lock()?;
        Self::write_conversation(&conn, conversation)
    }

    async fn update_conversation(
        &self,
        id: &ConversationId,
        update: &ConversationUpdate,
    ) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        let conn = self.lock()?;
        let mut conversation = Self::read_conversation(&conn, id)?
            .ok_or_else(|| Error::NotFound(format!("conversation {id}")))?;
        conversation.apply(update);
        Self::write_conversation(&conn, &conversation)
    }

    async fn delete_conversation(&self, id: &ConversationId) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM history_entries WHERE conversation_id = ?1",
            params![id.as_str()],
        )
        .map_err(|e| Error::Database(format!("failed to delete history: {e}")))?;
        conn.execute("DELETE FROM conversations WHERE id = ?1", params![id.as_str()])
            .map_err(|e| Error::Database(format!("failed to delete conversation: {e}")))?;
        info!(conversation_id = %id, "deleted conversation");
        Ok(())
    }

    async fn load_live_history(&self, id: &ConversationId) -> Result<Vec<HistoryEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, role, content, tool_call_id, tool_calls, attachment, live, kind, created_at
                 FROM history_entries
                 WHERE conversation_id = ?1 AND live = 1
                 ORDER BY created_at ASC, id ASC",
            )
            .map_err(|e| Error::Database(format!("failed to prepare history query: {e}")))?;

        let rows = stmt
            .query_map(params![id.as_str()], |row| {
                Ok(EntryRow {
                    id: row.get(0)?,
                    role: row.get(1)?,
                    content: row.get(2)?,
                    tool_call_id: row.get(3)?,
                    tool_calls: row.get(4)?,
                    attachment: row.get(5)?,
                    live: row.get(6)?,
                    kind: row.get(7)?,
                    created_at: row.get(8)?,
                })
            })
            .map_err(|e| Error::Database(format!("failed to load history: {e}")))?;

        let mut entries = Vec::new();
        for row in rows {
            let row =
                row.map_err(|e| Error::Database(format!("failed to read history row: {e}")))?;
            entries.push(row.into_entry()?);
        }
        Ok(entries)
    }

    async fn append_entry(&self, id: &ConversationId, entry: &HistoryEntry) -> Result<i64> {
        let tool_calls = serde_json::to_string(&entry.tool_calls)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO history_entries (conversation_id, role, content, tool_call_id,
                tool_calls, attachment, live, kind, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id.as_str(),
                entry.role.as_str(),
                entry.content,
                entry.tool_call_id,
                tool_calls,
                entry.attachment,
                entry.live,
                entry.kind.as_str(),
                format_timestamp(entry.created_at),
            ],
        )
        .map_err(|e| Error::Database(format!("failed to append entry: {e}")))?;
        let entry_id = conn.last_insert_rowid();
        debug!(conversation_id = %id, entry_id, role = entry.role.as_str(), "appended history entry");
        Ok(entry_id)
    }

    async fn mark_not_live(&self, entry_ids: &[i64]) -> Result<()> {
        if entry_ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE history_entries SET live = 0 WHERE id IN ({})",
            placeholders(entry_ids.len())
        );
        self.lock()?
            .execute(&sql, params_from_iter(entry_ids.iter()))
            .map_err(|e| Error::Database(format!("failed to retire entries: {e}")))?;
        Ok(())
    }

    async fn delete_entries(&self, entry_ids: &[i64]) -> Result<usize> {
        if entry_ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM history_entries WHERE id IN ({})",
            placeholders(entry_ids.len())
        );
        let deleted = self
            .lock()?
            .execute(&sql, params_from_iter(entry_ids.iter()))
            .map_err(|e| Error::Database(format!("failed to delete entries: {e}")))?;
        Ok(deleted)
    }

    async fn prune_expired(&self, id: &ConversationId, cutoff: DateTime<Utc>) -> Result<usize> {
        let deleted = self
            .lock()?
            .execute(
                "DELETE FROM history_entries
                 WHERE conversation_id = ?1 AND (live = 0 OR created_at < ?2)",
                params![id.as_str(), format_timestamp(cutoff)],
            )
            .map_err(|e| Error::Database(format!("failed to prune entries: {e}")))?;
        Ok(deleted)
    }
}

struct ConversationRow {
    user_id: String,
    model: String,
    temperature: f64,
    system_prompt: Option<String>,
    retention_days: u32,
    context_limit: i64,
    streaming: bool,
    input_tokens: i64,
    output_tokens: i64,
    in_flight_message: Option<String>,
    created_at: String,
}

impl ConversationRow {
    fn into_conversation(self, id: ConversationId) -> Result<Conversation> {
        let system_prompt = self
            .system_prompt
            .as_deref()
            .map(serde_json::from_str::<SystemPrompt>)
            .transpose()?;

        Ok(Conversation {
            id,
            user_id: self.user_id,
            model: self.model,
            temperature: self.temperature,
            system_prompt,
            retention_days: self.retention_days,
            context_limit: self.context_limit.max(0) as usize,
            streaming: self.streaming,
            usage: TokenUsage {
                input_tokens: self.input_tokens.max(0) as u64,
                output_tokens: self.output_tokens.max(0) as u64,
            },
            in_flight_message: self.in_flight_message,
            created_at: parse_timestamp(&self.created_at),
        })
    }
}

struct EntryRow {
    id: i64,
    role: String,
    content: Option<String>,
    tool_call_id: Option<String>,
    tool_calls: String,
    attachment: Option<String>,
    live: bool,
    kind: String,
    created_at: String,
}

impl EntryRow {
    fn into_entry(self) -> Result<HistoryEntry> {
        let role = EntryRole::parse(&self.role)
            .ok_or_else(|| Error::Database(format!("unknown entry role '{}'", self.role)))?;
        let kind = EntryKind::parse(&self.kind)
            .ok_or_else(|| Error::Database(format!("unknown entry kind '{}'", self.kind)))?;
        let tool_calls: Vec<ToolCallRequest> = serde_json::from_str(&self.tool_calls)?;

        Ok(HistoryEntry {
            id: Some(self.id),
            role,
            content: self.content,
            tool_call_id: self.tool_call_id,
            tool_calls,
            attachment: self.attachment,
            live: self.live,
            kind,
            created_at: parse_timestamp(&self.created_at),
        })
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// Fixed-width UTC timestamps so lexical order in SQL matches time order.
fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            warn!(
                "failed to parse timestamp '{}': {e}, falling back to now",
                value
            );
            Utc::now()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn conversation(id: &str) -> Conversation {
        Conversation::new(ConversationId::from(id), "user-1", "gpt-4o")
    }

    async fn store_with_conversation(id: &str) -> SqliteStore {
        let store = SqliteStore::in_memory().expect("in-memory store should open");
        store
            .create_conversation(&conversation(id))
            .await
            .expect("conversation create should succeed");
        store
    }

    #[tokio::test]
    async fn create_and_load_conversation_round_trip() {
        let store = SqliteStore::in_memory().expect("in-memory store should open");
        let mut original = conversation("c1");
        original.system_prompt = Some(SystemPrompt::Role {
            name: "chef".to_string(),
            prompt: "You are a chef.".to_string(),
        });
        original.streaming = false;
        store.create_conversation(&original).await.unwrap();

        let loaded = store
            .load_conversation(&original.id)
            .await
            .unwrap()
            .expect("conversation should exist");
        assert_eq!(loaded.model, "gpt-4o");
        assert_eq!(loaded.system_prompt, original.system_prompt);
        assert!(!loaded.streaming);
        assert_eq!(loaded.created_at, original.created_at);
    }

    #[tokio::test]
    async fn load_missing_conversation_is_none() {
        let store = SqliteStore::in_memory().unwrap();
        let loaded = store
            .load_conversation(&ConversationId::from("missing"))
            .await
            .unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn update_conversation_applies_partial_fields() {
        let store = store_with_conversation("c1").await;
        let id = ConversationId::from("c1");

        store
            .update_conversation(
                &id,
                &ConversationUpdate {
                    usage: Some(TokenUsage {
                        input_tokens: 12,
                        output_tokens: 30,
                    }),
                    in_flight_message: Some(Some("msg-1".to_string())),
                    ..ConversationUpdate::default()
                },
            )
            .await
            .unwrap();

        let loaded = store.load_conversation(&id).await.unwrap().unwrap();
        assert_eq!(loaded.usage.output_tokens, 30);
        assert_eq!(loaded.in_flight_message.as_deref(), Some("msg-1"));
        assert_eq!(loaded.model, "gpt-4o");
    }

    #[tokio::test]
    async fn update_unknown_conversation_is_not_found() {
        let store = SqliteStore::in_memory().unwrap();
        let err = store
            .update_conversation(
                &ConversationId::from("ghost"),
                &ConversationUpdate::in_flight(None),
            )
            .await
            .expect_err("missing conversation should fail");
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn live_history_orders_by_time_then_insertion() {
        let store = store_with_conversation("c1").await;
        let id = ConversationId::from("c1");
        let at = Utc::now();

        let mut user = HistoryEntry::user("first");
        user.created_at = at;
        let mut call = HistoryEntry::assistant_tool_calls(
            "",
            vec![ToolCallRequest {
                id: "call-1".to_string(),
                name: "lookup".to_string(),
                arguments: "{\"q\":1}".to_string(),
            }],
        );
        call.created_at = at;
        let mut result = HistoryEntry::tool_result("call-1", "42");
        result.created_at = at;

        store.append_entry(&id, &user).await.unwrap();
        store.append_entry(&id, &call).await.unwrap();
        store.append_entry(&id, &result).await.unwrap();

        let history = store.load_live_history(&id).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].text(), "first");
        assert_eq!(history[1].tool_calls[0].arguments, "{\"q\":1}");
        assert_eq!(history[2].tool_call_id.as_deref(), Some("call-1"));
        assert!(history.iter().all(HistoryEntry::is_persisted));
    }

    #[tokio::test]
    async fn retired_entries_are_excluded_then_deleted() {
        let store = store_with_conversation("c1").await;
        let id = ConversationId::from("c1");

        let a = store.append_entry(&id, &HistoryEntry::user("a")).await.unwrap();
        let b = store
            .append_entry(&id, &HistoryEntry::assistant("b"))
            .await
            .unwrap();
        store.append_entry(&id, &HistoryEntry::user("c")).await.unwrap();

        store.mark_not_live(&[a, b]).await.unwrap();
        let live = store.load_live_history(&id).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].text(), "c");
        assert_eq!(store.count_entries(&id).unwrap(), 3);

        let deleted = store.delete_entries(&[a, b]).await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.count_entries(&id).unwrap(), 1);
    }

    #[tokio::test]
    async fn prune_expired_removes_old_and_retired_rows() {
        let store = store_with_conversation("c1").await;
        let id = ConversationId::from("c1");

        let mut old = HistoryEntry::user("old");
        old.created_at = Utc::now() - Duration::days(40);
        store.append_entry(&id, &old).await.unwrap();
        let retired = store
            .append_entry(&id, &HistoryEntry::assistant("retired"))
            .await
            .unwrap();
        store.mark_not_live(&[retired]).await.unwrap();
        store
            .append_entry(&id, &HistoryEntry::user("fresh"))
            .await
            .unwrap();

        let deleted = store
            .prune_expired(&id, Utc::now() - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(deleted, 2);

        let live = store.load_live_history(&id).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].text(), "fresh");
    }

    #[tokio::test]
    async fn delete_conversation_removes_entries() {
        let store = store_with_conversation("c1").await;
        let id = ConversationId::from("c1");
        store.append_entry(&id, &HistoryEntry::user("hi")).await.unwrap();

        store.delete_conversation(&id).await.unwrap();
        assert!(store.load_conversation(&id).await.unwrap().is_none());
        assert_eq!(store.count_entries(&id).unwrap(), 0);
    }

    #[tokio::test]
    async fn open_creates_database_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("chatgate.db");
        let store = SqliteStore::open(&path).expect("file store should open");
        store.create_conversation(&conversation("c1")).await.unwrap();
        assert!(path.exists());
    }
}

//! Durable per-session state
//!
//! Each conversation identity (actor id) owns one session row, an append-only
//! message log and at most one project context row. Access always goes
//! through a [`SessionStore`] handed out by the [`SessionRegistry`]; the
//! registry keeps one store per actor so that every caller for the same
//! session shares one turn lock.

pub mod context;
mod types;

use sqlx::sqlite::{Sqlite, SqlitePool};
use sqlx::{QueryBuilder, Transaction};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::{AssistantError, Result};
use crate::ids;

pub use context::{merge, ContextUpdate, ProjectContext, ResolvedIssue};
pub use types::{
    HistoryFilter, InvocationState, Message, MessageMetadata, Role, SessionInfo, SessionState,
    SessionStatus, ToolInvocation,
};

/// Upper bound on message content size (characters)
pub const MAX_CONTENT_CHARS: usize = 100_000;

/// Largest page a history read may return
pub const MAX_HISTORY_LIMIT: i64 = 500;

type MessageRow = (String, String, String, i64, Option<String>);
type SessionRow = (String, String, i64, i64, i64);

/// A message to be stored; id and timestamp are assigned on insert
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    pub metadata: Option<MessageMetadata>,
}

impl NewMessage {
    pub fn new(role: Role, content: impl Into<String>, metadata: Option<MessageMetadata>) -> Self {
        Self {
            role,
            content: content.into(),
            metadata,
        }
    }
}

/// Store bound to a single session actor
pub struct SessionStore {
    pool: SqlitePool,
    actor_id: String,
    /// Serialises turns and standalone mutations for this actor
    turn_lock: Mutex<()>,
}

impl SessionStore {
    pub fn new(pool: SqlitePool, actor_id: impl Into<String>) -> Self {
        Self {
            pool,
            actor_id: actor_id.into(),
            turn_lock: Mutex::new(()),
        }
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    /// Exclusive access for a turn or a mutating request
    pub async fn exclusive(&self) -> MutexGuard<'_, ()> {
        self.turn_lock.lock().await
    }

    /// Append a message and bump the session counters in one transaction
    pub async fn add_message(
        &self,
        role: Role,
        content: &str,
        metadata: Option<MessageMetadata>,
    ) -> Result<Message> {
        let mut stored = self
            .append_messages(vec![NewMessage::new(role, content, metadata)])
            .await?;
        stored
            .pop()
            .ok_or_else(|| AssistantError::validation("no message stored"))
    }

    /// Append several messages atomically, in order. Either all of them
    /// become visible or none do.
    pub async fn append_messages(&self, entries: Vec<NewMessage>) -> Result<Vec<Message>> {
        for entry in &entries {
            validate_content(entry.role, &entry.content, entry.metadata.as_ref())?;
        }

        let now = ids::now_millis();
        let mut tx = self.pool.begin().await?;
        self.ensure_session(&mut tx, now).await?;

        let mut stored = Vec::with_capacity(entries.len());
        for entry in entries {
            let message = Message {
                id: ids::message_id(),
                role: entry.role,
                content: entry.content,
                timestamp: ids::now_millis(),
                metadata: entry.metadata.filter(|m| !m.is_empty()),
            };
            let metadata_json = message
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            sqlx::query(
                r#"
                INSERT INTO messages (id, actor_id, role, content, timestamp, metadata)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&message.id)
            .bind(&self.actor_id)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(message.timestamp)
            .bind(&metadata_json)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                UPDATE sessions
                SET message_count = message_count + 1,
                    status = CASE WHEN status = 'created' THEN 'active' ELSE status END,
                    last_activity_at = CASE WHEN status = 'inactive' THEN last_activity_at ELSE ? END
                WHERE actor_id = ?
                "#,
            )
            .bind(message.timestamp)
            .bind(&self.actor_id)
            .execute(&mut *tx)
            .await?;

            stored.push(message);
        }

        tx.commit().await?;

        for message in &stored {
            debug!(session = %self.actor_id, message_id = %message.id, role = %message.role, "Stored message");
        }
        Ok(stored)
    }

    /// Read messages matching `filter`, oldest first
    pub async fn get_history(&self, filter: &HistoryFilter) -> Result<Vec<Message>> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, role, content, timestamp, metadata FROM messages WHERE actor_id = ",
        );
        query.push_bind(&self.actor_id);

        if let Some(role) = filter.role {
            query.push(" AND role = ").push_bind(role.as_str());
        }
        if let Some(after) = filter.after {
            query.push(" AND timestamp > ").push_bind(after);
        }
        if let Some(before) = filter.before {
            query.push(" AND timestamp < ").push_bind(before);
        }

        // Newest first so LIMIT keeps the most recent page
        query.push(" ORDER BY timestamp DESC, rowid DESC");
        if let Some(limit) = filter.limit {
            query
                .push(" LIMIT ")
                .push_bind(limit.clamp(1, MAX_HISTORY_LIMIT));
        }

        let rows: Vec<MessageRow> = query.build_query_as().fetch_all(&self.pool).await?;

        let mut messages = rows
            .into_iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?;
        messages.reverse();
        // Stable: equal timestamps keep insertion order
        messages.sort_by_key(|m| m.timestamp);

        self.touch().await?;
        Ok(messages)
    }

    /// Delete one message by id. Returns whether a row was removed.
    pub async fn delete_message(&self, message_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let now = ids::now_millis();
        self.ensure_session(&mut tx, now).await?;

        let deleted = sqlx::query("DELETE FROM messages WHERE id = ? AND actor_id = ?")
            .bind(message_id)
            .bind(&self.actor_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if deleted > 0 {
            sqlx::query(
                r#"
                UPDATE sessions
                SET message_count = MAX(message_count - 1, 0),
                    last_activity_at = CASE WHEN status = 'inactive' THEN last_activity_at ELSE ? END
                WHERE actor_id = ?
                "#,
            )
            .bind(now)
            .bind(&self.actor_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(deleted > 0)
    }

    /// Current project context, empty if none has been recorded
    pub async fn get_context(&self) -> Result<ProjectContext> {
        let context = self.load_context(&self.pool).await?;
        self.touch().await?;
        Ok(context)
    }

    /// Merge a partial update into the stored context and return the result
    pub async fn update_context(&self, partial: &ContextUpdate) -> Result<ProjectContext> {
        partial.validate()?;

        let now = ids::now_millis();
        let mut tx = self.pool.begin().await?;
        self.ensure_session(&mut tx, now).await?;

        let existing = self.load_context(&mut *tx).await?;
        let merged = merge(&existing, partial, now);

        sqlx::query(
            r#"
            INSERT INTO project_context (actor_id, data, last_updated)
            VALUES (?, ?, ?)
            ON CONFLICT(actor_id) DO UPDATE SET
                data = excluded.data,
                last_updated = excluded.last_updated
            "#,
        )
        .bind(&self.actor_id)
        .bind(serde_json::to_string(&merged)?)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        Self::touch_in(&mut tx, &self.actor_id, now).await?;
        tx.commit().await?;

        debug!(session = %self.actor_id, "Merged project context");
        Ok(merged)
    }

    /// Session metadata, created on demand
    pub async fn get_session(&self) -> Result<SessionInfo> {
        let now = ids::now_millis();
        let mut tx = self.pool.begin().await?;
        self.ensure_session(&mut tx, now).await?;
        Self::touch_in(&mut tx, &self.actor_id, now).await?;
        let info = self.load_session(&mut tx).await?;
        tx.commit().await?;
        Ok(info)
    }

    /// Delete every message, the context row and the session row, then
    /// start a fresh session. Callers never observe the intermediate state.
    pub async fn clear_session(&self) -> Result<SessionInfo> {
        let now = ids::now_millis();
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query("DELETE FROM messages WHERE actor_id = ?")
            .bind(&self.actor_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM project_context WHERE actor_id = ?")
            .bind(&self.actor_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sessions WHERE actor_id = ?")
            .bind(&self.actor_id)
            .execute(&mut *tx)
            .await?;

        self.ensure_session(&mut tx, now).await?;
        let info = self.load_session(&mut tx).await?;
        tx.commit().await?;

        info!(
            session = %self.actor_id,
            new_session_id = %info.session_id,
            removed_messages = removed,
            "Cleared session"
        );
        Ok(info)
    }

    /// Mark the session inactive without deleting data
    pub async fn deactivate(&self) -> Result<SessionInfo> {
        let now = ids::now_millis();
        let mut tx = self.pool.begin().await?;
        self.ensure_session(&mut tx, now).await?;

        sqlx::query("UPDATE sessions SET status = 'inactive' WHERE actor_id = ?")
            .bind(&self.actor_id)
            .execute(&mut *tx)
            .await?;

        let info = self.load_session(&mut tx).await?;
        tx.commit().await?;

        info!(session = %self.actor_id, "Deactivated session");
        Ok(info)
    }

    /// Session, full history and context in one snapshot
    pub async fn state(&self) -> Result<SessionState> {
        let session = self.get_session().await?;
        let messages = self.get_history(&HistoryFilter::default()).await?;
        let project_context = self.get_context().await?;
        Ok(SessionState {
            session,
            messages,
            project_context,
        })
    }

    async fn ensure_session(&self, tx: &mut Transaction<'_, Sqlite>, now: i64) -> Result<()> {
        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO sessions (actor_id, session_id, status, message_count, created_at, last_activity_at)
            VALUES (?, ?, 'created', 0, ?, ?)
            "#,
        )
        .bind(&self.actor_id)
        .bind(ids::session_id())
        .bind(now)
        .bind(now)
        .execute(&mut **tx)
        .await?
        .rows_affected();

        if inserted > 0 {
            debug!(session = %self.actor_id, "Created session record");
        }
        Ok(())
    }

    async fn load_session(&self, tx: &mut Transaction<'_, Sqlite>) -> Result<SessionInfo> {
        let row: SessionRow = sqlx::query_as(
            r#"
            SELECT session_id, status, message_count, created_at, last_activity_at
            FROM sessions WHERE actor_id = ?
            "#,
        )
        .bind(&self.actor_id)
        .fetch_one(&mut **tx)
        .await?;

        let (session_id, status, message_count, created_at, last_activity_at) = row;
        let status = SessionStatus::parse(&status);
        Ok(SessionInfo {
            session_id,
            created_at,
            last_activity_at,
            message_count,
            is_active: status != SessionStatus::Inactive,
            status,
        })
    }

    async fn load_context<'e, E>(&self, executor: E) -> Result<ProjectContext>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT data FROM project_context WHERE actor_id = ?")
                .bind(&self.actor_id)
                .fetch_optional(executor)
                .await?;

        match row {
            Some((json,)) => Ok(serde_json::from_str(&json)?),
            None => Ok(ProjectContext::default()),
        }
    }

    /// Reads count as activity
    async fn touch(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let now = ids::now_millis();
        self.ensure_session(&mut tx, now).await?;
        Self::touch_in(&mut tx, &self.actor_id, now).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn touch_in(tx: &mut Transaction<'_, Sqlite>, actor_id: &str, now: i64) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET last_activity_at = ? WHERE actor_id = ? AND status != 'inactive'",
        )
        .bind(now)
        .bind(actor_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

fn validate_content(role: Role, content: &str, metadata: Option<&MessageMetadata>) -> Result<()> {
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(AssistantError::validation(format!(
            "message content exceeds {} characters",
            MAX_CONTENT_CHARS
        )));
    }
    // Assistant turns that only carried tool calls may have no text
    let has_tool_records = metadata.is_some_and(|m| !m.tool_invocations.is_empty());
    if content.trim().is_empty() && !(role == Role::Assistant && has_tool_records) {
        return Err(AssistantError::validation("message content must not be empty"));
    }
    Ok(())
}

fn message_from_row(row: MessageRow) -> Result<Message> {
    let (id, role, content, timestamp, metadata) = row;
    let role = role.parse()?;
    let metadata = match metadata {
        Some(json) => match serde_json::from_str(&json) {
            Ok(m) => Some(m),
            Err(e) => {
                warn!(message_id = %id, "Dropping unreadable message metadata: {}", e);
                None
            }
        },
        None => None,
    };
    Ok(Message {
        id,
        role,
        content,
        timestamp,
        metadata,
    })
}

/// Arena of session stores keyed by actor id.
///
/// Holds weak handles only: a store lives as long as some request or turn
/// uses it, and dead entries are dropped whenever a new actor is inserted.
pub struct SessionRegistry {
    pool: SqlitePool,
    sessions: RwLock<HashMap<String, Weak<SessionStore>>>,
}

impl SessionRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Get the store for `actor_id`, creating the handle on first use
    pub fn get(&self, actor_id: &str) -> Result<Arc<SessionStore>> {
        validate_actor_id(actor_id)?;

        if let Some(store) = self
            .sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(actor_id)
            .and_then(Weak::upgrade)
        {
            return Ok(store);
        }

        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Another caller may have created it between the two locks
        if let Some(store) = sessions.get(actor_id).and_then(Weak::upgrade) {
            return Ok(store);
        }

        let before = sessions.len();
        sessions.retain(|_, handle| handle.strong_count() > 0);
        let removed = before - sessions.len();
        if removed > 0 {
            debug!(removed, "Dropped idle session handles");
        }

        let store = Arc::new(SessionStore::new(self.pool.clone(), actor_id));
        sessions.insert(actor_id.to_string(), Arc::downgrade(&store));
        Ok(store)
    }

    /// Number of handles currently tracked, live or not yet pruned
    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn validate_actor_id(actor_id: &str) -> Result<()> {
    let valid = !actor_id.is_empty()
        && actor_id.len() <= 128
        && actor_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    if valid {
        Ok(())
    } else {
        Err(AssistantError::validation(format!("invalid session id '{}'", actor_id)))
    }
}

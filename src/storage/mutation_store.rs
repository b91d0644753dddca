use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::calendar::{Event, LocalId, RemoteId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[from] rusqlite::Error),
    #[error("Storage worker failed: {0}")]
    WorkerFailed(String),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Pending mutation {local_key} is unreadable: {source}")]
    UnreadableEntry {
        local_key: LocalKey,
        source: serde_json::Error,
    },
    #[error("Failed to prepare storage directory: {0}")]
    Io(#[from] std::io::Error),
}

pub type LocalKey = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Upsert,
    Delete,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Upsert => "upsert",
            MutationKind::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Mutation {
    Upsert(Event),
    Delete { id: RemoteId },
}

impl Mutation {
    pub fn kind(&self) -> MutationKind {
        match self {
            Mutation::Upsert(_) => MutationKind::Upsert,
            Mutation::Delete { .. } => MutationKind::Delete,
        }
    }

    pub fn event_key(&self) -> EventKey {
        match self {
            Mutation::Upsert(event) => EventKey::for_event(event),
            Mutation::Delete { id } => EventKey::Remote(*id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKey {
    Remote(RemoteId),
    Draft(LocalId),
}

impl EventKey {
    pub fn for_event(event: &Event) -> Self {
        match event.id {
            Some(id) => EventKey::Remote(id),
            None => EventKey::Draft(event.local_id),
        }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKey::Remote(id) => write!(f, "remote:{}", id),
            EventKey::Draft(local_id) => write!(f, "draft:{}", local_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
    pub local_key: LocalKey,
    pub event_key: String,
    pub mutation: Mutation,
    pub queued_at: DateTime<Utc>,
}

impl PendingMutation {
    pub fn kind(&self) -> MutationKind {
        self.mutation.kind()
    }
}

#[derive(Clone)]
pub struct MutationStore {
    conn: Arc<Mutex<Connection>>,
}

impl MutationStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self::new(Connection::open(path)?);
        store.initialize()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self::new(Connection::open_in_memory()?);
        store.initialize()?;
        Ok(store)
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::WorkerFailed("connection lock poisoned".to_string()))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS pending_mutations (
                local_key INTEGER PRIMARY KEY AUTOINCREMENT,
                event_key TEXT NOT NULL UNIQUE,
                position INTEGER NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                queued_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    /// Upserts by event key. A superseded entry's replay position is kept so
    /// per-event ordering relative to other entries is unchanged.
    pub async fn put(&self, mutation: Mutation) -> Result<LocalKey, StoreError> {
        let event_key = mutation.event_key().to_string();
        let kind = mutation.kind();
        let payload = serde_json::to_string(&mutation)?;

        let local_key = self
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let existing: Option<(i64, String)> = tx
                    .query_row(
                        "SELECT position, queued_at FROM pending_mutations WHERE event_key = ?1",
                        [&event_key],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;

                let (position, queued_at) = match existing {
                    Some(found) => {
                        tx.execute(
                            "DELETE FROM pending_mutations WHERE event_key = ?1",
                            [&event_key],
                        )?;
                        found
                    }
                    None => {
                        let next: i64 = tx.query_row(
                            "SELECT COALESCE(MAX(position), 0) + 1 FROM pending_mutations",
                            [],
                            |row| row.get(0),
                        )?;
                        (next, Utc::now().to_rfc3339())
                    }
                };

                tx.execute(
                    "INSERT INTO pending_mutations (event_key, position, kind, payload, queued_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![&event_key, position, kind.as_str(), &payload, &queued_at],
                )?;
                let local_key = tx.last_insert_rowid();
                tx.commit()?;
                Ok(local_key)
            })
            .await?;

        tracing::debug!("Queued {} mutation with local key {}", kind.as_str(), local_key);
        Ok(local_key)
    }

    pub async fn get_all(&self) -> Result<Vec<PendingMutation>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT local_key, event_key, payload, queued_at
                 FROM pending_mutations ORDER BY position, local_key",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;

            let mut pending = Vec::new();
            for row in rows {
                let (local_key, event_key, payload, queued_at) = row?;
                let entry = decode_row(local_key, event_key, &payload, &queued_at).inspect_err(|e| {
                    tracing::error!("Pending mutation {} cannot be replayed: {}", local_key, e)
                })?;
                pending.push(entry);
            }
            Ok(pending)
        })
        .await
    }

    pub async fn find(&self, key: EventKey) -> Result<Option<PendingMutation>, StoreError> {
        let event_key = key.to_string();
        self.with_conn(move |conn| {
            let row: Option<(i64, String, String, String)> = conn
                .query_row(
                    "SELECT local_key, event_key, payload, queued_at
                     FROM pending_mutations WHERE event_key = ?1",
                    [&event_key],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;
            row.map(|(local_key, event_key, payload, queued_at)| {
                decode_row(local_key, event_key, &payload, &queued_at)
            })
            .transpose()
        })
        .await
    }

    pub async fn remove(&self, local_key: LocalKey) -> Result<bool, StoreError> {
        let removed = self
            .with_conn(move |conn| {
                let count = conn.execute(
                    "DELETE FROM pending_mutations WHERE local_key = ?1",
                    [local_key],
                )?;
                Ok(count > 0)
            })
            .await?;
        tracing::debug!("Removed pending mutation {}: {}", local_key, removed);
        Ok(removed)
    }

    pub async fn cancel(&self, key: EventKey) -> Result<bool, StoreError> {
        let event_key = key.to_string();
        self.with_conn(move |conn| {
            let count = conn.execute(
                "DELETE FROM pending_mutations WHERE event_key = ?1",
                [&event_key],
            )?;
            Ok(count > 0)
        })
        .await
    }

    /// Re-keys a draft's pending upsert once its create was acknowledged so a
    /// later replay updates the created event instead of creating it again.
    pub async fn assign_remote_id(&self, local_id: LocalId, id: RemoteId) -> Result<bool, StoreError> {
        let draft_key = EventKey::Draft(local_id).to_string();
        let remote_key = EventKey::Remote(id).to_string();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let row: Option<(i64, String)> = tx
                .query_row(
                    "SELECT local_key, payload FROM pending_mutations WHERE event_key = ?1",
                    [&draft_key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let Some((local_key, payload)) = row else {
                return Ok(false);
            };

            let mutation = match serde_json::from_str::<Mutation>(&payload)? {
                Mutation::Upsert(mut event) => {
                    event.id = Some(id);
                    Mutation::Upsert(event)
                }
                other => other,
            };

            tx.execute(
                "UPDATE pending_mutations SET event_key = ?1, payload = ?2 WHERE local_key = ?3",
                rusqlite::params![&remote_key, serde_json::to_string(&mutation)?, local_key],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    pub async fn len(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM pending_mutations", [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }

    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::WorkerFailed("connection lock poisoned".to_string()))?;
            op(&mut guard)
        })
        .await
        .map_err(|e| StoreError::WorkerFailed(e.to_string()))?
    }
}

fn decode_row(
    local_key: LocalKey,
    event_key: String,
    payload: &str,
    queued_at: &str,
) -> Result<PendingMutation, StoreError> {
    let mutation: Mutation = serde_json::from_str(payload)
        .map_err(|source| StoreError::UnreadableEntry { local_key, source })?;
    let queued_at = DateTime::<Utc>::from_str(queued_at).unwrap_or_else(|_| Utc::now());
    Ok(PendingMutation {
        local_key,
        event_key,
        mutation,
        queued_at,
    })
}

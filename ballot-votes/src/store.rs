//! Poll store access.
//!
//! The streamer only ever asks one question of the store: "give me every
//! poll". Poll CRUD lives in a separate service that writes the same
//! database; `insert_poll` exists here for seeding and tests.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A poll definition as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poll {
    pub id: String,
    pub title: String,
    /// Ordered option strings, as entered by the poll author.
    pub options: Vec<String>,
}

impl Poll {
    /// Create a poll with a fresh id.
    pub fn new(title: impl Into<String>, options: Vec<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            options,
        }
    }
}

/// Poll store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Poll {id} has unreadable options: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Store connection lock poisoned")]
    Poisoned,

    #[error("Store task failed: {0}")]
    Task(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for ballot_common::Error {
    fn from(err: StoreError) -> Self {
        Self::Store(err.to_string())
    }
}

/// Query contract the term source depends on.
#[async_trait]
pub trait PollStore: Send + Sync {
    /// Return all poll documents.
    async fn list_polls(&self) -> StoreResult<Vec<Poll>>;
}

// ============================================================================
// SQLite store
// ============================================================================

/// SQLite-backed poll store.
pub struct SqlitePollStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePollStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Task(format!("create {}: {e}", parent.display())))?;
            }
        }

        let conn = Connection::open(path.as_ref())?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;

        info!(path = ?path.as_ref(), "Poll store opened");
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;

        debug!("In-memory poll store created");
        Ok(store)
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS polls (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                options TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
        )?;

        Ok(())
    }

    /// Insert a poll.
    pub fn insert_poll(&self, poll: &Poll) -> StoreResult<()> {
        let options = serde_json::to_string(&poll.options).map_err(|e| StoreError::Corrupt {
            id: poll.id.clone(),
            reason: e.to_string(),
        })?;

        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute(
            "INSERT INTO polls (id, title, options, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![poll.id, poll.title, options, Utc::now().to_rfc3339()],
        )?;

        debug!(poll_id = %poll.id, options = poll.options.len(), "Poll inserted");
        Ok(())
    }

    fn query_all(conn: &Connection) -> StoreResult<Vec<Poll>> {
        let mut stmt =
            conn.prepare("SELECT id, title, options FROM polls ORDER BY created_at, rowid")?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, title, options)| {
                let options: Vec<String> =
                    serde_json::from_str(&options).map_err(|e| StoreError::Corrupt {
                        id: id.clone(),
                        reason: e.to_string(),
                    })?;
                Ok(Poll { id, title, options })
            })
            .collect()
    }
}

#[async_trait]
impl PollStore for SqlitePollStore {
    async fn list_polls(&self) -> StoreResult<Vec<Poll>> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| StoreError::Poisoned)?;
            Self::query_all(&conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// In-memory poll store for local runs and tests.
#[derive(Default)]
pub struct InMemoryPollStore {
    polls: RwLock<Vec<Poll>>,
}

impl InMemoryPollStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_polls(polls: Vec<Poll>) -> Self {
        Self {
            polls: RwLock::new(polls),
        }
    }

    pub async fn add_poll(&self, poll: Poll) {
        self.polls.write().await.push(poll);
    }

    /// Replace every poll.
    pub async fn set_polls(&self, polls: Vec<Poll>) {
        *self.polls.write().await = polls;
    }
}

#[async_trait]
impl PollStore for InMemoryPollStore {
    async fn list_polls(&self) -> StoreResult<Vec<Poll>> {
        Ok(self.polls.read().await.clone())
    }
}

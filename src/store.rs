//! SQLite-backed persistence for ideas, embeddings, schedule slots, generation
//! sessions and their logs, and API credentials.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::complexity::Complexity;
use crate::credentials::ApiCredential;
use crate::dedup::{cosine_similarity, DuplicateMatch};
use crate::idea::{ConcreteExample, CriterionEvaluation, IdeaRecord};
use crate::session::{LogEntry, SessionStatus, Severity, Stage};

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub idea_id: i64,
    /// "created", "updated", "rescored", ...
    pub change_type: String,
    pub description: String,
    pub before: Option<String>,
    pub after: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationSlot {
    pub id: i64,
    pub label: String,
    pub enabled: bool,
    pub interval_minutes: i64,
    pub next_due_at: Option<i64>,
    pub last_run_at: Option<i64>,
    pub profile_id: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl GenerationSlot {
    pub fn interval_secs(&self) -> i64 {
        self.interval_minutes.max(1) * 60
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSlot {
    pub label: String,
    pub interval_minutes: i64,
    pub profile_id: Option<i64>,
    /// First trigger time; one interval from now when `None`.
    pub first_due_at: Option<i64>,
    pub enabled: bool,
}

impl NewSlot {
    pub fn every(interval_minutes: i64) -> Self {
        Self {
            label: String::new(),
            interval_minutes,
            profile_id: None,
            first_due_at: None,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRow {
    pub session_id: String,
    pub slot_id: Option<i64>,
    pub status: SessionStatus,
    pub idea_id: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

// =============================================================================
// Error
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("task join error: {0}")]
    Join(String),
    #[error("store closed")]
    Closed,
    #[error("not found: {0}")]
    NotFound(String),
}

// =============================================================================
// Store
// =============================================================================

const IDEA_COLUMNS: &str = "id, name, domain, subdomain, problem, solution, quick_summary, \
     concrete_example, scores, evaluation, score, complexity_technical, complexity_regulatory, \
     complexity_sales, complexity_total, tags, framework, raw_response, prompt, session_id, \
     created_at";

const SLOT_COLUMNS: &str = "id, label, enabled, interval_minutes, next_due_at, last_run_at, \
     profile_id, created_at, updated_at";

#[derive(Clone)]
pub struct IdeaStore {
    conn: Arc<Mutex<Connection>>,
    /// Gate concurrent spawn_blocking calls so only one blocking thread waits on the mutex.
    sem: Arc<Semaphore>,
}

impl IdeaStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             PRAGMA foreign_keys=ON;\
             PRAGMA busy_timeout=5000;",
        )?;
        Self::from_connection(conn)
    }

    /// Private in-memory database.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        Self::create_tables(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            sem: Arc::new(Semaphore::new(1)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("IDEATION_DB_PATH") {
            return PathBuf::from(path);
        }
        PathBuf::from(".ideation.sqlite")
    }

    /// Lock the connection, recovering from poisoning; the connection stays usable.
    fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError>,
    {
        let guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&guard)
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.clone();
        let _permit = self.sem.acquire().await.map_err(|_| StoreError::Closed)?;
        tokio::task::spawn_blocking(move || store.with_conn(f))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }

    fn create_tables(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS ideas (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                name TEXT NOT NULL,\
                domain TEXT NOT NULL,\
                subdomain TEXT,\
                problem TEXT NOT NULL DEFAULT '',\
                solution TEXT NOT NULL DEFAULT '',\
                quick_summary TEXT NOT NULL,\
                concrete_example TEXT NOT NULL,\
                scores TEXT NOT NULL,\
                evaluation TEXT NOT NULL,\
                score INTEGER NOT NULL,\
                complexity_technical REAL NOT NULL,\
                complexity_regulatory REAL NOT NULL,\
                complexity_sales REAL NOT NULL,\
                complexity_total REAL NOT NULL,\
                tags TEXT NOT NULL DEFAULT '[]',\
                framework TEXT NOT NULL,\
                raw_response TEXT NOT NULL,\
                prompt TEXT NOT NULL,\
                session_id TEXT,\
                created_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS idea_history (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                idea_id INTEGER NOT NULL REFERENCES ideas(id) ON DELETE CASCADE,\
                change_type TEXT NOT NULL,\
                description TEXT NOT NULL,\
                before_snapshot TEXT,\
                after_snapshot TEXT,\
                created_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS idea_embeddings (\
                idea_id INTEGER PRIMARY KEY REFERENCES ideas(id) ON DELETE CASCADE,\
                model TEXT NOT NULL,\
                dimensions INTEGER NOT NULL,\
                embedding BLOB NOT NULL,\
                created_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS generation_slots (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                label TEXT NOT NULL DEFAULT '',\
                enabled INTEGER NOT NULL DEFAULT 1,\
                interval_minutes INTEGER NOT NULL,\
                next_due_at INTEGER,\
                last_run_at INTEGER,\
                profile_id INTEGER,\
                created_at INTEGER NOT NULL,\
                updated_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS generation_sessions (\
                session_id TEXT PRIMARY KEY,\
                slot_id INTEGER,\
                status TEXT NOT NULL,\
                idea_id INTEGER,\
                created_at INTEGER NOT NULL,\
                updated_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS generation_logs (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                session_id TEXT NOT NULL,\
                stage TEXT NOT NULL,\
                severity TEXT NOT NULL,\
                message TEXT NOT NULL,\
                details TEXT,\
                created_at_ms INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS api_credentials (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                provider TEXT NOT NULL,\
                api_key TEXT NOT NULL,\
                model TEXT,\
                base_url TEXT,\
                active INTEGER NOT NULL DEFAULT 1,\
                created_at INTEGER NOT NULL\
             );\
             CREATE INDEX IF NOT EXISTS idx_history_idea ON idea_history(idea_id);\
             CREATE INDEX IF NOT EXISTS idx_slots_due ON generation_slots(enabled, next_due_at);\
             CREATE INDEX IF NOT EXISTS idx_sessions_slot ON generation_sessions(slot_id, status);\
             CREATE INDEX IF NOT EXISTS idx_logs_session ON generation_logs(session_id, id);\
             CREATE INDEX IF NOT EXISTS idx_credentials_provider ON api_credentials(provider, active);",
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Ideas
    // -------------------------------------------------------------------------

    /// Insert a scored idea and return its row id. A zero `created_at` is stamped with now.
    pub async fn insert_idea(&self, idea: &IdeaRecord) -> Result<i64, StoreError> {
        let idea = idea.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO ideas (name, domain, subdomain, problem, solution, quick_summary, \
                 concrete_example, scores, evaluation, score, complexity_technical, \
                 complexity_regulatory, complexity_sales, complexity_total, tags, framework, \
                 raw_response, prompt, session_id, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                 ?17, ?18, ?19, ?20)",
                params![
                    idea.name,
                    idea.domain,
                    idea.subdomain,
                    idea.problem,
                    idea.solution,
                    idea.quick_summary,
                    serde_json::to_string(&idea.concrete_example)?,
                    serde_json::to_string(&idea.scores)?,
                    serde_json::to_string(&idea.evaluation)?,
                    idea.score as i64,
                    idea.complexity.technical,
                    idea.complexity.regulatory,
                    idea.complexity.sales,
                    idea.complexity.total,
                    serde_json::to_string(&idea.tags)?,
                    idea.framework,
                    idea.raw_response,
                    idea.prompt,
                    idea.session_id,
                    if idea.created_at > 0 { idea.created_at } else { now_epoch() },
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn get_idea(&self, idea_id: i64) -> Result<IdeaRecord, StoreError> {
        self.blocking(move |conn| {
            let sql = format!("SELECT {IDEA_COLUMNS} FROM ideas WHERE id = ?1");
            conn.query_row(&sql, params![idea_id], row_to_idea_raw)
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("idea {idea_id}")))?
                .decode()
        })
        .await
    }

    /// Newest first.
    pub async fn list_ideas(&self, limit: i64) -> Result<Vec<IdeaRecord>, StoreError> {
        self.blocking(move |conn| {
            let sql = format!("SELECT {IDEA_COLUMNS} FROM ideas ORDER BY id DESC LIMIT ?1");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![limit])?;
            let mut ideas = Vec::new();
            while let Some(row) = rows.next()? {
                ideas.push(row_to_idea_raw(row)?.decode()?);
            }
            Ok(ideas)
        })
        .await
    }

    /// Delete an idea; its history and embedding go with it.
    pub async fn delete_idea(&self, idea_id: i64) -> Result<(), StoreError> {
        self.blocking(move |conn| {
            let rows = conn.execute("DELETE FROM ideas WHERE id = ?1", params![idea_id])?;
            if rows == 0 {
                return Err(StoreError::NotFound(format!("idea {idea_id}")));
            }
            Ok(())
        })
        .await
    }

    pub async fn count_ideas(&self) -> Result<i64, StoreError> {
        self.blocking(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM ideas", [], |r| r.get(0))?))
            .await
    }

    pub async fn insert_history(
        &self,
        idea_id: i64,
        change_type: &str,
        description: &str,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
    ) -> Result<i64, StoreError> {
        let change_type = change_type.to_string();
        let description = description.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO idea_history (idea_id, change_type, description, before_snapshot, \
                 after_snapshot, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    idea_id,
                    change_type,
                    description,
                    before.map(|v| v.to_string()),
                    after.map(|v| v.to_string()),
                    now_epoch(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn idea_history(&self, idea_id: i64) -> Result<Vec<HistoryEntry>, StoreError> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, idea_id, change_type, description, before_snapshot, after_snapshot, \
                 created_at FROM idea_history WHERE idea_id = ?1 ORDER BY id",
            )?;
            let mut rows = stmt.query(params![idea_id])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(HistoryEntry {
                    id: row.get(0)?,
                    idea_id: row.get(1)?,
                    change_type: row.get(2)?,
                    description: row.get(3)?,
                    before: row.get(4)?,
                    after: row.get(5)?,
                    created_at: row.get(6)?,
                });
            }
            Ok(out)
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Embeddings
    // -------------------------------------------------------------------------

    /// Store (or replace) the embedding for an idea.
    pub async fn put_embedding(
        &self,
        idea_id: i64,
        model: &str,
        embedding: &[f32],
    ) -> Result<(), StoreError> {
        let model = model.to_string();
        let blob = encode_embedding(embedding);
        let dims = embedding.len() as i64;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO idea_embeddings (idea_id, model, dimensions, embedding, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(idea_id) DO UPDATE SET model = excluded.model, \
                 dimensions = excluded.dimensions, embedding = excluded.embedding, \
                 created_at = excluded.created_at",
                params![idea_id, model, dims, blob, now_epoch()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_embedding(&self, idea_id: i64) -> Result<Option<Vec<f32>>, StoreError> {
        self.blocking(move |conn| {
            let blob: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT embedding FROM idea_embeddings WHERE idea_id = ?1",
                    params![idea_id],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(blob.map(|b| decode_embedding(&b)))
        })
        .await
    }

    /// Stored ideas whose embedding has cosine similarity `>= threshold` with `query`,
    /// most similar first, at most `top_k`. Embeddings of a different length are skipped.
    pub async fn similar_ideas(
        &self,
        query: &[f32],
        exclude_id: Option<i64>,
        top_k: usize,
        threshold: f64,
    ) -> Result<Vec<DuplicateMatch>, StoreError> {
        let query = query.to_vec();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT e.idea_id, i.name, e.embedding FROM idea_embeddings e \
                 JOIN ideas i ON i.id = e.idea_id",
            )?;
            let mut rows = stmt.query([])?;
            let mut matches = Vec::new();
            while let Some(row) = rows.next()? {
                let idea_id: i64 = row.get(0)?;
                if Some(idea_id) == exclude_id {
                    continue;
                }
                let blob: Vec<u8> = row.get(2)?;
                let Some(similarity) = cosine_similarity(&query, &decode_embedding(&blob)) else {
                    continue;
                };
                if similarity >= threshold {
                    matches.push(DuplicateMatch {
                        idea_id,
                        name: row.get(1)?,
                        similarity,
                    });
                }
            }
            matches.sort_by(|a, b| {
                b.similarity
                    .partial_cmp(&a.similarity)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.idea_id.cmp(&b.idea_id))
            });
            matches.truncate(top_k);
            Ok(matches)
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Sessions and logs
    // -------------------------------------------------------------------------

    pub async fn create_session(
        &self,
        session_id: &str,
        slot_id: Option<i64>,
        status: SessionStatus,
    ) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        self.blocking(move |conn| {
            let now = now_epoch();
            conn.execute(
                "INSERT INTO generation_sessions (session_id, slot_id, status, created_at, \
                 updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![session_id, slot_id, status.as_str(), now, now],
            )?;
            Ok(())
        })
        .await
    }

    /// Move a session to `status`. Terminal sessions are never changed; returns whether
    /// a row was updated.
    pub async fn set_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        idea_id: Option<i64>,
    ) -> Result<bool, StoreError> {
        let session_id = session_id.to_string();
        self.blocking(move |conn| {
            let rows = conn.execute(
                "UPDATE generation_sessions SET status = ?1, idea_id = COALESCE(?2, idea_id), \
                 updated_at = ?3 WHERE session_id = ?4 AND status NOT IN ('completed', 'failed')",
                params![status.as_str(), idea_id, now_epoch(), session_id],
            )?;
            Ok(rows > 0)
        })
        .await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<SessionRow, StoreError> {
        let session_id = session_id.to_string();
        self.blocking(move |conn| {
            conn.query_row(
                "SELECT session_id, slot_id, status, idea_id, created_at, updated_at \
                 FROM generation_sessions WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok(SessionRow {
                        session_id: row.get(0)?,
                        slot_id: row.get(1)?,
                        status: SessionStatus::from_str(&row.get::<_, String>(2)?),
                        idea_id: row.get(3)?,
                        created_at: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))
        })
        .await
    }

    /// Whether the slot has an `in_progress` session. With `since`, only sessions
    /// updated at or after it count.
    pub async fn has_in_progress_session(
        &self,
        slot_id: i64,
        since: Option<i64>,
    ) -> Result<bool, StoreError> {
        self.blocking(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM generation_sessions \
                 WHERE slot_id = ?1 AND status = ?2 AND (?3 IS NULL OR updated_at >= ?3)",
                params![slot_id, SessionStatus::InProgress.as_str(), since],
                |r| r.get(0),
            )?;
            Ok(n > 0)
        })
        .await
    }

    pub async fn append_log(&self, entry: &LogEntry) -> Result<(), StoreError> {
        let entry = entry.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO generation_logs (session_id, stage, severity, message, details, \
                 created_at_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entry.session_id,
                    entry.stage.as_str(),
                    entry.severity.as_str(),
                    entry.message,
                    (!entry.details.is_null()).then(|| entry.details.to_string()),
                    entry.timestamp_ms,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Log entries for a session in insertion order.
    pub async fn session_logs(&self, session_id: &str) -> Result<Vec<LogEntry>, StoreError> {
        let session_id = session_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, stage, severity, message, details, created_at_ms \
                 FROM generation_logs WHERE session_id = ?1 ORDER BY id",
            )?;
            let mut rows = stmt.query(params![session_id])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let details: Option<String> = row.get(4)?;
                out.push(LogEntry {
                    session_id: row.get(0)?,
                    stage: Stage::from_str(&row.get::<_, String>(1)?),
                    severity: Severity::from_str(&row.get::<_, String>(2)?),
                    message: row.get(3)?,
                    details: match details {
                        Some(d) => serde_json::from_str(&d)?,
                        None => serde_json::Value::Null,
                    },
                    timestamp_ms: row.get(5)?,
                });
            }
            Ok(out)
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Slots
    // -------------------------------------------------------------------------

    pub async fn create_slot(&self, slot: NewSlot) -> Result<i64, StoreError> {
        self.blocking(move |conn| {
            let now = now_epoch();
            let first_due = slot
                .first_due_at
                .unwrap_or(now + slot.interval_minutes.max(1) * 60);
            conn.execute(
                "INSERT INTO generation_slots (label, enabled, interval_minutes, next_due_at, \
                 profile_id, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    slot.label,
                    slot.enabled as i64,
                    slot.interval_minutes.max(1),
                    first_due,
                    slot.profile_id,
                    now,
                    now,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn get_slot(&self, slot_id: i64) -> Result<GenerationSlot, StoreError> {
        self.blocking(move |conn| {
            let sql = format!("SELECT {SLOT_COLUMNS} FROM generation_slots WHERE id = ?1");
            conn.query_row(&sql, params![slot_id], row_to_slot)
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("slot {slot_id}")))
        })
        .await
    }

    pub async fn list_slots(&self) -> Result<Vec<GenerationSlot>, StoreError> {
        self.query_slots(format!("SELECT {SLOT_COLUMNS} FROM generation_slots ORDER BY id"), None)
            .await
    }

    /// Enabled slots with `next_due_at <= now`, earliest first.
    pub async fn due_slots(&self, now: i64) -> Result<Vec<GenerationSlot>, StoreError> {
        self.query_slots(
            format!(
                "SELECT {SLOT_COLUMNS} FROM generation_slots \
                 WHERE enabled = 1 AND next_due_at IS NOT NULL AND next_due_at <= ?1 \
                 ORDER BY next_due_at, id"
            ),
            Some(now),
        )
        .await
    }

    /// Enabled slots with `next_due_at > now`.
    pub async fn pending_slots(&self, now: i64) -> Result<Vec<GenerationSlot>, StoreError> {
        self.query_slots(
            format!(
                "SELECT {SLOT_COLUMNS} FROM generation_slots \
                 WHERE enabled = 1 AND next_due_at IS NOT NULL AND next_due_at > ?1 \
                 ORDER BY next_due_at, id"
            ),
            Some(now),
        )
        .await
    }

    async fn query_slots(
        &self,
        sql: String,
        now: Option<i64>,
    ) -> Result<Vec<GenerationSlot>, StoreError> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = match now {
                Some(now) => stmt.query(params![now])?,
                None => stmt.query([])?,
            };
            let mut slots = Vec::new();
            while let Some(row) = rows.next()? {
                slots.push(row_to_slot(row)?);
            }
            Ok(slots)
        })
        .await
    }

    pub async fn advance_slot(&self, slot_id: i64, next_due_at: i64) -> Result<(), StoreError> {
        self.update_slot(
            slot_id,
            "UPDATE generation_slots SET next_due_at = ?1, updated_at = ?2 WHERE id = ?3",
            Some(next_due_at),
        )
        .await
    }

    pub async fn mark_slot_run(&self, slot_id: i64, ran_at: i64) -> Result<(), StoreError> {
        self.update_slot(
            slot_id,
            "UPDATE generation_slots SET last_run_at = ?1, updated_at = ?2 WHERE id = ?3",
            Some(ran_at),
        )
        .await
    }

    pub async fn set_slot_enabled(&self, slot_id: i64, enabled: bool) -> Result<(), StoreError> {
        self.update_slot(
            slot_id,
            "UPDATE generation_slots SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
            Some(enabled as i64),
        )
        .await
    }

    pub async fn set_slot_profile(
        &self,
        slot_id: i64,
        profile_id: Option<i64>,
    ) -> Result<(), StoreError> {
        self.update_slot(
            slot_id,
            "UPDATE generation_slots SET profile_id = ?1, updated_at = ?2 WHERE id = ?3",
            profile_id,
        )
        .await
    }

    async fn update_slot(
        &self,
        slot_id: i64,
        sql: &'static str,
        value: Option<i64>,
    ) -> Result<(), StoreError> {
        self.blocking(move |conn| {
            let rows = conn.execute(sql, params![value, now_epoch(), slot_id])?;
            if rows == 0 {
                return Err(StoreError::NotFound(format!("slot {slot_id}")));
            }
            Ok(())
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Credentials
    // -------------------------------------------------------------------------

    /// Store a credential as the active one for its provider.
    pub async fn set_credential(&self, credential: &ApiCredential) -> Result<i64, StoreError> {
        let credential = credential.clone();
        self.blocking(move |conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "UPDATE api_credentials SET active = 0 WHERE provider = ?1",
                params![credential.provider],
            )?;
            tx.execute(
                "INSERT INTO api_credentials (provider, api_key, model, base_url, active, \
                 created_at) VALUES (?1, ?2, ?3, ?4, 1, ?5)",
                params![
                    credential.provider,
                    credential.api_key,
                    credential.model,
                    credential.base_url,
                    now_epoch(),
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;
            Ok(id)
        })
        .await
    }

    pub async fn deactivate_credentials(&self, provider: &str) -> Result<usize, StoreError> {
        let provider = provider.to_string();
        self.blocking(move |conn| {
            Ok(conn.execute(
                "UPDATE api_credentials SET active = 0 WHERE provider = ?1 AND active = 1",
                params![provider],
            )?)
        })
        .await
    }

    pub async fn active_credential(&self, provider: &str) -> Result<Option<ApiCredential>, StoreError> {
        let provider = provider.to_string();
        self.blocking(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT provider, api_key, model, base_url FROM api_credentials \
                     WHERE provider = ?1 AND active = 1 ORDER BY id DESC LIMIT 1",
                    params![provider],
                    |row| {
                        Ok(ApiCredential {
                            provider: row.get(0)?,
                            api_key: row.get(1)?,
                            model: row.get(2)?,
                            base_url: row.get(3)?,
                        })
                    },
                )
                .optional()?)
        })
        .await
    }
}

// =============================================================================
// Row converters
// =============================================================================

/// Idea row with JSON columns still encoded.
struct IdeaRow {
    id: i64,
    name: String,
    domain: String,
    subdomain: Option<String>,
    problem: String,
    solution: String,
    quick_summary: String,
    concrete_example: String,
    scores: String,
    evaluation: String,
    score: i64,
    complexity: Complexity,
    tags: String,
    framework: String,
    raw_response: String,
    prompt: String,
    session_id: Option<String>,
    created_at: i64,
}

impl IdeaRow {
    fn decode(self) -> Result<IdeaRecord, StoreError> {
        let concrete_example: ConcreteExample = serde_json::from_str(&self.concrete_example)?;
        let scores: BTreeMap<String, u8> = serde_json::from_str(&self.scores)?;
        let evaluation: BTreeMap<String, CriterionEvaluation> =
            serde_json::from_str(&self.evaluation)?;
        Ok(IdeaRecord {
            id: self.id,
            name: self.name,
            domain: self.domain,
            subdomain: self.subdomain,
            problem: self.problem,
            solution: self.solution,
            quick_summary: self.quick_summary,
            concrete_example,
            scores,
            evaluation,
            score: self.score.clamp(0, 100) as u8,
            complexity: self.complexity,
            tags: serde_json::from_str(&self.tags)?,
            framework: self.framework,
            raw_response: self.raw_response,
            prompt: self.prompt,
            session_id: self.session_id,
            created_at: self.created_at,
        })
    }
}

fn row_to_idea_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<IdeaRow> {
    Ok(IdeaRow {
        id: row.get(0)?,
        name: row.get(1)?,
        domain: row.get(2)?,
        subdomain: row.get(3)?,
        problem: row.get(4)?,
        solution: row.get(5)?,
        quick_summary: row.get(6)?,
        concrete_example: row.get(7)?,
        scores: row.get(8)?,
        evaluation: row.get(9)?,
        score: row.get(10)?,
        complexity: Complexity {
            technical: row.get(11)?,
            regulatory: row.get(12)?,
            sales: row.get(13)?,
            total: row.get(14)?,
        },
        tags: row.get(15)?,
        framework: row.get(16)?,
        raw_response: row.get(17)?,
        prompt: row.get(18)?,
        session_id: row.get(19)?,
        created_at: row.get(20)?,
    })
}

fn row_to_slot(row: &rusqlite::Row<'_>) -> rusqlite::Result<GenerationSlot> {
    Ok(GenerationSlot {
        id: row.get(0)?,
        label: row.get(1)?,
        enabled: row.get::<_, i64>(2)? != 0,
        interval_minutes: row.get(3)?,
        next_due_at: row.get(4)?,
        last_run_at: row.get(5)?,
        profile_id: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

/// Little-endian f32 bytes.
pub fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idea::fixtures::draft_with_uniform_scores;
    use crate::scoring::WeightTable;

    fn temp_store() -> IdeaStore {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let path = dir.path().join("test_ideas.sqlite");
        // Leak the TempDir so it persists for the test
        std::mem::forget(dir);
        IdeaStore::new(path).expect("create store")
    }

    fn record() -> IdeaRecord {
        IdeaRecord::from_draft(
            draft_with_uniform_scores(8),
            &WeightTable::default(),
            "Unbundling",
            "{\"raw\": true}",
            "the prompt",
        )
    }

    #[tokio::test]
    async fn idea_round_trips_through_sqlite() {
        let store = temp_store();
        let id = store.insert_idea(&record()).await.expect("insert");
        let loaded = store.get_idea(id).await.expect("get");
        assert_eq!(loaded.id, id);
        assert_eq!(loaded.score, 80);
        assert_eq!(loaded.complexity.total, 9.0);
        assert_eq!(loaded.scores.len(), 10);
        assert_eq!(loaded.concrete_example.key_improvement, "Faster restock");
        assert!(loaded.created_at > 0);
    }

    #[tokio::test]
    async fn delete_cascades_to_history_and_embedding() {
        let store = temp_store();
        let id = store.insert_idea(&record()).await.unwrap();
        store
            .insert_history(id, "created", "test", None, Some(serde_json::json!({"a": 1})))
            .await
            .unwrap();
        store.put_embedding(id, "m", &[1.0, 0.0]).await.unwrap();

        store.delete_idea(id).await.unwrap();
        assert!(store.idea_history(id).await.unwrap().is_empty());
        assert!(store.get_embedding(id).await.unwrap().is_none());
        assert!(matches!(store.get_idea(id).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn similar_ideas_filters_sorts_and_excludes() {
        let store = temp_store();
        let a = store.insert_idea(&record()).await.unwrap();
        let b = store.insert_idea(&record()).await.unwrap();
        let c = store.insert_idea(&record()).await.unwrap();
        store.put_embedding(a, "m", &[1.0, 0.0]).await.unwrap();
        store.put_embedding(b, "m", &[0.8, 0.6]).await.unwrap();
        store.put_embedding(c, "m", &[0.0, 1.0]).await.unwrap();

        let hits = store.similar_ideas(&[1.0, 0.0], None, 10, 0.5).await.unwrap();
        assert_eq!(hits.iter().map(|m| m.idea_id).collect::<Vec<_>>(), vec![a, b]);
        assert!((hits[1].similarity - 0.8).abs() < 1e-6);

        let hits = store.similar_ideas(&[1.0, 0.0], Some(a), 10, 0.5).await.unwrap();
        assert_eq!(hits.len(), 1);

        let hits = store.similar_ideas(&[1.0, 0.0], None, 1, 0.0).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn terminal_session_status_is_set_once() {
        let store = temp_store();
        store
            .create_session("s1", Some(4), SessionStatus::Waiting)
            .await
            .unwrap();
        assert!(store
            .set_session_status("s1", SessionStatus::InProgress, None)
            .await
            .unwrap());
        assert!(store.has_in_progress_session(4, None).await.unwrap());
        assert!(store
            .set_session_status("s1", SessionStatus::Completed, Some(9))
            .await
            .unwrap());
        assert!(!store
            .set_session_status("s1", SessionStatus::Failed, None)
            .await
            .unwrap());

        let row = store.get_session("s1").await.unwrap();
        assert_eq!(row.status, SessionStatus::Completed);
        assert_eq!(row.idea_id, Some(9));
        assert!(!store.has_in_progress_session(4, None).await.unwrap());
    }

    #[tokio::test]
    async fn due_slots_are_ordered_and_filtered() {
        let store = temp_store();
        let late = store
            .create_slot(NewSlot {
                first_due_at: Some(200),
                ..NewSlot::every(5)
            })
            .await
            .unwrap();
        let early = store
            .create_slot(NewSlot {
                first_due_at: Some(100),
                ..NewSlot::every(5)
            })
            .await
            .unwrap();
        let disabled = store
            .create_slot(NewSlot {
                first_due_at: Some(50),
                enabled: false,
                ..NewSlot::every(5)
            })
            .await
            .unwrap();
        store
            .create_slot(NewSlot {
                first_due_at: Some(10_000),
                ..NewSlot::every(5)
            })
            .await
            .unwrap();

        let due = store.due_slots(300).await.unwrap();
        assert_eq!(due.iter().map(|s| s.id).collect::<Vec<_>>(), vec![early, late]);
        assert!(!due.iter().any(|s| s.id == disabled));
        assert_eq!(store.pending_slots(300).await.unwrap().len(), 1);

        store.advance_slot(early, 400).await.unwrap();
        store.mark_slot_run(early, 300).await.unwrap();
        let slot = store.get_slot(early).await.unwrap();
        assert_eq!(slot.next_due_at, Some(400));
        assert_eq!(slot.last_run_at, Some(300));

        assert!(matches!(
            store.advance_slot(999, 1).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn newest_credential_is_active() {
        let store = temp_store();
        assert!(store.active_credential("openrouter").await.unwrap().is_none());
        store
            .set_credential(&ApiCredential::new("openrouter", "old"))
            .await
            .unwrap();
        store
            .set_credential(&ApiCredential::new("openrouter", "new").with_model("m"))
            .await
            .unwrap();
        let cred = store.active_credential("openrouter").await.unwrap().unwrap();
        assert_eq!(cred.api_key, "new");
        assert_eq!(cred.model.as_deref(), Some("m"));

        assert_eq!(store.deactivate_credentials("openrouter").await.unwrap(), 1);
        assert!(store.active_credential("openrouter").await.unwrap().is_none());
    }

    #[test]
    fn embedding_blob_round_trip() {
        let v = vec![0.25f32, -1.5, 3.0];
        assert_eq!(decode_embedding(&encode_embedding(&v)), v);
    }
}

//! Generation sessions: stage-tagged log entries and the one-time terminal status.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::{now_epoch_ms, IdeaStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Init,
    ConfigVerify,
    PromptBuild,
    ApiCall,
    ResponseParse,
    DuplicateCheck,
    DbSave,
    Complete,
    Failed,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::ConfigVerify => "CONFIG_VERIFY",
            Self::PromptBuild => "PROMPT_BUILD",
            Self::ApiCall => "API_CALL",
            Self::ResponseParse => "RESPONSE_PARSE",
            Self::DuplicateCheck => "DUPLICATE_CHECK",
            Self::DbSave => "DB_SAVE",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "INIT" => Self::Init,
            "CONFIG_VERIFY" => Self::ConfigVerify,
            "PROMPT_BUILD" => Self::PromptBuild,
            "API_CALL" => Self::ApiCall,
            "RESPONSE_PARSE" => Self::ResponseParse,
            "DUPLICATE_CHECK" => Self::DuplicateCheck,
            "DB_SAVE" => Self::DbSave,
            "COMPLETE" => Self::Complete,
            _ => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            "warning" => Self::Warning,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Waiting,
    InProgress,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "waiting" => Self::Waiting,
            "in_progress" => Self::InProgress,
            "completed" => Self::Completed,
            _ => Self::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub session_id: String,
    pub stage: Stage,
    pub severity: Severity,
    pub message: String,
    /// Structured details; `Null` when there are none.
    pub details: Value,
    pub timestamp_ms: i64,
}

/// Collects a session's log entries, mirrors them to the store and `tracing`, and
/// sets the terminal status once.
///
/// Store writes are best effort: a failed write is reported through `tracing` and
/// the run continues.
pub struct SessionLogger {
    store: IdeaStore,
    session_id: String,
    slot_id: Option<i64>,
    entries: Vec<LogEntry>,
    status: SessionStatus,
}

impl SessionLogger {
    /// Register the session as `waiting`.
    pub async fn start(store: IdeaStore, session_id: impl Into<String>, slot_id: Option<i64>) -> Self {
        let session_id = session_id.into();
        if let Err(e) = store
            .create_session(&session_id, slot_id, SessionStatus::Waiting)
            .await
        {
            tracing::warn!(session_id = %session_id, error = %e, "failed to record session");
        }
        Self {
            store,
            session_id,
            slot_id,
            entries: Vec::new(),
            status: SessionStatus::Waiting,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<LogEntry> {
        self.entries
    }

    pub async fn log(&mut self, stage: Stage, severity: Severity, message: impl Into<String>, details: Value) {
        let entry = LogEntry {
            session_id: self.session_id.clone(),
            stage,
            severity,
            message: message.into(),
            details,
            timestamp_ms: now_epoch_ms(),
        };

        match severity {
            Severity::Error => tracing::error!(
                session_id = %entry.session_id,
                slot_id = ?self.slot_id,
                stage = stage.as_str(),
                details = %entry.details,
                "{}",
                entry.message
            ),
            Severity::Warning => tracing::warn!(
                session_id = %entry.session_id,
                slot_id = ?self.slot_id,
                stage = stage.as_str(),
                details = %entry.details,
                "{}",
                entry.message
            ),
            Severity::Info | Severity::Success => tracing::info!(
                session_id = %entry.session_id,
                slot_id = ?self.slot_id,
                stage = stage.as_str(),
                details = %entry.details,
                "{}",
                entry.message
            ),
        }

        if let Err(e) = self.store.append_log(&entry).await {
            tracing::warn!(session_id = %self.session_id, error = %e, "failed to persist session log");
        }
        self.entries.push(entry);
    }

    pub async fn info(&mut self, stage: Stage, message: impl Into<String>, details: Value) {
        self.log(stage, Severity::Info, message, details).await;
    }

    pub async fn success(&mut self, stage: Stage, message: impl Into<String>, details: Value) {
        self.log(stage, Severity::Success, message, details).await;
    }

    pub async fn warning(&mut self, stage: Stage, message: impl Into<String>, details: Value) {
        self.log(stage, Severity::Warning, message, details).await;
    }

    pub async fn error(&mut self, stage: Stage, message: impl Into<String>, details: Value) {
        self.log(stage, Severity::Error, message, details).await;
    }

    /// Move to `status`. Once terminal, further calls are ignored and return `false`.
    pub async fn set_status(&mut self, status: SessionStatus, idea_id: Option<i64>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        if let Err(e) = self
            .store
            .set_session_status(&self.session_id, status, idea_id)
            .await
        {
            tracing::warn!(session_id = %self.session_id, error = %e, "failed to update session status");
        }
        true
    }
}

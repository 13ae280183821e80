use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::agent_engine::state::{ChatEntry, TaskStatus};
use crate::errors::{AgentError, AgentResult};

/// One persisted line: a chat entry, or a run status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryRecord {
    Message {
        entry: ChatEntry,
    },
    Status {
        run_id: Uuid,
        status: TaskStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
        ts: DateTime<Utc>,
    },
}

impl HistoryRecord {
    pub fn message(entry: ChatEntry) -> Self {
        HistoryRecord::Message { entry }
    }

    pub fn status(run_id: Uuid, status: TaskStatus, detail: Option<String>) -> Self {
        HistoryRecord::Status {
            run_id,
            status,
            detail,
            ts: Utc::now(),
        }
    }
}

/// Durable conversation history.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, record: &HistoryRecord) -> AgentResult<()>;

    /// All readable records in append order. Unreadable data is skipped.
    async fn load(&self) -> Vec<HistoryRecord>;

    async fn clear(&self) -> AgentResult<()>;
}

/// Chat entries only, in order; what the presentation layer restores at startup.
pub fn chat_entries(records: Vec<HistoryRecord>) -> Vec<ChatEntry> {
    records
        .into_iter()
        .filter_map(|r| match r {
            HistoryRecord::Message { entry } => Some(entry),
            HistoryRecord::Status { .. } => None,
        })
        .collect()
}

/// Appends one JSON object per line.
pub struct JsonlHistoryStore {
    file_path: PathBuf,
    // Serializes writers so concurrent appends never interleave within a line.
    lock: Mutex<()>,
}

impl JsonlHistoryStore {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            lock: Mutex::new(()),
        }
    }

    /// `<data dir>/phone-agent/history.jsonl`, or `override_path` when given.
    pub fn open_default(override_path: Option<&Path>) -> Self {
        match override_path {
            Some(p) => Self::new(p),
            None => Self::new(data_dir_or_cwd().join("history.jsonl")),
        }
    }
}

#[async_trait]
impl HistoryStore for JsonlHistoryStore {
    async fn append(&self, record: &HistoryRecord) -> AgentResult<()> {
        let _guard = self.lock.lock().await;
        let line = serde_json::to_string(record)?;
        if let Some(parent) = self.file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;
        writeln!(file, "{line}")?;
        tracing::debug!(path = %self.file_path.display(), "history record flushed");
        Ok(())
    }

    async fn load(&self) -> Vec<HistoryRecord> {
        let _guard = self.lock.lock().await;
        let content = match std::fs::read_to_string(&self.file_path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                tracing::warn!(path = %self.file_path.display(), error = %e, "history unreadable; starting empty");
                return Vec::new();
            }
        };

        let mut records = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryRecord>(line) {
                Ok(r) => records.push(r),
                Err(e) => tracing::warn!(line = lineno + 1, error = %e, "skipping corrupt history line"),
            }
        }
        tracing::info!(count = records.len(), "history loaded");
        records
    }

    async fn clear(&self) -> AgentResult<()> {
        let _guard = self.lock.lock().await;
        match std::fs::remove_file(&self.file_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AgentError::Persistence(format!(
                "failed to clear {}: {e}",
                self.file_path.display()
            ))),
        }
    }
}

/// Platform data directory (`dirs::data_local_dir`) joined with `phone-agent`,
/// falling back to the current working directory.
fn data_dir_or_cwd() -> PathBuf {
    if let Some(base) = dirs::data_local_dir() {
        return base.join("phone-agent");
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_engine::state::EntryRole;

    fn entry(text: &str) -> ChatEntry {
        ChatEntry::new(Uuid::new_v4(), EntryRole::User, text)
    }

    #[tokio::test]
    async fn append_then_load_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlHistoryStore::new(dir.path().join("nested").join("h.jsonl"));
        let run = Uuid::new_v4();
        store.append(&HistoryRecord::message(entry("one"))).await.unwrap();
        store
            .append(&HistoryRecord::status(run, TaskStatus::Completed, Some("done".into())))
            .await
            .unwrap();
        store.append(&HistoryRecord::message(entry("two"))).await.unwrap();

        let records = store.load().await;
        assert_eq!(records.len(), 3);
        let texts: Vec<_> = chat_entries(records).into_iter().map(|e| e.content).collect();
        assert_eq!(texts, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("h.jsonl");
        let good = serde_json::to_string(&HistoryRecord::message(entry("kept"))).unwrap();
        std::fs::write(&path, format!("{{not json\n{good}\n\n{{\"kind\":\"mystery\"}}\n")).unwrap();

        let store = JsonlHistoryStore::new(&path);
        let records = store.load().await;
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn missing_file_loads_empty_and_clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlHistoryStore::new(dir.path().join("absent.jsonl"));
        assert!(store.load().await.is_empty());
        store.clear().await.unwrap();

        store.append(&HistoryRecord::message(entry("x"))).await.unwrap();
        store.clear().await.unwrap();
        assert!(store.load().await.is_empty());
    }
}

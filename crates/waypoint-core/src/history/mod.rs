//! Append-only execution history.
//!
//! Validations, corrections and streaming events are appended per task and
//! never rewritten. Uses sled for fast local storage.

use blake2::{Blake2b, Digest, digest::consts::U32};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::types::TaskId;

/// History store errors.
#[derive(Error, Debug)]
pub enum HistoryError {
    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Unique event identifier (`BLAKE2b` hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub [u8; 32]);

impl EventId {
    /// Generate event ID from content.
    #[must_use]
    pub fn from_content(content: &[u8]) -> Self {
        let mut hasher = Blake2b::<U32>::new();
        hasher.update(content);
        let result = hasher.finalize();
        let mut id = [0u8; 32];
        id.copy_from_slice(&result);
        Self(id)
    }

    /// Convert to hex string.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.to_hex()[..12])
    }
}

/// Kind of history record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    /// A checkpoint validation outcome.
    Validation,
    /// A plan correction.
    Correction,
    /// A streaming lifecycle event.
    Streaming,
}

impl HistoryKind {
    /// Stable name used in storage keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Correction => "correction",
            Self::Streaming => "streaming",
        }
    }
}

/// One history record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// Unique event identifier.
    pub id: EventId,
    /// Task the event belongs to.
    pub task_id: TaskId,
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// Record kind.
    pub kind: HistoryKind,
    /// Event payload.
    pub payload: serde_json::Value,
}

impl HistoryEvent {
    /// Create a new history event.
    #[must_use]
    pub fn new(task_id: TaskId, kind: HistoryKind, payload: serde_json::Value) -> Self {
        let timestamp = Utc::now();
        let content = format!(
            "{task_id}:{}:{}:{payload}",
            kind.as_str(),
            timestamp.timestamp_nanos_opt().unwrap_or_default()
        );
        Self {
            id: EventId::from_content(content.as_bytes()),
            task_id,
            timestamp,
            kind,
            payload,
        }
    }
}

/// Destination for history events.
///
/// Callers treat every write as best-effort.
pub trait HistorySink: Send + Sync {
    /// Append an event.
    ///
    /// # Errors
    ///
    /// Returns error if the event cannot be stored.
    fn append(&self, event: &HistoryEvent) -> Result<(), HistoryError>;
}

/// History store backed by sled.
pub struct HistoryStore {
    db: sled::Db,
    events_tree: sled::Tree,
}

impl HistoryStore {
    /// Open or create a history store.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened.
    pub fn open(path: &Path) -> Result<Self, HistoryError> {
        let db = sled::open(path)?;
        let events_tree = db.open_tree("events")?;
        Ok(Self { db, events_tree })
    }

    /// Get all events for a task, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if storage read fails.
    pub fn events_for(&self, task_id: &TaskId) -> Result<Vec<HistoryEvent>, HistoryError> {
        let prefix = format!("{task_id}:");
        let mut events = Vec::new();

        for result in self.events_tree.scan_prefix(prefix.as_bytes()) {
            let (_, value) = result?;
            events.push(serde_json::from_slice::<HistoryEvent>(&value)?);
        }

        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }

    /// Get events of one kind for a task.
    ///
    /// # Errors
    ///
    /// Returns error if storage read fails.
    pub fn events_of_kind(
        &self,
        task_id: &TaskId,
        kind: HistoryKind,
    ) -> Result<Vec<HistoryEvent>, HistoryError> {
        Ok(self
            .events_for(task_id)?
            .into_iter()
            .filter(|e| e.kind == kind)
            .collect())
    }

    /// List all task IDs with recorded history.
    ///
    /// # Errors
    ///
    /// Returns error if storage read fails.
    pub fn list_tasks(&self) -> Result<Vec<TaskId>, HistoryError> {
        let mut tasks: Vec<TaskId> = Vec::new();

        for result in &self.events_tree {
            let (key, _) = result?;
            if let Some(task) = std::str::from_utf8(&key)
                .ok()
                .and_then(|k| k.rsplit_once(':'))
                .map(|(task, _)| task)
            {
                tasks.push(TaskId::new(task));
            }
        }

        // Keys are ordered, so events of one task are contiguous.
        tasks.dedup();
        Ok(tasks)
    }

    /// Flush all pending writes to disk.
    ///
    /// # Errors
    ///
    /// Returns error if flush fails.
    pub fn flush(&self) -> Result<(), HistoryError> {
        self.db.flush()?;
        Ok(())
    }
}

impl HistorySink for HistoryStore {
    fn append(&self, event: &HistoryEvent) -> Result<(), HistoryError> {
        let key = format!("{}:{}", event.task_id, event.id.to_hex());
        let data = serde_json::to_vec(event)?;
        self.events_tree.insert(key.as_bytes(), data)?;
        tracing::trace!(task_id = %event.task_id, kind = event.kind.as_str(), "History appended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn test_event_id_generation() {
        let id1 = EventId::from_content(b"test content");
        let id2 = EventId::from_content(b"test content");
        let id3 = EventId::from_content(b"different content");

        assert_eq!(id1, id2);
        assert_ne!(id1, id3);
        assert_eq!(id1.to_string().len(), 12);
    }

    #[test]
    fn test_history_store_append_and_read() {
        let temp = tempdir().unwrap();
        let store = HistoryStore::open(temp.path()).unwrap();
        let task = TaskId::new("task-1");

        store
            .append(&HistoryEvent::new(
                task.clone(),
                HistoryKind::Streaming,
                serde_json::json!({"type": "started"}),
            ))
            .unwrap();
        store
            .append(&HistoryEvent::new(
                task.clone(),
                HistoryKind::Correction,
                serde_json::json!({"strategy": "increase_timeout"}),
            ))
            .unwrap();
        store
            .append(&HistoryEvent::new(
                TaskId::new("task-2"),
                HistoryKind::Validation,
                serde_json::json!({"passed": true}),
            ))
            .unwrap();

        let events = store.events_for(&task).unwrap();
        assert_eq!(events.len(), 2);

        let corrections = store.events_of_kind(&task, HistoryKind::Correction).unwrap();
        assert_eq!(corrections.len(), 1);
        assert_eq!(corrections[0].payload["strategy"], "increase_timeout");

        let tasks = store.list_tasks().unwrap();
        assert_eq!(tasks, vec![TaskId::new("task-1"), TaskId::new("task-2")]);
    }
}

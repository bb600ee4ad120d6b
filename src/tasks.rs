//! Per-id task records backing the fire-and-forget download mode.

use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::security::ContentId;

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskState {
    /// Label exposed in HTTP status payloads.
    pub fn status_label(self) -> &'static str {
        match self {
            Self::Pending => "queued",
            Self::Running => "processing",
            Self::Succeeded => "ready",
            Self::Failed => "error",
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    pub state: TaskState,
    pub attempts: usize,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    fn new(id: &ContentId, state: TaskState, message: &str) -> Self {
        Self {
            id: id.to_string(),
            state,
            attempts: 0,
            message: message.to_string(),
            file_name: None,
            updated_at: Utc::now(),
        }
    }

    pub fn pending(id: &ContentId) -> Self {
        Self::new(id, TaskState::Pending, "Queued")
    }

    pub fn ready(id: &ContentId, file_name: String) -> Self {
        let mut record = Self::new(id, TaskState::Succeeded, "Cached");
        record.file_name = Some(file_name);
        record
    }
}

#[derive(Default)]
pub struct TaskBoard {
    records: Mutex<HashMap<ContentId, TaskRecord>>,
}

impl TaskBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &ContentId) -> Option<TaskRecord> {
        self.records.lock().get(id).cloned()
    }

    pub fn mark_pending(&self, id: &ContentId) {
        self.records
            .lock()
            .insert(id.clone(), TaskRecord::pending(id));
    }

    pub fn mark_running(&self, id: &ContentId) {
        self.update(id, |record| {
            record.state = TaskState::Running;
            record.message = "Downloading".to_string();
        });
    }

    pub fn record_attempt(&self, id: &ContentId, bundle: &str) {
        self.update(id, |record| {
            record.attempts += 1;
            record.message = format!("Attempt {} ({bundle})", record.attempts);
        });
    }

    pub fn mark_succeeded(&self, id: &ContentId, file_name: String) {
        self.update(id, |record| {
            record.state = TaskState::Succeeded;
            record.message = "Done".to_string();
            record.file_name = Some(file_name);
        });
    }

    /// Records a cache hit that needed no fetch.
    pub fn mark_cached(&self, id: &ContentId, file_name: String) -> TaskRecord {
        let record = TaskRecord::ready(id, file_name);
        self.records.lock().insert(id.clone(), record.clone());
        record
    }

    pub fn mark_failed(&self, id: &ContentId, message: &str) {
        self.update(id, |record| {
            record.state = TaskState::Failed;
            record.message = message.to_string();
            record.file_name = None;
        });
    }

    /// Fails the record unless it already reached a terminal state. Returns
    /// whether anything changed.
    pub fn fail_unfinished(&self, id: &ContentId, message: &str) -> bool {
        let mut records = self.records.lock();
        match records.get_mut(id) {
            Some(record) if !record.state.is_finished() => {
                record.state = TaskState::Failed;
                record.message = message.to_string();
                record.file_name = None;
                record.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    /// Drops finished records that have not changed for `max_age`.
    pub fn prune(&self, max_age: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, record| !(record.state.is_finished() && record.updated_at <= cutoff));
        before - records.len()
    }

    fn update(&self, id: &ContentId, apply: impl FnOnce(&mut TaskRecord)) {
        let mut records = self.records.lock();
        let record = records
            .entry(id.clone())
            .or_insert_with(|| TaskRecord::pending(id));
        apply(record);
        record.updated_at = Utc::now();
    }
}

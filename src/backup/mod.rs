pub mod scheduler;
pub mod task_manager;
pub mod task_processor;

pub use scheduler::CronSchedule;
pub use task_manager::TaskManager;
pub use task_processor::{BackupTaskProcessor, TaskProcessor};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Syncing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Syncing => "syncing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Status only moves forward, except that a failed or completed task
    /// may be restarted.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running | Syncing | Failed)
                | (Running, Running | Completed | Failed)
                | (Syncing, Completed | Failed)
                | (Failed, Running | Syncing)
                | (Completed, Running | Syncing)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configured backup or sync operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupTask {
    pub id: String,
    pub source_path: String,
    pub provider: String,
    pub destination_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default)]
    pub recurring: bool,
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub encrypt: bool,
    pub created_at: DateTime<Utc>,
    pub status: TaskStatus,
    #[serde(default)]
    pub is_single: bool,
    #[serde(default)]
    pub is_sync: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Payload key for this execution; custody is the credential vault's
    #[serde(skip)]
    pub encryption_key: Option<String>,

    /// Per-file sync sub-task, never written to the task list
    #[serde(skip)]
    pub transient: bool,
}

impl BackupTask {
    pub fn is_scheduled(&self) -> bool {
        self.schedule.as_deref().is_some_and(|s| !s.trim().is_empty())
    }
}

/// Client request for a new task.
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    pub source_path: String,
    pub provider: String,
    pub destination_path: String,
    pub schedule: Option<String>,
    pub recurring: bool,
    pub compress: bool,
    pub encrypt: bool,
    pub encryption_key: Option<String>,
    pub is_single: bool,
    pub is_sync: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Syncing));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Syncing.can_transition_to(Completed));
        assert!(Failed.can_transition_to(Running));
        assert!(Completed.can_transition_to(Running));
        assert!(Failed.can_transition_to(Syncing));
        assert!(Completed.can_transition_to(Syncing));

        assert!(!Completed.can_transition_to(Pending));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Syncing.can_transition_to(Running));
    }

    #[test]
    fn test_task_json_shape() {
        let task = BackupTask {
            id: "t1".into(),
            source_path: "/tmp/a.txt".into(),
            provider: "gdrive".into(),
            destination_path: "/backups".into(),
            schedule: None,
            recurring: false,
            compress: true,
            encrypt: true,
            created_at: Utc::now(),
            status: TaskStatus::Pending,
            is_single: true,
            is_sync: false,
            error_message: None,
            encryption_key: Some("secret-key".into()),
            transient: false,
        };

        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains("\"status\":\"pending\""));
        assert!(!json.contains("secret-key"));

        let back: BackupTask = serde_json::from_str(&json).unwrap();
        assert_eq!(back.encryption_key, None);
        assert_eq!(back.source_path, task.source_path);
    }
}

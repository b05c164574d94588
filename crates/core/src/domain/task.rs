use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::user::UserId;
use crate::errors::DomainError;

pub const MAX_TITLE_CHARS: usize = 200;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub i64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// The only edges of the task graph. Terminal states have no outgoing edges.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (Self::Pending, Self::Cancelled)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "urgent" => Some(Self::Urgent),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub created_by: UserId,
    pub assignee: UserId,
    pub channel_id: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub dependencies: Vec<TaskId>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Incremented by the gateway on every accepted write.
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub task: Task,
}

impl Task {
    /// Applies a status change to a copy of this task. Stored version is left
    /// untouched; the gateway bumps it when the write is accepted.
    pub fn transition(&self, to: TaskStatus, now: DateTime<Utc>) -> Result<TaskTransition, DomainError> {
        if !self.status.can_transition_to(to) {
            return Err(DomainError::InvalidTransition { from: self.status, to });
        }

        let mut next = self.clone();
        next.status = to;
        next.updated_at = now;
        if to == TaskStatus::Completed && next.completed_at.is_none() {
            next.completed_at = Some(now);
        }

        Ok(TaskTransition { from: self.status, to, task: next })
    }

    pub fn involves(&self, user: UserId) -> bool {
        self.created_by == user || self.assignee == user
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
    pub priority: TaskPriority,
    pub created_by: UserId,
    pub assignee: UserId,
    pub channel_id: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub dependencies: Vec<TaskId>,
}

impl NewTask {
    pub fn for_user(user: UserId, title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: None,
            priority: TaskPriority::default(),
            created_by: user,
            assignee: user,
            channel_id: None,
            due_date: None,
            dependencies: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        let title = self.title.trim();
        if title.is_empty() {
            return Err(DomainError::Validation("task title is required".to_owned()));
        }
        if title.chars().count() > MAX_TITLE_CHARS {
            return Err(DomainError::Validation(format!(
                "task title must be at most {MAX_TITLE_CHARS} characters"
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub completed_since: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{NewTask, Task, TaskId, TaskPriority, TaskStatus};
    use crate::domain::user::UserId;
    use crate::errors::DomainError;

    const ALL: [TaskStatus; 4] =
        [TaskStatus::Pending, TaskStatus::InProgress, TaskStatus::Completed, TaskStatus::Cancelled];

    fn task(status: TaskStatus) -> Task {
        let created = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().expect("valid timestamp");
        Task {
            id: TaskId(7),
            title: "draft report".to_owned(),
            description: None,
            status,
            priority: TaskPriority::Medium,
            created_by: UserId(1),
            assignee: UserId(1),
            channel_id: None,
            due_date: None,
            dependencies: Vec::new(),
            completed_at: None,
            version: 1,
            created_at: created,
            updated_at: created,
        }
    }

    #[test]
    fn only_four_edges_are_allowed() {
        let allowed = [
            (TaskStatus::Pending, TaskStatus::InProgress),
            (TaskStatus::Pending, TaskStatus::Cancelled),
            (TaskStatus::InProgress, TaskStatus::Completed),
            (TaskStatus::InProgress, TaskStatus::Cancelled),
        ];

        for from in ALL {
            for to in ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "unexpected verdict for {from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn terminal_states_reject_every_transition() {
        for from in [TaskStatus::Completed, TaskStatus::Cancelled] {
            let current = task(from);
            for to in ALL {
                let error = current.transition(to, Utc::now()).expect_err("terminal state");
                assert_eq!(error, DomainError::InvalidTransition { from, to });
            }
        }
    }

    #[test]
    fn completing_sets_completed_at_once() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).single().expect("valid timestamp");
        let started = task(TaskStatus::InProgress);

        let done = started.transition(TaskStatus::Completed, now).expect("complete");
        assert_eq!(done.from, TaskStatus::InProgress);
        assert_eq!(done.task.completed_at, Some(now));
        assert_eq!(done.task.version, started.version);

        let later = now + Duration::hours(1);
        assert!(done.task.transition(TaskStatus::InProgress, later).is_err());
        assert_eq!(done.task.completed_at, Some(now));
    }

    #[test]
    fn cancelling_leaves_completed_at_empty() {
        let cancelled =
            task(TaskStatus::Pending).transition(TaskStatus::Cancelled, Utc::now()).expect("cancel");
        assert_eq!(cancelled.task.status, TaskStatus::Cancelled);
        assert!(cancelled.task.completed_at.is_none());
    }

    #[test]
    fn new_task_requires_a_title() {
        let blank = NewTask::for_user(UserId(1), "   ");
        assert!(matches!(blank.validate(), Err(DomainError::Validation(_))));

        let long = NewTask::for_user(UserId(1), "x".repeat(201));
        assert!(long.validate().is_err());

        assert!(NewTask::for_user(UserId(1), "draft report").validate().is_ok());
    }

    #[test]
    fn status_storage_encoding_round_trips() {
        for status in ALL {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskId(12).to_string(), "#12");
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::task::TaskId;
use crate::domain::user::UserId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeEntryId(pub i64);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeEntry {
    pub id: TimeEntryId,
    pub user_id: UserId,
    pub task_id: Option<TaskId>,
    pub description: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl TimeEntry {
    /// Closes the entry at `at`. Duration never goes negative even if clocks
    /// disagree between writers.
    pub fn stopped_at(&self, at: DateTime<Utc>) -> TimeEntry {
        let end = at.max(self.start_time);
        let mut stopped = self.clone();
        stopped.end_time = Some(end);
        stopped.duration_seconds = Some((end - self.start_time).num_seconds());
        stopped.is_active = false;
        stopped
    }

    /// Seconds tracked so far, counting an active entry up to `now`.
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> i64 {
        match self.duration_seconds {
            Some(seconds) => seconds,
            None => (now.max(self.start_time) - self.start_time).num_seconds(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewTimeEntry {
    pub user_id: UserId,
    pub task_id: Option<TaskId>,
    pub description: Option<String>,
}

/// Result of starting a timer: whatever was running before, and the new entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimeEntryStart {
    pub stopped: Vec<TimeEntry>,
    pub started: TimeEntry,
}

pub fn format_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    if hours > 0 {
        format!("{hours}h {minutes:02}m")
    } else {
        format!("{minutes}m")
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{format_duration, TimeEntry, TimeEntryId};
    use crate::domain::user::UserId;

    fn active_entry() -> TimeEntry {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().expect("valid timestamp");
        TimeEntry {
            id: TimeEntryId(1),
            user_id: UserId(1),
            task_id: None,
            description: None,
            start_time: start,
            end_time: None,
            duration_seconds: None,
            is_active: true,
            created_at: start,
        }
    }

    #[test]
    fn stopping_derives_duration_from_bounds() {
        let entry = active_entry();
        let end = entry.start_time + Duration::minutes(95);
        let stopped = entry.stopped_at(end);

        assert!(!stopped.is_active);
        assert_eq!(stopped.end_time, Some(end));
        assert_eq!(stopped.duration_seconds, Some(95 * 60));
    }

    #[test]
    fn stop_before_start_clamps_to_zero() {
        let entry = active_entry();
        let stopped = entry.stopped_at(entry.start_time - Duration::seconds(5));
        assert_eq!(stopped.duration_seconds, Some(0));
        assert_eq!(stopped.end_time, Some(entry.start_time));
    }

    #[test]
    fn elapsed_counts_running_entries() {
        let entry = active_entry();
        assert_eq!(entry.elapsed_seconds(entry.start_time + Duration::seconds(42)), 42);
        assert_eq!(format_duration(3_725), "1h 02m");
        assert_eq!(format_duration(59), "0m");
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::info;

use crate::clock::Clock;
use crate::domain::task::TaskId;
use crate::domain::time_entry::{NewTimeEntry, TimeEntry, TimeEntryStart};
use crate::domain::user::UserId;
use crate::errors::ApplicationError;
use crate::gateway::{GatewayError, TimeEntryGateway};
use crate::retry::RetryPolicy;

/// Owns start/stop of time entries. Calls for the same user are serialized;
/// different users never wait on each other.
pub struct TimeEntryLifecycleManager {
    gateway: Arc<dyn TimeEntryGateway>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    user_locks: Mutex<HashMap<UserId, Arc<AsyncMutex<()>>>>,
}

struct UserSection<'a> {
    manager: &'a TimeEntryLifecycleManager,
    user: UserId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UserSection<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.manager.release_lock(self.user);
    }
}

impl TimeEntryLifecycleManager {
    pub fn new(
        gateway: Arc<dyn TimeEntryGateway>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
    ) -> Self {
        Self { gateway, clock, retry, user_locks: Mutex::new(HashMap::new()) }
    }

    /// Stops whatever the user has running and starts a new active entry.
    pub async fn start(
        &self,
        user: UserId,
        task_id: Option<TaskId>,
        description: Option<String>,
    ) -> Result<TimeEntryStart, ApplicationError> {
        let _section = self.enter(user).await;
        let entry = NewTimeEntry { user_id: user, task_id, description };
        let at = self.clock.now();
        let gateway = self.gateway.as_ref();
        let pending = &entry;

        let started = self
            .retry
            .run("time_entry.start", GatewayError::is_transient, move || {
                gateway.start_exclusive(pending.clone(), at)
            })
            .await?;

        info!(
            event_name = "core.time_entry.started",
            user_id = user.0,
            entry_id = started.started.id.0,
            task_id = started.started.task_id.map(|id| id.0),
            auto_stopped = started.stopped.len(),
            "time entry started"
        );
        Ok(started)
    }

    /// Stops every active entry. Nothing running is not an error.
    pub async fn stop_active(&self, user: UserId) -> Result<Vec<TimeEntry>, ApplicationError> {
        let _section = self.enter(user).await;
        let at = self.clock.now();
        let gateway = self.gateway.as_ref();

        let stopped = self
            .retry
            .run("time_entry.stop", GatewayError::is_transient, move || {
                gateway.stop_active(user, at)
            })
            .await?;

        if !stopped.is_empty() {
            info!(
                event_name = "core.time_entry.stopped",
                user_id = user.0,
                stopped = stopped.len(),
                "time entries stopped"
            );
        }
        Ok(stopped)
    }

    pub async fn active(&self, user: UserId) -> Result<Option<TimeEntry>, ApplicationError> {
        let gateway = self.gateway.as_ref();
        let active = self
            .retry
            .run("time_entry.active", GatewayError::is_transient, move || gateway.find_active(user))
            .await?;
        Ok(active.into_iter().max_by_key(|entry| entry.start_time))
    }

    pub async fn entries_since(
        &self,
        user: UserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<TimeEntry>, ApplicationError> {
        let gateway = self.gateway.as_ref();
        Ok(self
            .retry
            .run("time_entry.list", GatewayError::is_transient, move || {
                gateway.list_since(user, since)
            })
            .await?)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn enter(&self, user: UserId) -> UserSection<'_> {
        let lock = {
            let mut locks = match self.user_locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks.entry(user).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
        };
        let guard = lock.lock_owned().await;
        UserSection { manager: self, user, guard: Some(guard) }
    }

    fn release_lock(&self, user: UserId) {
        let mut locks = match self.user_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // only the map still holds it: nobody is inside or waiting
        if locks.get(&user).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&user);
        }
    }

    #[cfg(test)]
    fn tracked_users(&self) -> usize {
        match self.user_locks.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};

    use super::TimeEntryLifecycleManager;
    use crate::clock::SystemClock;
    use crate::domain::time_entry::{NewTimeEntry, TimeEntry, TimeEntryId, TimeEntryStart};
    use crate::domain::user::UserId;
    use crate::gateway::{GatewayError, TimeEntryGateway};
    use crate::retry::RetryPolicy;

    /// Deliberately non-atomic gateway: it yields between reading and writing,
    /// so only the manager's per-user section keeps entries exclusive.
    #[derive(Default)]
    struct SlowGateway {
        entries: Mutex<Vec<TimeEntry>>,
        next_id: AtomicUsize,
        max_active_seen: AtomicUsize,
    }

    impl SlowGateway {
        fn active_for(&self, user: UserId) -> Vec<TimeEntry> {
            self.entries
                .lock()
                .expect("lock")
                .iter()
                .filter(|entry| entry.user_id == user && entry.is_active)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl TimeEntryGateway for SlowGateway {
        async fn find_active(&self, user: UserId) -> Result<Vec<TimeEntry>, GatewayError> {
            Ok(self.active_for(user))
        }

        async fn start_exclusive(
            &self,
            entry: NewTimeEntry,
            at: DateTime<Utc>,
        ) -> Result<TimeEntryStart, GatewayError> {
            let stopped = self.stop_active(entry.user_id, at).await?;
            tokio::time::sleep(Duration::from_millis(2)).await;
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) as i64 + 1;
            let started = TimeEntry {
                id: TimeEntryId(id),
                user_id: entry.user_id,
                task_id: entry.task_id,
                description: entry.description,
                start_time: at,
                end_time: None,
                duration_seconds: None,
                is_active: true,
                created_at: at,
            };
            let mut entries = self.entries.lock().expect("lock");
            entries.push(started.clone());
            let active =
                entries.iter().filter(|e| e.user_id == started.user_id && e.is_active).count();
            self.max_active_seen.fetch_max(active, Ordering::SeqCst);
            Ok(TimeEntryStart { stopped, started })
        }

        async fn stop_active(
            &self,
            user: UserId,
            at: DateTime<Utc>,
        ) -> Result<Vec<TimeEntry>, GatewayError> {
            let active = self.active_for(user);
            tokio::time::sleep(Duration::from_millis(1)).await;
            let mut entries = self.entries.lock().expect("lock");
            let mut stopped = Vec::new();
            for entry in entries.iter_mut().filter(|e| e.user_id == user && e.is_active) {
                if active.iter().any(|seen| seen.id == entry.id) {
                    *entry = entry.stopped_at(at);
                    stopped.push(entry.clone());
                }
            }
            Ok(stopped)
        }

        async fn list_since(
            &self,
            user: UserId,
            since: DateTime<Utc>,
        ) -> Result<Vec<TimeEntry>, GatewayError> {
            Ok(self
                .entries
                .lock()
                .expect("lock")
                .iter()
                .filter(|e| e.user_id == user && e.start_time >= since)
                .cloned()
                .collect())
        }
    }

    fn manager(gateway: Arc<SlowGateway>) -> TimeEntryLifecycleManager {
        TimeEntryLifecycleManager::new(gateway, Arc::new(SystemClock), RetryPolicy::none())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_for_one_user_leave_one_active_entry() {
        let gateway = Arc::new(SlowGateway::default());
        let manager = Arc::new(manager(gateway.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.start(UserId(1), None, None).await })
            })
            .collect();
        for handle in handles {
            handle.await.expect("join").expect("start should succeed");
        }

        assert_eq!(gateway.active_for(UserId(1)).len(), 1);
        assert_eq!(gateway.max_active_seen.load(Ordering::SeqCst), 1);
        assert_eq!(manager.tracked_users(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn different_users_each_keep_their_own_active_entry() {
        let gateway = Arc::new(SlowGateway::default());
        let manager = Arc::new(manager(gateway.clone()));

        let handles: Vec<_> = (1..=4)
            .map(|user| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.start(UserId(user), None, None).await })
            })
            .collect();
        for handle in handles {
            handle.await.expect("join").expect("start should succeed");
        }

        for user in 1..=4 {
            assert_eq!(gateway.active_for(UserId(user)).len(), 1);
        }
    }

    #[tokio::test]
    async fn stop_without_active_entry_is_a_no_op() {
        let gateway = Arc::new(SlowGateway::default());
        let manager = manager(gateway);

        let stopped = manager.stop_active(UserId(9)).await.expect("stop should not fail");
        assert!(stopped.is_empty());
        assert!(manager.active(UserId(9)).await.expect("active").is_none());
    }

    #[tokio::test]
    async fn entries_since_filters_by_start_time() {
        let gateway = Arc::new(SlowGateway::default());
        let manager = manager(gateway);
        manager.start(UserId(3), None, Some("review".to_owned())).await.expect("start");

        let since = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).single().expect("timestamp");
        let entries = manager.entries_since(UserId(3), since).await.expect("list");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].description.as_deref(), Some("review"));
    }
}

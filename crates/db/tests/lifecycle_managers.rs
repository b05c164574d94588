use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use dona_core::clock::ManualClock;
use dona_core::domain::task::{NewTask, TaskStatus};
use dona_core::domain::user::{PlatformIdentity, UserId};
use dona_core::errors::{ApplicationError, DomainError};
use dona_core::gateway::UserGateway;
use dona_core::lifecycle::{TaskLifecycleManager, TaskUpdate, TimeEntryLifecycleManager};
use dona_core::retry::RetryPolicy;
use dona_db::{
    connect_with_settings, migrations, DbPool, InMemoryTaskRepository, SqlTaskRepository,
    SqlTimeEntryRepository, SqlUserRepository,
};

fn start_of_day() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().expect("valid timestamp")
}

async fn setup() -> DbPool {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
    migrations::run_pending(&pool).await.expect("run migrations");
    pool
}

async fn seeded_user(pool: &DbPool, platform_user_id: &str) -> UserId {
    SqlUserRepository::new(pool.clone())
        .get_or_create(&PlatformIdentity::new(platform_user_id, "T1"), start_of_day())
        .await
        .expect("seed user")
        .id
}

#[tokio::test]
async fn created_task_is_pending_and_completes_exactly_once() {
    let pool = setup().await;
    let user = seeded_user(&pool, "U1").await;
    let clock = Arc::new(ManualClock::new(start_of_day()));
    let manager = TaskLifecycleManager::new(
        Arc::new(SqlTaskRepository::new(pool)),
        clock.clone(),
        RetryPolicy::none(),
    );

    let task = manager.create(NewTask::for_user(user, "draft report")).await.expect("create");
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.completed_at.is_none());

    clock.advance(Duration::minutes(30));
    let update = manager.complete(task.id, user).await.expect("complete");
    let TaskUpdate::Applied(transition) = update else {
        panic!("completion should be applied, got {update:?}");
    };
    assert_eq!(transition.from, TaskStatus::InProgress);
    assert_eq!(transition.task.status, TaskStatus::Completed);
    let completed_at = transition.task.completed_at.expect("completed_at should be set");
    assert_eq!(completed_at, start_of_day() + Duration::minutes(30));

    clock.advance(Duration::minutes(5));
    let again = manager.complete(task.id, user).await.expect("repeat completion");
    assert!(matches!(again, TaskUpdate::AlreadyInState(ref task) if task.status == TaskStatus::Completed));

    let stored = manager.get(task.id).await.expect("reload");
    assert_eq!(stored.completed_at, Some(completed_at));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_completions_apply_once() {
    let clock = Arc::new(ManualClock::new(start_of_day()));
    let manager = Arc::new(TaskLifecycleManager::new(
        Arc::new(InMemoryTaskRepository::default()),
        clock,
        RetryPolicy::none(),
    ));
    let user = UserId(1);
    let task = manager.create(NewTask::for_user(user, "ship release")).await.expect("create");
    manager.start(task.id, user).await.expect("start");
    let task_id = task.id;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.complete(task_id, user).await })
        })
        .collect();

    let mut applied = 0;
    let mut superseded = 0;
    for handle in handles {
        match handle.await.expect("join") {
            Ok(TaskUpdate::Applied(_)) => applied += 1,
            Ok(TaskUpdate::AlreadyInState(task)) => {
                assert_eq!(task.status, TaskStatus::Completed);
                superseded += 1;
            }
            Err(other) => panic!("completion race must not fail, got {other:?}"),
        }
    }

    assert_eq!(applied, 1);
    assert_eq!(superseded, 7);
    let stored = manager.get(task.id).await.expect("reload");
    assert_eq!(stored.status, TaskStatus::Completed);
    // create, start, complete
    assert_eq!(stored.version, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_completions_of_a_pending_task_never_fail() {
    let manager = Arc::new(TaskLifecycleManager::new(
        Arc::new(InMemoryTaskRepository::default()),
        Arc::new(ManualClock::new(start_of_day())),
        RetryPolicy::none(),
    ));
    let user = UserId(1);

    for round in 0..300 {
        let task = manager.create(NewTask::for_user(user, "pair review")).await.expect("create");
        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.complete(task.id, user).await })
        };
        let second = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.complete(task.id, user).await })
        };

        let outcomes = [first.await.expect("join"), second.await.expect("join")];
        let applied = outcomes
            .iter()
            .map(|outcome| match outcome {
                Ok(TaskUpdate::Applied(_)) => 1,
                Ok(TaskUpdate::AlreadyInState(task)) => {
                    assert_eq!(task.status, TaskStatus::Completed);
                    0
                }
                Err(error) => panic!("round {round}: completion failed with {error:?}"),
            })
            .sum::<u32>();
        assert_eq!(applied, 1, "round {round}: exactly one completion applies");

        let stored = manager.get(task.id).await.expect("reload");
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(stored.completed_at.is_some());
    }
}

#[tokio::test]
async fn stale_expected_version_is_a_conflict() {
    let manager = TaskLifecycleManager::new(
        Arc::new(InMemoryTaskRepository::default()),
        Arc::new(ManualClock::new(start_of_day())),
        RetryPolicy::none(),
    );
    let user = UserId(1);
    let task = manager.create(NewTask::for_user(user, "review")).await.expect("create");

    manager.transition(task.id, TaskStatus::InProgress, user, task.version).await.expect("first");
    let error = manager
        .transition(task.id, TaskStatus::Cancelled, user, task.version)
        .await
        .expect_err("stale version");

    assert!(matches!(error, ApplicationError::Conflict { entity: "task", .. }));
}

#[tokio::test]
async fn tasks_of_other_users_cannot_be_changed() {
    let manager = TaskLifecycleManager::new(
        Arc::new(InMemoryTaskRepository::default()),
        Arc::new(ManualClock::new(start_of_day())),
        RetryPolicy::none(),
    );
    let task = manager.create(NewTask::for_user(UserId(1), "private")).await.expect("create");

    let error = manager.cancel(task.id, UserId(2)).await.expect_err("not the owner");
    assert!(matches!(error, ApplicationError::Domain(DomainError::Validation(_))));
    assert_eq!(manager.get(task.id).await.expect("reload").status, TaskStatus::Pending);
}

#[tokio::test]
async fn cancelled_task_cannot_be_restarted() {
    let manager = TaskLifecycleManager::new(
        Arc::new(InMemoryTaskRepository::default()),
        Arc::new(ManualClock::new(start_of_day())),
        RetryPolicy::none(),
    );
    let user = UserId(1);
    let task = manager.create(NewTask::for_user(user, "drop me")).await.expect("create");

    manager.cancel(task.id, user).await.expect("cancel");
    let error = manager.start(task.id, user).await.expect_err("terminal");
    assert!(matches!(
        error,
        ApplicationError::Domain(DomainError::InvalidTransition { from: TaskStatus::Cancelled, .. })
    ));
}

#[tokio::test]
async fn second_time_start_leaves_one_active_entry() {
    let pool = setup().await;
    let user = seeded_user(&pool, "U1").await;
    let clock = Arc::new(ManualClock::new(start_of_day()));
    let manager = TimeEntryLifecycleManager::new(
        Arc::new(SqlTimeEntryRepository::new(pool)),
        clock.clone(),
        RetryPolicy::none(),
    );

    let first = manager.start(user, None, Some("planning".to_owned())).await.expect("first");
    assert!(first.started.is_active);
    assert!(first.stopped.is_empty());

    clock.advance(Duration::minutes(20));
    let second = manager.start(user, None, Some("writing".to_owned())).await.expect("second");
    assert_eq!(second.stopped.len(), 1);
    assert_eq!(second.stopped[0].id, first.started.id);
    assert_eq!(second.stopped[0].end_time, Some(start_of_day() + Duration::minutes(20)));

    let active = manager.active(user).await.expect("active").expect("one active entry");
    assert_eq!(active.id, second.started.id);
    let entries = manager.entries_since(user, start_of_day()).await.expect("list");
    assert_eq!(entries.iter().filter(|entry| entry.is_active).count(), 1);
}

use std::sync::Arc;

use tracing::{debug, info};

use crate::clock::Clock;
use crate::domain::task::{NewTask, Task, TaskFilter, TaskId, TaskStatus, TaskTransition};
use crate::domain::user::UserId;
use crate::errors::{ApplicationError, DomainError};
use crate::gateway::{GatewayError, TaskGateway};
use crate::retry::RetryPolicy;

/// Outcome of a status change request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskUpdate {
    Applied(TaskTransition),
    /// A concurrent writer already moved the task to the requested status.
    AlreadyInState(Task),
}

impl TaskUpdate {
    pub fn task(&self) -> &Task {
        match self {
            Self::Applied(transition) => &transition.task,
            Self::AlreadyInState(task) => task,
        }
    }
}

/// Sole writer of task rows. Status changes go through the transition graph
/// and are persisted with a version check.
pub struct TaskLifecycleManager {
    gateway: Arc<dyn TaskGateway>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    conflict_retries: u32,
}

impl TaskLifecycleManager {
    pub fn new(gateway: Arc<dyn TaskGateway>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self { gateway, clock, retry, conflict_retries: 3 }
    }

    pub fn with_conflict_retries(mut self, conflict_retries: u32) -> Self {
        self.conflict_retries = conflict_retries;
        self
    }

    pub async fn create(&self, task: NewTask) -> Result<Task, ApplicationError> {
        task.validate()?;
        let now = self.clock.now();
        let gateway = self.gateway.as_ref();
        let pending = &task;

        let created = self
            .retry
            .run("task.insert", GatewayError::is_transient, move || {
                gateway.insert(pending.clone(), now)
            })
            .await?;

        info!(
            event_name = "core.task.created",
            task_id = created.id.0,
            user_id = created.created_by.0,
            priority = created.priority.as_str(),
            "task created"
        );
        Ok(created)
    }

    pub async fn get(&self, id: TaskId) -> Result<Task, ApplicationError> {
        let gateway = self.gateway.as_ref();
        self.retry
            .run("task.find", GatewayError::is_transient, move || gateway.find_by_id(id))
            .await?
            .ok_or_else(|| ApplicationError::NotFound { entity: "task", id: id.to_string() })
    }

    pub async fn list_for_user(
        &self,
        user: UserId,
        filter: &TaskFilter,
    ) -> Result<Vec<Task>, ApplicationError> {
        let gateway = self.gateway.as_ref();
        Ok(self
            .retry
            .run("task.list", GatewayError::is_transient, move || gateway.list_for_user(user, filter))
            .await?)
    }

    /// Single optimistic write against a version the caller already holds.
    /// A stale `expected_version` yields `ApplicationError::Conflict`.
    pub async fn transition(
        &self,
        id: TaskId,
        to: TaskStatus,
        actor: UserId,
        expected_version: u32,
    ) -> Result<TaskTransition, ApplicationError> {
        let current = self.get(id).await?;
        ensure_actor(&current, actor)?;
        if current.version != expected_version {
            return Err(ApplicationError::Conflict { entity: "task", id: id.to_string() });
        }
        self.write(&current, to).await
    }

    /// Reads the task and applies `to`, re-reading on conflict. A task that
    /// already sits in `to` is a no-op, whether an earlier request or a
    /// concurrent writer put it there.
    pub async fn apply(
        &self,
        id: TaskId,
        to: TaskStatus,
        actor: UserId,
    ) -> Result<TaskUpdate, ApplicationError> {
        let mut conflicts = 0;
        loop {
            let current = self.get(id).await?;
            ensure_actor(&current, actor)?;
            if current.status == to {
                debug!(
                    event_name = "core.task.transition_superseded",
                    task_id = id.0,
                    status = to.as_str(),
                    conflicts,
                    "task already reached requested status"
                );
                return Ok(TaskUpdate::AlreadyInState(current));
            }

            match self.write(&current, to).await {
                Ok(transition) => return Ok(TaskUpdate::Applied(transition)),
                Err(ApplicationError::Conflict { .. }) if conflicts < self.conflict_retries => {
                    conflicts += 1;
                    debug!(
                        event_name = "core.task.version_conflict",
                        task_id = id.0,
                        attempt = conflicts,
                        "task changed underneath us; re-reading"
                    );
                }
                Err(error) => return Err(error),
            }
        }
    }

    pub async fn start(&self, id: TaskId, actor: UserId) -> Result<TaskUpdate, ApplicationError> {
        self.apply(id, TaskStatus::InProgress, actor).await
    }

    /// Completes the task. A pending task passes through `in_progress` first,
    /// so both edges are recorded.
    pub async fn complete(&self, id: TaskId, actor: UserId) -> Result<TaskUpdate, ApplicationError> {
        let current = self.get(id).await?;
        if current.status == TaskStatus::Pending {
            match self.apply(id, TaskStatus::InProgress, actor).await {
                Ok(_) => {}
                // a concurrent completion got there first; the next read sees it
                Err(ApplicationError::Domain(DomainError::InvalidTransition {
                    from: TaskStatus::Completed,
                    ..
                })) => {}
                Err(error) => return Err(error),
            }
        }
        self.apply(id, TaskStatus::Completed, actor).await
    }

    pub async fn cancel(&self, id: TaskId, actor: UserId) -> Result<TaskUpdate, ApplicationError> {
        self.apply(id, TaskStatus::Cancelled, actor).await
    }

    async fn write(&self, current: &Task, to: TaskStatus) -> Result<TaskTransition, ApplicationError> {
        let transition = current.transition(to, self.clock.now())?;
        let gateway = self.gateway.as_ref();
        let next = &transition.task;
        let expected = current.version;

        let stored = self
            .retry
            .run("task.update", GatewayError::is_transient, move || gateway.update(next, expected))
            .await?;

        info!(
            event_name = "core.task.transition_applied",
            task_id = stored.id.0,
            from = transition.from.as_str(),
            to = transition.to.as_str(),
            version = stored.version,
            "task transition applied"
        );
        Ok(TaskTransition { from: transition.from, to: transition.to, task: stored })
    }
}

fn ensure_actor(task: &Task, actor: UserId) -> Result<(), ApplicationError> {
    if task.involves(actor) {
        Ok(())
    } else {
        Err(DomainError::Validation(format!("task {} does not belong to you", task.id)).into())
    }
}

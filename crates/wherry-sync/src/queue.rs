use crate::SyncError;
use chrono::Utc;
use uuid::Uuid;
use wherry_core::{SyncErrorKind, SyncTask, TaskStatus};
use wherry_storage::Store;

/// Typed surface over the persisted task table, enforcing the status
/// state machine: pending -> processing -> completed | failed, with no
/// edge out of a terminal status.
#[derive(Clone)]
pub struct SyncQueue {
    store: Store,
}

impl SyncQueue {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Idempotent per account: while a pending or processing task
    /// exists, enqueueing again raises its priority to the max of the
    /// two and returns the existing id. The store's partial unique
    /// index backstops the check.
    pub async fn enqueue(&self, account_id: Uuid, priority: i32) -> Result<Uuid, SyncError> {
        if let Some(existing) = self.store.find_live_task(account_id).await? {
            if priority > existing.priority {
                self.store
                    .raise_task_priority(existing.id, priority)
                    .await?;
            }
            return Ok(existing.id);
        }

        let now = Utc::now();
        let task = SyncTask {
            id: Uuid::new_v4(),
            account_id,
            priority,
            status: TaskStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.store.insert_task(&task).await?;
        Ok(task.id)
    }

    /// The `n` dispatchable tasks, highest priority first, oldest
    /// first within a priority. Read-only: dispatch claims each task
    /// via [`mark_processing`].
    ///
    /// [`mark_processing`]: SyncQueue::mark_processing
    pub async fn take_batch(&self, n: usize) -> Result<Vec<SyncTask>, SyncError> {
        Ok(self.store.due_tasks(n as i64).await?)
    }

    pub async fn mark_processing(&self, task_id: Uuid) -> Result<(), SyncError> {
        Ok(self
            .store
            .transition_task(task_id, &[TaskStatus::Pending], TaskStatus::Processing, None)
            .await?)
    }

    pub async fn mark_completed(&self, task_id: Uuid) -> Result<(), SyncError> {
        Ok(self
            .store
            .transition_task(
                task_id,
                &[TaskStatus::Processing],
                TaskStatus::Completed,
                None,
            )
            .await?)
    }

    pub async fn mark_failed(
        &self,
        task_id: Uuid,
        kind: SyncErrorKind,
        message: &str,
    ) -> Result<(), SyncError> {
        Ok(self
            .store
            .transition_task(
                task_id,
                &[TaskStatus::Processing],
                TaskStatus::Failed,
                Some(format!("{}: {message}", kind.as_str())),
            )
            .await?)
    }

    pub async fn task(&self, task_id: Uuid) -> Result<Option<SyncTask>, SyncError> {
        Ok(self.store.get_task(task_id).await?)
    }
}

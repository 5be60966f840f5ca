//! The compute engine queue. The public API for submitting, claiming and
//! archiving tasks.
//!
//! All state transitions go through [`CeQueue`]. Every operation is one short
//! storage transaction; the claim itself is a conditional update, so a task
//! is never handed to two workers even when several processes share the
//! database file.

pub mod gate;
pub mod status;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::*;
use crate::ports::*;
use crate::storage::{Storage, TxContext};
use crate::telemetry::task::{record_state_transition, start_task_span};

pub use gate::Gates;
pub use status::QueueStatusSnapshot;

use status::QueueMonitor;

/// Tunables of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    /// Claims allowed per task. A pending task claimed this many times is
    /// worn out and only leaves the queue through cancellation.
    pub max_execution_count: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_execution_count: 2,
        }
    }
}

/// The task queue. Owns the storage, the gates and the monitoring counters.
///
/// `CeQueue` is `Send + Sync`; share it between workers with an `Arc`.
pub struct CeQueue {
    storage: Mutex<Storage>,
    gates: Gates,
    settings: QueueSettings,
    uuid_factory: Arc<dyn UuidFactory>,
    components: Arc<dyn ComponentResolver>,
    default_organization: Arc<dyn DefaultOrganizationProvider>,
    clock: Arc<dyn Clock>,
    monitor: QueueMonitor,
}

/// Builder for [`CeQueue`]. Every collaborator has a default.
pub struct CeQueueBuilder {
    storage: Storage,
    settings: QueueSettings,
    uuid_factory: Arc<dyn UuidFactory>,
    components: Arc<dyn ComponentResolver>,
    default_organization: Arc<dyn DefaultOrganizationProvider>,
    clock: Arc<dyn Clock>,
}

impl CeQueueBuilder {
    pub fn settings(mut self, settings: QueueSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn uuid_factory(mut self, factory: Arc<dyn UuidFactory>) -> Self {
        self.uuid_factory = factory;
        self
    }

    pub fn components(mut self, components: Arc<dyn ComponentResolver>) -> Self {
        self.components = components;
        self
    }

    pub fn default_organization(mut self, provider: Arc<dyn DefaultOrganizationProvider>) -> Self {
        self.default_organization = provider;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> CeQueue {
        CeQueue {
            storage: Mutex::new(self.storage),
            gates: Gates::default(),
            settings: self.settings,
            uuid_factory: self.uuid_factory,
            components: self.components,
            default_organization: self.default_organization,
            clock: self.clock,
            monitor: QueueMonitor::new(),
        }
    }
}

impl CeQueue {
    pub fn builder(storage: Storage) -> CeQueueBuilder {
        CeQueueBuilder {
            storage,
            settings: QueueSettings::default(),
            uuid_factory: Arc::new(UuidV4Factory),
            components: Arc::new(NoComponents),
            default_organization: Arc::new(StaticOrganization::default()),
            clock: Arc::new(SystemClock),
        }
    }

    /// Create a queue with in-memory storage (for testing).
    pub fn in_memory() -> Result<Self> {
        Ok(Self::builder(Storage::in_memory()?).build())
    }

    /// Create a queue backed by a file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::builder(Storage::open(path)?).build())
    }

    pub fn settings(&self) -> QueueSettings {
        self.settings
    }

    fn storage(&self) -> Result<MutexGuard<'_, Storage>> {
        self.storage
            .lock()
            .map_err(|_| Error::Other("storage lock poisoned".to_string()))
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Start building a submission. The uuid is assigned here.
    pub fn prepare_submit(&self) -> SubmissionBuilder {
        SubmissionBuilder::new(self.uuid_factory.new_uuid())
    }

    /// Enqueue a task.
    ///
    /// Fails with [`Error::SubmitPaused`] while the submit gate is closed.
    pub fn submit(&self, submission: Submission) -> Result<TaskHandle> {
        if self.gates.is_submit_paused() {
            return Err(Error::SubmitPaused);
        }
        self.submit_one(&submission)
    }

    /// Enqueue several tasks, returning handles in input order.
    ///
    /// The submit gate is checked once up front. Each submission is its own
    /// transaction: when element k fails, elements before it stay queued.
    pub fn mass_submit(&self, submissions: Vec<Submission>) -> Result<Vec<TaskHandle>> {
        if self.gates.is_submit_paused() {
            return Err(Error::SubmitPaused);
        }
        submissions.iter().map(|s| self.submit_one(s)).collect()
    }

    fn submit_one(&self, submission: &Submission) -> Result<TaskHandle> {
        let entry = QueueEntry::pending(submission, self.clock.now());
        let handle = self.to_handle(&entry)?;

        self.storage()?
            .with_transaction(|ctx| ctx.insert_queue_entry(&entry))?;

        self.monitor.on_submitted(&entry.task_type);
        debug!(
            uuid = %entry.uuid,
            task_type = %entry.task_type,
            component = ?entry.component_uuid,
            "task submitted"
        );
        Ok(handle)
    }

    // -----------------------------------------------------------------------
    // Claiming
    // -----------------------------------------------------------------------

    /// Claim the oldest eligible pending task for `worker_uuid`.
    ///
    /// Returns `None` when the peek gate is closed or nothing is eligible. A
    /// task is eligible while pending with fewer than `max_execution_count`
    /// claims; ties on creation time go to the earlier insertion.
    pub fn peek(&self, worker_uuid: &str) -> Result<Option<TaskHandle>> {
        if worker_uuid.is_empty() {
            return Err(Error::InvalidArgument(
                "worker uuid can't be empty".to_string(),
            ));
        }
        if self.gates.is_peek_paused() {
            return Ok(None);
        }

        let now = self.clock.now();
        let max = self.settings.max_execution_count;
        // The handle is built before commit: a resolver error rolls the claim back.
        let claimed = self.storage()?.with_transaction(|ctx| {
            let Some(candidate) = ctx.next_eligible(max)? else {
                return Ok(None);
            };
            if !ctx.claim(&candidate.uuid, candidate.execution_count, worker_uuid, now)? {
                return Ok(None);
            }
            let Some(entry) = ctx.get_queue_entry(&candidate.uuid)? else {
                return Ok(None);
            };
            let handle = self.to_handle(&entry)?;
            Ok(Some((entry, handle)))
        })?;

        let Some((entry, handle)) = claimed else {
            return Ok(None);
        };

        let span = start_task_span("peek", &entry.uuid);
        record_state_transition(
            &span,
            QueueStatus::Pending.as_str(),
            QueueStatus::InProgress.as_str(),
        );
        span.in_scope(|| {
            debug!(
                worker = %worker_uuid,
                execution_count = entry.execution_count,
                "task claimed"
            );
        });
        self.monitor.on_claimed(&entry.task_type);

        Ok(Some(handle))
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    /// Archive a task with its outcome and drop it from the queue.
    ///
    /// `error` is only accepted with [`ActivityStatus::Failed`]. Removing a
    /// task that is no longer queued is an illegal-state error, so a second
    /// call for the same uuid always fails.
    pub fn remove(
        &self,
        task: &TaskHandle,
        status: ActivityStatus,
        result: Option<&TaskResult>,
        error: Option<&TaskError>,
    ) -> Result<()> {
        if error.is_some() && status != ActivityStatus::Failed {
            return Err(Error::InvalidArgument(
                "error can be provided only when status is FAILED".to_string(),
            ));
        }

        let now = self.clock.now();
        let (from, record) = self.storage()?.with_transaction(|ctx| {
            let entry = ctx.get_queue_entry(&task.uuid)?.ok_or_else(|| {
                Error::IllegalState(format!("task does not exist anymore: {}", task.uuid))
            })?;
            let record = archive_on(ctx, &entry, None, status, result, error, now)?
                .ok_or_else(|| {
                    Error::IllegalState(format!("task does not exist anymore: {}", task.uuid))
                })?;
            Ok((entry.status, record))
        })?;

        self.finished(from, &record, "remove");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Cancel a pending task.
    ///
    /// Returns `false` when no such task is queued. A task in progress can't
    /// be canceled.
    pub fn cancel(&self, uuid: &str) -> Result<bool> {
        let now = self.clock.now();
        let record = self.storage()?.with_transaction(|ctx| {
            let Some(entry) = ctx.get_queue_entry(uuid)? else {
                return Ok(None);
            };
            if entry.status == QueueStatus::InProgress {
                return Err(Error::IllegalState(format!(
                    "task is in progress and can't be canceled [uuid={uuid}]"
                )));
            }
            archive_on(
                ctx,
                &entry,
                Some(QueueStatus::Pending),
                ActivityStatus::Canceled,
                None,
                None,
                now,
            )
        })?;

        match record {
            Some(record) => {
                self.finished(QueueStatus::Pending, &record, "cancel");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Cancel every pending task. Tasks in progress are left alone, including
    /// those claimed while the sweep runs. Returns the number canceled.
    pub fn cancel_all(&self) -> Result<usize> {
        let pending = self.storage()?.list_queue(Some(QueueStatus::Pending))?;
        let count = self.cancel_pending(&pending, "cancel_all")?;
        info!(canceled = count, "canceled all pending tasks");
        Ok(count)
    }

    /// Cancel pending tasks that used up their claim budget. They would
    /// otherwise stay in the queue forever. Returns the number canceled.
    pub fn cancel_worn_outs(&self) -> Result<usize> {
        let worn_outs = self
            .storage()?
            .select_worn_outs(self.settings.max_execution_count)?;
        let count = self.cancel_pending(&worn_outs, "cancel_worn_outs")?;
        if count > 0 {
            info!(canceled = count, "canceled worn-out tasks");
        }
        Ok(count)
    }

    /// Cancel each entry that is still pending at the time of its own
    /// transaction. The storage lock is released between entries.
    fn cancel_pending(&self, candidates: &[QueueEntry], operation: &str) -> Result<usize> {
        let mut count = 0;
        for candidate in candidates {
            let now = self.clock.now();
            let record = self.storage()?.with_transaction(|ctx| {
                match ctx.get_queue_entry(&candidate.uuid)? {
                    Some(entry) if entry.status == QueueStatus::Pending => archive_on(
                        ctx,
                        &entry,
                        Some(QueueStatus::Pending),
                        ActivityStatus::Canceled,
                        None,
                        None,
                        now,
                    ),
                    _ => Ok(None),
                }
            })?;
            match record {
                Some(record) => {
                    self.finished(QueueStatus::Pending, &record, operation);
                    count += 1;
                }
                None => debug!(uuid = %candidate.uuid, "task left the pending set, skipped"),
            }
        }
        Ok(count)
    }

    fn finished(&self, from: QueueStatus, record: &ActivityRecord, operation: &str) {
        let span = start_task_span(operation, &record.uuid);
        record_state_transition(&span, from.as_str(), record.status.as_str());
        if record.status == ActivityStatus::Failed {
            span.in_scope(|| {
                warn!(
                    error = record.error_message.as_deref().unwrap_or_default(),
                    execution_count = record.execution_count,
                    "task failed"
                );
            });
        }
        self.monitor.on_finished(record);
    }

    // -----------------------------------------------------------------------
    // Gates
    // -----------------------------------------------------------------------

    pub fn pause_submit(&self) {
        self.gates.pause_submit();
        info!("task submission paused");
    }

    pub fn resume_submit(&self) {
        self.gates.resume_submit();
        info!("task submission resumed");
    }

    pub fn is_submit_paused(&self) -> bool {
        self.gates.is_submit_paused()
    }

    pub fn pause_peek(&self) {
        self.gates.pause_peek();
        info!("task claiming paused");
    }

    pub fn resume_peek(&self) {
        self.gates.resume_peek();
        info!("task claiming resumed");
    }

    pub fn is_peek_paused(&self) -> bool {
        self.gates.is_peek_paused()
    }

    // -----------------------------------------------------------------------
    // Read accessors
    // -----------------------------------------------------------------------

    pub fn queue_entry(&self, uuid: &str) -> Result<Option<QueueEntry>> {
        self.storage()?.get_queue_entry(uuid)
    }

    pub fn activity(&self, uuid: &str) -> Result<Option<ActivityRecord>> {
        self.storage()?.get_activity(uuid)
    }

    /// Queued tasks, oldest first.
    pub fn list_queue(&self, status: Option<QueueStatus>) -> Result<Vec<QueueEntry>> {
        self.storage()?.list_queue(status)
    }

    /// Archived tasks, most recent first.
    pub fn list_activity(
        &self,
        component_uuid: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ActivityRecord>> {
        self.storage()?.list_activity(component_uuid, limit)
    }

    /// Handle for a task still in the queue, e.g. for a worker resuming after
    /// a restart.
    pub fn handle(&self, uuid: &str) -> Result<Option<TaskHandle>> {
        let entry = self.storage()?.get_queue_entry(uuid)?;
        entry.map(|e| self.to_handle(&e)).transpose()
    }

    pub fn count_queue(&self, status: QueueStatus) -> Result<u64> {
        self.storage()?.count_queue(status)
    }

    pub fn status(&self) -> Result<QueueStatusSnapshot> {
        let storage = self.storage()?;
        let pending = storage.count_queue(QueueStatus::Pending)?;
        let in_progress = storage.count_queue(QueueStatus::InProgress)?;
        Ok(self.monitor.snapshot(pending, in_progress))
    }

    // -----------------------------------------------------------------------
    // Handles
    // -----------------------------------------------------------------------

    fn to_handle(&self, entry: &QueueEntry) -> Result<TaskHandle> {
        let component = match entry.component_uuid {
            Some(ref uuid) => self.components.find_by_uuid(uuid)?,
            None => None,
        };
        let organization_uuid = match component {
            Some(ref c) => c.organization_uuid.clone(),
            None => self.default_organization.get().uuid,
        };
        Ok(TaskHandle {
            organization_uuid,
            uuid: entry.uuid.clone(),
            task_type: entry.task_type.clone(),
            component_uuid: entry.component_uuid.clone(),
            component_key: component.as_ref().map(|c| c.key.clone()),
            component_name: component.map(|c| c.name),
            submitter_login: entry.submitter_login.clone(),
        })
    }
}

/// Move `entry` to the activity store. With `expected_status`, the delete only
/// happens if the row still has that status; `Ok(None)` means it did not.
fn archive_on(
    ctx: &TxContext,
    entry: &QueueEntry,
    expected_status: Option<QueueStatus>,
    status: ActivityStatus,
    result: Option<&TaskResult>,
    error: Option<&TaskError>,
    now: DateTime<Utc>,
) -> Result<Option<ActivityRecord>> {
    let deleted = match expected_status {
        Some(expected) => ctx.delete_queue_entry(&entry.uuid, expected)?,
        None => ctx.delete_queue_entry_any(&entry.uuid)?,
    };
    if !deleted {
        return Ok(None);
    }
    let record = ActivityRecord::from_entry(entry, status, result, error, now);
    ctx.insert_activity(&record)?;
    Ok(Some(record))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submit(queue: &CeQueue, task_type: &str) -> TaskHandle {
        let submission = queue.prepare_submit().task_type(task_type).build().unwrap();
        queue.submit(submission).unwrap()
    }

    #[test]
    fn queue_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CeQueue>();
    }

    #[test]
    fn handle_falls_back_to_default_organization() {
        let queue = CeQueue::in_memory().unwrap();
        let submission = queue
            .prepare_submit()
            .task_type("REPORT")
            .component_uuid("UNKNOWN")
            .build()
            .unwrap();
        let handle = queue.submit(submission).unwrap();

        assert_eq!(handle.organization_uuid, "AVdefault-organization");
        assert_eq!(handle.component_uuid.as_deref(), Some("UNKNOWN"));
        assert!(handle.component_key.is_none());
        assert!(handle.component_name.is_none());
    }

    #[test]
    fn gates_belong_to_one_queue() {
        let a = CeQueue::in_memory().unwrap();
        let b = CeQueue::in_memory().unwrap();
        a.pause_submit();
        a.pause_peek();

        assert!(a.is_submit_paused());
        assert!(!b.is_submit_paused());
        assert!(!b.is_peek_paused());
        submit(&b, "REPORT");
    }

    #[test]
    fn paused_peek_returns_none_and_claims_nothing() {
        let queue = CeQueue::in_memory().unwrap();
        let handle = submit(&queue, "REPORT");
        queue.pause_peek();

        assert!(queue.peek("W1").unwrap().is_none());
        let entry = queue.queue_entry(&handle.uuid).unwrap().unwrap();
        assert_eq!(entry.execution_count, 0);

        queue.resume_peek();
        assert_eq!(queue.peek("W1").unwrap().unwrap().uuid, handle.uuid);
    }

    #[test]
    fn custom_budget_changes_eligibility() {
        let queue = CeQueue::builder(Storage::in_memory().unwrap())
            .settings(QueueSettings {
                max_execution_count: 1,
            })
            .build();
        let handle = submit(&queue, "REPORT");

        let claimed = queue.peek("W1").unwrap().unwrap();
        assert_eq!(claimed.uuid, handle.uuid);

        // Put it back to pending by hand: with a budget of one it is worn out.
        let mut entry = queue.queue_entry(&handle.uuid).unwrap().unwrap();
        entry.status = QueueStatus::Pending;
        {
            let mut storage = queue.storage().unwrap();
            storage
                .with_transaction(|ctx| {
                    ctx.delete_queue_entry_any(&entry.uuid)?;
                    ctx.insert_queue_entry(&entry)
                })
                .unwrap();
        }
        assert!(queue.peek("W2").unwrap().is_none());
        assert_eq!(queue.cancel_worn_outs().unwrap(), 1);
    }

    #[test]
    fn status_reflects_store_and_outcomes() {
        let queue = CeQueue::in_memory().unwrap();
        for _ in 0..3 {
            submit(&queue, "REPORT");
        }

        let claimed = queue.peek("W1").unwrap().unwrap();
        let status = queue.status().unwrap();
        assert_eq!(status.received, 3);
        assert_eq!(status.pending, 2);
        assert_eq!(status.in_progress, 1);

        queue
            .remove(&claimed, ActivityStatus::Failed, None, Some(&TaskError::new("boom", "boom")))
            .unwrap();
        queue.cancel_all().unwrap();

        let status = queue.status().unwrap();
        assert_eq!(status.pending, 0);
        assert_eq!(status.in_progress, 0);
        assert_eq!(status.success, 0);
        assert_eq!(status.error, 1);
    }
}

//! Durable action queue: write-ahead persistence, drain loop, retry
//! classification and bounded exponential backoff.
//!
//! Tasks are persisted before the first execution attempt, so an intent
//! enqueued offline survives restarts and is replayed when connectivity
//! returns. Each drain cycle executes its batch strictly sequentially;
//! together with the per-key gating in [`MessageStore::ready_tasks`] this
//! keeps tasks touching one conversation's ratchet state in enqueue order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::crypto::SecureChannel;
use crate::error::EngineError;
use crate::events::EngineEvent;
use crate::handlers::{failure_notice, is_permanent_error, success_notice, Handlers};
use crate::hub::HubClient;
use crate::store::{MessageStore, QueueStats};
use crate::tasks::{Action, Task, TaskStatus};
use crate::types::now_millis;

pub const MAX_ATTEMPTS: u32 = 3;
const BASE_RETRY_DELAY_MS: i64 = 2_000;
const MAX_RETRY_DELAY_MS: i64 = 5 * 60 * 1_000;
const MAX_QUEUE_TASKS: usize = 1_000;
const TASK_RETENTION_MS: i64 = 7 * 24 * 60 * 60 * 1_000;
const DRAIN_BATCH: usize = 10;
const DRAIN_TICK: Duration = Duration::from_secs(1);

/// Delay before retry number `attempt` (1-based): doubling from 2 s,
/// capped at 5 minutes.
pub fn backoff_delay_ms(attempt: u32) -> i64 {
    let exponent = attempt.saturating_sub(1).min(20);
    (BASE_RETRY_DELAY_MS << exponent).min(MAX_RETRY_DELAY_MS)
}

pub struct ActionQueue<H, C> {
    store: Arc<MessageStore>,
    handlers: Handlers<H, C>,
    events: flume::Sender<EngineEvent>,
    online: AtomicBool,
    draining: AtomicBool,
    nudge: Notify,
}

impl<H: HubClient, C: SecureChannel> ActionQueue<H, C> {
    pub fn new(
        store: Arc<MessageStore>,
        handlers: Handlers<H, C>,
        events: flume::Sender<EngineEvent>,
    ) -> Self {
        Self {
            store,
            handlers,
            events,
            online: AtomicBool::new(true),
            draining: AtomicBool::new(false),
            nudge: Notify::new(),
        }
    }

    /// Persist a task before any execution attempt, then wake the drain
    /// loop. Works offline; the task waits for connectivity.
    pub fn enqueue(&self, action: Action) -> Result<i64, EngineError> {
        if self.store.count_tasks()? >= MAX_QUEUE_TASKS {
            let pruned = self.store.prune_old_tasks(now_millis() - TASK_RETENTION_MS)?;
            tracing::debug!(pruned, "queue at capacity, pruned old tasks");
            if self.store.queue_stats()?.pending > MAX_QUEUE_TASKS / 2 {
                return Err(EngineError::QueueFull);
            }
        }
        let id = self.store.insert_task(&action, MAX_ATTEMPTS, now_millis())?;
        tracing::debug!(task_id = id, kind = action.kind(), "task enqueued");
        let _ = self.events.send(EngineEvent::QueueUpdated);
        self.nudge.notify_one();
        Ok(id)
    }

    /// Remove a task that has not started executing. Returns false when it
    /// already ran or is running; the pre-execution re-fetch in
    /// [`Self::process_task`] makes the race benign.
    pub fn cancel(&self, task_id: i64) -> Result<bool, EngineError> {
        let removed = self.store.remove_pending_task(task_id)?;
        if removed {
            let _ = self.events.send(EngineEvent::QueueUpdated);
        }
        Ok(removed)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        if online {
            self.nudge.notify_one();
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Crash recovery, run once at startup: tasks a previous process left
    /// in `processing` go back to `pending`.
    pub fn reset_stuck_tasks(&self) -> Result<usize, EngineError> {
        let reset = self.store.reset_stuck_tasks(now_millis())?;
        if reset > 0 {
            tracing::info!(reset, "reset stuck processing tasks");
        }
        Ok(reset)
    }

    pub fn prune_old_tasks(&self) -> Result<usize, EngineError> {
        Ok(self.store.prune_old_tasks(now_millis() - TASK_RETENTION_MS)?)
    }

    pub fn stats(&self) -> Result<QueueStats, EngineError> {
        Ok(self.store.queue_stats()?)
    }

    /// Drain forever: a periodic tick plus nudges from enqueue and
    /// connectivity restore.
    pub async fn run(self: Arc<Self>) {
        let mut tick = tokio::time::interval(DRAIN_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = self.nudge.notified() => {}
            }
            self.drain().await;
        }
    }

    /// One drain cycle. Skips entirely while offline; at most one cycle
    /// runs at a time.
    pub async fn drain(&self) {
        if !self.is_online() {
            return;
        }
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        let result = self.drain_batch().await;
        self.draining.store(false, Ordering::SeqCst);
        if let Err(e) = result {
            tracing::warn!(%e, "queue drain failed");
        }
    }

    async fn drain_batch(&self) -> Result<(), EngineError> {
        // Keep fetching until nothing is ready: completing a key's head
        // task is what releases its followers into the ready set.
        loop {
            let ready = self.store.ready_tasks(now_millis(), DRAIN_BATCH)?;
            if ready.is_empty() {
                return Ok(());
            }
            for task in ready {
                if !self.is_online() {
                    return Ok(());
                }
                self.process_task(task).await?;
            }
        }
    }

    async fn process_task(&self, task: Task) -> Result<(), EngineError> {
        // Re-fetch immediately before executing: the task may have been
        // cancelled since the batch query.
        let Some(task) = self.store.get_task(task.id)? else {
            return Ok(());
        };
        if task.status != TaskStatus::Pending || task.next_retry_at > now_millis() {
            return Ok(());
        }
        self.store.mark_task_processing(task.id, now_millis())?;
        tracing::debug!(
            task_id = task.id,
            kind = %task.kind,
            attempt = task.attempt,
            "executing task"
        );
        match self.handlers.execute(&task.action).await {
            Ok(()) => {
                self.store.delete_task(task.id)?;
                if let Some(text) = success_notice(&task.kind) {
                    let _ = self.events.send(EngineEvent::Notice { text: text.into() });
                }
                let _ = self.events.send(EngineEvent::QueueUpdated);
            }
            Err(error) => self.handle_failure(&task, error).await?,
        }
        Ok(())
    }

    async fn handle_failure(&self, task: &Task, error: EngineError) -> Result<(), EngineError> {
        let message = error.to_string().to_lowercase();
        if error.status_code() == Some(401) || message.contains("unauthorized") {
            tracing::warn!(task_id = task.id, kind = %task.kind, %error, "task failed with auth error");
            self.fail_task(task, &error)?;
            self.handlers.on_failure(&task.action, &error).await;
            let _ = self.events.send(EngineEvent::SessionExpired);
            return Ok(());
        }

        if is_permanent_error(&task.kind, &error) {
            tracing::warn!(task_id = task.id, kind = %task.kind, %error, "task failed permanently");
            self.fail_task(task, &error)?;
            self.handlers.on_failure(&task.action, &error).await;
            if let Some(text) = failure_notice(&task.kind) {
                let _ = self.events.send(EngineEvent::Notice { text: text.into() });
            }
            return Ok(());
        }

        let attempt = task.attempt + 1;
        if attempt >= task.max_attempts {
            tracing::warn!(task_id = task.id, kind = %task.kind, %error, "task exhausted its retries");
            self.fail_task(task, &error)?;
            self.handlers.on_failure(&task.action, &error).await;
            if let Some(text) = failure_notice(&task.kind) {
                let _ = self.events.send(EngineEvent::Notice { text: text.into() });
            }
            return Ok(());
        }

        let delay = backoff_delay_ms(attempt);
        tracing::debug!(
            task_id = task.id,
            kind = %task.kind,
            attempt,
            delay_ms = delay,
            %error,
            "task failed transiently, retrying"
        );
        self.store
            .reschedule_task(task.id, attempt, now_millis() + delay, &error.to_string())?;
        let _ = self.events.send(EngineEvent::QueueUpdated);
        Ok(())
    }

    fn fail_task(&self, task: &Task, error: &EngineError) -> Result<(), EngineError> {
        self.store
            .mark_task_failed(task.id, &error.to_string(), now_millis())?;
        let _ = self.events.send(EngineEvent::QueueUpdated);
        Ok(())
    }
}

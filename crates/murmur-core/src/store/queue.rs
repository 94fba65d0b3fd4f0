//! Durable queue-task rows. The queue persists every task before the first
//! execution attempt so an intent enqueued offline survives restarts.

use rusqlite::{params, OptionalExtension, Row};

use super::{MessageStore, StoreError};
use crate::tasks::{Action, Task, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub pending: usize,
    pub failed: usize,
    pub total: usize,
}

fn task_from_row(row: &Row<'_>) -> Result<(i64, String, String, String, String, u32, u32, i64, i64, Option<i64>, Option<i64>, Option<String>), rusqlite::Error> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
    ))
}

fn parse_task(
    raw: (i64, String, String, String, String, u32, u32, i64, i64, Option<i64>, Option<i64>, Option<String>),
) -> Result<Task, StoreError> {
    let (id, kind, serial_key, action, status, attempt, max_attempts, next_retry_at, created_at, processing_started_at, processed_at, error) = raw;
    let action: Action = serde_json::from_str(&action)?;
    let status = TaskStatus::from_str(&status).unwrap_or(TaskStatus::Pending);
    Ok(Task {
        id,
        kind,
        serial_key,
        action,
        status,
        attempt,
        max_attempts,
        next_retry_at,
        created_at,
        processing_started_at,
        processed_at,
        error,
    })
}

const TASK_COLUMNS: &str = "id, kind, serial_key, action, status, attempt, max_attempts,
         next_retry_at, created_at, processing_started_at, processed_at, error";

impl MessageStore {
    /// Write-ahead persist a task. Returns the new task id.
    pub fn insert_task(
        &self,
        action: &Action,
        max_attempts: u32,
        now: i64,
    ) -> Result<i64, StoreError> {
        let body = serde_json::to_string(action)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO queue_tasks
                (kind, serial_key, action, status, attempt, max_attempts, next_retry_at, created_at)
             VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5, ?5)",
            params![action.kind(), action.serial_key(), body, max_attempts, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_task(&self, id: i64) -> Result<Option<Task>, StoreError> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM queue_tasks WHERE id = ?1"),
                [id],
                task_from_row,
            )
            .optional()?;
        raw.map(parse_task).transpose()
    }

    /// Pending tasks whose retry time has come, oldest first. A task is held
    /// back while an older pending task with the same serial key exists, so
    /// tasks touching one conversation's ratchet state run in enqueue order
    /// even when the head of the key is waiting out a backoff.
    pub fn ready_tasks(&self, now: i64, limit: usize) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM queue_tasks t
             WHERE t.status = 'pending' AND t.next_retry_at <= ?1
               AND NOT EXISTS (
                 SELECT 1 FROM queue_tasks o
                 WHERE o.serial_key = t.serial_key
                   AND o.status = 'pending'
                   AND (o.created_at < t.created_at
                        OR (o.created_at = t.created_at AND o.id < t.id))
               )
             ORDER BY t.created_at, t.id
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![now, limit as i64], task_from_row)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(parse_task(row?)?);
        }
        Ok(tasks)
    }

    pub fn mark_task_processing(&self, id: i64, now: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE queue_tasks SET status = 'processing', processing_started_at = ?2 WHERE id = ?1",
            params![id, now],
        )?;
        Ok(())
    }

    /// Delete a completed task.
    pub fn delete_task(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM queue_tasks WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Cancellation path: remove a task only while it is still pending.
    /// Returns false when the task is gone or already executing.
    pub fn remove_pending_task(&self, id: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM queue_tasks WHERE id = ?1 AND status = 'pending'",
            [id],
        )?;
        Ok(n > 0)
    }

    pub fn mark_task_failed(&self, id: i64, error: &str, now: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE queue_tasks SET status = 'failed', error = ?2, processed_at = ?3 WHERE id = ?1",
            params![id, error, now],
        )?;
        Ok(())
    }

    /// Put a transiently-failed task back in the pending set with its next
    /// attempt number and retry time.
    pub fn reschedule_task(
        &self,
        id: i64,
        attempt: u32,
        next_retry_at: i64,
        error: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE queue_tasks
             SET status = 'pending', attempt = ?2, next_retry_at = ?3, error = ?4,
                 processing_started_at = NULL
             WHERE id = ?1",
            params![id, attempt, next_retry_at, error],
        )?;
        Ok(())
    }

    /// Crash recovery: tasks left in `processing` by a previous run go back
    /// to `pending` so the drain loop picks them up again.
    pub fn reset_stuck_tasks(&self, now: i64) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE queue_tasks
             SET status = 'pending', next_retry_at = ?1, processing_started_at = NULL
             WHERE status = 'processing'",
            [now],
        )?;
        Ok(n)
    }

    /// Drop terminally-failed tasks created before `cutoff`.
    pub fn prune_old_tasks(&self, cutoff: i64) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM queue_tasks WHERE status = 'failed' AND created_at < ?1",
            [cutoff],
        )?;
        Ok(n)
    }

    pub fn count_tasks(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM queue_tasks", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn queue_stats(&self) -> Result<QueueStats, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM queue_tasks GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut stats = QueueStats::default();
        for row in rows {
            let (status, count) = row?;
            let count = count as usize;
            stats.total += count;
            match status.as_str() {
                "pending" | "processing" => stats.pending += count,
                "failed" => stats.failed += count,
                _ => {}
            }
        }
        Ok(stats)
    }
}

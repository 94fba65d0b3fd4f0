//! Message log persistence and keyset pagination.

use rusqlite::{params, OptionalExtension};

use super::{MessageStore, StoreError};
use crate::types::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Pagination cursor. Ordering is `(created_date, message_id)` so
/// equal-timestamp neighbors are neither dropped nor duplicated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageCursor {
    pub created_date: i64,
    pub message_id: String,
}

impl MessageCursor {
    pub fn of(message: &Message) -> Self {
        Self {
            created_date: message.created_date,
            message_id: message.message_id.clone(),
        }
    }
}

impl MessageStore {
    /// Persist a message into the log. Ephemeral delivery fields are
    /// stripped; the log only ever holds wire-shaped messages.
    pub fn save_message(&self, message: &Message) -> Result<(), StoreError> {
        let stripped = message.strip_ephemeral();
        let body = serde_json::to_string(&stripped)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO messages (message_id, space_id, channel_id, created_date, body)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(message_id) DO UPDATE SET
                space_id = excluded.space_id,
                channel_id = excluded.channel_id,
                created_date = excluded.created_date,
                body = excluded.body",
            params![
                stripped.message_id,
                stripped.space_id,
                stripped.channel_id,
                stripped.created_date,
                body
            ],
        )?;
        Ok(())
    }

    /// Fetch a message by id, scoped to its conversation. A message stored
    /// under a different space/channel is not visible here.
    pub fn get_message(
        &self,
        space_id: &str,
        channel_id: &str,
        message_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        let conn = self.conn.lock();
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM messages WHERE message_id = ?1",
                [message_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(body) = body else {
            return Ok(None);
        };
        let message: Message = serde_json::from_str(&body)?;
        if message.space_id != space_id || message.channel_id != channel_id {
            return Ok(None);
        }
        Ok(Some(message))
    }

    pub fn delete_message(&self, message_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let n = conn.execute("DELETE FROM messages WHERE message_id = ?1", [message_id])?;
        Ok(n > 0)
    }

    /// Page through a conversation. Results are always chronologically
    /// ascending. Without a cursor, returns the newest `limit` messages;
    /// with one, the page strictly before/after it (cursor exclusive).
    pub fn get_messages(
        &self,
        space_id: &str,
        channel_id: &str,
        cursor: Option<&MessageCursor>,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let conn = self.conn.lock();
        let mut bodies: Vec<String> = Vec::new();
        match (cursor, direction) {
            (None, _) => {
                let mut stmt = conn.prepare(
                    "SELECT body FROM messages
                     WHERE space_id = ?1 AND channel_id = ?2
                     ORDER BY created_date DESC, message_id DESC
                     LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![space_id, channel_id, limit as i64], |row| {
                    row.get::<_, String>(0)
                })?;
                for row in rows {
                    bodies.push(row?);
                }
                bodies.reverse();
            }
            (Some(c), Direction::Backward) => {
                let mut stmt = conn.prepare(
                    "SELECT body FROM messages
                     WHERE space_id = ?1 AND channel_id = ?2
                       AND (created_date < ?3
                            OR (created_date = ?3 AND message_id < ?4))
                     ORDER BY created_date DESC, message_id DESC
                     LIMIT ?5",
                )?;
                let rows = stmt.query_map(
                    params![space_id, channel_id, c.created_date, c.message_id, limit as i64],
                    |row| row.get::<_, String>(0),
                )?;
                for row in rows {
                    bodies.push(row?);
                }
                bodies.reverse();
            }
            (Some(c), Direction::Forward) => {
                let mut stmt = conn.prepare(
                    "SELECT body FROM messages
                     WHERE space_id = ?1 AND channel_id = ?2
                       AND (created_date > ?3
                            OR (created_date = ?3 AND message_id > ?4))
                     ORDER BY created_date ASC, message_id ASC
                     LIMIT ?5",
                )?;
                let rows = stmt.query_map(
                    params![space_id, channel_id, c.created_date, c.message_id, limit as i64],
                    |row| row.get::<_, String>(0),
                )?;
                for row in rows {
                    bodies.push(row?);
                }
            }
        }
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(StoreError::from))
            .collect()
    }
}

//! In-memory per-conversation message windows the host renders from.
//!
//! The cache holds the optimistic view of each open conversation: messages
//! appear here at submit time with `send_status = sending` and are
//! reconciled by the send pipeline once the hub acknowledges them. Windows
//! are kept strictly ascending by `(created_date, message_id)`.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::types::{Message, SendStatus};

#[derive(Default)]
pub struct ConversationCache {
    windows: Mutex<HashMap<String, Vec<Message>>>,
}

fn window_key(space_id: &str, channel_id: &str) -> String {
    format!("{space_id}/{channel_id}")
}

fn ordered_position(window: &[Message], message: &Message) -> usize {
    window.partition_point(|m| {
        (m.created_date, m.message_id.as_str())
            < (message.created_date, message.message_id.as_str())
    })
}

impl ConversationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a message, keeping the window ordered. An existing
    /// message with the same id is replaced in place.
    pub fn upsert(&self, message: Message) {
        let mut windows = self.windows.lock();
        let window = windows
            .entry(window_key(&message.space_id, &message.channel_id))
            .or_default();
        if let Some(existing) = window
            .iter_mut()
            .find(|m| m.message_id == message.message_id)
        {
            *existing = message;
            return;
        }
        let pos = ordered_position(window, &message);
        window.insert(pos, message);
    }

    /// Update a message's delivery status in place. Returns false when the
    /// message is no longer cached (evicted by an intervening refetch) and
    /// the caller must re-insert it. A `sent` message never goes back to
    /// `sending`.
    pub fn update_status(
        &self,
        space_id: &str,
        channel_id: &str,
        message_id: &str,
        status: SendStatus,
        error: Option<String>,
    ) -> bool {
        let mut windows = self.windows.lock();
        let Some(window) = windows.get_mut(&window_key(space_id, channel_id)) else {
            return false;
        };
        let Some(message) = window.iter_mut().find(|m| m.message_id == message_id) else {
            return false;
        };
        if message.send_status == Some(SendStatus::Sent) && status == SendStatus::Sending {
            return true;
        }
        message.send_status = Some(status);
        message.send_error = error;
        true
    }

    pub fn remove(&self, space_id: &str, channel_id: &str, message_id: &str) {
        let mut windows = self.windows.lock();
        if let Some(window) = windows.get_mut(&window_key(space_id, channel_id)) {
            window.retain(|m| m.message_id != message_id);
        }
    }

    /// Replace a conversation's entire window, e.g. after a jump-to-message
    /// load. Subsequent incremental pagination continues from this window.
    pub fn replace_window(&self, space_id: &str, channel_id: &str, messages: Vec<Message>) {
        let mut windows = self.windows.lock();
        windows.insert(window_key(space_id, channel_id), messages);
    }

    pub fn snapshot(&self, space_id: &str, channel_id: &str) -> Vec<Message> {
        let windows = self.windows.lock();
        windows
            .get(&window_key(space_id, channel_id))
            .cloned()
            .unwrap_or_default()
    }

    pub fn get(&self, space_id: &str, channel_id: &str, message_id: &str) -> Option<Message> {
        let windows = self.windows.lock();
        windows
            .get(&window_key(space_id, channel_id))?
            .iter()
            .find(|m| m.message_id == message_id)
            .cloned()
    }
}

//! Jump-to-message pagination: load a bidirectional window around a target
//! message and splice it into the conversation cache as a complete
//! replacement. All subsequent incremental pagination continues from this
//! window, so its ordering and gap-freedom are load-bearing.

use crate::cache::ConversationCache;
use crate::error::EngineError;
use crate::store::{Direction, MessageCursor, MessageStore};
use crate::types::Message;

#[derive(Debug, Clone)]
pub struct MessageWindow {
    /// Strictly ascending by `(created_date, message_id)`, containing the
    /// target exactly once, with no gaps on either side of it.
    pub messages: Vec<Message>,
    /// Continuation cursor for loading older messages.
    pub backward: Option<MessageCursor>,
    /// Continuation cursor for loading newer messages.
    pub forward: Option<MessageCursor>,
}

pub fn load_messages_around(
    store: &MessageStore,
    cache: &ConversationCache,
    space_id: &str,
    channel_id: &str,
    target_message_id: &str,
    before_limit: usize,
    after_limit: usize,
) -> Result<MessageWindow, EngineError> {
    let target = store
        .get_message(space_id, channel_id, target_message_id)?
        .ok_or_else(|| EngineError::MessageNotFound(target_message_id.to_string()))?;
    let cursor = MessageCursor::of(&target);

    let before = store.get_messages(
        space_id,
        channel_id,
        Some(&cursor),
        Direction::Backward,
        before_limit,
    )?;
    let after = store.get_messages(
        space_id,
        channel_id,
        Some(&cursor),
        Direction::Forward,
        after_limit,
    )?;

    let mut messages = Vec::with_capacity(before.len() + 1 + after.len());
    messages.extend(before);
    messages.push(target);
    messages.extend(after);

    let backward = messages.first().map(MessageCursor::of);
    let forward = messages.last().map(MessageCursor::of);
    cache.replace_window(space_id, channel_id, messages.clone());

    Ok(MessageWindow {
        messages,
        backward,
        forward,
    })
}

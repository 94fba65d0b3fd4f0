use crate::types::SendStatus;

/// Updates the engine pushes to its host. Message-level operations report
/// through `MessageStatusChanged` (inline indicators); settings, space and
/// moderation operations surface `Notice` (toast-level).
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Toast-level text for the user.
    Notice { text: String },
    /// The task queue changed (enqueue, completion, failure, cancel).
    QueueUpdated,
    /// A task failed with an authorization error; the user must log in again.
    SessionExpired,
    MessageStatusChanged {
        space_id: String,
        channel_id: String,
        message_id: String,
        status: SendStatus,
        error: Option<String>,
    },
    /// A reply was delivered; cached reply digests for the parent are stale.
    ReplyDigestInvalidated { parent_message_id: String },
    /// The user config changed (local save or accepted remote sync).
    ConfigUpdated { address: String },
    /// The set of known spaces changed (bootstrap added one).
    SpacesUpdated,
}

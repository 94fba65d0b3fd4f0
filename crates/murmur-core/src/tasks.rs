//! Durable task model for the action queue. Every user intent that must
//! survive restarts is one [`Action`] variant with a typed payload,
//! serialized under a kebab-case `type` tag.

use serde::{Deserialize, Serialize};

use crate::types::{dm_conversation_id, space_conversation_id, Message, Space, UserConfig, UserKeyset};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Action {
    SaveUserConfig {
        config: UserConfig,
        keyset: UserKeyset,
    },
    UpdateSpace {
        sender_address: String,
        space: Space,
    },
    KickUser {
        space_id: String,
        sender_address: String,
        target_address: String,
    },
    MuteUser {
        space_id: String,
        channel_id: String,
        sender_address: String,
        target_address: String,
    },
    UnmuteUser {
        space_id: String,
        channel_id: String,
        sender_address: String,
        target_address: String,
    },
    Reaction {
        space_id: String,
        channel_id: String,
        sender_address: String,
        target_message_id: String,
        reaction: String,
        remove: bool,
    },
    PinMessage {
        space_id: String,
        channel_id: String,
        sender_address: String,
        target_message_id: String,
    },
    UnpinMessage {
        space_id: String,
        channel_id: String,
        sender_address: String,
        target_message_id: String,
    },
    EditMessage {
        space_id: String,
        channel_id: String,
        sender_address: String,
        target_message_id: String,
        text: String,
    },
    DeleteMessage {
        space_id: String,
        channel_id: String,
        sender_address: String,
        target_message_id: String,
    },
    SendChannelMessage {
        space_id: String,
        channel_id: String,
        message: Message,
    },
    SendDm {
        address: String,
        message: Message,
    },
}

impl Action {
    /// Log-safe task tag; also the serde `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::SaveUserConfig { .. } => "save-user-config",
            Action::UpdateSpace { .. } => "update-space",
            Action::KickUser { .. } => "kick-user",
            Action::MuteUser { .. } => "mute-user",
            Action::UnmuteUser { .. } => "unmute-user",
            Action::Reaction { .. } => "reaction",
            Action::PinMessage { .. } => "pin-message",
            Action::UnpinMessage { .. } => "unpin-message",
            Action::EditMessage { .. } => "edit-message",
            Action::DeleteMessage { .. } => "delete-message",
            Action::SendChannelMessage { .. } => "send-channel-message",
            Action::SendDm { .. } => "send-dm",
        }
    }

    /// Logical serialization key. Tasks sharing a key execute in enqueue
    /// order; tasks touching a conversation's ratchet state all map to that
    /// conversation.
    pub fn serial_key(&self) -> String {
        match self {
            Action::SaveUserConfig { config, .. } => format!("config:{}", config.address),
            Action::UpdateSpace { space, .. } => space_conversation_id(&space.space_id),
            Action::KickUser { space_id, .. }
            | Action::MuteUser { space_id, .. }
            | Action::UnmuteUser { space_id, .. }
            | Action::Reaction { space_id, .. }
            | Action::PinMessage { space_id, .. }
            | Action::UnpinMessage { space_id, .. }
            | Action::EditMessage { space_id, .. }
            | Action::DeleteMessage { space_id, .. }
            | Action::SendChannelMessage { space_id, .. } => space_conversation_id(space_id),
            Action::SendDm { address, .. } => dm_conversation_id(address),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Processing,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One durable queue entry. Created on enqueue, mutated per attempt,
/// deleted on success; permanent failures stay as `Failed` rows until
/// pruned so the failure can be surfaced.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: i64,
    pub kind: String,
    pub serial_key: String,
    pub action: Action,
    pub status: TaskStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub next_retry_at: i64,
    pub created_at: i64,
    pub processing_started_at: Option<i64>,
    pub processed_at: Option<i64>,
    pub error: Option<String>,
}

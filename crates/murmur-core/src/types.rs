//! Core data model shared across the engine: messages, spaces, keys,
//! encryption session rows and the synced user configuration.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Millisecond wall-clock timestamp used for all persisted records.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Conversation key for a space's group sync channel. Encryption state is
/// tracked per space, not per channel.
pub fn space_conversation_id(space_id: &str) -> String {
    format!("{space_id}/{space_id}")
}

/// Conversation key for a direct-message thread with `address`.
pub fn dm_conversation_id(address: &str) -> String {
    format!("{address}/{address}")
}

/// Client-local delivery state of an outgoing message. Never serialized to
/// the wire or the message log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendStatus {
    Sending,
    Sent,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEdit {
    pub text: String,
    pub edited_date: i64,
}

/// Payload of a message. Control variants (pin, mute, kick, ...) ride the
/// same encrypted channel as posts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessageContent {
    Post {
        sender_id: String,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        replies_to_message_id: Option<String>,
    },
    EditMessage {
        sender_id: String,
        original_message_id: String,
        text: String,
    },
    RemoveMessage {
        sender_id: String,
        remove_message_id: String,
    },
    Reaction {
        sender_id: String,
        message_id: String,
        reaction: String,
    },
    RemoveReaction {
        sender_id: String,
        message_id: String,
        reaction: String,
    },
    Pin {
        sender_id: String,
        message_id: String,
    },
    Unpin {
        sender_id: String,
        message_id: String,
    },
    Mute {
        sender_id: String,
        target_address: String,
    },
    Unmute {
        sender_id: String,
        target_address: String,
    },
    Kick {
        sender_id: String,
        target_address: String,
    },
    UpdateSpace {
        sender_id: String,
        space: Space,
    },
}

impl MessageContent {
    pub fn sender_id(&self) -> &str {
        match self {
            Self::Post { sender_id, .. }
            | Self::EditMessage { sender_id, .. }
            | Self::RemoveMessage { sender_id, .. }
            | Self::Reaction { sender_id, .. }
            | Self::RemoveReaction { sender_id, .. }
            | Self::Pin { sender_id, .. }
            | Self::Unpin { sender_id, .. }
            | Self::Mute { sender_id, .. }
            | Self::Unmute { sender_id, .. }
            | Self::Kick { sender_id, .. }
            | Self::UpdateSpace { sender_id, .. } => sender_id,
        }
    }
}

/// A channel or DM message. DMs store the counterparty address as both
/// `space_id` and `channel_id`.
///
/// `send_status`/`send_error` are ephemeral client-local bookkeeping and are
/// stripped before encryption and before persistence in the message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub space_id: String,
    pub channel_id: String,
    pub message_id: String,
    pub nonce: String,
    pub created_date: i64,
    pub modified_date: i64,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edits: Vec<MessageEdit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub send_status: Option<SendStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub send_error: Option<String>,
}

impl Message {
    pub fn is_dm(&self) -> bool {
        self.space_id == self.channel_id
    }

    pub fn conversation_id(&self) -> String {
        space_conversation_id(&self.space_id)
    }

    /// Copy of the message without the client-local delivery fields. The
    /// wire format must never include them.
    pub fn strip_ephemeral(&self) -> Message {
        Message {
            send_status: None,
            send_error: None,
            ..self.clone()
        }
    }
}

/// Current ratchet session state for one (conversation, inbox) pair.
/// Overwritten wholesale on every successful send or receive, never merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptionState {
    pub conversation_id: String,
    pub inbox_id: String,
    /// Opaque serialized ratchet state owned by the crypto collaborator.
    pub state: String,
    pub timestamp: i64,
    pub sent_accept: bool,
}

/// One channel inside a space group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub channel_id: String,
    pub channel_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelGroup {
    pub group_name: String,
    pub channels: Vec<Channel>,
}

/// Decrypted space manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Space {
    pub space_id: String,
    pub space_name: String,
    #[serde(default)]
    pub groups: Vec<ChannelGroup>,
    #[serde(default)]
    pub is_repudiable: bool,
}

impl Space {
    pub fn has_channel(&self, channel_id: &str) -> bool {
        self.groups
            .iter()
            .flat_map(|g| g.channels.iter())
            .any(|c| c.channel_id == channel_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceMember {
    pub space_id: String,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Key material a device holds for a space. `key_id` is one of "config",
/// "hub" or "inbox"; keys are hex-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceKey {
    pub space_id: String,
    pub key_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub public_key: String,
    pub private_key: String,
}

/// Snapshot of one space's key material and current session state, carried
/// inside the synced user config so another device can bootstrap the space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceKeyBundle {
    pub space_id: String,
    pub encryption_state: EncryptionState,
    pub keys: Vec<SpaceKey>,
}

/// Per-user synced configuration. Single logical owner per address;
/// last-writer-wins by `timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserConfig {
    pub address: String,
    pub allow_sync: bool,
    pub non_repudiable: bool,
    #[serde(default)]
    pub space_keys: Vec<SpaceKeyBundle>,
    #[serde(default)]
    pub space_ids: Vec<String>,
    pub timestamp: i64,
}

impl UserConfig {
    pub fn default_for(address: &str) -> Self {
        Self {
            address: address.to_string(),
            allow_sync: false,
            non_repudiable: false,
            space_keys: vec![],
            space_ids: vec![],
            timestamp: 0,
        }
    }
}

/// The user's signing keypair. Private key bytes are wiped on drop and the
/// Debug output never includes key material.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct UserKeyset {
    #[zeroize(skip)]
    pub address: String,
    pub public_key: Vec<u8>,
    pub private_key: Vec<u8>,
}

impl std::fmt::Debug for UserKeyset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserKeyset")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Fresh device-local inbox keypair from the crypto collaborator.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct InboxKeypair {
    pub public_key: Vec<u8>,
    pub private_key: Vec<u8>,
}

/// Resumable progress marker for a space bootstrap. Each step is persisted
/// after it completes so a crash mid-bootstrap resumes instead of
/// restarting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BootstrapStep {
    KeysSaved,
    ManifestSaved,
    InboxRegistered,
    ListenEnqueued,
}

impl BootstrapStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KeysSaved => "keys-saved",
            Self::ManifestSaved => "manifest-saved",
            Self::InboxRegistered => "inbox-registered",
            Self::ListenEnqueued => "listen-enqueued",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "keys-saved" => Some(Self::KeysSaved),
            "manifest-saved" => Some(Self::ManifestSaved),
            "inbox-registered" => Some(Self::InboxRegistered),
            "listen-enqueued" => Some(Self::ListenEnqueued),
            _ => None,
        }
    }
}

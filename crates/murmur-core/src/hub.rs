//! Hub transport contract. The hub relays encrypted envelopes, stores the
//! encrypted user settings blob and keeps the space/inbox registry. The
//! engine only depends on this trait; a production client plugs in its
//! websocket/HTTP implementation, tests plug in a fake.

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// The hub answered with an HTTP-like status code.
    #[error("hub returned {status}: {message}")]
    Status { status: u16, message: String },
    /// The hub could not be reached at all.
    #[error("network error: {0}")]
    Network(String),
}

impl HubError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Network(_) => None,
        }
    }
}

/// Signed, encrypted user settings blob as stored on the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsRecord {
    pub user_address: String,
    pub user_public_key: String,
    pub user_config: String,
    pub timestamp: i64,
    pub signature: String,
}

/// Server-side registration of a space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceRegistration {
    pub space_id: String,
    pub hub_address: String,
}

/// Encrypted space manifest, openable with the space's "config" inbox key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestPayload {
    pub space_manifest: String,
    pub ephemeral_public_key: String,
}

/// Proof-of-possession payload registering a device inbox with a space's
/// hub. Both signatures cover an "add" preimage binding hub and inbox keys
/// to each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxRegistration {
    pub hub_address: String,
    pub hub_public_key: String,
    pub hub_signature: String,
    pub inbox_public_key: String,
    pub inbox_signature: String,
}

#[allow(async_fn_in_trait)]
pub trait HubClient: Send + Sync {
    /// Send a JSON envelope to a space/conversation. Returns the outbound
    /// frame acknowledged by the hub.
    async fn send_hub_message(&self, target_id: &str, payload: &str) -> Result<String, HubError>;

    /// Send pre-formatted frames over the direct (inbox) channel.
    async fn send_direct(&self, frames: Vec<String>) -> Result<(), HubError>;

    async fn get_user_settings(&self, address: &str) -> Result<Option<SettingsRecord>, HubError>;

    async fn put_user_settings(&self, record: &SettingsRecord) -> Result<(), HubError>;

    async fn get_space_registration(&self, space_id: &str)
        -> Result<SpaceRegistration, HubError>;

    async fn get_space_manifest(&self, space_id: &str) -> Result<Option<ManifestPayload>, HubError>;

    async fn register_inbox(&self, registration: &InboxRegistration) -> Result<(), HubError>;
}

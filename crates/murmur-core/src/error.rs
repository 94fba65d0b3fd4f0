use crate::crypto::CryptoError;
use crate::hub::HubError;
use crate::store::StoreError;

/// Engine-level error. Handlers classify these into permanent vs transient;
/// the queue enforces the retry policy uniformly.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Hub(#[from] HubError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("message not found: {0}")]
    MessageNotFound(String),
    #[error("no recipient inboxes with an established session")]
    NoRecipients,
    #[error("action queue is full, try again later")]
    QueueFull,
    #[error("{0}")]
    InvalidInput(String),
}

impl EngineError {
    /// HTTP-like status code when the failure came from the hub.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Hub(e) => e.status_code(),
            _ => None,
        }
    }
}

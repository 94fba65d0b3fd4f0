//! Encrypted send pipeline: ratchet encryption, hub transport and cache
//! reconciliation for channel messages, direct messages and control
//! payloads.
//!
//! Encryption state is read-modify-written here. Two pipelines racing on
//! one conversation would both advance the same ratchet state and corrupt
//! the session for both ends, so every path takes the conversation's async
//! lock before loading state and holds it until the replacement state is
//! persisted.

use std::collections::HashMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::cache::ConversationCache;
use crate::crypto::SecureChannel;
use crate::error::EngineError;
use crate::events::EngineEvent;
use crate::hub::HubClient;
use crate::store::MessageStore;
use crate::types::{
    dm_conversation_id, now_millis, space_conversation_id, EncryptionState, Message,
    MessageContent, SendStatus,
};

/// Content-addressed message id: SHA-256 over the nonce, a content label
/// and the sender/text, hex encoded. Deterministic so a resend of the same
/// signed message keeps its identity.
pub fn derive_message_id(nonce: &str, label: &str, sender: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(nonce.as_bytes());
    hasher.update(label.as_bytes());
    hasher.update(sender.as_bytes());
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// One async mutex per conversation, created on first use.
#[derive(Default)]
pub struct ConversationLocks {
    inner: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConversationLocks {
    pub fn for_conversation(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .lock()
            .entry(conversation_id.to_string())
            .or_default()
            .clone()
    }
}

pub struct Pipeline<H, C> {
    store: Arc<MessageStore>,
    hub: Arc<H>,
    channel: Arc<C>,
    cache: Arc<ConversationCache>,
    events: flume::Sender<EngineEvent>,
    locks: ConversationLocks,
}

impl<H: HubClient, C: SecureChannel> Pipeline<H, C> {
    pub fn new(
        store: Arc<MessageStore>,
        hub: Arc<H>,
        channel: Arc<C>,
        cache: Arc<ConversationCache>,
        events: flume::Sender<EngineEvent>,
    ) -> Self {
        Self {
            store,
            hub,
            channel,
            cache,
            events,
            locks: ConversationLocks::default(),
        }
    }

    /// Send a signed channel message. Vanished targets degrade to a failed
    /// message status instead of an error, so the task is not retried.
    pub async fn send_channel_message(
        &self,
        space_id: &str,
        channel_id: &str,
        message: &Message,
    ) -> Result<(), EngineError> {
        let Some(space) = self.store.get_space(space_id)? else {
            self.mark_send_failed(message, "Space was deleted");
            return Ok(());
        };
        if !space.has_channel(channel_id) {
            self.mark_send_failed(message, "Channel was deleted");
            return Ok(());
        }

        let conversation_id = space_conversation_id(space_id);
        let wire = message.strip_ephemeral();
        let plaintext = serde_json::to_vec(&wire)?;

        let lock = self.locks.for_conversation(&conversation_id);
        let guard = lock.lock().await;
        // State must be loaded fresh under the lock: a retry or a previous
        // send may have advanced the ratchet since this task was enqueued.
        let current = self.current_state(&conversation_id)?;
        let step = self.channel.ratchet_encrypt(&current.state, &plaintext)?;
        let payload = serde_json::json!({
            "type": "message",
            "channel_id": channel_id,
            "envelope": step.envelope,
        })
        .to_string();
        self.hub.send_hub_message(space_id, &payload).await?;
        self.store.save_encryption_state(
            &EncryptionState {
                conversation_id: conversation_id.clone(),
                inbox_id: current.inbox_id.clone(),
                state: step.new_state,
                timestamp: now_millis(),
                sent_accept: current.sent_accept,
            },
            true,
        )?;
        drop(guard);

        self.store.save_message(&wire)?;
        self.mark_send_sent(&wire);
        Ok(())
    }

    /// Send a signed direct message to every established session with the
    /// counterparty. Zero sessions means no recipient can ever receive the
    /// message, which the handler classifies as permanent.
    pub async fn send_dm(&self, address: &str, message: &Message) -> Result<(), EngineError> {
        let conversation_id = dm_conversation_id(address);
        let wire = message.strip_ephemeral();
        let plaintext = serde_json::to_vec(&wire)?;

        let lock = self.locks.for_conversation(&conversation_id);
        let guard = lock.lock().await;
        let sessions = self.store.get_encryption_states(&conversation_id)?;
        if sessions.is_empty() {
            return Err(EngineError::NoRecipients);
        }

        let mut frames = Vec::with_capacity(sessions.len() * 2);
        let mut new_states = Vec::with_capacity(sessions.len());
        for session in &sessions {
            let step = self.channel.dm_encrypt(&session.state, &plaintext)?;
            frames.push(
                serde_json::json!({
                    "type": "listen",
                    "inbox_id": step.receiving_inbox,
                })
                .to_string(),
            );
            frames.push(
                serde_json::json!({
                    "type": "direct",
                    "inbox_id": session.inbox_id,
                    "envelope": step.envelope,
                })
                .to_string(),
            );
            new_states.push(EncryptionState {
                conversation_id: conversation_id.clone(),
                inbox_id: session.inbox_id.clone(),
                state: step.new_state,
                timestamp: now_millis(),
                sent_accept: step.sent_accept,
            });
        }
        self.hub.send_direct(frames).await?;
        for state in &new_states {
            self.store.save_encryption_state(state, true)?;
        }
        drop(guard);

        self.store.save_message(&wire)?;
        self.mark_send_sent(&wire);
        Ok(())
    }

    /// Encrypt and send a control payload (pin, mute, kick, ...) over the
    /// space's sync conversation. Control messages are not persisted in the
    /// local log; their local effects are applied by the handler.
    pub async fn send_control(
        &self,
        space_id: &str,
        channel_id: &str,
        content: MessageContent,
    ) -> Result<(), EngineError> {
        let nonce = uuid::Uuid::new_v4().to_string();
        let now = now_millis();
        let label = control_label(&content);
        let message = Message {
            space_id: space_id.to_string(),
            channel_id: channel_id.to_string(),
            message_id: derive_message_id(&nonce, label, content.sender_id(), ""),
            nonce,
            created_date: now,
            modified_date: now,
            content,
            edits: vec![],
            public_key: None,
            signature: None,
            send_status: None,
            send_error: None,
        };
        let plaintext = serde_json::to_vec(&message)?;

        let conversation_id = space_conversation_id(space_id);
        let lock = self.locks.for_conversation(&conversation_id);
        let _guard = lock.lock().await;
        let current = self.current_state(&conversation_id)?;
        let step = self.channel.ratchet_encrypt(&current.state, &plaintext)?;
        let payload = serde_json::json!({
            "type": "control",
            "envelope": step.envelope,
        })
        .to_string();
        self.hub.send_hub_message(space_id, &payload).await?;
        self.store.save_encryption_state(
            &EncryptionState {
                conversation_id,
                inbox_id: current.inbox_id,
                state: step.new_state,
                timestamp: now_millis(),
                sent_accept: current.sent_accept,
            },
            true,
        )?;
        Ok(())
    }

    fn current_state(&self, conversation_id: &str) -> Result<EncryptionState, EngineError> {
        self.store
            .get_encryption_states(conversation_id)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                EngineError::InvalidInput(format!(
                    "no encryption session for conversation {conversation_id}"
                ))
            })
    }

    /// Steps 8–9: reconcile the optimistic cache entry and publish the new
    /// status. An entry evicted while offline is re-inserted in order.
    fn mark_send_sent(&self, wire: &Message) {
        if !self.cache.update_status(
            &wire.space_id,
            &wire.channel_id,
            &wire.message_id,
            SendStatus::Sent,
            None,
        ) {
            let mut restored = wire.clone();
            restored.send_status = Some(SendStatus::Sent);
            self.cache.upsert(restored);
        }
        let _ = self.events.send(EngineEvent::MessageStatusChanged {
            space_id: wire.space_id.clone(),
            channel_id: wire.channel_id.clone(),
            message_id: wire.message_id.clone(),
            status: SendStatus::Sent,
            error: None,
        });
        if let MessageContent::Post {
            replies_to_message_id: Some(parent),
            ..
        } = &wire.content
        {
            let _ = self.events.send(EngineEvent::ReplyDigestInvalidated {
                parent_message_id: parent.clone(),
            });
        }
    }

    pub(crate) fn mark_send_failed(&self, message: &Message, reason: &str) {
        tracing::warn!(
            message_id = %message.message_id,
            reason,
            "marking message send as failed"
        );
        if !self.cache.update_status(
            &message.space_id,
            &message.channel_id,
            &message.message_id,
            SendStatus::Failed,
            Some(reason.to_string()),
        ) {
            let mut restored = message.clone();
            restored.send_status = Some(SendStatus::Failed);
            restored.send_error = Some(reason.to_string());
            self.cache.upsert(restored);
        }
        let _ = self.events.send(EngineEvent::MessageStatusChanged {
            space_id: message.space_id.clone(),
            channel_id: message.channel_id.clone(),
            message_id: message.message_id.clone(),
            status: SendStatus::Failed,
            error: Some(reason.to_string()),
        });
    }
}

fn control_label(content: &MessageContent) -> &'static str {
    match content {
        MessageContent::Post { .. } => "post",
        MessageContent::EditMessage { .. } => "edit-message",
        MessageContent::RemoveMessage { .. } => "remove-message",
        MessageContent::Reaction { .. } => "reaction",
        MessageContent::RemoveReaction { .. } => "remove-reaction",
        MessageContent::Pin { .. } => "pin",
        MessageContent::Unpin { .. } => "unpin",
        MessageContent::Mute { .. } => "mute",
        MessageContent::Unmute { .. } => "unmute",
        MessageContent::Kick { .. } => "kick",
        MessageContent::UpdateSpace { .. } => "update-space",
    }
}

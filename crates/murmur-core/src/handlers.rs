//! Task execution: one exhaustive match over [`Action`], plus the
//! per-kind error classification and user-notice policy the queue applies.
//!
//! Every handler starts with an existence guard. A task enqueued while the
//! target still existed but executed after it vanished degrades to a
//! silent no-op instead of an error storm.

use std::sync::Arc;

use crate::cache::ConversationCache;
use crate::crypto::SecureChannel;
use crate::error::EngineError;
use crate::events::EngineEvent;
use crate::hub::HubClient;
use crate::pipeline::Pipeline;
use crate::store::MessageStore;
use crate::sync::ConfigSync;
use crate::tasks::Action;
use crate::types::{now_millis, MessageContent, MessageEdit};

/// Classify a handler failure for its task kind. Permanent failures are
/// never retried; everything else is transient and goes through backoff.
pub fn is_permanent_error(kind: &str, error: &EngineError) -> bool {
    let status = error.status_code();
    let message = error.to_string().to_lowercase();
    match kind {
        "save-user-config" => message.contains("validation") || message.contains("invalid"),
        "update-space" | "kick-user" => {
            message.contains("permission") || status == Some(403) || message.contains("not found")
        }
        "mute-user" | "unmute-user" => message.contains("permission") || status == Some(403),
        "reaction" | "pin-message" | "unpin-message" | "edit-message" => status == Some(404),
        // 404 on a deletion is handled as success by the handler itself;
        // anything that still fails here is worth retrying.
        "delete-message" => false,
        "send-channel-message" => {
            matches!(status, Some(400) | Some(403))
                || message.contains("space was deleted")
                || message.contains("channel was deleted")
        }
        "send-dm" => {
            matches!(status, Some(400) | Some(403))
                || matches!(error, EngineError::NoRecipients)
        }
        _ => false,
    }
}

/// Toast-level success text, where the kind defines one. Message-level
/// operations stay silent; their feedback is the inline message status.
pub fn success_notice(kind: &str) -> Option<&'static str> {
    match kind {
        "update-space" => Some("Space updated"),
        "kick-user" => Some("User removed from space"),
        "mute-user" => Some("User muted"),
        "unmute-user" => Some("User unmuted"),
        _ => None,
    }
}

pub fn failure_notice(kind: &str) -> Option<&'static str> {
    match kind {
        "save-user-config" => Some("Could not save settings"),
        "update-space" => Some("Could not update space"),
        "kick-user" => Some("Could not remove user"),
        "mute-user" => Some("Could not mute user"),
        "unmute-user" => Some("Could not unmute user"),
        _ => None,
    }
}

pub struct Handlers<H, C> {
    store: Arc<MessageStore>,
    cache: Arc<ConversationCache>,
    events: flume::Sender<EngineEvent>,
    pipeline: Pipeline<H, C>,
    sync: ConfigSync<H, C>,
}

impl<H: HubClient, C: SecureChannel> Handlers<H, C> {
    pub fn new(
        store: Arc<MessageStore>,
        cache: Arc<ConversationCache>,
        events: flume::Sender<EngineEvent>,
        pipeline: Pipeline<H, C>,
        sync: ConfigSync<H, C>,
    ) -> Self {
        Self {
            store,
            cache,
            events,
            pipeline,
            sync,
        }
    }

    pub async fn execute(&self, action: &Action) -> Result<(), EngineError> {
        match action {
            Action::SaveUserConfig { config, keyset } => {
                self.sync.save_config(config.clone(), keyset).await
            }
            Action::UpdateSpace {
                sender_address,
                space,
            } => {
                if self.store.get_space(&space.space_id)?.is_none() {
                    tracing::debug!(space_id = %space.space_id, "space already deleted, skipping update");
                    return Ok(());
                }
                self.pipeline
                    .send_control(
                        &space.space_id,
                        &space.space_id,
                        MessageContent::UpdateSpace {
                            sender_id: sender_address.clone(),
                            space: space.clone(),
                        },
                    )
                    .await?;
                self.store.save_space(space)?;
                let _ = self.events.send(EngineEvent::SpacesUpdated);
                Ok(())
            }
            Action::KickUser {
                space_id,
                sender_address,
                target_address,
            } => {
                if self.store.get_space(space_id)?.is_none() {
                    return Ok(());
                }
                let members = self.store.get_space_members(space_id)?;
                if !members.iter().any(|m| &m.address == target_address) {
                    tracing::debug!(space_id, target_address, "target already left, skipping kick");
                    return Ok(());
                }
                self.pipeline
                    .send_control(
                        space_id,
                        space_id,
                        MessageContent::Kick {
                            sender_id: sender_address.clone(),
                            target_address: target_address.clone(),
                        },
                    )
                    .await?;
                self.store.delete_space_member(space_id, target_address)?;
                Ok(())
            }
            Action::MuteUser {
                space_id,
                channel_id,
                sender_address,
                target_address,
            } => {
                if self.store.get_space(space_id)?.is_none() {
                    return Ok(());
                }
                self.pipeline
                    .send_control(
                        space_id,
                        channel_id,
                        MessageContent::Mute {
                            sender_id: sender_address.clone(),
                            target_address: target_address.clone(),
                        },
                    )
                    .await
            }
            Action::UnmuteUser {
                space_id,
                channel_id,
                sender_address,
                target_address,
            } => {
                if self.store.get_space(space_id)?.is_none() {
                    return Ok(());
                }
                self.pipeline
                    .send_control(
                        space_id,
                        channel_id,
                        MessageContent::Unmute {
                            sender_id: sender_address.clone(),
                            target_address: target_address.clone(),
                        },
                    )
                    .await
            }
            Action::Reaction {
                space_id,
                channel_id,
                sender_address,
                target_message_id,
                reaction,
                remove,
            } => {
                if self.store.get_space(space_id)?.is_none() {
                    return Ok(());
                }
                if self
                    .store
                    .get_message(space_id, channel_id, target_message_id)?
                    .is_none()
                {
                    return Ok(());
                }
                let content = if *remove {
                    MessageContent::RemoveReaction {
                        sender_id: sender_address.clone(),
                        message_id: target_message_id.clone(),
                        reaction: reaction.clone(),
                    }
                } else {
                    MessageContent::Reaction {
                        sender_id: sender_address.clone(),
                        message_id: target_message_id.clone(),
                        reaction: reaction.clone(),
                    }
                };
                self.pipeline.send_control(space_id, channel_id, content).await
            }
            Action::PinMessage {
                space_id,
                channel_id,
                sender_address,
                target_message_id,
            } => {
                if self.store.get_space(space_id)?.is_none() {
                    return Ok(());
                }
                if self
                    .store
                    .get_message(space_id, channel_id, target_message_id)?
                    .is_none()
                {
                    tracing::debug!(target_message_id, "message already gone, skipping pin");
                    return Ok(());
                }
                self.pipeline
                    .send_control(
                        space_id,
                        channel_id,
                        MessageContent::Pin {
                            sender_id: sender_address.clone(),
                            message_id: target_message_id.clone(),
                        },
                    )
                    .await
            }
            Action::UnpinMessage {
                space_id,
                channel_id,
                sender_address,
                target_message_id,
            } => {
                if self.store.get_space(space_id)?.is_none() {
                    return Ok(());
                }
                if self
                    .store
                    .get_message(space_id, channel_id, target_message_id)?
                    .is_none()
                {
                    return Ok(());
                }
                self.pipeline
                    .send_control(
                        space_id,
                        channel_id,
                        MessageContent::Unpin {
                            sender_id: sender_address.clone(),
                            message_id: target_message_id.clone(),
                        },
                    )
                    .await
            }
            Action::EditMessage {
                space_id,
                channel_id,
                sender_address,
                target_message_id,
                text,
            } => {
                if self.store.get_space(space_id)?.is_none() {
                    return Ok(());
                }
                let Some(stored) =
                    self.store.get_message(space_id, channel_id, target_message_id)?
                else {
                    return Ok(());
                };
                self.pipeline
                    .send_control(
                        space_id,
                        channel_id,
                        MessageContent::EditMessage {
                            sender_id: sender_address.clone(),
                            original_message_id: target_message_id.clone(),
                            text: text.clone(),
                        },
                    )
                    .await?;
                // The receive path is not involved for one's own edits;
                // apply the local effect here.
                let edit = MessageEdit {
                    text: text.clone(),
                    edited_date: now_millis(),
                };
                let mut updated = stored;
                updated.edits.push(edit.clone());
                updated.modified_date = edit.edited_date;
                self.store.save_message(&updated)?;
                let mut cached = self
                    .cache
                    .get(space_id, channel_id, target_message_id)
                    .unwrap_or_else(|| updated.clone());
                cached.edits = updated.edits.clone();
                cached.modified_date = updated.modified_date;
                self.cache.upsert(cached);
                Ok(())
            }
            Action::DeleteMessage {
                space_id,
                channel_id,
                sender_address,
                target_message_id,
            } => {
                if self.store.get_space(space_id)?.is_none() {
                    return Ok(());
                }
                if self
                    .store
                    .get_message(space_id, channel_id, target_message_id)?
                    .is_none()
                {
                    tracing::debug!(target_message_id, "message already deleted locally");
                    return Ok(());
                }
                let result = self
                    .pipeline
                    .send_control(
                        space_id,
                        channel_id,
                        MessageContent::RemoveMessage {
                            sender_id: sender_address.clone(),
                            remove_message_id: target_message_id.clone(),
                        },
                    )
                    .await;
                match result {
                    Ok(()) => {}
                    // Already deleted remotely: success, not an error.
                    Err(e) if e.status_code() == Some(404) => {
                        tracing::debug!(target_message_id, "message already deleted remotely");
                    }
                    Err(e) => return Err(e),
                }
                self.store.delete_message(target_message_id)?;
                self.cache.remove(space_id, channel_id, target_message_id);
                Ok(())
            }
            Action::SendChannelMessage {
                space_id,
                channel_id,
                message,
            } => {
                self.pipeline
                    .send_channel_message(space_id, channel_id, message)
                    .await
            }
            Action::SendDm { address, message } => self.pipeline.send_dm(address, message).await,
        }
    }

    /// Terminal-failure hook. Send tasks surface through the message's
    /// inline status; other kinds rely on the queue's notice policy.
    pub async fn on_failure(&self, action: &Action, error: &EngineError) {
        match action {
            Action::SendChannelMessage { message, .. } | Action::SendDm { message, .. } => {
                self.pipeline.mark_send_failed(message, &error.to_string());
            }
            _ => {}
        }
    }
}

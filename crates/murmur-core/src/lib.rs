//! Murmur core: the offline-resilient delivery and synchronization engine
//! of an end-to-end-encrypted spaces/DM messaging client.
//!
//! The engine turns user intents (send, edit, delete, pin, mute, kick,
//! save settings) into confirmed effects against a remote hub and an
//! encrypted per-device configuration store. Intents are persisted in a
//! durable action queue before the first execution attempt, so they
//! survive restarts and network outages; the send pipeline serializes all
//! ratchet state access per conversation so no message is ever encrypted
//! against a stale session.
//!
//! Hosts construct an [`Engine`] with their [`HubClient`] transport and
//! [`SecureChannel`] crypto implementations, spawn the queue's drain loop,
//! and render from the conversation cache, reacting to [`EngineEvent`]s.

pub mod cache;
pub mod crypto;
mod error;
mod events;
pub mod handlers;
pub mod hub;
mod logging;
pub mod pipeline;
pub mod queue;
pub mod store;
pub mod sync;
pub mod tasks;
pub mod types;
pub mod window;

use std::sync::Arc;

use cache::ConversationCache;
use crypto::{decode_key, SecureChannel};
use pipeline::{derive_message_id, Pipeline};
use queue::ActionQueue;
use store::MessageStore;
use sync::ConfigSync;
use tasks::Action;
use types::{now_millis, Message, MessageContent, SendStatus, UserConfig, UserKeyset};
use window::MessageWindow;

pub use error::EngineError;
pub use events::EngineEvent;
pub use hub::HubClient;
pub use logging::init_logging;
pub use store::QueueStats;

/// The engine façade: wires the store, cache, queue, handlers and config
/// sync together with injected hub/crypto collaborators. Each instance
/// owns its whole view; there is no module-level state.
pub struct Engine<H, C> {
    store: Arc<MessageStore>,
    cache: Arc<ConversationCache>,
    channel: Arc<C>,
    queue: Arc<ActionQueue<H, C>>,
    sync: ConfigSync<H, C>,
    events: flume::Receiver<EngineEvent>,
}

impl<H: HubClient, C: SecureChannel> Engine<H, C> {
    pub fn new(store: MessageStore, hub: H, channel: C) -> Self {
        let store = Arc::new(store);
        let cache = Arc::new(ConversationCache::new());
        let hub = Arc::new(hub);
        let channel = Arc::new(channel);
        let (tx, rx) = flume::unbounded();

        let pipeline = Pipeline::new(
            store.clone(),
            hub.clone(),
            channel.clone(),
            cache.clone(),
            tx.clone(),
        );
        let sync = ConfigSync::new(store.clone(), hub.clone(), channel.clone(), tx.clone());
        let handlers = handlers::Handlers::new(
            store.clone(),
            cache.clone(),
            tx.clone(),
            pipeline,
            sync.clone(),
        );
        let queue = Arc::new(ActionQueue::new(store.clone(), handlers, tx));
        if let Err(e) = queue.reset_stuck_tasks() {
            tracing::warn!(%e, "failed to reset stuck tasks at startup");
        }

        Self {
            store,
            cache,
            channel,
            queue,
            sync,
            events: rx,
        }
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<ActionQueue<H, C>> {
        &self.queue
    }

    /// Update stream for the host. Receivers are independent clones of one
    /// channel; events are consumed by whichever receiver polls first.
    pub fn events(&self) -> flume::Receiver<EngineEvent> {
        self.events.clone()
    }

    /// Current rendered view of a conversation.
    pub fn messages(&self, space_id: &str, channel_id: &str) -> Vec<Message> {
        self.cache.snapshot(space_id, channel_id)
    }

    pub fn set_online(&self, online: bool) {
        self.queue.set_online(online);
    }

    pub fn enqueue(&self, action: Action) -> Result<i64, EngineError> {
        self.queue.enqueue(action)
    }

    pub fn cancel_task(&self, task_id: i64) -> Result<bool, EngineError> {
        self.queue.cancel(task_id)
    }

    pub fn queue_stats(&self) -> Result<QueueStats, EngineError> {
        self.queue.stats()
    }

    /// Sign a channel post, show it optimistically and queue it for the
    /// encrypted send pipeline. Returns the new message id.
    pub fn submit_channel_message(
        &self,
        space_id: &str,
        channel_id: &str,
        keyset: &UserKeyset,
        text: &str,
        replies_to_message_id: Option<String>,
    ) -> Result<String, EngineError> {
        let space = self.store.get_space(space_id)?.ok_or_else(|| {
            EngineError::InvalidInput(format!("unknown space {space_id}"))
        })?;

        let nonce = uuid::Uuid::new_v4().to_string();
        let message_id = derive_message_id(&nonce, "post", &keyset.address, text);
        // Repudiable spaces carry unsigned posts; everywhere else the post
        // is signed with the device's space inbox key.
        let (public_key, signature) = if space.is_repudiable {
            (None, None)
        } else {
            let inbox = self.store.get_space_key(space_id, "inbox")?.ok_or_else(|| {
                EngineError::InvalidInput(format!("space {space_id} has no inbox key"))
            })?;
            let sig = self
                .channel
                .sign(&decode_key(&inbox.private_key)?, message_id.as_bytes())?;
            (Some(inbox.public_key), Some(hex::encode(sig)))
        };

        let now = now_millis();
        let message = Message {
            space_id: space_id.to_string(),
            channel_id: channel_id.to_string(),
            message_id: message_id.clone(),
            nonce,
            created_date: now,
            modified_date: now,
            content: MessageContent::Post {
                sender_id: keyset.address.clone(),
                text: text.to_string(),
                replies_to_message_id,
            },
            edits: vec![],
            public_key,
            signature,
            send_status: Some(SendStatus::Sending),
            send_error: None,
        };
        self.submit(
            message,
            |message| Action::SendChannelMessage {
                space_id: space_id.to_string(),
                channel_id: channel_id.to_string(),
                message,
            },
        )?;
        Ok(message_id)
    }

    /// Sign a direct message with the user key, show it optimistically and
    /// queue it. DMs store the counterparty address as space and channel.
    pub fn submit_direct_message(
        &self,
        address: &str,
        keyset: &UserKeyset,
        text: &str,
        replies_to_message_id: Option<String>,
    ) -> Result<String, EngineError> {
        let nonce = uuid::Uuid::new_v4().to_string();
        let message_id = derive_message_id(&nonce, "post", &keyset.address, text);
        let signature = self
            .channel
            .sign(&keyset.private_key, message_id.as_bytes())?;

        let now = now_millis();
        let message = Message {
            space_id: address.to_string(),
            channel_id: address.to_string(),
            message_id: message_id.clone(),
            nonce,
            created_date: now,
            modified_date: now,
            content: MessageContent::Post {
                sender_id: keyset.address.clone(),
                text: text.to_string(),
                replies_to_message_id,
            },
            edits: vec![],
            public_key: Some(hex::encode(&keyset.public_key)),
            signature: Some(hex::encode(signature)),
            send_status: Some(SendStatus::Sending),
            send_error: None,
        };
        self.submit(
            message,
            |message| Action::SendDm {
                address: address.to_string(),
                message,
            },
        )?;
        Ok(message_id)
    }

    fn submit(
        &self,
        message: Message,
        to_action: impl FnOnce(Message) -> Action,
    ) -> Result<i64, EngineError> {
        self.cache.upsert(message.clone());
        match self.queue.enqueue(to_action(message.clone())) {
            Ok(id) => Ok(id),
            Err(e) => {
                self.cache.update_status(
                    &message.space_id,
                    &message.channel_id,
                    &message.message_id,
                    SendStatus::Failed,
                    Some(e.to_string()),
                );
                Err(e)
            }
        }
    }

    /// Re-queue a failed message. Only `failed` messages may go back
    /// through `sending`; anything else is refused.
    pub fn retry_failed_send(
        &self,
        space_id: &str,
        channel_id: &str,
        message_id: &str,
    ) -> Result<(), EngineError> {
        let Some(mut message) = self.cache.get(space_id, channel_id, message_id) else {
            return Err(EngineError::MessageNotFound(message_id.to_string()));
        };
        if message.send_status != Some(SendStatus::Failed) {
            return Err(EngineError::InvalidInput(
                "only failed messages can be resent".into(),
            ));
        }
        message.send_status = Some(SendStatus::Sending);
        message.send_error = None;
        self.cache.upsert(message.clone());
        let action = if message.is_dm() {
            Action::SendDm {
                address: message.space_id.clone(),
                message,
            }
        } else {
            Action::SendChannelMessage {
                space_id: space_id.to_string(),
                channel_id: channel_id.to_string(),
                message,
            }
        };
        self.queue.enqueue(action)?;
        Ok(())
    }

    /// Deep-link/resume navigation: load a window around a message and
    /// replace the conversation's cached view with it.
    pub fn load_messages_around(
        &self,
        space_id: &str,
        channel_id: &str,
        target_message_id: &str,
        before_limit: usize,
        after_limit: usize,
    ) -> Result<MessageWindow, EngineError> {
        window::load_messages_around(
            &self.store,
            &self.cache,
            space_id,
            channel_id,
            target_message_id,
            before_limit,
            after_limit,
        )
    }

    pub async fn get_config(
        &self,
        address: &str,
        keyset: &UserKeyset,
    ) -> Result<UserConfig, EngineError> {
        self.sync.get_config(address, keyset).await
    }

    pub async fn save_config(
        &self,
        config: UserConfig,
        keyset: &UserKeyset,
    ) -> Result<(), EngineError> {
        self.sync.save_config(config, keyset).await
    }
}

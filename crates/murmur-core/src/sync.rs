//! Encrypted cross-device configuration sync.
//!
//! `get_config` reconciles the server's settings blob against the local
//! copy (last-writer-wins by timestamp, authenticity gated by signature)
//! and bootstraps any space this device has not seen yet. `save_config`
//! persists locally first, then snapshots every known space's keys and
//! session state into the uploaded blob.
//!
//! Space bootstrap is a persisted state machine: each completed step is
//! recorded, so a crash mid-bootstrap resumes from the last completed step
//! on the next sync instead of restarting. One space's failure is logged
//! and does not block the remaining spaces.

use std::sync::Arc;

use crate::crypto::{
    config_signing_bytes, decode_key, derive_config_key, open_config, seal_config, SecureChannel,
};
use crate::error::EngineError;
use crate::events::EngineEvent;
use crate::hub::{HubClient, InboxRegistration, SettingsRecord};
use crate::store::MessageStore;
use crate::types::{
    now_millis, space_conversation_id, BootstrapStep, EncryptionState, Space, SpaceKey,
    SpaceKeyBundle, UserConfig, UserKeyset,
};

pub struct ConfigSync<H, C> {
    store: Arc<MessageStore>,
    hub: Arc<H>,
    channel: Arc<C>,
    events: flume::Sender<EngineEvent>,
}

impl<H, C> Clone for ConfigSync<H, C> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            hub: self.hub.clone(),
            channel: self.channel.clone(),
            events: self.events.clone(),
        }
    }
}

impl<H: HubClient, C: SecureChannel> ConfigSync<H, C> {
    pub fn new(
        store: Arc<MessageStore>,
        hub: Arc<H>,
        channel: Arc<C>,
        events: flume::Sender<EngineEvent>,
    ) -> Self {
        Self {
            store,
            hub,
            channel,
            events,
        }
    }

    /// Reconcile remote and local config for `address`. The remote copy is
    /// only trusted when it is strictly newer AND its signature verifies;
    /// every other outcome falls back to the local copy (or a default).
    pub async fn get_config(
        &self,
        address: &str,
        keyset: &UserKeyset,
    ) -> Result<UserConfig, EngineError> {
        let local = self.store.get_user_config(address)?;

        let remote = match self.hub.get_user_settings(address).await {
            Ok(remote) => remote,
            Err(e) => {
                tracing::warn!(%e, address, "settings fetch failed, using local config");
                return Ok(self.finish_with_local(local, address, keyset).await);
            }
        };
        let Some(remote) = remote else {
            return Ok(self.finish_with_local(local, address, keyset).await);
        };

        if let Some(local) = local.clone() {
            if remote.timestamp < local.timestamp {
                // Do not overwrite the server from here; the next
                // save_config will correct it.
                tracing::warn!(
                    address,
                    remote_ts = remote.timestamp,
                    local_ts = local.timestamp,
                    "remote config is stale, keeping local"
                );
                return Ok(self.finish_with_local(Some(local), address, keyset).await);
            }
            if remote.timestamp == local.timestamp {
                // Local is canonical; skip the redundant decrypt.
                return Ok(self.finish_with_local(Some(local), address, keyset).await);
            }
        }

        let Some(config) = self.open_remote(&remote, keyset) else {
            return Ok(self.finish_with_local(local, address, keyset).await);
        };

        let spaces_added = self.bootstrap_unknown_spaces(&config, keyset).await;
        self.store.save_user_config(&config)?;
        let _ = self.events.send(EngineEvent::ConfigUpdated {
            address: address.to_string(),
        });
        if spaces_added {
            let _ = self.events.send(EngineEvent::SpacesUpdated);
        }
        Ok(config)
    }

    /// Stamp and persist the config locally, then upload an encrypted
    /// snapshot when sync is enabled. Local persistence happens first:
    /// local is authoritative even offline, and a failed upload just
    /// leaves local newer than remote until the next save.
    pub async fn save_config(
        &self,
        mut config: UserConfig,
        keyset: &UserKeyset,
    ) -> Result<(), EngineError> {
        config.address = keyset.address.clone();
        config.timestamp = now_millis();
        self.store.save_user_config(&config)?;
        let _ = self.events.send(EngineEvent::ConfigUpdated {
            address: config.address.clone(),
        });
        if !config.allow_sync {
            return Ok(());
        }

        let mut upload = config.clone();
        upload.space_keys.clear();
        upload.space_ids.clear();
        for space in self.store.get_spaces()? {
            let keys = self.store.get_space_keys(&space.space_id)?;
            if keys.is_empty() {
                continue;
            }
            let conversation_id = space_conversation_id(&space.space_id);
            let Some(state) = self
                .store
                .get_encryption_states(&conversation_id)?
                .into_iter()
                .next()
            else {
                tracing::warn!(
                    space_id = %space.space_id,
                    "space has no session state, leaving it out of the sync snapshot"
                );
                continue;
            };
            upload.space_ids.push(space.space_id.clone());
            upload.space_keys.push(SpaceKeyBundle {
                space_id: space.space_id.clone(),
                encryption_state: state,
                keys,
            });
        }

        let key = derive_config_key(&keyset.private_key);
        let blob = seal_config(&key, &serde_json::to_vec(&upload)?)?;
        let signature = self
            .channel
            .sign(&keyset.private_key, &config_signing_bytes(&blob, config.timestamp))?;
        let record = SettingsRecord {
            user_address: config.address.clone(),
            user_public_key: hex::encode(&keyset.public_key),
            user_config: blob,
            timestamp: config.timestamp,
            signature: hex::encode(signature),
        };
        self.hub.put_user_settings(&record).await?;
        Ok(())
    }

    /// Verify and decrypt a remote settings record. Any failure discards
    /// the remote payload; an unverified write is never trusted.
    fn open_remote(&self, remote: &SettingsRecord, keyset: &UserKeyset) -> Option<UserConfig> {
        let Ok(signature) = hex::decode(&remote.signature) else {
            tracing::warn!(address = %remote.user_address, "remote config signature is not hex, discarding");
            return None;
        };
        let signing = config_signing_bytes(&remote.user_config, remote.timestamp);
        if !self.channel.verify(&keyset.public_key, &signing, &signature) {
            tracing::warn!(address = %remote.user_address, "remote config signature rejected, discarding");
            return None;
        }
        let key = derive_config_key(&keyset.private_key);
        let plaintext = match open_config(&key, &remote.user_config) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(%e, address = %remote.user_address, "remote config decrypt failed, discarding");
                return None;
            }
        };
        let mut config: UserConfig = match serde_json::from_slice(&plaintext) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(%e, address = %remote.user_address, "remote config is not valid JSON, discarding");
                return None;
            }
        };
        config.address = remote.user_address.clone();
        config.timestamp = remote.timestamp;
        Some(config)
    }

    /// Keep the local config, but still finish any bootstrap a previous
    /// run left incomplete; the bundles live in the persisted config.
    async fn finish_with_local(
        &self,
        local: Option<UserConfig>,
        address: &str,
        keyset: &UserKeyset,
    ) -> UserConfig {
        let config = local_or_default(local, address);
        if self.bootstrap_unknown_spaces(&config, keyset).await {
            let _ = self.events.send(EngineEvent::SpacesUpdated);
        }
        config
    }

    /// Bootstrap every space in the config this device does not have yet.
    /// Spaces process sequentially with per-space fault isolation: one
    /// failure is logged and the remaining spaces still run. Returns true
    /// when at least one space finished bootstrapping.
    async fn bootstrap_unknown_spaces(&self, config: &UserConfig, keyset: &UserKeyset) -> bool {
        let mut spaces_added = false;
        for bundle in &config.space_keys {
            match self.needs_bootstrap(&bundle.space_id) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) => {
                    tracing::warn!(%e, space_id = %bundle.space_id, "bootstrap progress check failed");
                    continue;
                }
            }
            match self.bootstrap_space(bundle, keyset).await {
                Ok(()) => spaces_added = true,
                Err(e) => {
                    tracing::warn!(
                        %e,
                        space_id = %bundle.space_id,
                        "space bootstrap failed, continuing with remaining spaces"
                    );
                }
            }
        }
        spaces_added
    }

    /// A space needs bootstrapping when it is unknown locally or a previous
    /// bootstrap was interrupted before its final step.
    fn needs_bootstrap(&self, space_id: &str) -> Result<bool, EngineError> {
        match self.store.get_bootstrap_step(space_id)? {
            Some(BootstrapStep::ListenEnqueued) => Ok(false),
            Some(_) => Ok(true),
            None => Ok(self.store.get_space(space_id)?.is_none()),
        }
    }

    pub(crate) async fn bootstrap_space(
        &self,
        bundle: &SpaceKeyBundle,
        keyset: &UserKeyset,
    ) -> Result<(), EngineError> {
        let space_id = &bundle.space_id;
        let mut step = self.store.get_bootstrap_step(space_id)?;

        if step.is_none() {
            let has_key = |key_id: &str| bundle.keys.iter().any(|k| k.key_id == key_id);
            if !has_key("config") || !has_key("hub") {
                return Err(EngineError::InvalidInput(format!(
                    "space {space_id} bundle is missing config or hub keys"
                )));
            }
            for key in &bundle.keys {
                self.store.save_space_key(key)?;
            }
            self.store
                .set_bootstrap_step(space_id, BootstrapStep::KeysSaved, now_millis())?;
            step = Some(BootstrapStep::KeysSaved);
        }

        if step < Some(BootstrapStep::ManifestSaved) {
            let manifest = self
                .hub
                .get_space_manifest(space_id)
                .await?
                .ok_or_else(|| {
                    EngineError::InvalidInput(format!("space {space_id} has no manifest"))
                })?;
            let config_key = self.required_key(space_id, "config")?;
            let plaintext = self.channel.open_inbox_envelope(
                &decode_key(&config_key.private_key)?,
                &decode_key(&manifest.ephemeral_public_key)?,
                &manifest.space_manifest,
            )?;
            let space: Space = serde_json::from_slice(&plaintext)?;
            self.store.save_space(&space)?;
            self.store
                .set_bootstrap_step(space_id, BootstrapStep::ManifestSaved, now_millis())?;
            step = Some(BootstrapStep::ManifestSaved);
        }

        if step < Some(BootstrapStep::InboxRegistered) {
            let registration = self.hub.get_space_registration(space_id).await?;
            let hub_key = self.required_key(space_id, "hub")?;
            // Reuse the inbox key from an interrupted attempt instead of
            // minting a second one.
            let inbox = match self.store.get_space_key(space_id, "inbox")? {
                Some(existing) => existing,
                None => {
                    let keypair = self.channel.generate_inbox_keypair();
                    let inbox = SpaceKey {
                        space_id: space_id.clone(),
                        key_id: "inbox".into(),
                        address: Some(keyset.address.clone()),
                        public_key: hex::encode(&keypair.public_key),
                        private_key: hex::encode(&keypair.private_key),
                    };
                    self.store.save_space_key(&inbox)?;
                    inbox
                }
            };
            // Session state from the bundle, tracked under the new inbox.
            // Non-replacing write: a resumed attempt must not clobber state
            // the send path has already advanced.
            self.store.save_encryption_state(
                &EncryptionState {
                    conversation_id: space_conversation_id(space_id),
                    inbox_id: inbox.public_key.clone(),
                    state: bundle.encryption_state.state.clone(),
                    timestamp: now_millis(),
                    sent_accept: bundle.encryption_state.sent_accept,
                },
                false,
            )?;
            let hub_signature = self.channel.sign(
                &decode_key(&hub_key.private_key)?,
                format!("add{}", inbox.public_key).as_bytes(),
            )?;
            let inbox_signature = self.channel.sign(
                &decode_key(&inbox.private_key)?,
                format!("add{}", hub_key.public_key).as_bytes(),
            )?;
            self.hub
                .register_inbox(&InboxRegistration {
                    hub_address: registration.hub_address,
                    hub_public_key: hub_key.public_key.clone(),
                    hub_signature: hex::encode(hub_signature),
                    inbox_public_key: inbox.public_key.clone(),
                    inbox_signature: hex::encode(inbox_signature),
                })
                .await?;
            self.store
                .set_bootstrap_step(space_id, BootstrapStep::InboxRegistered, now_millis())?;
            step = Some(BootstrapStep::InboxRegistered);
        }

        if step < Some(BootstrapStep::ListenEnqueued) {
            let inbox = self.required_key(space_id, "inbox")?;
            let listen = serde_json::json!({
                "type": "listen",
                "inbox_id": inbox.public_key,
            })
            .to_string();
            self.hub.send_direct(vec![listen]).await?;
            let sync = serde_json::json!({
                "type": "control",
                "action": "sync",
                "inbox_id": inbox.public_key,
            })
            .to_string();
            self.hub.send_hub_message(space_id, &sync).await?;
            self.store
                .set_bootstrap_step(space_id, BootstrapStep::ListenEnqueued, now_millis())?;
        }

        tracing::info!(space_id = %space_id, "space bootstrap complete");
        Ok(())
    }

    fn required_key(&self, space_id: &str, key_id: &str) -> Result<SpaceKey, EngineError> {
        self.store.get_space_key(space_id, key_id)?.ok_or_else(|| {
            EngineError::InvalidInput(format!("space {space_id} has no {key_id} key"))
        })
    }
}

fn local_or_default(local: Option<UserConfig>, address: &str) -> UserConfig {
    local.unwrap_or_else(|| UserConfig::default_for(address))
}

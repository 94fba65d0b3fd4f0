//! Programmable fakes for the hub transport and crypto collaborators, plus
//! store seeding helpers shared by the engine flow tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use murmur_core::crypto::{CryptoError, DmStep, RatchetStep, SecureChannel};
use murmur_core::hub::{
    HubClient, HubError, InboxRegistration, ManifestPayload, SettingsRecord, SpaceRegistration,
};
use murmur_core::store::MessageStore;
use murmur_core::types::{
    space_conversation_id, Channel, ChannelGroup, EncryptionState, Space, SpaceKey, UserKeyset,
};

// ── Fake hub ─────────────────────────────────────────────────────────

#[derive(Default)]
struct HubState {
    hub_messages: Vec<(String, String)>,
    direct_batches: Vec<Vec<String>>,
    settings: HashMap<String, SettingsRecord>,
    put_records: Vec<SettingsRecord>,
    registrations: HashMap<String, SpaceRegistration>,
    manifests: HashMap<String, ManifestPayload>,
    inbox_registrations: Vec<InboxRegistration>,
    fail_hub_sends: VecDeque<HubError>,
    fail_direct_sends: VecDeque<HubError>,
    fail_inbox_registrations: VecDeque<HubError>,
    fail_settings_fetch: Option<HubError>,
}

#[derive(Clone, Default)]
pub struct FakeHub {
    inner: Arc<Mutex<HubState>>,
}

impl FakeHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_settings(&self, record: SettingsRecord) {
        let mut state = self.inner.lock().unwrap();
        state.settings.insert(record.user_address.clone(), record);
    }

    pub fn seed_space(&self, space_id: &str, manifest: ManifestPayload) {
        let mut state = self.inner.lock().unwrap();
        state.registrations.insert(
            space_id.to_string(),
            SpaceRegistration {
                space_id: space_id.to_string(),
                hub_address: format!("hub://{space_id}"),
            },
        );
        state.manifests.insert(space_id.to_string(), manifest);
    }

    pub fn fail_next_hub_send(&self, error: HubError) {
        self.inner.lock().unwrap().fail_hub_sends.push_back(error);
    }

    pub fn fail_next_direct_send(&self, error: HubError) {
        self.inner.lock().unwrap().fail_direct_sends.push_back(error);
    }

    pub fn fail_next_inbox_registration(&self, error: HubError) {
        self.inner
            .lock()
            .unwrap()
            .fail_inbox_registrations
            .push_back(error);
    }

    pub fn fail_settings_fetch(&self, error: HubError) {
        self.inner.lock().unwrap().fail_settings_fetch = Some(error);
    }

    pub fn hub_messages(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().hub_messages.clone()
    }

    pub fn direct_batches(&self) -> Vec<Vec<String>> {
        self.inner.lock().unwrap().direct_batches.clone()
    }

    pub fn put_records(&self) -> Vec<SettingsRecord> {
        self.inner.lock().unwrap().put_records.clone()
    }

    pub fn inbox_registrations(&self) -> Vec<InboxRegistration> {
        self.inner.lock().unwrap().inbox_registrations.clone()
    }
}

impl HubClient for FakeHub {
    async fn send_hub_message(&self, target_id: &str, payload: &str) -> Result<String, HubError> {
        let mut state = self.inner.lock().unwrap();
        if let Some(error) = state.fail_hub_sends.pop_front() {
            return Err(error);
        }
        state
            .hub_messages
            .push((target_id.to_string(), payload.to_string()));
        Ok("ack".to_string())
    }

    async fn send_direct(&self, frames: Vec<String>) -> Result<(), HubError> {
        let mut state = self.inner.lock().unwrap();
        if let Some(error) = state.fail_direct_sends.pop_front() {
            return Err(error);
        }
        state.direct_batches.push(frames);
        Ok(())
    }

    async fn get_user_settings(&self, address: &str) -> Result<Option<SettingsRecord>, HubError> {
        let mut state = self.inner.lock().unwrap();
        if let Some(error) = state.fail_settings_fetch.take() {
            return Err(error);
        }
        Ok(state.settings.get(address).cloned())
    }

    async fn put_user_settings(&self, record: &SettingsRecord) -> Result<(), HubError> {
        let mut state = self.inner.lock().unwrap();
        state
            .settings
            .insert(record.user_address.clone(), record.clone());
        state.put_records.push(record.clone());
        Ok(())
    }

    async fn get_space_registration(
        &self,
        space_id: &str,
    ) -> Result<SpaceRegistration, HubError> {
        self.inner
            .lock()
            .unwrap()
            .registrations
            .get(space_id)
            .cloned()
            .ok_or_else(|| HubError::Status {
                status: 404,
                message: "Not Found".to_string(),
            })
    }

    async fn get_space_manifest(
        &self,
        space_id: &str,
    ) -> Result<Option<ManifestPayload>, HubError> {
        Ok(self.inner.lock().unwrap().manifests.get(space_id).cloned())
    }

    async fn register_inbox(&self, registration: &InboxRegistration) -> Result<(), HubError> {
        let mut state = self.inner.lock().unwrap();
        if let Some(error) = state.fail_inbox_registrations.pop_front() {
            return Err(error);
        }
        state.inbox_registrations.push(registration.clone());
        Ok(())
    }
}

// ── Fake secure channel ──────────────────────────────────────────────
//
// Deterministic stand-in for the ratchet collaborator. Session states are
// counters ("ratchet:N", "dm:{inbox}:N") so tests can assert exactly which
// state each encryption read. Signatures bind the private key and payload
// textually; the matching private key of a public key is its reverse.

#[derive(Default)]
struct ChannelState {
    encrypt_states: Vec<String>,
    verify_calls: usize,
    keypair_counter: u32,
}

#[derive(Clone, Default)]
pub struct FakeChannel {
    inner: Arc<Mutex<ChannelState>>,
}

impl FakeChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// States that have been fed to `ratchet_encrypt`/`dm_encrypt`, in
    /// call order.
    pub fn encrypt_states(&self) -> Vec<String> {
        self.inner.lock().unwrap().encrypt_states.clone()
    }

    pub fn verify_calls(&self) -> usize {
        self.inner.lock().unwrap().verify_calls
    }
}

pub fn fake_signature(private_key: &[u8], data: &[u8]) -> Vec<u8> {
    format!("sig:{}:{}", hex::encode(private_key), hex::encode(data)).into_bytes()
}

fn matching_private_key(public_key: &[u8]) -> Vec<u8> {
    public_key.iter().rev().copied().collect()
}

impl SecureChannel for FakeChannel {
    fn sign(&self, private_key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(fake_signature(private_key, data))
    }

    fn verify(&self, public_key: &[u8], data: &[u8], signature: &[u8]) -> bool {
        self.inner.lock().unwrap().verify_calls += 1;
        signature == fake_signature(&matching_private_key(public_key), data).as_slice()
    }

    fn ratchet_encrypt(&self, state: &str, plaintext: &[u8]) -> Result<RatchetStep, CryptoError> {
        let mut inner = self.inner.lock().unwrap();
        inner.encrypt_states.push(state.to_string());
        let counter: u64 = state
            .strip_prefix("ratchet:")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| CryptoError::RatchetEncrypt(format!("bad state {state}")))?;
        Ok(RatchetStep {
            new_state: format!("ratchet:{}", counter + 1),
            envelope: format!("env:{state}:{}", hex::encode(plaintext)),
        })
    }

    fn dm_encrypt(&self, state: &str, plaintext: &[u8]) -> Result<DmStep, CryptoError> {
        let mut inner = self.inner.lock().unwrap();
        inner.encrypt_states.push(state.to_string());
        let mut parts = state.splitn(3, ':');
        let (tag, inbox, counter) = (parts.next(), parts.next(), parts.next());
        let (Some("dm"), Some(inbox), Some(counter)) = (tag, inbox, counter) else {
            return Err(CryptoError::RatchetEncrypt(format!("bad dm state {state}")));
        };
        let counter: u64 = counter
            .parse()
            .map_err(|_| CryptoError::RatchetEncrypt(format!("bad dm state {state}")))?;
        Ok(DmStep {
            new_state: format!("dm:{inbox}:{}", counter + 1),
            envelope: format!("env:{state}:{}", hex::encode(plaintext)),
            receiving_inbox: format!("recv-{inbox}"),
            sent_accept: true,
        })
    }

    fn open_inbox_envelope(
        &self,
        _inbox_private_key: &[u8],
        _ephemeral_public_key: &[u8],
        sealed: &str,
    ) -> Result<Vec<u8>, CryptoError> {
        hex::decode(sealed).map_err(|_| CryptoError::InboxOpen("sealed payload is not hex".into()))
    }

    fn generate_inbox_keypair(&self) -> murmur_core::types::InboxKeypair {
        let mut inner = self.inner.lock().unwrap();
        inner.keypair_counter += 1;
        let public_key = format!("inbox-pub-{}", inner.keypair_counter).into_bytes();
        let private_key = matching_private_key(&public_key);
        murmur_core::types::InboxKeypair {
            public_key,
            private_key,
        }
    }
}

// ── Seeding helpers ──────────────────────────────────────────────────

pub fn keyset(name: &str) -> UserKeyset {
    let public_key = format!("pub-{name}").into_bytes();
    let private_key = matching_private_key(&public_key);
    UserKeyset {
        address: name.to_string(),
        public_key,
        private_key,
    }
}

pub fn space(space_id: &str, channel_ids: &[&str]) -> Space {
    Space {
        space_id: space_id.to_string(),
        space_name: format!("space {space_id}"),
        groups: vec![ChannelGroup {
            group_name: "general".to_string(),
            channels: channel_ids
                .iter()
                .map(|id| Channel {
                    channel_id: id.to_string(),
                    channel_name: format!("channel {id}"),
                })
                .collect(),
        }],
        is_repudiable: false,
    }
}

/// Persist a space with key material and a fresh ratchet session, the
/// state a device has after joining.
pub fn seed_space(store: &MessageStore, space_id: &str, channel_ids: &[&str]) {
    store.save_space(&space(space_id, channel_ids)).unwrap();
    for key_id in ["config", "hub", "inbox"] {
        let public_key = format!("{space_id}-{key_id}-pub").into_bytes();
        store
            .save_space_key(&SpaceKey {
                space_id: space_id.to_string(),
                key_id: key_id.to_string(),
                address: None,
                public_key: hex::encode(&public_key),
                private_key: hex::encode(matching_private_key(&public_key)),
            })
            .unwrap();
    }
    store
        .save_encryption_state(
            &EncryptionState {
                conversation_id: space_conversation_id(space_id),
                inbox_id: format!("{space_id}-device-inbox"),
                state: "ratchet:0".to_string(),
                timestamp: 1,
                sent_accept: true,
            },
            true,
        )
        .unwrap();
}

pub fn seed_dm_session(store: &MessageStore, address: &str, inbox_id: &str, timestamp: i64) {
    store
        .save_encryption_state(
            &EncryptionState {
                conversation_id: format!("{address}/{address}"),
                inbox_id: inbox_id.to_string(),
                state: format!("dm:{inbox_id}:0"),
                timestamp,
                sent_accept: false,
            },
            true,
        )
        .unwrap();
}

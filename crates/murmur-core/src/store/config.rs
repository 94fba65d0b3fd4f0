//! Ratchet session rows, space key material, synced user configs and the
//! per-space bootstrap progress marker.

use rusqlite::{params, OptionalExtension};

use super::{MessageStore, StoreError};
use crate::types::{BootstrapStep, EncryptionState, SpaceKey, UserConfig};

impl MessageStore {
    /// Persist a ratchet session row. With `replace`, the row is overwritten
    /// wholesale (the normal send/receive path); without it, an existing row
    /// wins and the write is a no-op.
    pub fn save_encryption_state(
        &self,
        state: &EncryptionState,
        replace: bool,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let sql = if replace {
            "INSERT INTO encryption_states (conversation_id, inbox_id, state, timestamp, sent_accept)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(conversation_id, inbox_id) DO UPDATE SET
                state = excluded.state,
                timestamp = excluded.timestamp,
                sent_accept = excluded.sent_accept"
        } else {
            "INSERT INTO encryption_states (conversation_id, inbox_id, state, timestamp, sent_accept)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(conversation_id, inbox_id) DO NOTHING"
        };
        conn.execute(
            sql,
            params![
                state.conversation_id,
                state.inbox_id,
                state.state,
                state.timestamp,
                state.sent_accept as i64,
            ],
        )?;
        Ok(())
    }

    /// All session rows for a conversation, newest first.
    pub fn get_encryption_states(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<EncryptionState>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT conversation_id, inbox_id, state, timestamp, sent_accept
             FROM encryption_states WHERE conversation_id = ?1
             ORDER BY timestamp DESC, inbox_id",
        )?;
        let rows = stmt.query_map([conversation_id], |row| {
            Ok(EncryptionState {
                conversation_id: row.get(0)?,
                inbox_id: row.get(1)?,
                state: row.get(2)?,
                timestamp: row.get(3)?,
                sent_accept: row.get::<_, i64>(4)? != 0,
            })
        })?;
        let mut states = Vec::new();
        for row in rows {
            states.push(row?);
        }
        Ok(states)
    }

    pub fn save_space_key(&self, key: &SpaceKey) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO space_keys (space_id, key_id, address, public_key, private_key)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(space_id, key_id) DO UPDATE SET
                address = excluded.address,
                public_key = excluded.public_key,
                private_key = excluded.private_key",
            params![key.space_id, key.key_id, key.address, key.public_key, key.private_key],
        )?;
        Ok(())
    }

    pub fn get_space_key(
        &self,
        space_id: &str,
        key_id: &str,
    ) -> Result<Option<SpaceKey>, StoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT space_id, key_id, address, public_key, private_key
             FROM space_keys WHERE space_id = ?1 AND key_id = ?2",
            params![space_id, key_id],
            |row| {
                Ok(SpaceKey {
                    space_id: row.get(0)?,
                    key_id: row.get(1)?,
                    address: row.get(2)?,
                    public_key: row.get(3)?,
                    private_key: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn get_space_keys(&self, space_id: &str) -> Result<Vec<SpaceKey>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT space_id, key_id, address, public_key, private_key
             FROM space_keys WHERE space_id = ?1 ORDER BY key_id",
        )?;
        let rows = stmt.query_map([space_id], |row| {
            Ok(SpaceKey {
                space_id: row.get(0)?,
                key_id: row.get(1)?,
                address: row.get(2)?,
                public_key: row.get(3)?,
                private_key: row.get(4)?,
            })
        })?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    pub fn save_user_config(&self, config: &UserConfig) -> Result<(), StoreError> {
        let body = serde_json::to_string(config)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO user_configs (address, body, timestamp) VALUES (?1, ?2, ?3)
             ON CONFLICT(address) DO UPDATE SET
                body = excluded.body,
                timestamp = excluded.timestamp",
            params![config.address, body, config.timestamp],
        )?;
        Ok(())
    }

    pub fn get_user_config(&self, address: &str) -> Result<Option<UserConfig>, StoreError> {
        let conn = self.conn.lock();
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM user_configs WHERE address = ?1",
                [address],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
            .transpose()
    }

    pub fn get_bootstrap_step(&self, space_id: &str) -> Result<Option<BootstrapStep>, StoreError> {
        let conn = self.conn.lock();
        let step: Option<String> = conn
            .query_row(
                "SELECT step FROM space_bootstrap WHERE space_id = ?1",
                [space_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(step.as_deref().and_then(BootstrapStep::from_str))
    }

    pub fn set_bootstrap_step(
        &self,
        space_id: &str,
        step: BootstrapStep,
        now: i64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO space_bootstrap (space_id, step, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(space_id) DO UPDATE SET
                step = excluded.step,
                updated_at = excluded.updated_at",
            params![space_id, step.as_str(), now],
        )?;
        Ok(())
    }
}

//! Space manifests and membership rosters.

use rusqlite::{params, OptionalExtension};

use super::{MessageStore, StoreError};
use crate::types::{Space, SpaceMember};

impl MessageStore {
    pub fn save_space(&self, space: &Space) -> Result<(), StoreError> {
        let manifest = serde_json::to_string(space)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO spaces (space_id, manifest) VALUES (?1, ?2)
             ON CONFLICT(space_id) DO UPDATE SET manifest = excluded.manifest",
            params![space.space_id, manifest],
        )?;
        Ok(())
    }

    pub fn get_space(&self, space_id: &str) -> Result<Option<Space>, StoreError> {
        let conn = self.conn.lock();
        let manifest: Option<String> = conn
            .query_row(
                "SELECT manifest FROM spaces WHERE space_id = ?1",
                [space_id],
                |row| row.get(0),
            )
            .optional()?;
        manifest
            .map(|m| serde_json::from_str(&m).map_err(StoreError::from))
            .transpose()
    }

    pub fn get_spaces(&self) -> Result<Vec<Space>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT manifest FROM spaces ORDER BY space_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut spaces = Vec::new();
        for row in rows {
            spaces.push(serde_json::from_str(&row?)?);
        }
        Ok(spaces)
    }

    pub fn delete_space(&self, space_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let n = conn.execute("DELETE FROM spaces WHERE space_id = ?1", [space_id])?;
        conn.execute("DELETE FROM space_members WHERE space_id = ?1", [space_id])?;
        Ok(n > 0)
    }

    pub fn save_space_member(&self, member: &SpaceMember) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO space_members (space_id, address, display_name) VALUES (?1, ?2, ?3)
             ON CONFLICT(space_id, address) DO UPDATE SET display_name = excluded.display_name",
            params![member.space_id, member.address, member.display_name],
        )?;
        Ok(())
    }

    pub fn get_space_members(&self, space_id: &str) -> Result<Vec<SpaceMember>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT space_id, address, display_name FROM space_members
             WHERE space_id = ?1 ORDER BY address",
        )?;
        let rows = stmt.query_map([space_id], |row| {
            Ok(SpaceMember {
                space_id: row.get(0)?,
                address: row.get(1)?,
                display_name: row.get(2)?,
            })
        })?;
        let mut members = Vec::new();
        for row in rows {
            members.push(row?);
        }
        Ok(members)
    }

    pub fn delete_space_member(&self, space_id: &str, address: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM space_members WHERE space_id = ?1 AND address = ?2",
            params![space_id, address],
        )?;
        Ok(n > 0)
    }
}

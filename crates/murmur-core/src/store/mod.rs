//! SQLite-backed local store: the single durable home for messages, queue
//! tasks, ratchet session states, spaces, key material and user configs.
//!
//! A single connection behind a mutex keeps writes atomic across the
//! engine's interleaved async tasks; the lock is never held across an
//! await point.

mod config;
mod error;
mod messages;
mod queue;
mod spaces;

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::Connection;

pub use error::StoreError;
pub use messages::{Direction, MessageCursor};
pub use queue::QueueStats;

pub struct MessageStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    message_id TEXT PRIMARY KEY,
    space_id TEXT NOT NULL,
    channel_id TEXT NOT NULL,
    created_date INTEGER NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation_time
    ON messages (space_id, channel_id, created_date, message_id);
CREATE TABLE IF NOT EXISTS queue_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    serial_key TEXT NOT NULL,
    action TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    attempt INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    next_retry_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    processing_started_at INTEGER,
    processed_at INTEGER,
    error TEXT
);
CREATE INDEX IF NOT EXISTS idx_queue_tasks_ready
    ON queue_tasks (status, next_retry_at, created_at);
CREATE TABLE IF NOT EXISTS encryption_states (
    conversation_id TEXT NOT NULL,
    inbox_id TEXT NOT NULL,
    state TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    sent_accept INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (conversation_id, inbox_id)
);
CREATE TABLE IF NOT EXISTS spaces (
    space_id TEXT PRIMARY KEY,
    manifest TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS space_members (
    space_id TEXT NOT NULL,
    address TEXT NOT NULL,
    display_name TEXT,
    PRIMARY KEY (space_id, address)
);
CREATE TABLE IF NOT EXISTS space_keys (
    space_id TEXT NOT NULL,
    key_id TEXT NOT NULL,
    address TEXT,
    public_key TEXT NOT NULL,
    private_key TEXT NOT NULL,
    PRIMARY KEY (space_id, key_id)
);
CREATE TABLE IF NOT EXISTS user_configs (
    address TEXT PRIMARY KEY,
    body TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS space_bootstrap (
    space_id TEXT PRIMARY KEY,
    step TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
";

impl MessageStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

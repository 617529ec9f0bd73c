//! The durable store.
//!
//! All components touch state only through this module. One `Store`
//! wraps one SQLite connection; tasks that run on their own threads
//! (scan, pipeline) each open their own handle against the same file.

mod schema;

pub mod admin;
pub mod embeddings;
pub mod faces;
pub mod files;
pub mod queue;
pub mod scenes;
pub mod settings;

use anyhow::Result;
use rusqlite::Connection;
use std::path::Path;

pub use embeddings::{cosine_similarity, EmbeddingRecord, SceneMatch};
pub use faces::{BoundingBox, FaceRecord};
pub use files::{FileRecord, FsMeta, VideoMeta};
pub use queue::{QueueCounts, QueueItem, QueueStatus};
pub use scenes::{NewScene, SceneRecord};
pub use schema::SCHEMA;

pub struct Store {
    pub(crate) conn: Connection,
}

impl Store {
    /// Open (creating if necessary) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        // Cascades depend on this; SQLite defaults it off per connection.
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))?;
        Ok(Self { conn })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self { conn };
        store.initialize()?;
        Ok(store)
    }

    pub fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }
}

/// Current UTC time as the RFC 3339 string stored in timestamp columns.
pub(crate) fn now_utc() -> String {
    chrono::Utc::now().to_rfc3339()
}

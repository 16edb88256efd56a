//! Durable cursor: the last mailbox position a run consumed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HarvestError, Result};
use crate::model::position::MailboxPosition;

/// Stored cursor for one mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRecord {
    pub position: MailboxPosition,
    /// `UIDVALIDITY` of the mailbox when the position was recorded.
    #[serde(default)]
    pub uid_validity: Option<u32>,
    pub updated_at: DateTime<Utc>,
}

impl CursorRecord {
    pub fn new(position: MailboxPosition, uid_validity: Option<u32>) -> Self {
        Self {
            position,
            uid_validity,
            updated_at: Utc::now(),
        }
    }
}

/// Read/write access to stored cursors, keyed by mailbox id.
///
/// There is no cross-process locking; callers must not run two harvests
/// against the same mailbox id concurrently.
pub trait CursorStore: Send {
    fn read_cursor(&self, mailbox_id: &str) -> Result<Option<CursorRecord>>;
    fn write_cursor(&mut self, mailbox_id: &str, record: CursorRecord) -> Result<()>;
}

/// Cursors kept in a single JSON document on disk.
#[derive(Debug)]
pub struct JsonCursorStore {
    path: PathBuf,
}

impl JsonCursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, CursorRecord>> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(HarvestError::cursor_io(&self.path, e)),
        };
        serde_json::from_slice(&data).map_err(|source| HarvestError::CursorFormat {
            path: self.path.clone(),
            source,
        })
    }

    /// Replace the document via a temp file and rename.
    fn save(&self, cursors: &BTreeMap<String, CursorRecord>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| HarvestError::cursor_io(parent, e))?;
            }
        }
        let json = serde_json::to_vec_pretty(cursors).map_err(|source| {
            HarvestError::CursorFormat {
                path: self.path.clone(),
                source,
            }
        })?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| HarvestError::cursor_io(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| HarvestError::cursor_io(&self.path, e))
    }
}

impl CursorStore for JsonCursorStore {
    fn read_cursor(&self, mailbox_id: &str) -> Result<Option<CursorRecord>> {
        Ok(self.load()?.get(mailbox_id).copied())
    }

    fn write_cursor(&mut self, mailbox_id: &str, record: CursorRecord) -> Result<()> {
        let mut cursors = self.load()?;
        cursors.insert(mailbox_id.to_string(), record);
        self.save(&cursors)?;
        debug!(
            path = %self.path.display(),
            mailbox_id,
            position = record.position.get(),
            "Saved cursor"
        );
        Ok(())
    }
}

/// Cursors held in memory only; used for dry runs.
#[derive(Debug, Default, Clone)]
pub struct MemoryCursorStore {
    cursors: BTreeMap<String, CursorRecord>,
    writes: usize,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing record.
    pub fn seeded(mailbox_id: &str, record: Option<CursorRecord>) -> Self {
        let mut store = Self::new();
        if let Some(record) = record {
            store.cursors.insert(mailbox_id.to_string(), record);
        }
        store
    }

    /// Number of `write_cursor` calls so far.
    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl CursorStore for MemoryCursorStore {
    fn read_cursor(&self, mailbox_id: &str) -> Result<Option<CursorRecord>> {
        Ok(self.cursors.get(mailbox_id).copied())
    }

    fn write_cursor(&mut self, mailbox_id: &str, record: CursorRecord) -> Result<()> {
        self.cursors.insert(mailbox_id.to_string(), record);
        self.writes += 1;
        Ok(())
    }
}

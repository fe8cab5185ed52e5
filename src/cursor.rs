//! Persisted consumer position of the transform view.
//!
//! The file holds the next landing offset to transform, as plain JSON
//! (`{"offset": 42}`) so it can be inspected or reset by hand. Commits go
//! through a temp file and a rename, so a crash leaves either the old or
//! the new position.
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const CURSOR_FILE: &str = "transform.cursor";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct CursorState {
    offset: u64,
}

#[derive(Debug)]
pub struct CursorStore {
    path: PathBuf,
    committed: u64,
}

impl CursorStore {
    /// Load the committed position from `dir`, starting at 0 when there is
    /// none yet.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(CURSOR_FILE);
        let committed = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<CursorState>(&bytes)?.offset,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, committed })
    }

    pub fn committed(&self) -> u64 {
        self.committed
    }

    pub fn commit(&mut self, offset: u64) -> Result<()> {
        if offset == self.committed {
            return Ok(());
        }
        let tmp = self.path.with_extension("tmp");
        {
            let mut f = File::create(&tmp)?;
            serde_json::to_writer(&mut f, &CursorState { offset })?;
            f.flush()?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!(offset, "cursor committed");
        self.committed = offset;
        Ok(())
    }
}

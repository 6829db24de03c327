//! JSON snapshot store.
//!
//! The entity snapshot is one JSON document.  It is re-read on every
//! reload, so an operator (or the web UI) edits the file and then sends
//! `reload` over the control socket.

use std::path::{Path, PathBuf};

use log::debug;

use crate::app::ports::{ConfigError, ConfigPort};
use crate::snapshot::Snapshot;

#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `snapshot` atomically (temp file + rename).
    pub fn save(&self, snapshot: &Snapshot) -> Result<(), ConfigError> {
        let text = serde_json::to_string_pretty(snapshot)
            .map_err(|e| ConfigError::Malformed(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, text).map_err(|e| ConfigError::Io(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| ConfigError::Io(e.to_string()))
    }
}

impl ConfigPort for JsonFileStore {
    fn load(&self) -> Result<Snapshot, ConfigError> {
        let text = std::fs::read_to_string(&self.path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::NotFound,
            _ => ConfigError::Io(e.to_string()),
        })?;
        let snapshot: Snapshot =
            serde_json::from_str(&text).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        debug!(
            "Config: loaded {} ({} relays, {} zones)",
            self.path.display(),
            snapshot.relays.len(),
            snapshot.zones.len()
        );
        Ok(snapshot)
    }
}

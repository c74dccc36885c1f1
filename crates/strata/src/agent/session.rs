//! Persisted conversation state.
//!
//! A session file holds one [`History`] as its tagged JSON tree plus the
//! time it was saved:
//!
//! ```json
//! { "saved_at": "2025-01-01T12:00:00+00:00", "history": { "_cls": "History", ... } }
//! ```
//!
//! Writes go to a temp file in the same directory and are renamed into
//! place, so a crash never leaves a truncated session behind.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::history::{History, HistoryConfig};

/// A loaded session file.
#[derive(Debug, Clone)]
pub struct SessionFile {
    path: PathBuf,
    saved_at: Option<DateTime<Utc>>,
}

impl SessionFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            saved_at: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// When the file was last written, if it has been loaded or saved.
    pub fn saved_at(&self) -> Option<DateTime<Utc>> {
        self.saved_at
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the history, or start a fresh one when the file does not exist
    /// or is blank.
    pub fn load_or_new(&mut self, config: HistoryConfig) -> Result<History> {
        if !self.exists() {
            debug!("No session at {}, starting fresh", self.path.display());
            return Ok(History::new(config));
        }
        self.load(config)
    }

    pub fn load(&mut self, config: HistoryConfig) -> Result<History> {
        let text = std::fs::read_to_string(&self.path)
            .map_err(|e| Error::Io(format!("failed to read {}: {e}", self.path.display())))?;
        if text.trim().is_empty() {
            return Ok(History::new(config));
        }
        let doc: Value = serde_json::from_str(&text)?;
        let Some(history) = doc.get("history") else {
            return Err(Error::Deserialize("session file has no 'history'".into()));
        };
        self.saved_at = doc
            .get("saved_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));
        let history = History::from_value(history, config)?;
        info!(
            "Loaded session {} ({} tokens)",
            self.path.display(),
            history.tokens()
        );
        Ok(history)
    }

    /// Write `history` atomically.
    pub fn save(&mut self, history: &History) -> Result<()> {
        let now = Utc::now();
        let doc = json!({
            "saved_at": now.to_rfc3339(),
            "history": history.to_value(),
        });
        let text = serde_json::to_string_pretty(&doc)
            .map_err(|e| Error::Io(format!("failed to serialize session: {e}")))?;

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::Io(format!("failed to create {}: {e}", dir.display())))?;
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::Io(format!("invalid session path {}", self.path.display())))?;
        let tmp = dir.join(format!(".{file_name}.tmp"));

        std::fs::write(&tmp, text)
            .map_err(|e| Error::Io(format!("failed to write {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| Error::Io(format!("failed to rename into {}: {e}", self.path.display())))?;

        self.saved_at = Some(now);
        debug!("Saved session to {}", self.path.display());
        Ok(())
    }
}

// Durable history log and status snapshot file

use crate::chat::message::Status;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// What to do with an existing history log at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoryPolicy {
    /// Start every run with an empty log
    #[default]
    Truncate,
    /// Keep lines from previous runs
    Preserve,
}

/// Append-only log of formatted public messages
pub struct HistoryLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl HistoryLog {
    /// Open the log, creating or truncating it according to `policy`
    pub fn open(path: impl Into<PathBuf>, policy: HistoryPolicy) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).context("Failed to create history directory")?;
        }

        let mut options = OpenOptions::new();
        options.create(true).write(true);
        match policy {
            HistoryPolicy::Truncate => options.truncate(true),
            HistoryPolicy::Preserve => options.append(true),
        };
        options
            .open(&path)
            .with_context(|| format!("Failed to open history log {:?}", path))?;

        tracing::debug!("History log {:?} opened ({:?})", path, policy);

        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    /// Append one line; each call is an independent write
    pub fn append(&self, line: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("Failed to open history log for append")?;

        writeln!(file, "{}", line).context("Failed to append to history log")?;
        Ok(())
    }

    /// Read the last `limit` lines, oldest first
    pub fn tail(&self, limit: usize) -> Result<Vec<String>> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());

        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("Failed to read history log"),
        };

        let lines: Vec<&str> = contents.lines().collect();
        let skip = lines.len().saturating_sub(limit);
        Ok(lines[skip..].iter().map(|l| l.to_string()).collect())
    }
}

/// A full status document ready to be written
///
/// Serializes as a flat `{"username": "status"}` object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    /// Monotonic version assigned by the registry
    #[serde(skip)]
    pub version: u64,
    #[serde(flatten)]
    pub statuses: BTreeMap<String, String>,
}

/// JSON document mapping username to their resumable status
pub struct StatusStore {
    path: PathBuf,
    last_written: Mutex<u64>,
}

impl StatusStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_written: Mutex::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the statuses saved by a previous run
    ///
    /// A missing file yields an empty map. Transient statuses are restored as
    /// available.
    pub fn load(&self) -> Result<HashMap<String, Status>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e).context("Failed to read status snapshot"),
        };

        let raw: HashMap<String, String> =
            serde_json::from_slice(&bytes).context("Failed to parse status snapshot")?;

        Ok(raw
            .into_iter()
            .map(|(name, status)| (name, Status::parse(&status).resumable()))
            .collect())
    }

    /// Rewrite the whole document
    ///
    /// Snapshots older than the last one written are skipped. Returns whether
    /// the file was written.
    pub fn write(&self, snapshot: &StatusSnapshot) -> Result<bool> {
        let mut last_written = self.last_written.lock().unwrap_or_else(|p| p.into_inner());
        if snapshot.version <= *last_written {
            return Ok(false);
        }

        let json = serde_json::to_vec_pretty(snapshot)
            .context("Failed to serialize status snapshot")?;

        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json).context("Failed to write status snapshot")?;
        fs::rename(&tmp_path, &self.path).context("Failed to replace status snapshot")?;

        *last_written = snapshot.version;
        Ok(true)
    }
}

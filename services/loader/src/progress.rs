//! Per-file checkpoint of committed chunks.
//!
//! Stored as a JSON object next to the input files:
//!
//! ```json
//! {
//!     "precios_2023.csv": 4
//! }
//! ```
//!
//! The value is the index of the next chunk to process. A missing file means
//! nothing has been loaded yet. A file that exists but cannot be read or
//! parsed stops the run: restarting from zero would silently discard the
//! checkpoint.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

pub const PROGRESS_FILE_NAME: &str = "progreso_carga.json";

/// Filename -> next chunk index
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Progress(BTreeMap<String, usize>);

impl Progress {
    pub fn next_chunk(&self, file_name: &str) -> usize {
        self.0.get(file_name).copied().unwrap_or(0)
    }

    pub fn set(&mut self, file_name: &str, next_chunk: usize) {
        self.0.insert(file_name.to_string(), next_chunk);
    }
}

/// Read persisted progress. Absent file -> empty progress.
pub async fn load(path: &Path) -> Result<Progress> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Progress::default()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read progress file {}", path.display()))
        }
    };

    serde_json::from_str(&content).with_context(|| {
        format!(
            "Progress file {} is corrupt; fix or delete it to restart from chunk 0",
            path.display()
        )
    })
}

/// Persist progress, replacing the previous state through a temp file and
/// rename so an interrupted write leaves the old checkpoint intact.
pub async fn save(path: &Path, progress: &Progress) -> Result<()> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    progress
        .serialize(&mut ser)
        .context("Failed to serialize progress")?;
    buf.push(b'\n');

    let tmp = temp_path(path);
    fs::write(&tmp, &buf)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to replace progress file {}", path.display()))?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Progress bound to its file; every update is persisted immediately
#[derive(Debug)]
pub struct ProgressStore {
    path: PathBuf,
    state: Progress,
}

impl ProgressStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = load(&path).await?;
        Ok(Self { path, state })
    }

    pub fn next_chunk(&self, file_name: &str) -> usize {
        self.state.next_chunk(file_name)
    }

    /// Record that every chunk before `next_chunk` is committed
    pub async fn record(&mut self, file_name: &str, next_chunk: usize) -> Result<()> {
        self.state.set(file_name, next_chunk);
        save(&self.path, &self.state).await
    }
}

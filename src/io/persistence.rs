//! Durable backing for the queue state table
//!
//! The in-process store writes every accepted row through a `StateBackend`
//! before committing it, and hydrates from `load_all` at startup.
//!
//! `JsonlBackend` is an append-only JSONL file (one `QueueState` per line).
//! The last line for a location wins. Rows are indexed in memory at open, so
//! reads never touch the file; the file is rewritten with one line per
//! location by `compact`, and automatically once it grows past a threshold.

use crate::domain::{LocationId, QueueState, StoreError};
use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Durably replace the row for `state.location_id`
    async fn upsert(&self, state: &QueueState) -> Result<(), StoreError>;

    async fn get(&self, location_id: &LocationId) -> Result<Option<QueueState>, StoreError>;

    /// Every stored row, one per location, in no particular order
    async fn load_all(&self) -> Result<Vec<QueueState>, StoreError>;
}

/// Process-local backend; state is lost on restart
#[derive(Default)]
pub struct MemoryBackend {
    rows: RwLock<FxHashMap<LocationId, QueueState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn upsert(&self, state: &QueueState) -> Result<(), StoreError> {
        self.rows.write().insert(state.location_id.clone(), state.clone());
        Ok(())
    }

    async fn get(&self, location_id: &LocationId) -> Result<Option<QueueState>, StoreError> {
        Ok(self.rows.read().get(location_id).cloned())
    }

    async fn load_all(&self) -> Result<Vec<QueueState>, StoreError> {
        Ok(self.rows.read().values().cloned().collect())
    }
}

type Rows = FxHashMap<LocationId, QueueState>;

pub struct JsonlBackend {
    path: PathBuf,
    /// Last row per location, mirroring the file; filled at open
    rows: RwLock<Rows>,
    /// Serializes appends and compaction
    file: Mutex<FileState>,
    compact_after_lines: usize,
}

struct FileState {
    /// Lines currently in the file, including superseded rows
    lines: usize,
}

/// Default line count that triggers a rewrite of the file
pub const DEFAULT_COMPACT_AFTER_LINES: usize = 10_000;

impl JsonlBackend {
    /// Open (or lazily create) the JSONL file at `path` and index its rows
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let (rows, lines) = read_rows(&path).await?;
        info!(path = %path.display(), rows = %rows.len(), lines = %lines, "state_file_opened");
        Ok(Self {
            path,
            rows: RwLock::new(rows),
            file: Mutex::new(FileState { lines }),
            compact_after_lines: DEFAULT_COMPACT_AFTER_LINES,
        })
    }

    /// Rewrite the file once it reaches `lines` lines (and at least twice the
    /// number of locations)
    pub fn with_compaction_threshold(mut self, lines: usize) -> Self {
        self.compact_after_lines = lines.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the file with one line per location. Returns the row count.
    pub async fn compact(&self) -> Result<usize, StoreError> {
        let mut file = self.file.lock().await;
        self.compact_locked(&mut file).await
    }

    async fn compact_locked(&self, file: &mut FileState) -> Result<usize, StoreError> {
        let mut rows: Vec<QueueState> = self.rows.read().values().cloned().collect();
        rows.sort_by(|a, b| a.location_id.cmp(&b.location_id));

        let mut out = String::new();
        for row in &rows {
            out.push_str(&serde_json::to_string(row)?);
            out.push('\n');
        }

        let tmp = self.path.with_extension("jsonl.tmp");
        fs::write(&tmp, out).await?;
        fs::rename(&tmp, &self.path).await?;

        info!(
            path = %self.path.display(),
            rows = %rows.len(),
            lines_before = %file.lines,
            "state_file_compacted"
        );
        file.lines = rows.len();
        Ok(rows.len())
    }

    /// Append one newline-terminated row. A tail left without a newline by an
    /// earlier failed write is terminated first so the new row stays on its
    /// own line; a failed write is truncated away. Returns lines added.
    async fn append(&self, line: &str) -> Result<usize, StoreError> {
        let mut file =
            OpenOptions::new().create(true).read(true).append(true).open(&self.path).await?;
        let len = file.metadata().await?.len();

        let mut buf = Vec::with_capacity(line.len() + 1);
        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::Start(len - 1)).await?;
            file.read_exact(&mut last).await?;
            if last[0] != b'\n' {
                warn!(path = %self.path.display(), "state_file_torn_tail");
                buf.push(b'\n');
            }
        }
        buf.extend_from_slice(line.as_bytes());

        let written = async {
            file.write_all(&buf).await?;
            file.flush().await
        }
        .await;
        if let Err(e) = written {
            if let Err(truncate) = file.set_len(len).await {
                warn!(path = %self.path.display(), error = %truncate, "state_file_truncate_failed");
            }
            return Err(e.into());
        }

        Ok(if buf.len() > line.len() { 2 } else { 1 })
    }
}

/// Read every line, keeping the last row per location. Also returns the
/// number of non-blank lines.
async fn read_rows(path: &Path) -> Result<(Rows, usize), StoreError> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Default::default()),
        Err(e) => return Err(e.into()),
    };

    let mut rows = FxHashMap::default();
    let mut lines = 0;
    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        lines += 1;
        match serde_json::from_str::<QueueState>(line) {
            Ok(state) => {
                rows.insert(state.location_id.clone(), state);
            }
            // A torn line after a crash or failed write is expected; skip it
            Err(e) => warn!(
                path = %path.display(),
                line = %(line_no + 1),
                error = %e,
                "state_line_skipped"
            ),
        }
    }
    Ok((rows, lines))
}

#[async_trait]
impl StateBackend for JsonlBackend {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    async fn upsert(&self, state: &QueueState) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(state)?;
        line.push('\n');

        let mut file = self.file.lock().await;
        file.lines += self.append(&line).await?;
        let rows = {
            let mut rows = self.rows.write();
            rows.insert(state.location_id.clone(), state.clone());
            rows.len()
        };
        debug!(location_id = %state.location_id, bytes = %line.len(), "state_row_written");

        if file.lines >= self.compact_after_lines && file.lines >= rows * 2 {
            // The row is already durable; a failed rewrite is retried on the next write
            if let Err(e) = self.compact_locked(&mut file).await {
                warn!(path = %self.path.display(), error = %e, "state_file_compact_failed");
            }
        }
        Ok(())
    }

    async fn get(&self, location_id: &LocationId) -> Result<Option<QueueState>, StoreError> {
        Ok(self.rows.read().get(location_id).cloned())
    }

    async fn load_all(&self) -> Result<Vec<QueueState>, StoreError> {
        Ok(self.rows.read().values().cloned().collect())
    }
}

//! Append-only per-loop journal with a polling tailer.
//!
//! One newline-delimited JSON file per loop. Appends are a single write so
//! records never interleave; there is no fsync contract. Tailing polls
//! rather than using filesystem notifications, which are unreliable on
//! some platforms and filesystems.

use anyhow::{Context, Result};
use drover_core::log::{LogEntry, LogKind};
use drover_core::loops::LoopId;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default tailer poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Byte budget per requested entry when reading from the tail of a file.
const RECENT_BYTES_PER_ENTRY: u64 = 500;

pub struct LogJournal {
    data_root: PathBuf,
}

impl LogJournal {
    pub fn new(data_root: &Path) -> Self {
        Self {
            data_root: data_root.to_path_buf(),
        }
    }

    pub fn log_path(&self, loop_id: &LoopId) -> PathBuf {
        crate::loop_log_path(&self.data_root, loop_id.as_str())
    }

    /// Stamp and append one record. A single write per record keeps
    /// records whole without an fsync contract.
    pub fn append(
        &self,
        loop_id: &LoopId,
        kind: LogKind,
        content: impl Into<String>,
    ) -> Result<LogEntry> {
        let entry = LogEntry::new(loop_id.as_str(), kind, content);
        let path = self.log_path(loop_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context(format!("failed to create {}", parent.display()))?;
        }

        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context(format!("failed to open {}", path.display()))?;
        file.write_all(line.as_bytes())
            .context(format!("failed to append to {}", path.display()))?;

        Ok(entry)
    }

    /// Read every record. Malformed lines are skipped silently; a missing
    /// file is an empty log.
    pub fn read_all(&self, loop_id: &LoopId) -> Result<Vec<LogEntry>> {
        let path = self.log_path(loop_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context(format!("failed to read {}", path.display())),
        };
        Ok(parse_lines(&raw))
    }

    /// Read up to `n` of the most recent records, in original order.
    ///
    /// Reads only the last `min(file_size, 500·n)` bytes and discards the
    /// leading partial line, so very long entries may reduce the count.
    pub fn read_recent(&self, loop_id: &LoopId, n: usize) -> Result<Vec<LogEntry>> {
        let path = self.log_path(loop_id);
        let mut file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context(format!("failed to open {}", path.display())),
        };

        let size = file.metadata()?.len();
        let budget = RECENT_BYTES_PER_ENTRY * n as u64;
        let start = size.saturating_sub(budget);
        file.seek(SeekFrom::Start(start))?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let raw = String::from_utf8_lossy(&bytes);

        let text = if start > 0 {
            // The window almost certainly begins mid-record.
            match raw.find('\n') {
                Some(pos) => &raw[pos + 1..],
                None => "",
            }
        } else {
            raw.as_ref()
        };

        let mut entries = parse_lines(text);
        if entries.len() > n {
            entries.drain(..entries.len() - n);
        }
        Ok(entries)
    }

    /// Delete a loop's journal directory. Missing is fine.
    pub fn remove(&self, loop_id: &LoopId) -> Result<()> {
        let dir = crate::loop_dir(&self.data_root, loop_id.as_str());
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(format!("failed to remove {}", dir.display())),
        }
    }

    /// Start tailing a loop's journal.
    ///
    /// Records appended after this call are delivered in append order;
    /// a partially written final line is held back until its newline
    /// arrives. File truncation resets the tailer to the new end. A
    /// missing file is not an error; the tailer waits for it to appear.
    pub fn tail(&self, loop_id: &LoopId, poll: Duration) -> LogTail {
        let path = self.log_path(loop_id);
        // Capture the current end synchronously so nothing appended after
        // this call can race past the first poll tick.
        let mut offset = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut partial = String::new();

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(poll) => {}
                }

                let size = match tokio::fs::metadata(&path).await {
                    Ok(meta) => meta.len(),
                    // Not created yet, or deleted mid-tail.
                    Err(_) => continue,
                };

                if size < offset {
                    // Truncated underneath us; start over from the top.
                    offset = 0;
                    partial.clear();
                }
                if size == offset {
                    continue;
                }

                let delta = match read_range(&path, offset, size).await {
                    Ok(delta) => delta,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "tail read failed");
                        continue;
                    }
                };
                offset = size;
                partial.push_str(&delta);

                while let Some(pos) = partial.find('\n') {
                    let line: String = partial.drain(..=pos).collect();
                    let line = line.trim_end();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<LogEntry>(line) {
                        Ok(entry) => {
                            if tx.send(entry).is_err() {
                                return;
                            }
                        }
                        Err(_) => {
                            // Malformed line; skip silently.
                        }
                    }
                }
            }
        });

        LogTail { rx, cancel, handle: Some(handle) }
    }
}

async fn read_range(path: &Path, from: u64, to: u64) -> Result<String> {
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(from)).await?;
    let mut bytes = vec![0u8; (to - from) as usize];
    file.read_exact(&mut bytes).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn parse_lines(text: &str) -> Vec<LogEntry> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}

/// Handle to a running tailer.
pub struct LogTail {
    rx: mpsc::UnboundedReceiver<LogEntry>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl LogTail {
    /// Next delivered record; `None` after the tailer stops.
    pub async fn recv(&mut self) -> Option<LogEntry> {
        self.rx.recv().await
    }

    /// Stop polling. Takes effect on the next tick; already-delivered
    /// records stay in the channel.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stop and wait for the tail task to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for LogTail {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

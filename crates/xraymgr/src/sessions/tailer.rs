//! Incremental access-log tailing with a sliding event window.

use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

use super::parse::parse_line;

/// Per-secret activity within the window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionEntry {
    pub count: usize,
    /// Event count per source address.
    pub ips: BTreeMap<String, usize>,
    pub last_ts: i64,
}

impl SessionEntry {
    pub fn distinct_ips(&self) -> usize {
        self.ips.len()
    }
}

pub type SessionSnapshot = BTreeMap<String, SessionEntry>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileCursor {
    file_id: u64,
    offset: u64,
}

#[cfg(unix)]
fn file_id(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn file_id(_meta: &std::fs::Metadata) -> u64 {
    0
}

/// Tails several log files and keeps the events seen within the window.
///
/// State is process-scoped: a restart re-reads the logs from the start,
/// and ingest-time window filtering discards what is already stale.
#[derive(Debug, Default)]
pub struct LogTailer {
    paths: Vec<PathBuf>,
    cursors: HashMap<PathBuf, FileCursor>,
    events: HashMap<String, Vec<(i64, Option<String>)>>,
}

impl LogTailer {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            paths,
            ..Self::default()
        }
    }

    /// Ingest new lines from every file and return the snapshot for
    /// `window` seconds ending at `now`.
    pub async fn poll_at(&mut self, window: u64, now: i64) -> SessionSnapshot {
        let window = i64::try_from(window).unwrap_or(i64::MAX);
        let paths = self.paths.clone();
        for path in &paths {
            match self.read_appended(path).await {
                Ok(Some(chunk)) => self.ingest(&chunk, window, now),
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Access log read failed, resetting cursor");
                    self.cursors.remove(path);
                }
            }
        }
        self.snapshot(window, now)
    }

    /// Drop every retained event for `secret`.
    pub fn forget(&mut self, secret: &str) {
        self.events.remove(secret);
    }

    /// Complete lines appended since the last read. `None` when the file
    /// does not exist.
    async fn read_appended(&mut self, path: &Path) -> std::io::Result<Option<String>> {
        let mut file = match tokio::fs::File::open(path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.cursors.remove(path);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let meta = file.metadata().await?;
        let id = file_id(&meta);
        let size = meta.len();

        let cursor = self
            .cursors
            .entry(path.to_path_buf())
            .or_insert(FileCursor {
                file_id: id,
                offset: 0,
            });
        if cursor.file_id != id || cursor.offset > size {
            debug!(path = %path.display(), "Access log rotated");
            *cursor = FileCursor {
                file_id: id,
                offset: 0,
            };
        }
        let start = cursor.offset;

        file.seek(SeekFrom::Start(start)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;

        // A trailing partial line stays unread until its newline arrives.
        let Some(last_newline) = buf.iter().rposition(|&b| b == b'\n') else {
            return Ok(Some(String::new()));
        };
        buf.truncate(last_newline + 1);
        if let Some(cursor) = self.cursors.get_mut(path) {
            cursor.offset = start + buf.len() as u64;
        }
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }

    fn ingest(&mut self, chunk: &str, window: i64, now: i64) {
        for line in chunk.lines() {
            let Some(event) = parse_line(line, now) else {
                continue;
            };
            if now - event.ts > window {
                continue;
            }
            self.events
                .entry(event.secret)
                .or_default()
                .push((event.ts, event.ip));
        }
    }

    fn snapshot(&mut self, window: i64, now: i64) -> SessionSnapshot {
        self.events.retain(|_, events| {
            events.retain(|(ts, _)| now - ts <= window);
            !events.is_empty()
        });

        self.events
            .iter()
            .map(|(secret, events)| {
                let mut entry = SessionEntry {
                    count: events.len(),
                    ..SessionEntry::default()
                };
                for (ts, ip) in events {
                    entry.last_ts = entry.last_ts.max(*ts);
                    if let Some(ip) = ip {
                        *entry.ips.entry(ip.clone()).or_default() += 1;
                    }
                }
                (secret.clone(), entry)
            })
            .collect()
    }
}

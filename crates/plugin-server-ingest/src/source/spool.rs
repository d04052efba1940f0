//! Spool directory queue.
//!
//! Each configured host is a spool root; a topic is a sub-directory of it.
//! Every `*.jsonl` / `*.ndjson` file under `<host>/<topic>/` is consumed once,
//! hosts in configured order and files in sorted order within a host, one
//! message per non-blank line.
//!
//! File reads run on the blocking thread pool.

use super::{EventQueue, RawMessage};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Queue reading JSONL spool files.
pub struct SpoolQueue {
    topic: String,
    state: Arc<Mutex<SpoolState>>,
}

struct SpoolState {
    /// Messages handed back by a failed worker; served before any file.
    requeued: VecDeque<RawMessage>,
    pending: VecDeque<PathBuf>,
    current: Option<OpenFile>,
    stats: SpoolStats,
}

struct OpenFile {
    path: PathBuf,
    reader: BufReader<File>,
    line: usize,
}

/// Counters for a spool queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpoolStats {
    pub files_processed: usize,
    pub messages: usize,
    pub bytes_read: usize,
    pub read_errors: usize,
}

impl SpoolQueue {
    /// Open the topic under each host.
    ///
    /// Hosts without the topic directory are skipped with a warning; it is an
    /// error if none of them has it.
    pub fn open(hosts: &[PathBuf], topic: &str) -> Result<Self> {
        let mut pending = VecDeque::new();
        let mut found = false;

        for host in hosts {
            let dir = host.join(topic);
            if !dir.is_dir() {
                tracing::warn!(
                    "Spool host {} has no topic '{}'; skipping",
                    host.display(),
                    topic
                );
                continue;
            }
            found = true;
            pending.extend(collect_files(&dir)?);
        }

        if !found {
            return Err(Error::Config(format!(
                "topic '{}' not found under any of {} queue host(s)",
                topic,
                hosts.len()
            )));
        }

        tracing::info!("Found {} spool files for topic '{}'", pending.len(), topic);

        Ok(Self {
            topic: topic.to_string(),
            state: Arc::new(Mutex::new(SpoolState {
                requeued: VecDeque::new(),
                pending,
                current: None,
                stats: SpoolStats::default(),
            })),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn stats(&self) -> SpoolStats {
        self.state.lock().stats.clone()
    }
}

fn read_batch(shared: &Mutex<SpoolState>, max: usize) -> Result<Option<Vec<RawMessage>>> {
    let mut state = shared.lock();
    let take = state.requeued.len().min(max);
    let mut batch: Vec<RawMessage> = state.requeued.drain(..take).collect();

    while batch.len() < max {
        if state.current.is_none() {
            let Some(path) = state.pending.pop_front() else {
                break;
            };
            tracing::info!("Consuming spool file {}", path.display());
            let file = File::open(&path)?;
            state.current = Some(OpenFile {
                path,
                reader: BufReader::new(file),
                line: 0,
            });
        }

        let SpoolState { current, stats, .. } = &mut *state;
        let Some(open) = current.as_mut() else {
            continue;
        };

        let mut buf = Vec::new();
        match open.reader.read_until(b'\n', &mut buf) {
            Ok(0) => {
                stats.files_processed += 1;
                *current = None;
            }
            Ok(n) => {
                open.line += 1;
                stats.bytes_read += n;
                let payload = trim_line(&buf);
                if payload.is_empty() {
                    continue;
                }
                stats.messages += 1;
                batch.push(RawMessage::new(
                    payload.to_vec(),
                    format!("{}:{}", open.path.display(), open.line),
                ));
            }
            Err(e) => {
                tracing::warn!("{}:{}: read error: {}", open.path.display(), open.line + 1, e);
                stats.read_errors += 1;
                *current = None;
            }
        }
    }

    if batch.is_empty() && state.current.is_none() && state.pending.is_empty() {
        return Ok(None);
    }
    Ok(Some(batch))
}

#[async_trait]
impl EventQueue for SpoolQueue {
    fn name(&self) -> &'static str {
        "spool"
    }

    async fn recv_batch(&self, max: usize, _timeout: Duration) -> Result<Option<Vec<RawMessage>>> {
        let state = Arc::clone(&self.state);
        tokio::task::spawn_blocking(move || read_batch(&state, max))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(format!("spool read task failed: {e}"))))?
    }

    async fn requeue(&self, messages: Vec<RawMessage>) -> Result<()> {
        let mut state = self.state.lock();
        for message in messages.into_iter().rev() {
            state.requeued.push_front(message);
        }
        Ok(())
    }
}

fn collect_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .is_some_and(|ext| ext == "jsonl" || ext == "ndjson")
        })
        .collect();

    // Sort for deterministic processing order
    files.sort();
    Ok(files)
}

fn trim_line(buf: &[u8]) -> &[u8] {
    let start = buf
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(buf.len());
    let end = buf
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &buf[start..end]
}

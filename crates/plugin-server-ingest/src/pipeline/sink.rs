//! Downstream sinks for processed events and dead letters.
//!
//! # File Format
//!
//! [`TopicWriter`] appends one JSON document per line to
//! `<root>/<topic>/<started_at>-<pid>.jsonl`, the same layout the spool
//! queue consumes, so a downstream stage can read the producer topic
//! directly.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use plugin_server_core::{Event, IntakeError};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Destination for events that made it through the plugin chain.
pub trait EventSink: Send + Sync {
    fn send(&self, event: &Event) -> Result<()>;

    /// Make previously sent events durable.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Destination for messages that could not be processed.
pub trait DeadLetterSink: Send + Sync {
    fn dead_letter(&self, letter: &DeadLetter) -> Result<()>;

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Why a message was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterReason {
    Decode,
    Validation,
    Persistence,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decode => "decode",
            Self::Validation => "validation",
            Self::Persistence => "persistence",
        }
    }
}

impl From<&IntakeError> for DeadLetterReason {
    fn from(err: &IntakeError) -> Self {
        match err {
            IntakeError::Decode(_) => Self::Decode,
            IntakeError::Validation { .. } => Self::Validation,
        }
    }
}

/// A message routed to the dead-letter topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub reason: DeadLetterReason,
    pub error: String,
    /// The original payload (lossy UTF-8) or the event as JSON.
    pub payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<i64>,
    pub origin: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    /// A raw message rejected at intake.
    ///
    /// `team_id` is kept whenever the envelope carries an integer one, even
    /// if the team turned out to be unknown.
    pub fn rejected(err: &IntakeError, payload: &[u8], origin: &str) -> Self {
        let team_id = serde_json::from_slice::<serde_json::Value>(payload)
            .ok()
            .and_then(|envelope| envelope.get("team_id")?.as_i64());

        Self {
            reason: err.into(),
            error: err.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
            team_id,
            origin: origin.to_string(),
            failed_at: Utc::now(),
        }
    }

    /// A decoded event whose property definitions could not be persisted.
    pub fn unpersisted(event: &Event, error: impl ToString, origin: &str) -> Self {
        Self {
            reason: DeadLetterReason::Persistence,
            error: error.to_string(),
            payload: serde_json::to_string(event).unwrap_or_default(),
            team_id: Some(event.team_id),
            origin: origin.to_string(),
            failed_at: Utc::now(),
        }
    }
}

/// Appends JSON lines to a file under `<root>/<topic>/`.
///
/// Thread-safe: writes go through an internal lock.
pub struct TopicWriter {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    lines_written: AtomicUsize,
}

impl TopicWriter {
    /// Create the topic directory and open a fresh output file in it.
    pub fn open(root: &Path, topic: &str) -> Result<Self> {
        let dir = root.join(topic);
        fs::create_dir_all(&dir)?;

        let path = dir.join(format!(
            "{}-{}.jsonl",
            Utc::now().format("%Y%m%dT%H%M%S%.6f"),
            std::process::id()
        ));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        tracing::info!("Writing topic '{}' to {}", topic, path.display());

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
            lines_written: AtomicUsize::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lines_written(&self) -> usize {
        self.lines_written.load(Ordering::Relaxed)
    }

    fn write_line<T: Serialize>(&self, value: &T) -> Result<()> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        self.writer
            .lock()
            .write_all(&line)
            .map_err(|e| Error::Sink(format!("{}: {}", self.path.display(), e)))?;
        self.lines_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn flush_writer(&self) -> Result<()> {
        self.writer
            .lock()
            .flush()
            .map_err(|e| Error::Sink(format!("{}: {}", self.path.display(), e)))
    }
}

impl EventSink for TopicWriter {
    fn send(&self, event: &Event) -> Result<()> {
        self.write_line(event)
    }

    fn flush(&self) -> Result<()> {
        self.flush_writer()
    }
}

impl DeadLetterSink for TopicWriter {
    fn dead_letter(&self, letter: &DeadLetter) -> Result<()> {
        self.write_line(letter)
    }

    fn flush(&self) -> Result<()> {
        self.flush_writer()
    }
}

/// In-memory event sink.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

impl EventSink for MemorySink {
    fn send(&self, event: &Event) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// In-memory dead-letter sink.
#[derive(Default)]
pub struct MemoryDeadLetters {
    letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().clone()
    }
}

impl DeadLetterSink for MemoryDeadLetters {
    fn dead_letter(&self, letter: &DeadLetter) -> Result<()> {
        self.letters.lock().push(letter.clone());
        Ok(())
    }
}

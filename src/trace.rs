//! Per-item trace capture for profiling runs.

use serde::{Deserialize, Serialize};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc;
use std::time::{SystemTime, UNIX_EPOCH};

/// One JSONL row per attempted source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemTrace {
    pub timestamp_ms: i64,
    pub run_id: String,
    pub index: usize,
    pub source: String,
    pub source_hash: String,
    pub outcome: String,
    pub colors: usize,
    pub annotated: bool,
    pub failure_kind: Option<String>,
    pub failure_reason: Option<String>,
    pub latency_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("trace channel closed")]
    Closed,
    #[error("trace worker failed: {0}")]
    Join(String),
}

impl TraceError {
    pub fn code(&self) -> &'static str {
        match self {
            TraceError::Io(_) => "io",
            TraceError::Serde(_) => "serde",
            TraceError::Closed => "closed",
            TraceError::Join(_) => "join",
        }
    }
}

pub trait TraceSink: Send + Sync {
    fn record(&self, event: ItemTrace) -> Result<(), TraceError>;
}

#[derive(Clone)]
pub struct JsonlTraceSink {
    sender: mpsc::Sender<ItemTrace>,
}

pub struct TraceWorker {
    handle: Option<std::thread::JoinHandle<Result<(), TraceError>>>,
}

impl TraceWorker {
    /// Wait for the writer to drain and flush. Drop every sink clone first.
    pub fn join(mut self) -> Result<(), TraceError> {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(TraceError::Join("trace worker panicked".to_string())),
            },
            None => Ok(()),
        }
    }
}

impl JsonlTraceSink {
    pub fn new(path: impl AsRef<Path>) -> Result<(Self, TraceWorker), TraceError> {
        let file = std::fs::File::create(path)?;
        let (sender, receiver) = mpsc::channel::<ItemTrace>();
        let handle = std::thread::spawn(move || write_trace_loop(file, receiver));
        Ok((
            Self { sender },
            TraceWorker {
                handle: Some(handle),
            },
        ))
    }
}

impl TraceSink for JsonlTraceSink {
    fn record(&self, event: ItemTrace) -> Result<(), TraceError> {
        self.sender.send(event).map_err(|_| TraceError::Closed)
    }
}

fn write_trace_loop(
    file: std::fs::File,
    receiver: mpsc::Receiver<ItemTrace>,
) -> Result<(), TraceError> {
    let mut writer = BufWriter::new(file);
    for event in receiver {
        let line = serde_json::to_string(&event).map_err(|e| TraceError::Serde(e.to_string()))?;
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;
    Ok(())
}

/// Short blake3 digest of a source string, for correlating rows without the URL.
pub fn source_hash(source: &str) -> String {
    let hex = blake3::hash(source.as_bytes()).to_hex();
    hex[..16].to_string()
}

pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_hash_is_stable_and_short() {
        let a = source_hash("https://i.pinimg.com/a.jpg");
        assert_eq!(a.len(), 16);
        assert_eq!(a, source_hash("https://i.pinimg.com/a.jpg"));
        assert_ne!(a, source_hash("https://i.pinimg.com/b.jpg"));
    }
}

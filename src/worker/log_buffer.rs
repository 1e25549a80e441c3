use super::types::WorkerType;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::RwLock;

const DEFAULT_MAX_LINES: usize = 2_000;

/// Which stream a diagnostic line was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Stdout => f.write_str("stdout"),
            Stream::Stderr => f.write_str("stderr"),
        }
    }
}

/// Captured non-protocol output of one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticLine {
    pub instance: u64,
    pub stream: Stream,
    pub line: String,
}

/// Per-worker-type ring buffer of diagnostic output.
///
/// Lines kept here are for operators only and are never parsed.
pub struct LogBuffer {
    max_lines: usize,
    logs: RwLock<HashMap<WorkerType, VecDeque<DiagnosticLine>>>,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
            logs: RwLock::new(HashMap::new()),
        }
    }

    /// Append a line, dropping the oldest when over capacity.
    pub fn push(&self, worker_type: WorkerType, instance: u64, stream: Stream, line: String) {
        let mut logs = self.logs.write().unwrap_or_else(|e| e.into_inner());
        let entries = logs.entry(worker_type).or_default();
        entries.push_back(DiagnosticLine {
            instance,
            stream,
            line,
        });
        while entries.len() > self.max_lines {
            entries.pop_front();
        }
    }

    /// Last `n` lines for a worker type, oldest first.
    pub fn tail(&self, worker_type: WorkerType, n: usize) -> Vec<DiagnosticLine> {
        let logs = self.logs.read().unwrap_or_else(|e| e.into_inner());
        let Some(entries) = logs.get(&worker_type) else {
            return Vec::new();
        };
        let start = entries.len().saturating_sub(n);
        entries.iter().skip(start).cloned().collect()
    }

    pub fn clear(&self, worker_type: WorkerType) {
        let mut logs = self.logs.write().unwrap_or_else(|e| e.into_inner());
        logs.remove(&worker_type);
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES)
    }
}

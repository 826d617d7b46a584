//! Per-loop journal record types.
//!
//! One JSON object per line in `loops/<loopId>/log.jsonl`. These are pure
//! data types; appending, reading and tailing live in `drover-store`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who produced a journal record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    /// Output from the agent's stdout/stderr.
    Agent,
    /// Operator intervention text.
    Operator,
    /// Engine lifecycle notes (transitions, criterion updates, sweeps).
    System,
    /// Failures worth surfacing in the log stream.
    Error,
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogKind::Agent => write!(f, "agent"),
            LogKind::Operator => write!(f, "operator"),
            LogKind::System => write!(f, "system"),
            LogKind::Error => write!(f, "error"),
        }
    }
}

/// A single journal record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub loop_id: String,
    #[serde(rename = "type")]
    pub kind: LogKind,
    pub content: String,
}

impl LogEntry {
    /// Stamp a new record with the current time.
    pub fn new(loop_id: impl Into<String>, kind: LogKind, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            loop_id: loop_id.into(),
            kind,
            content: content.into(),
        }
    }
}

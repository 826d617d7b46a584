//! Typed loop events for real-time observability.
//!
//! Events are emitted by the engine after every durable state change.
//! Consumers (CLI, UI) subscribe via the broadcast bus and render them.
//! Pure data types with no async runtime dependency; the bus lives in
//! `drover-engine`.

use crate::log::LogKind;
use crate::loops::CompletedBy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A timestamped loop event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: LoopEventKind,
}

impl LoopEvent {
    pub fn new(kind: LoopEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// The specific kind of loop event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LoopEventKind {
    /// A loop was created and queued.
    LoopCreated { loop_id: String, issue_title: String },

    /// Loop status changed.
    StatusChanged {
        loop_id: String,
        from: String,
        to: String,
    },

    /// A criterion was marked complete or incomplete.
    CriterionUpdated {
        loop_id: String,
        /// 1-based index against the stored criteria order.
        index: usize,
        completed: bool,
        by: CompletedBy,
    },

    /// The agent's durable session identifier was captured.
    SessionCaptured { loop_id: String, session_id: String },

    /// A journal record was appended.
    LogAppended { loop_id: String, kind: LogKind },

    /// An operator message was delivered to the agent's stdin.
    InterventionSent { loop_id: String },

    /// Startup sweep flagged loops orphaned by a previous supervisor run.
    OrphansMarked { count: usize },

    /// A previous-session paused loop was discarded.
    LoopDiscarded { loop_id: String },

    /// The upstream issue was closed.
    IssueClosed {
        loop_id: String,
        already_closed: bool,
    },
}

impl std::fmt::Display for LoopEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ts = self.timestamp.format("%H:%M:%S%.3f");
        match &self.kind {
            LoopEventKind::LoopCreated {
                loop_id,
                issue_title,
            } => write!(f, "[{ts}] {loop_id}: created ({issue_title})"),

            LoopEventKind::StatusChanged { loop_id, from, to } => {
                write!(f, "[{ts}] {loop_id}: {from} -> {to}")
            }

            LoopEventKind::CriterionUpdated {
                loop_id,
                index,
                completed,
                by,
            } => {
                let state = if *completed { "complete" } else { "incomplete" };
                write!(f, "[{ts}] {loop_id}: criterion {index} {state} ({by})")
            }

            LoopEventKind::SessionCaptured {
                loop_id,
                session_id,
            } => write!(f, "[{ts}] {loop_id}: session captured ({session_id})"),

            LoopEventKind::LogAppended { loop_id, kind } => {
                write!(f, "[{ts}] {loop_id}: log appended ({kind})")
            }

            LoopEventKind::InterventionSent { loop_id } => {
                write!(f, "[{ts}] {loop_id}: intervention sent")
            }

            LoopEventKind::OrphansMarked { count } => {
                write!(f, "[{ts}] marked {count} orphaned loop(s) as paused")
            }

            LoopEventKind::LoopDiscarded { loop_id } => {
                write!(f, "[{ts}] {loop_id}: discarded")
            }

            LoopEventKind::IssueClosed {
                loop_id,
                already_closed,
            } => {
                if *already_closed {
                    write!(f, "[{ts}] {loop_id}: issue already closed")
                } else {
                    write!(f, "[{ts}] {loop_id}: issue closed")
                }
            }
        }
    }
}

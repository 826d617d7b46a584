use crate::issue::Issue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Unique loop identifier, stable across supervisor restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoopId(pub String);

impl LoopId {
    /// Generate a new loop ID: `loop-{uuidv7}`.
    ///
    /// UUIDv7 keeps IDs time-ordered, which makes log directories sort
    /// chronologically on disk.
    pub fn generate() -> Self {
        Self(format!("loop-{}", Uuid::now_v7().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for LoopId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Loop status as a state machine.
///
/// Transitions:
///   Queued -> Running -> (Paused <-> Running)* -> Completed | Stopped | Error
///   Error | Stopped -> Running (retry)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Stopped,
    Error,
}

impl LoopStatus {
    /// Short label for display and logs.
    pub fn label(&self) -> &'static str {
        match self {
            LoopStatus::Queued => "queued",
            LoopStatus::Running => "running",
            LoopStatus::Paused => "paused",
            LoopStatus::Completed => "completed",
            LoopStatus::Stopped => "stopped",
            LoopStatus::Error => "error",
        }
    }

    /// Terminal statuses carry an `ended_at` timestamp. Retry resurrects
    /// `stopped` and `error` loops, so terminal is not forever.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LoopStatus::Completed | LoopStatus::Stopped | LoopStatus::Error
        )
    }

    /// Whether a live child process may be attached in this status.
    pub fn may_have_process(&self) -> bool {
        matches!(self, LoopStatus::Running | LoopStatus::Paused)
    }
}

impl fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Who completed an acceptance criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletedBy {
    Agent,
    Operator,
}

impl fmt::Display for CompletedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletedBy::Agent => write!(f, "agent"),
            CompletedBy::Operator => write!(f, "operator"),
        }
    }
}

/// One checkable item the agent must satisfy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptanceCriterion {
    pub text: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub completed_by: Option<CompletedBy>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl AcceptanceCriterion {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            completed: false,
            completed_by: None,
            completed_at: None,
        }
    }

    /// Mark complete. Idempotent: repeating does not touch the timestamp.
    pub fn mark_completed(&mut self, by: CompletedBy) -> bool {
        if self.completed {
            return false;
        }
        self.completed = true;
        self.completed_by = Some(by);
        self.completed_at = Some(Utc::now());
        true
    }

    pub fn mark_incomplete(&mut self) -> bool {
        if !self.completed {
            return false;
        }
        self.completed = false;
        self.completed_by = None;
        self.completed_at = None;
        true
    }
}

/// A managed, long-running attempt by an agent to complete one issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Loop {
    pub id: LoopId,
    /// Tag selecting an agent adapter from the registry.
    pub agent: String,
    pub status: LoopStatus,
    pub issue: Issue,
    /// Absolute path to the agent's working directory.
    pub repo_root: PathBuf,
    #[serde(default)]
    pub skip_permissions: bool,
    /// Session identifier extracted from the agent's output stream.
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub paused_at: Option<DateTime<Utc>>,
    /// True iff the loop was paused at shutdown and the supervisor restarted.
    #[serde(default)]
    pub paused_from_previous_session: bool,
    #[serde(default)]
    pub issue_closed: bool,
    /// Human-readable last-failure reason.
    #[serde(default)]
    pub error: Option<String>,
    /// Last-known child pid. Not authoritative across restarts.
    #[serde(default)]
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Loop {
    pub fn new(issue: Issue, agent: impl Into<String>, repo_root: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id: LoopId::generate(),
            agent: agent.into(),
            status: LoopStatus::Queued,
            issue,
            repo_root,
            skip_permissions: false,
            session_id: None,
            started_at: None,
            ended_at: None,
            paused_at: None,
            paused_from_previous_session: false,
            issue_closed: false,
            error: None,
            pid: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn all_criteria_complete(&self) -> bool {
        !self.issue.acceptance_criteria.is_empty()
            && self.issue.acceptance_criteria.iter().all(|c| c.completed)
    }

    /// Incomplete criteria with their original 1-based indices, in stored order.
    pub fn remaining_criteria(&self) -> Vec<(usize, &AcceptanceCriterion)> {
        self.issue
            .acceptance_criteria
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.completed)
            .map(|(i, c)| (i + 1, c))
            .collect()
    }

    /// Look up a criterion by its 1-based index.
    pub fn criterion_mut(&mut self, index: usize) -> Option<&mut AcceptanceCriterion> {
        if index == 0 {
            return None;
        }
        self.issue.acceptance_criteria.get_mut(index - 1)
    }
}

/// The full persistent state: an ordered list of loops.
///
/// Order is preserved across round-trips so the UI keeps stable identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default)]
    pub loops: Vec<Loop>,
}

impl StateDocument {
    pub fn find(&self, id: &LoopId) -> Option<&Loop> {
        self.loops.iter().find(|l| &l.id == id)
    }

    pub fn find_mut(&mut self, id: &LoopId) -> Option<&mut Loop> {
        self.loops.iter_mut().find(|l| &l.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::Issue;

    fn test_issue(criteria: &[&str]) -> Issue {
        Issue::new(
            "https://example.test/repo/issues/7",
            7,
            "Test issue",
            "body",
            "repo",
            criteria.iter().map(|c| AcceptanceCriterion::new(*c)).collect(),
        )
    }

    #[test]
    fn loop_ids_are_unique() {
        let a = LoopId::generate();
        let b = LoopId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("loop-"));
    }

    #[test]
    fn criterion_completion_is_idempotent() {
        let mut c = AcceptanceCriterion::new("build passes");
        assert!(c.mark_completed(CompletedBy::Agent));
        let first_stamp = c.completed_at;

        // Second completion is a no-op and keeps the original timestamp.
        assert!(!c.mark_completed(CompletedBy::Agent));
        assert_eq!(c.completed_at, first_stamp);

        assert!(c.mark_incomplete());
        assert!(c.completed_by.is_none());
        assert!(c.completed_at.is_none());
        assert!(!c.mark_incomplete());
    }

    #[test]
    fn remaining_criteria_keep_original_indices() {
        let mut lp = Loop::new(test_issue(&["A", "B", "C"]), "claude", "/tmp".into());
        lp.criterion_mut(2).unwrap().mark_completed(CompletedBy::Agent);

        let remaining = lp.remaining_criteria();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].0, 1);
        assert_eq!(remaining[1].0, 3);
        assert_eq!(remaining[1].1.text, "C");
    }

    #[test]
    fn criterion_index_is_one_based() {
        let mut lp = Loop::new(test_issue(&["A"]), "claude", "/tmp".into());
        assert!(lp.criterion_mut(0).is_none());
        assert!(lp.criterion_mut(1).is_some());
        assert!(lp.criterion_mut(2).is_none());
    }

    #[test]
    fn state_document_round_trip_preserves_order() {
        let mut doc = StateDocument::default();
        for name in ["first", "second", "third"] {
            let mut lp = Loop::new(test_issue(&["A"]), "claude", "/tmp".into());
            lp.issue.title = name.to_string();
            doc.loops.push(lp);
        }

        let json = serde_json::to_string(&doc).unwrap();
        let parsed: StateDocument = serde_json::from_str(&json).unwrap();
        let titles: Vec<_> = parsed.loops.iter().map(|l| l.issue.title.as_str()).collect();
        assert_eq!(titles, vec!["first", "second", "third"]);
    }

    #[test]
    fn loop_serializes_camel_case() {
        let lp = Loop::new(test_issue(&["A"]), "claude", "/tmp".into());
        let json = serde_json::to_value(&lp).unwrap();
        assert!(json.get("repoRoot").is_some());
        assert!(json.get("pausedFromPreviousSession").is_some());
        assert!(json.get("issueClosed").is_some());
    }
}

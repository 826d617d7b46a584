//! Issue-tracker interface consumed by the engine.
//!
//! The engine never fetches or parses issues itself. It goes through
//! this trait, stays off the state lock while awaiting it, and treats
//! every failure as loggable rather than fatal to the loop. Two local
//! implementations ship here: an in-memory tracker for tests and a
//! file-backed tracker so the CLI can drive loops from a markdown file
//! without any network client.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use drover_core::issue::{Issue, apply_criteria_to_body, parse_acceptance_criteria};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

/// Repo + number extracted from an issue URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueLocator {
    pub repo: String,
    pub number: u64,
}

/// Outcome of a close request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    Closed,
    AlreadyClosed,
}

#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Validate and decompose an issue URL. Pure.
    fn parse_url(&self, url: &str) -> Result<IssueLocator>;

    /// Fetch the issue snapshot, criteria parsed from the body.
    async fn fetch(&self, url: &str) -> Result<Issue>;

    /// Replace the issue body upstream.
    async fn update_body(&self, url: &str, body: &str) -> Result<()>;

    /// Close the issue, optionally with a comment.
    async fn close(&self, url: &str, comment: Option<&str>) -> Result<CloseOutcome>;
}

/// Parse `…/<owner>/<repo>/issues/<number>` style URLs.
fn parse_issue_url(url: &str) -> Result<IssueLocator> {
    let segments: Vec<&str> = url.trim_end_matches('/').split('/').collect();
    let issues_at = segments
        .iter()
        .rposition(|s| *s == "issues")
        .context(format!("no /issues/ segment in URL: {url}"))?;
    let number: u64 = segments
        .get(issues_at + 1)
        .context(format!("no issue number in URL: {url}"))?
        .parse()
        .context(format!("issue number is not numeric in URL: {url}"))?;
    if issues_at < 2 {
        bail!("no owner/repo in URL: {url}");
    }
    let repo = format!("{}/{}", segments[issues_at - 2], segments[issues_at - 1]);
    Ok(IssueLocator { repo, number })
}

/// In-memory tracker for tests and dry runs.
#[derive(Default)]
pub struct MemoryIssueTracker {
    issues: Mutex<HashMap<String, MemoryIssue>>,
}

struct MemoryIssue {
    title: String,
    body: String,
    closed: bool,
}

impl MemoryIssueTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, url: impl Into<String>, title: impl Into<String>, body: impl Into<String>) {
        self.issues.lock().await.insert(
            url.into(),
            MemoryIssue {
                title: title.into(),
                body: body.into(),
                closed: false,
            },
        );
    }

    /// Current body, for assertions on re-rendering.
    pub async fn body(&self, url: &str) -> Option<String> {
        self.issues.lock().await.get(url).map(|i| i.body.clone())
    }

    pub async fn is_closed(&self, url: &str) -> bool {
        self.issues
            .lock()
            .await
            .get(url)
            .map(|i| i.closed)
            .unwrap_or(false)
    }
}

#[async_trait]
impl IssueTracker for MemoryIssueTracker {
    fn parse_url(&self, url: &str) -> Result<IssueLocator> {
        parse_issue_url(url)
    }

    async fn fetch(&self, url: &str) -> Result<Issue> {
        let locator = self.parse_url(url)?;
        let issues = self.issues.lock().await;
        let stored = issues.get(url).context(format!("unknown issue: {url}"))?;
        Ok(Issue::new(
            url,
            locator.number,
            &stored.title,
            &stored.body,
            &locator.repo,
            parse_acceptance_criteria(&stored.body),
        ))
    }

    async fn update_body(&self, url: &str, body: &str) -> Result<()> {
        let mut issues = self.issues.lock().await;
        let stored = issues
            .get_mut(url)
            .context(format!("unknown issue: {url}"))?;
        stored.body = body.to_string();
        Ok(())
    }

    async fn close(&self, url: &str, _comment: Option<&str>) -> Result<CloseOutcome> {
        let mut issues = self.issues.lock().await;
        let stored = issues
            .get_mut(url)
            .context(format!("unknown issue: {url}"))?;
        if stored.closed {
            return Ok(CloseOutcome::AlreadyClosed);
        }
        stored.closed = true;
        Ok(CloseOutcome::Closed)
    }
}

const CLOSED_MARKER: &str = "<!-- drover: issue closed -->";

/// Tracker backed by local markdown files.
///
/// The "URL" is a filesystem path; the first `# ` heading is the title
/// and the rest is the body. Closing appends a marker (plus any comment)
/// after the body; that tail is carved off before the body is handed to
/// the engine and re-attached whenever the body is rewritten, so a body
/// update never un-closes the issue. Lets the CLI exercise full loop
/// lifecycles without a network tracker.
pub struct FileIssueTracker;

impl FileIssueTracker {
    /// Split raw file contents into title, body, and the close tail (the
    /// closed marker and everything after it, when present).
    fn split_parts(raw: &str) -> (String, String, Option<String>) {
        let (doc, tail) = match raw.find(CLOSED_MARKER) {
            Some(at) => (&raw[..at], Some(raw[at..].to_string())),
            None => (raw, None),
        };
        let mut lines = doc.lines();
        let (title, body) = match lines.next() {
            Some(first) if first.starts_with("# ") => (
                first[2..].trim().to_string(),
                lines.collect::<Vec<_>>().join("\n"),
            ),
            _ => ("(untitled issue)".to_string(), doc.to_string()),
        };
        (title, body, tail)
    }
}

#[async_trait]
impl IssueTracker for FileIssueTracker {
    fn parse_url(&self, url: &str) -> Result<IssueLocator> {
        let path = PathBuf::from(url);
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            bail!("expected a .md issue file, got: {url}");
        }
        Ok(IssueLocator {
            repo: "local".to_string(),
            number: 0,
        })
    }

    async fn fetch(&self, url: &str) -> Result<Issue> {
        let locator = self.parse_url(url)?;
        let raw = tokio::fs::read_to_string(url)
            .await
            .context(format!("failed to read issue file: {url}"))?;
        let (title, body, _) = Self::split_parts(&raw);
        let criteria = parse_acceptance_criteria(&body);
        Ok(Issue::new(url, locator.number, title, body, locator.repo, criteria))
    }

    async fn update_body(&self, url: &str, body: &str) -> Result<()> {
        let raw = tokio::fs::read_to_string(url)
            .await
            .context(format!("failed to read issue file: {url}"))?;
        let (title, _, tail) = Self::split_parts(&raw);
        let mut rendered = format!("# {title}\n{body}");
        // A closed issue stays closed across body rewrites.
        if let Some(tail) = tail {
            if !rendered.ends_with('\n') {
                rendered.push('\n');
            }
            rendered.push_str(&tail);
        }
        tokio::fs::write(url, rendered)
            .await
            .context(format!("failed to write issue file: {url}"))
    }

    async fn close(&self, url: &str, comment: Option<&str>) -> Result<CloseOutcome> {
        let raw = tokio::fs::read_to_string(url)
            .await
            .context(format!("failed to read issue file: {url}"))?;
        if raw.contains(CLOSED_MARKER) {
            return Ok(CloseOutcome::AlreadyClosed);
        }
        let mut updated = raw;
        if !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(CLOSED_MARKER);
        updated.push('\n');
        if let Some(comment) = comment {
            updated.push_str(comment);
            updated.push('\n');
        }
        tokio::fs::write(url, updated)
            .await
            .context(format!("failed to write issue file: {url}"))?;
        Ok(CloseOutcome::Closed)
    }
}

/// Re-render an issue body with the loop's current criteria state.
pub fn render_body(body: &str, criteria: &[drover_core::loops::AcceptanceCriterion]) -> String {
    apply_criteria_to_body(body, criteria)
}

//! Issue snapshot and acceptance-criteria body handling.
//!
//! The engine never talks to a tracker directly. It stores a snapshot of
//! the issue at loop creation and re-renders the criteria checklist back
//! into the body when the operator toggles items. The parse/apply pair
//! round-trips: `apply_criteria_to_body(body, parse_acceptance_criteria(body))`
//! reproduces the body up to whitespace when a criteria section exists.

use crate::loops::AcceptanceCriterion;
use serde::{Deserialize, Serialize};

/// Snapshot of a tracked issue, captured at loop creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub url: String,
    pub number: u64,
    pub title: String,
    pub body: String,
    /// Repository reference, e.g. `owner/name`.
    pub repo: String,
    pub acceptance_criteria: Vec<AcceptanceCriterion>,
    /// Immutable snapshot of the criteria as parsed at creation time.
    pub original_acceptance_criteria: Vec<AcceptanceCriterion>,
}

impl Issue {
    pub fn new(
        url: impl Into<String>,
        number: u64,
        title: impl Into<String>,
        body: impl Into<String>,
        repo: impl Into<String>,
        acceptance_criteria: Vec<AcceptanceCriterion>,
    ) -> Self {
        let original = acceptance_criteria.clone();
        Self {
            url: url.into(),
            number,
            title: title.into(),
            body: body.into(),
            repo: repo.into(),
            acceptance_criteria,
            original_acceptance_criteria: original,
        }
    }
}

/// Whether a line opens the acceptance-criteria section.
fn is_criteria_heading(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with('#') && {
        let heading = trimmed.trim_start_matches('#').trim();
        heading.eq_ignore_ascii_case("acceptance criteria")
    }
}

/// Parse a checkbox line: `- [ ] text` or `- [x] text`.
fn parse_checkbox(line: &str) -> Option<(bool, &str)> {
    let trimmed = line.trim_start();
    let rest = trimmed
        .strip_prefix("- [ ]")
        .map(|r| (false, r))
        .or_else(|| trimmed.strip_prefix("- [x]").map(|r| (true, r)))
        .or_else(|| trimmed.strip_prefix("- [X]").map(|r| (true, r)))?;
    Some((rest.0, rest.1.trim()))
}

/// Extract acceptance criteria from an issue body.
///
/// Looks for a heading whose text is "Acceptance Criteria" (any level,
/// case-insensitive) and collects the checkbox list items that follow it,
/// up to the next heading. Bodies without a recognized section yield an
/// empty list.
pub fn parse_acceptance_criteria(body: &str) -> Vec<AcceptanceCriterion> {
    let mut criteria = Vec::new();
    let mut in_section = false;

    for line in body.lines() {
        if is_criteria_heading(line) {
            in_section = true;
            continue;
        }
        if in_section {
            if line.trim_start().starts_with('#') {
                break;
            }
            if let Some((checked, text)) = parse_checkbox(line) {
                let mut criterion = AcceptanceCriterion::new(text);
                criterion.completed = checked;
                criteria.push(criterion);
            }
        }
    }

    criteria
}

fn render_checkbox(criterion: &AcceptanceCriterion) -> String {
    let mark = if criterion.completed { "x" } else { " " };
    format!("- [{mark}] {}", criterion.text)
}

/// Rewrite the criteria checklist inside an issue body.
///
/// Checkbox lines in the recognized section are replaced positionally with
/// the given criteria; everything else is preserved verbatim. If the body
/// has no criteria section, one is appended at the end.
pub fn apply_criteria_to_body(body: &str, criteria: &[AcceptanceCriterion]) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut in_section = false;
    let mut section_seen = false;
    let mut next = 0usize;

    for line in body.lines() {
        if is_criteria_heading(line) {
            in_section = true;
            section_seen = true;
            out.push(line.to_string());
            continue;
        }
        if in_section {
            if line.trim_start().starts_with('#') {
                in_section = false;
            } else if parse_checkbox(line).is_some() {
                if let Some(criterion) = criteria.get(next) {
                    out.push(render_checkbox(criterion));
                    next += 1;
                }
                // Extra checkbox lines beyond the criteria list are dropped.
                continue;
            }
        }
        out.push(line.to_string());
    }

    if !section_seen && !criteria.is_empty() {
        if !out.is_empty() {
            out.push(String::new());
        }
        out.push("## Acceptance Criteria".to_string());
        out.push(String::new());
        for criterion in criteria {
            out.push(render_checkbox(criterion));
        }
    }

    let mut rendered = out.join("\n");
    if body.ends_with('\n') {
        rendered.push('\n');
    }
    rendered
}

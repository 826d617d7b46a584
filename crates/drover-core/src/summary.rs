//! Resume summarizer: compress a loop's journal into a bounded work summary.
//!
//! Pure function of the log. Used to seed the agent's prompt on a
//! cross-session resume, where the original process (and its context) is
//! gone and only the journal survives.

use crate::log::{LogEntry, LogKind};
use regex::Regex;

/// Limits for summary construction.
#[derive(Debug, Clone)]
pub struct SummaryConfig {
    /// Upper bound on the final summary length, in characters.
    pub max_chars: usize,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self { max_chars: 2000 }
    }
}

const MAX_FILES: usize = 10;
const TAIL_ENTRIES: usize = 5;
const TAIL_ENTRY_CHARS: usize = 200;
const TAIL_TOTAL_CHARS: usize = 800;

/// Truncate to at most `max` characters, appending an ellipsis if cut.
fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Build a compact work summary from a loop's journal.
pub fn summarize(entries: &[LogEntry], config: &SummaryConfig) -> String {
    let mut sections: Vec<String> = Vec::new();

    // Iteration markers emitted by agents that structure their work in passes.
    let iteration_re = Regex::new(r"--- Iteration (\d+)").expect("static regex");
    let max_iteration = entries
        .iter()
        .flat_map(|e| iteration_re.captures_iter(&e.content))
        .filter_map(|c| c[1].parse::<u64>().ok())
        .max();
    if let Some(n) = max_iteration {
        sections.push(format!("Iterations completed: {n}"));
    }

    // Verb-then-path heuristic over agent output. The extension is 1-5
    // lowercase letters, which filters out prose that happens to follow
    // an edit verb.
    let file_re = Regex::new(
        r"\b(?i:created|modified|edited|wrote|updated|deleted)\b:?\s+`?([\w./~-]+\.[a-z]{1,5})\b",
    )
    .expect("static regex");
    let mut files: Vec<String> = Vec::new();
    for entry in entries.iter().filter(|e| e.kind == LogKind::Agent) {
        for cap in file_re.captures_iter(&entry.content) {
            let path = cap[1].to_string();
            if !files.contains(&path) {
                files.push(path);
            }
        }
    }
    if !files.is_empty() {
        files.truncate(MAX_FILES);
        let list: Vec<String> = files.iter().map(|f| format!("- {f}")).collect();
        sections.push(format!("Files touched:\n{}", list.join("\n")));
    }

    // Criterion updates recorded by the engine at system level.
    let criterion_re = Regex::new(r"^Criterion \d+ .*complete").expect("static regex");
    let updates = entries
        .iter()
        .filter(|e| e.kind == LogKind::System && criterion_re.is_match(&e.content))
        .count();
    if updates > 0 {
        sections.push(format!("Criteria progress: {updates} updates"));
    }

    // The agent's most recent self-assessment, if it writes one.
    let last_analysis = entries
        .iter()
        .flat_map(|e| e.content.lines())
        .filter(|l| l.starts_with("Analysis:"))
        .next_back();
    if let Some(line) = last_analysis {
        sections.push(format!("Last analysis: {}", line["Analysis:".len()..].trim()));
    }

    // Raw recent activity as a fallback signal.
    let recent: Vec<&LogEntry> = entries
        .iter()
        .filter(|e| e.kind == LogKind::Agent)
        .rev()
        .take(TAIL_ENTRIES)
        .collect();
    if !recent.is_empty() {
        let tail = recent
            .iter()
            .rev()
            .map(|e| truncate_chars(e.content.trim(), TAIL_ENTRY_CHARS))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!(
            "Recent activity:\n{}",
            truncate_chars(&tail, TAIL_TOTAL_CHARS)
        ));
    }

    truncate_chars(&sections.join("\n\n"), config.max_chars)
}

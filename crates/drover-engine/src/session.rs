//! Session coordinator: same-session vs cross-session resume.
//!
//! A paused loop resumes in one of two ways. If the original child still
//! exists (paused in this supervisor session on a platform with
//! stop/continue signals), resuming is just a continue signal. If the
//! supervisor restarted in between, the process is gone and a fresh one
//! must be seeded with a summary of prior work plus the criteria still
//! open; that construction lives here.

use crate::adapter::{AgentAdapter, LaunchSpec};
use crate::supervisor::ProcessSupervisor;
use drover_core::log::LogEntry;
use drover_core::loops::{Loop, LoopStatus};
use drover_core::summary::{SummaryConfig, summarize};

/// How a paused loop can be resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    /// Signal the still-live child to continue.
    SameSession,
    /// Spawn a fresh child seeded with a work summary.
    CrossSession,
}

/// Decide the resume mode for a paused loop.
///
/// `has_process` is the supervisor's answer for this loop. A loop paused
/// by a previous supervisor run always resumes cross-session, as does any
/// pause on a platform without stop/continue signals.
pub fn resume_mode(lp: &Loop, has_process: bool) -> Option<ResumeMode> {
    if lp.status != LoopStatus::Paused {
        return None;
    }
    if !lp.paused_from_previous_session
        && has_process
        && ProcessSupervisor::supports_signal_pause()
    {
        Some(ResumeMode::SameSession)
    } else {
        Some(ResumeMode::CrossSession)
    }
}

/// A fully constructed cross-session launch.
pub struct ResumeLaunch {
    pub spec: LaunchSpec,
    pub prompt: String,
}

/// Build the cross-session launch for a paused loop.
///
/// The summary is derived solely from the journal. Remaining criteria are
/// rendered with their original 1-based indices so the agent's
/// `<criterion-complete>N</criterion-complete>` tokens keep indexing the
/// stored order. A known session id routes through the adapter's
/// continue path; otherwise this is a fresh spawn.
pub fn build_cross_session_launch(
    adapter: &dyn AgentAdapter,
    lp: &Loop,
    entries: &[LogEntry],
    summary_config: &SummaryConfig,
) -> ResumeLaunch {
    let summary = summarize(entries, summary_config);
    let remaining: Vec<String> = lp
        .remaining_criteria()
        .into_iter()
        .map(|(index, criterion)| format!("{index}. {}", criterion.text))
        .collect();

    let prompt = adapter.build_resume_prompt(&summary, &remaining);
    let spec = match lp.session_id.as_deref() {
        Some(session_id) => adapter.build_continue_args(session_id, &prompt, lp.skip_permissions),
        None => adapter.build_spawn_args(&prompt, lp.skip_permissions),
    };

    ResumeLaunch { spec, prompt }
}

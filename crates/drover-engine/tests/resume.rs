//! Cross-session resume: orphan sweep, summary seeding, discard, close.
//!
//! A supervisor restart is simulated by editing the state document and
//! journal directly (as the previous process would have left them) and
//! bringing an engine up over the same data root.

#![cfg(unix)]

mod common;

use common::*;
use drover_core::log::LogKind;
use drover_core::loops::{CompletedBy, LoopId, LoopStatus};
use drover_engine::error::EngineError;
use drover_engine::issues::CloseOutcome;
use drover_store::journal::LogJournal;
use drover_store::state::StateStore;

/// A pid that is certainly dead: spawn a short-lived child and reap it.
fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

/// Rewrite a loop as the previous supervisor would have left it mid-run:
/// running, with a pid that no longer exists and a journal of past work.
fn simulate_crashed_session(h: &Harness, id: &LoopId, session_id: Option<&str>) {
    let store = StateStore::new(h.dir.path());
    let journal = LogJournal::new(h.dir.path());
    let pid = dead_pid();

    store
        .update_loop(id, |l| {
            l.status = LoopStatus::Running;
            l.started_at = Some(chrono::Utc::now());
            l.pid = Some(pid);
            l.session_id = session_id.map(|s| s.to_string());
            if let Some(criterion) = l.criterion_mut(2) {
                criterion.mark_completed(CompletedBy::Agent);
            }
        })
        .unwrap()
        .expect("loop exists");

    journal.append(id, LogKind::Agent, "--- Iteration 1").unwrap();
    journal
        .append(id, LogKind::Agent, "Modified src/main.rs and created tests/cli.rs")
        .unwrap();
    journal.append(id, LogKind::System, "Criterion 2 complete").unwrap();
    journal.append(id, LogKind::Agent, "--- Iteration 2").unwrap();
    journal
        .append(id, LogKind::Agent, "Analysis: A and C still open")
        .unwrap();
}

#[tokio::test]
async fn cross_session_resume_seeds_summary_and_remaining_criteria() {
    let h = Harness::with_body(
        &["printf 'resumed <promise>TASK COMPLETE</promise>'"],
        THREE_CRITERIA_BODY,
    )
    .await;
    let lp = h.create().await;
    simulate_crashed_session(&h, &lp.id, Some("ses-prior"));

    // Restart: the sweep flags the loop as orphaned.
    let count = h.engine.mark_orphaned_paused_loops().await.unwrap();
    assert_eq!(count, 1);

    let orphaned = h.engine.get_loop(&lp.id).unwrap();
    assert_eq!(orphaned.status, LoopStatus::Paused);
    assert!(orphaned.paused_from_previous_session);
    assert!(orphaned.pid.is_none());
    assert!(!h.engine.can_resume_in_session(&lp.id).await.unwrap());

    // Resume spawns a fresh process seeded from the journal.
    h.engine.resume_paused_loop(&lp.id).await.unwrap();

    let prompts = h.adapter.prompts();
    assert_eq!(prompts.len(), 1);
    let prompt = &prompts[0];
    assert!(prompt.contains("RESUMING FROM PAUSE"));
    // Summary content derived solely from the journal.
    assert!(prompt.contains("Iterations completed: 2"));
    assert!(prompt.contains("src/main.rs"));
    assert!(prompt.contains("Criteria progress: 1 updates"));
    assert!(prompt.contains("Last analysis: A and C still open"));
    // Exactly the incomplete criteria, in original order with original
    // numbering.
    assert!(prompt.contains("1. A"));
    assert!(!prompt.contains("2. B"));
    assert!(prompt.contains("3. C"));
    let pos_a = prompt.find("1. A").unwrap();
    let pos_c = prompt.find("3. C").unwrap();
    assert!(pos_a < pos_c);

    // The known session id routed through the continue path.
    assert_eq!(h.adapter.continue_sessions(), vec!["ses-prior".to_string()]);

    let done = wait_for_status(&h.engine, &lp.id, LoopStatus::Completed).await;
    assert!(!done.paused_from_previous_session);
    assert!(done.ended_at.is_some());
}

#[tokio::test]
async fn resume_without_session_id_spawns_fresh() {
    let h = Harness::new(&["printf '<promise>TASK COMPLETE</promise>'"]).await;
    let lp = h.create().await;
    simulate_crashed_session(&h, &lp.id, None);

    h.engine.mark_orphaned_paused_loops().await.unwrap();
    h.engine.resume_paused_loop(&lp.id).await.unwrap();

    // No session id, so the continue path was never taken.
    assert!(h.adapter.continue_sessions().is_empty());
    assert_eq!(h.adapter.prompts().len(), 1);
    wait_for_status(&h.engine, &lp.id, LoopStatus::Completed).await;
}

#[tokio::test]
async fn sweep_is_a_noop_without_orphans() {
    let h = Harness::new(&[]).await;
    h.create().await; // queued, no pid
    assert_eq!(h.engine.mark_orphaned_paused_loops().await.unwrap(), 0);
}

#[tokio::test]
async fn discard_removes_state_and_journal() {
    let h = Harness::new(&[]).await;
    let lp = h.create().await;
    simulate_crashed_session(&h, &lp.id, None);
    h.engine.mark_orphaned_paused_loops().await.unwrap();

    assert!(!h.engine.journal().read_all(&lp.id).unwrap().is_empty());
    h.engine.discard_paused_loop(&lp.id).await.unwrap();

    assert!(matches!(
        h.engine.get_loop(&lp.id).unwrap_err(),
        EngineError::LoopNotFound(_)
    ));
    assert!(h.engine.journal().read_all(&lp.id).unwrap().is_empty());
    assert!(h.engine.list_loops().unwrap().is_empty());
}

#[tokio::test]
async fn discard_requires_previous_session_pause() {
    let h = Harness::new(&["sleep 30"]).await;
    let id = h.create_and_start().await;
    wait_for_status(&h.engine, &id, LoopStatus::Running).await;
    h.engine.pause_loop(&id).await.unwrap();

    // Same-session pause: not discardable.
    let err = h.engine.discard_paused_loop(&id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));

    h.engine.stop_loop(&id).await.unwrap();
    wait_for_status(&h.engine, &id, LoopStatus::Stopped).await;
}

#[tokio::test]
async fn close_issue_requires_completion_and_is_idempotent() {
    let h = Harness::new(&["printf '<promise>TASK COMPLETE</promise>'"]).await;
    let lp = h.create().await;

    // Not completed yet.
    let err = h.engine.close_issue(&lp.id, None).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));

    h.engine.start_loop(&lp.id).await.unwrap();
    wait_for_status(&h.engine, &lp.id, LoopStatus::Completed).await;

    let outcome = h.engine.close_issue(&lp.id, Some("done")).await.unwrap();
    assert_eq!(outcome, CloseOutcome::Closed);
    assert!(h.engine.get_loop(&lp.id).unwrap().issue_closed);
    assert!(h.tracker.is_closed(ISSUE_URL).await);

    // Second close short-circuits on the stored flag.
    let outcome = h.engine.close_issue(&lp.id, None).await.unwrap();
    assert_eq!(outcome, CloseOutcome::AlreadyClosed);
}

#[tokio::test]
async fn startup_recovers_from_corrupt_state() {
    let h = Harness::new(&[]).await;
    std::fs::write(h.dir.path().join("state.json"), "{definitely not json").unwrap();

    let count = h.engine.startup().await.unwrap();
    assert_eq!(count, 0);
    assert!(h.engine.list_loops().unwrap().is_empty());

    // The engine is fully usable after the reset.
    let lp = h.create().await;
    assert_eq!(h.engine.list_loops().unwrap().len(), 1);
    assert_eq!(h.engine.get_loop(&lp.id).unwrap().status, LoopStatus::Queued);
}

#[tokio::test]
async fn summarize_loop_reads_the_journal() {
    let h = Harness::new(&[]).await;
    let lp = h.create().await;
    simulate_crashed_session(&h, &lp.id, None);

    let summary = h.engine.summarize_loop(&lp.id).unwrap();
    assert!(summary.contains("Iterations completed: 2"));
    assert!(summary.contains("tests/cli.rs"));
    assert!(summary.contains("Recent activity:"));
}

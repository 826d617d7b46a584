//! The loop engine: owns the state machine and orchestrates everything.
//!
//! One engine per supervisor process. All state-document mutations are
//! serialized through a single mutex; agent events arrive over a channel
//! and are applied by one dispatcher task, so per-loop effects happen in
//! stream order. Event-bus publication always follows the durable write.

use crate::adapter::{AdapterRegistry, AgentAdapter, LaunchSpec};
use crate::error::{EngineError, EngineResult};
use crate::event_bus::EventBus;
use crate::issues::{CloseOutcome, IssueTracker, render_body};
use crate::parser::ParsedEvent;
use crate::session::{ResumeMode, build_cross_session_launch, resume_mode};
use crate::supervisor::{ProcessSupervisor, SupervisorEvent};
use chrono::Utc;
use drover_core::event::{LoopEvent, LoopEventKind};
use drover_core::issue::Issue;
use drover_core::log::LogKind;
use drover_core::loops::{CompletedBy, Loop, LoopId, LoopStatus};
use drover_core::summary::{SummaryConfig, summarize};
use drover_store::journal::LogJournal;
use drover_store::state::{StateStore, pid_alive};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding `state.json` and `loops/`.
    pub data_root: PathBuf,
    /// Resume summary limits.
    pub summary: SummaryConfig,
    /// Timeout applied to every issue-tracker call.
    pub issue_timeout: Duration,
}

impl EngineConfig {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            summary: SummaryConfig::default(),
            issue_timeout: Duration::from_secs(30),
        }
    }
}

pub struct LoopEngine {
    store: StateStore,
    journal: LogJournal,
    supervisor: ProcessSupervisor,
    adapters: AdapterRegistry,
    issues: Arc<dyn IssueTracker>,
    bus: EventBus,
    /// Serializes every read-modify-write of the state document.
    state_lock: Mutex<()>,
    config: EngineConfig,
}

impl LoopEngine {
    /// Construct the engine and start its dispatcher task.
    pub fn new(
        config: EngineConfig,
        adapters: AdapterRegistry,
        issues: Arc<dyn IssueTracker>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let engine = Arc::new(Self {
            store: StateStore::new(&config.data_root),
            journal: LogJournal::new(&config.data_root),
            supervisor: ProcessSupervisor::new(events_tx),
            adapters,
            issues,
            bus: EventBus::new(),
            state_lock: Mutex::new(()),
            config,
        });

        let dispatcher = Arc::clone(&engine);
        tokio::spawn(async move { dispatcher.dispatch(events_rx).await });

        engine
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoopEvent> {
        self.bus.subscribe()
    }

    pub fn journal(&self) -> &LogJournal {
        &self.journal
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // --- Queries ---

    pub fn get_loop(&self, id: &LoopId) -> EngineResult<Loop> {
        self.store
            .load()?
            .find(id)
            .cloned()
            .ok_or_else(|| EngineError::LoopNotFound(id.to_string()))
    }

    pub fn list_loops(&self) -> EngineResult<Vec<Loop>> {
        Ok(self.store.load()?.loops)
    }

    /// Whether a resume would signal the existing child rather than spawn.
    pub async fn can_resume_in_session(&self, id: &LoopId) -> EngineResult<bool> {
        let lp = self.get_loop(id)?;
        let has_process = self.supervisor.has_process(id).await;
        Ok(matches!(
            resume_mode(&lp, has_process),
            Some(ResumeMode::SameSession)
        ))
    }

    /// Render the cross-session work summary for a loop's journal.
    pub fn summarize_loop(&self, id: &LoopId) -> EngineResult<String> {
        let entries = self.journal.read_all(id)?;
        Ok(summarize(&entries, &self.config.summary))
    }

    // --- Startup ---

    /// Load (and if necessary reset) the state document, sweep orphans,
    /// and push current criteria state back to the tracker. Returns the
    /// orphan count for operator notification.
    pub async fn startup(&self) -> EngineResult<usize> {
        {
            let _guard = self.state_lock.lock().await;
            self.store.load()?;
        }
        let count = self.mark_orphaned_paused_loops().await?;
        self.sync_issue_bodies().await;
        Ok(count)
    }

    /// Flag loops whose child from a prior supervisor run no longer exists.
    pub async fn mark_orphaned_paused_loops(&self) -> EngineResult<usize> {
        let _guard = self.state_lock.lock().await;

        let doc = self.store.load()?;
        let flagged: Vec<LoopId> = doc
            .loops
            .iter()
            .filter(|l| {
                l.status.may_have_process()
                    && !l.paused_from_previous_session
                    && !l.pid.map(pid_alive).unwrap_or(false)
            })
            .map(|l| l.id.clone())
            .collect();

        let count = self.store.mark_orphans(pid_alive)?;
        for id in &flagged {
            self.append_log(
                id,
                LogKind::System,
                "Marked as paused: supervisor restarted while the loop was active",
            );
        }
        if count > 0 {
            self.bus.emit(LoopEventKind::OrphansMarked { count });
        }
        Ok(count)
    }

    // --- Lifecycle commands ---

    /// Create a loop from an issue URL. The issue snapshot (including the
    /// immutable original criteria) is captured now.
    pub async fn create_loop(
        &self,
        issue_url: &str,
        agent: &str,
        repo_root: PathBuf,
        skip_permissions: bool,
    ) -> EngineResult<Loop> {
        self.adapters
            .get(agent)
            .ok_or_else(|| EngineError::UserInput(format!("unknown agent adapter: {agent}")))?;
        if !repo_root.is_absolute() {
            return Err(EngineError::UserInput(format!(
                "repo root must be an absolute path: {}",
                repo_root.display()
            )));
        }
        if !repo_root.is_dir() {
            return Err(EngineError::UserInput(format!(
                "repo root does not exist: {}",
                repo_root.display()
            )));
        }
        self.issues
            .parse_url(issue_url)
            .map_err(|e| EngineError::UserInput(e.to_string()))?;

        let issue = self.with_issue_timeout(self.issues.fetch(issue_url)).await?;

        let mut lp = Loop::new(issue, agent, repo_root);
        lp.skip_permissions = skip_permissions;

        {
            let _guard = self.state_lock.lock().await;
            self.store.insert_loop(lp.clone())?;
        }
        self.append_log(
            &lp.id,
            LogKind::System,
            format!(
                "Loop created for issue #{} ({})",
                lp.issue.number, lp.issue.title
            ),
        );
        self.bus.emit(LoopEventKind::LoopCreated {
            loop_id: lp.id.to_string(),
            issue_title: lp.issue.title.clone(),
        });
        Ok(lp)
    }

    /// Start a queued loop: spawn the agent with the initial prompt.
    pub async fn start_loop(&self, id: &LoopId) -> EngineResult<()> {
        let _guard = self.state_lock.lock().await;

        let lp = self.get_loop(id)?;
        if lp.status != LoopStatus::Queued {
            return Err(EngineError::invalid_transition(lp.status.label(), "start"));
        }

        let adapter = self.adapter_for(&lp)?;
        let prompt = build_initial_prompt(&lp.issue);
        let spec = adapter.build_spawn_args(&prompt, lp.skip_permissions);

        self.spawn_as_running(&lp, adapter, &spec, LoopStatus::Queued)
            .await?;
        self.append_log(id, LogKind::System, "Agent started");
        self.emit_status(id, LoopStatus::Queued, LoopStatus::Running);
        Ok(())
    }

    /// Pause a running loop. Same-session when signals are available and
    /// a child is attached; otherwise degrades to a cross-session pause.
    pub async fn pause_loop(&self, id: &LoopId) -> EngineResult<()> {
        let _guard = self.state_lock.lock().await;

        let lp = self.get_loop(id)?;
        if lp.status != LoopStatus::Running {
            return Err(EngineError::invalid_transition(lp.status.label(), "pause"));
        }

        let has_process = self.supervisor.has_process(id).await;
        if has_process && ProcessSupervisor::supports_signal_pause() {
            self.supervisor.pause(id).await?;
            self.update(id, |l| {
                l.status = LoopStatus::Paused;
                l.paused_at = Some(Utc::now());
            })?;
            self.append_log(id, LogKind::System, "Loop paused");
        } else {
            // No way to freeze the child in place: persist the pause as
            // cross-session, then take the child down.
            self.update(id, |l| {
                l.status = LoopStatus::Paused;
                l.paused_at = Some(Utc::now());
                l.paused_from_previous_session = true;
                l.pid = None;
            })?;
            self.supervisor.terminate(id).await?;
            self.append_log(
                id,
                LogKind::System,
                "Loop paused; the agent will restart on resume",
            );
        }
        self.emit_status(id, LoopStatus::Running, LoopStatus::Paused);
        Ok(())
    }

    /// Resume a paused loop, picking same-session or cross-session
    /// automatically.
    pub async fn resume_loop(&self, id: &LoopId) -> EngineResult<()> {
        let lp = self.get_loop(id)?;
        if lp.status != LoopStatus::Paused {
            return Err(EngineError::invalid_transition(lp.status.label(), "resume"));
        }
        let has_process = self.supervisor.has_process(id).await;
        match resume_mode(&lp, has_process) {
            Some(ResumeMode::SameSession) => {
                let _guard = self.state_lock.lock().await;
                // Re-check under the lock; the dispatcher may have moved us.
                let lp = self.get_loop(id)?;
                if lp.status != LoopStatus::Paused {
                    return Err(EngineError::invalid_transition(lp.status.label(), "resume"));
                }
                self.supervisor.resume(id).await?;
                self.update(id, |l| {
                    l.status = LoopStatus::Running;
                    l.paused_at = None;
                })?;
                self.append_log(id, LogKind::System, "Loop resumed");
                self.emit_status(id, LoopStatus::Paused, LoopStatus::Running);
                Ok(())
            }
            _ => self.resume_paused_loop(id).await,
        }
    }

    /// Cross-session resume: spawn a fresh agent seeded with a summary of
    /// prior work and the criteria still open.
    pub async fn resume_paused_loop(&self, id: &LoopId) -> EngineResult<()> {
        let _guard = self.state_lock.lock().await;

        let lp = self.get_loop(id)?;
        if lp.status != LoopStatus::Paused {
            return Err(EngineError::invalid_transition(lp.status.label(), "resume"));
        }

        let adapter = self.adapter_for(&lp)?;
        let entries = self.journal.read_all(id)?;
        let launch = build_cross_session_launch(
            adapter.as_ref(),
            &lp,
            &entries,
            &self.config.summary,
        );

        self.spawn_as_running(&lp, adapter, &launch.spec, lp.status)
            .await?;
        self.append_log(
            id,
            LogKind::System,
            "Loop resumed with a fresh agent session",
        );
        self.emit_status(id, LoopStatus::Paused, LoopStatus::Running);
        Ok(())
    }

    /// Stop a running or paused loop.
    pub async fn stop_loop(&self, id: &LoopId) -> EngineResult<()> {
        let _guard = self.state_lock.lock().await;

        let lp = self.get_loop(id)?;
        if !matches!(lp.status, LoopStatus::Running | LoopStatus::Paused) {
            return Err(EngineError::invalid_transition(lp.status.label(), "stop"));
        }

        // Persist first so the exit event sees an operator stop.
        self.update(id, |l| {
            l.status = LoopStatus::Stopped;
            l.ended_at = Some(Utc::now());
            l.paused_at = None;
        })?;
        self.supervisor.terminate(id).await?;
        self.append_log(id, LogKind::System, "Loop stopped by operator");
        self.emit_status(id, lp.status, LoopStatus::Stopped);
        Ok(())
    }

    /// Retry a failed or stopped loop with a fresh agent run. The journal
    /// is retained.
    pub async fn retry_loop(&self, id: &LoopId) -> EngineResult<()> {
        let _guard = self.state_lock.lock().await;

        let lp = self.get_loop(id)?;
        if !matches!(lp.status, LoopStatus::Error | LoopStatus::Stopped) {
            return Err(EngineError::invalid_transition(lp.status.label(), "retry"));
        }

        let adapter = self.adapter_for(&lp)?;
        let prompt = build_initial_prompt(&lp.issue);
        let spec = adapter.build_spawn_args(&prompt, lp.skip_permissions);

        self.spawn_as_running(&lp, adapter, &spec, lp.status).await?;
        self.append_log(id, LogKind::System, "Loop retried by operator");
        self.emit_status(id, lp.status, LoopStatus::Running);
        Ok(())
    }

    /// Write an operator message to the agent's stdin.
    pub async fn send_intervention(&self, id: &LoopId, message: &str) -> EngineResult<()> {
        let lp = self.get_loop(id)?;
        if lp.status != LoopStatus::Running {
            return Err(EngineError::invalid_transition(
                lp.status.label(),
                "intervene",
            ));
        }
        self.supervisor.intervene(id, message).await?;
        self.append_log(id, LogKind::Operator, message);
        self.bus.emit(LoopEventKind::InterventionSent {
            loop_id: id.to_string(),
        });
        Ok(())
    }

    /// Operator toggle of a criterion. Allowed in any status and never
    /// auto-completes the loop; only the agent's promise does that.
    pub async fn toggle_criterion(
        &self,
        id: &LoopId,
        index: usize,
        completed: bool,
    ) -> EngineResult<()> {
        {
            let _guard = self.state_lock.lock().await;

            let lp = self.get_loop(id)?;
            if index == 0 || index > lp.issue.acceptance_criteria.len() {
                return Err(EngineError::UserInput(format!(
                    "criterion {index} out of range (1..={})",
                    lp.issue.acceptance_criteria.len()
                )));
            }

            self.update(id, |l| {
                if let Some(criterion) = l.criterion_mut(index) {
                    if completed {
                        criterion.mark_completed(CompletedBy::Operator);
                    } else {
                        criterion.mark_incomplete();
                    }
                }
                let rendered = render_body(&l.issue.body, &l.issue.acceptance_criteria);
                l.issue.body = rendered;
            })?;

            let state = if completed { "complete" } else { "incomplete" };
            self.append_log(
                id,
                LogKind::System,
                format!("Criterion {index} marked {state} by operator"),
            );
            self.bus.emit(LoopEventKind::CriterionUpdated {
                loop_id: id.to_string(),
                index,
                completed,
                by: CompletedBy::Operator,
            });
        }

        // Push the re-rendered body upstream off the lock; failure never
        // blocks the local change.
        self.push_issue_body(id).await;
        Ok(())
    }

    /// Close the upstream issue for a completed loop.
    pub async fn close_issue(
        &self,
        id: &LoopId,
        comment: Option<&str>,
    ) -> EngineResult<CloseOutcome> {
        let lp = self.get_loop(id)?;
        if lp.status != LoopStatus::Completed {
            return Err(EngineError::invalid_transition(
                lp.status.label(),
                "close the issue for",
            ));
        }
        if lp.issue_closed {
            return Ok(CloseOutcome::AlreadyClosed);
        }

        let outcome = self
            .with_issue_timeout(self.issues.close(&lp.issue.url, comment))
            .await?;

        let _guard = self.state_lock.lock().await;
        self.update(id, |l| l.issue_closed = true)?;
        self.append_log(id, LogKind::System, "Issue closed");
        self.bus.emit(LoopEventKind::IssueClosed {
            loop_id: id.to_string(),
            already_closed: outcome == CloseOutcome::AlreadyClosed,
        });
        Ok(outcome)
    }

    /// Discard a loop paused by a previous session: remove it from the
    /// document and delete its journal.
    pub async fn discard_paused_loop(&self, id: &LoopId) -> EngineResult<()> {
        let _guard = self.state_lock.lock().await;

        let lp = self.get_loop(id)?;
        if lp.status != LoopStatus::Paused || !lp.paused_from_previous_session {
            return Err(EngineError::invalid_transition(
                lp.status.label(),
                "discard",
            ));
        }

        self.store.remove_loop(id)?;
        self.journal.remove(id)?;
        self.bus.emit(LoopEventKind::LoopDiscarded {
            loop_id: id.to_string(),
        });
        Ok(())
    }

    // --- Supervisor event dispatch ---

    async fn dispatch(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<SupervisorEvent>) {
        while let Some(event) = rx.recv().await {
            if let Err(e) = self.apply_supervisor_event(event).await {
                tracing::warn!(error = %e, "failed to apply supervisor event");
            }
        }
    }

    async fn apply_supervisor_event(&self, event: SupervisorEvent) -> EngineResult<()> {
        match event {
            SupervisorEvent::Agent { loop_id, event } => match event {
                ParsedEvent::Text(chunk) => {
                    let content = chunk.trim();
                    if !content.is_empty() {
                        self.append_log(&loop_id, LogKind::Agent, content);
                    }
                    Ok(())
                }
                ParsedEvent::CriterionComplete(index) => {
                    self.apply_criterion_event(&loop_id, index, true).await
                }
                ParsedEvent::CriterionIncomplete(index) => {
                    self.apply_criterion_event(&loop_id, index, false).await
                }
                ParsedEvent::TaskComplete => self.apply_task_complete(&loop_id).await,
            },
            SupervisorEvent::SessionDiscovered {
                loop_id,
                session_id,
            } => self.apply_session_id(&loop_id, session_id).await,
            SupervisorEvent::Exited {
                loop_id,
                code,
                was_stopping,
            } => self.apply_exit(&loop_id, code, was_stopping).await,
        }
    }

    async fn apply_criterion_event(
        &self,
        id: &LoopId,
        index: usize,
        completed: bool,
    ) -> EngineResult<()> {
        let mut terminate_child = false;
        {
            let _guard = self.state_lock.lock().await;

            let Ok(lp) = self.get_loop(id) else {
                tracing::warn!(loop_id = %id, "criterion event for unknown loop");
                return Ok(());
            };
            if lp.status != LoopStatus::Running {
                tracing::debug!(
                    loop_id = %id,
                    status = lp.status.label(),
                    "ignoring criterion event outside running"
                );
                return Ok(());
            }
            if index == 0 || index > lp.issue.acceptance_criteria.len() {
                self.append_log(
                    id,
                    LogKind::System,
                    format!("Criterion {index} is out of range, ignoring"),
                );
                return Ok(());
            }

            let mut changed = false;
            let mut all_complete = false;
            self.update(id, |l| {
                if let Some(criterion) = l.criterion_mut(index) {
                    changed = if completed {
                        criterion.mark_completed(CompletedBy::Agent)
                    } else {
                        criterion.mark_incomplete()
                    };
                }
                all_complete = l.all_criteria_complete();
            })?;

            if !changed {
                // Repeated events are no-ops; the original timestamp stands.
                return Ok(());
            }

            let state = if completed { "complete" } else { "incomplete" };
            self.append_log(id, LogKind::System, format!("Criterion {index} {state}"));
            self.bus.emit(LoopEventKind::CriterionUpdated {
                loop_id: id.to_string(),
                index,
                completed,
                by: CompletedBy::Agent,
            });

            if completed && all_complete {
                self.update(id, |l| {
                    l.status = LoopStatus::Completed;
                    l.ended_at = Some(Utc::now());
                })?;
                self.append_log(id, LogKind::System, "All criteria complete");
                self.emit_status(id, LoopStatus::Running, LoopStatus::Completed);
                terminate_child = true;
            }
        }

        if terminate_child {
            self.supervisor.terminate(id).await?;
        }
        Ok(())
    }

    async fn apply_task_complete(&self, id: &LoopId) -> EngineResult<()> {
        {
            let _guard = self.state_lock.lock().await;

            let Ok(lp) = self.get_loop(id) else {
                return Ok(());
            };
            if lp.status != LoopStatus::Running {
                tracing::debug!(loop_id = %id, status = lp.status.label(), "ignoring promise");
                return Ok(());
            }

            self.update(id, |l| {
                l.status = LoopStatus::Completed;
                l.ended_at = Some(Utc::now());
            })?;
            self.append_log(id, LogKind::System, "Agent declared TASK COMPLETE");
            self.emit_status(id, LoopStatus::Running, LoopStatus::Completed);
        }

        // The promise is authoritative; the child has nothing left to do.
        self.supervisor.terminate(id).await
    }

    async fn apply_session_id(&self, id: &LoopId, session_id: String) -> EngineResult<()> {
        let _guard = self.state_lock.lock().await;

        let Ok(lp) = self.get_loop(id) else {
            return Ok(());
        };
        if lp.session_id.is_some() {
            // First occurrence wins.
            return Ok(());
        }

        self.update(id, |l| l.session_id = Some(session_id.clone()))?;
        self.append_log(
            id,
            LogKind::System,
            format!("Captured agent session {session_id}"),
        );
        self.bus.emit(LoopEventKind::SessionCaptured {
            loop_id: id.to_string(),
            session_id,
        });
        Ok(())
    }

    async fn apply_exit(
        &self,
        id: &LoopId,
        code: Option<i32>,
        was_stopping: bool,
    ) -> EngineResult<()> {
        let _guard = self.state_lock.lock().await;

        let Ok(lp) = self.get_loop(id) else {
            return Ok(());
        };

        match lp.status {
            LoopStatus::Completed | LoopStatus::Stopped | LoopStatus::Error => {
                self.update(id, |l| l.pid = None)?;
            }
            LoopStatus::Running if was_stopping => {
                self.update(id, |l| {
                    l.status = LoopStatus::Stopped;
                    l.ended_at = Some(Utc::now());
                    l.pid = None;
                })?;
                self.emit_status(id, LoopStatus::Running, LoopStatus::Stopped);
            }
            LoopStatus::Running if lp.all_criteria_complete() => {
                self.update(id, |l| {
                    l.status = LoopStatus::Completed;
                    l.ended_at = Some(Utc::now());
                    l.pid = None;
                })?;
                self.append_log(id, LogKind::System, "Agent exited with all criteria complete");
                self.emit_status(id, LoopStatus::Running, LoopStatus::Completed);
            }
            LoopStatus::Running => {
                self.update(id, |l| {
                    l.status = LoopStatus::Error;
                    l.error = Some("agent exited".to_string());
                    l.ended_at = Some(Utc::now());
                    l.pid = None;
                })?;
                let detail = match code {
                    Some(c) => format!("Agent exited unexpectedly with code {c}"),
                    None => "Agent exited unexpectedly".to_string(),
                };
                self.append_log(id, LogKind::Error, detail);
                self.emit_status(id, LoopStatus::Running, LoopStatus::Error);
            }
            LoopStatus::Paused => {
                // The frozen child died underneath a same-session pause;
                // only a cross-session resume remains possible.
                self.update(id, |l| {
                    l.paused_from_previous_session = true;
                    l.pid = None;
                })?;
                self.append_log(
                    id,
                    LogKind::System,
                    "Agent exited while paused; resume will start a new session",
                );
            }
            LoopStatus::Queued => {
                self.update(id, |l| l.pid = None)?;
            }
        }
        Ok(())
    }

    // --- Internals ---

    fn adapter_for(&self, lp: &Loop) -> EngineResult<Arc<dyn AgentAdapter>> {
        let adapter = self
            .adapters
            .get(&lp.agent)
            .ok_or_else(|| EngineError::UserInput(format!("unknown agent adapter: {}", lp.agent)))?;
        if !adapter.is_available() {
            return Err(EngineError::ExternalTool(format!(
                "agent '{}' not found on PATH",
                lp.agent
            )));
        }
        Ok(adapter)
    }

    /// Transition to running and spawn, rolling back to `rollback_status`
    /// if the spawn fails. Status is committed before the spawn so no
    /// agent event can outrun it. Caller holds the state lock.
    async fn spawn_as_running(
        &self,
        lp: &Loop,
        adapter: Arc<dyn AgentAdapter>,
        spec: &LaunchSpec,
        rollback_status: LoopStatus,
    ) -> EngineResult<u32> {
        let was_prev_session = lp.paused_from_previous_session;
        self.update(&lp.id, |l| {
            l.status = LoopStatus::Running;
            l.started_at = Some(Utc::now());
            l.ended_at = None;
            l.paused_at = None;
            l.paused_from_previous_session = false;
            l.error = None;
        })?;

        match self
            .supervisor
            .spawn(&lp.id, spec, &lp.repo_root, adapter)
            .await
        {
            Ok(pid) => {
                self.update(&lp.id, |l| l.pid = Some(pid))?;
                Ok(pid)
            }
            Err(e) => {
                self.update(&lp.id, |l| {
                    l.status = rollback_status;
                    l.started_at = lp.started_at;
                    l.ended_at = lp.ended_at;
                    l.paused_at = lp.paused_at;
                    l.paused_from_previous_session = was_prev_session;
                    l.error = lp.error.clone();
                })?;
                Err(e)
            }
        }
    }

    fn update(&self, id: &LoopId, f: impl FnOnce(&mut Loop)) -> EngineResult<()> {
        self.store
            .update_loop(id, f)?
            .ok_or_else(|| EngineError::LoopNotFound(id.to_string()))?;
        Ok(())
    }

    /// Journal append that never fails the calling operation.
    fn append_log(&self, id: &LoopId, kind: LogKind, content: impl Into<String>) {
        match self.journal.append(id, kind, content) {
            Ok(_) => self.bus.emit(LoopEventKind::LogAppended {
                loop_id: id.to_string(),
                kind,
            }),
            Err(e) => tracing::warn!(loop_id = %id, error = %e, "journal append failed"),
        }
    }

    fn emit_status(&self, id: &LoopId, from: LoopStatus, to: LoopStatus) {
        self.bus.emit(LoopEventKind::StatusChanged {
            loop_id: id.to_string(),
            from: from.label().to_string(),
            to: to.label().to_string(),
        });
    }

    async fn with_issue_timeout<T>(
        &self,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> EngineResult<T> {
        match tokio::time::timeout(self.config.issue_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(EngineError::ExternalTool(e.to_string())),
            Err(_) => Err(EngineError::Transient(format!(
                "issue tracker call timed out after {:?}",
                self.config.issue_timeout
            ))),
        }
    }

    /// Best-effort push of the loop's re-rendered body to the tracker.
    async fn push_issue_body(&self, id: &LoopId) {
        let Ok(lp) = self.get_loop(id) else { return };
        let rendered = render_body(&lp.issue.body, &lp.issue.acceptance_criteria);
        if let Err(e) = self
            .with_issue_timeout(self.issues.update_body(&lp.issue.url, &rendered))
            .await
        {
            self.append_log(
                id,
                LogKind::Error,
                format!("Failed to update issue body: {e}"),
            );
        }
    }

    /// Startup-time body re-render for every non-terminal loop.
    async fn sync_issue_bodies(&self) {
        let Ok(loops) = self.list_loops() else { return };
        for lp in loops {
            if lp.status.is_terminal() || lp.issue.acceptance_criteria.is_empty() {
                continue;
            }
            self.push_issue_body(&lp.id).await;
        }
    }
}

/// Initial prompt: the issue, its numbered criteria, and the token
/// protocol the parser recognizes.
pub fn build_initial_prompt(issue: &Issue) -> String {
    let criteria = issue
        .acceptance_criteria
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{}. {}", i + 1, c.text))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Work on the following issue until every acceptance criterion is satisfied.\n\n\
         Issue #{}: {}\n\n{}\n\n\
         Acceptance criteria:\n{criteria}\n\n\
         When you complete criterion N, output <criterion-complete>N</criterion-complete>. \
         If a previously completed criterion regressed, output \
         <criterion-incomplete>N</criterion-incomplete>. \
         When all work is finished, output <promise>TASK COMPLETE</promise>.",
        issue.number, issue.title, issue.body
    )
}

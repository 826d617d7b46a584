//! Shared harness for engine integration tests.
//!
//! Agents are `/bin/sh -c` scripts emitting the token protocol; the
//! adapter records every prompt it builds so tests can assert on resume
//! seeding without spying on a real CLI.

#![allow(dead_code)]

use drover_core::loops::{Loop, LoopId, LoopStatus};
use drover_engine::adapter::{AdapterRegistry, AgentAdapter, LaunchSpec};
use drover_engine::engine::{EngineConfig, LoopEngine};
use drover_engine::issues::MemoryIssueTracker;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const ISSUE_URL: &str = "https://example.test/acme/widgets/issues/7";

pub const TWO_CRITERIA_BODY: &str =
    "Fix the widget.\n\n## Acceptance Criteria\n\n- [ ] A\n- [ ] B\n";

pub const THREE_CRITERIA_BODY: &str =
    "Fix the widget.\n\n## Acceptance Criteria\n\n- [ ] A\n- [ ] B\n- [ ] C\n";

/// Scripted adapter: each spawn consumes the next `/bin/sh -c` script.
/// Prompts and continue-session ids are recorded for assertions.
pub struct ScriptAdapter {
    scripts: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
    continue_sessions: Mutex<Vec<String>>,
}

impl ScriptAdapter {
    pub fn new(scripts: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.iter().map(|s| s.to_string()).collect()),
            prompts: Mutex::new(Vec::new()),
            continue_sessions: Mutex::new(Vec::new()),
        })
    }

    fn next_script(&self) -> String {
        self.scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| "true".to_string())
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn continue_sessions(&self) -> Vec<String> {
        self.continue_sessions.lock().unwrap().clone()
    }
}

impl AgentAdapter for ScriptAdapter {
    fn name(&self) -> &str {
        "script"
    }

    fn build_spawn_args(&self, prompt: &str, _skip_permissions: bool) -> LaunchSpec {
        self.prompts.lock().unwrap().push(prompt.to_string());
        LaunchSpec::new("/bin/sh", vec!["-c".into(), self.next_script()])
    }

    fn build_continue_args(
        &self,
        session_id: &str,
        prompt: &str,
        _skip_permissions: bool,
    ) -> LaunchSpec {
        self.continue_sessions
            .lock()
            .unwrap()
            .push(session_id.to_string());
        self.prompts.lock().unwrap().push(prompt.to_string());
        LaunchSpec::new("/bin/sh", vec!["-c".into(), self.next_script()])
    }

    fn extract_session_id(&self, chunk: &str) -> Option<String> {
        chunk
            .lines()
            .find_map(|line| line.trim().strip_prefix("SESSION_ID:"))
            .map(|rest| rest.trim().to_string())
            .filter(|id| !id.is_empty())
    }

    fn is_available(&self) -> bool {
        true
    }
}

pub struct Harness {
    pub engine: Arc<LoopEngine>,
    pub tracker: Arc<MemoryIssueTracker>,
    pub adapter: Arc<ScriptAdapter>,
    pub repo_root: PathBuf,
    // Held for the lifetime of the test.
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub async fn with_body(scripts: &[&str], body: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = dir.path().join("repo");
        std::fs::create_dir_all(&repo_root).unwrap();

        let tracker = Arc::new(MemoryIssueTracker::new());
        tracker.insert(ISSUE_URL, "Fix the widget", body).await;

        let adapter = ScriptAdapter::new(scripts);
        let mut adapters = AdapterRegistry::new();
        adapters.register(adapter.clone());

        let issues: Arc<dyn drover_engine::issues::IssueTracker> = tracker.clone();
        let engine = LoopEngine::new(EngineConfig::new(dir.path()), adapters, issues);

        Self {
            engine,
            tracker,
            adapter,
            repo_root,
            dir,
        }
    }

    pub async fn new(scripts: &[&str]) -> Self {
        Self::with_body(scripts, TWO_CRITERIA_BODY).await
    }

    pub async fn create(&self) -> Loop {
        self.engine
            .create_loop(ISSUE_URL, "script", self.repo_root.clone(), false)
            .await
            .unwrap()
    }

    pub async fn create_and_start(&self) -> LoopId {
        let lp = self.create().await;
        self.engine.start_loop(&lp.id).await.unwrap();
        lp.id
    }
}

/// Poll until the loop reaches `status` or the deadline passes.
pub async fn wait_for_status(engine: &LoopEngine, id: &LoopId, status: LoopStatus) -> Loop {
    wait_until(engine, id, |l| l.status == status, &format!("status {status}")).await
}

pub async fn wait_until(
    engine: &LoopEngine,
    id: &LoopId,
    pred: impl Fn(&Loop) -> bool,
    what: &str,
) -> Loop {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let lp = engine.get_loop(id).unwrap();
        if pred(&lp) {
            return lp;
        }
        if Instant::now() > deadline {
            panic!(
                "timed out waiting for {what}; loop is {} (error: {:?})",
                lp.status, lp.error
            );
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Poll the journal until `pred` matches some entry.
pub async fn wait_for_log(
    engine: &LoopEngine,
    id: &LoopId,
    pred: impl Fn(&drover_core::log::LogEntry) -> bool,
    what: &str,
) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let entries = engine.journal().read_all(id).unwrap();
        if entries.iter().any(&pred) {
            return;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for log entry: {what}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

//! Agent adapter contract and registry.
//!
//! Adapters translate between the engine's view of a loop (a prompt, a
//! session id, a skip-permissions flag) and a concrete agent CLI's argv.
//! They are pure: no filesystem, no state, no spawning. The supervisor
//! does all of that. Registration is explicit at engine construction;
//! there is no global registry.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;

/// Launch descriptor: argv, never a shell line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub cmd: String,
    pub args: Vec<String>,
}

impl LaunchSpec {
    pub fn new(cmd: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            cmd: cmd.into(),
            args,
        }
    }
}

/// Per-agent strategy for launching, resuming, and recognizing sessions.
pub trait AgentAdapter: Send + Sync {
    /// Registry tag, also stored on the loop.
    fn name(&self) -> &str;

    /// Argv for a fresh run.
    fn build_spawn_args(&self, prompt: &str, skip_permissions: bool) -> LaunchSpec;

    /// Argv for continuing a known agent session.
    fn build_continue_args(
        &self,
        session_id: &str,
        prompt: &str,
        skip_permissions: bool,
    ) -> LaunchSpec;

    /// Scan streamed output for the adapter-specific session-id token.
    fn extract_session_id(&self, chunk: &str) -> Option<String>;

    /// Synthesize the prompt for a cross-session resume. `remaining`
    /// entries arrive pre-numbered with their original 1-based indices.
    fn build_resume_prompt(&self, work_summary: &str, remaining: &[String]) -> String {
        default_resume_prompt(work_summary, remaining)
    }

    /// Probe `$PATH` for the agent binary. Never spawns.
    fn is_available(&self) -> bool;
}

/// Shared resume-prompt shape. Begins with the literal marker the engine's
/// resume machinery (and operators reading logs) look for.
pub fn default_resume_prompt(work_summary: &str, remaining: &[String]) -> String {
    let criteria = if remaining.is_empty() {
        "(none; finish up and declare completion)".to_string()
    } else {
        remaining.join("\n")
    };
    format!(
        "RESUMING FROM PAUSE\n\n\
         You are resuming work on an issue you started in a previous session. \
         The process that ran before is gone; this summary of its journal is \
         everything known about prior progress.\n\n\
         Previous work summary:\n{work_summary}\n\n\
         Remaining acceptance criteria (original numbering):\n{criteria}\n\n\
         Continue the work. When you complete criterion N, output \
         <criterion-complete>N</criterion-complete>. If a previously completed \
         criterion regressed, output <criterion-incomplete>N</criterion-incomplete>. \
         When everything is done, output <promise>TASK COMPLETE</promise>."
    )
}

/// Whether `cmd` resolves to an executable on `$PATH`.
pub fn command_on_path(cmd: impl AsRef<OsStr>) -> bool {
    let cmd = Path::new(cmd.as_ref());
    if cmd.is_absolute() {
        return is_executable(cmd);
    }
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| is_executable(&dir.join(cmd)))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Registry of available adapters.
///
/// Built explicitly during engine construction: adapters are registered
/// in code, not discovered through import side effects.
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn AgentAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: Vec::new(),
        }
    }

    /// Register the built-in adapters.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::adapters::claude::ClaudeAdapter::default()));
        registry.register(Arc::new(crate::adapters::generic::GenericAdapter::codex()));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn AgentAdapter>) {
        self.adapters.push(adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentAdapter>> {
        self.adapters
            .iter()
            .find(|a| a.name() == name)
            .map(Arc::clone)
    }

    pub fn list(&self) -> Vec<&str> {
        self.adapters.iter().map(|a| a.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

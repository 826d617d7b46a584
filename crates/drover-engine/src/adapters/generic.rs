//! Generic CLI agent adapter for tools without a streaming-JSON protocol.
//!
//! Covers agents that take a prompt through argv and write plain text:
//! the prompt slots into `{prompt}` placeholders, and a session marker
//! line (`SESSION_ID: <id>`) is the only structured output recognized.
//! No native resume flag exists, so continuation is just a fresh spawn
//! with the resume prompt and the session id is ignored.

use crate::adapter::{AgentAdapter, LaunchSpec, command_on_path};

pub struct GenericAdapter {
    pub name: String,
    pub command: String,
    /// How to pass the prompt (e.g. `["exec", "{prompt}"]`).
    /// `{prompt}` is replaced with the actual prompt text.
    pub prompt_args: Vec<String>,
    /// Extra flag appended when the operator sets skip-permissions.
    pub skip_permissions_flag: Option<String>,
    /// Line prefix announcing a durable session id.
    pub session_marker: String,
}

impl GenericAdapter {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            prompt_args: vec!["{prompt}".into()],
            skip_permissions_flag: None,
            session_marker: "SESSION_ID:".into(),
        }
    }

    /// The Codex CLI wired as a generic agent.
    pub fn codex() -> Self {
        Self {
            name: "codex".into(),
            command: "codex".into(),
            prompt_args: vec!["exec".into(), "{prompt}".into()],
            skip_permissions_flag: Some("--full-auto".into()),
            session_marker: "SESSION_ID:".into(),
        }
    }

    fn substitute(&self, prompt: &str, skip_permissions: bool) -> LaunchSpec {
        let mut args: Vec<String> = self
            .prompt_args
            .iter()
            .map(|a| a.replace("{prompt}", prompt))
            .collect();
        if skip_permissions {
            if let Some(ref flag) = self.skip_permissions_flag {
                args.push(flag.clone());
            }
        }
        LaunchSpec::new(&self.command, args)
    }
}

impl AgentAdapter for GenericAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn build_spawn_args(&self, prompt: &str, skip_permissions: bool) -> LaunchSpec {
        self.substitute(prompt, skip_permissions)
    }

    fn build_continue_args(
        &self,
        session_id: &str,
        prompt: &str,
        skip_permissions: bool,
    ) -> LaunchSpec {
        tracing::debug!(
            agent = %self.name,
            session_id,
            "generic agent has no native resume, spawning fresh"
        );
        self.substitute(prompt, skip_permissions)
    }

    fn extract_session_id(&self, chunk: &str) -> Option<String> {
        chunk
            .lines()
            .find_map(|line| line.trim().strip_prefix(self.session_marker.as_str()))
            .map(|rest| rest.trim().to_string())
            .filter(|id| !id.is_empty())
    }

    fn is_available(&self) -> bool {
        command_on_path(&self.command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_placeholder_is_substituted() {
        let adapter = GenericAdapter::codex();
        let spec = adapter.build_spawn_args("fix the bug", false);
        assert_eq!(spec.cmd, "codex");
        assert_eq!(spec.args, vec!["exec", "fix the bug"]);
    }

    #[test]
    fn skip_permissions_flag_is_optional() {
        let adapter = GenericAdapter::codex();
        let spec = adapter.build_spawn_args("p", true);
        assert_eq!(spec.args.last().unwrap(), "--full-auto");

        let bare = GenericAdapter::new("other", "other-cli");
        let spec = bare.build_spawn_args("p", true);
        assert_eq!(spec.args, vec!["p"]);
    }

    #[test]
    fn continue_falls_back_to_spawn() {
        let adapter = GenericAdapter::codex();
        let fresh = adapter.build_spawn_args("resume prompt", false);
        let cont = adapter.build_continue_args("ses-9", "resume prompt", false);
        assert_eq!(fresh, cont);
    }

    #[test]
    fn session_marker_line_is_recognized() {
        let adapter = GenericAdapter::codex();
        let chunk = "working...\nSESSION_ID: ses-generic-1\nmore output";
        assert_eq!(
            adapter.extract_session_id(chunk).as_deref(),
            Some("ses-generic-1")
        );
        assert!(adapter.extract_session_id("SESSION_ID:").is_none());
        assert!(adapter.extract_session_id("no marker here").is_none());
    }
}

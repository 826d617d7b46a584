//! Claude Code CLI adapter, the streaming-JSON agent.
//!
//! Launches `claude -p <prompt> --output-format stream-json`. The stream
//! carries a `"session_id"` field in its JSON records; the first one seen
//! becomes the loop's durable session identifier, and continuation runs
//! pass it back via `--resume`.

use crate::adapter::{AgentAdapter, LaunchSpec, command_on_path};

pub struct ClaudeAdapter {
    pub command: String,
}

impl Default for ClaudeAdapter {
    fn default() -> Self {
        Self {
            command: "claude".into(),
        }
    }
}

impl ClaudeAdapter {
    fn base_args(&self, prompt: &str, skip_permissions: bool) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            prompt.to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        if skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }
        args
    }
}

impl AgentAdapter for ClaudeAdapter {
    fn name(&self) -> &str {
        "claude"
    }

    fn build_spawn_args(&self, prompt: &str, skip_permissions: bool) -> LaunchSpec {
        LaunchSpec::new(&self.command, self.base_args(prompt, skip_permissions))
    }

    fn build_continue_args(
        &self,
        session_id: &str,
        prompt: &str,
        skip_permissions: bool,
    ) -> LaunchSpec {
        let mut args = self.base_args(prompt, skip_permissions);
        args.push("--resume".to_string());
        args.push(session_id.to_string());
        LaunchSpec::new(&self.command, args)
    }

    /// Find the first `"session_id":"…"` in the stream-json output.
    fn extract_session_id(&self, chunk: &str) -> Option<String> {
        let key = "\"session_id\"";
        let at = chunk.find(key)?;
        let rest = chunk[at + key.len()..].trim_start();
        let rest = rest.strip_prefix(':')?.trim_start();
        let rest = rest.strip_prefix('"')?;
        let end = rest.find('"')?;
        let id = &rest[..end];
        if id.is_empty() { None } else { Some(id.to_string()) }
    }

    fn is_available(&self) -> bool {
        command_on_path(&self.command)
    }
}

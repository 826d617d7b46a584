//! Process supervisor: spawns and tracks one child agent per loop.
//!
//! Owns the process table, bridges child stdio into the output parser,
//! delivers semantic events to the engine over a channel, and enforces
//! lifecycle signals. It knows nothing about loop state; the engine
//! interprets exits and criterion events.

use crate::adapter::{AgentAdapter, LaunchSpec};
use crate::error::{EngineError, EngineResult};
use crate::parser::{OutputParser, ParsedEvent};
use drover_core::loops::LoopId;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{Mutex, mpsc};

/// How long a terminated child gets to exit before the hard kill.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Cap on the per-stream window scanned for a session identifier.
const SESSION_SCAN_WINDOW: usize = 16 * 1024;

/// Chunk size for stdio reads. Tokens split across reads are handled by
/// the parser's buffer.
const READ_CHUNK: usize = 8 * 1024;

/// Events flowing from the supervisor into the engine dispatcher.
#[derive(Debug)]
pub enum SupervisorEvent {
    /// A semantic event parsed from the child's output.
    Agent {
        loop_id: LoopId,
        event: ParsedEvent,
    },
    /// The adapter recognized a durable session identifier.
    SessionDiscovered {
        loop_id: LoopId,
        session_id: String,
    },
    /// The child exited and was reaped. All of its parsed output has
    /// already been delivered.
    Exited {
        loop_id: LoopId,
        code: Option<i32>,
        was_stopping: bool,
    },
}

struct ProcEntry {
    pid: u32,
    stdin: Option<ChildStdin>,
    stopping: bool,
}

pub struct ProcessSupervisor {
    /// Shared with the wait/grace background tasks.
    procs: Arc<Mutex<HashMap<String, ProcEntry>>>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
}

impl ProcessSupervisor {
    pub fn new(events: mpsc::UnboundedSender<SupervisorEvent>) -> Self {
        Self {
            procs: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Whether this platform can pause/resume a child in place.
    pub fn supports_signal_pause() -> bool {
        cfg!(unix)
    }

    pub async fn has_process(&self, loop_id: &LoopId) -> bool {
        self.procs.lock().await.contains_key(loop_id.as_str())
    }

    pub async fn live_pid(&self, loop_id: &LoopId) -> Option<u32> {
        self.procs
            .lock()
            .await
            .get(loop_id.as_str())
            .map(|e| e.pid)
    }

    pub async fn process_count(&self) -> usize {
        self.procs.lock().await.len()
    }

    /// Spawn the agent child for a loop.
    ///
    /// Argv only, never a shell. Working directory is the loop's repo
    /// root, environment inherited. Refuses a second child per loop.
    pub async fn spawn(
        &self,
        loop_id: &LoopId,
        spec: &LaunchSpec,
        repo_root: &Path,
        adapter: Arc<dyn AgentAdapter>,
    ) -> EngineResult<u32> {
        let mut procs = self.procs.lock().await;
        if procs.contains_key(loop_id.as_str()) {
            return Err(EngineError::AlreadyRunning(loop_id.to_string()));
        }

        let mut child = Command::new(&spec.cmd)
            .args(&spec.args)
            .current_dir(repo_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                EngineError::ExternalTool(format!("failed to spawn {}: {e}", spec.cmd))
            })?;

        let pid = child
            .id()
            .ok_or_else(|| EngineError::ProcessFailure("spawned child has no pid".into()))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        procs.insert(
            loop_id.as_str().to_string(),
            ProcEntry {
                pid,
                stdin,
                stopping: false,
            },
        );
        drop(procs);

        tracing::info!(loop_id = %loop_id, pid, cmd = %spec.cmd, "spawned agent process");

        let stdout_task = stdout.map(|s| {
            tokio::spawn(read_stream(
                s,
                loop_id.clone(),
                Arc::clone(&adapter),
                self.events.clone(),
            ))
        });
        let stderr_task = stderr.map(|s| {
            tokio::spawn(read_stream(
                s,
                loop_id.clone(),
                Arc::clone(&adapter),
                self.events.clone(),
            ))
        });

        let procs = Arc::clone(&self.procs);
        let events = self.events.clone();
        let id = loop_id.clone();
        tokio::spawn(async move {
            // Drain both streams to EOF first so every parsed event is
            // delivered before the exit notification.
            if let Some(task) = stdout_task {
                let _ = task.await;
            }
            if let Some(task) = stderr_task {
                let _ = task.await;
            }
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(loop_id = %id, error = %e, "failed to reap child");
                    None
                }
            };

            let was_stopping = procs
                .lock()
                .await
                .remove(id.as_str())
                .map(|e| e.stopping)
                .unwrap_or(false);

            tracing::info!(loop_id = %id, ?code, was_stopping, "agent process exited");
            let _ = events.send(SupervisorEvent::Exited {
                loop_id: id,
                code,
                was_stopping,
            });
        });

        Ok(pid)
    }

    /// Pause the child in place (same-session pause).
    pub async fn pause(&self, loop_id: &LoopId) -> EngineResult<()> {
        if !Self::supports_signal_pause() {
            return Err(EngineError::Unsupported(
                "stop/continue signals".to_string(),
            ));
        }
        let pid = self.require_pid(loop_id).await?;
        signal_stop(pid).map_err(|e| {
            EngineError::ProcessFailure(format!("failed to stop pid {pid}: {e}"))
        })
    }

    /// Resume a signal-paused child.
    pub async fn resume(&self, loop_id: &LoopId) -> EngineResult<()> {
        if !Self::supports_signal_pause() {
            return Err(EngineError::Unsupported(
                "stop/continue signals".to_string(),
            ));
        }
        let pid = self.require_pid(loop_id).await?;
        signal_continue(pid).map_err(|e| {
            EngineError::ProcessFailure(format!("failed to continue pid {pid}: {e}"))
        })
    }

    /// Terminate the child: graceful signal, then a hard kill after the
    /// grace period. Idempotent; no live process is a no-op.
    pub async fn terminate(&self, loop_id: &LoopId) -> EngineResult<()> {
        let pid = {
            let mut procs = self.procs.lock().await;
            let Some(entry) = procs.get_mut(loop_id.as_str()) else {
                return Ok(());
            };
            entry.stopping = true;
            // Dropping stdin closes the pipe; agents reading interventions
            // see EOF and can wind down on their own.
            entry.stdin = None;
            entry.pid
        };

        terminate_pid(pid);

        let procs = Arc::clone(&self.procs);
        let id = loop_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(STOP_GRACE).await;
            let still_live = procs.lock().await.get(id.as_str()).map(|e| e.pid);
            if let Some(pid) = still_live {
                tracing::warn!(loop_id = %id, pid, "grace period expired, killing");
                kill_pid(pid);
            }
        });

        Ok(())
    }

    /// Write an operator message to the child's stdin, newline-terminated.
    pub async fn intervene(&self, loop_id: &LoopId, message: &str) -> EngineResult<()> {
        let mut procs = self.procs.lock().await;
        let entry = procs.get_mut(loop_id.as_str()).ok_or_else(|| {
            EngineError::ProcessFailure(format!("no live process for loop {loop_id}"))
        })?;
        let stdin = entry.stdin.as_mut().ok_or_else(|| {
            EngineError::ProcessFailure(format!("agent stdin closed for loop {loop_id}"))
        })?;

        let mut payload = message.as_bytes().to_vec();
        payload.push(b'\n');
        stdin
            .write_all(&payload)
            .await
            .map_err(|e| EngineError::ProcessFailure(format!("stdin write failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| EngineError::ProcessFailure(format!("stdin flush failed: {e}")))?;
        Ok(())
    }

    async fn require_pid(&self, loop_id: &LoopId) -> EngineResult<u32> {
        self.live_pid(loop_id).await.ok_or_else(|| {
            EngineError::ProcessFailure(format!("no live process for loop {loop_id}"))
        })
    }
}

/// Read one stdio stream to EOF, feeding the parser and the session scan.
async fn read_stream<R: AsyncRead + Unpin>(
    mut stream: R,
    loop_id: LoopId,
    adapter: Arc<dyn AgentAdapter>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
) {
    let mut parser = OutputParser::new();
    let mut scan = SessionScan::default();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buf[..n]);

                if let Some(session_id) = scan.feed(adapter.as_ref(), &chunk) {
                    let _ = events.send(SupervisorEvent::SessionDiscovered {
                        loop_id: loop_id.clone(),
                        session_id,
                    });
                }
                for event in parser.feed(&chunk) {
                    let _ = events.send(SupervisorEvent::Agent {
                        loop_id: loop_id.clone(),
                        event,
                    });
                }
            }
            Err(e) => {
                tracing::warn!(loop_id = %loop_id, error = %e, "stdio read failed");
                break;
            }
        }
    }

    for event in parser.finish() {
        let _ = events.send(SupervisorEvent::Agent {
            loop_id: loop_id.clone(),
            event,
        });
    }
}

/// Bounded buffer scanned for the adapter's session-id token. Stops
/// scanning after the first hit: the first occurrence wins.
#[derive(Default)]
struct SessionScan {
    window: String,
    done: bool,
}

impl SessionScan {
    fn feed(&mut self, adapter: &dyn AgentAdapter, chunk: &str) -> Option<String> {
        if self.done {
            return None;
        }
        self.window.push_str(chunk);

        if let Some(id) = adapter.extract_session_id(&self.window) {
            self.done = true;
            self.window = String::new();
            return Some(id);
        }

        if self.window.len() > SESSION_SCAN_WINDOW {
            let mut cut = self.window.len() - SESSION_SCAN_WINDOW;
            while !self.window.is_char_boundary(cut) {
                cut += 1;
            }
            self.window.drain(..cut);
        }
        None
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> Result<(), nix::errno::Errno> {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), signal)
}

#[cfg(unix)]
fn signal_stop(pid: u32) -> Result<(), String> {
    send_signal(pid, nix::sys::signal::Signal::SIGSTOP).map_err(|e| e.to_string())
}

#[cfg(unix)]
fn signal_continue(pid: u32) -> Result<(), String> {
    send_signal(pid, nix::sys::signal::Signal::SIGCONT).map_err(|e| e.to_string())
}

#[cfg(unix)]
fn terminate_pid(pid: u32) {
    // A stopped child cannot handle SIGTERM; continue it first.
    let _ = send_signal(pid, nix::sys::signal::Signal::SIGCONT);
    let _ = send_signal(pid, nix::sys::signal::Signal::SIGTERM);
}

#[cfg(unix)]
fn kill_pid(pid: u32) {
    let _ = send_signal(pid, nix::sys::signal::Signal::SIGKILL);
}

#[cfg(not(unix))]
fn signal_stop(_pid: u32) -> Result<(), String> {
    unreachable!("guarded by supports_signal_pause")
}

#[cfg(not(unix))]
fn signal_continue(_pid: u32) -> Result<(), String> {
    unreachable!("guarded by supports_signal_pause")
}

#[cfg(not(unix))]
fn terminate_pid(pid: u32) {
    kill_pid(pid);
}

#[cfg(not(unix))]
fn kill_pid(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .output();
}

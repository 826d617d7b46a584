//! Persistent state document: one JSON file holding every loop.
//!
//! The engine is the sole writer and serializes all mutations through its
//! own lock, so every operation here is a plain read-modify-write of the
//! whole document. A document that fails to parse is replaced with an
//! empty one; the supervisor must come up even if its state was mangled.

use anyhow::{Context, Result};
use chrono::Utc;
use drover_core::loops::{Loop, LoopId, LoopStatus, StateDocument};
use std::fs;
use std::path::{Path, PathBuf};

pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(data_root: &Path) -> Self {
        Self {
            path: crate::state_path(data_root),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document. Missing file yields an empty document; an
    /// unparseable file is reset to empty and written back.
    pub fn load(&self) -> Result<StateDocument> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StateDocument::default());
            }
            Err(e) => {
                return Err(e).context(format!("failed to read {}", self.path.display()));
            }
        };

        match serde_json::from_str(&raw) {
            Ok(doc) => Ok(doc),
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "state document unparseable, resetting to empty"
                );
                let doc = StateDocument::default();
                self.save(&doc)?;
                Ok(doc)
            }
        }
    }

    /// Write the full document.
    pub fn save(&self, doc: &StateDocument) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .context(format!("failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(doc)?;
        fs::write(&self.path, json).context(format!("failed to write {}", self.path.display()))
    }

    /// Append a new loop to the document.
    pub fn insert_loop(&self, lp: Loop) -> Result<StateDocument> {
        let mut doc = self.load()?;
        doc.loops.push(lp);
        self.save(&doc)?;
        Ok(doc)
    }

    /// Apply a mutation to one loop and persist the whole document.
    ///
    /// Returns `None` when the id is unknown; the caller surfaces that.
    pub fn update_loop(
        &self,
        id: &LoopId,
        f: impl FnOnce(&mut Loop),
    ) -> Result<Option<StateDocument>> {
        let mut doc = self.load()?;
        match doc.find_mut(id) {
            Some(lp) => {
                f(lp);
                lp.updated_at = Utc::now();
            }
            None => return Ok(None),
        }
        self.save(&doc)?;
        Ok(Some(doc))
    }

    /// Remove a loop. Returns whether it existed.
    pub fn remove_loop(&self, id: &LoopId) -> Result<bool> {
        let mut doc = self.load()?;
        let before = doc.loops.len();
        doc.loops.retain(|l| &l.id != id);
        let removed = doc.loops.len() != before;
        if removed {
            self.save(&doc)?;
        }
        Ok(removed)
    }

    /// Startup sweep: flag loops whose child from a prior supervisor run is
    /// gone. Every `running` or `paused` loop without a live pid becomes
    /// paused with `paused_from_previous_session` set. Returns how many
    /// loops were flagged, for operator notification.
    pub fn mark_orphans(&self, alive: impl Fn(u32) -> bool) -> Result<usize> {
        let mut doc = self.load()?;
        let mut count = 0;

        for lp in doc.loops.iter_mut() {
            if !lp.status.may_have_process() || lp.paused_from_previous_session {
                continue;
            }
            let process_alive = lp.pid.map(&alive).unwrap_or(false);
            if process_alive {
                continue;
            }
            lp.status = LoopStatus::Paused;
            lp.paused_from_previous_session = true;
            lp.pid = None;
            if lp.paused_at.is_none() {
                lp.paused_at = Some(Utc::now());
            }
            lp.updated_at = Utc::now();
            count += 1;
        }

        if count > 0 {
            self.save(&doc)?;
        }
        Ok(count)
    }
}

/// Probe whether a pid refers to a live process.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // Signal 0: existence check only.
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    // No portable probe; treat every recorded pid as dead so restart
    // always falls back to cross-session resume.
    false
}

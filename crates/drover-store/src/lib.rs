pub mod journal;
pub mod state;

use std::path::{Path, PathBuf};

/// Path of the state document under a data root.
pub fn state_path(data_root: &Path) -> PathBuf {
    data_root.join("state.json")
}

/// Directory holding a single loop's journal.
pub fn loop_dir(data_root: &Path, loop_id: &str) -> PathBuf {
    data_root.join("loops").join(loop_id)
}

/// Path of a single loop's journal file.
pub fn loop_log_path(data_root: &Path, loop_id: &str) -> PathBuf {
    loop_dir(data_root, loop_id).join("log.jsonl")
}

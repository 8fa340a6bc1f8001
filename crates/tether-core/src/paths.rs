use std::path::{Path, PathBuf};

/// Resolve the root directory for persisted run state. Precedence: explicit
/// override (config or CLI) > platform data dir > a dot directory in cwd.
pub fn resolve_state_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    dirs::data_dir()
        .map(|d| d.join("tether"))
        .unwrap_or_else(|| PathBuf::from(".tether"))
}

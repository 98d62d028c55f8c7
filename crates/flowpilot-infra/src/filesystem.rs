//! Data directory layout.

use std::path::{Path, PathBuf};

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `FLOWPILOT_DATA_DIR` environment variable
/// 2. `~/.flowpilot`
/// 3. `./.flowpilot`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FLOWPILOT_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".flowpilot");
    }

    PathBuf::from(".flowpilot")
}

/// `{data_dir}/flowpilot.db`
pub fn database_path(data_dir: &Path) -> PathBuf {
    data_dir.join("flowpilot.db")
}

/// SQLite URL for the database in `data_dir`, created on first connect.
pub fn database_url(data_dir: &Path) -> String {
    format!("sqlite://{}?mode=rwc", database_path(data_dir).display())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_paths() {
        let data_dir = PathBuf::from("/home/user/.flowpilot");
        assert_eq!(
            database_path(&data_dir),
            PathBuf::from("/home/user/.flowpilot/flowpilot.db")
        );
        assert_eq!(
            database_url(&data_dir),
            "sqlite:///home/user/.flowpilot/flowpilot.db?mode=rwc"
        );
    }

    #[test]
    fn resolve_data_dir_from_env() {
        // SAFETY: This test is single-threaded and restores the env var immediately.
        unsafe {
            std::env::set_var("FLOWPILOT_DATA_DIR", "/tmp/test-flowpilot");
        }
        let dir = resolve_data_dir();
        assert_eq!(dir, PathBuf::from("/tmp/test-flowpilot"));
        unsafe {
            std::env::remove_var("FLOWPILOT_DATA_DIR");
        }
    }
}

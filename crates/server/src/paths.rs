//! Central path resolution for all Pairline data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `PAIRLINE_DATA_DIR` env > `~/.pairline`.
//! Everything the server writes lives under this one directory.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

fn resolve(explicit: Option<&Path>, env_value: Option<String>, home: Option<PathBuf>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| env_value.filter(|v| !v.trim().is_empty()).map(PathBuf::from))
        .or_else(|| home.map(|h| h.join(".pairline")))
        .unwrap_or_else(|| PathBuf::from(".pairline"))
}

/// Initialize the global data directory. Returns the resolved path.
///
/// Without a home directory the data dir is relative to the working directory.
pub fn init_data_dir(explicit: Option<&Path>) -> PathBuf {
    let dir = resolve(
        explicit,
        std::env::var("PAIRLINE_DATA_DIR").ok(),
        dirs::home_dir(),
    );
    let mut guard = DATA_DIR.write().unwrap_or_else(|e| e.into_inner());
    *guard = Some(dir.clone());
    dir
}

/// Return the current data directory. Panics if `init_data_dir` hasn't been called.
pub fn data_dir() -> PathBuf {
    DATA_DIR
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
        .expect("data_dir() called before init_data_dir()")
}

pub fn db_path() -> PathBuf {
    data_dir().join("pairline.db")
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Last good gateway credentials, used when the config store is unreadable.
pub fn gateway_cache_path() -> PathBuf {
    data_dir().join("gateway-cache.json")
}

pub fn pid_file_path() -> PathBuf {
    data_dir().join("pairline.pid")
}

pub fn token_file_path() -> PathBuf {
    data_dir().join("auth-token")
}

pub fn ensure_dirs() -> io::Result<()> {
    std::fs::create_dir_all(log_dir())
}

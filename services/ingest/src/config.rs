use std::path::PathBuf;

use crate::error::{PipelineError, Result};

/// Runtime settings read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_url: Option<String>,
    pub db_max_connections: u32,
    pub raw_fs_dir: PathBuf,
    pub upsert_chunk_size: usize,
    pub error_flush_threshold: usize,
    pub raw_table_max_bytes: usize,
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_url: None,
            db_max_connections: 5,
            raw_fs_dir: PathBuf::from("./data/raw"),
            upsert_chunk_size: 500,
            error_flush_threshold: 200,
            raw_table_max_bytes: 10 * 1024 * 1024,
            log_dir: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            db_url: std::env::var("DB_URL").ok().filter(|v| !v.trim().is_empty()),
            db_max_connections: env_or("DB_MAX_CONNECTIONS", defaults.db_max_connections),
            raw_fs_dir: PathBuf::from(
                std::env::var("RAW_FS_DIR").unwrap_or_else(|_| "./data/raw".to_string()),
            ),
            upsert_chunk_size: env_or("UPSERT_CHUNK_SIZE", defaults.upsert_chunk_size).max(1),
            error_flush_threshold: env_or("ERROR_FLUSH_THRESHOLD", defaults.error_flush_threshold)
                .max(1),
            raw_table_max_bytes: env_or("RAW_TABLE_MAX_BYTES", defaults.raw_table_max_bytes),
            log_dir: std::env::var("LOG_DIR").ok().map(PathBuf::from),
        }
    }

    pub fn require_db_url(&self) -> Result<&str> {
        self.db_url
            .as_deref()
            .ok_or_else(|| PipelineError::config("DB_URL env var missing"))
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

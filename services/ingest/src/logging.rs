use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the global subscriber: console output always, JSON files when
/// `log_dir` is given and can be created. The returned guard must outlive
/// the process' logging.
pub fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ingest=info"));

    match log_dir.filter(|dir| ensure_log_dir(dir)) {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "ingest.log");
            let (writer, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = fmt::layer().json().with_writer(writer);
            let console_layer = fmt::layer().with_writer(std::io::stdout);
            tracing_subscriber::registry()
                .with(filter)
                .with(file_layer)
                .with(console_layer)
                .init();
            Some(guard)
        }
        None => {
            let console_layer = fmt::layer().with_writer(std::io::stdout);
            tracing_subscriber::registry()
                .with(filter)
                .with(console_layer)
                .init();
            None
        }
    }
}

/// The subscriber is not up yet, so a failure goes to stderr and file
/// logging is skipped.
fn ensure_log_dir(dir: &Path) -> bool {
    match std::fs::create_dir_all(dir) {
        Ok(()) => true,
        Err(e) => {
            eprintln!(
                "cannot create log directory {}: {}; logging to console only",
                dir.display(),
                e
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_log_dir_creates_nested_dirs() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("a").join("b");
        assert!(ensure_log_dir(&dir));
        assert!(dir.is_dir());
    }

    #[test]
    fn test_ensure_log_dir_reports_failure() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let under_file = file.path().join("logs");
        assert!(!ensure_log_dir(&under_file));
    }
}

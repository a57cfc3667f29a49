use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::error::MeshError;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,hive_mesh=debug";

fn env_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Install a compact console subscriber. `RUST_LOG` overrides `filter`.
/// Returns `false` if a global subscriber was already installed.
pub fn init_logging(filter: &str) -> bool {
    tracing_subscriber::registry()
        .with(env_filter(filter))
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .compact(),
        )
        .try_init()
        .is_ok()
}

/// Log to the console and to a daily-rotated file under `logs_dir`.
/// The returned guard flushes the file writer when dropped.
pub fn init_logging_to_dir(logs_dir: &Path, filter: &str) -> Result<WorkerGuard, MeshError> {
    std::fs::create_dir_all(logs_dir)?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, "hive-mesh");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(env_filter(filter))
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .compact(),
        )
        .try_init()
        .map_err(|e| MeshError::InvalidConfig(format!("Failed to initialize logging: {e}")))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_to_dir_creates_directory() {
        let tmp = tempfile::tempdir().expect("Failed to create tempdir");
        let logs_dir = tmp.path().join("nested").join("logs");
        assert!(!logs_dir.exists());

        // Only one global subscriber per process; another test may win.
        let result = init_logging_to_dir(&logs_dir, "warn");
        assert!(logs_dir.exists());
        if let Err(e) = result {
            assert!(e.to_string().contains("logging"), "unexpected error: {e}");
        }
    }

    #[test]
    fn test_second_init_reports_already_installed() {
        init_logging("warn");
        assert!(!init_logging("debug"));
    }

    #[test]
    fn test_env_filter_fallback() {
        for f in ["info", DEFAULT_FILTER, "hive_mesh=trace,warn"] {
            drop(env_filter(f));
        }
    }
}

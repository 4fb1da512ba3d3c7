//! provides logging helpers

use std::env;
use std::path::Path;
use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::InitError;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Directory that receives the rolling log files when set.
pub const LOG_PATH_ENV_VAR: &str = "LOG_PATH";

const LOG_FILE_PREFIX: &str = "pool-coordinator.log";
const MAX_LOG_FILES: usize = 7;

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("log path `{0}` exists and is not a directory")]
    NotADirectory(PathBuf),

    #[error("failed to create rolling file appender in `{path}`")]
    Appender {
        path: PathBuf,
        #[source]
        source: InitError,
    },
}

/// Resolves the log directory from an explicit value or `LOG_PATH`.
pub fn log_dir(explicit: Option<PathBuf>) -> Option<PathBuf> {
    explicit.or_else(|| env::var_os(LOG_PATH_ENV_VAR).map(PathBuf::from))
}

/// Builds the daily rolling appender used for file output.
pub fn rolling_appender(dir: &Path) -> Result<RollingFileAppender, LoggingError> {
    if dir.exists() && !dir.is_dir() {
        return Err(LoggingError::NotADirectory(dir.to_path_buf()));
    }

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .max_log_files(MAX_LOG_FILES)
        .build(dir)
        .map_err(|source| LoggingError::Appender {
            path: dir.to_path_buf(),
            source,
        })
}

/// initiate the global tracing subscriber
///
/// Events go to stderr and, when a log directory is given, to a daily rolling
/// file as well. The returned guard must be held for as long as file output
/// is wanted; dropping it flushes and stops the background writer.
pub fn init(log_dir: Option<PathBuf>) -> Result<Option<WorkerGuard>, LoggingError> {
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();

    let stderr_layer = layer().with_writer(std::io::stderr).with_target(true);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = rolling_appender(&dir)?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            (Some(file_layer), Some(guard))
        }
        None => (None, None),
    };

    registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_log_dir_wins_over_env() {
        let explicit = PathBuf::from("/var/log/coordinator");
        assert_eq!(log_dir(Some(explicit.clone())), Some(explicit));
    }

    #[test]
    fn rolling_appender_accepts_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(rolling_appender(dir.path()).is_ok());
    }

    #[test]
    fn rolling_appender_rejects_regular_file() {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        let err = rolling_appender(file.path()).expect_err("file is not a directory");
        assert!(matches!(err, LoggingError::NotADirectory(path) if path == file.path()));
    }
}

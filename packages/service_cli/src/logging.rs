use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "SERVICE_HOST_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget<'a> {
    Stderr,
    File(&'a str),
}

/// Installs the global subscriber. The returned guard flushes the file writer
/// and must be kept alive until the process exits.
pub fn init(level: &str, target: LogTarget) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(level));

    match target {
        LogTarget::Stderr => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init();
            None
        }
        LogTarget::File(path) => {
            let path = Path::new(path);
            let dir = match path.parent() {
                Some(dir) if !dir.as_os_str().is_empty() => dir,
                _ => Path::new("."),
            };
            let file = path.file_name().unwrap_or_else(|| "service-host.log".as_ref());

            let _ = std::fs::create_dir_all(dir);
            let write_path = tracing_appender::rolling::never(dir, file);

            let (non_blocking, guard) = tracing_appender::non_blocking(write_path);
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(non_blocking)
                .try_init();
            Some(guard)
        }
    }
}

// SPDX-License-Identifier: GPL-3.0-only

use std::ffi::OsString;
use std::fs;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingLevel;

/// Default filter when `RUST_LOG` is not set.
pub(crate) fn default_directives(level: LoggingLevel) -> String {
    format!("devnotifier={},warn", level.as_directive())
}

/// Log to stderr and, when `log_file` is set, to that file as well.
///
/// The returned guard flushes the file writer and must be held until exit.
pub(crate) fn init(level: LoggingLevel, log_file: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);

    let Some(path) = log_file else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
        return None;
    };

    match file_writer(path) {
        Ok((writer, guard)) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        Err(e) => {
            eprintln!("devnotifier: failed to initialize file logging: {e:#}");
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .init();
            None
        }
    }
}

fn file_writer(
    path: &Path,
) -> anyhow::Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(OsString::from)
        .ok_or_else(|| anyhow::anyhow!("log file path has no file name: {}", path.display()))?;

    fs::create_dir_all(dir)
        .map_err(|e| anyhow::anyhow!("create log directory failed: {} ({})", dir.display(), e))?;

    let appender = tracing_appender::rolling::never(dir, file_name);
    Ok(tracing_appender::non_blocking(appender))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directives_follow_level() {
        assert_eq!(default_directives(LoggingLevel::Info), "devnotifier=info,warn");
        assert_eq!(default_directives(LoggingLevel::Trace), "devnotifier=trace,warn");
    }

    #[test]
    fn default_directives_parse() {
        assert!(EnvFilter::try_new(default_directives(LoggingLevel::Debug)).is_ok());
    }
}

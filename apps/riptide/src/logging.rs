use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Overrides the level-derived filter with a full `EnvFilter` directive.
/// `RUST_LOG` is consulted when this is unset.
pub const LOG_FILTER_ENV: &str = "RIPTIDE_LOG_FILTER";

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config.level))
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_ids(config.level >= LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;

    let _ = GUARD.set(guard);
    Ok(())
}

fn env_filter(level: LogLevel) -> EnvFilter {
    match std::env::var(LOG_FILTER_ENV).or_else(|_| std::env::var(EnvFilter::DEFAULT_ENV)) {
        Ok(filter) => EnvFilter::new(filter),
        Err(_) => EnvFilter::new(default_filter_for(level.to_filter())),
    }
}

/// Our crates at the requested level; the WebRTC stack stays at info unless
/// asked for explicitly.
fn default_filter_for(level: LevelFilter) -> String {
    match level {
        LevelFilter::TRACE | LevelFilter::DEBUG => {
            let level = level.to_string().to_lowercase();
            ["riptide_core", "riptide", "transport_signaling", "transport_webrtc"]
                .iter()
                .fold("info".to_string(), |filter, target| {
                    format!("{filter},{target}={level}")
                })
        }
        other => other.to_string().to_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_only_raises_our_crates() {
        let filter = default_filter_for(LevelFilter::DEBUG);
        assert!(filter.starts_with("info,"));
        assert!(filter.contains("transport_webrtc=debug"));
        assert!(filter.contains("riptide_core=debug"));
        assert!(!filter.contains("webrtc_ice"));
    }

    #[test]
    fn quiet_levels_apply_everywhere() {
        assert_eq!(default_filter_for(LevelFilter::WARN), "warn");
        assert_eq!(default_filter_for(LevelFilter::INFO), "info");
    }

    #[test]
    fn levels_are_ordered_by_verbosity() {
        assert!(LogLevel::Trace > LogLevel::Debug);
        assert_eq!(LogLevel::default(), LogLevel::Info);
        assert_eq!(LogLevel::Warn.to_filter(), LevelFilter::WARN);
    }
}

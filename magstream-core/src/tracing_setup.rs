//! Logging for streaming sessions
//!
//! The console shows the level picked on the command line while a debug log
//! on disk keeps everything from the last run. Each request runs inside a
//! span carrying its id, so transcoder and prober diagnostics interleaved
//! across concurrent requests can be told apart afterwards.

use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

use tracing::{Level, Span};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};
use uuid::Uuid;

/// Name of the per-run debug log inside the logs directory.
pub const LOG_FILE_NAME: &str = "magstream-last-run.log";

/// Dependency targets capped on the console, with the most verbose level shown.
const CONSOLE_CAPS: &[(&str, Level)] = &[
    ("librqbit", Level::INFO),
    ("librqbit_dht", Level::WARN),
    ("hyper", Level::WARN),
    ("tower_http", Level::DEBUG),
];

/// The BitTorrent session traces every peer message; keep the file readable.
const FILE_CAPS: &[(&str, Level)] = &[("librqbit", Level::DEBUG), ("librqbit_dht", Level::INFO)];

/// Builds filter directives for `level`, capping the given targets.
///
/// Caps only apply when they are quieter than `level`.
pub fn filter_directives(level: Level, caps: &[(&str, Level)]) -> String {
    let mut directives = level.to_string().to_lowercase();
    for (target, cap) in caps {
        if level > *cap {
            directives.push_str(&format!(",{}={}", target, cap.to_string().to_lowercase()));
        }
    }
    directives
}

/// Span wrapping everything logged for one streaming request.
pub fn request_span(request_id: Uuid, source: &str) -> Span {
    tracing::info_span!("request", id = %request_id, source = %source)
}

/// Initializes console and file logging.
///
/// `RUST_LOG` overrides the console filter. The file at
/// `<logs_dir>/magstream-last-run.log` (default `./logs`) is truncated and
/// records debug output plus the duration of every request span.
/// Returns the path of the log file.
///
/// # Errors
///
/// - `std::io::Error` - If logs directory cannot be created or log file cannot be opened for writing
pub fn init_tracing(console_level: Level, logs_dir: Option<&Path>) -> Result<PathBuf, std::io::Error> {
    let logs_path = logs_dir.unwrap_or_else(|| Path::new("logs"));
    create_dir_all(logs_path)?;

    let log_file_path = logs_path.join(LOG_FILE_NAME);
    let log_file = File::create(&log_file_path)?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(console_level, CONSOLE_CAPS)));

    let console_layer = fmt::layer()
        .compact()
        .with_target(console_level >= Level::DEBUG)
        .with_filter(console_filter);

    let file_layer = fmt::layer()
        .with_thread_names(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(log_file)
        .with_filter(EnvFilter::new(filter_directives(Level::TRACE, FILE_CAPS)));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    tracing::debug!(
        "Logging to console at {} and to {}",
        console_level,
        log_file_path.display()
    );

    Ok(log_file_path)
}

/// CLI log levels for user control
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    /// Only error messages
    Error,
    /// Warning and error messages
    Warn,
    /// Informational, warning, and error messages
    Info,
    /// Debug, informational, warning, and error messages
    Debug,
    /// All messages including detailed tracing
    Trace,
}

impl CliLogLevel {
    /// Converts CLI log level to tracing Level enum.
    ///
    /// # Examples
    /// ```
    /// use magstream_core::tracing_setup::CliLogLevel;
    ///
    /// let level = CliLogLevel::Info.as_tracing_level();
    /// assert_eq!(level, tracing::Level::INFO);
    /// ```
    pub fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

impl std::str::FromStr for CliLogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(CliLogLevel::Error),
            "warn" => Ok(CliLogLevel::Warn),
            "info" => Ok(CliLogLevel::Info),
            "debug" => Ok(CliLogLevel::Debug),
            "trace" => Ok(CliLogLevel::Trace),
            _ => Err(format!("Invalid log level: {s}")),
        }
    }
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliLogLevel::Error => write!(f, "error"),
            CliLogLevel::Warn => write!(f, "warn"),
            CliLogLevel::Info => write!(f, "info"),
            CliLogLevel::Debug => write!(f, "debug"),
            CliLogLevel::Trace => write!(f, "trace"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing_is_case_insensitive() {
        assert_eq!("WARN".parse::<CliLogLevel>(), Ok(CliLogLevel::Warn));
        assert_eq!("trace".parse::<CliLogLevel>(), Ok(CliLogLevel::Trace));
    }

    #[test]
    fn test_console_caps_only_quiet_verbose_levels() {
        assert_eq!(
            filter_directives(Level::DEBUG, CONSOLE_CAPS),
            "debug,librqbit=info,librqbit_dht=warn,hyper=warn"
        );
        assert_eq!(filter_directives(Level::WARN, CONSOLE_CAPS), "warn");
        assert_eq!(
            filter_directives(Level::TRACE, FILE_CAPS),
            "trace,librqbit=debug,librqbit_dht=info"
        );
    }

    #[test]
    fn test_log_level_rejects_unknown() {
        assert!("verbose".parse::<CliLogLevel>().is_err());
        assert_eq!(CliLogLevel::Debug.as_tracing_level(), Level::DEBUG);
    }
}

//! Unified logging infrastructure for evq.
//!
//! Provides consistent logging configuration for the job driver and the
//! worker subprocesses. Workers log into their own per-rank file so a
//! misbehaving worker can be inspected in isolation.
//!
//! # Environment Variables
//!
//! - `EVQ_LOG` - Log filter (overrides RUST_LOG)
//! - `EVQ_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `EVQ_LOG_FORMAT` - Output format: pretty, compact, json
//! - `RUST_LOG` - Standard Rust log filter (fallback)

use std::path::PathBuf;
use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{
    EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable pretty format (default for development)
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for log aggregation systems
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

/// Logging configuration.
///
/// Use the builder methods to customize, then pass to [`init`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: INFO)
    pub level: Level,
    /// Log format (default: Pretty)
    pub format: LogFormat,
    /// Path to log file (None = stderr only)
    pub file_path: Option<PathBuf>,
    /// Custom filter string (overrides level if set)
    pub filter: Option<String>,
    /// Show target module in logs (default: true)
    pub show_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            file_path: None,
            filter: None,
            show_target: true,
        }
    }
}

impl LogConfig {
    /// Create a new LogConfig with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the log level.
    #[allow(dead_code)] // Embedders configure levels directly; the CLI uses filters
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Set the log format.
    #[allow(dead_code)] // Format normally comes from EVQ_LOG_FORMAT
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the log file path.
    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    /// Set a custom filter string.
    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Apply environment variable overrides.
    ///
    /// CLI arguments take precedence over environment variables. If a filter
    /// is already set (e.g., from -v), env vars won't override it.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var("EVQ_LOG") {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }

        if self.filter.is_none() {
            if let Ok(level_str) = std::env::var("EVQ_LOG_LEVEL") {
                self.level = parse_level(&level_str).unwrap_or(self.level);
            }
        }

        if let Ok(format) = std::env::var("EVQ_LOG_FORMAT") {
            if let Ok(f) = format.parse() {
                self.format = f;
            }
        }

        self
    }

    /// Build the EnvFilter for this configuration.
    fn build_filter(&self) -> EnvFilter {
        if let Some(ref filter) = self.filter {
            EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                EnvFilter::new(format!("{}", self.level).to_lowercase())
            })
        } else {
            EnvFilter::new(format!("{}", self.level).to_lowercase())
        }
    }
}

/// Parse a log level string.
fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Initialize the global tracing subscriber.
///
/// This should be called once at program startup. Subsequent calls are
/// silently ignored. Logs go to stderr, plus the configured file if
/// `file_path` is set (the worker subprocess sets it to its per-rank log).
pub fn init(config: LogConfig) {
    let filter = config.build_filter();

    let file_appender = config.file_path.as_ref().map(|path| {
        let parent = path.parent().unwrap_or(std::path::Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(crate::paths::WORKER_LOG_FILENAME);
        tracing_appender::rolling::never(parent, file_name)
    });

    // Each format needs its own layer type, so the match is spelled out.
    let result = match (config.format, file_appender) {
        (LogFormat::Json, Some(appender)) => {
            let stderr_layer = fmt::layer()
                .json()
                .with_target(config.show_target)
                .with_writer(std::io::stderr);
            let file_layer = fmt::layer()
                .json()
                .with_target(config.show_target)
                .with_ansi(false)
                .with_writer(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .try_init()
        }
        (LogFormat::Json, None) => {
            let layer = fmt::layer()
                .json()
                .with_target(config.show_target)
                .with_writer(std::io::stderr);
            tracing_subscriber::registry().with(filter).with(layer).try_init()
        }
        (LogFormat::Compact, Some(appender)) => {
            let stderr_layer = fmt::layer()
                .compact()
                .with_target(config.show_target)
                .with_writer(std::io::stderr);
            let file_layer = fmt::layer()
                .compact()
                .with_target(config.show_target)
                .with_ansi(false)
                .with_writer(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .try_init()
        }
        (LogFormat::Compact, None) => {
            let layer = fmt::layer()
                .compact()
                .with_target(config.show_target)
                .with_writer(std::io::stderr);
            tracing_subscriber::registry().with(filter).with(layer).try_init()
        }
        (LogFormat::Pretty, Some(appender)) => {
            let stderr_layer = fmt::layer()
                .with_target(config.show_target)
                .with_writer(std::io::stderr);
            let file_layer = fmt::layer()
                .with_target(config.show_target)
                .with_ansi(false)
                .with_writer(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .try_init()
        }
        (LogFormat::Pretty, None) => {
            let layer = fmt::layer()
                .with_target(config.show_target)
                .with_writer(std::io::stderr);
            tracing_subscriber::registry().with(filter).with(layer).try_init()
        }
    };

    // Silently ignore if already initialized (idempotent)
    let _ = result;
}

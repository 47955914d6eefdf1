//! Structured logging facade.
//!
//! Thin wrapper over `tracing-subscriber` so applications embedding the
//! connectivity core get consistent structured output without wiring the
//! subscriber themselves. Supports env-filter overrides via `RUST_LOG`.

use tracing::Level;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Most detailed debugging information.
    Trace,
    /// Detailed debugging information.
    Debug,
    /// Important business events.
    Info,
    /// Potential issues.
    Warn,
    /// Error information.
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable formatted output.
    Pretty,
    /// Compact single-line format.
    Compact,
    /// JSON format for production environments.
    Json,
}

/// Log configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level.
    pub level: LogLevel,
    /// Log format.
    pub format: LogFormat,
    /// Whether to show thread IDs.
    pub show_thread_ids: bool,
    /// Whether to show the target module.
    pub show_target: bool,
    /// Whether to show span events (function enter/exit).
    pub show_span_events: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
            show_thread_ids: false,
            show_target: true,
            show_span_events: false,
        }
    }
}

impl LogConfig {
    /// Configuration for development environments.
    pub fn development() -> Self {
        Self {
            level: LogLevel::Debug,
            format: LogFormat::Pretty,
            show_span_events: true,
            ..Self::default()
        }
    }

    /// Configuration for production environments.
    pub fn production() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Json,
            show_thread_ids: true,
            ..Self::default()
        }
    }

    /// Configuration for test environments.
    pub fn test() -> Self {
        Self {
            level: LogLevel::Warn,
            format: LogFormat::Compact,
            show_target: false,
            ..Self::default()
        }
    }
}

/// Initializes the logging system.
///
/// Panics if a global subscriber is already installed; use
/// [`try_init_logging`] in tests.
pub fn init_logging(config: &LogConfig) {
    install(config, false);
}

/// Attempts to initialize the logging system, ignoring duplicate
/// initialization. Suitable for test environments.
pub fn try_init_logging(config: &LogConfig) {
    install(config, true);
}

fn install(config: &LogConfig, lenient: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("emberlink={}", config.level)));

    let span_events = if config.show_span_events {
        FmtSpan::ENTER | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    macro_rules! build_and_init {
        ($layer:expr) => {{
            let fmt_layer = $layer
                .with_thread_ids(config.show_thread_ids)
                .with_target(config.show_target)
                .with_span_events(span_events)
                .with_filter(env_filter);
            let registry = tracing_subscriber::registry().with(fmt_layer);
            if lenient {
                let _ = registry.try_init();
            } else {
                registry.init();
            }
        }};
    }

    match config.format {
        LogFormat::Pretty => build_and_init!(fmt::layer().pretty()),
        LogFormat::Compact => build_and_init!(fmt::layer().compact()),
        LogFormat::Json => build_and_init!(fmt::layer().json()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(Level::from(LogLevel::Trace), Level::TRACE);
        assert_eq!(Level::from(LogLevel::Error), Level::ERROR);
    }

    #[test]
    fn test_log_config_profiles() {
        assert_eq!(LogConfig::development().level, LogLevel::Debug);
        assert_eq!(LogConfig::production().format, LogFormat::Json);
        assert_eq!(LogConfig::test().format, LogFormat::Compact);
    }

    #[test]
    fn test_try_init_logging_is_idempotent() {
        try_init_logging(&LogConfig::test());
        try_init_logging(&LogConfig::test());
    }
}

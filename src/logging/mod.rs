//! Logging infrastructure - structured tracing for the controller side
//!
//! Design: Uses `tracing` for structured, contextual logging with:
//! - Configurable level through `TYPTHON_LOG_*` or `RUST_LOG`
//! - Zero-cost when disabled
//! - Console or file output, human-readable or JSON
//!
//! Events are emitted only by threads that own their TLS (the caller of
//! `Thread` methods). Code reachable from a spawned Linux runtime thread
//! never logs: the dispatcher lives in thread-local storage.

use once_cell::sync::OnceCell;
use std::io;
use std::path::Path;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Global logging state
static LOGGER_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Keeps the non-blocking file writer flushing for the life of the process
static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default log level
    pub level: Level,
    /// Enable file logging
    pub file_output: bool,
    /// Log file path (if file_output enabled)
    pub log_path: Option<String>,
    /// Enable JSON format (vs human-readable)
    pub json_format: bool,
    /// Show span events (enter/exit)
    pub show_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            file_output: false,
            log_path: None,
            json_format: false,
            show_spans: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // TYPTHON_LOG_LEVEL: trace, debug, info, warn, error
        if let Ok(level_str) = std::env::var("TYPTHON_LOG_LEVEL") {
            config.level = parse_level(&level_str);
        }

        // TYPTHON_LOG_FILE: path to log file
        if let Ok(path) = std::env::var("TYPTHON_LOG_FILE") {
            config.file_output = true;
            config.log_path = Some(path);
        }

        config.json_format = std::env::var("TYPTHON_LOG_JSON").is_ok();
        config.show_spans = std::env::var("TYPTHON_LOG_SPANS").is_ok();

        config
    }

    /// Create high-performance config (errors only)
    pub fn performance() -> Self {
        Self {
            level: Level::ERROR,
            ..Self::default()
        }
    }

    /// Create debug config (verbose logging to a file)
    pub fn debug() -> Self {
        Self {
            level: Level::TRACE,
            file_output: true,
            log_path: Some("typthon_threads.log".to_string()),
            json_format: false,
            show_spans: true,
        }
    }
}

fn parse_level(s: &str) -> Level {
    match s.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize logging with configuration from the environment
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with custom configuration
///
/// Only the first call installs a subscriber. An already installed global
/// subscriber (from the host application) is left in place.
pub fn init_with_config(config: LogConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("typthon_threads={}", config.level.as_str().to_lowercase()))
        });

        let span_events = if config.show_spans {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let writer = match config.log_path.as_deref().filter(|_| config.file_output) {
            Some(path) => file_writer(Path::new(path)),
            None => BoxMakeWriter::new(io::stdout),
        };

        let (json, text) = if config.json_format {
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_span_events(span_events)
                .with_target(true);
            (Some(layer), None)
        } else {
            let layer = fmt::layer()
                .with_writer(writer)
                .with_span_events(span_events)
                .with_target(true)
                .with_thread_ids(cfg!(debug_assertions))
                .with_line_number(cfg!(debug_assertions));
            (None, Some(layer))
        };

        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(json)
            .with(text)
            .try_init();
    });
}

fn file_writer(path: &Path) -> BoxMakeWriter {
    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "typthon_threads.log".into());

    let appender = tracing_appender::rolling::never(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = FILE_GUARD.set(guard);
    BoxMakeWriter::new(writer)
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.get().is_some()
}

// ============================================================================
// Thread lifecycle logging
// ============================================================================

/// Log a successful create
pub fn log_thread_create(stack_size: usize, storage_size: usize, reused: bool) {
    use tracing::debug;
    debug!(
        target: "thread",
        event = "create",
        stack_bytes = stack_size,
        storage_bytes = storage_size,
        reused = reused,
        "Thread created"
    );
}

/// Log a launch
pub fn log_thread_start(id: u64) {
    use tracing::debug;
    debug!(target: "thread", event = "start", tid = id, "Thread started");
}

/// Log a successful join
pub fn log_thread_stop(id: u64) {
    use tracing::debug;
    debug!(target: "thread", event = "stop", tid = id, "Thread joined");
}

/// Log resource release
pub fn log_thread_destroy(id: u64) {
    use tracing::trace;
    trace!(target: "thread", event = "destroy", tid = id, "Thread destroyed");
}

/// Log a failed thread operation
pub fn log_thread_error(operation: &str, error: &str) {
    use tracing::warn;
    warn!(
        target: "thread",
        event = "thread_error",
        operation = operation,
        error = error,
        "Thread operation failed"
    );
}

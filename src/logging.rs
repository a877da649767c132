//! Structured logging for gatt_central
//!
//! A timestamped logger with optional file output. Debug output is further
//! gated per category (scan, gatt, transport, config) so that a busy scan
//! does not drown out the GATT traffic being investigated.

use chrono::Local;
use log::Level;
use log::{LevelFilter, Metadata, Record};
use std::fmt::Debug;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::{Once, RwLock};

use crate::config::LogLevel;
use crate::error::ErrorContext;

/// Timestamp format for log entries
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Global initialization guard
static INIT_LOGGER: Once = Once::new();

/// Debug flag categories for selective logging
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugFlags {
    pub scan: bool,      // Advertisements, scan state, device registry
    pub gatt: bool,      // Manager operations, topology cache, subscriptions
    pub transport: bool, // Platform backend calls and signals
    pub config: bool,    // Configuration loading, saving, validation
    pub all: bool,       // Enable all debug output
}

/// Global debug flags storage
static DEBUG_FLAGS: RwLock<DebugFlags> = RwLock::new(DebugFlags {
    scan: false,
    gatt: false,
    transport: false,
    config: false,
    all: false,
});

/// Logger writing to stderr and optionally to a file
pub struct GattCentralLogger {
    /// File output for logs
    file: Option<Mutex<File>>,
    /// Log level filter
    level: LevelFilter,
    /// Whether to output to stderr
    console_output: bool,
}

impl log::Log for GattCentralLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        if metadata.level() > self.level {
            return false;
        }

        // Debug output is opt-in per category
        if metadata.level() == Level::Debug {
            return should_log_debug(metadata.target());
        }

        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let timestamp = Local::now().format(TIMESTAMP_FORMAT);

        let level_str = match record.level() {
            Level::Error => "\x1B[31mERROR\x1B[0m", // Red
            Level::Warn => "\x1B[33mWARN \x1B[0m",  // Yellow
            Level::Info => "\x1B[32mINFO \x1B[0m",  // Green
            Level::Debug => "\x1B[36mDEBUG\x1B[0m", // Cyan
            Level::Trace => "\x1B[90mTRACE\x1B[0m", // Gray
        };

        let module = record.module_path().unwrap_or("<unknown>");

        if self.console_output {
            let console_entry = format!("[{}] {} [{}] {}\n", timestamp, level_str, module, record.args());
            let _ = io::stderr().write_all(console_entry.as_bytes());
        }

        if let Some(file) = &self.file {
            let file_entry = format!(
                "[{}] {} [{}] [{}:{}] {}\n",
                timestamp,
                record.level(),
                module,
                record.file().unwrap_or("<unknown>"),
                record.line().unwrap_or(0),
                record.args()
            );
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(file_entry.as_bytes());
                let _ = file.flush();
            }
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
    }
}

fn level_filter(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Error => LevelFilter::Error,
        LogLevel::Warn => LevelFilter::Warn,
        LogLevel::Info => LevelFilter::Info,
        LogLevel::Debug => LevelFilter::Debug,
        LogLevel::Trace => LevelFilter::Trace,
    }
}

/// Configure logging with the specified level and optionally a log file
///
/// Only the first call installs a logger; later calls are no-ops.
pub fn configure_logging(
    level: LogLevel,
    log_file: Option<PathBuf>,
    console_output: bool,
) -> Result<(), String> {
    let mut result = Ok(());

    INIT_LOGGER.call_once(|| {
        let level_filter = level_filter(level);

        let file = if let Some(path) = log_file.clone() {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    if let Err(e) = std::fs::create_dir_all(parent) {
                        result = Err(format!("Failed to create log directory: {}", e));
                        return;
                    }
                }
            }

            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => Some(Mutex::new(file)),
                Err(e) => {
                    result = Err(format!("Failed to open log file: {}", e));
                    return;
                }
            }
        } else {
            None
        };

        let logger = Box::new(GattCentralLogger {
            file,
            level: level_filter,
            console_output,
        });

        if let Err(e) = log::set_boxed_logger(logger) {
            result = Err(format!("Failed to set logger: {}", e));
            return;
        }

        log::set_max_level(level_filter);

        log::info!("Logging initialized at level: {}", level);
        if let Some(path) = log_file {
            log::info!("Log file: {}", path.display());
        }
    });

    result
}

/// Set global debug flags for selective logging
pub fn set_debug_flags(flags: DebugFlags) {
    if let Ok(mut debug_flags) = DEBUG_FLAGS.write() {
        *debug_flags = flags;
    }
}

/// Parse a comma separated category list such as `gatt,transport`
pub fn parse_debug_flags(categories: &str) -> DebugFlags {
    let mut flags = DebugFlags::default();
    for category in categories.split(',').map(str::trim) {
        match category {
            "scan" => flags.scan = true,
            "gatt" => flags.gatt = true,
            "transport" => flags.transport = true,
            "config" => flags.config = true,
            "all" => flags.all = true,
            "" => {}
            other => log::warn!("Unknown debug category: {}", other),
        }
    }
    flags
}

/// Check if a debug category should log based on the module path and global flags
pub fn should_log_debug(module_path: &str) -> bool {
    if let Ok(flags) = DEBUG_FLAGS.read() {
        if flags.all {
            return true;
        }

        if module_path.contains("::advertisement") || module_path.contains("::events") {
            return flags.scan;
        }
        if module_path.contains("::manager")
            || module_path.contains("::topology")
            || module_path.contains("::registry")
        {
            return flags.gatt;
        }
        if module_path.contains("transport") {
            return flags.transport;
        }
        if module_path.contains("::config") {
            return flags.config;
        }
    }
    false
}

/// Log an error with context
pub fn log_error<E: Debug>(error: &E, context: &ErrorContext) {
    let metadata = context
        .metadata
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(", ");

    log::error!(
        "[{}::{}] Error: {:?}{}{}",
        context.component,
        context.operation,
        error,
        if metadata.is_empty() { "" } else { " | " },
        metadata
    );

    if let Some(msg) = &context.user_message {
        log::error!("[{}::{}] User message: {}", context.component, context.operation, msg);
    }
}

/// Helper for performance logging
pub struct PerformanceLogger {
    /// Operation being timed
    operation: String,
    /// Component performing the operation
    component: String,
    /// Start time
    start_time: std::time::Instant,
}

impl PerformanceLogger {
    /// Create a new performance logger
    pub fn new<S: Into<String>>(component: S, operation: S) -> Self {
        Self {
            component: component.into(),
            operation: operation.into(),
            start_time: std::time::Instant::now(),
        }
    }

    /// Time elapsed so far
    pub fn elapsed(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// Finish timing and log result
    pub fn finish(self) {
        log::debug!(
            "[{}::{}] Operation completed in {:?}",
            self.component,
            self.operation,
            self.start_time.elapsed()
        );
    }
}

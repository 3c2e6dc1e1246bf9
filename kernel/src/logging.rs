//! Kernel logging facility
//!
//! Provides thread-safe logging functionality for the kernel using the `log` crate.
//! Log levels are configured based on build configuration (debug/release).
//! Output goes through a sink function installed at init time, since the
//! console and serial drivers live outside this crate.

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Global logger instance available throughout the kernel
pub static LOGGER: Logger = Logger::new();

/// Signature of the output sink the embedder provides (serial, console, ...).
pub type LogSink = fn(&Record);

/// Thread-safe logger implementation
pub struct Logger {
    sink: Mutex<Option<LogSink>>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    /// Creates a new logger instance
    pub const fn new() -> Logger {
        Logger {
            sink: Mutex::new(None),
        }
    }
}

impl Log for Logger {
    /// Determines if a log message should be processed based on its level
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    /// Forwards a log record to the installed sink, if any
    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            if let Some(sink) = *self.sink.lock() {
                sink(record);
            }
        }
    }

    /// Flush buffered logs (no-op in this implementation)
    fn flush(&self) {}
}

/// Initializes the logging system with the given output sink
///
/// # Notes
/// * Sets different log levels for debug/release builds:
///   - Debug builds: LevelFilter::Debug
///   - Release builds: LevelFilter::Info
/// * Re-initialization replaces the sink but keeps the first registration
///   with the `log` crate.
pub fn init(sink: LogSink) {
    *LOGGER.sink.lock() = Some(sink);
    let _ = log::set_logger(&LOGGER).map(|()| {
        log::set_max_level(
            #[cfg(debug_assertions)]
            LevelFilter::Debug,
            #[cfg(not(debug_assertions))]
            LevelFilter::Info,
        )
    });
}

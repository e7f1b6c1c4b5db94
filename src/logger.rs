//! Logging backend
//!
//! Routes the `log` facade to a platform console. The platform supplies a
//! sink that receives one formatted line per record and a tick source used
//! for the timestamp column.
//!
//! Level tags are colored with ANSI escapes when the `ansi-log` feature is
//! enabled.

use core::fmt;

use log::{Level, LevelFilter, Metadata, Record};
use spin::Once;

/// Receives one complete log line (without trailing newline)
pub type Sink = fn(fmt::Arguments<'_>);

/// Returns a monotonically increasing tick count for timestamps
pub type Ticks = fn() -> u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggerError {
    /// A logger is already installed
    AlreadySet,
}

impl fmt::Display for LoggerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadySet => f.write_str("logger already installed"),
        }
    }
}

struct Output {
    sink: Sink,
    ticks: Ticks,
}

/// Console logger
struct ConsoleLogger {
    output: Once<Output>,
}

fn level_tag(level: Level) -> &'static str {
    #[cfg(feature = "ansi-log")]
    {
        match level {
            Level::Error => "\x1b[31mERROR\x1b[0m",
            Level::Warn => "\x1b[33mWARN\x1b[0m ",
            Level::Info => "\x1b[32mINFO\x1b[0m ",
            Level::Debug => "\x1b[34mDEBUG\x1b[0m",
            Level::Trace => "\x1b[35mTRACE\x1b[0m",
        }
    }
    #[cfg(not(feature = "ansi-log"))]
    {
        match level {
            Level::Error => "ERROR",
            Level::Warn => "WARN ",
            Level::Info => "INFO ",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }
}

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(output) = self.output.get() {
            let ts = (output.ticks)();
            (output.sink)(format_args!("[{:>10}] [{}] {}", ts, level_tag(record.level()), record.args()));
        }
    }

    fn flush(&self) {}
}

static LOGGER: ConsoleLogger = ConsoleLogger { output: Once::new() };

/// Install the console logger at `Debug` verbosity
pub fn init(sink: Sink, ticks: Ticks) -> Result<(), LoggerError> {
    LOGGER.output.call_once(|| Output { sink, ticks });
    log::set_logger(&LOGGER).map_err(|_| LoggerError::AlreadySet)?;
    log::set_max_level(LevelFilter::Debug);
    Ok(())
}

/// Set the maximum log level
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}

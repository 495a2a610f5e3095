//! Thin wrapper around `slog` so every crate in the workspace logs the same
//! way. Daemons build a terminal logger during startup and swap to rotated
//! file loggers once the configuration has been read.

pub use slog::{b, crit, debug, error, info, kv, log, o, record, record_static, trace, warn};
pub use slog::{Discard, Drain, Level, Logger};

use sloggers::file::FileLoggerBuilder;
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;
use std::path::Path;

/// Logger that swallows everything. Default until a real sink is installed.
#[inline]
pub fn null() -> Logger {
    Logger::root(Discard, o!())
}

/// Stderr logger for startup and for daemons running in the foreground.
pub fn init_terminal(trace: bool) -> Result<Logger, sloggers::Error> {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(if trace { Severity::Trace } else { Severity::Info });
    builder.destination(Destination::Stderr);
    builder.build()
}

/// File logger rotated by size. `rotate_mb == 0` disables rotation.
pub fn init_file<P: AsRef<Path>>(
    path: P,
    trace: bool,
    rotate_mb: u64,
    rotate_keep: usize,
) -> Result<Logger, sloggers::Error> {
    let mut builder = FileLoggerBuilder::new(path);
    builder.level(if trace { Severity::Trace } else { Severity::Info });
    if rotate_mb > 0 {
        builder.rotate_size(rotate_mb * 1024 * 1024);
        builder.rotate_keep(rotate_keep);
    }
    builder.build()
}

//! Logging bootstrap. Downstream crates use this module instead of naming
//! slog directly, so the drain wiring stays in one place.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Level, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Builds the root terminal logger. Each `--verbose` lowers the threshold by
/// one step from `Info`; `--quiet` wins over everything.
pub fn init(verbosity: u64, quiet: bool) -> Logger {
    let severity = if quiet {
        Severity::Critical
    } else {
        match verbosity {
            0 => Severity::Info,
            1 => Severity::Debug,
            _ => Severity::Trace,
        }
    };

    let mut builder = TerminalLoggerBuilder::new();
    builder.level(severity);
    builder.destination(Destination::Stderr);

    builder
        .build()
        .unwrap_or_else(|err| panic!("could not construct terminal logger: {}", err))
}

/// A logger that swallows everything. Handy default for tests and for
/// components constructed without a parent logger.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

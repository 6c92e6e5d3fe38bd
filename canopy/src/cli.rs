//! Flags shared by all three node binaries.

use clap::{Arg, ArgMatches};
use pulse::logging::{self, Logger};

/// `--verbose`/`--quiet` pair, repeatable verbosity.
pub fn logging_args<'a, 'b>() -> Vec<Arg<'a, 'b>> {
    vec![
        Arg::with_name("verbose")
            .long("verbose")
            .short("v")
            .multiple(true)
            .help("Increase log verbosity (repeatable)"),
        Arg::with_name("quiet")
            .long("quiet")
            .short("q")
            .help("Suppress all but critical logging"),
    ]
}

/// `--affinity`/`--noaffinity` pair.
pub fn affinity_args<'a, 'b>() -> Vec<Arg<'a, 'b>> {
    vec![
        Arg::with_name("affinity")
            .long("affinity")
            .help("Pin reactor threads to distinct CPUs"),
        Arg::with_name("noaffinity")
            .long("noaffinity")
            .conflicts_with("affinity")
            .help("Do not pin reactor threads"),
    ]
}

pub fn init_logging(matches: &ArgMatches) -> Logger {
    logging::init(matches.occurrences_of("verbose"), matches.is_present("quiet"))
}

/// Resolves the affinity flag pair against the role's default.
pub fn pin_threads(matches: &ArgMatches, default: bool) -> bool {
    if matches.is_present("noaffinity") {
        false
    } else if matches.is_present("affinity") {
        true
    } else {
        default
    }
}

/// Fatal configuration or startup error: log and exit nonzero.
pub fn fail(log: &Logger, context: &str, err: impl std::fmt::Display) -> ! {
    logging::crit!(log, "{}", context; "error" => %err);
    std::process::exit(1);
}

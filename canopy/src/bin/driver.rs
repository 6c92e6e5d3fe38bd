use canopy::cli;
use canopy::workload::{self, SEARCH_KIND};
use clap::{value_t, App, Arg};
use lattice::driver::{DriverWorker, RequestSpec};
use lattice::server::{install_signal_handler, DriverConfig, DriverNode, ShutdownFlag};
use pulse::logging;

/// Generates fixed-size random requests; pacing and depth policy live in
/// the engine.
struct SearchDriver {
    payload: Vec<u8>,
}

impl DriverWorker for SearchDriver {
    fn make_request(&mut self, spec: &mut RequestSpec) {
        spec.kind = SEARCH_KIND;
        spec.payload.extend_from_slice(&self.payload);
    }
}

fn main() {
    let matches = App::new("driver")
        .about("Closed-loop load driver of the fanout workload simulator")
        .arg(
            Arg::with_name("server")
                .long("server")
                .takes_value(true)
                .required(true)
                .help("Service endpoint as host[:port]"),
        )
        .arg(
            Arg::with_name("threads")
                .long("threads")
                .takes_value(true)
                .default_value("1")
                .help("Number of reactor threads"),
        )
        .arg(
            Arg::with_name("connections")
                .long("connections")
                .takes_value(true)
                .default_value("1")
                .help("Connections per reactor thread"),
        )
        .arg(
            Arg::with_name("depth")
                .long("depth")
                .takes_value(true)
                .default_value("4")
                .help("Per-connection in-flight cap"),
        )
        .arg(
            Arg::with_name("qps")
                .long("qps")
                .takes_value(true)
                .default_value("0")
                .help("Aggregate target rate; 0 runs unpaced"),
        )
        .arg(
            Arg::with_name("request_size")
                .long("request_size")
                .takes_value(true)
                .default_value("512")
                .help("Request payload bytes"),
        )
        .arg(
            Arg::with_name("monitor_port")
                .long("monitor_port")
                .takes_value(true)
                .help("Serve monitoring JSON on this port"),
        )
        .args(&cli::affinity_args())
        .args(&cli::logging_args())
        .get_matches();

    let log = cli::init_logging(&matches);

    let server = matches.value_of("server").expect("required flag").to_string();
    let threads = value_t!(matches, "threads", usize).unwrap_or_else(|e| e.exit());
    let connections = value_t!(matches, "connections", usize).unwrap_or_else(|e| e.exit());
    let depth = value_t!(matches, "depth", u32).unwrap_or_else(|e| e.exit());
    let qps = value_t!(matches, "qps", f64).unwrap_or_else(|e| e.exit());
    let request_size = value_t!(matches, "request_size", usize).unwrap_or_else(|e| e.exit());

    let monitor_port = if matches.is_present("monitor_port") {
        Some(value_t!(matches, "monitor_port", u16).unwrap_or_else(|e| e.exit()))
    } else {
        None
    };

    let shutdown = ShutdownFlag::new();
    install_signal_handler(shutdown.clone(), &log);

    let config = DriverConfig {
        server,
        threads,
        connections,
        depth,
        qps,
        pin_threads: cli::pin_threads(&matches, false),
        kinds: vec![SEARCH_KIND],
        monitor_port,
        shutdown,
    };

    let node = DriverNode::new(
        config,
        move |_thread| SearchDriver {
            payload: workload::random_payload(request_size),
        },
        log.clone(),
    )
    .unwrap_or_else(|err| cli::fail(&log, "driver startup failed", err));

    if let Err(err) = node.run() {
        cli::fail(&log, "driver failed", err);
    }

    logging::info!(log, "clean shutdown");
}

use canopy::cli;
use canopy::workload::{self, SEARCH_KIND};
use clap::{value_t, App, Arg};
use lattice::net::parent::QueryContext;
use lattice::server::{
    install_signal_handler, BalanceParams, LeafConfig, LeafServer, LeafWorker, ShutdownFlag,
};
use pulse::logging;
use std::time::Duration;

/// Answers every request with a fixed-size random payload after an optional
/// busy compute phase.
struct SearchLeaf {
    response: Vec<u8>,
    compute: Duration,
}

impl LeafWorker for SearchLeaf {
    fn on_query(&mut self, ctx: &mut QueryContext) {
        workload::spin_for(self.compute);
        ctx.send_response(&self.response);
    }
}

fn main() {
    let matches = App::new("leaf")
        .about("Leaf node of the fanout workload simulator")
        .arg(
            Arg::with_name("port")
                .long("port")
                .takes_value(true)
                .default_value("11222")
                .help("Port to listen on"),
        )
        .arg(
            Arg::with_name("threads")
                .long("threads")
                .takes_value(true)
                .default_value("4")
                .help("Number of reactor threads"),
        )
        .arg(
            Arg::with_name("monitor_port")
                .long("monitor_port")
                .takes_value(true)
                .help("Serve monitoring JSON on this port"),
        )
        .arg(
            Arg::with_name("noloadbalance")
                .long("noloadbalance")
                .help("Disable the work-stealing load balancer"),
        )
        .arg(
            Arg::with_name("lb_connections_batch")
                .long("lb_connections_batch")
                .takes_value(true)
                .default_value("1")
                .help("Victim rotation cadence of the load balancer"),
        )
        .arg(
            Arg::with_name("lb_requests_batch")
                .long("lb_requests_batch")
                .takes_value(true)
                .default_value("1")
                .help("Tasks processed per balancer wakeup"),
        )
        .arg(
            Arg::with_name("response_size")
                .long("response_size")
                .takes_value(true)
                .default_value("128")
                .help("Response payload bytes"),
        )
        .arg(
            Arg::with_name("compute_us")
                .long("compute_us")
                .takes_value(true)
                .default_value("0")
                .help("Busy compute per request, microseconds"),
        )
        .args(&cli::affinity_args())
        .args(&cli::logging_args())
        .get_matches();

    let log = cli::init_logging(&matches);

    let port = value_t!(matches, "port", u16).unwrap_or_else(|e| e.exit());
    let threads = value_t!(matches, "threads", usize).unwrap_or_else(|e| e.exit());
    let response_size = value_t!(matches, "response_size", usize).unwrap_or_else(|e| e.exit());
    let compute_us = value_t!(matches, "compute_us", u64).unwrap_or_else(|e| e.exit());

    let balance = if matches.is_present("noloadbalance") {
        None
    } else {
        Some(BalanceParams {
            connections_batch: value_t!(matches, "lb_connections_batch", usize)
                .unwrap_or_else(|e| e.exit()),
            requests_batch: value_t!(matches, "lb_requests_batch", usize)
                .unwrap_or_else(|e| e.exit()),
        })
    };

    let monitor_port = if matches.is_present("monitor_port") {
        Some(value_t!(matches, "monitor_port", u16).unwrap_or_else(|e| e.exit()))
    } else {
        None
    };

    let shutdown = ShutdownFlag::new();
    install_signal_handler(shutdown.clone(), &log);

    let config = LeafConfig {
        port,
        threads,
        pin_threads: cli::pin_threads(&matches, true),
        balance,
        kinds: vec![SEARCH_KIND],
        monitor_port,
        shutdown,
    };

    let compute = Duration::from_micros(compute_us);
    let server = LeafServer::bind(
        config,
        move |_thread| SearchLeaf {
            response: workload::random_payload(response_size),
            compute,
        },
        log.clone(),
    )
    .unwrap_or_else(|err| cli::fail(&log, "leaf startup failed", err));

    if let Err(err) = server.run() {
        cli::fail(&log, "leaf server failed", err);
    }

    logging::info!(log, "clean shutdown");
}

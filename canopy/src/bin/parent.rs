use canopy::cli;
use canopy::workload::{self, SEARCH_KIND};
use clap::{value_t, App, Arg};
use lattice::fanout::FanoutReplyTracker;
use lattice::net::parent::QueryContext;
use lattice::server::{
    install_signal_handler, FanoutCtx, ParentConfig, ParentServer, ParentWorker, ShutdownFlag,
};
use pulse::logging;
use std::time::Duration;

/// Fans every upstream request out to all children, then answers upstream
/// with its own payload once the replies (or the deadline) are in.
struct SearchParent {
    request: Vec<u8>,
    response: Vec<u8>,
    connections_per_child: usize,
    timeout: Option<Duration>,
}

fn search_done(worker: &mut SearchParent, mut origin: QueryContext, _tracker: &FanoutReplyTracker) {
    origin.send_response(&worker.response);
}

impl ParentWorker for SearchParent {
    fn startup(&mut self, _thread: usize, fanout: &mut FanoutCtx<Self>) {
        for child in 0..fanout.num_children() {
            if let Err(err) = fanout.make_child_connections(child, self.connections_per_child) {
                panic!("could not connect to child {}: {}", child, err);
            }
        }
    }

    fn on_query(&mut self, fanout: &mut FanoutCtx<Self>, ctx: QueryContext) {
        fanout.fanout_all(ctx, SEARCH_KIND, &self.request, search_done, self.timeout);
    }
}

fn main() {
    let matches = App::new("parent")
        .about("Parent (aggregator) node of the fanout workload simulator")
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
            Arg::with_name("leaf")
                .long("leaf")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .required(true)
                .help("Child endpoint as host[:port]; repeatable"),
        )
        .arg(
            Arg::with_name("connections")
                .long("connections")
                .takes_value(true)
                .default_value("1")
                .help("Connections per child per reactor"),
        )
        .arg(
            Arg::with_name("timeout_ms")
                .long("timeout_ms")
                .takes_value(true)
                .default_value("0")
                .help("Fanout deadline in milliseconds; 0 disables it"),
        )
        .arg(
            Arg::with_name("request_size")
                .long("request_size")
                .takes_value(true)
                .default_value("512")
                .help("Child request payload bytes"),
        )
        .arg(
            Arg::with_name("response_size")
                .long("response_size")
                .takes_value(true)
                .default_value("1024")
                .help("Upstream response payload bytes"),
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

    let port = value_t!(matches, "port", u16).unwrap_or_else(|e| e.exit());
    let threads = value_t!(matches, "threads", usize).unwrap_or_else(|e| e.exit());
    let connections = value_t!(matches, "connections", usize).unwrap_or_else(|e| e.exit());
    let timeout_ms = value_t!(matches, "timeout_ms", u64).unwrap_or_else(|e| e.exit());
    let request_size = value_t!(matches, "request_size", usize).unwrap_or_else(|e| e.exit());
    let response_size = value_t!(matches, "response_size", usize).unwrap_or_else(|e| e.exit());

    let children: Vec<String> = matches
        .values_of("leaf")
        .expect("required flag")
        .map(str::to_string)
        .collect();

    let monitor_port = if matches.is_present("monitor_port") {
        Some(value_t!(matches, "monitor_port", u16).unwrap_or_else(|e| e.exit()))
    } else {
        None
    };

    let timeout = if timeout_ms > 0 {
        Some(Duration::from_millis(timeout_ms))
    } else {
        None
    };

    let shutdown = ShutdownFlag::new();
    install_signal_handler(shutdown.clone(), &log);

    let config = ParentConfig {
        port,
        threads,
        pin_threads: cli::pin_threads(&matches, true),
        children,
        kinds: vec![SEARCH_KIND],
        monitor_port,
        shutdown,
    };

    let server = ParentServer::bind(
        config,
        move |_thread| SearchParent {
            request: workload::random_payload(request_size),
            response: workload::random_payload(response_size),
            connections_per_child: connections,
            timeout,
        },
        log.clone(),
    )
    .unwrap_or_else(|err| cli::fail(&log, "parent startup failed", err));

    if let Err(err) = server.run() {
        cli::fail(&log, "parent server failed", err);
    }

    logging::info!(log, "clean shutdown");
}

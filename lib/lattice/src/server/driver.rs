//! Driver node: a pool of reactor threads generating a closed-loop request
//! stream against one service endpoint, plus the main-thread stats
//! coordinator and the shutdown report.

use crate::driver::{DriverEngine, DriverWorker};
use crate::monitor::{self, Topology};
use crate::reactor::{Reactor, TimerKind, TokenAlloc};
use crate::server::{ignore_sigpipe, parse_endpoint, resolve_ipv4, ShutdownFlag};
use crate::stats::{
    drain_ready, print_report, ChildStats, SnapshotQueue, StatsHub, STATS_WINDOW_SECS,
};
use parking_lot::Mutex;
use pulse::logging::{self, Logger};
use std::io;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub struct DriverConfig {
    /// Service endpoint as `host[:port]`.
    pub server: String,
    pub threads: usize,
    /// Connections per reactor thread.
    pub connections: usize,
    /// Per-connection in-flight cap.
    pub depth: u32,
    /// Aggregate target rate; zero means unpaced.
    pub qps: f64,
    pub pin_threads: bool,
    pub kinds: Vec<u32>,
    pub monitor_port: Option<u16>,
    pub shutdown: ShutdownFlag,
}

pub struct DriverNode<W, F> {
    config: DriverConfig,
    factory: F,
    target: SocketAddr,
    target_name: String,
    hub: Arc<Mutex<StatsHub<ChildStats>>>,
    log: Logger,
    _worker: PhantomData<W>,
}

impl<W, F> DriverNode<W, F>
where
    W: DriverWorker,
    F: FnMut(usize) -> W,
{
    /// Resolves the endpoint up front; configuration and resolution errors
    /// fail the construction.
    pub fn new(config: DriverConfig, factory: F, log: Logger) -> io::Result<DriverNode<W, F>> {
        if config.threads == 0 || config.connections == 0 || config.depth == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "driver needs threads, connections and depth of at least one",
            ));
        }

        let (host, port) = parse_endpoint(&config.server);
        let target = resolve_ipv4(&host, port)?;
        let target_name = config.server.clone();
        let hub = Arc::new(Mutex::new(StatsHub::new(ChildStats::new(&config.kinds))));

        Ok(DriverNode {
            config,
            factory,
            target,
            target_name,
            hub,
            log,
            _worker: PhantomData,
        })
    }

    pub fn stats_hub(&self) -> Arc<Mutex<StatsHub<ChildStats>>> {
        Arc::clone(&self.hub)
    }

    /// Drives load until the shutdown flag is set, then joins the reactors
    /// and returns the run aggregate (also printed to stdout).
    pub fn run(mut self) -> io::Result<ChildStats> {
        ignore_sigpipe();

        let threads = self.config.threads;
        let qps_per_thread = if self.config.qps > 0.0 {
            self.config.qps / threads as f64
        } else {
            0.0
        };

        let snapshots: Vec<Arc<SnapshotQueue<ChildStats>>> =
            (0..threads).map(|_| Arc::new(SnapshotQueue::new())).collect();

        let started = Instant::now();
        let mut handles = Vec::with_capacity(threads);
        for thread_num in 0..threads {
            let worker = (self.factory)(thread_num);
            let snapshots = Arc::clone(&snapshots[thread_num]);
            let target = self.target;
            let connections = self.config.connections;
            let depth = self.config.depth;
            let kinds = self.config.kinds.clone();
            let pin = self.config.pin_threads;
            let shutdown = self.config.shutdown.clone();
            let log = self.log.new(logging::o!("thread" => thread_num));

            handles.push(
                thread::Builder::new()
                    .name(format!("driver-{}", thread_num))
                    .spawn(move || {
                        driver_thread_main(
                            thread_num,
                            target,
                            connections,
                            depth,
                            qps_per_thread,
                            kinds,
                            snapshots,
                            worker,
                            pin,
                            shutdown,
                            log,
                        )
                    })?,
            );
        }

        let monitor = match self.config.monitor_port {
            Some(port) => Some(monitor::spawn(
                port,
                Topology::Driver {
                    test_node: self.target_name.clone(),
                },
                Arc::clone(&self.hub),
                self.config.shutdown.clone(),
                self.log.new(logging::o!("component" => "monitor")),
            )?),
            None => None,
        };

        logging::info!(self.log, "driver running";
                       "target" => %self.target,
                       "threads" => threads,
                       "connections" => self.config.connections,
                       "depth" => self.config.depth,
                       "qps" => self.config.qps);

        while !self.config.shutdown.is_set() {
            thread::sleep(Duration::from_millis(200));
            let refs: Vec<&SnapshotQueue<ChildStats>> =
                snapshots.iter().map(|q| q.as_ref()).collect();
            drain_ready(&refs, &mut self.hub.lock());
        }

        for handle in handles {
            let _ = handle.join();
        }

        let refs: Vec<&SnapshotQueue<ChildStats>> =
            snapshots.iter().map(|q| q.as_ref()).collect();
        drain_ready(&refs, &mut self.hub.lock());

        if let Some(monitor) = monitor {
            monitor.join();
        }

        let elapsed = started.elapsed().as_secs_f64().max(1e-9);
        let aggregate = self.hub.lock().lifetime.clone();
        print_report(&aggregate, elapsed);

        logging::info!(self.log, "driver stopped"; "elapsed_secs" => elapsed);
        Ok(aggregate)
    }
}

fn driver_thread_main<W: DriverWorker>(
    thread_num: usize,
    target: SocketAddr,
    connections: usize,
    depth: u32,
    qps_per_thread: f64,
    kinds: Vec<u32>,
    snapshots: Arc<SnapshotQueue<ChildStats>>,
    mut worker: W,
    pin: bool,
    shutdown: ShutdownFlag,
    log: Logger,
) {
    if pin {
        crate::server::pin_current_thread(&log);
    }

    let mut reactor = Reactor::new(log.clone()).expect("reactor construction");
    let mut tokens = TokenAlloc::new();

    let mut engine = match DriverEngine::connect(
        &target,
        connections,
        depth,
        qps_per_thread,
        &kinds,
        &mut tokens,
        log.clone(),
    ) {
        Ok(engine) => engine,
        Err(err) => {
            logging::crit!(log, "could not connect to service"; "error" => %err);
            shutdown.set();
            return;
        }
    };
    engine.register(&reactor.poll).expect("connection registration");

    reactor.timers.schedule(
        Duration::from_secs(STATS_WINDOW_SECS),
        TimerKind::StatsSnapshot,
    );

    worker.startup(thread_num);
    engine.start(&mut worker, &mut reactor.timers);

    let mut events = Vec::new();
    while !shutdown.is_set() {
        if let Err(err) = reactor.poll_into(&mut events) {
            logging::crit!(log, "poll failed"; "error" => %err);
            break;
        }

        let now = Instant::now();
        while let Some(kind) = reactor.timers.expired(now) {
            match kind {
                TimerKind::StatsSnapshot => {
                    snapshots.push(engine.take_snapshot());
                    reactor.timers.schedule(
                        Duration::from_secs(STATS_WINDOW_SECS),
                        TimerKind::StatsSnapshot,
                    );
                }
                TimerKind::NextRequest => {
                    engine.on_next_request(&mut worker, &mut reactor.timers);
                }
                TimerKind::RecomputeQps => {
                    engine.on_recompute(&mut reactor.timers);
                }
                _ => (),
            }
        }

        for event in &events {
            let token = event.token();
            if engine.owns_token(token) {
                engine.handle_event(
                    token,
                    event.readiness().is_readable(),
                    event.readiness().is_writable(),
                    &mut worker,
                    &mut reactor.timers,
                );
            }
        }

        engine.flush_pending();
    }

    snapshots.push(engine.take_snapshot());
    logging::debug!(log, "driver reactor exiting";
                    "thread" => thread_num, "backlog" => engine.backlog());
}

//! End-to-end topologies on loopback: echo leaf, parent fanout, fanout
//! timeouts, work stealing, and shutdown latency. Counts are scaled down
//! from the full scenarios so the suite stays fast.

use lattice::driver::{DriverWorker, RequestSpec};
use lattice::fanout::FanoutReplyTracker;
use lattice::net::child::ResponseContext;
use lattice::net::parent::QueryContext;
use lattice::server::{
    BalanceParams, DriverConfig, DriverNode, FanoutCtx, LeafConfig, LeafServer, LeafWorker,
    ParentConfig, ParentServer, ParentWorker, ShutdownFlag,
};
use pulse::logging::discard;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const KIND: u32 = 7;

/// Leaf worker that echoes the request payload, optionally after a fixed
/// busy delay, and counts what it processed per reactor thread.
struct EchoLeaf {
    thread: usize,
    delay: Duration,
    processed: Arc<Vec<AtomicU64>>,
}

impl LeafWorker for EchoLeaf {
    fn on_query(&mut self, ctx: &mut QueryContext) {
        if self.delay > Duration::from_millis(0) {
            thread::sleep(self.delay);
        }
        let payload = ctx.payload().to_vec();
        ctx.send_response(&payload);
        self.processed[self.thread].fetch_add(1, Ordering::SeqCst);
    }
}

struct LeafHandle {
    addr: std::net::SocketAddr,
    shutdown: ShutdownFlag,
    processed: Arc<Vec<AtomicU64>>,
    thread: thread::JoinHandle<()>,
}

impl LeafHandle {
    fn stop(self) {
        self.shutdown.set();
        self.thread.join().unwrap();
    }

    fn total_processed(&self) -> u64 {
        self.processed.iter().map(|c| c.load(Ordering::SeqCst)).sum()
    }
}

fn spawn_leaf(threads: usize, balance: Option<BalanceParams>, delay: Duration) -> LeafHandle {
    let shutdown = ShutdownFlag::new();
    let processed: Arc<Vec<AtomicU64>> =
        Arc::new((0..threads).map(|_| AtomicU64::new(0)).collect());

    let factory_counts = Arc::clone(&processed);
    let server = LeafServer::bind(
        LeafConfig {
            port: 0,
            threads,
            pin_threads: false,
            balance,
            kinds: vec![KIND],
            monitor_port: None,
            shutdown: shutdown.clone(),
        },
        move |thread| EchoLeaf {
            thread,
            delay,
            processed: Arc::clone(&factory_counts),
        },
        discard(),
    )
    .expect("leaf bind");

    let addr = server.local_addr().expect("leaf addr");
    let thread = thread::spawn(move || server.run().expect("leaf run"));

    LeafHandle {
        addr,
        shutdown,
        processed,
        thread,
    }
}

/// Driver worker: fixed payload, counts replies, verifies the echo, and
/// pulls the shutdown flag once the target count is reached.
struct CountingDriver {
    payload: Vec<u8>,
    target: u64,
    received: Arc<AtomicU64>,
    echo_ok: Arc<AtomicBool>,
    check_payload: bool,
    shutdown: ShutdownFlag,
}

impl DriverWorker for CountingDriver {
    fn make_request(&mut self, spec: &mut RequestSpec) {
        spec.kind = KIND;
        spec.payload.extend_from_slice(&self.payload);
    }

    fn on_reply(&mut self, reply: &ResponseContext) {
        if reply.kind != KIND || (self.check_payload && reply.payload != &self.payload[..]) {
            self.echo_ok.store(false, Ordering::SeqCst);
        }
        let count = self.received.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.target {
            self.shutdown.set();
        }
    }
}

struct DriveOutcome {
    aggregate: lattice::stats::ChildStats,
    received: u64,
    echo_ok: bool,
}

fn drive(
    target_addr: std::net::SocketAddr,
    connections: usize,
    depth: u32,
    payload: &[u8],
    target: u64,
    check_payload: bool,
) -> DriveOutcome {
    let shutdown = ShutdownFlag::new();
    let received = Arc::new(AtomicU64::new(0));
    let echo_ok = Arc::new(AtomicBool::new(true));

    let worker_received = Arc::clone(&received);
    let worker_echo = Arc::clone(&echo_ok);
    let worker_shutdown = shutdown.clone();
    let worker_payload = payload.to_vec();

    let node = DriverNode::new(
        DriverConfig {
            server: format!("127.0.0.1:{}", target_addr.port()),
            threads: 1,
            connections,
            depth,
            qps: 0.0,
            pin_threads: false,
            kinds: vec![KIND],
            monitor_port: None,
            shutdown,
        },
        move |_| CountingDriver {
            payload: worker_payload.clone(),
            target,
            received: Arc::clone(&worker_received),
            echo_ok: Arc::clone(&worker_echo),
            check_payload,
            shutdown: worker_shutdown.clone(),
        },
        discard(),
    )
    .expect("driver construction");

    let aggregate = node.run().expect("driver run");

    DriveOutcome {
        aggregate,
        received: received.load(Ordering::SeqCst),
        echo_ok: echo_ok.load(Ordering::SeqCst),
    }
}

#[test]
fn test_echo_leaf_end_to_end() {
    let leaf = spawn_leaf(1, None, Duration::from_millis(0));

    let outcome = drive(leaf.addr, 1, 4, b"ping", 500, true);

    assert!(outcome.received >= 500, "got {} replies", outcome.received);
    assert!(outcome.echo_ok, "payload did not round-trip byte-for-byte");
    assert!(outcome.aggregate.reply_count(KIND) >= 500);
    assert!(outcome.aggregate.query_count(KIND) >= outcome.aggregate.reply_count(KIND));
    assert_eq!(outcome.aggregate.dropped_count(KIND), 0);

    leaf.stop();
}

/// Parent worker fanning every request out to all children.
struct FanParent {
    connections_per_child: usize,
    timeout: Option<Duration>,
}

fn fan_done(_worker: &mut FanParent, mut origin: QueryContext, tracker: &FanoutReplyTracker) {
    // Aggregate by echoing the first live reply (or empty on total miss).
    let body: &[u8] = tracker
        .replies
        .iter()
        .find(|r| !r.timed_out)
        .map(|r| r.payload.as_slice())
        .unwrap_or(b"");
    origin.send_response(body);
}

impl ParentWorker for FanParent {
    fn startup(&mut self, _thread: usize, fanout: &mut FanoutCtx<Self>) {
        for child in 0..fanout.num_children() {
            fanout
                .make_child_connections(child, self.connections_per_child)
                .expect("child connections");
        }
    }

    fn on_query(&mut self, fanout: &mut FanoutCtx<Self>, ctx: QueryContext) {
        let payload = ctx.payload().to_vec();
        fanout.fanout_all(ctx, KIND, &payload, fan_done, self.timeout);
    }
}

struct ParentHandle {
    addr: std::net::SocketAddr,
    shutdown: ShutdownFlag,
    hub: Arc<parking_lot::Mutex<lattice::stats::StatsHub<Vec<lattice::stats::ChildStats>>>>,
    thread: thread::JoinHandle<()>,
}

impl ParentHandle {
    fn stop(self) -> Vec<lattice::stats::ChildStats> {
        self.shutdown.set();
        self.thread.join().unwrap();
        self.hub.lock().lifetime.clone()
    }
}

fn spawn_parent(
    children: Vec<String>,
    connections_per_child: usize,
    timeout: Option<Duration>,
) -> ParentHandle {
    let shutdown = ShutdownFlag::new();
    let server = ParentServer::bind(
        ParentConfig {
            port: 0,
            threads: 1,
            pin_threads: false,
            children,
            kinds: vec![KIND],
            monitor_port: None,
            shutdown: shutdown.clone(),
        },
        move |_| FanParent {
            connections_per_child,
            timeout,
        },
        discard(),
    )
    .expect("parent bind");

    let addr = server.local_addr().expect("parent addr");
    let hub = server.stats_hub();
    let thread = thread::spawn(move || server.run().expect("parent run"));

    ParentHandle {
        addr,
        shutdown,
        hub,
        thread,
    }
}

#[test]
fn test_parent_fans_out_to_both_leaves() {
    let leaf_a = spawn_leaf(1, None, Duration::from_millis(0));
    let leaf_b = spawn_leaf(1, None, Duration::from_millis(0));
    let parent = spawn_parent(
        vec![
            format!("127.0.0.1:{}", leaf_a.addr.port()),
            format!("127.0.0.1:{}", leaf_b.addr.port()),
        ],
        1,
        None,
    );

    let target = 200;
    let outcome = drive(parent.addr, 1, 2, b"fan", target, false);

    assert!(outcome.received >= target);
    // Without a timeout, every upstream response implies a request processed
    // at each of the two leaves.
    assert!(leaf_a.total_processed() >= target);
    assert!(leaf_b.total_processed() >= target);

    let child_stats = parent.stop();
    assert_eq!(child_stats.len(), 2);
    assert_eq!(child_stats[0].dropped_count(KIND), 0);
    assert_eq!(child_stats[1].dropped_count(KIND), 0);
    assert!(child_stats[0].reply_count(KIND) >= target);

    leaf_a.stop();
    leaf_b.stop();
}

#[test]
fn test_fanout_timeout_marks_slow_child_dropped() {
    let fast_leaf = spawn_leaf(1, None, Duration::from_millis(0));
    let slow_leaf = spawn_leaf(1, None, Duration::from_millis(300));
    let parent = spawn_parent(
        vec![
            format!("127.0.0.1:{}", fast_leaf.addr.port()),
            format!("127.0.0.1:{}", slow_leaf.addr.port()),
        ],
        1,
        Some(Duration::from_millis(100)),
    );

    let target = 20;
    let outcome = drive(parent.addr, 1, 1, b"slowpoke", target, false);

    // Every upstream request still gets exactly one response.
    assert!(outcome.received >= target);

    let child_stats = parent.stop();
    // The slow child misses the 100ms deadline on essentially every fanout.
    assert!(
        child_stats[1].dropped_count(KIND) >= target * 3 / 4,
        "slow child only dropped {}",
        child_stats[1].dropped_count(KIND)
    );
    assert_eq!(child_stats[0].dropped_count(KIND), 0);

    fast_leaf.stop();
    slow_leaf.stop();
}

#[test]
fn test_work_stealing_spreads_load_across_reactors() {
    let leaf = spawn_leaf(
        2,
        Some(BalanceParams {
            connections_batch: 1,
            requests_batch: 1,
        }),
        Duration::from_millis(0),
    );

    // One upstream connection: every frame decodes on reactor 0, so any
    // work observed on reactor 1 arrived through the steal path.
    let target = 300;
    let outcome = drive(leaf.addr, 1, 8, b"steal", target, true);

    assert!(outcome.received >= target);
    assert!(outcome.echo_ok);

    let counts: Vec<u64> = leaf
        .processed
        .iter()
        .map(|c| c.load(Ordering::SeqCst))
        .collect();
    assert!(counts[0] + counts[1] >= target);
    assert!(
        counts[1] > 0,
        "reactor 1 processed nothing; no stealing happened ({:?})",
        counts
    );

    leaf.stop();
}

#[test]
fn test_saturated_driver_is_paced_by_depth() {
    // 20ms of service time per request with depth 2 on one connection: the
    // closed loop cannot run faster than the leaf drains it.
    let leaf = spawn_leaf(1, None, Duration::from_millis(20));

    let target = 25;
    let started = Instant::now();
    let outcome = drive(leaf.addr, 1, 2, b"slow", target, true);
    let elapsed = started.elapsed();

    assert!(outcome.received >= target);
    assert!(
        elapsed >= Duration::from_millis(300),
        "{}ms is faster than the service time bound",
        elapsed.as_millis()
    );

    leaf.stop();
}

#[test]
fn test_shutdown_quiesces_within_a_second() {
    let leaf = spawn_leaf(2, None, Duration::from_millis(0));

    // Let the reactors settle into their poll loops.
    thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    leaf.shutdown.set();
    leaf.thread.join().unwrap();
    let elapsed = started.elapsed();

    assert!(
        elapsed < Duration::from_secs(2),
        "shutdown took {}ms",
        elapsed.as_millis()
    );
}

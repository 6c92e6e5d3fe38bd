//! Closed-loop request generation against a single service endpoint. Each
//! reactor owns a set of connections split into a ready partition and a
//! saturated partition; generation is bounded by per-connection depth, and
//! an optional controller adjusts inter-request spacing toward a target
//! rate.

use crate::net::child::{ChildConnection, ResponseContext};
use crate::net::wire::WireError;
use crate::reactor::{TimerKind, Timers, TokenAlloc};
use crate::stats::ChildStats;
use mio::{Poll, Token};
use pulse::logging::{self, Logger};
use pulse::time;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// Controller cadence.
pub const RECOMPUTE_QPS_PERIOD: Duration = Duration::from_secs(5);

/// What the workload wants sent next. The engine hands the worker a scratch
/// spec with `next_delay_us` pre-seeded from the pacing controller; the
/// worker fills in kind and payload and may override the delay.
pub struct RequestSpec {
    pub kind: u32,
    pub payload: Vec<u8>,
    pub next_delay_us: u64,
}

/// Per-thread driver workload hooks.
pub trait DriverWorker: Send + 'static {
    fn startup(&mut self, _thread: usize) {}
    /// Produce the next request into `spec`.
    fn make_request(&mut self, spec: &mut RequestSpec);
    /// Observe one reply.
    fn on_reply(&mut self, _reply: &ResponseContext) {}
}

/// Ready/saturated partition over connection ids. `conns[..num_ready]` are
/// ready; a parallel position index keeps the swaps O(1).
pub struct ConnSet {
    conns: Vec<usize>,
    positions: Vec<usize>,
    num_ready: usize,
}

impl ConnSet {
    pub fn new(count: usize) -> ConnSet {
        ConnSet {
            conns: (0..count).collect(),
            positions: (0..count).collect(),
            num_ready: count,
        }
    }

    #[inline]
    pub fn num_ready(&self) -> usize {
        self.num_ready
    }

    #[inline]
    pub fn is_ready(&self, id: usize) -> bool {
        self.positions[id] < self.num_ready
    }

    /// Connection to issue on, if any is ready.
    #[inline]
    pub fn next_ready(&self) -> Option<usize> {
        if self.num_ready == 0 {
            None
        } else {
            Some(self.conns[0])
        }
    }

    pub fn mark_saturated(&mut self, id: usize) {
        debug_assert!(self.is_ready(id));
        let position = self.positions[id];
        let boundary = self.num_ready - 1;
        let swapped = self.conns[boundary];

        self.conns.swap(position, boundary);
        self.positions.swap(swapped, id);
        self.num_ready -= 1;
    }

    pub fn mark_ready(&mut self, id: usize) {
        debug_assert!(!self.is_ready(id));
        let position = self.positions[id];
        let boundary = self.num_ready;
        let swapped = self.conns[boundary];

        self.conns.swap(position, boundary);
        self.positions.swap(swapped, id);
        self.num_ready += 1;
    }
}

/// Multiplicative proportional pacing: the observed/target ratio scales the
/// current delay, so the target rate is the fixed point. A window with no
/// traffic halves the delay to recover from stalls.
pub struct RateController {
    target_per_thread: f64,
    delay_us: u64,
}

impl RateController {
    pub fn new(target_per_thread: f64) -> RateController {
        assert!(target_per_thread > 0.0);
        RateController {
            target_per_thread,
            delay_us: (1e6 / target_per_thread) as u64,
        }
    }

    #[inline]
    pub fn delay_us(&self) -> u64 {
        self.delay_us
    }

    pub fn observe(&mut self, observed_qps: f64) {
        let period = 1e6 / self.target_per_thread;
        let next = if observed_qps <= 0.0 {
            self.delay_us as f64 / 2.0
        } else {
            self.delay_us as f64 * (observed_qps / self.target_per_thread)
        };
        self.delay_us = next.max(period / 8.0).min(period * 8.0).max(1.0) as u64;
    }
}

/// Per-reactor driver state: connections, partition, pacing, backlog.
pub struct DriverEngine {
    conns: Vec<ChildConnection>,
    set: ConnSet,
    first_token: usize,
    max_depth: u32,
    next_request_id: u64,
    backlog: u64,
    // One pacing timer chain at a time, like a re-armed event.
    next_request_armed: bool,
    scratch: RequestSpec,
    pub stats: ChildStats,
    pub last_stats: ChildStats,
    controller: Option<RateController>,
    log: Logger,
}

impl DriverEngine {
    /// Opens `count` connections to the service endpoint. A pacing target of
    /// zero means unpaced (tight-loop) generation.
    pub fn connect(
        addr: &SocketAddr,
        count: usize,
        max_depth: u32,
        qps_per_thread: f64,
        kinds: &[u32],
        tokens: &mut TokenAlloc,
        log: Logger,
    ) -> io::Result<DriverEngine> {
        assert!(count > 0 && max_depth > 0);

        let mut conns = Vec::with_capacity(count);
        let mut first_token = 0;
        for i in 0..count {
            let token = tokens.next();
            if i == 0 {
                first_token = token.0;
            }
            conns.push(ChildConnection::connect(
                addr,
                token,
                log.new(logging::o!("conn" => i)),
            )?);
        }

        let controller = if qps_per_thread > 0.0 {
            Some(RateController::new(qps_per_thread))
        } else {
            None
        };

        Ok(DriverEngine {
            set: ConnSet::new(conns.len()),
            conns,
            first_token,
            max_depth,
            next_request_id: 0,
            backlog: 0,
            next_request_armed: false,
            scratch: RequestSpec {
                kind: 0,
                payload: Vec::new(),
                next_delay_us: 0,
            },
            stats: ChildStats::new(kinds),
            last_stats: ChildStats::new(kinds),
            controller,
            log,
        })
    }

    pub fn register(&self, poll: &Poll) -> io::Result<()> {
        for conn in &self.conns {
            conn.register(poll)?;
        }
        Ok(())
    }

    #[inline]
    pub fn owns_token(&self, token: Token) -> bool {
        token.0 >= self.first_token && token.0 < self.first_token + self.conns.len()
    }

    #[inline]
    pub fn backlog(&self) -> u64 {
        self.backlog
    }

    pub fn outstanding(&self, id: usize) -> u32 {
        self.conns[id].outstanding()
    }

    pub fn max_outstanding(&self) -> u32 {
        self.conns.iter().map(|c| c.outstanding()).max().unwrap_or(0)
    }

    pub fn paced(&self) -> bool {
        self.controller.is_some()
    }

    /// Kicks off generation; also arms the controller cadence.
    pub fn start<W: DriverWorker>(&mut self, worker: &mut W, timers: &mut Timers) {
        if self.controller.is_some() {
            timers.schedule(RECOMPUTE_QPS_PERIOD, TimerKind::RecomputeQps);
        }
        self.make_requests(worker, timers);
    }

    /// Generation loop: with zero delay, runs until every connection is
    /// saturated; with a delay, issues one request and arms the timer. When
    /// nothing is ready the request is deferred to the backlog, one per
    /// subsequent reply.
    pub fn make_requests<W: DriverWorker>(&mut self, worker: &mut W, timers: &mut Timers) {
        loop {
            if self.set.num_ready() == 0 {
                self.backlog += 1;
                return;
            }

            self.scratch.payload.clear();
            self.scratch.kind = 0;
            self.scratch.next_delay_us = self
                .controller
                .as_ref()
                .map(|c| c.delay_us())
                .unwrap_or(0);
            worker.make_request(&mut self.scratch);

            let delay = self.scratch.next_delay_us;
            self.send_scratch();
            if delay != 0 {
                if !self.next_request_armed {
                    timers.schedule(Duration::from_micros(delay), TimerKind::NextRequest);
                    self.next_request_armed = true;
                }
                return;
            }
        }
    }

    fn send_scratch(&mut self) {
        let id = self.set.next_ready().expect("checked by caller");
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        self.conns[id].issue_request(
            self.scratch.kind,
            request_id,
            &self.scratch.payload,
            &mut self.stats,
        );

        if self.conns[id].is_closed() || self.conns[id].outstanding() >= self.max_depth {
            self.set.mark_saturated(id);
        }
    }

    /// Socket readiness on one of the connections.
    pub fn handle_event<W: DriverWorker>(
        &mut self,
        token: Token,
        readable: bool,
        writable: bool,
        worker: &mut W,
        timers: &mut Timers,
    ) {
        let id = token.0 - self.first_token;
        if id >= self.conns.len() {
            return;
        }

        if readable && !self.conns[id].is_closed() {
            match self.conns[id].fill() {
                Ok(_) | Err(WireError::Wait) => (),
                Err(err) => {
                    logging::warn!(self.log, "service connection lost";
                                   "conn" => id, "error" => %err);
                    if self.set.is_ready(id) {
                        self.set.mark_saturated(id);
                    }
                }
            }

            loop {
                let frame = self.conns[id].take_reply();
                let (header, payload) = match frame {
                    Some(frame) => frame,
                    None => break,
                };

                let now = time::monotonic_ns();
                self.stats.log_response(&header, now);

                let reply = ResponseContext {
                    kind: header.kind,
                    request_id: header.request_id,
                    payload: &payload,
                    timed_out: false,
                    request_timestamp: header.start_time,
                    response_timestamp: now,
                };
                worker.on_reply(&reply);

                if !self.conns[id].is_closed() && !self.set.is_ready(id) {
                    self.set.mark_ready(id);
                }

                if self.backlog > 0 {
                    self.make_requests(worker, timers);
                    self.backlog -= 1;
                }
            }
        }

        if writable {
            let _ = self.conns[id].flush();
        }
    }

    /// Inter-request delay elapsed.
    pub fn on_next_request<W: DriverWorker>(&mut self, worker: &mut W, timers: &mut Timers) {
        self.next_request_armed = false;
        self.make_requests(worker, timers);
    }

    /// Controller cadence: fold the last window's observed rate in.
    pub fn on_recompute(&mut self, timers: &mut Timers) {
        let observed = self.last_stats.window_qps();
        if let Some(controller) = self.controller.as_mut() {
            controller.observe(observed);
            logging::debug!(self.log, "pacing recomputed";
                            "observed_qps" => observed,
                            "delay_us" => controller.delay_us());
        }
        timers.schedule(RECOMPUTE_QPS_PERIOD, TimerKind::RecomputeQps);
    }

    /// Window snapshot: returns a copy of the live stats and resets them,
    /// retaining the copy for the controller.
    pub fn take_snapshot(&mut self) -> ChildStats {
        let mut snapshot = self.stats.clone();
        snapshot.end_time = time::monotonic_ns();
        self.last_stats = snapshot.clone();
        self.stats.reset();
        snapshot
    }

    pub fn flush_pending(&mut self) {
        for conn in self.conns.iter_mut() {
            if conn.has_egress() && !conn.is_closed() {
                let _ = conn.flush();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse::logging::discard;
    use std::net::TcpListener;

    #[test]
    fn test_conn_set_partition_swaps() {
        let mut set = ConnSet::new(3);
        assert_eq!(set.num_ready(), 3);
        assert!(set.is_ready(0) && set.is_ready(1) && set.is_ready(2));

        set.mark_saturated(0);
        assert_eq!(set.num_ready(), 2);
        assert!(!set.is_ready(0));
        assert!(set.is_ready(1) && set.is_ready(2));
        assert_ne!(set.next_ready(), Some(0));

        set.mark_saturated(2);
        set.mark_saturated(1);
        assert_eq!(set.num_ready(), 0);
        assert_eq!(set.next_ready(), None);

        set.mark_ready(1);
        assert_eq!(set.num_ready(), 1);
        assert_eq!(set.next_ready(), Some(1));
        assert!(set.is_ready(1));
        assert!(!set.is_ready(0) && !set.is_ready(2));
    }

    #[test]
    fn test_conn_set_positions_stay_consistent() {
        let mut set = ConnSet::new(4);

        set.mark_saturated(1);
        set.mark_saturated(3);
        set.mark_ready(1);
        set.mark_saturated(0);
        set.mark_ready(3);
        set.mark_ready(0);

        for id in 0..4 {
            let position = set.positions[id];
            assert_eq!(set.conns[position], id, "position index diverged");
        }
        assert_eq!(set.num_ready(), 4);
    }

    #[test]
    fn test_rate_controller_converges_under_overhead() {
        // The downstream adds 200us of effective per-request overhead, so an
        // uncorrected 1000us delay undershoots a 1000 QPS target.
        let mut controller = RateController::new(1000.0);
        let mut observed = 0.0;
        for _ in 0..3 {
            observed = 1e6 / (controller.delay_us() as f64 + 200.0);
            controller.observe(observed);
        }
        observed = 1e6 / (controller.delay_us() as f64 + 200.0);
        assert!(
            (observed - 1000.0).abs() / 1000.0 < 0.10,
            "rate {} not within 10% of target after three windows",
            observed
        );
    }

    #[test]
    fn test_rate_controller_recovers_from_idle_window() {
        let mut controller = RateController::new(100.0);
        let before = controller.delay_us();
        controller.observe(0.0);
        assert!(controller.delay_us() < before);
    }

    #[test]
    fn test_rate_controller_clamps_extremes() {
        let mut controller = RateController::new(1000.0);
        controller.observe(1_000_000.0);
        assert!(controller.delay_us() <= 8_000);
        for _ in 0..10 {
            controller.observe(0.1);
        }
        assert!(controller.delay_us() >= 125);
    }

    struct FixedWorker {
        made: u64,
    }

    impl DriverWorker for FixedWorker {
        fn make_request(&mut self, spec: &mut RequestSpec) {
            spec.kind = 1;
            spec.payload.extend_from_slice(b"abc");
            self.made += 1;
        }
    }

    #[test]
    fn test_generation_respects_depth_and_backlogs() {
        // A listener that never reads: requests pile up to max depth on
        // every connection and further generation defers to the backlog.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut tokens = TokenAlloc::new();
        let mut engine =
            DriverEngine::connect(&addr, 2, 3, 0.0, &[1], &mut tokens, discard()).unwrap();
        let mut timers = Timers::new();
        let mut worker = FixedWorker { made: 0 };

        engine.make_requests(&mut worker, &mut timers);

        assert_eq!(worker.made, 6, "2 connections x depth 3");
        assert_eq!(engine.max_outstanding(), 3);
        assert_eq!(engine.outstanding(0), 3);
        assert_eq!(engine.outstanding(1), 3);
        assert_eq!(engine.backlog(), 1);

        // Still saturated: another tick only grows the backlog.
        engine.make_requests(&mut worker, &mut timers);
        assert_eq!(worker.made, 6);
        assert_eq!(engine.backlog(), 2);
    }

    #[test]
    fn test_paced_generation_issues_one_and_arms_timer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut tokens = TokenAlloc::new();
        let mut engine =
            DriverEngine::connect(&addr, 1, 8, 100.0, &[1], &mut tokens, discard()).unwrap();
        let mut timers = Timers::new();
        let mut worker = FixedWorker { made: 0 };

        engine.start(&mut worker, &mut timers);

        assert_eq!(worker.made, 1);
        assert_eq!(engine.max_outstanding(), 1);
        // RecomputeQps plus the pending NextRequest.
        assert_eq!(timers.len(), 2);
    }
}

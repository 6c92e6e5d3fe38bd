//! Fanout issue and reply correlation. One upstream request triggers 1..N
//! child requests owning the contiguous id range `[starting, starting+N)`;
//! the tracker collects replies into dispatch-order slots until the last
//! reply lands or the deadline fires, whichever comes first. Trackers live
//! in id-indexed maps and removal from the maps is the single close point,
//! so connections never hold tracker references.

use crate::net::child::ChildConnection;
use crate::net::parent::QueryContext;
use crate::net::wire::WireError;
use crate::reactor::{TimerKind, Timers, TokenAlloc};
use crate::stats::ChildStats;
use hashbrown::HashMap;
use mio::{Poll, Token};
use pulse::logging::{self, Logger};
use pulse::time;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// One outgoing request of a fanout.
pub struct FanoutRequest<'a> {
    pub child: usize,
    pub kind: u32,
    pub payload: &'a [u8],
}

/// One slot of a tracker, in dispatch order. Initialized as timed out; a
/// reply flips the flag and deposits an owned copy of the payload.
#[derive(Debug)]
pub struct FanoutReply {
    pub timed_out: bool,
    pub child: usize,
    pub kind: u32,
    pub payload: Vec<u8>,
    pub latency_ms: f64,
}

/// User-visible view of a completed (or timed-out) fanout.
#[derive(Debug)]
pub struct FanoutReplyTracker {
    pub starting_request_id: u64,
    pub num_requests: u32,
    pub num_replies_received: u32,
    pub closed: bool,
    pub start_time: u64,
    pub replies: Vec<FanoutReply>,
}

/// Continuation invoked exactly once when a tracker closes. Receives the
/// worker state, the upstream query (to answer), and the reply view.
pub type FanoutDone<W> = fn(&mut W, QueryContext, &FanoutReplyTracker);

struct LiveTracker<W> {
    user: FanoutReplyTracker,
    done: FanoutDone<W>,
    origin: QueryContext,
}

/// Id-indexed tracker arena. `index` maps every outstanding request id to
/// its tracker's starting id; `live` owns the trackers themselves.
pub struct TrackerTable<W> {
    index: HashMap<u64, u64>,
    live: HashMap<u64, LiveTracker<W>>,
    next_request_id: u64,
    log: Logger,
}

impl<W> TrackerTable<W> {
    pub fn new(log: Logger) -> TrackerTable<W> {
        TrackerTable {
            index: HashMap::new(),
            live: HashMap::new(),
            next_request_id: 0,
            log,
        }
    }

    /// Reserves the next contiguous id range for `count` requests.
    pub fn allocate(&mut self, count: u32) -> u64 {
        let starting = self.next_request_id;
        self.next_request_id += u64::from(count);
        starting
    }

    /// Registers a tracker for an already-issued id range. `slots` carries
    /// the (child, kind) of each request in dispatch order.
    pub fn register(
        &mut self,
        starting: u64,
        slots: Vec<(usize, u32)>,
        done: FanoutDone<W>,
        origin: QueryContext,
    ) {
        let num_requests = slots.len() as u32;
        debug_assert!(num_requests > 0, "empty fanout");

        let replies = slots
            .into_iter()
            .map(|(child, kind)| FanoutReply {
                timed_out: true,
                child,
                kind,
                payload: Vec::new(),
                latency_ms: 0.0,
            })
            .collect();

        for i in 0..u64::from(num_requests) {
            let previous = self.index.insert(starting + i, starting);
            debug_assert!(previous.is_none(), "request id {} reused", starting + i);
        }

        self.live.insert(
            starting,
            LiveTracker {
                user: FanoutReplyTracker {
                    starting_request_id: starting,
                    num_requests,
                    num_replies_received: 0,
                    closed: false,
                    start_time: time::monotonic_ns(),
                    replies,
                },
                done,
                origin,
            },
        );
    }

    /// Routes one child reply to its slot. Replies for unknown ids (late or
    /// stray) are dropped silently. Returns whether the reply was consumed.
    pub fn on_reply(
        &mut self,
        worker: &mut W,
        request_id: u64,
        payload: Vec<u8>,
        request_ts: u64,
        response_ts: u64,
    ) -> bool {
        let starting = match self.index.get(&request_id) {
            Some(&starting) => starting,
            None => return false,
        };

        let finished = {
            let tracker = self.live.get_mut(&starting).expect("index without tracker");
            let slot = (request_id - starting) as usize;
            debug_assert!(slot < tracker.user.replies.len());

            let reply = &mut tracker.user.replies[slot];
            debug_assert!(reply.timed_out, "duplicate reply for id {}", request_id);
            reply.timed_out = false;
            reply.payload = payload;
            reply.latency_ms = response_ts.saturating_sub(request_ts) as f64 / 1e6;

            tracker.user.num_replies_received += 1;
            tracker.user.num_replies_received == tracker.user.num_requests
        };

        if finished {
            self.close(worker, starting);
        }
        true
    }

    /// Deadline handler. A tracker that already closed is a lazy-cancelled
    /// timer and is ignored. Slots still missing count as dropped requests
    /// against their target child.
    pub fn on_timeout(
        &mut self,
        worker: &mut W,
        starting: u64,
        stats: &mut [ChildStats],
    ) -> bool {
        {
            let tracker = match self.live.get(&starting) {
                Some(tracker) => tracker,
                None => return false,
            };

            for reply in &tracker.user.replies {
                if reply.timed_out {
                    stats[reply.child].log_dropped(reply.kind);
                }
            }

            logging::debug!(self.log, "fanout deadline fired";
                            "starting_id" => starting,
                            "received" => tracker.user.num_replies_received,
                            "expected" => tracker.user.num_requests);
        }

        self.close(worker, starting);
        true
    }

    fn close(&mut self, worker: &mut W, starting: u64) {
        let mut tracker = self.live.remove(&starting).expect("closing unknown tracker");
        for i in 0..u64::from(tracker.user.num_requests) {
            self.index.remove(&(starting + i));
        }

        tracker.user.closed = true;
        (tracker.done)(worker, tracker.origin, &tracker.user);
    }

    /// Closes every live tracker as timed out. Used on shutdown so
    /// continuations still observe their fanouts.
    pub fn drain(&mut self, worker: &mut W) {
        let pending: Vec<u64> = self.live.keys().copied().collect();
        for starting in pending {
            self.close(worker, starting);
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

struct ChildPool {
    tokens: Vec<Token>,
    cursor: usize,
}

/// Per-reactor fanout state: the configured children, their connection
/// pools, per-child stats, and the tracker table.
pub struct FanoutManager<W> {
    endpoints: Vec<SocketAddr>,
    names: Vec<String>,
    pools: Vec<ChildPool>,
    conns: HashMap<usize, ChildConnection>,
    token_child: HashMap<usize, usize>,
    pub trackers: TrackerTable<W>,
    pub stats: Vec<ChildStats>,
    kinds: Vec<u32>,
    log: Logger,
}

impl<W> FanoutManager<W> {
    pub fn new(children: Vec<(String, SocketAddr)>, kinds: &[u32], log: Logger) -> FanoutManager<W> {
        let mut names = Vec::with_capacity(children.len());
        let mut endpoints = Vec::with_capacity(children.len());
        let mut pools = Vec::with_capacity(children.len());
        let mut stats = Vec::with_capacity(children.len());
        for (name, addr) in children {
            names.push(name);
            endpoints.push(addr);
            pools.push(ChildPool {
                tokens: Vec::new(),
                cursor: 0,
            });
            stats.push(ChildStats::new(kinds));
        }

        FanoutManager {
            endpoints,
            names,
            pools,
            conns: HashMap::new(),
            token_child: HashMap::new(),
            trackers: TrackerTable::new(log.clone()),
            stats,
            kinds: kinds.to_vec(),
            log,
        }
    }

    #[inline]
    pub fn num_children(&self) -> usize {
        self.endpoints.len()
    }

    #[inline]
    pub fn child_names(&self) -> &[String] {
        &self.names
    }

    /// Opens `count` connections to the given child, all owned by the
    /// calling reactor's poll.
    pub fn make_child_connections(
        &mut self,
        poll: &Poll,
        tokens: &mut TokenAlloc,
        child: usize,
        count: usize,
    ) -> io::Result<()> {
        assert!(child < self.endpoints.len(), "unknown child {}", child);

        for _ in 0..count {
            let token = tokens.next();
            let conn = ChildConnection::connect(
                &self.endpoints[child],
                token,
                self.log.new(logging::o!("child" => child)),
            )?;
            conn.register(poll)?;
            self.pools[child].tokens.push(token);
            self.conns.insert(token.0, conn);
            self.token_child.insert(token.0, child);
        }
        Ok(())
    }

    #[inline]
    pub fn owns_token(&self, token: Token) -> bool {
        self.conns.contains_key(&token.0)
    }

    fn pick_connection(&mut self, child: usize) -> Token {
        let pool = &mut self.pools[child];
        assert!(!pool.tokens.is_empty(), "no connections to child {}", child);

        let token = pool.tokens[pool.cursor];
        pool.cursor = (pool.cursor + 1) % pool.tokens.len();
        token
    }

    /// Issues `requests` and registers the tracker. Returns immediately;
    /// the continuation fires from the reply or timeout path.
    pub fn fanout(
        &mut self,
        origin: QueryContext,
        requests: &[FanoutRequest],
        done: FanoutDone<W>,
        timeout: Option<Duration>,
        timers: &mut Timers,
    ) {
        debug_assert!(!requests.is_empty());
        let starting = self.trackers.allocate(requests.len() as u32);

        let mut slots = Vec::with_capacity(requests.len());
        for (i, request) in requests.iter().enumerate() {
            assert!(
                self.kinds.contains(&request.kind),
                "request kind {} not registered",
                request.kind
            );

            let token = self.pick_connection(request.child);
            let conn = self.conns.get_mut(&token.0).expect("pool references live conn");
            conn.issue_request(
                request.kind,
                starting + i as u64,
                request.payload,
                &mut self.stats[request.child],
            );
            slots.push((request.child, request.kind));
        }

        self.trackers.register(starting, slots, done, origin);

        if let Some(timeout) = timeout {
            timers.schedule(timeout, TimerKind::FanoutTimeout { starting_id: starting });
        }
    }

    /// Issues one request per configured child.
    pub fn fanout_all(
        &mut self,
        origin: QueryContext,
        kind: u32,
        payload: &[u8],
        done: FanoutDone<W>,
        timeout: Option<Duration>,
        timers: &mut Timers,
    ) {
        let requests: Vec<FanoutRequest> = (0..self.num_children())
            .map(|child| FanoutRequest {
                child,
                kind,
                payload,
            })
            .collect();
        self.fanout(origin, &requests, done, timeout, timers);
    }

    /// Socket readiness on one of the child connections: drain replies into
    /// the tracker table and flush pending egress.
    pub fn handle_child_event(
        &mut self,
        token: Token,
        readable: bool,
        writable: bool,
        worker: &mut W,
    ) {
        let mut retire = false;

        if readable {
            match self.conns.get_mut(&token.0) {
                Some(conn) => match conn.fill() {
                    Ok(_) | Err(WireError::Wait) => (),
                    Err(WireError::Closed) => retire = true,
                    Err(err) => {
                        logging::warn!(self.log, "child connection error"; "error" => %err);
                        retire = true;
                    }
                },
                None => return,
            }

            loop {
                let frame = match self.conns.get_mut(&token.0) {
                    Some(conn) => conn.take_reply(),
                    None => break,
                };
                let (header, payload) = match frame {
                    Some(frame) => frame,
                    None => break,
                };

                let now = time::monotonic_ns();
                let child = self.token_child[&token.0];
                self.stats[child].log_response(&header, now);
                self.trackers
                    .on_reply(worker, header.request_id, payload, header.start_time, now);
            }
        }

        if writable {
            if let Some(conn) = self.conns.get_mut(&token.0) {
                match conn.flush() {
                    Ok(_) | Err(WireError::Wait) => (),
                    Err(_) => retire = true,
                }
            }
        }

        if retire {
            self.retire_connection(token);
        }
    }

    /// Deadline dispatch from the reactor's timer queue.
    pub fn on_timeout(&mut self, worker: &mut W, starting_id: u64) {
        self.trackers.on_timeout(worker, starting_id, &mut self.stats);
    }

    /// Flushes all connections with pending egress; the reactor calls this
    /// once per loop iteration.
    pub fn flush_pending(&mut self) {
        for conn in self.conns.values_mut() {
            if conn.has_egress() && !conn.is_closed() {
                let _ = conn.flush();
            }
        }
    }

    fn retire_connection(&mut self, token: Token) {
        if let Some(child) = self.token_child.remove(&token.0) {
            logging::warn!(self.log, "retiring closed child connection";
                           "child" => child, "token" => token.0);
            let pool = &mut self.pools[child];
            pool.tokens.retain(|t| *t != token);
            if pool.cursor >= pool.tokens.len() {
                pool.cursor = 0;
            }
        }
        self.conns.remove(&token.0);
    }
}

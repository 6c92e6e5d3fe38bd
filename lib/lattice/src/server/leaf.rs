//! Leaf node server: accepts upstream connections on the main thread, hands
//! descriptors to reactor threads round-robin, and answers requests through
//! a per-thread worker. With thread load balancing enabled, decoded queries
//! become tasks on lock-free per-reactor queues and idle reactors steal from
//! their siblings in a fixed rotation.

use crate::monitor::{self, Topology};
use crate::net::parent::{ParentConnection, QueryContext};
use crate::net::wire::WireError;
use crate::reactor::{
    Reactor, TimerKind, TokenAlloc, WakeHandle, INCOMING_TOKEN, WORK_TOKEN,
};
use crate::server::{
    bind_listener, ignore_sigpipe, IncomingQueue, ShutdownFlag, ACCEPT_BATCH,
};
use crate::stats::{drain_ready, ServerStats, SnapshotQueue, StatsHub, STATS_WINDOW_SECS};
use crossbeam_queue::ArrayQueue;
use indexmap::IndexMap;
use mio::{Events, Poll, PollOpt, Ready, Registration, Token};
use parking_lot::Mutex;
use pulse::logging::{self, Logger};
use std::io;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Task queue capacity per reactor; pushes beyond it fall back to inline
/// processing.
const TASK_QUEUE_CAPACITY: usize = 10_000;

const LISTENER_TOKEN: Token = Token(0);

/// Work-stealing knobs: rotate the victim cursor every `connections_batch`
/// dispatched tasks, process up to `requests_batch` tasks per wake.
#[derive(Clone, Copy, Debug)]
pub struct BalanceParams {
    pub connections_batch: usize,
    pub requests_batch: usize,
}

impl Default for BalanceParams {
    fn default() -> BalanceParams {
        BalanceParams {
            connections_batch: 1,
            requests_batch: 1,
        }
    }
}

pub struct LeafConfig {
    pub port: u16,
    pub threads: usize,
    pub pin_threads: bool,
    pub balance: Option<BalanceParams>,
    pub kinds: Vec<u32>,
    pub monitor_port: Option<u16>,
    pub shutdown: ShutdownFlag,
}

/// Per-reactor workload hooks at a leaf.
pub trait LeafWorker: Send + 'static {
    fn startup(&mut self, _thread: usize) {}
    fn on_accept(&mut self, _thread: usize) {}
    /// Handle one request. Must answer via `ctx.send_response` exactly once.
    fn on_query(&mut self, ctx: &mut QueryContext);
}

/// State other threads may touch: descriptor handoff, the task queue, and
/// the wake handle for work.
struct LeafShared {
    incoming: IncomingQueue,
    tasks: ArrayQueue<QueryContext>,
    work_wake: WakeHandle,
}

struct ReactorSeed {
    incoming_reg: Registration,
    work_reg: Registration,
}

pub struct LeafServer<W, F> {
    config: LeafConfig,
    factory: F,
    listener: mio::net::TcpListener,
    hub: Arc<Mutex<StatsHub<ServerStats>>>,
    log: Logger,
    _worker: PhantomData<W>,
}

impl<W, F> LeafServer<W, F>
where
    W: LeafWorker,
    F: FnMut(usize) -> W,
{
    /// Binds the listening socket. Configuration problems (bad port, no
    /// threads) surface here, before any thread spawns.
    pub fn bind(config: LeafConfig, factory: F, log: Logger) -> io::Result<LeafServer<W, F>> {
        if config.threads == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "leaf server needs at least one reactor thread",
            ));
        }

        let listener = bind_listener(config.port)?;
        let hub = Arc::new(Mutex::new(StatsHub::new(ServerStats::new(&config.kinds))));

        Ok(LeafServer {
            config,
            factory,
            listener,
            hub,
            log,
            _worker: PhantomData,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats_hub(&self) -> Arc<Mutex<StatsHub<ServerStats>>> {
        Arc::clone(&self.hub)
    }

    /// Runs the acceptor/coordinator loop until the shutdown flag is set,
    /// then joins the reactors.
    pub fn run(mut self) -> io::Result<()> {
        ignore_sigpipe();

        let threads = self.config.threads;
        let mut shares = Vec::with_capacity(threads);
        let mut seeds = Vec::with_capacity(threads);
        for _ in 0..threads {
            let incoming = crate::reactor::wake_pair();
            let work = crate::reactor::wake_pair();
            shares.push(LeafShared {
                incoming: IncomingQueue::new(incoming.handle.clone()),
                tasks: ArrayQueue::new(TASK_QUEUE_CAPACITY),
                work_wake: work.handle.clone(),
            });
            seeds.push(ReactorSeed {
                incoming_reg: incoming.registration,
                work_reg: work.registration,
            });
        }
        let shares = Arc::new(shares);

        let snapshots: Vec<Arc<SnapshotQueue<ServerStats>>> =
            (0..threads).map(|_| Arc::new(SnapshotQueue::new())).collect();

        let mut handles = Vec::with_capacity(threads);
        for (thread_num, seed) in seeds.into_iter().enumerate() {
            let worker = (self.factory)(thread_num);
            let shares = Arc::clone(&shares);
            let snapshots = Arc::clone(&snapshots[thread_num]);
            let kinds = self.config.kinds.clone();
            let balance = self.config.balance;
            let pin = self.config.pin_threads;
            let shutdown = self.config.shutdown.clone();
            let log = self.log.new(logging::o!("thread" => thread_num));

            handles.push(
                thread::Builder::new()
                    .name(format!("leaf-{}", thread_num))
                    .spawn(move || {
                        leaf_thread_main(
                            thread_num, seed, shares, snapshots, worker, kinds, balance, pin,
                            shutdown, log,
                        )
                    })?,
            );
        }

        let monitor = match self.config.monitor_port {
            Some(port) => Some(monitor::spawn(
                port,
                Topology::Leaf,
                Arc::clone(&self.hub),
                self.config.shutdown.clone(),
                self.log.new(logging::o!("component" => "monitor")),
            )?),
            None => None,
        };

        logging::info!(self.log, "leaf server listening";
                       "addr" => %self.listener.local_addr()?,
                       "threads" => threads);

        // Acceptor + stats coordinator.
        let poll = Poll::new()?;
        poll.register(
            &self.listener,
            LISTENER_TOKEN,
            Ready::readable(),
            PollOpt::edge(),
        )?;
        let mut events = Events::with_capacity(64);
        let mut next_thread = 0;
        let mut last_drain = Instant::now();

        while !self.config.shutdown.is_set() {
            poll.poll(&mut events, Some(Duration::from_millis(250)))?;

            loop {
                match self.listener.accept() {
                    Ok((stream, peer)) => {
                        logging::debug!(self.log, "connection accepted";
                                        "peer" => %peer, "thread" => next_thread);
                        shares[next_thread].incoming.push(stream);
                        next_thread = (next_thread + 1) % threads;
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        logging::warn!(self.log, "accept failed"; "error" => %err);
                        break;
                    }
                }
            }

            if last_drain.elapsed() >= Duration::from_secs(STATS_WINDOW_SECS) {
                let refs: Vec<&SnapshotQueue<ServerStats>> =
                    snapshots.iter().map(|q| q.as_ref()).collect();
                drain_ready(&refs, &mut self.hub.lock());
                last_drain = Instant::now();
            }
        }

        for handle in handles {
            let _ = handle.join();
        }

        let refs: Vec<&SnapshotQueue<ServerStats>> =
            snapshots.iter().map(|q| q.as_ref()).collect();
        drain_ready(&refs, &mut self.hub.lock());

        if let Some(monitor) = monitor {
            monitor.join();
        }

        logging::info!(self.log, "leaf server stopped");
        Ok(())
    }
}

fn leaf_thread_main<W: LeafWorker>(
    thread_num: usize,
    seed: ReactorSeed,
    shares: Arc<Vec<LeafShared>>,
    snapshots: Arc<SnapshotQueue<ServerStats>>,
    mut worker: W,
    kinds: Vec<u32>,
    balance: Option<BalanceParams>,
    pin: bool,
    shutdown: ShutdownFlag,
    log: Logger,
) {
    if pin {
        crate::server::pin_current_thread(&log);
    }

    let mut reactor = Reactor::new(log.clone()).expect("reactor construction");
    reactor
        .poll
        .register(
            &seed.incoming_reg,
            INCOMING_TOKEN,
            Ready::readable(),
            PollOpt::edge(),
        )
        .expect("incoming wake registration");
    reactor
        .poll
        .register(&seed.work_reg, WORK_TOKEN, Ready::readable(), PollOpt::edge())
        .expect("work wake registration");

    let threads = shares.len();
    let me = &shares[thread_num];
    let mut tokens = TokenAlloc::new();
    let mut conns: IndexMap<usize, ParentConnection> = IndexMap::new();
    let mut stats = ServerStats::new(&kinds);
    // Work-stealing wake rotation starts at self, moving backwards.
    let mut victim = thread_num;

    reactor.timers.schedule(
        Duration::from_secs(STATS_WINDOW_SECS),
        TimerKind::StatsSnapshot,
    );

    worker.startup(thread_num);

    let mut events = Vec::new();
    let mut accepted = Vec::with_capacity(ACCEPT_BATCH);

    while !shutdown.is_set() {
        if let Err(err) = reactor.poll_into(&mut events) {
            logging::crit!(log, "poll failed"; "error" => %err);
            break;
        }

        // Statistics run ahead of everything else.
        let now = Instant::now();
        while let Some(kind) = reactor.timers.expired(now) {
            if kind == TimerKind::StatsSnapshot {
                snapshots.push(stats.clone());
                stats.reset();
                reactor.timers.schedule(
                    Duration::from_secs(STATS_WINDOW_SECS),
                    TimerKind::StatsSnapshot,
                );
            }
        }

        // Connection acceptance next: drain the descriptor handoff in small
        // batches so one burst cannot monopolize the loop.
        if events.iter().any(|e| e.token() == INCOMING_TOKEN) {
            loop {
                accepted.clear();
                me.incoming.drain_into(&mut accepted, ACCEPT_BATCH);
                if accepted.is_empty() {
                    break;
                }
                for stream in accepted.drain(..) {
                    let token = tokens.next();
                    match ParentConnection::accept(
                        stream,
                        token,
                        log.new(logging::o!("conn" => token.0)),
                    ) {
                        Ok(conn) => {
                            worker.on_accept(thread_num);
                            if let Err(err) = conn.register(&reactor.poll) {
                                logging::warn!(log, "registration failed"; "error" => %err);
                                continue;
                            }
                            conns.insert(token.0, conn);
                        }
                        Err(err) => {
                            logging::warn!(log, "could not adopt connection"; "error" => %err)
                        }
                    }
                }
            }
        }

        for event in &events {
            let token = event.token();
            match token {
                INCOMING_TOKEN => (),
                WORK_TOKEN => {
                    run_task_queue(
                        thread_num,
                        &shares,
                        &balance,
                        &mut worker,
                        &mut stats,
                    );
                }
                _ => {
                    let readiness = event.readiness();
                    if readiness.is_writable() {
                        if let Some(conn) = conns.get(&token.0) {
                            let _ = conn.flush();
                        }
                    }
                    if readiness.is_readable() {
                        handle_conn_readable(
                            token,
                            &mut conns,
                            &kinds,
                            &balance,
                            thread_num,
                            &shares,
                            &mut victim,
                            &mut worker,
                            &mut stats,
                            &log,
                        );
                    }
                }
            }
        }

        // Sweep pending egress and retire closed connections.
        for (_, conn) in conns.iter() {
            let _ = conn.flush();
        }
        conns.retain(|_, conn| {
            if conn.is_closed() {
                let _ = conn.deregister(&reactor.poll);
                false
            } else {
                true
            }
        });
    }

    // Sweep every task queue on the way out so no query context dies
    // unanswered; the last reactor to exit clears whatever remains.
    if balance.is_some() {
        for share in shares.iter() {
            while let Some(ctx) = share.tasks.pop() {
                process_query(&mut worker, &mut stats, ctx);
            }
        }
    }

    // Final partial window so nothing is lost at shutdown.
    snapshots.push(stats.clone());
    logging::debug!(log, "leaf reactor exiting"; "thread" => thread_num);
}

fn handle_conn_readable<W: LeafWorker>(
    token: Token,
    conns: &mut IndexMap<usize, ParentConnection>,
    kinds: &[u32],
    balance: &Option<BalanceParams>,
    thread_num: usize,
    shares: &Arc<Vec<LeafShared>>,
    victim: &mut usize,
    worker: &mut W,
    stats: &mut ServerStats,
    log: &Logger,
) {
    {
        let conn = match conns.get_mut(&token.0) {
            Some(conn) => conn,
            None => return,
        };
        match conn.fill() {
            Ok(_) | Err(WireError::Wait) | Err(WireError::Closed) => (),
            Err(err) => {
                logging::warn!(log, "connection error"; "token" => token.0, "error" => %err);
            }
        }
    }

    let threads = shares.len();
    let me = &shares[thread_num];
    let mut batch_index = 0usize;

    loop {
        let frame = match conns.get_mut(&token.0) {
            Some(conn) => conn.take_query(),
            None => return,
        };
        let (header, payload) = match frame {
            Some(frame) => frame,
            None => break,
        };

        if !kinds.contains(&header.kind) {
            logging::warn!(log, "dropping request of unregistered kind";
                           "kind" => header.kind, "request_id" => header.request_id);
            continue;
        }

        stats.log_query(header.kind, header.packet_len());
        let sender = conns
            .get(&token.0)
            .expect("connection present while decoding")
            .sender();
        let ctx = QueryContext::new(header, payload, sender, log.clone());

        match balance {
            None => process_query(worker, stats, ctx),
            Some(params) => {
                let was_empty = me.tasks.is_empty();
                match me.tasks.push(ctx) {
                    Ok(()) => {
                        if batch_index == 0 && was_empty {
                            // First task into an empty queue: wake self.
                            me.work_wake.wake();
                        } else if batch_index % params.connections_batch == 0 {
                            shares[*victim].work_wake.wake();
                            *victim = (threads + *victim - 1) % threads;
                        }
                    }
                    Err(ctx) => {
                        // Queue full; shed the balancing and answer inline.
                        process_query(worker, stats, ctx);
                    }
                }
            }
        }
        batch_index += 1;
    }
}

/// Drains the own queue, then walks the siblings' queues in a fixed
/// rotation. Processing is bounded per wake; leftover work re-wakes self.
fn run_task_queue<W: LeafWorker>(
    thread_num: usize,
    shares: &Arc<Vec<LeafShared>>,
    balance: &Option<BalanceParams>,
    worker: &mut W,
    stats: &mut ServerStats,
) {
    let params = match balance {
        Some(params) => *params,
        None => return,
    };

    let threads = shares.len();
    let me = &shares[thread_num];
    me.work_wake.clear();

    let mut processed = 0;
    for offset in 0..threads {
        let queue = &shares[(thread_num + offset) % threads].tasks;
        while let Some(ctx) = queue.pop() {
            process_query(worker, stats, ctx);
            processed += 1;
            if processed >= params.requests_batch {
                me.work_wake.wake();
                return;
            }
        }
    }
}

fn process_query<W: LeafWorker>(worker: &mut W, stats: &mut ServerStats, mut ctx: QueryContext) {
    worker.on_query(&mut ctx);
    if let Some(header) = ctx.sent_response() {
        stats.log_response(header);
    }
}

//! Parent (aggregator) server: same acceptor/reactor structure as the leaf,
//! but each reactor owns a fanout manager bound to the configured children.
//! Handlers run inline and typically answer upstream from the fanout
//! continuation.

use crate::fanout::{FanoutDone, FanoutManager, FanoutRequest};
use crate::monitor::{self, Topology};
use crate::net::parent::{ParentConnection, QueryContext};
use crate::net::wire::WireError;
use crate::reactor::{Reactor, TimerKind, Timers, TokenAlloc, INCOMING_TOKEN};
use crate::server::{
    bind_listener, ignore_sigpipe, parse_endpoint, resolve_ipv4, IncomingQueue, ShutdownFlag,
    ACCEPT_BATCH,
};
use crate::stats::{drain_ready, ChildStats, SnapshotQueue, StatsHub, STATS_WINDOW_SECS};
use indexmap::IndexMap;
use mio::{Events, Poll, PollOpt, Ready, Registration, Token};
use parking_lot::Mutex;
use pulse::logging::{self, Logger};
use pulse::time;
use std::io;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const LISTENER_TOKEN: Token = Token(0);

pub struct ParentConfig {
    pub port: u16,
    pub threads: usize,
    pub pin_threads: bool,
    /// Children as `host[:port]` specs, resolved at bind time.
    pub children: Vec<String>,
    pub kinds: Vec<u32>,
    pub monitor_port: Option<u16>,
    pub shutdown: ShutdownFlag,
}

/// Reactor-side capabilities handed to parent handlers: opening child
/// connections and issuing fanouts.
pub struct FanoutCtx<'a, W: ParentWorker> {
    manager: &'a mut FanoutManager<W>,
    timers: &'a mut Timers,
    poll: &'a Poll,
    tokens: &'a mut TokenAlloc,
}

impl<'a, W: ParentWorker> FanoutCtx<'a, W> {
    #[inline]
    pub fn num_children(&self) -> usize {
        self.manager.num_children()
    }

    /// Opens `count` outbound connections to the given child, owned by this
    /// reactor.
    pub fn make_child_connections(&mut self, child: usize, count: usize) -> io::Result<()> {
        self.manager
            .make_child_connections(self.poll, self.tokens, child, count)
    }

    pub fn fanout(
        &mut self,
        origin: QueryContext,
        requests: &[FanoutRequest],
        done: FanoutDone<W>,
        timeout: Option<Duration>,
    ) {
        self.manager
            .fanout(origin, requests, done, timeout, self.timers);
    }

    pub fn fanout_all(
        &mut self,
        origin: QueryContext,
        kind: u32,
        payload: &[u8],
        done: FanoutDone<W>,
        timeout: Option<Duration>,
    ) {
        self.manager
            .fanout_all(origin, kind, payload, done, timeout, self.timers);
    }
}

/// Per-reactor workload hooks at a parent.
pub trait ParentWorker: Sized + Send + 'static {
    /// Runs once inside the reactor thread; the usual place to call
    /// `make_child_connections`.
    fn startup(&mut self, _thread: usize, _fanout: &mut FanoutCtx<Self>) {}
    /// Handle one upstream request, usually by issuing a fanout that moves
    /// `ctx` into the tracker.
    fn on_query(&mut self, fanout: &mut FanoutCtx<Self>, ctx: QueryContext);
}

struct ParentShared {
    incoming: IncomingQueue,
}

pub struct ParentServer<W, F> {
    config: ParentConfig,
    factory: F,
    listener: mio::net::TcpListener,
    children: Vec<(String, SocketAddr)>,
    hub: Arc<Mutex<StatsHub<Vec<ChildStats>>>>,
    log: Logger,
    _worker: PhantomData<W>,
}

impl<W, F> ParentServer<W, F>
where
    W: ParentWorker,
    F: FnMut(usize) -> W,
{
    /// Binds the listener and resolves every child endpoint. Any resolution
    /// failure aborts startup.
    pub fn bind(config: ParentConfig, factory: F, log: Logger) -> io::Result<ParentServer<W, F>> {
        if config.threads == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "parent server needs at least one reactor thread",
            ));
        }
        if config.children.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "parent server needs at least one child",
            ));
        }

        let mut children = Vec::with_capacity(config.children.len());
        for spec in &config.children {
            let (host, port) = parse_endpoint(spec);
            let addr = resolve_ipv4(&host, port)?;
            children.push((spec.clone(), addr));
        }

        let listener = bind_listener(config.port)?;
        let zero: Vec<ChildStats> = children
            .iter()
            .map(|_| ChildStats::new(&config.kinds))
            .collect();
        let hub = Arc::new(Mutex::new(StatsHub::new(zero)));

        Ok(ParentServer {
            config,
            factory,
            listener,
            children,
            hub,
            log,
            _worker: PhantomData,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats_hub(&self) -> Arc<Mutex<StatsHub<Vec<ChildStats>>>> {
        Arc::clone(&self.hub)
    }

    pub fn run(mut self) -> io::Result<()> {
        ignore_sigpipe();

        let threads = self.config.threads;
        let mut shares = Vec::with_capacity(threads);
        let mut seeds = Vec::with_capacity(threads);
        for _ in 0..threads {
            let incoming = crate::reactor::wake_pair();
            shares.push(ParentShared {
                incoming: IncomingQueue::new(incoming.handle.clone()),
            });
            seeds.push(incoming.registration);
        }
        let shares = Arc::new(shares);

        let snapshots: Vec<Arc<SnapshotQueue<Vec<ChildStats>>>> =
            (0..threads).map(|_| Arc::new(SnapshotQueue::new())).collect();

        let mut handles = Vec::with_capacity(threads);
        for (thread_num, seed) in seeds.into_iter().enumerate() {
            let worker = (self.factory)(thread_num);
            let shares = Arc::clone(&shares);
            let snapshots = Arc::clone(&snapshots[thread_num]);
            let children = self.children.clone();
            let kinds = self.config.kinds.clone();
            let pin = self.config.pin_threads;
            let shutdown = self.config.shutdown.clone();
            let log = self.log.new(logging::o!("thread" => thread_num));

            handles.push(
                thread::Builder::new()
                    .name(format!("parent-{}", thread_num))
                    .spawn(move || {
                        parent_thread_main(
                            thread_num, seed, shares, snapshots, worker, children, kinds, pin,
                            shutdown, log,
                        )
                    })?,
            );
        }

        let monitor = match self.config.monitor_port {
            Some(port) => Some(monitor::spawn(
                port,
                Topology::Parent {
                    children: self.children.iter().map(|(name, _)| name.clone()).collect(),
                },
                Arc::clone(&self.hub),
                self.config.shutdown.clone(),
                self.log.new(logging::o!("component" => "monitor")),
            )?),
            None => None,
        };

        logging::info!(self.log, "parent server listening";
                       "addr" => %self.listener.local_addr()?,
                       "children" => self.children.len(),
                       "threads" => threads);

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
                        logging::debug!(self.log, "upstream connected";
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
                let refs: Vec<&SnapshotQueue<Vec<ChildStats>>> =
                    snapshots.iter().map(|q| q.as_ref()).collect();
                drain_ready(&refs, &mut self.hub.lock());
                last_drain = Instant::now();
            }
        }

        for handle in handles {
            let _ = handle.join();
        }

        let refs: Vec<&SnapshotQueue<Vec<ChildStats>>> =
            snapshots.iter().map(|q| q.as_ref()).collect();
        drain_ready(&refs, &mut self.hub.lock());

        if let Some(monitor) = monitor {
            monitor.join();
        }

        logging::info!(self.log, "parent server stopped");
        Ok(())
    }
}

fn parent_thread_main<W: ParentWorker>(
    thread_num: usize,
    seed: Registration,
    shares: Arc<Vec<ParentShared>>,
    snapshots: Arc<SnapshotQueue<Vec<ChildStats>>>,
    mut worker: W,
    children: Vec<(String, SocketAddr)>,
    kinds: Vec<u32>,
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
        .register(&seed, INCOMING_TOKEN, Ready::readable(), PollOpt::edge())
        .expect("incoming wake registration");

    let me = &shares[thread_num];
    let mut tokens = TokenAlloc::new();
    let mut conns: IndexMap<usize, ParentConnection> = IndexMap::new();
    let mut manager: FanoutManager<W> = FanoutManager::new(
        children,
        &kinds,
        log.new(logging::o!("component" => "fanout")),
    );

    reactor.timers.schedule(
        Duration::from_secs(STATS_WINDOW_SECS),
        TimerKind::StatsSnapshot,
    );

    {
        let mut fctx = FanoutCtx {
            manager: &mut manager,
            timers: &mut reactor.timers,
            poll: &reactor.poll,
            tokens: &mut tokens,
        };
        worker.startup(thread_num, &mut fctx);
    }

    let mut events = Vec::new();
    let mut accepted = Vec::with_capacity(ACCEPT_BATCH);

    while !shutdown.is_set() {
        if let Err(err) = reactor.poll_into(&mut events) {
            logging::crit!(log, "poll failed"; "error" => %err);
            break;
        }

        let now = Instant::now();
        while let Some(kind) = reactor.timers.expired(now) {
            match kind {
                TimerKind::StatsSnapshot => {
                    snapshots.push(take_child_snapshot(&mut manager));
                    reactor.timers.schedule(
                        Duration::from_secs(STATS_WINDOW_SECS),
                        TimerKind::StatsSnapshot,
                    );
                }
                TimerKind::FanoutTimeout { starting_id } => {
                    manager.on_timeout(&mut worker, starting_id);
                }
                _ => (),
            }
        }

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
            if token == INCOMING_TOKEN {
                continue;
            }
            let readiness = event.readiness();

            if manager.owns_token(token) {
                manager.handle_child_event(
                    token,
                    readiness.is_readable(),
                    readiness.is_writable(),
                    &mut worker,
                );
                continue;
            }

            if readiness.is_writable() {
                if let Some(conn) = conns.get(&token.0) {
                    let _ = conn.flush();
                }
            }
            if readiness.is_readable() {
                handle_upstream_readable(
                    token,
                    &mut conns,
                    &kinds,
                    &mut manager,
                    &mut reactor,
                    &mut tokens,
                    &mut worker,
                    &log,
                );
            }
        }

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
        manager.flush_pending();
    }

    // Shutdown: observers still see their fanouts complete, marked missing.
    manager.trackers.drain(&mut worker);
    snapshots.push(take_child_snapshot(&mut manager));
    logging::debug!(log, "parent reactor exiting"; "thread" => thread_num);
}

fn take_child_snapshot<W>(manager: &mut FanoutManager<W>) -> Vec<ChildStats> {
    let now = time::monotonic_ns();
    let mut snapshot = manager.stats.clone();
    for child in snapshot.iter_mut() {
        child.end_time = now;
    }
    for child in manager.stats.iter_mut() {
        child.reset();
    }
    snapshot
}

fn handle_upstream_readable<W: ParentWorker>(
    token: Token,
    conns: &mut IndexMap<usize, ParentConnection>,
    kinds: &[u32],
    manager: &mut FanoutManager<W>,
    reactor: &mut Reactor,
    tokens: &mut TokenAlloc,
    worker: &mut W,
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
                logging::warn!(log, "upstream connection error";
                               "token" => token.0, "error" => %err);
            }
        }
    }

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

        let sender = conns
            .get(&token.0)
            .expect("connection present while decoding")
            .sender();
        let ctx = QueryContext::new(header, payload, sender, log.clone());

        let mut fctx = FanoutCtx {
            manager,
            timers: &mut reactor.timers,
            poll: &reactor.poll,
            tokens,
        };
        worker.on_query(&mut fctx, ctx);
    }
}

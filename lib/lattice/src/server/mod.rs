//! Role orchestrators: the main-thread acceptor/coordinator loops and the
//! reactor thread pools behind the leaf server, parent server, and driver
//! node.

pub mod driver;
pub mod leaf;
pub mod parent;

pub use self::driver::{DriverConfig, DriverNode};
pub use self::leaf::{BalanceParams, LeafConfig, LeafServer, LeafWorker};
pub use self::parent::{FanoutCtx, ParentConfig, ParentServer, ParentWorker};

use crate::reactor::WakeHandle;
use mio::net::TcpStream;
use parking_lot::Mutex;
use pulse::logging::{self, Logger};
use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Default service port when an endpoint spec omits one.
pub const DEFAULT_PORT: u16 = 11222;

/// Descriptors handed from the acceptor to a reactor per wakeup.
pub const ACCEPT_BATCH: usize = 10;

/// Process-wide stop signal. Reactors check it between events; poll sleeps
/// are bounded, so every loop observes it well within a second.
#[derive(Clone)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> ShutdownFlag {
        ShutdownFlag(Arc::new(AtomicBool::new(false)))
    }

    #[inline]
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownFlag {
    fn default() -> ShutdownFlag {
        ShutdownFlag::new()
    }
}

/// Routes SIGINT to the shutdown flag. Safe to call once per process; the
/// binaries do, tests drive the flag directly.
pub fn install_signal_handler(flag: ShutdownFlag, log: &Logger) {
    if let Err(err) = ctrlc::set_handler(move || flag.set()) {
        logging::warn!(log, "could not install SIGINT handler"; "error" => %err);
    }
}

/// A peer disappearing mid-write must surface as an error, not a signal.
pub fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

static NEXT_CORE: AtomicUsize = AtomicUsize::new(0);

/// Pins the calling reactor thread to the next CPU in the allowed set,
/// round-robin from the last assignment.
pub fn pin_current_thread(log: &Logger) {
    let cores = match core_affinity::get_core_ids() {
        Some(cores) if !cores.is_empty() => cores,
        _ => {
            logging::warn!(log, "no pinnable cores reported; running unpinned");
            return;
        }
    };

    let slot = NEXT_CORE.fetch_add(1, Ordering::Relaxed) % cores.len();
    let core = cores[slot];
    if core_affinity::set_for_current(core) {
        logging::debug!(log, "reactor pinned"; "core" => core.id);
    } else {
        logging::warn!(log, "pinning failed"; "core" => core.id);
    }
}

/// Splits a `host[:port]` spec, falling back to the default service port.
pub fn parse_endpoint(spec: &str) -> (String, u16) {
    match spec.rfind(':') {
        Some(split) => {
            let (host, port) = spec.split_at(split);
            match port[1..].parse() {
                Ok(port) => (host.to_string(), port),
                Err(_) => (spec.to_string(), DEFAULT_PORT),
            }
        }
        None => (spec.to_string(), DEFAULT_PORT),
    }
}

/// Resolves a hostname to its first IPv4 address. Resolution failure is a
/// startup-fatal configuration error for every role.
pub fn resolve_ipv4(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .find(|addr| addr.is_ipv4())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{} has no IPv4 address", host),
            )
        })
}

/// Binds the role's listening socket on all interfaces.
pub fn bind_listener(port: u16) -> io::Result<mio::net::TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    mio::net::TcpListener::bind(&addr)
}

/// Descriptor handoff queue between the acceptor thread and one reactor.
/// The mutex guards only the deque; the wake handle rouses the reactor.
pub struct IncomingQueue {
    streams: Mutex<VecDeque<TcpStream>>,
    wake: WakeHandle,
}

impl IncomingQueue {
    pub fn new(wake: WakeHandle) -> IncomingQueue {
        IncomingQueue {
            streams: Mutex::new(VecDeque::new()),
            wake,
        }
    }

    /// Acceptor side: enqueue and rouse the owning reactor.
    pub fn push(&self, stream: TcpStream) {
        self.streams.lock().push_back(stream);
        self.wake.wake();
    }

    /// Reactor side: clear the wake and take up to `max` descriptors.
    pub fn drain_into(&self, out: &mut Vec<TcpStream>, max: usize) {
        self.wake.clear();
        let mut streams = self.streams.lock();
        for _ in 0..max {
            match streams.pop_front() {
                Some(stream) => out.push(stream),
                None => break,
            }
        }
    }
}

//! Per-thread event loop machinery: the poll, a binary-heap timer queue, and
//! user-event wake points. One reactor thread owns one `Reactor` plus a
//! disjoint set of connections for their whole lifetime; everything here is
//! single-threaded except the `WakeHandle`s, which other threads ping.

use mio::event::Event;
use mio::{Events, Poll, PollOpt, Ready, Registration, SetReadiness, Token};
use pulse::logging::Logger;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::time::{Duration, Instant};

/// Wake point for the acceptor's descriptor handoff.
pub const INCOMING_TOKEN: Token = Token(0);
/// Wake point for the work-stealing task queues.
pub const WORK_TOKEN: Token = Token(1);
/// First token handed out for connections.
pub const FIRST_CONN_TOKEN: usize = 8;

/// Upper bound on one poll sleep. Keeps the shutdown flag observed promptly
/// and stands in for the original's forced keep-alive timer.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Timer payloads. Cancellation is lazy: a fired timer whose subject no
/// longer exists is simply ignored by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Copy the live stats into the snapshot queue and reset.
    StatsSnapshot,
    /// Fanout deadline for the tracker rooted at this request id.
    FanoutTimeout { starting_id: u64 },
    /// Driver inter-request delay elapsed.
    NextRequest,
    /// Recompute the driver's pacing delay from the last window.
    RecomputeQps,
}

struct TimerEntry {
    at: Instant,
    seq: u64,
    kind: TimerKind,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &TimerEntry) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &TimerEntry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &TimerEntry) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Deadline queue owned by one reactor.
pub struct Timers {
    heap: BinaryHeap<TimerEntry>,
    seq: u64,
}

impl Timers {
    pub fn new() -> Timers {
        Timers {
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }

    pub fn schedule(&mut self, delay: Duration, kind: TimerKind) {
        self.schedule_at(Instant::now() + delay, kind);
    }

    pub fn schedule_at(&mut self, at: Instant, kind: TimerKind) {
        self.heap.push(TimerEntry {
            at,
            seq: self.seq,
            kind,
        });
        self.seq += 1;
    }

    /// Pops the next timer if its deadline has passed.
    pub fn expired(&mut self, now: Instant) -> Option<TimerKind> {
        match self.heap.peek() {
            Some(entry) if entry.at <= now => Some(self.heap.pop().unwrap().kind),
            _ => None,
        }
    }

    /// How long the poll may sleep without missing a deadline, capped.
    pub fn poll_timeout(&self, now: Instant, cap: Duration) -> Duration {
        match self.heap.peek() {
            Some(entry) if entry.at <= now => Duration::from_millis(0),
            Some(entry) => cap.min(entry.at - now),
            None => cap,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}

/// Cross-thread wake signal. Producers call `wake`; the owning reactor
/// clears the readiness before draining whatever queue the wake guards.
#[derive(Clone)]
pub struct WakeHandle {
    ready: SetReadiness,
}

impl WakeHandle {
    pub fn wake(&self) {
        let _ = self.ready.set_readiness(Ready::readable());
    }

    pub fn clear(&self) {
        let _ = self.ready.set_readiness(Ready::empty());
    }
}

/// Registration half plus the shareable wake handle.
pub struct WakePair {
    pub registration: Registration,
    pub handle: WakeHandle,
}

pub fn wake_pair() -> WakePair {
    let (registration, ready) = Registration::new2();
    WakePair {
        registration,
        handle: WakeHandle { ready },
    }
}

/// Monotone token allocator for a reactor's connections.
pub struct TokenAlloc {
    next: usize,
}

impl TokenAlloc {
    pub fn new() -> TokenAlloc {
        TokenAlloc {
            next: FIRST_CONN_TOKEN,
        }
    }

    pub fn next(&mut self) -> Token {
        let token = Token(self.next);
        self.next += 1;
        token
    }
}

/// The poll plus its timer queue. Event handling order is up to the caller;
/// role loops process timers first (statistics), then descriptor handoff,
/// then socket readiness, mirroring the priority scheme of the original
/// event bases.
pub struct Reactor {
    pub poll: Poll,
    pub timers: Timers,
    events: Events,
    #[allow(dead_code)]
    log: Logger,
}

impl Reactor {
    pub fn new(log: Logger) -> io::Result<Reactor> {
        Ok(Reactor {
            poll: Poll::new()?,
            timers: Timers::new(),
            events: Events::with_capacity(1024),
            log,
        })
    }

    pub fn register_wake(&self, pair: &WakePair, token: Token) -> io::Result<()> {
        self.poll
            .register(&pair.registration, token, Ready::readable(), PollOpt::edge())
    }

    /// Sleeps until readiness or the next deadline, then copies the ready
    /// events into `out` so the caller can dispatch while mutating itself.
    pub fn poll_into(&mut self, out: &mut Vec<Event>) -> io::Result<()> {
        let timeout = self.timers.poll_timeout(Instant::now(), MAX_POLL_INTERVAL);
        self.poll.poll(&mut self.events, Some(timeout))?;

        out.clear();
        for event in &self.events {
            out.push(event);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let mut timers = Timers::new();
        let now = Instant::now();

        timers.schedule_at(now + Duration::from_millis(30), TimerKind::NextRequest);
        timers.schedule_at(now + Duration::from_millis(10), TimerKind::StatsSnapshot);
        timers.schedule_at(
            now + Duration::from_millis(20),
            TimerKind::FanoutTimeout { starting_id: 4 },
        );

        let later = now + Duration::from_millis(60);
        assert_eq!(timers.expired(later), Some(TimerKind::StatsSnapshot));
        assert_eq!(
            timers.expired(later),
            Some(TimerKind::FanoutTimeout { starting_id: 4 })
        );
        assert_eq!(timers.expired(later), Some(TimerKind::NextRequest));
        assert_eq!(timers.expired(later), None);
    }

    #[test]
    fn test_equal_deadlines_fire_in_schedule_order() {
        let mut timers = Timers::new();
        let at = Instant::now();

        timers.schedule_at(at, TimerKind::NextRequest);
        timers.schedule_at(at, TimerKind::RecomputeQps);

        assert_eq!(timers.expired(at), Some(TimerKind::NextRequest));
        assert_eq!(timers.expired(at), Some(TimerKind::RecomputeQps));
    }

    #[test]
    fn test_poll_timeout_is_capped_and_clamped() {
        let mut timers = Timers::new();
        let now = Instant::now();

        assert_eq!(timers.poll_timeout(now, MAX_POLL_INTERVAL), MAX_POLL_INTERVAL);

        timers.schedule_at(now + Duration::from_millis(5), TimerKind::NextRequest);
        assert!(timers.poll_timeout(now, MAX_POLL_INTERVAL) <= Duration::from_millis(5));

        // An overdue timer means no sleeping at all.
        assert_eq!(
            timers.poll_timeout(now + Duration::from_millis(10), MAX_POLL_INTERVAL),
            Duration::from_millis(0)
        );
    }

    #[test]
    fn test_wake_rouses_a_polling_reactor() {
        let mut reactor = Reactor::new(pulse::logging::discard()).unwrap();
        let pair = wake_pair();
        reactor.register_wake(&pair, INCOMING_TOKEN).unwrap();

        let handle = pair.handle.clone();
        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            handle.wake();
        });

        let mut events = Vec::new();
        let mut woke = false;
        for _ in 0..20 {
            reactor.poll_into(&mut events).unwrap();
            if events.iter().any(|e| e.token() == INCOMING_TOKEN) {
                woke = true;
                break;
            }
        }
        waker.join().unwrap();
        assert!(woke);

        pair.handle.clear();
    }

    #[test]
    fn test_token_alloc_is_monotone() {
        let mut alloc = TokenAlloc::new();
        let a = alloc.next();
        let b = alloc.next();
        assert!(a.0 >= FIRST_CONN_TOKEN);
        assert_eq!(b.0, a.0 + 1);
    }
}

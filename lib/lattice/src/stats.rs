//! Per-kind statistics and the snapshot pipeline. Each reactor owns live
//! counters and pushes a copy onto its snapshot queue once per window; a
//! coordinator on the main thread merges equally-indexed snapshots from all
//! reactors into a bounded history ring plus a run-lifetime aggregate.

use crate::net::codec::{RequestHeader, ResponseHeader};
use parking_lot::Mutex;
use pulse::histogram::LogHistogram;
use pulse::time;
use serde_derive::Serialize;
use std::collections::{BTreeMap, VecDeque};

/// Snapshot cadence in seconds.
pub const STATS_WINDOW_SECS: u64 = 1;
/// History ring capacity: one hour of one-second windows.
pub const STATS_MAX_WINDOWS: usize = 3600;
/// Trailing windows the monitoring endpoint reports, in seconds.
pub const REPORT_WINDOWS: [usize; 8] = [1, 5, 30, 60, 300, 600, 1800, STATS_MAX_WINDOWS];

const CHILD_HISTOGRAM_BINS: usize = 1000;
const SERVER_HISTOGRAM_BINS: usize = 200;

/// Merge-and-reset behavior shared by snapshot payloads.
pub trait Accumulate {
    fn accumulate(&mut self, other: &Self);
    /// An empty value of the same shape (same kinds, zero counts).
    fn fresh(&self) -> Self;
}

/// Requester-side stats for traffic toward one downstream target: per-kind
/// end-to-end latency and reported processing time, byte counters, and
/// requests dropped by fanout timeouts.
#[derive(Clone, Debug)]
pub struct ChildStats {
    pub start_time: u64,
    pub end_time: u64,
    query_samplers: BTreeMap<u32, LogHistogram>,
    processing_samplers: BTreeMap<u32, LogHistogram>,
    tx_bytes: BTreeMap<u32, u64>,
    rx_bytes: BTreeMap<u32, u64>,
    query_counts: BTreeMap<u32, u64>,
    dropped: BTreeMap<u32, u64>,
}

impl ChildStats {
    pub fn new(kinds: &[u32]) -> ChildStats {
        let mut stats = ChildStats {
            start_time: time::monotonic_ns(),
            end_time: 0,
            query_samplers: BTreeMap::new(),
            processing_samplers: BTreeMap::new(),
            tx_bytes: BTreeMap::new(),
            rx_bytes: BTreeMap::new(),
            query_counts: BTreeMap::new(),
            dropped: BTreeMap::new(),
        };
        for &kind in kinds {
            stats
                .query_samplers
                .insert(kind, LogHistogram::new(CHILD_HISTOGRAM_BINS));
            stats
                .processing_samplers
                .insert(kind, LogHistogram::new(CHILD_HISTOGRAM_BINS));
            stats.tx_bytes.insert(kind, 0);
            stats.rx_bytes.insert(kind, 0);
            stats.query_counts.insert(kind, 0);
            stats.dropped.insert(kind, 0);
        }
        stats
    }

    pub fn kinds(&self) -> impl Iterator<Item = u32> + '_ {
        self.query_counts.keys().copied()
    }

    pub fn log_request(&mut self, header: &RequestHeader) {
        let kind = header.kind;
        *self.tx_bytes.get_mut(&kind).expect("unregistered kind") +=
            header.packet_len() as u64;
        *self.query_counts.get_mut(&kind).expect("unregistered kind") += 1;
    }

    pub fn log_response(&mut self, header: &ResponseHeader, received_ns: u64) {
        let kind = header.kind;
        let latency = received_ns.saturating_sub(header.start_time);
        self.query_samplers
            .get_mut(&kind)
            .expect("unregistered kind")
            .sample(latency as f64);
        self.processing_samplers
            .get_mut(&kind)
            .expect("unregistered kind")
            .sample(header.processing_time as f64);
        *self.rx_bytes.get_mut(&kind).expect("unregistered kind") +=
            header.packet_len() as u64;
    }

    pub fn log_dropped(&mut self, kind: u32) {
        *self.dropped.get_mut(&kind).expect("unregistered kind") += 1;
    }

    pub fn query_count(&self, kind: u32) -> u64 {
        self.query_counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn dropped_count(&self, kind: u32) -> u64 {
        self.dropped.get(&kind).copied().unwrap_or(0)
    }

    pub fn reply_count(&self, kind: u32) -> u64 {
        self.query_samplers.get(&kind).map(|s| s.total()).unwrap_or(0)
    }

    pub fn total_queries(&self) -> u64 {
        self.query_counts.values().sum()
    }

    pub fn latency_sampler(&self, kind: u32) -> Option<&LogHistogram> {
        self.query_samplers.get(&kind)
    }

    /// Queries per second over this snapshot's own window.
    pub fn window_qps(&self) -> f64 {
        let end = if self.end_time > self.start_time {
            self.end_time
        } else {
            time::monotonic_ns()
        };
        let elapsed = time::ns_to_secs(end - self.start_time);
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.total_queries() as f64 / elapsed
    }

    pub fn reset(&mut self) {
        for sampler in self.query_samplers.values_mut() {
            sampler.reset();
        }
        for sampler in self.processing_samplers.values_mut() {
            sampler.reset();
        }
        for value in self.tx_bytes.values_mut() {
            *value = 0;
        }
        for value in self.rx_bytes.values_mut() {
            *value = 0;
        }
        for value in self.query_counts.values_mut() {
            *value = 0;
        }
        for value in self.dropped.values_mut() {
            *value = 0;
        }
        self.start_time = time::monotonic_ns();
        self.end_time = 0;
    }

    pub fn metrics(&self, elapsed_secs: f64) -> BTreeMap<u32, KindMetrics> {
        let mut out = BTreeMap::new();
        for (&kind, sampler) in &self.query_samplers {
            out.insert(
                kind,
                KindMetrics {
                    qps: self.query_count(kind) as f64 / elapsed_secs,
                    rx_mbps: self.rx_bytes[&kind] as f64 / elapsed_secs / 1024.0 / 1024.0,
                    tx_mbps: self.tx_bytes[&kind] as f64 / elapsed_secs / 1024.0 / 1024.0,
                    latency_mean: sampler.average() / 1e6,
                    latency_50p: sampler.percentile(50.0) / 1e6,
                    latency_90p: sampler.percentile(90.0) / 1e6,
                    latency_95p: sampler.percentile(95.0) / 1e6,
                    latency_99p: sampler.percentile(99.0) / 1e6,
                    dropped_requests: Some(self.dropped[&kind] as f64 / elapsed_secs),
                },
            );
        }
        out
    }
}

impl Accumulate for ChildStats {
    fn accumulate(&mut self, other: &ChildStats) {
        for (kind, sampler) in &other.query_samplers {
            self.query_samplers
                .get_mut(kind)
                .expect("kind mismatch in accumulate")
                .accumulate(sampler);
        }
        for (kind, sampler) in &other.processing_samplers {
            self.processing_samplers
                .get_mut(kind)
                .expect("kind mismatch in accumulate")
                .accumulate(sampler);
        }
        for (kind, value) in &other.tx_bytes {
            *self.tx_bytes.get_mut(kind).unwrap() += value;
        }
        for (kind, value) in &other.rx_bytes {
            *self.rx_bytes.get_mut(kind).unwrap() += value;
        }
        for (kind, value) in &other.query_counts {
            *self.query_counts.get_mut(kind).unwrap() += value;
        }
        for (kind, value) in &other.dropped {
            *self.dropped.get_mut(kind).unwrap() += value;
        }
    }

    fn fresh(&self) -> ChildStats {
        let kinds: Vec<u32> = self.kinds().collect();
        ChildStats::new(&kinds)
    }
}

/// Server-side stats at a leaf: per-kind rx/tx bytes, query and response
/// counts, and the processing-time distribution.
#[derive(Clone, Debug)]
pub struct ServerStats {
    tx_bytes: BTreeMap<u32, u64>,
    rx_bytes: BTreeMap<u32, u64>,
    query_counts: BTreeMap<u32, u64>,
    response_counts: BTreeMap<u32, u64>,
    processing_samplers: BTreeMap<u32, LogHistogram>,
}

impl ServerStats {
    pub fn new(kinds: &[u32]) -> ServerStats {
        let mut stats = ServerStats {
            tx_bytes: BTreeMap::new(),
            rx_bytes: BTreeMap::new(),
            query_counts: BTreeMap::new(),
            response_counts: BTreeMap::new(),
            processing_samplers: BTreeMap::new(),
        };
        for &kind in kinds {
            stats.tx_bytes.insert(kind, 0);
            stats.rx_bytes.insert(kind, 0);
            stats.query_counts.insert(kind, 0);
            stats.response_counts.insert(kind, 0);
            stats
                .processing_samplers
                .insert(kind, LogHistogram::new(SERVER_HISTOGRAM_BINS));
        }
        stats
    }

    pub fn log_query(&mut self, kind: u32, packet_len: usize) {
        *self.rx_bytes.get_mut(&kind).expect("unregistered kind") += packet_len as u64;
        *self.query_counts.get_mut(&kind).expect("unregistered kind") += 1;
    }

    pub fn log_response(&mut self, header: &ResponseHeader) {
        let kind = header.kind;
        *self.tx_bytes.get_mut(&kind).expect("unregistered kind") +=
            header.packet_len() as u64;
        *self.response_counts.get_mut(&kind).expect("unregistered kind") += 1;
        self.processing_samplers
            .get_mut(&kind)
            .expect("unregistered kind")
            .sample(header.processing_time as f64);
    }

    pub fn query_count(&self, kind: u32) -> u64 {
        self.query_counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn response_count(&self, kind: u32) -> u64 {
        self.response_counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn total_responses(&self) -> u64 {
        self.response_counts.values().sum()
    }

    pub fn reset(&mut self) {
        for value in self.tx_bytes.values_mut() {
            *value = 0;
        }
        for value in self.rx_bytes.values_mut() {
            *value = 0;
        }
        for value in self.query_counts.values_mut() {
            *value = 0;
        }
        for value in self.response_counts.values_mut() {
            *value = 0;
        }
        for sampler in self.processing_samplers.values_mut() {
            sampler.reset();
        }
    }

    pub fn metrics(&self, elapsed_secs: f64) -> BTreeMap<u32, KindMetrics> {
        let mut out = BTreeMap::new();
        for (&kind, sampler) in &self.processing_samplers {
            out.insert(
                kind,
                KindMetrics {
                    qps: self.query_count(kind) as f64 / elapsed_secs,
                    rx_mbps: self.rx_bytes[&kind] as f64 / elapsed_secs / 1024.0 / 1024.0,
                    tx_mbps: self.tx_bytes[&kind] as f64 / elapsed_secs / 1024.0 / 1024.0,
                    latency_mean: sampler.average() / 1e6,
                    latency_50p: sampler.percentile(50.0) / 1e6,
                    latency_90p: sampler.percentile(90.0) / 1e6,
                    latency_95p: sampler.percentile(95.0) / 1e6,
                    latency_99p: sampler.percentile(99.0) / 1e6,
                    dropped_requests: None,
                },
            );
        }
        out
    }
}

impl Accumulate for ServerStats {
    fn accumulate(&mut self, other: &ServerStats) {
        for (kind, value) in &other.tx_bytes {
            *self.tx_bytes.get_mut(kind).unwrap() += value;
        }
        for (kind, value) in &other.rx_bytes {
            *self.rx_bytes.get_mut(kind).unwrap() += value;
        }
        for (kind, value) in &other.query_counts {
            *self.query_counts.get_mut(kind).unwrap() += value;
        }
        for (kind, value) in &other.response_counts {
            *self.response_counts.get_mut(kind).unwrap() += value;
        }
        for (kind, sampler) in &other.processing_samplers {
            self.processing_samplers
                .get_mut(kind)
                .expect("kind mismatch in accumulate")
                .accumulate(sampler);
        }
    }

    fn fresh(&self) -> ServerStats {
        let kinds: Vec<u32> = self.query_counts.keys().copied().collect();
        ServerStats::new(&kinds)
    }
}

/// A parent tracks one `ChildStats` per configured child; snapshots move the
/// whole vector at once.
impl Accumulate for Vec<ChildStats> {
    fn accumulate(&mut self, other: &Vec<ChildStats>) {
        assert_eq!(self.len(), other.len(), "child count mismatch");
        for (mine, theirs) in self.iter_mut().zip(other.iter()) {
            mine.accumulate(theirs);
        }
    }

    fn fresh(&self) -> Vec<ChildStats> {
        self.iter().map(|stats| stats.fresh()).collect()
    }
}

/// Derived per-kind metrics as exported by the monitoring endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct KindMetrics {
    pub qps: f64,
    pub rx_mbps: f64,
    pub tx_mbps: f64,
    pub latency_mean: f64,
    pub latency_50p: f64,
    pub latency_90p: f64,
    pub latency_95p: f64,
    pub latency_99p: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dropped_requests: Option<f64>,
}

/// Mutex-protected deque a reactor pushes window snapshots onto. The lock is
/// held only long enough to move one snapshot.
pub struct SnapshotQueue<T> {
    inner: Mutex<VecDeque<T>>,
}

impl<T> SnapshotQueue<T> {
    pub fn new() -> SnapshotQueue<T> {
        SnapshotQueue {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, snapshot: T) {
        self.inner.lock().push_back(snapshot);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn pop(&self) -> Option<T> {
        self.inner.lock().pop_front()
    }
}

/// Global snapshot history plus run-lifetime aggregate. Newest windows sit at
/// the front.
pub struct StatsHub<T> {
    history: VecDeque<T>,
    pub lifetime: T,
}

impl<T: Accumulate + Clone> StatsHub<T> {
    pub fn new(zero: T) -> StatsHub<T> {
        StatsHub {
            history: VecDeque::new(),
            lifetime: zero,
        }
    }

    pub fn push(&mut self, snapshot: T) {
        self.lifetime.accumulate(&snapshot);
        self.history.push_front(snapshot);
        if self.history.len() > STATS_MAX_WINDOWS {
            self.history.pop_back();
        }
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Trailing accumulations at each report window size that the history
    /// can currently cover.
    pub fn windows(&self) -> Vec<(usize, T)> {
        let mut out = Vec::new();
        if self.history.is_empty() {
            return out;
        }

        let mut acc = self.lifetime.fresh();
        let mut next = 0;
        for (i, snapshot) in self.history.iter().enumerate() {
            acc.accumulate(snapshot);
            if i + 1 == REPORT_WINDOWS[next] {
                out.push((REPORT_WINDOWS[next], acc.clone()));
                next += 1;
                if next == REPORT_WINDOWS.len() {
                    break;
                }
            }
        }
        out
    }
}

/// Pulls the minimum across-reactors snapshot count, merging the i-th
/// snapshot of every reactor into one global window.
pub fn drain_ready<T: Accumulate + Clone>(queues: &[&SnapshotQueue<T>], hub: &mut StatsHub<T>) {
    let ready = queues.iter().map(|q| q.len()).min().unwrap_or(0);

    for _ in 0..ready {
        let mut merged = hub.lifetime.fresh();
        for queue in queues {
            if let Some(snapshot) = queue.pop() {
                merged.accumulate(&snapshot);
            }
        }
        hub.push(merged);
    }
}

/// Prints the run aggregate in the shutdown report format.
pub fn print_report(stats: &ChildStats, elapsed_secs: f64) {
    for kind in stats.kinds() {
        let sampler = stats.latency_sampler(kind).expect("kind registered");
        println!("Stats for node under test, type {}", kind);
        println!(
            "  RX: {:.2} MB/s ({} bytes)",
            stats.rx_bytes[&kind] as f64 / elapsed_secs / 1024.0 / 1024.0,
            stats.rx_bytes[&kind]
        );
        println!(
            "  TX: {:.2} MB/s ({} bytes)",
            stats.tx_bytes[&kind] as f64 / elapsed_secs / 1024.0 / 1024.0,
            stats.tx_bytes[&kind]
        );
        println!(
            "  #: {:.2} QPS ({} queries)",
            stats.query_count(kind) as f64 / elapsed_secs,
            stats.query_count(kind)
        );
        println!(
            "  min / avg / 50p / 90p / 95p / 99p / 99.9p : {:.3} / {:.3} / {:.3} / {:.3} / {:.3} / {:.3} / {:.3} ms",
            sampler.minimum() / 1e6,
            sampler.average() / 1e6,
            sampler.percentile(50.0) / 1e6,
            sampler.percentile(90.0) / 1e6,
            sampler.percentile(95.0) / 1e6,
            sampler.percentile(99.0) / 1e6,
            sampler.percentile(99.9) / 1e6,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(kind: u32, len: u32) -> RequestHeader {
        RequestHeader {
            kind,
            request_id: 1,
            start_time: 1000,
            payload_len: len,
        }
    }

    fn response(kind: u32, len: u32) -> ResponseHeader {
        ResponseHeader {
            kind,
            request_id: 1,
            start_time: 1000,
            processing_time: 500,
            payload_len: len,
        }
    }

    #[test]
    fn test_child_stats_counters() {
        let mut stats = ChildStats::new(&[1, 2]);

        stats.log_request(&request(1, 100));
        stats.log_request(&request(1, 100));
        stats.log_response(&response(1, 50), 4000);
        stats.log_dropped(2);

        assert_eq!(stats.query_count(1), 2);
        assert_eq!(stats.reply_count(1), 1);
        assert_eq!(stats.dropped_count(2), 1);
        assert_eq!(stats.query_count(2), 0);
    }

    #[test]
    fn test_accumulate_then_reset_matches_fresh() {
        let mut a = ChildStats::new(&[1]);
        let mut b = ChildStats::new(&[1]);

        a.log_request(&request(1, 10));
        b.log_request(&request(1, 20));
        b.log_response(&response(1, 5), 9000);

        let mut merged = a.fresh();
        merged.accumulate(&a);
        merged.accumulate(&b);
        assert_eq!(merged.query_count(1), 2);
        assert_eq!(merged.reply_count(1), 1);

        merged.reset();
        assert_eq!(merged.query_count(1), 0);
        assert_eq!(merged.reply_count(1), 0);
    }

    #[test]
    fn test_server_stats_response_accounting() {
        let mut stats = ServerStats::new(&[7]);
        stats.log_query(7, 28);
        stats.log_response(&response(7, 4));

        assert_eq!(stats.query_count(7), 1);
        assert_eq!(stats.response_count(7), 1);

        let metrics = stats.metrics(1.0);
        assert!((metrics[&7].qps - 1.0).abs() < 1e-9);
        assert!(metrics[&7].dropped_requests.is_none());
    }

    #[test]
    fn test_drain_ready_takes_minimum() {
        let queues = vec![SnapshotQueue::new(), SnapshotQueue::new()];

        // Thread 0 produced three windows, thread 1 only two.
        for i in 0..3u64 {
            let mut s = ChildStats::new(&[1]);
            for _ in 0..=i {
                s.log_request(&request(1, 0));
            }
            queues[0].push(s);
        }
        for _ in 0..2 {
            let mut s = ChildStats::new(&[1]);
            s.log_request(&request(1, 0));
            queues[1].push(s);
        }

        let mut hub = StatsHub::new(ChildStats::new(&[1]));
        let refs: Vec<&SnapshotQueue<ChildStats>> = queues.iter().collect();
        drain_ready(&refs, &mut hub);

        assert_eq!(hub.history_len(), 2);
        assert_eq!(queues[0].len(), 1);
        assert_eq!(queues[1].len(), 0);
        // Windows 0 and 1 of thread 0 carry 1 + 2 queries; thread 1 adds 2.
        assert_eq!(hub.lifetime.query_count(1), 5);
    }

    #[test]
    fn test_hub_windows_accumulate_trailing() {
        let mut hub = StatsHub::new(ChildStats::new(&[1]));
        for _ in 0..6 {
            let mut s = ChildStats::new(&[1]);
            s.log_request(&request(1, 0));
            hub.push(s);
        }

        let windows = hub.windows();
        // Only the 1s and 5s windows are covered by six snapshots.
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].0, 1);
        assert_eq!(windows[0].1.query_count(1), 1);
        assert_eq!(windows[1].0, 5);
        assert_eq!(windows[1].1.query_count(1), 5);
    }

    #[test]
    fn test_hub_evicts_past_capacity() {
        let mut hub = StatsHub::new(ServerStats::new(&[1]));
        for _ in 0..STATS_MAX_WINDOWS + 10 {
            hub.push(ServerStats::new(&[1]));
        }
        assert_eq!(hub.history_len(), STATS_MAX_WINDOWS);
    }

    #[test]
    fn test_vec_accumulate_is_elementwise() {
        let mut a = vec![ChildStats::new(&[1]), ChildStats::new(&[1])];
        let mut b = vec![ChildStats::new(&[1]), ChildStats::new(&[1])];
        b[1].log_dropped(1);
        b[1].log_dropped(1);

        a.accumulate(&b);
        assert_eq!(a[0].dropped_count(1), 0);
        assert_eq!(a[1].dropped_count(1), 2);
    }
}

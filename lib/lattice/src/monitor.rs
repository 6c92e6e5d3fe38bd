//! Optional monitoring HTTP endpoint, served on its own port by a dedicated
//! thread. Two URLs: `/topology` describes this node's place in the tree,
//! `/child_stats` reports derived metrics keyed by trailing window size and
//! request kind. Anything else, including non-GET methods, gets a 400.

use crate::stats::{Accumulate, ChildStats, ServerStats, StatsHub, STATS_WINDOW_SECS};
use parking_lot::Mutex;
use pulse::logging::{self, Logger};
use serde_json::{json, Value};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// What `/topology` reports for each role.
pub enum Topology {
    Leaf,
    Parent { children: Vec<String> },
    Driver { test_node: String },
}

impl Topology {
    fn to_json(&self) -> Value {
        match self {
            Topology::Leaf => json!({}),
            Topology::Parent { children } => json!({ "children": children }),
            Topology::Driver { test_node } => json!({ "test_node": test_node }),
        }
    }
}

/// Snapshot payloads that can render their derived metrics as JSON.
pub trait MetricsSource: Accumulate + Clone + Send + 'static {
    fn metrics_json(&self, elapsed_secs: f64) -> Value;
}

impl MetricsSource for ChildStats {
    fn metrics_json(&self, elapsed_secs: f64) -> Value {
        serde_json::to_value(self.metrics(elapsed_secs)).unwrap_or(Value::Null)
    }
}

impl MetricsSource for ServerStats {
    fn metrics_json(&self, elapsed_secs: f64) -> Value {
        serde_json::to_value(self.metrics(elapsed_secs)).unwrap_or(Value::Null)
    }
}

/// A parent's per-child snapshots merge into one view for export.
impl MetricsSource for Vec<ChildStats> {
    fn metrics_json(&self, elapsed_secs: f64) -> Value {
        let mut total = match self.first() {
            Some(first) => first.fresh(),
            None => return json!({}),
        };
        for child in self {
            total.accumulate(child);
        }
        serde_json::to_value(total.metrics(elapsed_secs)).unwrap_or(Value::Null)
    }
}

pub struct MonitorHandle {
    pub addr: SocketAddr,
    thread: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn join(self) {
        let _ = self.thread.join();
    }
}

/// Starts the responder thread. It re-checks the shutdown flag between
/// accept timeouts, so it winds down with the rest of the process.
pub fn spawn<T: MetricsSource>(
    port: u16,
    topology: Topology,
    hub: Arc<Mutex<StatsHub<T>>>,
    shutdown: crate::server::ShutdownFlag,
    log: Logger,
) -> io::Result<MonitorHandle> {
    let server = tiny_http::Server::http(("0.0.0.0", port))
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;
    let addr = server.server_addr();

    logging::info!(log, "monitoring endpoint up"; "addr" => %addr);

    let thread = thread::Builder::new()
        .name("monitor".to_string())
        .spawn(move || {
            while !shutdown.is_set() {
                match server.recv_timeout(Duration::from_millis(250)) {
                    Ok(Some(request)) => respond(request, &topology, &hub, &log),
                    Ok(None) => (),
                    Err(err) => {
                        logging::warn!(log, "monitor accept failed"; "error" => %err);
                        break;
                    }
                }
            }
        })?;

    Ok(MonitorHandle { addr, thread })
}

fn respond<T: MetricsSource>(
    request: tiny_http::Request,
    topology: &Topology,
    hub: &Arc<Mutex<StatsHub<T>>>,
    log: &Logger,
) {
    if *request.method() != tiny_http::Method::Get {
        let _ = request.respond(tiny_http::Response::from_string("").with_status_code(400));
        return;
    }

    let body = match request.url() {
        "/topology" => topology.to_json().to_string(),
        "/child_stats" => child_stats_json(hub).to_string(),
        other => {
            logging::debug!(log, "unknown monitor path"; "path" => other);
            let _ = request.respond(tiny_http::Response::from_string("").with_status_code(400));
            return;
        }
    };

    let response = tiny_http::Response::from_string(body).with_header(
        tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
            .expect("static header"),
    );
    let _ = request.respond(response);
}

fn child_stats_json<T: MetricsSource>(hub: &Arc<Mutex<StatsHub<T>>>) -> Value {
    let mut windows = serde_json::Map::new();
    for (size, stats) in hub.lock().windows() {
        let elapsed = (size as u64 * STATS_WINDOW_SECS) as f64;
        windows.insert(size.to_string(), stats.metrics_json(elapsed));
    }
    json!({ "stats": Value::Object(windows) })
}

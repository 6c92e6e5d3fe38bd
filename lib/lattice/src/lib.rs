//! Event-driven fanout runtime for tree-shaped RPC workload simulation.
//!
//! The crate is organized leaves-first: `net` holds the framed transport and
//! the two connection directions, `reactor` the per-thread event loop
//! machinery, `fanout` the reply correlation state, `driver` the closed-loop
//! request generator, `stats` the snapshot pipeline, and `server` the three
//! role orchestrators that tie a pool of reactors together.

pub mod driver;
pub mod fanout;
pub mod monitor;
pub mod net;
pub mod reactor;
pub mod server;
pub mod stats;

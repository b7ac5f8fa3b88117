//! Concurrent sales time-series daemon.
//!
//! - `protocol`/`codec`: the wire vocabulary and its binary framing (C1)
//! - `auth`: username/password-hash store (C2)
//! - `timeseries`: rolling daily event store with blocking condition
//!   waiters (C3)
//! - `cache`: lazy, day-scoped aggregation cache (C4)
//! - `persistence`: binary on-disk users/state/day files (C5)
//! - `workerpool`: fixed-size task pool draining a FIFO queue (C6)
//! - `server`: per-connection request dispatch (C7)
//! - `client`: connection demultiplexer for concurrent callers (C8)
//! - `config`: CLI/environment configuration
//! - `error`: per-subsystem error types
pub mod auth;
pub mod cache;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod persistence;
pub mod protocol;
pub mod server;
pub mod timeseries;
pub mod workerpool;

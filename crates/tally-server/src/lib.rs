//! # tally-server
//!
//! Axum HTTP + `WebSocket` server for resumable per-session counters.
//!
//! - Connection registry: concurrency-safe set of live connections
//! - Heartbeat sweep: periodic liveness frame to every connection, pruning failures
//! - Session store: TTL-bounded resumable state keyed by session id
//! - Connection handler: accept → message loop → idempotent disconnect
//! - Graceful shutdown via `CancellationToken` with a bounded per-connection drain

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod server;
pub mod session_store;
pub mod shutdown;
pub mod websocket;

pub use errors::ServerError;

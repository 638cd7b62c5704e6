//! # tally-core
//!
//! Foundation types shared by the tally crates.
//!
//! - [`ids`]: branded id newtypes for sessions and connections
//! - [`logging`]: global `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod ids;
pub mod logging;

pub use ids::{ConnectionId, SessionId};

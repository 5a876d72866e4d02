//! Guest-side appliance daemon.
//!
//! Reads framed requests from the controller channel, runs them against the
//! guest filesystem mounted at the sysroot and answers each one in order.

pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
pub mod progress;
pub mod server;
pub mod stream;
pub mod sysroot;
pub mod transport;

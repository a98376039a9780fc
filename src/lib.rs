//! Capture MySQL client/server traffic from packet traces into a canonical
//! event log, and replay that log against a live MySQL-compatible target.
//!
//! [`capture`] turns segments into events; [`replay`] turns events back
//! into traffic. [`wire`] is the protocol codec both sides share.

pub mod capture;
pub mod constant;
mod dsn;
pub mod error;
#[cfg(feature = "tokio-client")]
pub mod replay;
pub mod stats;
pub mod wire;

pub use dsn::Dsn;
pub use error::{Error, Result};

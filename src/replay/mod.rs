//! Replay side: turns a canonical event log back into traffic against a
//! live MySQL-compatible target.
//!
//! [`scheduler::ReplayScheduler`] is the entry point — it discovers
//! session files, builds the shared [`clock::VirtualClock`], and hands
//! each file to its own [`worker::ReplayWorker`], which applies events
//! through the [`db::DatabaseHandle`] trait object seam. [`remote::RemoteAgent`]
//! is the same seam for distributing workers over HTTP, with no bundled
//! transport.

pub mod clock;
pub mod db;
pub mod remote;
pub mod scheduler;
pub mod worker;

pub use clock::VirtualClock;
pub use db::{
    DatabaseHandle, DbConnection, DbPool, DbStatement, TokioConnection, TokioMysqlHandle,
    TokioPool, TokioStatement,
};
pub use remote::{RemoteAgent, RemoteJobStatus};
pub use scheduler::{discover_sessions, ReplayScheduler, SessionFile};
pub use worker::{ReplayConfig, ReplayWorker};

//! The remote-agent distribution mode named in spec §4.F/§6: `POST` one
//! worker's event file to `<agent>/<job>`, then poll `GET <agent>/<job>`
//! for `{total, finished, lagging, stats{...}}` until it's done.
//!
//! The HTTP protocol itself is an explicit external collaborator (spec §1)
//! — no request is built or parsed here. [`RemoteAgent`] is the seam a
//! caller plugs an HTTP client into; this crate ships none.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;

/// One worker's progress as last reported by a remote agent's `GET` poll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteJobStatus {
    pub total: u64,
    pub finished: u64,
    /// Seconds, as reported by the remote protocol (spec §6: `lagging:
    /// float-seconds`).
    pub lagging_secs: f64,
    pub stats: HashMap<String, i64>,
}

/// Dispatches a session file to an external worker and polls its progress.
/// Spec §9 flags the aggregation's session-keying as an open question this
/// crate doesn't resolve — there being no bundled implementation, the
/// ambiguity lives entirely on the other side of this trait.
#[async_trait]
pub trait RemoteAgent: Send + Sync {
    /// `POST /<job_name>` with the session file as body and worker
    /// metadata (session id, schema, speed) as headers.
    async fn dispatch(&self, job_name: &str, session_path: &Path) -> Result<()>;

    /// `GET /<job_name>`.
    async fn poll(&self, job_name: &str) -> Result<RemoteJobStatus>;
}

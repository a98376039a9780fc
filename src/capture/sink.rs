//! Where the assembler sends completed [`Event`]s. [`FileEventSink`] buffers
//! one session's lines in memory and writes the `<firstTsMs>.<lastTsMs>.
//! <connHashHex>.tsv` file (spec §6) once the connection finishes;
//! [`VecEventSink`] is the in-memory double used by assembler tests.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use crate::capture::conn_id::ConnectionId;
use crate::capture::event::{encode_event, Event};
use crate::error::{Error, Result};

pub trait EventSink {
    fn record(&mut self, connection: ConnectionId, ts_ms: i64, event: &Event) -> Result<()>;
    /// Called once a connection's state machine reaches `Closed` or its
    /// buffers are flushed by an idle timeout — flushes any buffered output.
    fn finish(&mut self, connection: ConnectionId) -> Result<()>;
}

#[derive(Default)]
struct SessionBuffer {
    first_ts: i64,
    last_ts: i64,
    lines: Vec<String>,
}

/// Writes one `.tsv` file per connection under `dir`, named by the session's
/// first/last event timestamp and connection hash (spec §3, §6).
pub struct FileEventSink {
    dir: PathBuf,
    sessions: HashMap<ConnectionId, SessionBuffer>,
}

impl FileEventSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sessions: HashMap::new(),
        }
    }
}

impl EventSink for FileEventSink {
    fn record(&mut self, connection: ConnectionId, ts_ms: i64, event: &Event) -> Result<()> {
        let buf = self.sessions.entry(connection).or_default();
        if buf.lines.is_empty() {
            buf.first_ts = ts_ms;
        }
        buf.last_ts = ts_ms;
        buf.lines.push(encode_event(ts_ms, event));
        Ok(())
    }

    fn finish(&mut self, connection: ConnectionId) -> Result<()> {
        let Some(buf) = self.sessions.remove(&connection) else {
            return Ok(());
        };
        if buf.lines.is_empty() {
            return Ok(());
        }

        let filename = format!("{}.{}.{}.tsv", buf.first_ts, buf.last_ts, connection.hash_hex());
        let mut file = fs::File::create(self.dir.join(filename)).map_err(Error::Transport)?;
        for line in &buf.lines {
            writeln!(file, "{line}").map_err(Error::Transport)?;
        }
        Ok(())
    }
}

/// In-memory sink used by assembler unit tests: records every `(ts, event)`
/// per connection and which connections were explicitly finished.
#[derive(Default)]
pub struct VecEventSink {
    pub events: HashMap<ConnectionId, Vec<(i64, Event)>>,
    pub finished: Vec<ConnectionId>,
}

impl EventSink for VecEventSink {
    fn record(&mut self, connection: ConnectionId, ts_ms: i64, event: &Event) -> Result<()> {
        self.events
            .entry(connection)
            .or_default()
            .push((ts_ms, event.clone()));
        Ok(())
    }

    fn finish(&mut self, connection: ConnectionId) -> Result<()> {
        self.finished.push(connection);
        Ok(())
    }
}

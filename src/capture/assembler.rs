//! Demultiplexes a packet source into per-connection reassembly state and
//! drives each connection's [`ConnStateMachine`] to completion, handing
//! finished events to an [`EventSink`]. This is the "stream-pool factory"
//! spec §9 describes: the state machine only knows how to make one frame's
//! worth of progress per `step` call; the assembler owns the loop that
//! keeps calling it, the per-connection table, and `FlushCloseOlderThan`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{instrument, warn};

use crate::capture::conn_id::{ConnectionId, Direction};
use crate::capture::segment::{CaptureInfo, Segment};
use crate::capture::sink::EventSink;
use crate::capture::source::PacketSource;
use crate::capture::state_machine::{Action, ConnStateMachine};
use crate::capture::stream::DirectionalBuffer;
use crate::error::Result;
use crate::stats::Stats;

#[derive(Debug, Clone, Copy)]
pub struct AssemblerConfig {
    /// Permits each connection's directional buffers to begin mid-stream
    /// with no SYN observed (spec §4.B `ForceStart`).
    pub force_start: bool,
    /// When true, per-connection state is accessed through a blocking
    /// mutex so stream-pool callbacks from multiple threads cannot
    /// interleave (spec §4.C `Synchronized`). When false, a caller that
    /// delivers two segments for the same connection concurrently panics
    /// instead of silently interleaving — the contract is single-threaded
    /// delivery per connection, not "no locking at all".
    pub synchronized: bool,
    /// `FlushCloseOlderThan` cutoff, in capture-timestamp milliseconds,
    /// applied relative to the most recently observed segment's timestamp.
    pub idle_flush_ms: i64,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            force_start: false,
            synchronized: false,
            idle_flush_ms: 30_000,
        }
    }
}

struct ConnectionState {
    client: DirectionalBuffer,
    server: DirectionalBuffer,
    machine: ConnStateMachine,
}

pub struct Assembler<S: EventSink> {
    config: AssemblerConfig,
    connections: HashMap<ConnectionId, Mutex<ConnectionState>>,
    sink: S,
    stats: Arc<dyn Stats>,
}

impl<S: EventSink> Assembler<S> {
    pub fn new(config: AssemblerConfig, sink: S, stats: Arc<dyn Stats>) -> Self {
        Self {
            config,
            connections: HashMap::new(),
            sink,
            stats,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    fn lock<'a>(&self, slot: &'a Mutex<ConnectionState>) -> MutexGuard<'a, ConnectionState> {
        if self.config.synchronized {
            slot.lock().expect("connection state mutex poisoned")
        } else {
            slot.try_lock()
                .expect("connection accessed concurrently with Synchronized disabled")
        }
    }

    /// Runs a [`PacketSource`] to exhaustion, idle-flushing connections
    /// between segments as the capture clock advances.
    pub fn run(&mut self, source: &mut dyn PacketSource) -> Result<()> {
        while let Some((segment, info)) = source.next_packet() {
            let ts = segment.capture_ts_ms;
            self.on_segment(segment, info)?;
            self.flush_close_older_than(ts - self.config.idle_flush_ms)?;
        }
        Ok(())
    }

    /// Feeds one segment through its connection's buffers and drains as
    /// many protocol actions as are now ready.
    #[instrument(skip(self, segment, info), fields(conn = %segment.connection.hash_hex()))]
    pub fn on_segment(&mut self, segment: Segment, info: CaptureInfo) -> Result<()> {
        if info.truncated {
            tracing::trace!("segment marked truncated by packet source");
        }

        self.stats.add("packets", 1);
        match segment.direction {
            Direction::ClientToServer => self.stats.add("data.in", segment.payload.len() as i64),
            Direction::ServerToClient => self.stats.add("data.out", segment.payload.len() as i64),
        }

        let id = segment.connection;
        if !self.connections.contains_key(&id) {
            let machine = if self.config.force_start && segment.direction == Direction::ClientToServer {
                ConnStateMachine::new_mid_stream()
            } else {
                ConnStateMachine::new()
            };
            self.connections.insert(
                id,
                Mutex::new(ConnectionState {
                    client: DirectionalBuffer::new(self.config.force_start),
                    server: DirectionalBuffer::new(self.config.force_start),
                    machine,
                }),
            );
            self.stats.add("streams", 2);
            self.stats.add("connections", 1);
        }

        let mut close_after = false;
        {
            let slot = self.connections.get(&id).expect("just inserted or already present");
            let mut state = self.lock(slot);

            match segment.direction {
                Direction::ClientToServer => state.client.push(&segment),
                Direction::ServerToClient => state.server.push(&segment),
            }

            loop {
                match state.machine.step(&mut state.client, &mut state.server)? {
                    Action::NeedMore(_) => break,
                    Action::Progressed => continue,
                    Action::Emit(ts, event) => {
                        self.sink.record(id, ts, &event)?;
                        continue;
                    }
                    Action::Desynced(reason) => {
                        warn!(reason, "connection desynchronized; recovering at next valid frame");
                        continue;
                    }
                    Action::ConnectionClosed => {
                        close_after = true;
                        break;
                    }
                }
            }
        }

        if close_after {
            self.connections.remove(&id);
            self.sink.finish(id)?;
            self.stats.add("connections", -1);
        }

        Ok(())
    }

    /// Closes every connection whose most recent segment predates `cutoff_ms`,
    /// bounding memory for traces with connections that never send FIN.
    pub fn flush_close_older_than(&mut self, cutoff_ms: i64) -> Result<()> {
        let mut stale = Vec::new();
        for (id, slot) in self.connections.iter() {
            let state = self.lock(slot);
            let last = state.client.last_update_ms().max(state.server.last_update_ms());
            if last < cutoff_ms {
                stale.push(*id);
            }
        }

        for id in stale {
            if let Some(slot) = self.connections.get(&id) {
                let mut state = self.lock(slot);
                state.client.close_truncated();
                state.server.close_truncated();
            }
            self.connections.remove(&id);
            self.sink.finish(id)?;
            self.stats.add("connections", -1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::conn_id::Endpoint;
    use crate::capture::event::Event;
    use crate::capture::sink::VecEventSink;
    use crate::capture::source::VecPacketSource;
    use crate::constant::{CapabilityFlags, CommandByte};
    use crate::stats::GlobalStats;
    use crate::wire::framing::write_frame;
    use crate::wire::handshake::{write_handshake_response, HandshakeResponse41};
    use crate::wire::primitive::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn conn() -> ConnectionId {
        ConnectionId::new(
            Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1234),
            Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 3306),
        )
    }

    fn raw_initial_handshake() -> Vec<u8> {
        let mut body = Vec::new();
        write_int_1(&mut body, 10);
        write_string_null(&mut body, "8.0.34-test");
        write_int_4(&mut body, 42);
        body.extend_from_slice(b"AAAAAAAA");
        write_int_1(&mut body, 0);
        let caps = CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_PLUGIN_AUTH
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_CONNECT_WITH_DB;
        let cap_bits = caps.bits();
        write_int_2(&mut body, (cap_bits & 0xFFFF) as u16);
        write_int_1(&mut body, 45);
        write_int_2(&mut body, 2);
        write_int_2(&mut body, (cap_bits >> 16) as u16);
        write_int_1(&mut body, 21);
        body.extend_from_slice(&[0u8; 10]);
        body.extend_from_slice(b"BBBBBBBBBBBB");
        write_int_1(&mut body, 0);
        write_string_null(&mut body, "mysql_native_password");
        body
    }

    fn raw_ok_reply() -> Vec<u8> {
        let mut body = Vec::new();
        write_int_1(&mut body, 0x00);
        write_int_lenenc(&mut body, 0);
        write_int_lenenc(&mut body, 0);
        write_int_2(&mut body, 2);
        write_int_2(&mut body, 0);
        body
    }

    #[test]
    fn single_query_session_emits_handshake_query_quit_and_finishes() {
        let id = conn();
        let mut server_seq = 0u32;
        let mut client_seq = 0u32;
        let mut segments = Vec::new();

        let mut greeting = Vec::new();
        write_frame(&mut greeting, 0, &raw_initial_handshake());
        segments.push(Segment {
            connection: id,
            direction: Direction::ServerToClient,
            seq: server_seq,
            payload: greeting.clone(),
            capture_ts_ms: 1,
        });
        server_seq += greeting.len() as u32;

        let response = HandshakeResponse41 {
            capability_flags: CapabilityFlags::CLIENT_PROTOCOL_41 | CapabilityFlags::CLIENT_CONNECT_WITH_DB,
            max_packet_size: 16 * 1024 * 1024,
            charset: 45,
            username: "root",
            auth_response: b"",
            database: Some("db1"),
            auth_plugin_name: None,
        };
        let mut resp_payload = Vec::new();
        write_handshake_response(&mut resp_payload, &response);
        let mut resp_bytes = Vec::new();
        write_frame(&mut resp_bytes, 1, &resp_payload);
        segments.push(Segment {
            connection: id,
            direction: Direction::ClientToServer,
            seq: client_seq,
            payload: resp_bytes.clone(),
            capture_ts_ms: 2,
        });
        client_seq += resp_bytes.len() as u32;

        let mut auth_ok = Vec::new();
        write_frame(&mut auth_ok, 2, &raw_ok_reply());
        segments.push(Segment {
            connection: id,
            direction: Direction::ServerToClient,
            seq: server_seq,
            payload: auth_ok.clone(),
            capture_ts_ms: 3,
        });
        server_seq += auth_ok.len() as u32;

        let mut query_payload = vec![CommandByte::Query as u8];
        query_payload.extend_from_slice(b"SELECT 1");
        let mut query_bytes = Vec::new();
        write_frame(&mut query_bytes, 0, &query_payload);
        segments.push(Segment {
            connection: id,
            direction: Direction::ClientToServer,
            seq: client_seq,
            payload: query_bytes.clone(),
            capture_ts_ms: 4,
        });
        client_seq += query_bytes.len() as u32;

        let mut query_reply = Vec::new();
        write_frame(&mut query_reply, 1, &raw_ok_reply());
        segments.push(Segment {
            connection: id,
            direction: Direction::ServerToClient,
            seq: server_seq,
            payload: query_reply.clone(),
            capture_ts_ms: 5,
        });
        let _ = server_seq;

        let mut quit_bytes = Vec::new();
        write_frame(&mut quit_bytes, 0, &[CommandByte::Quit as u8]);
        segments.push(Segment {
            connection: id,
            direction: Direction::ClientToServer,
            seq: client_seq,
            payload: quit_bytes,
            capture_ts_ms: 6,
        });

        let mut source = VecPacketSource::from_segments(segments);
        let stats: Arc<dyn Stats> = Arc::new(GlobalStats::new());
        let mut assembler = Assembler::new(AssemblerConfig::default(), VecEventSink::default(), stats.clone());
        assembler.run(&mut source).unwrap();

        let events = &assembler.sink().events[&id];
        let kinds: Vec<_> = events.iter().map(|(_, e)| e.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                Event::Handshake { schema: "db1".into() },
                Event::Query { sql: "SELECT 1".into() },
                Event::Quit,
            ]
        );
        assert_eq!(assembler.sink().finished, vec![id]);
        assert_eq!(stats.get("connections"), 0);
        assert_eq!(stats.get("packets"), 6);
    }

    #[test]
    fn flush_close_older_than_finishes_a_stalled_connection() {
        let id = conn();
        let stats: Arc<dyn Stats> = Arc::new(GlobalStats::new());
        let mut assembler = Assembler::new(AssemblerConfig::default(), VecEventSink::default(), stats.clone());

        assembler
            .on_segment(
                Segment {
                    connection: id,
                    direction: Direction::ServerToClient,
                    seq: 0,
                    payload: vec![1, 2, 3],
                    capture_ts_ms: 1_000,
                },
                CaptureInfo::default(),
            )
            .unwrap();
        assert_eq!(stats.get("connections"), 1);

        assembler.flush_close_older_than(1_000 + 30_001).unwrap();
        assert_eq!(stats.get("connections"), 0);
        assert_eq!(assembler.sink().finished, vec![id]);
    }
}

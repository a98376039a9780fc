//! Per-connection protocol state machine: pulls frames out of a pair of
//! [`DirectionalBuffer`]s, tracks which side's move it is, and turns
//! completed request/reply pairs into [`Event`]s.
//!
//! Follows a pull-based `step` → `Action` shape: each call makes at most
//! one frame's worth of progress and tells the caller what happened, so
//! the caller (the assembler) can keep stepping while frames are already
//! buffered and only block for I/O when it sees `NeedMore`.

use crate::capture::conn_id::Direction;
use crate::capture::event::Event;
use crate::capture::prepared::{PreparedStatementEntry, PreparedStatementTable};
use crate::capture::stream::DirectionalBuffer;
use crate::error::{Error, Result};
use crate::wire::command::{decode_client_command, read_prepare_ok, ClientCommand};
use crate::constant::CommandByte;
use crate::wire::framing::try_read_frame;
use crate::wire::handshake::{read_handshake_response, read_initial_handshake};
use crate::wire::primitive::read_int_lenenc;
use crate::wire::response::{classify_reply, ReplyKind};
use crate::wire::value::decode_execute_params_with_long_data;

const MAX_AUTH_ROUNDS: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolPhase {
    AwaitHandshake,
    AwaitHandshakeResponse,
    Idle,
    AwaitCommandReply,
    AwaitPrepareReply,
    AwaitExecuteReply,
    Closed,
}

#[derive(Debug, Clone, Copy)]
enum HandshakeSubStage {
    WaitingForClientResponse,
    WaitingForServerAuthReply { rounds: u8 },
    WaitingForClientAuthData { rounds: u8 },
}

#[derive(Debug, Clone, Copy)]
enum AwaitCommandKind {
    /// Ping / InitDb / StmtReset: always a single OK/ERR, never a result set.
    Simple,
    /// Query: may reply with OK/ERR or a full result set.
    MaybeResultSet,
}

#[derive(Debug, Clone, Copy)]
enum ResultSetSkip {
    ColumnDefs { remaining: u64 },
    ColumnsEof,
    Rows,
}

enum SkipOutcome {
    Continue,
    Done,
    Desync(&'static str),
}

fn advance_result_set_skip(skip: ResultSetSkip, payload: &[u8]) -> (SkipOutcome, ResultSetSkip) {
    match skip {
        ResultSetSkip::ColumnDefs { remaining } => {
            let remaining = remaining - 1;
            if remaining == 0 {
                (SkipOutcome::Continue, ResultSetSkip::ColumnsEof)
            } else {
                (SkipOutcome::Continue, ResultSetSkip::ColumnDefs { remaining })
            }
        }
        ResultSetSkip::ColumnsEof => {
            if classify_reply(payload) == ReplyKind::Eof {
                (SkipOutcome::Continue, ResultSetSkip::Rows)
            } else {
                (
                    SkipOutcome::Desync("expected EOF terminating column definitions"),
                    ResultSetSkip::Rows,
                )
            }
        }
        ResultSetSkip::Rows => match classify_reply(payload) {
            ReplyKind::Eof | ReplyKind::Ok => (SkipOutcome::Done, ResultSetSkip::Rows),
            _ => (SkipOutcome::Continue, ResultSetSkip::Rows),
        },
    }
}

#[derive(Debug, Clone, Copy)]
enum PrepareSkip {
    ParamDefs { remaining: u16, columns: u16 },
    ParamsEof { columns: u16 },
    ColumnDefs { remaining: u16 },
    ColumnsEof,
}

fn advance_prepare_skip(skip: PrepareSkip, payload: &[u8]) -> (SkipOutcome, PrepareSkip) {
    match skip {
        PrepareSkip::ParamDefs { remaining, columns } => {
            let remaining = remaining - 1;
            if remaining == 0 {
                (SkipOutcome::Continue, PrepareSkip::ParamsEof { columns })
            } else {
                (
                    SkipOutcome::Continue,
                    PrepareSkip::ParamDefs { remaining, columns },
                )
            }
        }
        PrepareSkip::ParamsEof { columns } => {
            if classify_reply(payload) != ReplyKind::Eof {
                return (
                    SkipOutcome::Desync("expected EOF terminating parameter definitions"),
                    PrepareSkip::ColumnsEof,
                );
            }
            if columns > 0 {
                (
                    SkipOutcome::Continue,
                    PrepareSkip::ColumnDefs { remaining: columns },
                )
            } else {
                (SkipOutcome::Done, PrepareSkip::ColumnsEof)
            }
        }
        PrepareSkip::ColumnDefs { remaining } => {
            let remaining = remaining - 1;
            if remaining == 0 {
                (SkipOutcome::Continue, PrepareSkip::ColumnsEof)
            } else {
                (SkipOutcome::Continue, PrepareSkip::ColumnDefs { remaining })
            }
        }
        PrepareSkip::ColumnsEof => {
            if classify_reply(payload) == ReplyKind::Eof {
                (SkipOutcome::Done, PrepareSkip::ColumnsEof)
            } else {
                (
                    SkipOutcome::Desync("expected EOF terminating column definitions"),
                    PrepareSkip::ColumnsEof,
                )
            }
        }
    }
}

/// What a `step` call accomplished.
#[derive(Debug)]
pub enum Action {
    /// No complete frame is available on `Direction` yet.
    NeedMore(Direction),
    /// A frame was consumed and advanced the phase but produced no event.
    Progressed,
    /// A frame completed a loggable protocol action.
    Emit(i64, Event),
    /// The stream desynchronized; recovery is now scanning for the next
    /// plausible client frame. Carries a short diagnostic reason.
    Desynced(&'static str),
    /// `COM_QUIT` observed; no reply is expected.
    ConnectionClosed,
}

pub struct ConnStateMachine {
    phase: ProtocolPhase,
    handshake_stage: HandshakeSubStage,
    desyncing: bool,
    await_command_kind: AwaitCommandKind,
    result_skip: Option<ResultSetSkip>,
    pending_prepare_sql: Option<String>,
    pending_prepare: Option<(u32, u16)>,
    prepare_skip: Option<PrepareSkip>,
    prepared: PreparedStatementTable,
}

impl Default for ConnStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnStateMachine {
    pub fn new() -> Self {
        Self {
            phase: ProtocolPhase::AwaitHandshake,
            handshake_stage: HandshakeSubStage::WaitingForClientResponse,
            desyncing: false,
            await_command_kind: AwaitCommandKind::Simple,
            result_skip: None,
            pending_prepare_sql: None,
            pending_prepare: None,
            prepare_skip: None,
            prepared: PreparedStatementTable::new(),
        }
    }

    /// Starts the machine already past the handshake, for a capture that
    /// began mid-connection (paired with `ForceStart` on both buffers).
    pub fn new_mid_stream() -> Self {
        let mut this = Self::new();
        this.phase = ProtocolPhase::Idle;
        this
    }

    pub fn phase(&self) -> ProtocolPhase {
        self.phase
    }

    pub fn prepared_statements(&self) -> &PreparedStatementTable {
        &self.prepared
    }

    pub fn step(
        &mut self,
        client: &mut DirectionalBuffer,
        server: &mut DirectionalBuffer,
    ) -> Result<Action> {
        if self.desyncing {
            return Ok(self.step_desync(client));
        }

        match self.phase {
            ProtocolPhase::Closed => Ok(Action::ConnectionClosed),
            ProtocolPhase::AwaitHandshake => self.step_await_handshake(server),
            ProtocolPhase::AwaitHandshakeResponse => {
                self.step_await_handshake_response(client, server)
            }
            ProtocolPhase::Idle => self.step_idle(client),
            ProtocolPhase::AwaitCommandReply => self.step_reply(server, self.is_simple_reply()),
            ProtocolPhase::AwaitPrepareReply => self.step_prepare_reply(server),
            ProtocolPhase::AwaitExecuteReply => self.step_reply(server, false),
        }
    }

    fn is_simple_reply(&self) -> bool {
        matches!(self.await_command_kind, AwaitCommandKind::Simple)
    }

    fn enter_desync(&mut self, reason: &'static str) -> Action {
        self.desyncing = true;
        self.result_skip = None;
        self.prepare_skip = None;
        Action::Desynced(reason)
    }

    fn step_desync(&mut self, client: &mut DirectionalBuffer) -> Action {
        loop {
            let avail = client.available_len();
            if avail < 5 {
                return Action::NeedMore(Direction::ClientToServer);
            }
            let resynced = {
                let window = client.peek(5).expect("checked available length");
                window[3] == 0 && CommandByte::from_u8(window[4]).is_some()
            };
            if resynced {
                self.desyncing = false;
                self.phase = ProtocolPhase::Idle;
                return Action::Progressed;
            }
            client.advance(1);
        }
    }

    fn step_await_handshake(&mut self, server: &mut DirectionalBuffer) -> Result<Action> {
        match take_frame(server)? {
            None => Ok(Action::NeedMore(Direction::ServerToClient)),
            Some((frame, _ts)) => match read_initial_handshake(&frame.payload) {
                Ok(_greeting) => {
                    self.phase = ProtocolPhase::AwaitHandshakeResponse;
                    self.handshake_stage = HandshakeSubStage::WaitingForClientResponse;
                    Ok(Action::Progressed)
                }
                Err(Error::Server(_)) => {
                    self.phase = ProtocolPhase::Closed;
                    Ok(Action::Progressed)
                }
                Err(e) => Err(e),
            },
        }
    }

    fn step_await_handshake_response(
        &mut self,
        client: &mut DirectionalBuffer,
        server: &mut DirectionalBuffer,
    ) -> Result<Action> {
        match self.handshake_stage {
            HandshakeSubStage::WaitingForClientResponse => match take_frame(client)? {
                None => Ok(Action::NeedMore(Direction::ClientToServer)),
                Some((frame, ts)) => {
                    let response = read_handshake_response(&frame.payload)?;
                    let schema = response.database.unwrap_or("").to_string();
                    self.handshake_stage = HandshakeSubStage::WaitingForServerAuthReply { rounds: 0 };
                    Ok(Action::Emit(ts, Event::Handshake { schema }))
                }
            },
            HandshakeSubStage::WaitingForServerAuthReply { rounds } => match take_frame(server)? {
                None => Ok(Action::NeedMore(Direction::ServerToClient)),
                Some((frame, _ts)) => match classify_reply(&frame.payload) {
                    ReplyKind::Ok => {
                        self.phase = ProtocolPhase::Idle;
                        Ok(Action::Progressed)
                    }
                    ReplyKind::Err => {
                        self.phase = ProtocolPhase::Closed;
                        Ok(Action::Progressed)
                    }
                    _ => {
                        if rounds >= MAX_AUTH_ROUNDS {
                            Ok(self.enter_desync("auth negotiation exceeded round limit"))
                        } else {
                            self.handshake_stage =
                                HandshakeSubStage::WaitingForClientAuthData { rounds: rounds + 1 };
                            Ok(Action::Progressed)
                        }
                    }
                },
            },
            HandshakeSubStage::WaitingForClientAuthData { rounds } => match take_frame(client)? {
                None => Ok(Action::NeedMore(Direction::ClientToServer)),
                Some(_) => {
                    self.handshake_stage = HandshakeSubStage::WaitingForServerAuthReply { rounds };
                    Ok(Action::Progressed)
                }
            },
        }
    }

    fn step_idle(&mut self, client: &mut DirectionalBuffer) -> Result<Action> {
        match take_frame(client)? {
            None => Ok(Action::NeedMore(Direction::ClientToServer)),
            Some((frame, ts)) => {
                let cmd = decode_client_command(&frame.payload)?;
                Ok(match cmd {
                    ClientCommand::Quit => {
                        self.phase = ProtocolPhase::Closed;
                        Action::Emit(ts, Event::Quit)
                    }
                    ClientCommand::Query(sql) => {
                        self.phase = ProtocolPhase::AwaitCommandReply;
                        self.await_command_kind = AwaitCommandKind::MaybeResultSet;
                        Action::Emit(ts, Event::Query { sql })
                    }
                    ClientCommand::InitDb(_) | ClientCommand::Ping | ClientCommand::StmtReset(_) => {
                        self.phase = ProtocolPhase::AwaitCommandReply;
                        self.await_command_kind = AwaitCommandKind::Simple;
                        Action::Progressed
                    }
                    ClientCommand::StmtPrepare(sql) => {
                        self.pending_prepare_sql = Some(sql);
                        self.phase = ProtocolPhase::AwaitPrepareReply;
                        Action::Progressed
                    }
                    ClientCommand::StmtExecute { statement_id, param_bytes } => {
                        let Some(entry) = self.prepared.get_mut(statement_id) else {
                            return Ok(self.enter_desync("execute references unknown prepared statement"));
                        };
                        let (values, types) = decode_execute_params_with_long_data(
                            entry.num_params as usize,
                            &param_bytes,
                            entry.cached_types.as_deref(),
                            &entry.long_data,
                        )?;
                        entry.cached_types = Some(types);
                        entry.long_data.clear();
                        self.phase = ProtocolPhase::AwaitExecuteReply;
                        Action::Emit(ts, Event::StmtExecute { statement_id, params: values })
                    }
                    ClientCommand::StmtClose(statement_id) => {
                        self.prepared.remove(statement_id);
                        Action::Emit(ts, Event::StmtClose { statement_id })
                    }
                    ClientCommand::StmtSendLongData { statement_id, param_index, data } => {
                        if let Some(entry) = self.prepared.get_mut(statement_id) {
                            entry.append_long_data(param_index, &data);
                        }
                        Action::Progressed
                    }
                    ClientCommand::FieldList(_) | ClientCommand::Other(_) | ClientCommand::Unknown(_) => {
                        self.enter_desync("unsupported or unrecognized client command")
                    }
                })
            }
        }
    }

    fn step_reply(&mut self, server: &mut DirectionalBuffer, simple: bool) -> Result<Action> {
        match take_frame(server)? {
            None => Ok(Action::NeedMore(Direction::ServerToClient)),
            Some((frame, _ts)) => {
                if let Some(skip) = self.result_skip.take() {
                    let (outcome, next) = advance_result_set_skip(skip, &frame.payload);
                    return Ok(match outcome {
                        SkipOutcome::Continue => {
                            self.result_skip = Some(next);
                            Action::Progressed
                        }
                        SkipOutcome::Done => {
                            self.phase = ProtocolPhase::Idle;
                            Action::Progressed
                        }
                        SkipOutcome::Desync(reason) => self.enter_desync(reason),
                    });
                }

                match classify_reply(&frame.payload) {
                    ReplyKind::Other if !simple => {
                        let (count, _) = read_int_lenenc(&frame.payload)?;
                        self.result_skip = Some(if count > 0 {
                            ResultSetSkip::ColumnDefs { remaining: count }
                        } else {
                            ResultSetSkip::Rows
                        });
                        Ok(Action::Progressed)
                    }
                    ReplyKind::Other => Ok(self.enter_desync("unexpected result set for a simple command")),
                    _ => {
                        self.phase = ProtocolPhase::Idle;
                        Ok(Action::Progressed)
                    }
                }
            }
        }
    }

    fn step_prepare_reply(&mut self, server: &mut DirectionalBuffer) -> Result<Action> {
        match take_frame(server)? {
            None => Ok(Action::NeedMore(Direction::ServerToClient)),
            Some((frame, ts)) => {
                if let Some(skip) = self.prepare_skip.take() {
                    let (outcome, next) = advance_prepare_skip(skip, &frame.payload);
                    return Ok(match outcome {
                        SkipOutcome::Continue => {
                            self.prepare_skip = Some(next);
                            Action::Progressed
                        }
                        SkipOutcome::Done => self.finish_prepare(ts),
                        SkipOutcome::Desync(reason) => self.enter_desync(reason),
                    });
                }

                match classify_reply(&frame.payload) {
                    ReplyKind::Err => {
                        self.pending_prepare_sql = None;
                        self.phase = ProtocolPhase::Idle;
                        Ok(Action::Progressed)
                    }
                    _ => {
                        let ok = read_prepare_ok(&frame.payload)?;
                        let statement_id = ok.statement_id();
                        let num_params = ok.num_params();
                        let num_columns = ok.num_columns();
                        self.pending_prepare = Some((statement_id, num_params));

                        if num_params > 0 {
                            self.prepare_skip = Some(PrepareSkip::ParamDefs {
                                remaining: num_params,
                                columns: num_columns,
                            });
                            Ok(Action::Progressed)
                        } else if num_columns > 0 {
                            self.prepare_skip = Some(PrepareSkip::ColumnDefs { remaining: num_columns });
                            Ok(Action::Progressed)
                        } else {
                            Ok(self.finish_prepare(ts))
                        }
                    }
                }
            }
        }
    }

    fn finish_prepare(&mut self, ts: i64) -> Action {
        let (statement_id, num_params) = self
            .pending_prepare
            .take()
            .expect("prepare completion without pending prepare state");
        let sql = self.pending_prepare_sql.take().unwrap_or_default();
        self.prepared
            .insert(statement_id, PreparedStatementEntry::new(sql.clone(), num_params));
        self.phase = ProtocolPhase::Idle;
        Action::Emit(ts, Event::StmtPrepare { statement_id, num_params, sql })
    }
}

/// Pulls one logical frame out of `buf`, if a complete one is buffered,
/// returning it along with the capture timestamp of its last byte.
fn take_frame(buf: &mut DirectionalBuffer) -> Result<Option<(crate::wire::framing::DecodedFrame, i64)>> {
    let avail = buf.available_len();
    let window = buf.peek(avail).expect("peek within available length always succeeds");
    match try_read_frame(window)? {
        None => Ok(None),
        Some(frame) => {
            let consumed = frame.consumed;
            let ts = buf.advance(consumed);
            Ok(Some((frame, ts)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::conn_id::{ConnectionId, Direction as Dir, Endpoint};
    use crate::capture::segment::Segment;
    use crate::constant::{CapabilityFlags, ColumnType};
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

    fn push_bytes(buf: &mut DirectionalBuffer, direction: Dir, seq: u32, bytes: &[u8], ts: i64) {
        buf.push(&Segment {
            connection: conn(),
            direction,
            seq,
            payload: bytes.to_vec(),
            capture_ts_ms: ts,
        });
    }

    /// Pushes `bytes` at `cursor`'s current value, then advances `cursor`
    /// by their length, so each direction's segments stay contiguous the
    /// way real TCP sequence numbers would.
    fn push_frame(
        buf: &mut DirectionalBuffer,
        direction: Dir,
        cursor: &mut u32,
        bytes: &[u8],
        ts: i64,
    ) {
        push_bytes(buf, direction, *cursor, bytes, ts);
        *cursor += bytes.len() as u32;
    }

    fn raw_initial_handshake() -> Vec<u8> {
        let mut body = Vec::new();
        write_int_1(&mut body, 10); // protocol version
        write_string_null(&mut body, "8.0.34-test");
        write_int_4(&mut body, 42); // connection id
        body.extend_from_slice(b"AAAAAAAA"); // auth_data_1 (8 bytes)
        write_int_1(&mut body, 0); // filler
        let caps = CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_PLUGIN_AUTH
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_CONNECT_WITH_DB;
        let cap_bits = caps.bits();
        write_int_2(&mut body, (cap_bits & 0xFFFF) as u16);
        write_int_1(&mut body, 45); // charset
        write_int_2(&mut body, 2); // status flags
        write_int_2(&mut body, (cap_bits >> 16) as u16);
        write_int_1(&mut body, 21); // auth data len
        body.extend_from_slice(&[0u8; 10]); // reserved
        body.extend_from_slice(b"BBBBBBBBBBBB"); // auth_data_2 (12 bytes)
        write_int_1(&mut body, 0); // trailing nul
        write_string_null(&mut body, "mysql_native_password");
        body
    }

    fn raw_query_ok_reply() -> Vec<u8> {
        let mut body = Vec::new();
        write_int_1(&mut body, 0x00);
        write_int_lenenc(&mut body, 1);
        write_int_lenenc(&mut body, 0);
        write_int_2(&mut body, 2);
        write_int_2(&mut body, 0);
        body
    }

    #[test]
    fn single_query_session_end_to_end() {
        let mut client = DirectionalBuffer::new(true);
        let mut server = DirectionalBuffer::new(true);
        let mut sm = ConnStateMachine::new();

        let mut server_bytes = Vec::new();
        write_frame(&mut server_bytes, 0, &raw_initial_handshake());
        push_bytes(&mut server, Dir::ServerToClient, 0, &server_bytes, 1);

        assert!(matches!(sm.step(&mut client, &mut server).unwrap(), Action::Progressed));
        assert_eq!(sm.phase(), ProtocolPhase::AwaitHandshakeResponse);

        let response = HandshakeResponse41 {
            capability_flags: CapabilityFlags::CLIENT_PROTOCOL_41 | CapabilityFlags::CLIENT_CONNECT_WITH_DB,
            max_packet_size: 16 * 1024 * 1024,
            charset: 45,
            username: "root",
            auth_response: b"",
            database: Some("app_db"),
            auth_plugin_name: None,
        };
        let mut resp_payload = Vec::new();
        write_handshake_response(&mut resp_payload, &response);
        let mut client_bytes = Vec::new();
        write_frame(&mut client_bytes, 1, &resp_payload);
        push_bytes(&mut client, Dir::ClientToServer, 0, &client_bytes, 2);

        match sm.step(&mut client, &mut server).unwrap() {
            Action::Emit(ts, Event::Handshake { schema }) => {
                assert_eq!(ts, 2);
                assert_eq!(schema, "app_db");
            }
            other => panic!("expected handshake event, got {other:?}"),
        }

        let mut ok_bytes = Vec::new();
        write_frame(&mut ok_bytes, 2, &raw_query_ok_reply());
        push_bytes(&mut server, Dir::ServerToClient, 4, &ok_bytes, 3);
        assert!(matches!(sm.step(&mut client, &mut server).unwrap(), Action::Progressed));
        assert_eq!(sm.phase(), ProtocolPhase::Idle);

        let mut query_payload = vec![CommandByte::Query as u8];
        query_payload.extend_from_slice(b"SELECT 1");
        let mut query_bytes = Vec::new();
        write_frame(&mut query_bytes, 0, &query_payload);
        push_bytes(&mut client, Dir::ClientToServer, 100, &query_bytes, 4);

        match sm.step(&mut client, &mut server).unwrap() {
            Action::Emit(ts, Event::Query { sql }) => {
                assert_eq!(ts, 4);
                assert_eq!(sql, "SELECT 1");
            }
            other => panic!("expected query event, got {other:?}"),
        }
        assert_eq!(sm.phase(), ProtocolPhase::AwaitCommandReply);

        let mut reply_bytes = Vec::new();
        write_frame(&mut reply_bytes, 1, &raw_query_ok_reply());
        push_bytes(&mut server, Dir::ServerToClient, 200, &reply_bytes, 5);
        assert!(matches!(sm.step(&mut client, &mut server).unwrap(), Action::Progressed));
        assert_eq!(sm.phase(), ProtocolPhase::Idle);

        let mut quit_bytes = Vec::new();
        write_frame(&mut quit_bytes, 0, &[CommandByte::Quit as u8]);
        push_bytes(&mut client, Dir::ClientToServer, 108, &quit_bytes, 6);
        match sm.step(&mut client, &mut server).unwrap() {
            Action::Emit(ts, Event::Quit) => assert_eq!(ts, 6),
            other => panic!("expected quit event, got {other:?}"),
        }
        assert_eq!(sm.phase(), ProtocolPhase::Closed);
    }

    #[test]
    fn prepare_then_execute_round_trip() {
        let mut client = DirectionalBuffer::new(true);
        let mut server = DirectionalBuffer::new(true);
        let mut sm = ConnStateMachine::new_mid_stream();

        let mut prepare_payload = vec![CommandByte::StmtPrepare as u8];
        prepare_payload.extend_from_slice(b"SELECT * FROM t WHERE a = ?");
        let mut bytes = Vec::new();
        write_frame(&mut bytes, 0, &prepare_payload);
        push_bytes(&mut client, Dir::ClientToServer, 0, &bytes, 1);
        assert!(matches!(sm.step(&mut client, &mut server).unwrap(), Action::Progressed));
        assert_eq!(sm.phase(), ProtocolPhase::AwaitPrepareReply);

        let mut ok_body = vec![0x00];
        write_int_4(&mut ok_body, 9); // statement id
        write_int_2(&mut ok_body, 0); // num columns
        write_int_2(&mut ok_body, 1); // num params
        ok_body.push(0);
        write_int_2(&mut ok_body, 0);
        let mut ok_bytes = Vec::new();
        write_frame(&mut ok_bytes, 1, &ok_body);
        push_bytes(&mut server, Dir::ServerToClient, 0, &ok_bytes, 2);
        assert!(matches!(sm.step(&mut client, &mut server).unwrap(), Action::Progressed));
        assert_eq!(sm.phase(), ProtocolPhase::AwaitPrepareReply);

        // Single parameter-definition packet, then its terminating EOF.
        let mut param_def_bytes = Vec::new();
        write_frame(&mut param_def_bytes, 2, &[0u8; 4]);
        push_bytes(&mut server, Dir::ServerToClient, 100, &param_def_bytes, 3);
        assert!(matches!(sm.step(&mut client, &mut server).unwrap(), Action::Progressed));

        let mut eof_bytes = Vec::new();
        let mut eof_body = vec![0xFE];
        write_int_2(&mut eof_body, 0);
        write_int_2(&mut eof_body, 2);
        write_frame(&mut eof_bytes, 3, &eof_body);
        push_bytes(&mut server, Dir::ServerToClient, 200, &eof_bytes, 4);
        match sm.step(&mut client, &mut server).unwrap() {
            Action::Emit(ts, Event::StmtPrepare { statement_id, num_params, sql }) => {
                assert_eq!(ts, 4);
                assert_eq!(statement_id, 9);
                assert_eq!(num_params, 1);
                assert_eq!(sql, "SELECT * FROM t WHERE a = ?");
            }
            other => panic!("expected stmt prepare event, got {other:?}"),
        }
        assert_eq!(sm.phase(), ProtocolPhase::Idle);
        assert_eq!(sm.prepared_statements().get(9).unwrap().num_params, 1);

        let mut execute_payload = vec![CommandByte::StmtExecute as u8];
        write_int_4(&mut execute_payload, 9);
        write_int_1(&mut execute_payload, 0);
        write_int_4(&mut execute_payload, 1);
        execute_payload.push(0); // null bitmap
        execute_payload.push(1); // new-params-bound
        execute_payload.push(ColumnType::MYSQL_TYPE_LONGLONG as u8);
        execute_payload.push(0);
        write_int_8(&mut execute_payload, 7u64);
        let mut exec_bytes = Vec::new();
        write_frame(&mut exec_bytes, 0, &execute_payload);
        push_bytes(&mut client, Dir::ClientToServer, 300, &exec_bytes, 5);
        match sm.step(&mut client, &mut server).unwrap() {
            Action::Emit(ts, Event::StmtExecute { statement_id, params }) => {
                assert_eq!(ts, 5);
                assert_eq!(statement_id, 9);
                assert_eq!(params, vec![crate::wire::value::ParamValue::Signed(7)]);
            }
            other => panic!("expected stmt execute event, got {other:?}"),
        }
        assert_eq!(sm.phase(), ProtocolPhase::AwaitExecuteReply);
    }

    #[test]
    fn execute_of_unknown_statement_desyncs_instead_of_erroring() {
        let mut client = DirectionalBuffer::new(true);
        let mut server = DirectionalBuffer::new(true);
        let mut sm = ConnStateMachine::new_mid_stream();

        let mut execute_payload = vec![CommandByte::StmtExecute as u8];
        write_int_4(&mut execute_payload, 99); // statement id never prepared
        write_int_1(&mut execute_payload, 0);
        write_int_4(&mut execute_payload, 1);
        let mut exec_bytes = Vec::new();
        write_frame(&mut exec_bytes, 0, &execute_payload);
        push_bytes(&mut client, Dir::ClientToServer, 0, &exec_bytes, 1);

        match sm.step(&mut client, &mut server).unwrap() {
            Action::Desynced(_) => {}
            other => panic!("expected desync, got {other:?}"),
        }
        assert_eq!(sm.phase(), ProtocolPhase::Idle);

        // Recovery: next well-formed client frame with seq 0 and a valid opcode.
        let mut recovery_bytes = Vec::new();
        write_frame(&mut recovery_bytes, 0, &[CommandByte::Ping as u8]);
        push_bytes(&mut client, Dir::ClientToServer, exec_bytes.len() as u32, &recovery_bytes, 2);

        assert!(matches!(sm.step(&mut client, &mut server).unwrap(), Action::Progressed));
        assert_eq!(sm.phase(), ProtocolPhase::Idle);
    }

    #[test]
    fn unknown_opcode_triggers_desync_and_recovers_at_next_valid_frame() {
        let mut client = DirectionalBuffer::new(true);
        let mut server = DirectionalBuffer::new(true);
        let mut sm = ConnStateMachine::new_mid_stream();

        let mut bogus_bytes = Vec::new();
        write_frame(&mut bogus_bytes, 0, &[0xAA, 0xBB]);
        push_bytes(&mut client, Dir::ClientToServer, 0, &bogus_bytes, 1);
        match sm.step(&mut client, &mut server).unwrap() {
            Action::Desynced(_) => {}
            other => panic!("expected desync, got {other:?}"),
        }

        // Garbage byte, then a well-formed ping frame with seq 0.
        let mut recovery_bytes = vec![0x42];
        write_frame(&mut recovery_bytes, 0, &[CommandByte::Ping as u8]);
        push_bytes(&mut client, Dir::ClientToServer, 2, &recovery_bytes, 2);

        assert!(matches!(sm.step(&mut client, &mut server).unwrap(), Action::Progressed));
        assert_eq!(sm.phase(), ProtocolPhase::Idle);
    }
}

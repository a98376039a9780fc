//! Client command opcodes and the handful of server replies that carry
//! more than a bare OK/ERR/EOF (`COM_STMT_PREPARE_OK`). Parameter decoding
//! for `COM_STMT_EXECUTE` lives in [`crate::wire::value`] and is invoked
//! from the connection state machine, which is the layer that actually
//! knows a statement's parameter count.

use zerocopy::byteorder::little_endian::{U16 as U16LE, U32 as U32LE};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::{Error, Result};
use crate::constant::CommandByte;
use crate::wire::primitive::*;
use crate::wire::value::ParamValue;

/// A client command recognized at the opcode level, before any
/// statement-table-dependent parameter decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Quit,
    InitDb(String),
    Query(String),
    FieldList(String),
    Ping,
    StmtPrepare(String),
    /// Parameter bytes are the raw section following `iteration-count`;
    /// decoding them requires the prepared statement's parameter count.
    StmtExecute {
        statement_id: u32,
        param_bytes: Vec<u8>,
    },
    StmtClose(u32),
    StmtReset(u32),
    StmtSendLongData {
        statement_id: u32,
        param_index: u16,
        data: Vec<u8>,
    },
    /// Recognized but not modeled in depth (e.g. `COM_CHANGE_USER`).
    Other(CommandByte),
    /// An opcode outside the known command set — the caller should treat
    /// this as a desync trigger.
    Unknown(u8),
}

pub fn decode_client_command(payload: &[u8]) -> Result<ClientCommand> {
    let (opcode, data) = read_int_1(payload)?;
    let Some(cmd) = CommandByte::from_u8(opcode) else {
        return Ok(ClientCommand::Unknown(opcode));
    };

    Ok(match cmd {
        CommandByte::Quit => ClientCommand::Quit,
        CommandByte::InitDb => ClientCommand::InitDb(String::from_utf8_lossy(data).into_owned()),
        CommandByte::Query => ClientCommand::Query(String::from_utf8_lossy(data).into_owned()),
        CommandByte::FieldList => {
            ClientCommand::FieldList(String::from_utf8_lossy(data).into_owned())
        }
        CommandByte::Ping => ClientCommand::Ping,
        CommandByte::StmtPrepare => {
            ClientCommand::StmtPrepare(String::from_utf8_lossy(data).into_owned())
        }
        CommandByte::StmtExecute => {
            let (statement_id, data) = read_int_4(data)?;
            let (_flags, data) = read_int_1(data)?;
            let (_iteration_count, data) = read_int_4(data)?;
            ClientCommand::StmtExecute {
                statement_id,
                param_bytes: data.to_vec(),
            }
        }
        CommandByte::StmtClose => {
            let (statement_id, _) = read_int_4(data)?;
            ClientCommand::StmtClose(statement_id)
        }
        CommandByte::StmtReset => {
            let (statement_id, _) = read_int_4(data)?;
            ClientCommand::StmtReset(statement_id)
        }
        CommandByte::StmtSendLongData => {
            let (statement_id, data) = read_int_4(data)?;
            let (param_index, data) = read_int_2(data)?;
            ClientCommand::StmtSendLongData {
                statement_id,
                param_index,
                data: data.to_vec(),
            }
        }
        other => ClientCommand::Other(other),
    })
}

/// `COM_STMT_PREPARE_OK`'s fixed 11-byte body (after the leading `0x00`).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
pub struct PrepareOk {
    statement_id: U32LE,
    num_columns: U16LE,
    num_params: U16LE,
    _reserved: u8,
    warning_count: U16LE,
}

impl PrepareOk {
    pub fn statement_id(&self) -> u32 {
        self.statement_id.get()
    }
    pub fn num_columns(&self) -> u16 {
        self.num_columns.get()
    }
    pub fn num_params(&self) -> u16 {
        self.num_params.get()
    }
    pub fn warning_count(&self) -> u16 {
        self.warning_count.get()
    }
}

pub fn read_prepare_ok(payload: &[u8]) -> Result<&PrepareOk> {
    let (header, data) = read_int_1(payload)?;
    if header != 0x00 {
        return Err(Error::Framing("expected prepare-OK header"));
    }
    if data.len() < 11 {
        return Err(Error::Framing("prepare-OK too short"));
    }
    PrepareOk::ref_from_bytes(&data[..11]).map_err(|_| Error::Framing("prepare-OK cast"))
}

// ---------------------------------------------------------------------
// Encoders used by the replay engine's own connection to the target.
// ---------------------------------------------------------------------

pub fn write_query(out: &mut Vec<u8>, sql: &str) {
    write_int_1(out, CommandByte::Query as u8);
    out.extend_from_slice(sql.as_bytes());
}

pub fn write_prepare(out: &mut Vec<u8>, sql: &str) {
    write_int_1(out, CommandByte::StmtPrepare as u8);
    out.extend_from_slice(sql.as_bytes());
}

pub fn write_execute(out: &mut Vec<u8>, statement_id: u32, params: &[ParamValue]) {
    write_int_1(out, CommandByte::StmtExecute as u8);
    write_int_4(out, statement_id);
    write_int_1(out, 0); // cursor flags: no cursor
    write_int_4(out, 1); // iteration-count, always 1

    if !params.is_empty() {
        crate::wire::value::encode_execute_params(out, params);
    }
}

pub fn write_close_statement(out: &mut Vec<u8>, statement_id: u32) {
    write_int_1(out, CommandByte::StmtClose as u8);
    write_int_4(out, statement_id);
}

pub fn write_reset_statement(out: &mut Vec<u8>, statement_id: u32) {
    write_int_1(out, CommandByte::StmtReset as u8);
    write_int_4(out, statement_id);
}

pub fn write_quit(out: &mut Vec<u8>) {
    write_int_1(out, CommandByte::Quit as u8);
}

pub fn write_ping(out: &mut Vec<u8>) {
    write_int_1(out, CommandByte::Ping as u8);
}

pub fn write_init_db(out: &mut Vec<u8>, database: &str) {
    write_int_1(out, CommandByte::InitDb as u8);
    out.extend_from_slice(database.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_query() {
        let mut payload = vec![CommandByte::Query as u8];
        payload.extend_from_slice(b"SELECT 1");
        assert_eq!(
            decode_client_command(&payload).unwrap(),
            ClientCommand::Query("SELECT 1".into())
        );
    }

    #[test]
    fn decodes_stmt_execute_header() {
        let mut payload = vec![CommandByte::StmtExecute as u8];
        write_int_4(&mut payload, 7);
        write_int_1(&mut payload, 0);
        write_int_4(&mut payload, 1);
        payload.extend_from_slice(&[0xAA, 0xBB]);
        match decode_client_command(&payload).unwrap() {
            ClientCommand::StmtExecute {
                statement_id,
                param_bytes,
            } => {
                assert_eq!(statement_id, 7);
                assert_eq!(param_bytes, vec![0xAA, 0xBB]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_opcode_is_flagged() {
        assert_eq!(decode_client_command(&[0xAA]).unwrap(), ClientCommand::Unknown(0xAA));
    }

    #[test]
    fn prepare_ok_parses() {
        let mut payload = vec![0x00];
        write_int_4(&mut payload, 7);
        write_int_2(&mut payload, 0);
        write_int_2(&mut payload, 1);
        payload.push(0);
        write_int_2(&mut payload, 0);
        let ok = read_prepare_ok(&payload).unwrap();
        assert_eq!(ok.statement_id(), 7);
        assert_eq!(ok.num_params(), 1);
    }
}

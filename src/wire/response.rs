//! Generic server reply framing: OK, ERR and EOF packets.

use crate::error::{Error, Result};
use crate::constant::ServerStatusFlags;
use crate::wire::primitive::*;
use zerocopy::byteorder::little_endian::U16 as U16LE;
use zerocopy::{FromBytes, Immutable, KnownLayout};

#[derive(Debug, Clone, Copy)]
pub struct OkPayloadBytes<'a>(pub &'a [u8]);

impl<'a> OkPayloadBytes<'a> {
    pub fn assert_eof(&self) -> Result<()> {
        if self.0.first() == Some(&0xFE) {
            Ok(())
        } else {
            Err(Error::Framing("expected EOF marker"))
        }
    }

    pub fn bytes(&self) -> &[u8] {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct OkPayload {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: ServerStatusFlags,
    pub warnings: u16,
}

impl TryFrom<OkPayloadBytes<'_>> for OkPayload {
    type Error = Error;

    fn try_from(bytes: OkPayloadBytes<'_>) -> Result<Self> {
        let (header, data) = read_int_1(bytes.bytes())?;
        if header != 0x00 && header != 0xFE {
            return Err(Error::Framing("OK packet header"));
        }

        let (affected_rows, data) = read_int_lenenc(data)?;
        let (last_insert_id, data) = read_int_lenenc(data)?;
        let (status_flags, data) = read_int_2(data)?;
        let (warnings, _data) = read_int_2(data)?;

        Ok(OkPayload {
            affected_rows,
            last_insert_id,
            status_flags: ServerStatusFlags::from_bits_truncate(status_flags),
            warnings,
        })
    }
}

#[derive(Debug)]
pub struct ErrPayloadBytes<'a>(pub &'a [u8]);

#[derive(Debug, Clone, thiserror::Error)]
#[error("ERROR {} ({}): {}", self.error_code, self.sql_state, self.message)]
pub struct ErrPayload {
    pub error_code: u16,
    pub sql_state: String,
    pub message: String,
}

impl TryFrom<ErrPayloadBytes<'_>> for ErrPayload {
    type Error = Error;

    fn try_from(bytes: ErrPayloadBytes<'_>) -> Result<Self> {
        let (header, data) = read_int_1(bytes.0)?;
        if header != 0xFF {
            return Err(Error::Framing("ERR packet header"));
        }

        let (error_code, data) = read_int_2(data)?;
        let (_marker, data) = read_string_fix(data, 1)?;
        let (sql_state, data) = read_string_fix(data, 5)?;

        Ok(ErrPayload {
            error_code,
            sql_state: String::from_utf8_lossy(sql_state).to_string(),
            message: String::from_utf8_lossy(data).to_string(),
        })
    }
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
pub struct EofPacket {
    warnings: U16LE,
    status_flags: U16LE,
}

impl EofPacket {
    pub fn warnings(&self) -> u16 {
        self.warnings.get()
    }

    pub fn status_flags(&self) -> ServerStatusFlags {
        ServerStatusFlags::from_bits_truncate(self.status_flags.get())
    }
}

/// Reads an EOF packet (header byte `0xFE`, payload shorter than 9 bytes).
pub fn read_eof_packet(payload: &[u8]) -> Result<&EofPacket> {
    let (header, data) = read_int_1(payload)?;
    if header != 0xFE {
        return Err(Error::Framing("expected EOF header"));
    }
    if data.len() < 4 {
        return Err(Error::Framing("EOF packet too short"));
    }
    EofPacket::ref_from_bytes(&data[..4]).map_err(|_| Error::Framing("EOF packet cast"))
}

/// Classifies the leading byte of a generic server reply so callers can
/// branch without re-parsing the whole packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Ok,
    Err,
    Eof,
    Other,
}

pub fn classify_reply(payload: &[u8]) -> ReplyKind {
    match payload.first() {
        Some(0x00) => ReplyKind::Ok,
        Some(0xFF) => ReplyKind::Err,
        Some(0xFE) if payload.len() < 9 => ReplyKind::Eof,
        _ => ReplyKind::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_packet_parses() {
        let mut payload = vec![0x00];
        write_int_lenenc(&mut payload, 5);
        write_int_lenenc(&mut payload, 0);
        write_int_2(&mut payload, 0x0002);
        write_int_2(&mut payload, 0);
        let ok = OkPayload::try_from(OkPayloadBytes(&payload)).unwrap();
        assert_eq!(ok.affected_rows, 5);
        assert!(
            ok.status_flags
                .contains(ServerStatusFlags::SERVER_STATUS_AUTOCOMMIT)
        );
    }

    #[test]
    fn err_packet_parses() {
        let mut payload = vec![0xFF];
        write_int_2(&mut payload, 1064);
        payload.extend_from_slice(b"#42000");
        payload.extend_from_slice(b"syntax error");
        let err = ErrPayload::try_from(ErrPayloadBytes(&payload)).unwrap();
        assert_eq!(err.error_code, 1064);
        assert_eq!(err.sql_state, "42000");
        assert_eq!(err.message, "syntax error");
    }

    #[test]
    fn classify_replies() {
        assert_eq!(classify_reply(&[0x00, 1, 2]), ReplyKind::Ok);
        assert_eq!(classify_reply(&[0xFF, 1, 2]), ReplyKind::Err);
        assert_eq!(classify_reply(&[0xFE, 0, 0]), ReplyKind::Eof);
        assert_eq!(classify_reply(&[0x02, 0, 0]), ReplyKind::Other);
    }
}

//! MySQL packet framing: `<len:3><seq:1><payload>`, with `len == 0xFFFFFF`
//! signalling a continuation that must be concatenated with the following
//! packet(s) until a short (or zero-length) packet terminates the logical
//! packet.
//!
//! The decode half is pull-based and slice-oriented so it composes with
//! [`crate::capture::stream::DirectionalBuffer`] without either module
//! depending on the other's concrete type; the encode half is used by the
//! replay engine's own connection to the target.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};

pub const MAX_PACKET_PAYLOAD: usize = 0xFF_FFFF;

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, IntoBytes)]
pub struct PacketHeader {
    pub length: [u8; 3],
    pub sequence_id: u8,
}

impl PacketHeader {
    pub fn encode(length: usize, sequence_id: u8) -> Self {
        let len = (length as u32).to_le_bytes();
        Self {
            length: [len[0], len[1], len[2]],
            sequence_id,
        }
    }

    pub fn length(&self) -> usize {
        u32::from_le_bytes([self.length[0], self.length[1], self.length[2], 0]) as usize
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        if data.len() < 4 {
            return Err(Error::NeedMoreBytes);
        }
        Self::ref_from_bytes(&data[..4]).map_err(|_| Error::Framing("packet header cast"))
    }
}

/// Result of attempting to pull one logical (continuation-concatenated)
/// packet out of a contiguous byte window.
pub struct DecodedFrame {
    pub payload: Vec<u8>,
    /// Sequence id of the first physical packet making up this frame —
    /// what the connection state machine tracks for desync recovery.
    pub first_sequence_id: u8,
    /// Total bytes consumed from the input, including every header.
    pub consumed: usize,
}

/// Attempts to decode one logical packet from the front of `data`.
///
/// Returns `Ok(None)` when `data` doesn't yet hold a complete packet (the
/// caller should wait for more bytes); returns `Err` only for a header
/// that cannot possibly be valid framing.
pub fn try_read_frame(data: &[u8]) -> Result<Option<DecodedFrame>> {
    let mut offset = 0usize;
    let mut payload = Vec::new();
    let mut first_sequence_id = None;

    loop {
        let header = match PacketHeader::from_bytes(&data[offset..]) {
            Ok(h) => h,
            Err(Error::NeedMoreBytes) => return Ok(None),
            Err(e) => return Err(e),
        };
        let length = header.length();
        let sequence_id = header.sequence_id;
        if first_sequence_id.is_none() {
            first_sequence_id = Some(sequence_id);
        }

        let body_start = offset + 4;
        let body_end = body_start + length;
        if data.len() < body_end {
            return Ok(None);
        }

        payload.extend_from_slice(&data[body_start..body_end]);
        offset = body_end;

        if length < MAX_PACKET_PAYLOAD {
            break;
        }
    }

    Ok(Some(DecodedFrame {
        payload,
        first_sequence_id: first_sequence_id.unwrap(),
        consumed: offset,
    }))
}

/// Encodes `payload` as one or more physical packets (splitting at
/// `MAX_PACKET_PAYLOAD`), assigning increasing sequence ids starting at
/// `sequence_id`. Returns the next unused sequence id.
pub fn write_frame(out: &mut Vec<u8>, mut sequence_id: u8, payload: &[u8]) -> u8 {
    let mut remaining = payload;
    loop {
        let chunk_len = remaining.len().min(MAX_PACKET_PAYLOAD);
        let chunk = &remaining[..chunk_len];
        let header = PacketHeader::encode(chunk_len, sequence_id);
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(chunk);
        sequence_id = sequence_id.wrapping_add(1);
        remaining = &remaining[chunk_len..];

        if chunk_len < MAX_PACKET_PAYLOAD {
            break;
        }
        if remaining.is_empty() {
            // A payload that is an exact multiple of MAX_PACKET_PAYLOAD
            // needs a trailing empty packet to terminate the logical frame.
            let header = PacketHeader::encode(0, sequence_id);
            out.extend_from_slice(header.as_bytes());
            sequence_id = sequence_id.wrapping_add(1);
            break;
        }
    }
    sequence_id
}

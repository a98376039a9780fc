//! Per-direction TCP reassembly: turns arbitrarily-ordered segments into
//! an ordered byte stream exposed through a peek/advance interface.
//!
//! Sequence-number arithmetic uses wrapping `u32` subtraction (the usual
//! TCP comparison trick) so a single capture's sequence space can wrap
//! without special-casing; multi-gigabyte single-flow captures that wrap
//! more than once are out of scope.

use std::collections::{BTreeMap, VecDeque};

use crate::capture::segment::Segment;

fn seq_diff(a: u32, b: u32) -> i64 {
    (a.wrapping_sub(b) as i32) as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    Open,
    /// Closed by FIN/RST/explicit close with all contiguous bytes consumed.
    Closed,
    /// Closed by an idle flush with a gap still outstanding.
    Truncated,
}

pub struct DirectionalBuffer {
    force_start: bool,
    base_established: bool,
    next_seq: u32,
    ready: VecDeque<u8>,
    /// `(chunk_len, capture_ts_ms)` queue parallel to `ready`, used to
    /// attribute the capture timestamp of the last byte consumed by an
    /// `advance` call.
    chunk_ts: VecDeque<(usize, i64)>,
    pending: BTreeMap<u32, (Vec<u8>, i64)>,
    last_update_ms: i64,
    status: BufferStatus,
}

impl DirectionalBuffer {
    pub fn new(force_start: bool) -> Self {
        Self {
            force_start,
            base_established: false,
            next_seq: 0,
            ready: VecDeque::new(),
            chunk_ts: VecDeque::new(),
            pending: BTreeMap::new(),
            last_update_ms: 0,
            status: BufferStatus::Open,
        }
    }

    /// Records that a SYN (or equivalent stream start marker) was observed
    /// at `seq`, establishing the base sequence number even when
    /// `force_start` is false.
    pub fn observe_start(&mut self, seq: u32) {
        if !self.base_established {
            self.next_seq = seq;
            self.base_established = true;
        }
    }

    pub fn is_started(&self) -> bool {
        self.base_established
    }

    pub fn status(&self) -> BufferStatus {
        self.status
    }

    pub fn last_update_ms(&self) -> i64 {
        self.last_update_ms
    }

    pub fn available_len(&self) -> usize {
        self.ready.len()
    }

    pub fn push(&mut self, segment: &Segment) {
        if self.status != BufferStatus::Open {
            return;
        }
        if !self.base_established {
            if self.force_start {
                self.next_seq = segment.seq;
                self.base_established = true;
            } else {
                return;
            }
        }

        self.last_update_ms = self.last_update_ms.max(segment.capture_ts_ms);
        self.insert(segment.seq, segment.payload.clone(), segment.capture_ts_ms);
        self.drain_pending();
    }

    fn insert(&mut self, seq: u32, payload: Vec<u8>, ts: i64) {
        if payload.is_empty() {
            return;
        }

        let diff = seq_diff(seq, self.next_seq);
        let end_diff = diff + payload.len() as i64;
        if end_diff <= 0 {
            // Entirely a retransmit of bytes already delivered.
            return;
        }

        let (seq, payload) = if diff < 0 {
            let trim = (-diff) as usize;
            (self.next_seq, payload[trim..].to_vec())
        } else {
            (seq, payload)
        };

        if seq == self.next_seq {
            let len = payload.len();
            self.ready.extend(payload);
            self.chunk_ts.push_back((len, ts));
            self.next_seq = self.next_seq.wrapping_add(len as u32);
        } else {
            self.pending.entry(seq).or_insert((payload, ts));
        }
    }

    fn drain_pending(&mut self) {
        loop {
            let Some(&key) = self.pending.keys().next() else {
                break;
            };
            if seq_diff(key, self.next_seq) > 0 {
                break;
            }
            let (payload, ts) = self.pending.remove(&key).unwrap();
            self.insert(key, payload, ts);
        }
    }

    /// Reads `n` bytes without consuming them; `None` if fewer than `n`
    /// bytes are currently contiguous.
    pub fn peek(&mut self, n: usize) -> Option<&[u8]> {
        if self.ready.len() < n {
            return None;
        }
        Some(&self.ready.make_contiguous()[..n])
    }

    /// Consumes `n` bytes (which must already be available via `peek`),
    /// returning the capture timestamp of the last byte consumed.
    pub fn advance(&mut self, n: usize) -> i64 {
        assert!(self.ready.len() >= n, "advance past available bytes");
        for _ in 0..n {
            self.ready.pop_front();
        }

        let mut remaining = n;
        let mut ts = self.last_update_ms;
        while remaining > 0 {
            let (len, chunk_ts) = self
                .chunk_ts
                .front_mut()
                .expect("chunk accounting desync");
            ts = *chunk_ts;
            if *len <= remaining {
                remaining -= *len;
                self.chunk_ts.pop_front();
            } else {
                *len -= remaining;
                remaining = 0;
            }
        }
        ts
    }

    /// Closes the buffer for a gap that never filled in after
    /// `FlushCloseOlderThan`; any pending out-of-order bytes are dropped,
    /// as they can never become contiguous now.
    pub fn close_truncated(&mut self) {
        if self.status == BufferStatus::Open {
            self.status = BufferStatus::Truncated;
            self.pending.clear();
        }
    }

    /// Closes the buffer cleanly (FIN/RST/explicit quit observed).
    pub fn close(&mut self) {
        if self.status == BufferStatus::Open {
            self.status = BufferStatus::Closed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::conn_id::{ConnectionId, Direction, Endpoint};
    use std::net::{IpAddr, Ipv4Addr};

    fn conn() -> ConnectionId {
        ConnectionId::new(
            Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1234),
            Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 3306),
        )
    }

    fn seg(seq: u32, payload: &[u8], ts: i64) -> Segment {
        Segment {
            connection: conn(),
            direction: Direction::ClientToServer,
            seq,
            payload: payload.to_vec(),
            capture_ts_ms: ts,
        }
    }

    #[test]
    fn in_order_segments_are_immediately_readable() {
        let mut buf = DirectionalBuffer::new(true);
        buf.push(&seg(0, b"hello", 10));
        buf.push(&seg(5, b"world", 20));
        assert_eq!(buf.peek(10).unwrap(), b"helloworld");
        assert_eq!(buf.advance(10), 20);
    }

    #[test]
    fn out_of_order_segments_reassemble() {
        let mut buf = DirectionalBuffer::new(true);
        buf.push(&seg(0, b"A", 1));
        buf.push(&seg(6, b"C", 3)); // out of order, buffered
        buf.push(&seg(3, b"B", 2));
        assert_eq!(buf.peek(1).unwrap(), b"A");
        // "B" segment (seq 3) still has a gap at offset 1..3, so only "A" is ready.
        assert_eq!(buf.available_len(), 1);
    }

    #[test]
    fn overlapping_retransmit_is_trimmed() {
        let mut buf = DirectionalBuffer::new(true);
        buf.push(&seg(0, b"abc", 1));
        buf.push(&seg(1, b"bcdef", 2)); // overlaps "bc", should append only "def"
        assert_eq!(buf.peek(6).unwrap(), b"abcdef");
    }

    #[test]
    fn duplicate_segment_is_discarded() {
        let mut buf = DirectionalBuffer::new(true);
        buf.push(&seg(0, b"abc", 1));
        buf.push(&seg(0, b"abc", 2));
        assert_eq!(buf.available_len(), 3);
    }

    #[test]
    fn without_force_start_bytes_are_dropped_until_observed_start() {
        let mut buf = DirectionalBuffer::new(false);
        buf.push(&seg(100, b"mid-stream", 1));
        assert_eq!(buf.available_len(), 0);
        buf.observe_start(100);
        buf.push(&seg(100, b"mid-stream", 1));
        assert_eq!(buf.available_len(), 10);
    }

    #[test]
    fn advance_timestamp_tracks_contributing_segment() {
        let mut buf = DirectionalBuffer::new(true);
        buf.push(&seg(0, b"ab", 5));
        buf.push(&seg(2, b"cd", 9));
        // Consuming all 4 bytes should report the timestamp of the segment
        // that delivered the last byte.
        assert_eq!(buf.advance(4), 9);
    }

    #[test]
    fn out_of_order_then_gap_fill_merges_pending() {
        let mut buf = DirectionalBuffer::new(true);
        buf.push(&seg(3, b"bbb", 2));
        buf.push(&seg(6, b"c", 3));
        assert_eq!(buf.available_len(), 0);
        buf.push(&seg(0, b"aaa", 1));
        assert_eq!(buf.peek(7).unwrap(), b"aaabbbc");
    }
}

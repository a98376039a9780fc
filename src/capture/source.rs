//! Packet source: the external collaborator that feeds segments to the
//! [`crate::capture::assembler::Assembler`]. No concrete pcap/pcapng reader
//! ships in this crate (out of scope, spec §1) — [`VecPacketSource`] is the
//! in-memory test double used by unit tests and doctests.

use crate::capture::segment::{CaptureInfo, Segment};

/// Yields `(Segment, CaptureInfo)` pairs in the order they were captured.
/// A real implementation would read a pcap/pcapng file and demultiplex
/// Ethernet/IP/TCP framing into segments; this crate only defines the seam.
pub trait PacketSource {
    fn next_packet(&mut self) -> Option<(Segment, CaptureInfo)>;
}

/// An in-memory [`PacketSource`] over a fixed `Vec`, used by tests.
#[derive(Debug, Clone, Default)]
pub struct VecPacketSource {
    items: std::collections::VecDeque<(Segment, CaptureInfo)>,
}

impl VecPacketSource {
    pub fn new(items: Vec<(Segment, CaptureInfo)>) -> Self {
        Self {
            items: items.into(),
        }
    }

    /// Convenience constructor for tests that don't care about `CaptureInfo`.
    pub fn from_segments(segments: Vec<Segment>) -> Self {
        Self::new(
            segments
                .into_iter()
                .map(|s| (s, CaptureInfo::default()))
                .collect(),
        )
    }
}

impl PacketSource for VecPacketSource {
    fn next_packet(&mut self) -> Option<(Segment, CaptureInfo)> {
        self.items.pop_front()
    }
}

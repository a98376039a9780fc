//! Capture side: turns a stream of TCP segments into a canonical event log.
//!
//! [`assembler::Assembler`] is the entry point — it owns the per-connection
//! table, feeds each connection's pair of [`stream::DirectionalBuffer`]s
//! into its [`state_machine::ConnStateMachine`], and routes completed
//! [`event::Event`]s to a [`sink::EventSink`].

pub mod assembler;
pub mod conn_id;
pub mod event;
pub mod prepared;
pub mod segment;
pub mod sink;
pub mod source;
pub mod state_machine;
pub mod stream;

pub use assembler::{Assembler, AssemblerConfig};
pub use conn_id::{ConnectionId, Direction, Endpoint};
pub use event::{decode_event, encode_event, Event};
pub use prepared::{PreparedStatementEntry, PreparedStatementTable};
pub use segment::{CaptureInfo, Segment};
pub use sink::{EventSink, FileEventSink, VecEventSink};
pub use source::{PacketSource, VecPacketSource};
pub use state_machine::{Action, ConnStateMachine, ProtocolPhase};
pub use stream::{BufferStatus, DirectionalBuffer};

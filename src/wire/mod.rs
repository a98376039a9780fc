//! MySQL client/server wire protocol: framing, generic replies, handshake
//! and auth, command opcodes, and the parameter-value universe. Decoding
//! is used by the capture pipeline; encoding is used by the replay
//! engine's own connection to the target — both halves share the same
//! primitives so they can never disagree about layout.

pub mod command;
pub mod framing;
pub mod handshake;
pub mod primitive;
pub mod response;
pub mod value;

use thiserror::Error;

use crate::wire::response::ErrPayload;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("short read: need more bytes")]
    NeedMoreBytes,

    #[error("invalid frame: {0}")]
    Framing(&'static str),

    #[error("protocol desync: {0}")]
    Desync(&'static str),

    #[error("event codec error: {0}")]
    EventCodec(String),

    #[error("server error: {0}")]
    Server(#[from] ErrPayload),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("transport closed")]
    TransportClosed,

    #[error("query timed out")]
    Timeout,

    #[error("bad config: {0}")]
    Config(String),

    #[error("no statement registered for id {0}")]
    MissingStatement(u64),

    #[error("unsupported auth plugin: {0}")]
    UnsupportedAuthPlugin(String),
}

impl Error {
    /// True for errors that the replay worker treats as a transport fault
    /// rather than an ordinary query/prepare/execute failure.
    pub fn is_transport_fault(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::TransportClosed | Error::Timeout
        )
    }
}

impl<Src, Dst: ?Sized> From<zerocopy::CastError<Src, Dst>> for Error {
    fn from(_err: zerocopy::CastError<Src, Dst>) -> Self {
        Error::Framing("zerocopy cast failed")
    }
}

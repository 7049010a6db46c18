//! Peer-wire protocol types: the message codec, the handshake codec, and
//! per-peer session state. Nothing in this module owns a socket or a task —
//! that lives in `conn`, which feeds decoded messages to the single
//! torrent-owned dispatcher instead of each peer running its own loop.

pub mod handshake;
pub mod message;
pub mod state;

pub use handshake::{Handshake, HandshakeCodec};
pub use message::{Message, MessageCodec};
pub use state::{PeerSession, SessionState};

#[derive(thiserror::Error, Debug)]
pub enum PeerError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake provided incorrect protocol")]
    IncorrectProtocol,

    #[error("handshake provided incorrect info-hash")]
    IncorrectInfoHash,

    #[error("no handshake recieved")]
    NoHandshake,

    #[error("invalid message ID: {0}")]
    InvalidMessageId(u8),

    #[error("bitfield sent before handshake")]
    UnexpectedBitfield,

    #[error("invalid message payload")]
    InvalidMessage,

    #[error("connection timeout")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, PeerError>;

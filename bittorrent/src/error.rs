use crate::{
    disk::{AllocationError, DiskError},
    tracker::TrackerError,
};

/// Errors raised by the peer engine itself (dispatcher, completion pipeline,
/// tick loop). Disk and tracker errors are defined closer to their owning
/// modules and folded in here via `#[from]`, matching how the rest of the
/// crate reports errors per subsystem rather than through one giant enum.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {

    /// A peer violated the wire protocol in a way that warrants disconnecting
    /// just that peer, not the torrent.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// Handshake named an info-hash we are not tracking.
    #[error("unknown info-hash")]
    UnknownInfoHash,

    /// Message kind we don't understand at all.
    #[error("unsupported message")]
    UnsupportedMessage,

    /// Disk write failed inside the piece-completion pipeline; the torrent
    /// moves to `ModeState::Error`.
    #[error("disk write failed: {0}")]
    WriteFailure(#[from] DiskError),

    /// Hash fetch failed inside the piece-completion pipeline; the torrent
    /// moves to `ModeState::Error`.
    #[error("hash read failed: {0}")]
    ReadFailure(DiskError),

    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),

    /// Raised only from `Torrent::new`, before the torrent has a dispatch
    /// task of its own to move into `ModeState::Error`.
    #[error("failed to allocate torrent on disk: {0}")]
    Allocation(#[from] AllocationError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel closed: {0}")]
    Channel(String),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for EngineError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        EngineError::Channel(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

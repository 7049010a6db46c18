//! Trait boundaries between the per-torrent engine and the things it does
//! not implement a policy for itself: disk I/O, piece selection, wire I/O,
//! choke algorithm, tracker announces, DHT, local discovery and web seeds.
//! The engine calls through these; it never reaches into a concrete disk or
//! picker type directly, mirroring how `Tracker`/`DiskCommand` decouple the
//! original per-peer session from its collaborators.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::{
    block::{BlockData, BlockInfo},
    disk::DiskError,
    metainfo::PieceHash,
    p2p::message::Message,
    ID,
};

/// Owns piece storage on disk. A torrent's dispatcher calls `write` on every
/// accepted block and `get_hash` once a piece's last block lands; neither
/// call buffers a whole piece in the engine itself.
#[async_trait]
pub trait DiskManager: Send + Sync {
    async fn write(&self, torrent: ID, block: BlockData) -> Result<(), DiskError>;

    async fn read(&self, torrent: ID, block: BlockInfo) -> Result<Vec<u8>, DiskError>;

    /// Fetches the expected hash for `piece_index` so the engine can compare
    /// it against freshly written data itself, rather than trusting the
    /// disk layer's own verdict.
    async fn get_hash(&self, torrent: ID, piece_index: u32) -> Result<PieceHash, DiskError>;
}

/// Tracks piece availability and in-flight block requests. Concrete state
/// (bitfields, partial pieces, end-game) lives in `picker`; the engine only
/// ever sees this contract.
pub trait PieceManager: Send + Sync {
    /// Records a peer's successfully written block. Returns the set of
    /// peers that contributed to the owning piece, for attribution when the
    /// piece later fails or passes its hash check.
    fn piece_data_received(&self, peer: SocketAddr, block: &BlockInfo) -> bool;

    /// Chooses up to `count` further blocks to request from `peer`, given
    /// its bitfield.
    fn add_piece_requests(&self, peer: SocketAddr, peer_bitfield: &crate::Bitfield, count: usize) -> Vec<BlockInfo>;

    fn cancel_requests(&self, peer: SocketAddr, blocks: &[BlockInfo]);

    /// A peer rejected (BEP 6) or failed to honour a request we made of it.
    fn request_rejected(&self, peer: SocketAddr, block: &BlockInfo);

    /// Whether the peer's bitfield contains any piece we still want.
    fn is_interesting(&self, peer_bitfield: &crate::Bitfield) -> bool;

    /// Marks a piece as fully verified (or, on failure, returns its blocks
    /// to the free pool for re-request).
    fn piece_hashed(&self, piece_index: u32, valid: bool);

    fn contributors(&self, piece_index: u32) -> Vec<SocketAddr>;

    /// Records a peer's full bitfield (or `HaveAll`/`HaveNone` expanded to
    /// one) for rarest-first frequency bookkeeping.
    fn record_bitfield(&self, peer_bitfield: &crate::Bitfield);

    /// Records a single `Have` announcement for frequency bookkeeping.
    fn record_have(&self, piece_index: u32);

    /// Seeds the picker's notion of pieces we already own, at torrent
    /// startup once the initial hash-check has run.
    fn seed_own_bitfield(&self, bf: &crate::Bitfield);
}

/// The engine's only way to talk wire bytes. A connection manager owns the
/// socket read/write tasks; the dispatcher only ever sees decoded
/// `Message`s arriving on a channel and queues outgoing ones back through
/// here, matching how `PeerHandle` decoupled peer state from its socket.
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    async fn connect(&self, addr: SocketAddr) -> std::io::Result<()>;

    /// Hands off an already-accepted inbound socket from the torrent's
    /// listener. Only `TcpConnectionManager` does anything with this; other
    /// implementations (tests, a future non-TCP transport) can ignore it.
    async fn accept(&self, _addr: SocketAddr, _socket: TcpStream) {}

    async fn send(&self, peer: SocketAddr, message: Message) -> std::io::Result<()>;

    async fn disconnect(&self, peer: SocketAddr);
}

/// Decides which peers get unchoked. Left as a trait per the engine's
/// Non-goals around rate-based/tit-for-tat policy; a round-robin or
/// no-op implementation is enough to exercise the tick loop.
pub trait Unchoker: Send + Sync {
    fn choose_unchoked(&self, candidates: &[SocketAddr], max_unchoked: usize) -> Vec<SocketAddr>;
}

#[async_trait]
pub trait TrackerManager: Send + Sync {
    async fn announce(
        &self,
        event: Option<crate::tracker::Event>,
        uploaded: u64,
        downloaded: u64,
        left: u64,
    ) -> Result<Vec<SocketAddr>, crate::tracker::TrackerError>;
}

#[async_trait]
pub trait DhtEngine: Send + Sync {
    async fn get_peers(&self, info_hash: ID) -> Vec<SocketAddr>;

    async fn announce(&self, info_hash: ID, port: u16);
}

#[async_trait]
pub trait LocalPeerDiscovery: Send + Sync {
    async fn announce(&self, info_hash: ID, port: u16);

    fn discovered(&self) -> Vec<SocketAddr>;
}

/// BEP 19 web seeds. Attached only after `EngineSettings::web_seed_delay`
/// has elapsed and download speed is below `web_seed_speed_trigger`.
#[async_trait]
pub trait WebSeedPool: Send + Sync {
    async fn fetch(&self, block: BlockInfo) -> Result<Vec<u8>, DiskError>;

    fn urls(&self) -> Vec<url::Url>;
}

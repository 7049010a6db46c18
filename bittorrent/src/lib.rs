#![allow(dead_code)]

#[macro_use]
extern crate serde_derive;

mod block;
mod collab;
mod conf;
mod conn;
mod de;
mod disk;
mod error;
mod fastpeer;
mod metainfo;
mod mode;
mod p2p;
mod picker;
mod stats;
mod store;
mod torrent;
mod tracker;
mod unchoke;

pub mod sync;

const BLOCK_SIZE: usize = 0x4000;

/// The bitfield represents the piece availability of a torrent, one bit per
/// piece, most significant bit first (piece 0 is the highest bit of byte 0).
pub type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

/// 20-byte SHA-1 identifier, used for both info-hashes and peer ids.
pub type ID = [u8; 20];

pub use block::{BlockData, BlockInfo};
pub use collab::{
    ConnectionManager, DhtEngine, DiskManager, LocalPeerDiscovery, PieceManager, TrackerManager,
    Unchoker, WebSeedPool,
};
pub use conf::{ClientConfig, EngineSettings, TorrentConfig};
pub use conn::{InboundEvent, TcpConnectionManager};
pub use error::EngineError;
pub use metainfo::{MetaInfo, PieceHash};
pub use mode::ModeState;
pub use torrent::Torrent;
pub use unchoke::RoundRobinUnchoker;

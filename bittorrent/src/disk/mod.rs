//! Owns all on-disk state for every torrent the engine is running. Each
//! torrent's dispatcher calls through the `DiskManager` trait (see
//! `collab.rs`) directly rather than over a command channel to a separate
//! task: writes and reads run on `spawn_blocking` threads, so there is no
//! need for the teacher's dedicated disk task to serialise access.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    block::{BlockData, BlockInfo},
    collab::DiskManager,
    metainfo::{MetaInfo, PieceHash},
    store::StoreInfo,
    ID,
};

mod io;
mod store;

use store::TorrentStore;

#[derive(thiserror::Error, Debug)]
pub enum DiskError {

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("io error: expected {expected} bytes, got {actual}")]
    IoSizeError {
        expected: usize,
        actual: usize,
    },

    #[error("sync error: {0}")]
    SyncError(String),

    #[error("torrent {0} not found")]
    TorrentNotFound(String),
}

// Errors related to allocating a new torrent to disk.
#[derive(thiserror::Error, Debug)]
pub enum AllocationError {

    #[error("torrent already exists in disk manager")]
    DuplicateTorrent,

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl<T> From<std::sync::PoisonError<T>> for DiskError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        DiskError::SyncError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DiskError>;

/// `DiskManager` backed by real files, keyed by info hash. One instance is
/// shared across every torrent the engine runs.
#[derive(Debug, Default)]
pub struct Disk {
    torrents: RwLock<HashMap<ID, Arc<TorrentStore>>>,
}

impl Disk {
    pub fn new() -> Self {
        Self { torrents: RwLock::new(HashMap::new()) }
    }

    /// Allocates (creating files as needed) and registers a torrent, then
    /// returns a bitfield of the pieces that already exist correctly on
    /// disk, per spec's pending-file hash pass.
    pub async fn add_torrent(
        &self,
        info_hash: ID,
        metainfo: &MetaInfo,
        output_dir: PathBuf,
    ) -> std::result::Result<crate::Bitfield, AllocationError> {
        if self.torrents.read().await.contains_key(&info_hash) {
            return Err(AllocationError::DuplicateTorrent);
        }

        let store_info = StoreInfo::new(metainfo, output_dir);
        let torrent = TorrentStore::new(store_info, metainfo)?;
        let bitfield = torrent.check_existing_files().await;

        self.torrents.write().await.insert(info_hash, Arc::new(torrent));
        Ok(bitfield)
    }

    pub async fn remove_torrent(&self, info_hash: ID) {
        self.torrents.write().await.remove(&info_hash);
    }

    fn torrent_not_found(info_hash: ID) -> DiskError {
        DiskError::TorrentNotFound(hex::encode(info_hash))
    }

    async fn get(&self, info_hash: ID) -> Result<Arc<TorrentStore>> {
        self.torrents
            .read()
            .await
            .get(&info_hash)
            .cloned()
            .ok_or_else(|| Self::torrent_not_found(info_hash))
    }
}

#[async_trait]
impl DiskManager for Disk {
    async fn write(&self, torrent: ID, block: BlockData) -> Result<()> {
        self.get(torrent).await?.write_block(block).await
    }

    async fn read(&self, torrent: ID, block: BlockInfo) -> Result<Vec<u8>> {
        self.get(torrent).await?.read_block(block).await
    }

    async fn get_hash(&self, torrent: ID, piece_index: u32) -> Result<PieceHash> {
        self.get(torrent).await?.hash_piece(piece_index as usize).await
    }
}

use std::{ops::Range, sync::{Arc, Mutex}};

use sha1::Digest;
use tokio::sync::RwLock as AsyncRwLock;

use crate::{
    block::{BlockData, BlockInfo},
    metainfo::{MetaInfo, PieceHash},
    store::StoreInfo,
    sync::AsyncSemaphore,
    Bitfield,
};

use super::{
    io::{file_range_for, read_range, write_range},
    AllocationError, Result,
};

/// One file on disk, holding its byte range within the torrent as a whole.
#[derive(Debug)]
pub struct TorrentFile {
    pub offset: usize,
    pub len: usize,
    pub file_lock: std::sync::RwLock<std::fs::File>,
}

impl TorrentFile {
    pub fn byte_range(&self) -> Range<usize> {
        self.offset..(self.offset + self.len)
    }
}

/// Disk-side state for a single torrent: its files, a read cache keyed by
/// piece index, and the piece hashes needed to verify freshly written data.
#[derive(Debug)]
pub struct TorrentStore {
    info: StoreInfo,
    files: Arc<Vec<TorrentFile>>,
    piece_hashes: Vec<PieceHash>,
    read_cache: Mutex<lru::LruCache<usize, Arc<Vec<u8>>>>,
    // Each write only touches the files under its own piece's byte range, so
    // this exists purely to serialise the read-cache invalidation against
    // concurrent writes to the same piece rather than to gate file I/O.
    write_guard: AsyncRwLock<()>,
    // Bounds how many `spawn_blocking` file operations this torrent has in
    // flight at once, independent of how many peers are pushing blocks.
    io_limit: AsyncSemaphore,
}

const MAX_CONCURRENT_IO: usize = 8;

impl TorrentStore {
    pub fn new(info: StoreInfo, metainfo: &MetaInfo) -> std::result::Result<Self, AllocationError> {
        if !info.output_dir.is_dir() {
            std::fs::create_dir_all(&info.output_dir)?;
            tracing::info!("created missing output directory: {:?}", info.output_dir);
        }

        let mut files = Vec::with_capacity(info.files.len());
        for file in &info.files {
            if let Some(parent) = file.path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let full_path = info.output_dir.join(&file.path);
            files.push(TorrentFile {
                offset: file.offset,
                len: file.length,
                file_lock: std::sync::RwLock::new(
                    std::fs::OpenOptions::new()
                        .create(true)
                        .read(true)
                        .write(true)
                        .open(&full_path)?,
                ),
            });
            tracing::debug!("opened file {:?}", full_path);
        }

        let piece_hashes = (0..info.num_pieces).map(|idx| metainfo.piece_hash(idx)).collect();

        Ok(Self {
            info,
            files: Arc::new(files),
            piece_hashes,
            read_cache: Mutex::new(lru::LruCache::new(std::num::NonZeroUsize::new(64).unwrap())),
            write_guard: AsyncRwLock::new(()),
            io_limit: AsyncSemaphore::new(MAX_CONCURRENT_IO),
        })
    }

    pub async fn write_block(&self, block: BlockData) -> Result<()> {
        let offset = self.info.piece_byte_offset(block.piece_idx) + block.offset;
        let len = block.data.len();
        let range = file_range_for(&self.files, offset, len);
        let files = self.files.clone();

        let _guard = self.write_guard.read().await;
        let _permit = self.io_limit.acquire().await;
        tokio::task::spawn_blocking(move || write_range(&files[range], offset, &block.data))
            .await
            .expect("disk write task panicked")?;

        self.read_cache.lock()?.pop(&block.piece_idx);
        Ok(())
    }

    pub async fn read_block(&self, block: BlockInfo) -> Result<Vec<u8>> {
        if let Some(cached) = self.read_cache.lock()?.get(&block.piece_idx) {
            let start = block.offset;
            let end = start + block.len;
            return Ok(cached[start..end].to_vec());
        }

        let piece = self.read_piece(block.piece_idx).await?;
        let start = block.offset;
        let end = start + block.len;
        let slice = piece[start..end].to_vec();
        self.read_cache.lock()?.put(block.piece_idx, piece);
        Ok(slice)
    }

    async fn read_piece(&self, piece_idx: usize) -> Result<Arc<Vec<u8>>> {
        let offset = self.info.piece_byte_offset(piece_idx);
        let len = self.info.piece_length(piece_idx);
        let range = file_range_for(&self.files, offset, len);
        let files = self.files.clone();

        let _permit = self.io_limit.acquire().await;
        let data = tokio::task::spawn_blocking(move || read_range(&files[range], offset, len))
            .await
            .expect("disk read task panicked")?;
        Ok(Arc::new(data))
    }

    /// Reads a whole piece's current on-disk bytes and hashes them, for the
    /// engine to compare against the torrent's authoritative hash.
    pub async fn hash_piece(&self, piece_idx: usize) -> Result<PieceHash> {
        let data = self.read_piece(piece_idx).await?;
        let mut hasher = sha1::Sha1::new();
        hasher.update(&*data);
        let hash: [u8; 20] = hasher.finalize().into();
        Ok(PieceHash::Sha1(hash))
    }

    /// Hashes every piece already present on disk, for a torrent resumed
    /// from existing files.
    pub async fn check_existing_files(&self) -> Bitfield {
        let mut bitfield = Bitfield::repeat(false, self.info.num_pieces as usize);
        for idx in 0..self.info.num_pieces as usize {
            match self.hash_piece(idx).await {
                Ok(hash) if hash == self.piece_hashes[idx] => bitfield.set(idx, true),
                _ => {}
            }
        }
        bitfield
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::MetaInfo;

    #[tokio::test]
    async fn test_write_then_read_block_round_trip() {
        let metainfo = MetaInfo::new("tests/test_torrents/test_small.torrent").unwrap();
        let tmp = tempfile::TempDir::new().unwrap();
        let info = StoreInfo::new(&metainfo, tmp.path().to_path_buf());
        let store = TorrentStore::new(info, &metainfo).unwrap();

        let data = vec![7u8; 1024];
        store
            .write_block(BlockData { piece_idx: 0, offset: 0, data: data.clone() })
            .await
            .unwrap();

        let read = store
            .read_block(BlockInfo { piece_idx: 0, offset: 0, len: 1024 })
            .await
            .unwrap();
        assert_eq!(read, data);
    }

    #[tokio::test]
    async fn test_hash_piece_matches_freshly_written_data() {
        let metainfo = MetaInfo::new("tests/test_torrents/test_small.torrent").unwrap();
        let tmp = tempfile::TempDir::new().unwrap();
        let info = StoreInfo::new(&metainfo, tmp.path().to_path_buf());
        let piece_len = info.piece_length(0);
        let store = TorrentStore::new(info, &metainfo).unwrap();

        let data = vec![3u8; piece_len];
        store
            .write_block(BlockData { piece_idx: 0, offset: 0, data: data.clone() })
            .await
            .unwrap();

        let hash = store.hash_piece(0).await.unwrap();
        let mut hasher = sha1::Sha1::new();
        hasher.update(&data);
        let expected: [u8; 20] = hasher.finalize().into();
        assert_eq!(hash, PieceHash::Sha1(expected));
    }
}

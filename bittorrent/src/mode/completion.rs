//! The piece-completion pipeline (spec §4.4): turns an accepted block into a
//! disk write, and a piece's last block into a hash check and per-peer
//! pass/fail attribution. Grounded on the teacher's `Torrent::handle_piece_write`
//! plus `disk/torrent.rs::write_block`, split here into explicit write-then-verify
//! steps since the disk layer no longer buffers a whole piece itself (see
//! `disk/store.rs`).
//!
//! Every await in this module happens inline on the torrent's own dispatch
//! task, so there is never a concurrent mutator to race against between
//! steps — unlike the spec's source, which models steps 3 and 5's
//! cancellation checks as guarding against a *different* task committing a
//! stale write after a Mode swap. Our pipeline never spawns that second
//! task, so the checks would be unreachable dead code; dropped here and
//! recorded in DESIGN.md.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use crate::{
    block::{num_blocks, BlockData, BlockInfo},
    torrent::Torrent,
    EngineError,
};

/// Consecutive bad pieces a peer may contribute to before its socket is
/// closed (spec invariant: exactly 5).
const MAX_HASH_FAILURES: u32 = 5;

/// In-flight block count for a piece that has received at least one but not
/// all of its blocks. The picker's own partial-piece bookkeeping is private
/// behind `PieceManager`, so the dispatcher keeps this one counter itself to
/// know precisely when a piece's last block has landed.
#[derive(Debug)]
pub struct WriteProgress {
    blocks_written: u32,
    total_blocks: u32,
}

/// Step 1: hands an inbound `Piece` message's block to the picker, writes it
/// to disk if accepted, and on the piece's last block drives the hash check
/// (steps 5-7).
pub async fn on_block(torrent: &mut Torrent, peer: SocketAddr, block: BlockData) -> Result<(), EngineError> {
    let info = BlockInfo { piece_idx: block.piece_idx, offset: block.offset, len: block.data.len() };

    if let Some(session) = torrent.peers.get_mut(&peer) {
        session.pieces_received += 1;
        session.requested.remove(&info);
        session.last_block_received = std::time::Instant::now();
    }

    if !torrent.ctx.picker.piece_data_received(peer, &info) {
        tracing::trace!("dropped duplicate or unsolicited block from {}: {:?}", peer, info);
        return Ok(());
    }

    let piece_idx = block.piece_idx;
    torrent.ctx.disk.write(torrent.ctx.info_hash, block).await?;

    let piece_len = torrent.ctx.store_info.piece_length(piece_idx);
    let progress = torrent
        .write_progress
        .entry(piece_idx)
        .or_insert_with(|| WriteProgress { blocks_written: 0, total_blocks: num_blocks(piece_len) });
    progress.blocks_written += 1;

    if progress.blocks_written < progress.total_blocks {
        return Ok(());
    }
    torrent.write_progress.remove(&piece_idx);

    finish_piece(torrent, piece_idx).await
}

/// Steps 5-7: fetches and compares the piece hash, attributes the result to
/// every contributing peer, and on success queues the index for the next
/// `Have` broadcast.
async fn finish_piece(torrent: &mut Torrent, piece_idx: usize) -> Result<(), EngineError> {
    let contributors = torrent.ctx.picker.contributors(piece_idx as u32);

    let got = torrent
        .ctx
        .disk
        .get_hash(torrent.ctx.info_hash, piece_idx as u32)
        .await
        .map_err(EngineError::ReadFailure)?;
    let expected = torrent.ctx.metainfo.piece_hash(piece_idx as u32);
    let valid = got == expected;

    torrent.ctx.picker.piece_hashed(piece_idx as u32, valid);

    if valid {
        tracing::debug!("piece {} verified, {} contributors", piece_idx, contributors.len());
        torrent.own_bitfield.set(piece_idx, true);
        torrent.finished_pieces.push_back(piece_idx as u32);
        for addr in &contributors {
            if let Some(session) = torrent.peers.get_mut(addr) {
                session.total_hash_failures = 0;
            }
        }
    } else {
        torrent.hash_failures += 1;
        tracing::warn!("piece {} failed hash check, blaming {} contributors", piece_idx, contributors.len());
        let mut to_disconnect = Vec::new();
        for addr in &contributors {
            if let Some(session) = torrent.peers.get_mut(addr) {
                session.total_hash_failures += 1;
                if session.total_hash_failures == MAX_HASH_FAILURES {
                    to_disconnect.push(*addr);
                }
            }
        }
        for addr in to_disconnect {
            tracing::warn!("disconnecting {}: {} consecutive bad pieces", addr, MAX_HASH_FAILURES);
            torrent.ctx.connections.disconnect(addr).await;
            torrent.peers.remove(&addr);
        }
    }

    Ok(())
}

/// §4.6's pending-file hash pass: opportunistically re-hashes pieces whose
/// file was promoted from "do not download" to downloadable since the
/// initial hash-check, guarded by `hashing_pending_files` so a tick that
/// fires while a previous pass is still running is a no-op rather than a
/// second concurrent scan.
///
/// `store::FileInfo` carries no priority field in this build, so no file
/// ever makes that transition and this always returns immediately after
/// taking and releasing the guard. A mode that adds per-file priority would
/// walk `torrent.ctx.store_info.files` here, and for each newly-downloadable
/// file whose boundary piece is still unhashed, re-run `finish_piece` across
/// its piece range.
pub async fn try_hash_pending_files(torrent: &mut Torrent) -> Result<(), EngineError> {
    if torrent.hashing_pending_files.swap(true, Ordering::Relaxed) {
        return Ok(());
    }
    torrent.hashing_pending_files.store(false, Ordering::Relaxed);
    Ok(())
}

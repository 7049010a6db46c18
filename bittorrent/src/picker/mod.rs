use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::RwLock,
};

use crate::{block::BlockRequest, collab::PieceManager, Bitfield};

pub mod partial_piece;
pub mod piece_picker;

use partial_piece::PartialPiece;
use piece_picker::PiecePicker;

/// Piece/block selection: rarest-first-ish new-piece picking backed by
/// `PiecePicker`, sequential in-piece block picking with an end-game
/// fallback backed by `PartialPiece`. All calls originate from the single
/// per-torrent dispatcher task, so the locks here are plain `std::sync`
/// ones rather than `tokio::sync` — there is never a suspended holder.
#[derive(Debug)]
pub struct Picker {
    pub piece_picker: RwLock<PiecePicker>,
    pub partial_pieces: RwLock<HashMap<usize, RwLock<PartialPiece>>>,
    num_pieces: u32,
    piece_len: usize,
    last_piece_len: usize,
}

impl Picker {

    pub fn new(num_pieces: u32, piece_len: usize, last_piece_len: usize) -> Self {
        Self {
            piece_picker: RwLock::new(PiecePicker::new(num_pieces as usize)),
            partial_pieces: RwLock::new(HashMap::new()),
            num_pieces,
            piece_len,
            last_piece_len,
        }
    }

    pub fn pick_blocks(
        &self,
        current_requests: &HashSet<BlockRequest>,
        target_queue_len: usize,
        bf: &Bitfield,
    ) -> Vec<BlockRequest> {

        let mut requests = vec![];
        let mut remaining = target_queue_len.saturating_sub(current_requests.len());
        if remaining == 0 {
            return vec![];
        }

        // Attempt to pick blocks from partially downloaded pieces.
        for partial_piece in self.partial_pieces.write().unwrap().values_mut() {

            if remaining == 0 {
                break;
            }

            if !bf[partial_piece.read().unwrap().idx] {
                continue;
            }

            remaining -= partial_piece
                .write()
                .unwrap()
                .pick_next_blocks(remaining, &mut requests, current_requests, false);
        }

        // Pick blocks from new pieces.
        while remaining != 0 {

            if let Some(idx) = self.piece_picker.write().unwrap().pick_new_piece(bf) {
                tracing::trace!("picked piece {}", idx);
                let piece_len = if idx as u32 == self.num_pieces - 1 { self.last_piece_len } else { self.piece_len };
                let mut partial_piece = PartialPiece::new(idx, piece_len);
                remaining -= partial_piece.pick_next_blocks(remaining, &mut requests, current_requests, false);
                self.partial_pieces.write().unwrap().insert(idx, partial_piece.into());

            } else {
                // End game: all pieces already claimed, re-request from in-flight ones.
                for partial_piece in self.partial_pieces.write().unwrap().values_mut() {

                    if remaining == 0 {
                        return requests;
                    }
                    if !bf[partial_piece.read().unwrap().idx] {
                        continue;
                    }

                    remaining -= partial_piece
                        .write()
                        .unwrap()
                        .pick_next_blocks(remaining, &mut requests, current_requests, true);
                }
                return requests;
            }
        }
        requests
    }
}

impl PieceManager for Picker {
    fn piece_data_received(&self, peer: SocketAddr, block: &BlockRequest) -> bool {
        let partial_pieces = self.partial_pieces.read().unwrap();
        match partial_pieces.get(&block.piece_idx) {
            Some(partial) => !partial.write().unwrap().received_block(peer, block),
            // A block arriving for a piece with no in-flight entry is
            // unsolicited (e.g. after the piece already completed); reject.
            None => false,
        }
    }

    fn add_piece_requests(&self, _peer: SocketAddr, peer_bitfield: &Bitfield, count: usize) -> Vec<BlockRequest> {
        self.pick_blocks(&HashSet::new(), count, peer_bitfield)
    }

    fn cancel_requests(&self, _peer: SocketAddr, blocks: &[BlockRequest]) {
        let partial_pieces = self.partial_pieces.read().unwrap();
        for block in blocks {
            if let Some(partial) = partial_pieces.get(&block.piece_idx) {
                partial.write().unwrap().free_block(block);
            }
        }
    }

    fn request_rejected(&self, _peer: SocketAddr, block: &BlockRequest) {
        let partial_pieces = self.partial_pieces.read().unwrap();
        if let Some(partial) = partial_pieces.get(&block.piece_idx) {
            partial.write().unwrap().free_block(block);
        }
    }

    fn is_interesting(&self, peer_bitfield: &Bitfield) -> bool {
        let have = self.piece_picker.read().unwrap();
        peer_bitfield
            .iter()
            .enumerate()
            .any(|(i, has_it)| *has_it && !have.own_bitfield()[i])
    }

    fn piece_hashed(&self, piece_index: u32, valid: bool) {
        self.partial_pieces.write().unwrap().remove(&(piece_index as usize));
        let mut piece_picker = self.piece_picker.write().unwrap();
        if valid {
            piece_picker.received_piece(piece_index as usize);
        } else {
            piece_picker.requeue(piece_index as usize);
        }
    }

    fn contributors(&self, piece_index: u32) -> Vec<SocketAddr> {
        self.partial_pieces
            .read()
            .unwrap()
            .get(&(piece_index as usize))
            .map(|p| p.read().unwrap().contributors.iter().copied().collect())
            .unwrap_or_default()
    }

    fn record_bitfield(&self, peer_bitfield: &Bitfield) {
        self.piece_picker.write().unwrap().bitfield_update(peer_bitfield);
    }

    fn record_have(&self, piece_index: u32) {
        self.piece_picker.write().unwrap().increment_piece(piece_index as usize);
    }

    fn seed_own_bitfield(&self, bf: &Bitfield) {
        self.piece_picker.write().unwrap().set_own_bitfield(bf.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_SIZE;
    use bitvec::prelude::*;

    #[test]
    fn test_pick_blocks() {
        let picker = Picker::new(1028, 32_768, 32_768);
        let bf = BitVec::repeat(true, 1028);
        picker.piece_picker.write().unwrap().bitfield_update(&bf);
        let requests_1 = picker.pick_blocks(&HashSet::new(), 4, &bf);
        assert_eq!(requests_1.len(), 4);
        let requests_2 = picker.pick_blocks(&HashSet::new(), 4, &bf);
        assert_eq!(requests_2.len(), 4);
    }

    #[test]
    fn test_pick_blocks_end_game() {

        let picker = Picker::new(2, 32_768, 32_768);
        let bf = BitVec::repeat(true, 2);
        picker.piece_picker.write().unwrap().bitfield_update(&bf);

        let requests_1 = picker.pick_blocks(&HashSet::new(), 4, &bf);
        assert_eq!(requests_1.len(), 4);

        let requests_2 = picker.pick_blocks(&HashSet::new(), 4, &bf);
        assert_eq!(requests_2.len(), 4);

        let mut previous_requests = HashSet::new();
        previous_requests.insert(BlockRequest { piece_idx: 0, offset: 0, len: BLOCK_SIZE });
        previous_requests.insert(BlockRequest { piece_idx: 1, offset: 0, len: BLOCK_SIZE });
        let requests_3 = picker.pick_blocks(&previous_requests, 4, &bf);
        assert_eq!(requests_3.len(), 2);
    }

    #[test]
    fn test_piece_data_received_and_contributors() {
        let picker = Picker::new(1, BLOCK_SIZE * 2, BLOCK_SIZE * 2);
        let bf = BitVec::repeat(true, 1);
        picker.piece_picker.write().unwrap().bitfield_update(&bf);
        let requests = picker.pick_blocks(&HashSet::new(), 2, &bf);
        assert_eq!(requests.len(), 2);

        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:2".parse().unwrap();
        assert!(picker.piece_data_received(a, &requests[0]));
        assert!(picker.piece_data_received(b, &requests[1]));

        let contributors = picker.contributors(0);
        assert_eq!(contributors.len(), 2);

        picker.piece_hashed(0, true);
        assert!(picker.contributors(0).is_empty());
    }
}

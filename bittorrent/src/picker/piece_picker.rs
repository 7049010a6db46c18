use crate::Bitfield;

/*
A better strategy is to download pieces in rarest first order. The client can determine this
by keeping the initial bitfield from each peer, and updating it with every have message.
Then, the client can download the pieces that appear least frequently in these peer bitfields.
Note that any Rarest First strategy should include randomization among at least several of the
least common pieces, as having many clients all attempting to jump on the same "least common"
piece would be counter productive
*/

#[derive(Clone, Copy, Default, Debug)]
struct PieceInfo {
    // Number of peers that have this piece.
    frequency: usize,
    // Is the piece partially downloaded.
    is_partial: bool,
}

#[derive(Debug)]
pub struct PiecePicker {
    // All pieces in the torrent, idx aligned.
    pieces: Vec<PieceInfo>,
    // The pieces that we have.
    have: Bitfield,
}

impl PiecePicker {
    
    pub fn new(num_pieces: usize) -> Self {
        let mut have = Bitfield::new();
        have.resize(num_pieces, false);
        Self {
            pieces: vec![PieceInfo::default(); num_pieces],
            have,
        }
    }

    pub fn own_bitfield(&self) -> &Bitfield {
        &self.have
    }

    pub fn all(&self) -> bool {
        self.have.all()
    }
    
    pub fn set_own_bitfield(&mut self, bf: Bitfield) {
        debug_assert_eq!(bf.len(), self.have.len());
        self.have = bf;
    }

    pub fn increment_piece(&mut self, idx: usize) -> bool {
        assert!(idx < self.pieces.len());
        self.pieces[idx].frequency += 1;
        self.have[idx]
    }

    pub fn received_piece(&mut self, idx: usize) {
        assert!(idx < self.pieces.len());
        self.have.set(idx, true);
    }

    // Will return true if there is at least one piece that peer has and we don't.
    pub fn bitfield_update(&mut self, bf: &Bitfield) -> bool {
        debug_assert_eq!(bf.len(), self.have.len());
        let mut interested = false;
        bf
            .iter()
            .enumerate()
            .filter(|(_, b)| **b)
            .for_each(|(i, _)| {
                self.pieces[i].frequency += 1;
                if !self.have[i] {
                    interested = true;
                }
        });
        interested
    }

    pub fn pick_new_piece(&mut self, bf: &Bitfield) -> Option<usize> {
        for idx in 0..self.have.len() {
            let piece = &mut self.pieces[idx];
            if !self.have[idx] && piece.frequency > 0 && !piece.is_partial && bf[idx] {
                piece.is_partial = true;
                return Some(idx)
            }
        }
        None
    }

    /// Clears the partial flag for a piece that failed its hash check, so a
    /// later call to `pick_new_piece` can select it again for re-download.
    pub fn requeue(&mut self, idx: usize) {
        assert!(idx < self.pieces.len());
        self.pieces[idx].is_partial = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::*;

    #[test]
    fn test_pick_new_piece_rarest_first_availability() {
        let mut pieces = PiecePicker::new(3);
        let bf = BitVec::<u8, Msb0>::repeat(true, 3);
        pieces.bitfield_update(&bf);
        let idx = pieces.pick_new_piece(&bf).unwrap();
        assert!(idx < 3);
    }

    #[test]
    fn test_requeue_allows_repick() {
        let mut pieces = PiecePicker::new(1);
        let bf = BitVec::<u8, Msb0>::repeat(true, 1);
        pieces.bitfield_update(&bf);
        assert_eq!(pieces.pick_new_piece(&bf), Some(0));
        assert_eq!(pieces.pick_new_piece(&bf), None);
        pieces.requeue(0);
        assert_eq!(pieces.pick_new_piece(&bf), Some(0));
    }

    #[test]
    fn test_received_piece_sets_have_bit() {
        let mut pieces = PiecePicker::new(2);
        pieces.received_piece(1);
        assert!(pieces.own_bitfield()[1]);
        assert!(!pieces.all());
    }
}
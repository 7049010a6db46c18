use std::{
    collections::{HashSet, VecDeque},
    net::SocketAddr,
    time::Instant,
};

use crate::{block::BlockRequest, stats::ThroughputStats, Bitfield, ID};

use super::message::Message;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConnState {
    Connecting,
    Connected,
    Disconnected,
    Handshaking,
    Introducing, // Where peers tell each other what pieces they have.
}

#[derive(Debug, Clone, Copy)]
pub struct SessionState {

    pub conn_state: ConnState,

    // Whether we are answering the peer's requests.
    pub choked: bool,

    // Whether we are interested in the peer's pieces.
    pub interested: bool,

    // Whether the peer is answering our requests.
    pub peer_choking: bool,

    // Whether the peer is interested in our pieces.
    pub peer_interested: bool,

    pub throughput: ThroughputStats,

    pub num_pieces: usize,

    pub changed: bool,

}

impl Default for SessionState {
    fn default() -> SessionState {
        SessionState {
            conn_state: ConnState::Disconnected,
            choked: true,
            interested: false,
            peer_choking: true,
            peer_interested: false,
            throughput: ThroughputStats::default(),
            changed: false,
            num_pieces: 0,
        }
    }
}

impl SessionState {

    pub fn tick(&mut self) {
        self.throughput.reset();
    }

    #[inline(always)]
    pub fn update(&mut self, f: impl FnOnce(&mut SessionState)) {
        f(self);
        self.changed = true;
    }
}

/// A message queued for the connection layer to drain. Buffer-release
/// obligations for `Block` sends live on the disk read path that produced
/// the data, not here; everything else carries no external buffer.
pub struct QueuedMessage {
    pub message: Message,
}

/// Per-connected-peer state: identity, negotiated capabilities, both
/// choke/interest directions, the peer's advertised bitfield, fast-peer
/// bookkeeping, timers and the outbound send queue. Created when the
/// connection layer completes a handshake; dropped when it cleans up the
/// socket. Unlike the teacher's `p2p::session::PeerSession`, this struct
/// owns no socket and runs no task of its own — the single per-torrent
/// dispatcher is its only mutator.
pub struct PeerSession {

    pub address: SocketAddr,

    pub peer_id: Option<ID>,

    pub supports_fast_peer: bool,

    pub supports_extended: bool,

    pub state: SessionState,

    pub bitfield: Bitfield,

    // Pieces we have told this peer it may request while choked.
    pub we_granted_fast: HashSet<u32>,

    // Pieces this peer has told us we may request while choked.
    pub peer_granted_fast: HashSet<u32>,

    pub suggested: HashSet<u32>,

    // Blocks we have requested from this peer, not yet fulfilled, canceled or
    // rejected. Kept as the actual set (not just a count) so a Choke can
    // cancel every one of them with the picker by value.
    pub requested: HashSet<BlockRequest>,

    // Requests this peer has sent us, not yet served/canceled.
    pub outstanding_requests_in: u32,

    pub max_pending_requests: u32,

    pub last_message_sent: Instant,

    pub last_message_received: Instant,

    pub last_block_received: Instant,

    pub send_queue: VecDeque<QueuedMessage>,

    // Advertised via extended handshake, if the peer supports it.
    pub listen_port: Option<u16>,

    pub total_hash_failures: u32,

    pub pieces_received: u64,

    pub is_seeder: bool,

    // Peer-exchange sub-agent's own one-minute timer, attached by
    // `dispatch::on_extended_handshake` once the peer advertises `ut_pex`
    // support and driven from `tick::drive_peer_exchange`; `None` until
    // attached, or if no sub-agent should run for this peer at all.
    pub pex_last_run: Option<Instant>,

    // The peer's own extension-id assignments from its extended handshake's
    // `m` dictionary (name -> the id *they* want used when sending *them* a
    // message for that extension). Empty until an extended handshake with a
    // non-empty `m` arrives.
    pub peer_extension_ids: std::collections::HashMap<String, u8>,
}

impl PeerSession {
    pub fn new(address: SocketAddr, num_pieces: usize) -> Self {
        let now = Instant::now();
        Self {
            address,
            peer_id: None,
            supports_fast_peer: false,
            supports_extended: false,
            state: SessionState {
                num_pieces,
                ..SessionState::default()
            },
            bitfield: Bitfield::repeat(false, num_pieces),
            we_granted_fast: HashSet::new(),
            peer_granted_fast: HashSet::new(),
            suggested: HashSet::new(),
            requested: HashSet::new(),
            outstanding_requests_in: 0,
            max_pending_requests: 2,
            last_message_sent: now,
            last_message_received: now,
            last_block_received: now,
            send_queue: VecDeque::new(),
            listen_port: None,
            total_hash_failures: 0,
            pieces_received: 0,
            is_seeder: false,
            pex_last_run: None,
            peer_extension_ids: std::collections::HashMap::new(),
        }
    }

    /// Idempotent interest toggle: flips `interested` and returns whether it
    /// actually changed, so the dispatcher sends `Interested`/`NotInterested`
    /// at most once per transition (spec invariant: repeated
    /// `set_am_interested(true)` produces exactly one wire message).
    pub fn set_am_interested(&mut self, interested: bool) -> bool {
        if self.state.interested == interested {
            return false;
        }
        self.state.interested = interested;
        true
    }

    pub fn outstanding_requests_out(&self) -> u32 {
        self.requested.len() as u32
    }

    pub fn queue(&mut self, message: Message) {
        self.send_queue.push_back(QueuedMessage { message });
    }

    pub fn drain_send_queue(&mut self) -> Vec<Message> {
        self.send_queue.drain(..).map(|q| q.message).collect()
    }

    /// Sets the bit for `idx`, recomputing the seeder flag. Returns whether
    /// the piece is newly visible (used to decide if we should (re)evaluate
    /// interest).
    pub fn set_have(&mut self, idx: u32) -> bool {
        let idx = idx as usize;
        if idx >= self.bitfield.len() {
            return false;
        }
        let newly = !self.bitfield[idx];
        self.bitfield.set(idx, true);
        self.is_seeder = self.bitfield.all();
        newly
    }

    pub fn set_have_all(&mut self) {
        self.bitfield.fill(true);
        self.is_seeder = true;
    }

    pub fn set_have_none(&mut self) {
        self.bitfield.fill(false);
        self.is_seeder = false;
    }

    pub fn set_bitfield(&mut self, bitfield: Bitfield) {
        self.is_seeder = bitfield.all();
        self.bitfield = bitfield;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> PeerSession {
        PeerSession::new("127.0.0.1:6881".parse().unwrap(), 4)
    }

    #[test]
    fn test_set_am_interested_idempotent() {
        let mut s = session();
        assert!(s.set_am_interested(true));
        assert!(!s.set_am_interested(true));
        assert!(s.set_am_interested(false));
    }

    #[test]
    fn test_have_all_then_none_restores_bitfield() {
        let mut s = session();
        s.set_have_all();
        assert!(s.is_seeder);
        s.set_have_none();
        assert!(!s.is_seeder);
        assert!(!s.bitfield.any());
    }

    #[test]
    fn test_set_have_marks_seeder_when_complete() {
        let mut s = session();
        for i in 0..4 {
            assert!(s.set_have(i));
        }
        assert!(s.is_seeder);
        // Setting an already-set bit is not "newly" visible.
        assert!(!s.set_have(0));
    }
}

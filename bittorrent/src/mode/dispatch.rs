//! The message dispatcher (§4.2): one call per inbound peer message, fully
//! synchronous except for `Block`, which hands off to
//! `mode::completion::on_block`. Grounded on the teacher's per-peer message
//! loop, generalized from a `match` inside a peer's own task to a free
//! function over `&mut Torrent` since the dispatcher is now this crate's
//! only mutator of peer state.

use std::net::SocketAddr;

use crate::{
    block::{MAX_BLOCK_LEN, MIN_BLOCK_LEN},
    mode::completion,
    p2p::message::Message,
    torrent::Torrent,
    EngineError,
};

/// Local extension ids we advertise in our own extended handshake's `m`
/// dictionary (`bootstrap::extended_handshake_payload`). BEP 10 ids are
/// picked by the side that wants to *receive* messages under them, so these
/// classify messages arriving from a peer; replying to them uses whichever
/// id the peer advertised for the same name in their own handshake, held in
/// `PeerSession::peer_extension_ids`.
pub(crate) const UT_METADATA_ID: u8 = 1;
pub(crate) const UT_PEX_ID: u8 = 2;
pub(crate) const UT_METADATA_NAME: &str = "ut_metadata";
pub(crate) const UT_PEX_NAME: &str = "ut_pex";

const METADATA_PIECE_LEN: usize = 16 * 1024;

/// Consumes one inbound message from `peer`. Forbidden-message-family
/// checks happen first so a peer that never negotiated fast-peer or
/// extended messaging gets disconnected rather than silently humoured.
pub async fn handle(torrent: &mut Torrent, peer: SocketAddr, message: Message) -> Result<(), EngineError> {
    if message.is_fast_peer_family() {
        let supports = torrent.peers.get(&peer).map(|s| s.supports_fast_peer).unwrap_or(false);
        if !supports {
            return Err(EngineError::ProtocolViolation("peer does not support fast-peer"));
        }
    }
    if message.is_extension_family() && !matches!(&message, Message::Extended { id: 0, .. }) {
        let supports = torrent.peers.get(&peer).map(|s| s.supports_extended).unwrap_or(false);
        if !supports {
            return Err(EngineError::ProtocolViolation("peer does not support extension messages"));
        }
    }

    match message {
        Message::KeepAlive => on_keep_alive(torrent, peer),
        Message::Choke => on_choke(torrent, peer),
        Message::Unchoke => on_unchoke(torrent, peer),
        Message::Interested => set_peer_interested(torrent, peer, true),
        Message::NotInterested => set_peer_interested(torrent, peer, false),
        Message::Have { idx } => on_have(torrent, peer, idx),
        Message::Bitfield(bf) => on_bitfield(torrent, peer, bf),
        Message::HaveAll => on_have_all(torrent, peer),
        Message::HaveNone => on_have_none(torrent, peer),
        Message::Request(block) => on_request(torrent, peer, block).await?,
        Message::Cancel(block) => on_cancel(torrent, peer, block),
        Message::Block(block) => completion::on_block(torrent, peer, block).await?,
        Message::RejectRequest(block) => on_reject_request(torrent, peer, block),
        Message::SuggestPiece { idx } => on_suggest_piece(torrent, peer, idx),
        Message::AllowedFast { idx } => on_allowed_fast(torrent, peer, idx),
        Message::Port { port } => on_port(torrent, peer, port),
        Message::Extended { id, payload } => on_extended_message(torrent, peer, id, payload),
        Message::HashRequest(_) | Message::HashReject(_) | Message::Hashes(_) => {
            // Default v2 policy: reject requests, ignore responses. A mode
            // that implements hybrid/v2 torrents overrides this.
            if let Some(session) = torrent.peers.get_mut(&peer) {
                session.queue(Message::HashReject(Vec::new()));
            }
        }
    }

    torrent.drain_send_queues().await;
    Ok(())
}

fn on_keep_alive(torrent: &mut Torrent, peer: SocketAddr) {
    if let Some(session) = torrent.peers.get_mut(&peer) {
        session.last_message_received = std::time::Instant::now();
    }
}

fn on_choke(torrent: &mut Torrent, peer: SocketAddr) {
    let Some(session) = torrent.peers.get_mut(&peer) else { return };
    session.state.peer_choking = true;
    if !session.supports_fast_peer {
        let requested: Vec<_> = session.requested.drain().collect();
        torrent.ctx.picker.cancel_requests(peer, &requested);
    }
}

fn on_unchoke(torrent: &mut Torrent, peer: SocketAddr) {
    if let Some(session) = torrent.peers.get_mut(&peer) {
        session.state.peer_choking = false;
    }
    request_more_blocks(torrent, peer);
}

fn set_peer_interested(torrent: &mut Torrent, peer: SocketAddr, interested: bool) {
    if let Some(session) = torrent.peers.get_mut(&peer) {
        session.state.peer_interested = interested;
    }
}

fn on_have(torrent: &mut Torrent, peer: SocketAddr, idx: u32) {
    let Some(session) = torrent.peers.get_mut(&peer) else { return };
    let newly_visible = session.set_have(idx);
    torrent.ctx.picker.record_have(idx);
    if newly_visible {
        recompute_interest(torrent, peer);
    }
}

fn on_bitfield(torrent: &mut Torrent, peer: SocketAddr, bf: crate::Bitfield) {
    torrent.ctx.picker.record_bitfield(&bf);
    if let Some(session) = torrent.peers.get_mut(&peer) {
        session.set_bitfield(bf);
    }
    recompute_interest(torrent, peer);
}

fn on_have_all(torrent: &mut Torrent, peer: SocketAddr) {
    if let Some(session) = torrent.peers.get_mut(&peer) {
        session.set_have_all();
        let bf = session.bitfield.clone();
        torrent.ctx.picker.record_bitfield(&bf);
    }
    recompute_interest(torrent, peer);
}

fn on_have_none(torrent: &mut Torrent, peer: SocketAddr) {
    if let Some(session) = torrent.peers.get_mut(&peer) {
        session.set_have_none();
    }
    recompute_interest(torrent, peer);
}

/// Re-evaluates `am_interested` against the peer's current bitfield,
/// queueing `Interested`/`NotInterested` only on an actual flip (spec
/// invariant: flips are idempotent).
pub(crate) fn recompute_interest(torrent: &mut Torrent, peer: SocketAddr) {
    let Some(session) = torrent.peers.get_mut(&peer) else { return };
    let interesting = torrent.ctx.picker.is_interesting(&session.bitfield);
    if session.set_am_interested(interesting) {
        session.queue(if interesting { Message::Interested } else { Message::NotInterested });
    }
}

/// Serves or rejects a peer's `Request`, per §4.2: if we're not choking
/// them, or the requested piece is in their fast-peer allowed set, read the
/// block and queue it; otherwise queue a `RejectRequest` (or silently drop
/// for peers without fast-peer, who can't be told why).
async fn on_request(torrent: &mut Torrent, peer: SocketAddr, block: crate::block::BlockInfo) -> Result<(), EngineError> {
    let piece_len = torrent.ctx.store_info.piece_length(block.piece_idx);
    if !block.is_valid(piece_len, torrent.ctx.store_info.num_pieces, MIN_BLOCK_LEN, MAX_BLOCK_LEN) {
        return Err(EngineError::ProtocolViolation("out of bounds request"));
    }

    let Some(session) = torrent.peers.get_mut(&peer) else { return Ok(()) };
    session.outstanding_requests_in += 1;
    let am_choking = session.state.choked;
    let fast_allowed = session.supports_fast_peer && session.we_granted_fast.contains(&(block.piece_idx as u32));
    let supports_fast_peer = session.supports_fast_peer;

    if am_choking && !fast_allowed {
        if supports_fast_peer {
            if let Some(session) = torrent.peers.get_mut(&peer) {
                session.queue(Message::RejectRequest(block));
            }
        }
        return Ok(());
    }

    let data = torrent.ctx.disk.read(torrent.ctx.info_hash, block).await.map_err(EngineError::ReadFailure)?;
    if let Some(session) = torrent.peers.get_mut(&peer) {
        session.queue(Message::Block(crate::block::BlockData { piece_idx: block.piece_idx, offset: block.offset, data }));
    }
    Ok(())
}

fn on_cancel(torrent: &mut Torrent, peer: SocketAddr, block: crate::block::BlockInfo) {
    let Some(session) = torrent.peers.get_mut(&peer) else { return };
    let removed = session.send_queue.iter().position(|q| matches!(&q.message, Message::Block(b) if b.piece_idx == block.piece_idx && b.offset == block.offset));
    if let Some(pos) = removed {
        session.send_queue.remove(pos);
        session.outstanding_requests_in = session.outstanding_requests_in.saturating_sub(1);
    }
}

fn on_reject_request(torrent: &mut Torrent, peer: SocketAddr, block: crate::block::BlockInfo) {
    if let Some(session) = torrent.peers.get_mut(&peer) {
        session.requested.remove(&block);
    }
    torrent.ctx.picker.request_rejected(peer, &block);
}

fn on_suggest_piece(torrent: &mut Torrent, peer: SocketAddr, idx: u32) {
    if let Some(session) = torrent.peers.get_mut(&peer) {
        session.suggested.insert(idx);
    }
}

fn on_allowed_fast(torrent: &mut Torrent, peer: SocketAddr, idx: u32) {
    let Some(session) = torrent.peers.get_mut(&peer) else { return };
    if idx as usize >= torrent.own_bitfield.len() || !torrent.own_bitfield[idx as usize] {
        session.peer_granted_fast.insert(idx);
    }
}

fn on_port(torrent: &mut Torrent, peer: SocketAddr, port: u32) {
    if let Some(session) = torrent.peers.get_mut(&peer) {
        session.listen_port = Some(port as u16);
    }
}

/// Routes a decoded `Extended` message by id: 0 is always the handshake
/// itself; any other id is matched against the extensions we assigned in
/// our own handshake (`UT_METADATA_ID`/`UT_PEX_ID`). Anything else is an
/// extension we don't implement (a peer's `LtChat` or similar) and is
/// traced and dropped.
fn on_extended_message(torrent: &mut Torrent, peer: SocketAddr, id: u8, payload: Vec<u8>) {
    match id {
        0 => on_extended_handshake(torrent, peer, payload),
        UT_METADATA_ID => on_lt_metadata(torrent, peer, payload),
        UT_PEX_ID => on_peer_exchange(torrent, peer, payload),
        _ => tracing::trace!("ignoring unknown extension message id {} from {}", id, peer),
    }
}

/// Records the peer's extended-handshake advertised listen port, max-request
/// hint, and its own `m` dictionary (the ids *it* wants used when we send it
/// an extension message). Per spec: if the peer advertises `ut_pex` and this
/// torrent is public with peer-exchange enabled, attaches its peer-exchange
/// sub-agent by starting `pex_last_run`'s timer (driven from
/// `tick::drive_peer_exchange`).
fn on_extended_handshake(torrent: &mut Torrent, peer: SocketAddr, payload: Vec<u8>) {
    use serde_derive::Deserialize;

    #[derive(Deserialize, Default)]
    struct ExtendedHandshake {
        #[serde(default)]
        m: std::collections::HashMap<String, i64>,
        #[serde(default)]
        p: Option<u16>,
        #[serde(default)]
        reqq: Option<i64>,
    }

    let attach_pex = !torrent.ctx.private && torrent.ctx.settings.allow_peer_exchange;

    let Some(session) = torrent.peers.get_mut(&peer) else { return };
    match bencode::decode_bytes::<ExtendedHandshake>(&payload) {
        Ok(hs) => {
            if let Some(port) = hs.p {
                session.listen_port = Some(port);
            }
            // A known legacy client underreports its request queue depth;
            // floor it at 192 per spec.
            if let Some(reqq) = hs.reqq {
                if reqq > 0 {
                    session.max_pending_requests = (reqq as u32).max(192);
                }
            }
            session.peer_extension_ids = hs
                .m
                .into_iter()
                .filter_map(|(name, id)| u8::try_from(id).ok().map(|id| (name, id)))
                .collect();

            if attach_pex && session.peer_extension_ids.contains_key(UT_PEX_NAME) {
                session.pex_last_run = Some(std::time::Instant::now());
            }
        }
        Err(e) => tracing::debug!("malformed extended handshake from {}: {}", peer, e),
    }
}

/// BEP 9 `ut_metadata`: only the serving side is implemented (this engine
/// always holds the full metainfo already, so there is nothing to request
/// from peers). Responds to a `Request` (`msg_type == 0`) with `Data`
/// carrying the requested 16KiB chunk of the bencoded info dict, or
/// `Reject` if the piece index is out of range. Other message types
/// (`Data`/`Reject` sent to us) are ignored.
fn on_lt_metadata(torrent: &mut Torrent, peer: SocketAddr, payload: Vec<u8>) {
    use serde_derive::{Deserialize, Serialize};

    #[derive(Deserialize)]
    struct Header {
        msg_type: i64,
        piece: i64,
    }

    let header = match bencode::decode_bytes::<Header>(&payload) {
        Ok(h) => h,
        Err(e) => {
            tracing::debug!("malformed ut_metadata message from {}: {}", peer, e);
            return;
        }
    };

    if header.msg_type != 0 {
        tracing::trace!("ignoring ut_metadata message type {} from {}", header.msg_type, peer);
        return;
    }

    let Some(reply_id) = torrent.peers.get(&peer).and_then(|s| s.peer_extension_ids.get(UT_METADATA_NAME).copied()) else {
        return;
    };

    let info_bytes = match bencode::encode_to_raw(&torrent.ctx.metainfo.info) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!("failed to re-encode info dict for {}: {}", peer, e);
            return;
        }
    };
    let total_size = info_bytes.len() as i64;
    let start = header.piece.max(0) as usize * METADATA_PIECE_LEN;

    let reply = if start < info_bytes.len() {
        #[derive(Serialize)]
        struct DataHeader {
            msg_type: i64,
            piece: i64,
            total_size: i64,
        }
        let end = (start + METADATA_PIECE_LEN).min(info_bytes.len());
        let mut reply = bencode::encode_to_raw(&DataHeader { msg_type: 1, piece: header.piece, total_size }).unwrap_or_default();
        reply.extend_from_slice(&info_bytes[start..end]);
        reply
    } else {
        #[derive(Serialize)]
        struct RejectHeader {
            msg_type: i64,
            piece: i64,
        }
        bencode::encode_to_raw(&RejectHeader { msg_type: 2, piece: header.piece }).unwrap_or_default()
    };

    if let Some(session) = torrent.peers.get_mut(&peer) {
        session.queue(Message::Extended { id: reply_id, payload: reply });
    }
}

/// BEP 11 `ut_pex`: per spec, a private torrent or peer-exchange disabled by
/// settings means we never act on an incoming `PeerExchange` (logged as an
/// empty `PeersFound`, no peers added regardless of what the message
/// claims). Otherwise, past the connection cap the message is dropped;
/// else the `added` compact peer list is decoded and any address we don't
/// already know about joins the pool. The `added.f` seeder bit is decoded
/// (so a malformed flags field doesn't panic) but `available` carries no
/// per-peer metadata to persist it against — see DESIGN.md.
fn on_peer_exchange(torrent: &mut Torrent, peer: SocketAddr, payload: Vec<u8>) {
    use serde_derive::Deserialize;

    #[derive(Deserialize, Default)]
    struct PexMessage {
        #[serde(default, with = "serde_bytes")]
        added: Vec<u8>,
        #[serde(default, rename = "added.f", with = "serde_bytes")]
        added_f: Vec<u8>,
    }

    if torrent.ctx.private || !torrent.ctx.settings.allow_peer_exchange {
        tracing::debug!(added = 0, total = 0, source = %peer, "PeersFound: suppressed (private or disallowed)");
        return;
    }

    let msg = match bencode::decode_bytes::<PexMessage>(&payload) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!("malformed ut_pex message from {}: {}", peer, e);
            return;
        }
    };
    let total = msg.added.len() / 6;

    if torrent.peers.len() + torrent.available.len() >= torrent.ctx.settings.maximum_connections {
        tracing::debug!(added = 0, total, source = %peer, "PeersFound: at connection cap, dropped");
        return;
    }

    let mut added = 0;
    for (i, chunk) in msg.added.chunks_exact(6).enumerate() {
        let ip = std::net::Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
        let addr = SocketAddr::new(ip.into(), u16::from_be_bytes([chunk[4], chunk[5]]));
        let _is_seeder = msg.added_f.get(i).map(|f| f & 0x02 != 0).unwrap_or(false);
        if addr != peer && !torrent.peers.contains_key(&addr) && !torrent.available.contains(&addr) {
            torrent.available.push(addr);
            added += 1;
        }
    }
    tracing::debug!(added, total, source = %peer, "PeersFound");
}

/// Asks the picker for more requests across every unchoked, interesting
/// peer. Called after an `Unchoke` and again every tick.
pub fn request_more_blocks_all(torrent: &mut Torrent) {
    let peers: Vec<SocketAddr> = torrent.peers.keys().copied().collect();
    for peer in peers {
        request_more_blocks(torrent, peer);
    }
}

fn request_more_blocks(torrent: &mut Torrent, peer: SocketAddr) {
    let Some(session) = torrent.peers.get(&peer) else { return };
    if session.state.peer_choking && session.peer_granted_fast.is_empty() {
        return;
    }
    if !session.state.interested {
        return;
    }

    let outstanding = session.outstanding_requests_out();
    let target = session.max_pending_requests;
    let remaining = target.saturating_sub(outstanding) as usize;
    if remaining == 0 {
        return;
    }

    let bitfield = session.bitfield.clone();
    let new_requests = torrent.ctx.picker.add_piece_requests(peer, &bitfield, remaining);
    if let Some(session) = torrent.peers.get_mut(&peer) {
        for block in new_requests {
            session.requested.insert(block);
            session.queue(Message::Request(block));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{block::BlockInfo, p2p::PeerSession, torrent::tests::test_torrent};

    fn addr() -> SocketAddr {
        "127.0.0.1:6881".parse().unwrap()
    }

    #[tokio::test]
    async fn test_on_request_rejects_out_of_bounds() {
        let mut torrent = test_torrent(4, 1024, 1024).await;
        let a = addr();
        torrent.peers.insert(a, PeerSession::new(a, 4));
        let block = BlockInfo { piece_idx: 99, offset: 0, len: 16 };

        let result = on_request(&mut torrent, a, block).await;

        assert!(matches!(result, Err(EngineError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_on_request_while_choked_without_fast_peer_drops_silently() {
        let mut torrent = test_torrent(4, 1024, 1024).await;
        let a = addr();
        torrent.peers.insert(a, PeerSession::new(a, 4));
        let block = BlockInfo { piece_idx: 0, offset: 0, len: 1024 };

        on_request(&mut torrent, a, block).await.unwrap();

        assert!(torrent.peers[&a].send_queue.is_empty());
    }

    #[tokio::test]
    async fn test_on_request_while_choked_with_fast_peer_queues_reject() {
        let mut torrent = test_torrent(4, 1024, 1024).await;
        let a = addr();
        let mut session = PeerSession::new(a, 4);
        session.supports_fast_peer = true;
        torrent.peers.insert(a, session);
        let block = BlockInfo { piece_idx: 0, offset: 0, len: 1024 };

        on_request(&mut torrent, a, block).await.unwrap();

        let queue = &torrent.peers[&a].send_queue;
        assert_eq!(queue.len(), 1);
        assert!(matches!(queue.front().unwrap().message, Message::RejectRequest(_)));
    }

    #[tokio::test]
    async fn test_on_request_serves_block_when_fast_peer_allowed_while_choked() {
        let mut torrent = test_torrent(4, 1024, 1024).await;
        let a = addr();
        let mut session = PeerSession::new(a, 4);
        session.supports_fast_peer = true;
        session.we_granted_fast.insert(0);
        torrent.peers.insert(a, session);
        let block = BlockInfo { piece_idx: 0, offset: 0, len: 1024 };

        on_request(&mut torrent, a, block).await.unwrap();

        let queue = &torrent.peers[&a].send_queue;
        assert_eq!(queue.len(), 1);
        assert!(matches!(queue.front().unwrap().message, Message::Block(_)));
    }

    #[tokio::test]
    async fn test_on_choke_cancels_outstanding_requests_without_fast_peer() {
        let mut torrent = test_torrent(4, 1024, 1024).await;
        let a = addr();
        let mut session = PeerSession::new(a, 4);
        session.requested.insert(BlockInfo { piece_idx: 0, offset: 0, len: 16 });
        torrent.peers.insert(a, session);

        on_choke(&mut torrent, a);

        assert!(torrent.peers[&a].state.peer_choking);
        assert!(torrent.peers[&a].requested.is_empty());
    }

    #[tokio::test]
    async fn test_on_choke_keeps_outstanding_requests_with_fast_peer() {
        let mut torrent = test_torrent(4, 1024, 1024).await;
        let a = addr();
        let mut session = PeerSession::new(a, 4);
        session.supports_fast_peer = true;
        session.requested.insert(BlockInfo { piece_idx: 0, offset: 0, len: 16 });
        torrent.peers.insert(a, session);

        on_choke(&mut torrent, a);

        assert_eq!(torrent.peers[&a].requested.len(), 1);
    }

    #[tokio::test]
    async fn test_recompute_interest_sends_interested_at_most_once() {
        let mut torrent = test_torrent(4, 1024, 1024).await;
        let a = addr();
        let mut session = PeerSession::new(a, 4);
        session.bitfield.set(1, true);
        torrent.peers.insert(a, session);

        recompute_interest(&mut torrent, a);
        recompute_interest(&mut torrent, a);

        let queue = &torrent.peers[&a].send_queue;
        assert_eq!(queue.len(), 1);
        assert!(matches!(queue.front().unwrap().message, Message::Interested));
    }

    #[tokio::test]
    async fn test_have_all_then_have_none_restores_no_interest() {
        let mut torrent = test_torrent(4, 1024, 1024).await;
        let a = addr();
        torrent.peers.insert(a, PeerSession::new(a, 4));

        on_have_all(&mut torrent, a);
        assert!(torrent.peers[&a].state.interested);

        on_have_none(&mut torrent, a);
        assert!(!torrent.peers[&a].state.interested);
    }

    #[tokio::test]
    async fn test_on_allowed_fast_ignores_pieces_we_already_have() {
        let mut torrent = test_torrent(4, 1024, 1024).await;
        let a = addr();
        torrent.peers.insert(a, PeerSession::new(a, 4));
        torrent.own_bitfield.set(2, true);

        on_allowed_fast(&mut torrent, a, 2);
        on_allowed_fast(&mut torrent, a, 3);

        let session = &torrent.peers[&a];
        assert!(!session.peer_granted_fast.contains(&2));
        assert!(session.peer_granted_fast.contains(&3));
    }

    fn handshake_payload(m: &[(&str, i64)]) -> Vec<u8> {
        use serde_derive::Serialize;
        #[derive(Serialize)]
        struct Handshake {
            m: std::collections::BTreeMap<String, i64>,
        }
        let handshake = Handshake { m: m.iter().map(|(k, v)| (k.to_string(), *v)).collect() };
        bencode::encode_to_raw(&handshake).unwrap()
    }

    #[tokio::test]
    async fn test_on_extended_handshake_attaches_pex_sub_agent_when_public() {
        let mut torrent = test_torrent(4, 1024, 1024).await;
        let a = addr();
        torrent.peers.insert(a, PeerSession::new(a, 4));

        on_extended_handshake(&mut torrent, a, handshake_payload(&[(UT_PEX_NAME, 5)]));

        let session = &torrent.peers[&a];
        assert_eq!(session.peer_extension_ids.get(UT_PEX_NAME), Some(&5));
        assert!(session.pex_last_run.is_some());
    }

    #[tokio::test]
    async fn test_on_extended_handshake_does_not_attach_pex_on_private_torrent() {
        let mut torrent = test_torrent(4, 1024, 1024).await;
        torrent.ctx.private = true;
        let a = addr();
        torrent.peers.insert(a, PeerSession::new(a, 4));

        on_extended_handshake(&mut torrent, a, handshake_payload(&[(UT_PEX_NAME, 5)]));

        assert!(torrent.peers[&a].pex_last_run.is_none());
    }

    #[tokio::test]
    async fn test_on_lt_metadata_request_replies_with_data_using_peers_advertised_id() {
        let mut torrent = test_torrent(4, 1024, 1024).await;
        let a = addr();
        let mut session = PeerSession::new(a, 4);
        session.peer_extension_ids.insert(UT_METADATA_NAME.to_string(), 7);
        torrent.peers.insert(a, session);

        #[derive(serde_derive::Serialize)]
        struct Request {
            msg_type: i64,
            piece: i64,
        }
        let request = bencode::encode_to_raw(&Request { msg_type: 0, piece: 0 }).unwrap();

        on_lt_metadata(&mut torrent, a, request);

        let queue = &torrent.peers[&a].send_queue;
        assert_eq!(queue.len(), 1);
        assert!(matches!(&queue.front().unwrap().message, Message::Extended { id: 7, .. }));
    }

    #[tokio::test]
    async fn test_on_lt_metadata_rejects_out_of_range_piece() {
        let mut torrent = test_torrent(4, 1024, 1024).await;
        let a = addr();
        let mut session = PeerSession::new(a, 4);
        session.peer_extension_ids.insert(UT_METADATA_NAME.to_string(), 7);
        torrent.peers.insert(a, session);

        #[derive(serde_derive::Serialize)]
        struct Request {
            msg_type: i64,
            piece: i64,
        }
        let request = bencode::encode_to_raw(&Request { msg_type: 0, piece: 9999 }).unwrap();

        on_lt_metadata(&mut torrent, a, request);

        #[derive(serde_derive::Deserialize)]
        struct Header {
            msg_type: i64,
        }
        let queue = &torrent.peers[&a].send_queue;
        let Message::Extended { payload, .. } = &queue.front().unwrap().message else { panic!("expected Extended") };
        let header: Header = bencode::decode_bytes(payload).unwrap();
        assert_eq!(header.msg_type, 2);
    }

    #[tokio::test]
    async fn test_on_peer_exchange_suppressed_on_private_torrent() {
        let mut torrent = test_torrent(4, 1024, 1024).await;
        torrent.ctx.private = true;
        let a = addr();
        torrent.peers.insert(a, PeerSession::new(a, 4));

        #[derive(serde_derive::Serialize)]
        struct Pex {
            added: serde_bytes::ByteBuf,
        }
        let payload = bencode::encode_to_raw(&Pex {
            added: serde_bytes::ByteBuf::from(vec![127, 0, 0, 1, 0x1A, 0xE1, 127, 0, 0, 2, 0x1A, 0xE1, 127, 0, 0, 3, 0x1A, 0xE1]),
        })
        .unwrap();

        on_peer_exchange(&mut torrent, a, payload);

        assert!(torrent.available.is_empty());
    }

    #[tokio::test]
    async fn test_on_peer_exchange_adds_new_peers_on_public_torrent() {
        let mut torrent = test_torrent(4, 1024, 1024).await;
        let a = addr();
        torrent.peers.insert(a, PeerSession::new(a, 4));

        #[derive(serde_derive::Serialize)]
        struct Pex {
            added: serde_bytes::ByteBuf,
        }
        let payload = bencode::encode_to_raw(&Pex {
            added: serde_bytes::ByteBuf::from(vec![127, 0, 0, 9, 0x1A, 0xE1]),
        })
        .unwrap();

        on_peer_exchange(&mut torrent, a, payload);

        assert_eq!(torrent.available.len(), 1);
    }
}

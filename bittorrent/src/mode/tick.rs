//! The tick loop (§4.5): one call per engine tick, structured as
//! pre-logic -> mode-logic -> post-logic. Grounded on the teacher's periodic
//! housekeeping interval, generalized from a loop over a fleet of peer
//! tasks into a single pass over `Torrent::peers` since the dispatch task
//! now owns all of them directly.

use std::{net::SocketAddr, time::{Duration, Instant}};

use crate::{
    mode::{completion, dispatch, ModeState},
    p2p::message::Message,
    torrent::Torrent,
};

/// Peers unchoked at once absent a real rate-based policy; matches common
/// client defaults (4 regular + room for an optimistic unchoke).
const MAX_UNCHOKED: usize = 4;

const KEEP_ALIVE_AFTER: Duration = Duration::from_secs(90);
const DISCONNECT_AFTER_SILENCE: Duration = Duration::from_secs(180);
const DISCONNECT_AFTER_STALL: Duration = Duration::from_secs(15);
const INACTIVE_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const INACTIVE_PEER_THRESHOLD: Duration = Duration::from_secs(60);
const LPD_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(60);
const DHT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(15 * 60);
const PEX_INTERVAL: Duration = Duration::from_secs(60);

pub async fn run(torrent: &mut Torrent) {
    torrent.tick_count += 1;

    pre_logic(torrent).await;
    mode_logic(torrent).await;
    post_logic(torrent).await;
}

async fn pre_logic(torrent: &mut Torrent) {
    if let Err(e) = completion::try_hash_pending_files(torrent).await {
        tracing::warn!("pending-file hash pass failed: {}", e);
    }

    let now = Instant::now();

    drive_peer_exchange(torrent, now);

    if let Some(lpd) = torrent.ctx.lpd.clone() {
        let due = torrent.last_lpd_announce.map(|t| now.duration_since(t) >= LPD_ANNOUNCE_INTERVAL).unwrap_or(true);
        if due {
            lpd.announce(torrent.ctx.info_hash, torrent.listen_port()).await;
            torrent.last_lpd_announce = Some(now);
        }
    }
    if let Some(dht) = torrent.ctx.dht.clone() {
        let due = torrent.last_dht_announce.map(|t| now.duration_since(t) >= DHT_ANNOUNCE_INTERVAL).unwrap_or(true);
        if due {
            dht.announce(torrent.ctx.info_hash, torrent.listen_port()).await;
            torrent.last_dht_announce = Some(now);
        }
    }

    if torrent.tick_count % torrent.ctx.settings.ticks_per_second() == 0 {
        for session in torrent.peers.values_mut() {
            session.state.tick();
        }
        tracing::trace!(peers = torrent.peers.len(), available = torrent.available.len(), "peer-count summary");
    }

    if !torrent.finished_pieces.is_empty() {
        broadcast_have(torrent).await;
    }

    recompute_pending_request_limits(torrent);
}

/// §4.5 "Have broadcast": every connected peer gets a bundle of the
/// finished piece indices it doesn't already have (or the full list, with
/// have-suppression off), then we re-evaluate our own interest in it since
/// a peer that just learned we finished a piece may no longer be offering
/// us anything new.
async fn broadcast_have(torrent: &mut Torrent) {
    let indices: Vec<u32> = torrent.finished_pieces.drain(..).collect();
    queue_have_broadcast(torrent, &indices);

    torrent.drain_send_queues().await;

    let peers: Vec<SocketAddr> = torrent.peers.keys().copied().collect();
    for peer in peers {
        dispatch::recompute_interest(torrent, peer);
    }
}

fn queue_have_broadcast(torrent: &mut Torrent, indices: &[u32]) {
    let suppress = torrent.ctx.settings.allow_have_suppression;

    let peers: Vec<SocketAddr> = torrent.peers.keys().copied().collect();
    for peer in peers {
        let Some(session) = torrent.peers.get_mut(&peer) else { continue };
        let bundle: Vec<u32> = indices
            .iter()
            .copied()
            .filter(|idx| !suppress || !session.bitfield.get(*idx as usize).map(|b| *b).unwrap_or(false))
            .collect();
        for idx in bundle {
            session.queue(Message::Have { idx });
        }
    }
}

/// §4.5 "drive its peer-exchange sub-agent if its internal one-minute timer
/// elapsed": every peer whose `pex_last_run` is attached and due gets sent
/// our current peer set (minus itself) as a `PeerExchange` `added` list,
/// addressed to whatever id it advertised for `ut_pex` in its own extended
/// handshake. A peer that stops advertising `ut_pex` between handshake and
/// now (shouldn't happen, but the dictionary is peer-controlled) has its
/// timer cleared instead of erroring.
fn drive_peer_exchange(torrent: &mut Torrent, now: Instant) {
    let due: Vec<SocketAddr> = torrent
        .peers
        .iter()
        .filter(|(_, s)| s.pex_last_run.map(|t| now.duration_since(t) >= PEX_INTERVAL).unwrap_or(false))
        .map(|(addr, _)| *addr)
        .collect();
    if due.is_empty() {
        return;
    }

    let all_peers: Vec<SocketAddr> = torrent.peers.keys().copied().collect();

    for addr in due {
        let others: Vec<SocketAddr> = all_peers.iter().copied().filter(|a| *a != addr).collect();
        let Some(session) = torrent.peers.get_mut(&addr) else { continue };
        let Some(pex_id) = session.peer_extension_ids.get(dispatch::UT_PEX_NAME).copied() else {
            session.pex_last_run = None;
            continue;
        };
        if let Some(payload) = encode_pex_added(&others) {
            session.queue(Message::Extended { id: pex_id, payload });
        }
        session.pex_last_run = Some(now);
    }
}

fn encode_pex_added(peers: &[SocketAddr]) -> Option<Vec<u8>> {
    use serde_derive::Serialize;

    let mut added = Vec::with_capacity(peers.len() * 6);
    for addr in peers {
        let std::net::SocketAddr::V4(v4) = addr else { continue };
        added.extend_from_slice(&v4.ip().octets());
        added.extend_from_slice(&v4.port().to_be_bytes());
    }

    #[derive(Serialize)]
    struct PexMessage {
        #[serde(with = "serde_bytes")]
        added: Vec<u8>,
    }

    bencode::encode_to_raw(&PexMessage { added }).ok()
}

/// §4.5: `max_pending_requests = clamp(2, base + download_rate_kB /
/// bonus_per_kB, peer_advertised_max)`. `reqq` (the peer-advertised cap) is
/// already folded in as a floor by `dispatch::on_extended_handshake`, so
/// here we only raise the request window with observed throughput.
fn recompute_pending_request_limits(torrent: &mut Torrent) {
    const BASE: u32 = 2;
    const BONUS_PER_KB: u32 = 5;

    for session in torrent.peers.values_mut() {
        let rate_kb = session.state.throughput.down.avg() / 1024;
        let target = BASE + (rate_kb as u32).saturating_mul(BONUS_PER_KB);
        session.max_pending_requests = session.max_pending_requests.max(BASE).max(target.min(500));
    }
}

async fn mode_logic(torrent: &mut Torrent) {
    if torrent.mode.state == ModeState::Downloading {
        maybe_attach_web_seeds(torrent);
        maybe_sweep_inactive_peers(torrent);
    }

    unchoke_review(torrent);
}

fn maybe_attach_web_seeds(torrent: &Torrent) {
    let Some(web_seeds) = &torrent.ctx.web_seeds else { return };
    let Some(start) = torrent.start_time() else { return };
    if start.elapsed() < torrent.ctx.settings.web_seed_delay {
        return;
    }
    let down_rate = torrent.peers.values().map(|s| s.state.throughput.down.avg()).sum::<u64>();
    if down_rate < torrent.ctx.settings.web_seed_speed_trigger {
        tracing::debug!(urls = ?web_seeds.urls(), "download rate below trigger, web seeds eligible");
    }
}

/// Drops peers that have been neither interesting to us nor interested in
/// us for over a minute, making room for new connections. Gated to run at
/// most every 5s per §4.5.
fn maybe_sweep_inactive_peers(torrent: &mut Torrent) {
    let now = Instant::now();
    let due = torrent.last_inactive_sweep.map(|t| now.duration_since(t) >= INACTIVE_SWEEP_INTERVAL).unwrap_or(true);
    if !due {
        return;
    }
    torrent.last_inactive_sweep = Some(now);

    let stale: Vec<SocketAddr> = torrent
        .peers
        .iter()
        .filter(|(_, s)| {
            !s.state.interested
                && !s.state.peer_interested
                && now.duration_since(s.last_message_received) > INACTIVE_PEER_THRESHOLD
        })
        .map(|(addr, _)| *addr)
        .collect();

    for addr in stale {
        tracing::debug!("sweeping inactive peer {}", addr);
        torrent.peers.remove(&addr);
    }
}

fn unchoke_review(torrent: &mut Torrent) {
    let candidates: Vec<SocketAddr> = torrent
        .peers
        .iter()
        .filter(|(_, s)| s.state.peer_interested)
        .map(|(addr, _)| *addr)
        .collect();

    let unchoked = torrent.ctx.unchoker.choose_unchoked(&candidates, MAX_UNCHOKED);

    let peers: Vec<SocketAddr> = torrent.peers.keys().copied().collect();
    for addr in peers {
        let should_choke = !unchoked.contains(&addr);
        let Some(session) = torrent.peers.get_mut(&addr) else { continue };
        if session.state.choked != should_choke {
            session.state.choked = should_choke;
            session.queue(if should_choke { Message::Choke } else { Message::Unchoke });
        }
    }
}

async fn post_logic(torrent: &mut Torrent) {
    torrent.drain_send_queues().await;

    let to_disconnect = mark_stale_peers(torrent, Instant::now());

    for addr in to_disconnect {
        tracing::debug!("disconnecting unresponsive peer {}", addr);
        torrent.ctx.connections.disconnect(addr).await;
        torrent.peers.remove(&addr);
    }

    torrent.drain_send_queues().await;

    dispatch::request_more_blocks_all(torrent);

    if matches!(torrent.mode.state, ModeState::Downloading | ModeState::Seeding) {
        if let Err(e) = torrent.announce(None).await {
            tracing::warn!("periodic announce failed: {}", e);
        }
    }
}

/// Queues a keep-alive for any peer quiet longer than `KEEP_ALIVE_AFTER` and
/// collects peers to drop: gone silent past `DISCONNECT_AFTER_SILENCE`, or
/// stalled on an outstanding request past `DISCONNECT_AFTER_STALL`.
fn mark_stale_peers(torrent: &mut Torrent, now: Instant) -> Vec<SocketAddr> {
    let mut to_disconnect = Vec::new();
    for (addr, session) in torrent.peers.iter_mut() {
        if now.duration_since(session.last_message_sent) > KEEP_ALIVE_AFTER {
            session.queue(Message::KeepAlive);
        }
        if now.duration_since(session.last_message_received) > DISCONNECT_AFTER_SILENCE {
            to_disconnect.push(*addr);
            continue;
        }
        if !session.requested.is_empty() && now.duration_since(session.last_block_received) > DISCONNECT_AFTER_STALL {
            to_disconnect.push(*addr);
        }
    }
    to_disconnect
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{block::BlockInfo, p2p::PeerSession, torrent::tests::test_torrent};

    fn addr_at(port: u16) -> SocketAddr {
        SocketAddr::new(std::net::Ipv4Addr::LOCALHOST.into(), port)
    }

    #[tokio::test]
    async fn test_mark_stale_peers_queues_keep_alive_after_silence() {
        let mut torrent = test_torrent(4, 1024, 1024).await;
        let a = addr_at(7001);
        let mut session = PeerSession::new(a, 4);
        session.last_message_sent = Instant::now() - KEEP_ALIVE_AFTER - Duration::from_secs(1);
        torrent.peers.insert(a, session);

        let now = Instant::now();
        let to_disconnect = mark_stale_peers(&mut torrent, now);

        assert!(to_disconnect.is_empty());
        assert!(matches!(torrent.peers[&a].send_queue.front().unwrap().message, Message::KeepAlive));
    }

    #[tokio::test]
    async fn test_mark_stale_peers_disconnects_after_silence() {
        let mut torrent = test_torrent(4, 1024, 1024).await;
        let a = addr_at(7002);
        let mut session = PeerSession::new(a, 4);
        session.last_message_received = Instant::now() - DISCONNECT_AFTER_SILENCE - Duration::from_secs(1);
        torrent.peers.insert(a, session);

        let to_disconnect = mark_stale_peers(&mut torrent, Instant::now());

        assert_eq!(to_disconnect, vec![a]);
    }

    #[tokio::test]
    async fn test_mark_stale_peers_disconnects_on_stalled_request() {
        let mut torrent = test_torrent(4, 1024, 1024).await;
        let a = addr_at(7003);
        let mut session = PeerSession::new(a, 4);
        session.requested.insert(BlockInfo { piece_idx: 0, offset: 0, len: 16 });
        session.last_block_received = Instant::now() - DISCONNECT_AFTER_STALL - Duration::from_secs(1);
        torrent.peers.insert(a, session);

        let to_disconnect = mark_stale_peers(&mut torrent, Instant::now());

        assert_eq!(to_disconnect, vec![a]);
    }

    #[tokio::test]
    async fn test_mark_stale_peers_leaves_active_peer_alone() {
        let mut torrent = test_torrent(4, 1024, 1024).await;
        let a = addr_at(7004);
        torrent.peers.insert(a, PeerSession::new(a, 4));

        let to_disconnect = mark_stale_peers(&mut torrent, Instant::now());

        assert!(to_disconnect.is_empty());
        assert!(torrent.peers[&a].send_queue.is_empty());
    }

    #[tokio::test]
    async fn test_post_logic_removes_silent_peer() {
        let mut torrent = test_torrent(4, 1024, 1024).await;
        let a = addr_at(7005);
        let mut session = PeerSession::new(a, 4);
        session.last_message_received = Instant::now() - DISCONNECT_AFTER_SILENCE - Duration::from_secs(1);
        torrent.peers.insert(a, session);

        post_logic(&mut torrent).await;

        assert!(!torrent.peers.contains_key(&a));
    }

    #[tokio::test]
    async fn test_queue_have_broadcast_suppresses_peers_that_already_have_piece() {
        let mut torrent = test_torrent(4, 1024, 1024).await;
        let has_it = addr_at(7006);
        let lacks_it = addr_at(7007);
        let mut with_piece = PeerSession::new(has_it, 4);
        with_piece.set_have(0);
        torrent.peers.insert(has_it, with_piece);
        torrent.peers.insert(lacks_it, PeerSession::new(lacks_it, 4));

        queue_have_broadcast(&mut torrent, &[0]);

        assert!(torrent.peers[&has_it].send_queue.is_empty());
        assert_eq!(torrent.peers[&lacks_it].send_queue.len(), 1);
        assert!(matches!(torrent.peers[&lacks_it].send_queue.front().unwrap().message, Message::Have { idx: 0 }));
    }

    #[tokio::test]
    async fn test_recompute_pending_request_limits_scales_with_throughput() {
        let mut torrent = test_torrent(4, 1024, 1024).await;
        let a = addr_at(7008);
        let mut session = PeerSession::new(a, 4);
        session.state.throughput.down.add(10 * 1024);
        session.state.throughput.down.reset();
        torrent.peers.insert(a, session);

        recompute_pending_request_limits(&mut torrent);

        // 10 KiB/s in a round -> avg settles at 2048 B/s after one `reset`,
        // so target = BASE(2) + 2 * BONUS_PER_KB(5) = 12.
        assert_eq!(torrent.peers[&a].max_pending_requests, 12);
    }

    #[tokio::test]
    async fn test_unchoke_review_limits_to_max_unchoked() {
        let mut torrent = test_torrent(4, 1024, 1024).await;
        for i in 0..(MAX_UNCHOKED as u16 + 1) {
            let a = addr_at(7100 + i);
            let mut session = PeerSession::new(a, 4);
            session.state.peer_interested = true;
            torrent.peers.insert(a, session);
        }

        unchoke_review(&mut torrent);

        let unchoked = torrent.peers.values().filter(|s| !s.state.choked).count();
        assert_eq!(unchoked, MAX_UNCHOKED);
    }

    #[tokio::test]
    async fn test_unchoke_review_ignores_uninterested_peers() {
        let mut torrent = test_torrent(4, 1024, 1024).await;
        let a = addr_at(7200);
        torrent.peers.insert(a, PeerSession::new(a, 4));

        unchoke_review(&mut torrent);

        assert!(torrent.peers[&a].state.choked);
        assert!(torrent.peers[&a].send_queue.is_empty());
    }
}

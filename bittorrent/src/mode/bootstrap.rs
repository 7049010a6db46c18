//! Post-handshake bootstrap (§4.3): the first bundle of messages a newly
//! connected peer sees. Grounded on the teacher's handshake completion path
//! in `conn.rs`, which used to send a bitfield straight off the wire;
//! generalized here into an atomically-queued bundle so a peer never
//! observes a `Bitfield` without the `AllowedFast` entries that go with it.

use std::net::SocketAddr;

use crate::{fastpeer::allowed_fast, mode::dispatch, p2p::message::Message, torrent::Torrent, EngineError};

/// Builds and enqueues the bootstrap bundle for a peer whose handshake just
/// completed. If the current mode forbids new connections (e.g. stopped or
/// error) the peer is dropped instead.
pub async fn on_peer_connected(torrent: &mut Torrent, peer: SocketAddr, _inbound: bool) -> Result<(), EngineError> {
    if !torrent.mode.can_accept_connections {
        torrent.peers.remove(&peer);
        torrent.ctx.connections.disconnect(peer).await;
        return Ok(());
    }

    let num_pieces = torrent.ctx.store_info.num_pieces;
    let granted = allowed_fast(peer.ip(), &torrent.ctx.info_hash, num_pieces);

    let Some(session) = torrent.peers.get_mut(&peer) else { return Ok(()) };

    if session.supports_fast_peer {
        if torrent.own_bitfield.all() {
            session.queue(Message::HaveAll);
        } else if !torrent.own_bitfield.any() {
            session.queue(Message::HaveNone);
        } else {
            session.queue(Message::Bitfield(torrent.own_bitfield.clone()));
        }
    } else {
        session.queue(Message::Bitfield(torrent.own_bitfield.clone()));
    }

    if session.supports_extended {
        session.queue(Message::Extended { id: 0, payload: extended_handshake_payload(torrent) });
    }

    if session.supports_fast_peer {
        for idx in &granted {
            session.we_granted_fast.insert(*idx);
            session.queue(Message::AllowedFast { idx: *idx });
        }
    }

    torrent.drain_send_queues().await;
    super::dispatch::recompute_interest(torrent, peer);
    Ok(())
}

/// BEP 10 handshake dictionary: our listening port, the request queue depth
/// we'll honour, and the extension ids we support. `ut_metadata` is always
/// advertised (this engine always holds the full metainfo already); `ut_pex`
/// is only advertised when the torrent is public and peer-exchange is
/// enabled in settings, so a peer simply has no id to address it to
/// otherwise.
fn extended_handshake_payload(torrent: &Torrent) -> Vec<u8> {
    use serde_derive::Serialize;

    #[derive(Serialize)]
    struct ExtendedHandshake {
        m: std::collections::BTreeMap<String, i64>,
        p: u16,
        reqq: i64,
    }

    let mut m = std::collections::BTreeMap::new();
    m.insert(dispatch::UT_METADATA_NAME.to_string(), dispatch::UT_METADATA_ID as i64);
    if !torrent.ctx.private && torrent.ctx.settings.allow_peer_exchange {
        m.insert(dispatch::UT_PEX_NAME.to_string(), dispatch::UT_PEX_ID as i64);
    }

    let handshake = ExtendedHandshake {
        m,
        p: torrent.listen_port(),
        reqq: 192,
    };

    bencode::encode_to_raw(&handshake).unwrap_or_default()
}

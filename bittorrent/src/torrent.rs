//! The per-torrent engine. Generalizes the teacher's `Torrent`, which drove
//! a fleet of per-peer session tasks over a command channel, into a single
//! dispatch task that owns every `PeerSession` directly: `run`'s
//! `tokio::select!` loop is the only place torrent state is ever mutated,
//! so peer handling, the tick loop and piece completion all run as plain
//! function calls rather than message round trips.

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};

use tokio::sync::mpsc;

use crate::{
    collab::{ConnectionManager, DhtEngine, DiskManager, LocalPeerDiscovery, PieceManager, TrackerManager, Unchoker, WebSeedPool},
    conf::{ClientConfig, EngineSettings, TorrentConfig},
    conn::{InboundEvent, TcpConnectionManager},
    disk::Disk,
    error::EngineError,
    metainfo::MetaInfo,
    mode::{completion::WriteProgress, Mode},
    p2p::PeerSession,
    picker::Picker,
    store::StoreInfo,
    tracker::{Event, TrackersHandle},
    unchoke::RoundRobinUnchoker,
    Bitfield, ID,
};

/// Everything a dispatch handler needs beyond per-peer state: static
/// geometry plus every collaborator trait object. Unwrapped rather than
/// behind an `Arc`, since the dispatch task is this crate's only mutator of
/// torrent state and nothing else ever needs to share it.
pub struct TorrentCtx {
    pub info_hash: ID,
    pub client_id: ID,
    pub metainfo: MetaInfo,
    pub store_info: StoreInfo,
    pub disk: Arc<dyn DiskManager>,
    pub picker: Arc<dyn PieceManager>,
    pub connections: Arc<dyn ConnectionManager>,
    pub unchoker: Arc<dyn Unchoker>,
    pub trackers: Arc<dyn TrackerManager>,
    pub settings: EngineSettings,
    /// Effective private-torrent flag: the metainfo's own `private` key if
    /// set, otherwise the config's override. Gates peer-exchange attachment,
    /// `ut_pex` advertisement, and a peer-id mismatch's reject-vs-overwrite
    /// branch (spec's Handshake row).
    pub private: bool,
    /// Optional collaborators: `None` means that peer-discovery channel is
    /// simply not attached to this torrent, rather than a failure.
    pub dht: Option<Arc<dyn DhtEngine>>,
    pub lpd: Option<Arc<dyn LocalPeerDiscovery>>,
    pub web_seeds: Option<Arc<dyn WebSeedPool>>,
}

/// Commands the dispatch task accepts from outside itself (a listener task
/// forwarding an inbound socket, or a caller asking for a clean shutdown).
pub enum Command {
    Connect(SocketAddr),
    Shutdown,
}

pub type CommandTx = mpsc::UnboundedSender<Command>;
type CommandRx = mpsc::UnboundedReceiver<Command>;

/// One running torrent. `run` is its only mutator; every handler takes
/// `&mut Torrent` directly rather than messaging a separate owning task, so
/// there is never a second writer to race against mid-await (see
/// `mode::completion`'s module doc for what that buys the completion
/// pipeline specifically).
pub struct Torrent {
    pub ctx: TorrentCtx,
    pub mode: Mode,
    pub peers: HashMap<SocketAddr, PeerSession>,
    pub available: Vec<SocketAddr>,
    pub own_bitfield: Bitfield,
    pub write_progress: HashMap<usize, WriteProgress>,
    pub finished_pieces: VecDeque<u32>,
    pub hash_failures: u64,
    pub uploaded: u64,
    pub downloaded: u64,
    pub min_max_peers: (u32, u32),
    pub tick_count: u64,
    pub last_dht_announce: Option<Instant>,
    pub last_lpd_announce: Option<Instant>,
    pub last_inactive_sweep: Option<Instant>,
    /// Guards `mode::completion::try_hash_pending_files` against a second
    /// concurrent pass (§4.6).
    pub hashing_pending_files: std::sync::atomic::AtomicBool,
    start_time: Option<Instant>,
    command_tx: CommandTx,
    command_rx: CommandRx,
    inbound_rx: mpsc::UnboundedReceiver<InboundEvent>,
    listen_endpoint: SocketAddr,
}

impl Torrent {
    /// Allocates the torrent on disk (hashing any files already present),
    /// builds its collaborators from the teacher's default stack (real TCP
    /// connections, round-robin unchoking, the tiered tracker fan-out) and
    /// returns the torrent alongside a handle for sending it commands.
    pub async fn new(metainfo: MetaInfo, config: TorrentConfig, client: ClientConfig) -> Result<(Self, CommandTx), EngineError> {
        let info_hash = metainfo.info_hash();
        let store_info = StoreInfo::new(&metainfo, config.output_dir.clone());

        let disk = Disk::new();
        // `Disk::add_torrent` builds its own `StoreInfo` from the plain
        // output dir, so pass that rather than `store_info.output_dir`
        // (already joined onto the torrent name for multi-file layouts).
        let own_bitfield = disk.add_torrent(info_hash, &metainfo, config.output_dir.clone()).await?;

        let picker = Arc::new(Picker::new(store_info.num_pieces, store_info.piece_len, store_info.last_piece_len));
        picker.seed_own_bitfield(&own_bitfield);

        let (connections, inbound_rx) = TcpConnectionManager::new(info_hash, client.client_id);
        let trackers = TrackersHandle::new(metainfo.trackers(), info_hash, client.client_id, config.settings.listen_endpoint.port()).await;

        let (command_tx, command_rx) = mpsc::unbounded_channel();

        // The metainfo's own `private` key, when present, is authoritative;
        // the config flag only covers metainfo that omits it.
        let private = metainfo.info.private == Some(1) || config.private;

        let ctx = TorrentCtx {
            info_hash,
            client_id: client.client_id,
            metainfo,
            store_info,
            disk: Arc::new(disk),
            picker,
            connections: Arc::new(connections),
            unchoker: Arc::new(RoundRobinUnchoker::new()),
            trackers: Arc::new(trackers),
            settings: config.settings,
            private,
            dht: None,
            lpd: None,
            web_seeds: None,
        };

        let torrent = Torrent {
            mode: if own_bitfield.all() { Mode::seeding() } else { Mode::starting() },
            peers: HashMap::new(),
            available: Vec::new(),
            own_bitfield,
            write_progress: HashMap::new(),
            finished_pieces: VecDeque::new(),
            hash_failures: 0,
            uploaded: 0,
            downloaded: 0,
            min_max_peers: config.min_max_peers,
            tick_count: 0,
            last_dht_announce: None,
            last_lpd_announce: None,
            last_inactive_sweep: None,
            hashing_pending_files: std::sync::atomic::AtomicBool::new(false),
            start_time: None,
            command_tx: command_tx.clone(),
            command_rx,
            inbound_rx,
            listen_endpoint: ctx.settings.listen_endpoint,
            ctx,
        };

        Ok((torrent, command_tx))
    }

    /// Bytes still needed for the announce's `left` field. Approximated as
    /// missing-piece-count times the nominal piece length; BEP 3 does not
    /// require exactness here, just a monotonically decreasing estimate.
    fn left(&self) -> u64 {
        let missing = self.ctx.store_info.num_pieces as u64 - self.own_bitfield.count_ones() as u64;
        missing * self.ctx.store_info.piece_len as u64
    }

    /// Port advertised to peers in the extended handshake. Zero until `run`
    /// has bound the listener and resolved the actual ephemeral port.
    pub fn listen_port(&self) -> u16 {
        self.listen_endpoint.port()
    }

    pub fn start_time(&self) -> Option<Instant> {
        self.start_time
    }

    /// Replaces the running mode, cancelling the outgoing one first so any
    /// fire-and-forget work it started notices before the swap completes.
    pub fn set_mode(&mut self, mode: Mode) {
        self.mode.cancellation.cancel();
        tracing::info!(from = ?self.mode.state, to = ?mode.state, "mode transition");
        self.mode = mode;
    }

    /// Announces `event` to the tracker tier and queues the returned peers,
    /// respecting `min_max_peers` the way the teacher's `Torrent::announce`
    /// only asked for as many peers as it was short of.
    pub(crate) async fn announce(&mut self, event: Option<Event>) -> Result<(), EngineError> {
        let num_peers = self.peers.len() + self.available.len();
        if num_peers >= self.min_max_peers.1 as usize && event.is_none() {
            return Ok(());
        }

        let peers = self.ctx.trackers.announce(event, self.uploaded, self.downloaded, self.left()).await?;
        tracing::debug!("tracker returned {} peers", peers.len());
        for peer in peers {
            if !self.peers.contains_key(&peer) && !self.available.contains(&peer) {
                self.available.push(peer);
            }
        }
        Ok(())
    }

    fn connect_to_peers(&mut self) {
        if !self.mode.can_accept_connections {
            return;
        }
        let count = self.available.len().min((self.min_max_peers.1 as usize).saturating_sub(self.peers.len()));
        for address in self.available.drain(..count) {
            let _ = self.command_tx.send(Command::Connect(address));
        }
    }

    #[tracing::instrument(skip_all, name = "torrent", fields(info_hash = %hex::encode(self.ctx.info_hash)))]
    pub async fn run(&mut self) -> Result<(), EngineError> {
        let listener = tokio::net::TcpListener::bind(self.listen_endpoint).await?;
        self.listen_endpoint = listener.local_addr()?;
        tracing::info!("listening on {}", self.listen_endpoint);

        self.start_time = Some(Instant::now());
        self.announce(Some(Event::Started)).await?;
        self.connect_to_peers();

        let mut ticker = tokio::time::interval(self.ctx.settings.tick_interval);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => self.ctx.connections.accept(addr, stream).await,
                        Err(e) => tracing::warn!("inbound connection error: {}", e),
                    }
                }

                Some(event) = self.inbound_rx.recv() => {
                    self.handle_inbound(event).await;
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        Command::Connect(addr) => {
                            if let Err(e) = self.ctx.connections.connect(addr).await {
                                tracing::warn!("connect to {} failed: {}", addr, e);
                            }
                        }
                        Command::Shutdown => {
                            self.announce(Some(Event::Stopped)).await.ok();
                            break;
                        }
                    }
                }

                _ = ticker.tick() => {
                    crate::mode::tick::run(self).await;
                }
            }
        }

        Ok(())
    }

    async fn handle_inbound(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Connected { peer, peer_id, supports_fast_peer, supports_extended, inbound } => {
                // Handshake row: copy the peer id in if ours was empty; on a
                // mismatch against a peer id we already hold for this
                // address, reject for private torrents and accept+overwrite
                // for public ones.
                if let Some(known_id) = self.peers.get(&peer).and_then(|s| s.peer_id) {
                    if known_id != peer_id && self.ctx.private {
                        tracing::warn!("rejecting {}: peer id mismatch on a private torrent", peer);
                        self.ctx.connections.disconnect(peer).await;
                        return;
                    }
                }

                let num_pieces = self.ctx.store_info.num_pieces as usize;
                let mut session = PeerSession::new(peer, num_pieces);
                session.peer_id = Some(peer_id);
                session.supports_fast_peer = supports_fast_peer;
                session.supports_extended = supports_extended;
                session.state.conn_state = crate::p2p::state::ConnState::Introducing;
                self.peers.insert(peer, session);

                if let Err(e) = crate::mode::bootstrap::on_peer_connected(self, peer, inbound).await {
                    tracing::warn!("bootstrap with {} failed: {}", peer, e);
                    self.peers.remove(&peer);
                    self.ctx.connections.disconnect(peer).await;
                }
            }

            InboundEvent::Message { peer, message } => {
                if !self.mode.can_handle_messages {
                    return;
                }
                match crate::mode::dispatch::handle(self, peer, message).await {
                    Ok(()) => {}
                    Err(EngineError::ProtocolViolation(reason)) => {
                        tracing::warn!("{} violated protocol: {}", peer, reason);
                        self.peers.remove(&peer);
                        self.ctx.connections.disconnect(peer).await;
                    }
                    Err(e @ (EngineError::WriteFailure(_) | EngineError::ReadFailure(_))) => {
                        tracing::error!("disk failure, moving to error mode: {}", e);
                        self.set_mode(Mode::error());
                    }
                    Err(e) => tracing::warn!("error handling message from {}: {}", peer, e),
                }
            }

            InboundEvent::Disconnected { peer } => {
                tracing::debug!("{} disconnected", peer);
                self.peers.remove(&peer);
            }
        }
    }

    /// Drains every peer's send queue onto the wire. Called at the end of
    /// every dispatch so a burst of queued replies (e.g. several `Piece`
    /// responses to a request flood) goes out without waiting for the next
    /// tick.
    pub async fn drain_send_queues(&mut self) {
        for (addr, session) in self.peers.iter_mut() {
            for message in session.drain_send_queue() {
                if let Err(e) = self.ctx.connections.send(*addr, message).await {
                    tracing::warn!("send to {} failed: {}", addr, e);
                }
                session.last_message_sent = Instant::now();
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;

    use async_trait::async_trait;

    use crate::{
        block::{BlockData, BlockInfo},
        collab::{ConnectionManager, DiskManager, PieceManager, TrackerManager, Unchoker},
        disk::DiskError,
        metainfo::{Info, PieceHash},
        p2p::message::Message,
        picker::Picker,
        tracker::TrackerError,
    };

    /// In-memory stand-in for `disk::Disk`: assembles written blocks per
    /// piece and hashes them for real on `get_hash`, the same way
    /// `disk::store::TorrentStore` reads back and hashes whatever bytes
    /// were actually written, so mismatched test data genuinely fails its
    /// hash check instead of trivially passing.
    #[derive(Default)]
    struct FakeDisk {
        pieces: std::sync::Mutex<HashMap<usize, Vec<u8>>>,
    }

    #[async_trait]
    impl DiskManager for FakeDisk {
        async fn write(&self, _torrent: ID, block: BlockData) -> std::result::Result<(), DiskError> {
            let mut pieces = self.pieces.lock().unwrap();
            let buf = pieces.entry(block.piece_idx).or_default();
            let end = block.offset + block.data.len();
            if buf.len() < end {
                buf.resize(end, 0);
            }
            buf[block.offset..end].copy_from_slice(&block.data);
            Ok(())
        }

        async fn read(&self, _torrent: ID, block: BlockInfo) -> std::result::Result<Vec<u8>, DiskError> {
            let pieces = self.pieces.lock().unwrap();
            Ok(pieces
                .get(&block.piece_idx)
                .map(|b| b[block.offset..block.offset + block.len].to_vec())
                .unwrap_or_default())
        }

        async fn get_hash(&self, _torrent: ID, piece_index: u32) -> std::result::Result<PieceHash, DiskError> {
            use sha1::Digest;
            let pieces = self.pieces.lock().unwrap();
            let data = pieces.get(&(piece_index as usize)).cloned().unwrap_or_default();
            Ok(PieceHash::Sha1(sha1::Sha1::digest(&data).into()))
        }
    }

    struct FakeConnections;

    #[async_trait]
    impl ConnectionManager for FakeConnections {
        async fn connect(&self, _addr: SocketAddr) -> std::io::Result<()> {
            Ok(())
        }

        async fn send(&self, _peer: SocketAddr, _message: Message) -> std::io::Result<()> {
            Ok(())
        }

        async fn disconnect(&self, _peer: SocketAddr) {}
    }

    struct NoOpUnchoker;

    impl Unchoker for NoOpUnchoker {
        fn choose_unchoked(&self, candidates: &[SocketAddr], max_unchoked: usize) -> Vec<SocketAddr> {
            candidates.iter().take(max_unchoked).copied().collect()
        }
    }

    struct NoOpTrackers;

    #[async_trait]
    impl TrackerManager for NoOpTrackers {
        async fn announce(&self, _event: Option<Event>, _uploaded: u64, _downloaded: u64, _left: u64) -> std::result::Result<Vec<SocketAddr>, TrackerError> {
            Ok(Vec::new())
        }
    }

    fn synthetic_metainfo(num_pieces: u32, piece_len: usize, last_piece_len: usize) -> MetaInfo {
        use sha1::Digest;
        let mut pieces = Vec::with_capacity(num_pieces as usize * 20);
        for idx in 0..num_pieces {
            let mut hasher = sha1::Sha1::new();
            hasher.update([idx as u8; 4]);
            pieces.extend_from_slice(&hasher.finalize());
        }
        let total_len = piece_len as u64 * (num_pieces.saturating_sub(1)) as u64 + last_piece_len as u64;

        MetaInfo {
            announce: url::Url::parse("http://tracker.example/announce").unwrap(),
            info: Info {
                name: "test".to_string(),
                pieces,
                piece_length: piece_len as u32,
                md5sum: None,
                length: Some(total_len),
                files: None,
                private: None,
                root_hash: None,
            },
            info_hash: [0u8; 20],
            encoding: None,
            announce_list: None,
            creation_date: None,
            comment: None,
            created_by: None,
        }
    }

    /// Builds a `Torrent` wired to in-memory fakes, with `num_pieces`
    /// pieces of `piece_len` bytes (the last one `last_piece_len`), none of
    /// them owned yet. Used by `mode::completion`'s tests to exercise the
    /// write/hash pipeline without touching the filesystem or network.
    pub(crate) async fn test_torrent(num_pieces: u32, piece_len: usize, last_piece_len: usize) -> Torrent {
        let metainfo = synthetic_metainfo(num_pieces, piece_len, last_piece_len);
        let store_info = StoreInfo {
            total_len: piece_len as u64 * (num_pieces.saturating_sub(1)) as u64 + last_piece_len as u64,
            piece_len,
            last_piece_len,
            num_pieces,
            files: vec![crate::store::FileInfo {
                path: PathBuf::from("test"),
                length: piece_len * num_pieces as usize,
                offset: 0,
                md5sum: None,
            }],
            output_dir: PathBuf::from("unused"),
        };

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (_connections, inbound_rx) = TcpConnectionManager::new([0u8; 20], [0u8; 20]);

        let ctx = TorrentCtx {
            info_hash: [0u8; 20],
            client_id: [0u8; 20],
            metainfo,
            store_info,
            disk: Arc::new(FakeDisk::default()),
            picker: Arc::new(Picker::new(num_pieces, piece_len, last_piece_len)),
            connections: Arc::new(FakeConnections),
            unchoker: Arc::new(NoOpUnchoker),
            trackers: Arc::new(NoOpTrackers),
            settings: EngineSettings::default(),
            private: false,
            dht: None,
            lpd: None,
            web_seeds: None,
        };

        Torrent {
            mode: Mode::downloading(),
            peers: HashMap::new(),
            available: Vec::new(),
            own_bitfield: Bitfield::repeat(false, num_pieces as usize),
            write_progress: HashMap::new(),
            finished_pieces: VecDeque::new(),
            hash_failures: 0,
            uploaded: 0,
            downloaded: 0,
            min_max_peers: (5, 50),
            tick_count: 0,
            last_dht_announce: None,
            last_lpd_announce: None,
            last_inactive_sweep: None,
            hashing_pending_files: std::sync::atomic::AtomicBool::new(false),
            start_time: None,
            command_tx,
            command_rx,
            inbound_rx,
            listen_endpoint: "127.0.0.1:0".parse().unwrap(),
            ctx,
        }
    }

    #[tokio::test]
    async fn test_peer_id_mismatch_rejected_on_private_torrent() {
        let mut torrent = test_torrent(4, 1024, 1024).await;
        torrent.ctx.private = true;
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();

        torrent
            .handle_inbound(InboundEvent::Connected {
                peer: addr,
                peer_id: [1u8; 20],
                supports_fast_peer: false,
                supports_extended: false,
                inbound: true,
            })
            .await;
        assert_eq!(torrent.peers[&addr].peer_id, Some([1u8; 20]));

        torrent
            .handle_inbound(InboundEvent::Connected {
                peer: addr,
                peer_id: [2u8; 20],
                supports_fast_peer: false,
                supports_extended: false,
                inbound: true,
            })
            .await;

        assert_eq!(torrent.peers[&addr].peer_id, Some([1u8; 20]));
    }

    #[tokio::test]
    async fn test_peer_id_mismatch_overwrites_on_public_torrent() {
        let mut torrent = test_torrent(4, 1024, 1024).await;
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();

        torrent
            .handle_inbound(InboundEvent::Connected {
                peer: addr,
                peer_id: [1u8; 20],
                supports_fast_peer: false,
                supports_extended: false,
                inbound: true,
            })
            .await;

        torrent
            .handle_inbound(InboundEvent::Connected {
                peer: addr,
                peer_id: [2u8; 20],
                supports_fast_peer: false,
                supports_extended: false,
                inbound: true,
            })
            .await;

        assert_eq!(torrent.peers[&addr].peer_id, Some([2u8; 20]));
    }
}

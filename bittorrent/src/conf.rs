use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

/// Settings surface consumed by the engine: everything the tick loop and
/// dispatcher branch on that isn't derived from the torrent's own metainfo.
#[derive(Debug, Clone)]
pub struct EngineSettings {

    // Whether inbound BEP 11 peer-exchange messages are honoured at all.
    pub allow_peer_exchange: bool,

    // Whether `Have` broadcasts are filtered to peers that don't already
    // have the piece (§4.5's "have suppression").
    pub allow_have_suppression: bool,

    // How long after torrent start before web-seeds may be attached.
    pub web_seed_delay: Duration,

    // Download rate (bytes/sec) below which web-seeds are attached.
    pub web_seed_speed_trigger: u64,

    // Global connection cap used by the peer-exchange drop rule.
    pub maximum_connections: usize,

    pub listen_endpoint: SocketAddr,

    // Cadence of the engine tick; `ticks_per_second` is derived from it.
    pub tick_interval: Duration,

}

impl EngineSettings {
    pub fn ticks_per_second(&self) -> u64 {
        let millis = self.tick_interval.as_millis().max(1) as u64;
        (1000 / millis).max(1)
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            allow_peer_exchange: true,
            allow_have_suppression: true,
            web_seed_delay: Duration::from_secs(60),
            web_seed_speed_trigger: 50 * 1024,
            maximum_connections: 100,
            listen_endpoint: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 6881),
            tick_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TorrentConfig {

    pub output_dir: PathBuf,

    pub settings: EngineSettings,

    // Minimum and maximum peers desired for the torrent.
    pub min_max_peers: (u32, u32),

    // Whether the torrent was added as private (overrides metainfo's flag
    // only when metainfo doesn't already say so).
    pub private: bool,

}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("downloads"),
            settings: EngineSettings::default(),
            min_max_peers: (5, 100),
            private: false,
        }
    }
}

pub struct ClientConfig {

    pub client_id: [u8; 20],

}

const DEFAULT_CLIENT_ID: [u8; 20] = *b"-RS0133-73b3b0b0b0b0";

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID,
        }
    }
}

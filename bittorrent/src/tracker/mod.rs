//! Tracker tier fan-out. `TrackersHandle` implements `collab::TrackerManager`
//! over a fixed list of tiers built once at construction, in place of the
//! teacher's dedicated per-tracker task driven by a watch channel: the
//! dispatcher's own tick loop decides when to announce, so there is no
//! separate command/response round trip to model.

use std::{net::SocketAddr, time::Instant};

use url::Url;

use crate::ID;

mod http;
mod udp;
pub use http::HttpTracker;
pub use udp::UdpTracker;

type Result<T> = std::result::Result<T, TrackerError>;

// In cases where the tracker doesn't give us a min interval.
const DEFAULT_MIN_ANNOUNCE_INTERVAL: u64 = 60; // seconds

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {

    #[error("request error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("error deserializing response: {0}")]
    BencodeError(#[from] bencode::Error),

    #[error("timeout")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("invalid url")]
    InvalidUrl,

    #[error("response error: {0}")]
    ResponseError(String),

    #[error("no trackers announced successfully")]
    AllTiersFailed,
}

#[async_trait::async_trait]
pub trait Tracker: Send + Sync {

    async fn announce(&mut self, params: AnnounceParams) -> Result<Vec<SocketAddr>>;

    fn can_announce(&self, time: Instant) -> bool;

    fn should_announce(&self, time: Instant) -> bool;
}

/// Ordered tracker tiers (BEP 12), each entry guarded by its own lock since
/// `Tracker::announce` takes `&mut self` but the dispatcher only ever holds
/// `Arc<dyn TrackerManager>`. Built once from the torrent's announce-list;
/// trackers whose scheme we don't recognise are skipped with a warning.
pub struct TrackersHandle {
    tiers: Vec<Vec<tokio::sync::Mutex<Box<dyn Tracker>>>>,
    info_hash: ID,
    client_id: ID,
    port: u16,
}

impl TrackersHandle {
    pub async fn new(tiers: Vec<Vec<Url>>, info_hash: ID, client_id: ID, port: u16) -> Self {
        let mut built = Vec::with_capacity(tiers.len());
        for tier in tiers {
            let mut built_tier = Vec::with_capacity(tier.len());
            for url in tier {
                let tracker: Box<dyn Tracker> = match url.scheme() {
                    "http" | "https" => Box::new(HttpTracker::new(url.clone())),
                    "udp" => Box::new(UdpTracker::new(url.clone()).await),
                    other => {
                        tracing::warn!("unsupported tracker scheme: {}", other);
                        continue;
                    }
                };
                built_tier.push(tokio::sync::Mutex::new(tracker));
            }
            built.push(built_tier);
        }
        Self { tiers: built, info_hash, client_id, port }
    }
}

#[async_trait::async_trait]
impl crate::collab::TrackerManager for TrackersHandle {
    #[tracing::instrument(skip(self))]
    async fn announce(&self, event: Option<Event>, uploaded: u64, downloaded: u64, left: u64) -> Result<Vec<SocketAddr>> {
        let time = Instant::now();
        let params = AnnounceParams {
            info_hash: self.info_hash,
            client_id: self.client_id,
            port: self.port,
            uploaded,
            downloaded,
            left,
            event,
            num_want: Some(50),
        };

        let mut last_err = None;
        // BEP 12: stick with the first tier that answers; only fall through
        // to the next on total failure of the current one.
        for tier in &self.tiers {
            for tracker in tier {
                let mut guard = tracker.lock().await;
                if !(event.is_some() || guard.should_announce(time) || guard.can_announce(time)) {
                    continue;
                }
                match guard.announce(params).await {
                    Ok(peers) => return Ok(peers),
                    Err(e) => {
                        tracing::warn!("tracker announce failed: {}", e);
                        last_err = Some(e);
                    }
                }
            }
        }

        Err(last_err.unwrap_or(TrackerError::AllTiersFailed))
    }
}

#[derive(Debug, Copy, Clone, Default)]
pub struct AnnounceParams {

    // Hash of info dict.
    pub info_hash: ID,

    // Urlencoded 20-byte string used as a unique ID for the client.
    pub client_id: ID,

    // Port number.
    pub port: u16,

    // The total amount uploaded (since the client sent the 'started' event to the tracker) in base ten ASCII.
    pub uploaded: u64,

    // The total amount downloaded (since the client sent the 'started' event to the tracker) in base ten ASCII.
    pub downloaded: u64,

    // The number of bytes this client still has to download in base ten ASCII.
    pub left: u64,

    // If specified, must be one of started, completed, stopped, (or empty which is the same as not being specified).
    pub event: Option<Event>,

    // Number of peers that the client would like to receive from the tracker.
    pub num_want: Option<usize>,
}

#[derive(Copy, Clone, Debug, PartialEq, Default)]
pub enum Event {

    Completed,

    #[default]
    Started,

    Stopped,
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Completed => write!(f, "completed"),
            Event::Started => write!(f, "started"),
            Event::Stopped => write!(f, "stopped"),
        }
    }
}

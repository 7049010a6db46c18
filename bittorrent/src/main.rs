use std::path::{Path, PathBuf};

use bittorrent::{ClientConfig, MetaInfo, Torrent, TorrentConfig};

#[tokio::main]
async fn main() {
    let format = tracing_subscriber::fmt::format();
    let sub = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .event_format(format)
        .finish();
    tracing::subscriber::set_global_default(sub).unwrap();

    let torrent_path = std::env::args().nth(1).expect("usage: bittorrent <path-to-torrent>");
    let output_dir = std::env::args().nth(2).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("downloads"));

    let metainfo = MetaInfo::new(Path::new(&torrent_path)).expect("failed to parse torrent file");
    let config = TorrentConfig { output_dir, ..TorrentConfig::default() };
    let client = ClientConfig::default();

    let (mut torrent, _commands) = Torrent::new(metainfo, config, client).await.expect("failed to allocate torrent");

    if let Err(e) = torrent.run().await {
        tracing::error!("torrent exited: {}", e);
    }
}

//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The default leechtorrent client id prefix.
///
/// Peer ids are assembled at startup from this prefix plus random
/// alphanumerics (see [`crate::engine::generate_peer_id`]); this constant is
/// only used as a placeholder client id before a session has generated its
/// own.
pub const DEFAULT_CLIENT_ID: &PeerId = b"-YM0100-000000000000";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the engine configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user. It uses a freshly generated peer id.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: *DEFAULT_CLIENT_ID,
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download.
    pub download_dir: PathBuf,

    /// Hard cap on the number of simultaneously connected peers.
    pub max_active_connections: usize,

    /// Cap on the number of peers concurrently requesting blocks.
    pub max_active_requests: usize,

    /// Below this many alive peers, the coordinator reconnects everything it
    /// knows about.
    pub min_active_connections: usize,

    /// Per reconnect tick, the cap on how many new connections may be dialed.
    pub max_new_connections_per_tick: usize,

    /// How often the coordinator recomputes speed and considers announcing.
    pub progress_tick: Duration,

    /// How often the peer pool is topped up from the alive set.
    pub reconnect_tick: Duration,

    /// How often idle connections are sent a keep-alive.
    pub keepalive_tick: Duration,

    /// If the tracker doesn't provide an announce interval, re-announce after
    /// this long.
    pub announce_interval: Duration,

    /// The `numwant` value sent with each announce.
    pub numwant: usize,

    /// After this many consecutive failures, a tracker is no longer retried
    /// for the remainder of the session.
    pub tracker_error_threshold: usize,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            max_active_connections: 100,
            max_active_requests: 30,
            min_active_connections: 10,
            max_new_connections_per_tick: 20,
            progress_tick: Duration::from_secs(2),
            reconnect_tick: Duration::from_secs(15),
            keepalive_tick: Duration::from_secs(60),
            // fixed per the resolved open question in the design notes: the
            // source's conflicting hardcoded re-announce periods are replaced
            // with a single value
            announce_interval: Duration::from_secs(200),
            numwant: 10_000,
            tracker_error_threshold: 15,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let conf = TorrentConf::new("/tmp/downloads");
        assert_eq!(conf.max_active_connections, 100);
        assert_eq!(conf.max_active_requests, 30);
        assert_eq!(conf.min_active_connections, 10);
        assert_eq!(conf.max_new_connections_per_tick, 20);
        assert_eq!(conf.announce_interval, Duration::from_secs(200));
        assert_eq!(conf.numwant, 10_000);
    }
}

//! The tracker client (component E): queries HTTP and UDP trackers and
//! normalizes their peer lists into a common [`TrackerResponse`].

mod http;
mod udp;

use std::{net::SocketAddr, time::Duration};

use crate::{error::Result, PeerId, Sha1Hash};

/// The event announced alongside a tracker request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TrackerEvent {
    None,
    Started,
    Completed,
    Stopped,
}

/// A single peer as normalized out of either tracker protocol's peer list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct TrackerPeer {
    pub addr: SocketAddr,
    pub id: Option<PeerId>,
}

/// The parameters of a single announce request.
pub(crate) struct AnnounceParams<'a> {
    pub url: &'a str,
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: TrackerEvent,
    pub numwant: usize,
}

/// A tracker's normalized response to an announce.
#[derive(Debug, Clone, Default)]
pub(crate) struct TrackerResponse {
    pub interval: Option<Duration>,
    pub min_interval: Option<Duration>,
    pub complete: Option<usize>,
    pub incomplete: Option<usize>,
    pub peers: Vec<TrackerPeer>,
}

/// Announces to the tracker named by `params.url`, dispatching to the HTTP
/// or UDP variant based on the URL scheme.
pub(crate) async fn announce(
    params: &AnnounceParams<'_>,
) -> Result<TrackerResponse> {
    if params.url.starts_with("udp://") {
        udp::announce(params).await
    } else {
        http::announce(params).await
    }
}

pub(crate) fn event_param(event: TrackerEvent) -> Option<&'static str> {
    match event {
        TrackerEvent::None => None,
        TrackerEvent::Started => Some("started"),
        TrackerEvent::Completed => Some("completed"),
        TrackerEvent::Stopped => Some("stopped"),
    }
}

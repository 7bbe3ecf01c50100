//! HTTP tracker announces (BEP 3): form-encoded GET request, bencoded
//! dictionary response, accepting peers in either the compact
//! 6-bytes-per-peer form or the list-of-dictionaries form.

use std::{fmt, net::{Ipv4Addr, SocketAddr, SocketAddrV4}, time::Duration};

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use serde::de::{Deserializer, SeqAccess, Visitor};

use crate::error::{Error, Result};

use super::{event_param, AnnounceParams, TrackerEvent, TrackerPeer, TrackerResponse};

/// Builds and sends the GET request; a 1 s connect timeout is enforced on
/// the underlying TCP connection.
pub(super) async fn announce(
    params: &AnnounceParams<'_>,
) -> Result<TrackerResponse> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(1))
        .build()
        .map_err(|e| Error::Tracker(e.to_string()))?;

    let url = build_url(params);
    let resp = client
        .get(&url)
        .send()
        .await
        .map_err(|e| Error::Tracker(e.to_string()))?;
    let body = resp
        .bytes()
        .await
        .map_err(|e| Error::Tracker(e.to_string()))?;

    let raw: RawResponse = serde_bencode::from_bytes(&body)
        .map_err(|e| Error::Tracker(format!("malformed tracker response: {}", e)))?;

    if let Some(reason) = raw.failure_reason {
        return Err(Error::Tracker(reason));
    }

    let peers = match raw.peers {
        Some(PeersField::Compact(bytes)) => decode_compact_peers(&bytes),
        Some(PeersField::List(list)) => list
            .into_iter()
            .filter_map(|p| {
                let ip: Ipv4Addr = p.ip.parse().ok()?;
                let mut id = None;
                if let Some(bytes) = p.peer_id {
                    if bytes.len() == 20 {
                        let mut buf = [0u8; 20];
                        buf.copy_from_slice(&bytes);
                        id = Some(buf);
                    }
                }
                Some(TrackerPeer {
                    addr: SocketAddr::V4(SocketAddrV4::new(ip, p.port)),
                    id,
                })
            })
            .collect(),
        None => Vec::new(),
    };

    Ok(TrackerResponse {
        interval: raw.interval.map(|s| Duration::from_secs(s as u64)),
        min_interval: raw.min_interval.map(|s| Duration::from_secs(s as u64)),
        complete: raw.complete.map(|n| n as usize),
        incomplete: raw.incomplete.map(|n| n as usize),
        peers,
    })
}

fn build_url(params: &AnnounceParams<'_>) -> String {
    let info_hash = percent_encode(&params.info_hash, NON_ALPHANUMERIC);
    let peer_id = percent_encode(&params.peer_id, NON_ALPHANUMERIC);
    let mut qs = format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={}",
        info_hash,
        peer_id,
        params.port,
        params.uploaded,
        params.downloaded,
        params.left,
        params.numwant,
    );
    if let Some(event) = event_param(params.event) {
        qs.push_str("&event=");
        qs.push_str(event);
    }
    if params.url.contains('?') {
        format!("{}&{}", params.url, qs)
    } else {
        format!("{}?{}", params.url, qs)
    }
}

fn decode_compact_peers(bytes: &[u8]) -> Vec<TrackerPeer> {
    bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            TrackerPeer {
                addr: SocketAddr::V4(SocketAddrV4::new(ip, port)),
                id: None,
            }
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    interval: Option<i64>,
    #[serde(rename = "min interval")]
    min_interval: Option<i64>,
    complete: Option<i64>,
    incomplete: Option<i64>,
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    peers: Option<PeersField>,
}

#[derive(Debug, Deserialize)]
struct RawPeerDict {
    ip: String,
    port: u16,
    #[serde(default, rename = "peer id", with = "serde_bytes_option")]
    peer_id: Option<Vec<u8>>,
}

/// The `peers` field of a tracker response is either a compact byte string
/// or a list of peer dictionaries; this accepts both.
#[derive(Debug)]
enum PeersField {
    Compact(Vec<u8>),
    List(Vec<RawPeerDict>),
}

impl<'de> serde::Deserialize<'de> for PeersField {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PeersVisitor;

        impl<'de> Visitor<'de> for PeersVisitor {
            type Value = PeersField;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(
                    "a compact peer byte string or a list of peer dictionaries",
                )
            }

            fn visit_bytes<E>(
                self,
                v: &[u8],
            ) -> std::result::Result<Self::Value, E> {
                Ok(PeersField::Compact(v.to_vec()))
            }

            fn visit_byte_buf<E>(
                self,
                v: Vec<u8>,
            ) -> std::result::Result<Self::Value, E> {
                Ok(PeersField::Compact(v))
            }

            fn visit_str<E>(
                self,
                v: &str,
            ) -> std::result::Result<Self::Value, E> {
                Ok(PeersField::Compact(v.as_bytes().to_vec()))
            }

            fn visit_seq<A>(
                self,
                mut seq: A,
            ) -> std::result::Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut list = Vec::new();
                while let Some(peer) = seq.next_element::<RawPeerDict>()? {
                    list.push(peer);
                }
                Ok(PeersField::List(list))
            }
        }

        deserializer.deserialize_any(PeersVisitor)
    }
}

/// `serde_bytes` adapted for an `Option<Vec<u8>>` field.
mod serde_bytes_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(
        deserializer: D,
    ) -> std::result::Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Option<serde_bytes::ByteBuf> =
            Option::deserialize(deserializer)?;
        Ok(bytes.map(|b| b.into_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_compact_peer_blob() {
        let bytes = [127, 0, 0, 1, 0x1A, 0xE1, 192, 168, 0, 1, 0x1A, 0xE2];
        let peers = decode_compact_peers(&bytes);
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].addr.port(), 0x1AE1);
        assert_eq!(peers[1].addr.to_string(), "192.168.0.1:6882");
    }

    #[test]
    fn builds_query_string_with_event() {
        let params = AnnounceParams {
            url: "http://tracker.example/announce",
            info_hash: [0xAB; 20],
            peer_id: [b'x'; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 100,
            event: TrackerEvent::Started,
            numwant: 50,
        };
        let url = build_url(&params);
        assert!(url.starts_with("http://tracker.example/announce?"));
        assert!(url.contains("event=started"));
        assert!(url.contains("numwant=50"));
    }
}

//! UDP tracker announces (BEP 15): a connect handshake followed by the
//! announce request, both guarded by transaction id checks.

use std::{net::{Ipv4Addr, SocketAddr, SocketAddrV4}, time::Duration};

use bytes::{Buf, BufMut, BytesMut};
use tokio::{net::UdpSocket, time::timeout};

use crate::error::{Error, Result};

use super::{AnnounceParams, TrackerEvent, TrackerPeer, TrackerResponse};

const PROTOCOL_ID: u64 = 0x0000_0417_2710_1980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;

const SOCKET_TIMEOUT: Duration = Duration::from_secs(1);

pub(super) async fn announce(
    params: &AnnounceParams<'_>,
) -> Result<TrackerResponse> {
    let addr = parse_addr(params.url)?;
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(addr).await?;

    let connection_id = connect(&socket).await?;
    do_announce(&socket, connection_id, params).await
}

async fn connect(socket: &UdpSocket) -> Result<u64> {
    let transaction_id: u32 = rand::random();
    let mut req = BytesMut::with_capacity(16);
    req.put_u64(PROTOCOL_ID);
    req.put_u32(ACTION_CONNECT);
    req.put_u32(transaction_id);

    timeout(SOCKET_TIMEOUT, socket.send(&req))
        .await
        .map_err(|_| Error::Timeout)??;

    let mut buf = [0u8; 16];
    let n = timeout(SOCKET_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| Error::Timeout)??;
    if n < 16 {
        return Err(Error::ProtocolError("short udp tracker connect reply"));
    }

    let mut r = &buf[..16];
    let action = r.get_u32();
    let reply_transaction_id = r.get_u32();
    if action != ACTION_CONNECT || reply_transaction_id != transaction_id {
        return Err(Error::ProtocolError(
            "udp tracker connect reply mismatched transaction/action",
        ));
    }
    Ok(r.get_u64())
}

async fn do_announce(
    socket: &UdpSocket,
    connection_id: u64,
    params: &AnnounceParams<'_>,
) -> Result<TrackerResponse> {
    let transaction_id: u32 = rand::random();
    let mut req = BytesMut::with_capacity(98);
    req.put_u64(connection_id);
    req.put_u32(ACTION_ANNOUNCE);
    req.put_u32(transaction_id);
    req.put_slice(&params.info_hash);
    req.put_slice(&params.peer_id);
    req.put_u64(params.downloaded);
    req.put_u64(params.left);
    req.put_u64(params.uploaded);
    req.put_u32(event_code(params.event));
    req.put_u32(0); // ip: 0 means "use the sender's address"
    req.put_u32(rand::random()); // key
    req.put_i32(params.numwant as i32);
    req.put_u16(params.port);
    debug_assert_eq!(req.len(), 98);

    timeout(SOCKET_TIMEOUT, socket.send(&req))
        .await
        .map_err(|_| Error::Timeout)??;

    // a datagram can carry at most 6*numwant peer bytes past the 20 byte
    // header; cap generously below the UDP practical payload limit
    let mut buf = vec![0u8; 20 + 6 * 1024];
    let n = timeout(SOCKET_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| Error::Timeout)??;
    if n < 20 {
        return Err(Error::ProtocolError("short udp tracker announce reply"));
    }

    let mut r = &buf[..n];
    let action = r.get_u32();
    let reply_transaction_id = r.get_u32();
    if action != ACTION_ANNOUNCE || reply_transaction_id != transaction_id {
        return Err(Error::ProtocolError(
            "udp tracker announce reply mismatched transaction/action",
        ));
    }
    let interval = r.get_u32();
    let leechers = r.get_u32();
    let seeders = r.get_u32();

    let peers = r
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            TrackerPeer {
                addr: SocketAddr::V4(SocketAddrV4::new(ip, port)),
                id: None,
            }
        })
        .collect();

    Ok(TrackerResponse {
        interval: Some(Duration::from_secs(interval as u64)),
        min_interval: None,
        complete: Some(seeders as usize),
        incomplete: Some(leechers as usize),
        peers,
    })
}

fn event_code(event: TrackerEvent) -> u32 {
    match event {
        TrackerEvent::None => 0,
        TrackerEvent::Completed => 1,
        TrackerEvent::Started => 2,
        TrackerEvent::Stopped => 3,
    }
}

fn parse_addr(announce_url: &str) -> Result<SocketAddr> {
    let parsed = url::Url::parse(announce_url)
        .map_err(|e| Error::Tracker(format!("malformed tracker url: {}", e)))?;
    if parsed.scheme() != "udp" {
        return Err(Error::Tracker("not a udp:// announce url".into()));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| Error::Tracker("udp tracker url has no host".into()))?;
    let port = parsed
        .port()
        .ok_or_else(|| Error::Tracker("udp tracker url has no port".into()))?;
    let host_port = format!("{}:{}", host, port);
    host_port.parse().or_else(|_| {
        // not a bare socket address; resolve via std's blocking resolver,
        // which is fine here since this runs once per announce
        std::net::ToSocketAddrs::to_socket_addrs(&host_port)
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| Error::Tracker(format!("cannot resolve {}", host_port)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_codes_match_bep15() {
        assert_eq!(event_code(TrackerEvent::None), 0);
        assert_eq!(event_code(TrackerEvent::Completed), 1);
        assert_eq!(event_code(TrackerEvent::Started), 2);
        assert_eq!(event_code(TrackerEvent::Stopped), 3);
    }

    #[test]
    fn parses_bare_socket_address() {
        let addr = parse_addr("udp://127.0.0.1:6969/announce").unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:6969");
    }
}

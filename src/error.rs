//! The crate-wide error type and the error handling taxonomy described in the
//! design: transient peer errors are absorbed by the peer session and never
//! reach here; what's left are protocol violations, tracker failures, storage
//! failures, and a handful of programmer-error conditions that are validated
//! defensively rather than allowed to panic.

use std::{fmt, io};

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// The crate-wide error type.
///
/// This does not pull in an error-derive crate: each variant is matched by
/// hand in `Display`, and conversions from the handful of upstream error
/// types we interact with are implemented via `From`.
#[derive(Debug)]
pub enum Error {
    /// An IO operation (file or socket) failed.
    Io(io::Error),
    /// The metainfo buffer could not be parsed as bencode, or was missing a
    /// required field.
    InvalidMetainfo(String),

    // -- wire codec (§4.1) --
    /// Fewer bytes were available than the frame's length prefix promised
    /// before the connection closed.
    ShortRead,
    /// A frame's length prefix exceeded the maximum allowed payload size.
    OversizeFrame,
    /// The handshake's protocol string did not match `"BitTorrent protocol"`.
    BadProtocol,
    /// The peer's handshake advertised a different info hash than ours.
    InfoHashMismatch,

    // -- peer session (§4.2) --
    /// The peer could not be reached (connect failed or connection reset).
    PeerUnreachable,
    /// The peer violated the wire protocol in a way the codec didn't already
    /// catch (e.g. a bitfield sent outside the availability-exchange state).
    ProtocolError(&'static str),
    /// A socket operation did not complete within its deadline.
    Timeout,
    /// The peer has us choked; not fatal, but no requests can be made.
    PeerChoked,
    /// The peer delivered a block we never requested.
    InvalidBlock,
    /// The peer never sent a bitfield and so cannot be treated as a seed we
    /// can download from.
    PeerNotSeed,

    // -- piece/block manager & disk (§4.3, §4.4) --
    /// A piece index outside `0..piece_count` was used.
    InvalidPieceIndex,
    /// An operation referenced a torrent id the engine doesn't know about.
    InvalidTorrentId,

    // -- tracker client (§4.5) --
    /// A tracker request failed or returned a malformed response.
    Tracker(String),

    /// An internal channel was closed while a message was still in flight;
    /// this only happens during shutdown races and is not user-actionable.
    ChannelClosed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::InvalidMetainfo(msg) => write!(f, "invalid metainfo: {}", msg),
            Error::ShortRead => write!(f, "connection closed mid-frame"),
            Error::OversizeFrame => write!(f, "frame payload exceeds maximum size"),
            Error::BadProtocol => write!(f, "handshake protocol string mismatch"),
            Error::InfoHashMismatch => write!(f, "peer advertised a different info hash"),
            Error::PeerUnreachable => write!(f, "peer unreachable"),
            Error::ProtocolError(msg) => write!(f, "protocol error: {}", msg),
            Error::Timeout => write!(f, "operation timed out"),
            Error::PeerChoked => write!(f, "peer has us choked"),
            Error::InvalidBlock => write!(f, "peer delivered an unrequested block"),
            Error::PeerNotSeed => write!(f, "peer is not a seed"),
            Error::InvalidPieceIndex => write!(f, "invalid piece index"),
            Error::InvalidTorrentId => write!(f, "invalid torrent id"),
            Error::Tracker(msg) => write!(f, "tracker error: {}", msg),
            Error::ChannelClosed => write!(f, "internal channel closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Error::InvalidMetainfo(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}

impl From<tokio::time::Elapsed> for Error {
    fn from(_: tokio::time::Elapsed) -> Self {
        Error::Timeout
    }
}

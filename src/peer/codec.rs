//! The peer wire protocol codec (component A): the handshake and the
//! length-prefixed message framing described in BEP 3.

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::Error, Bitfield, BlockInfo, PeerId, Sha1Hash};

pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Frames larger than this are rejected as a protocol violation: no
/// legitimate peer message (a single block plus a small header) should ever
/// approach this size.
const MAX_FRAME_LEN: usize = 128 * 1024;

/// The very first message exchanged on a new connection, before any
/// length-prefixed framing begins.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        Self { info_hash, peer_id }
    }
}

/// Codec for the initial handshake. A connection starts framed with this
/// codec and, once a valid handshake has been read, its buffers are moved
/// into a `Framed<_, PeerCodec>` via `FramedParts` so that no bytes the peer
/// may have already pipelined after the handshake are lost.
pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        let pstr = PROTOCOL_STRING.as_bytes();
        buf.reserve(49 + pstr.len());
        buf.put_u8(pstr.len() as u8);
        buf.put_slice(pstr);
        buf.put_slice(&[0u8; 8]);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if buf.is_empty() {
            return Ok(None);
        }
        let pstr_len = buf[0] as usize;
        if pstr_len != PROTOCOL_STRING.len() {
            return Err(Error::BadProtocol);
        }
        let total_len = 49 + pstr_len;
        if buf.len() < total_len {
            buf.reserve(total_len - buf.len());
            return Ok(None);
        }

        let mut frame = buf.split_to(total_len);
        frame.advance(1); // pstrlen
        let pstr = frame.split_to(pstr_len);
        if pstr != PROTOCOL_STRING.as_bytes() {
            return Err(Error::BadProtocol);
        }
        frame.advance(8); // reserved bytes

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&frame.split_to(20));
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&frame.split_to(20));

        Ok(Some(Handshake { info_hash, peer_id }))
    }
}

/// The canonical peer wire message ids (BEP 3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl MessageId {
    fn from_u8(id: u8) -> Result<Self, Error> {
        Ok(match id {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => Self::Have,
            5 => Self::Bitfield,
            6 => Self::Request,
            7 => Self::Piece,
            8 => Self::Cancel,
            9 => Self::Port,
            _ => return Err(Error::ProtocolError("unknown message id")),
        })
    }
}

/// A decoded (or to-be-encoded) peer message.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block { piece_index: u32, offset: u32, data: Vec<u8> },
    Cancel(BlockInfo),
    Port(u16),
}

impl Message {
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Piece),
            Self::Cancel(_) => Some(MessageId::Cancel),
            Self::Port(_) => Some(MessageId::Port),
        }
    }
}

/// Codec for all messages exchanged after a successful handshake.
pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(
        &mut self,
        msg: Message,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(msg.id().unwrap() as u8);
            }
            Message::Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(&bytes);
            }
            Message::Request(info) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(info.piece_index as u32);
                buf.put_u32(info.offset);
                buf.put_u32(info.len);
            }
            Message::Block { piece_index, offset, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(piece_index);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
            Message::Cancel(info) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(info.piece_index as u32);
                buf.put_u32(info.offset);
                buf.put_u32(info.len);
            }
            Message::Port(port) => {
                buf.put_u32(3);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(port);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
        if len > MAX_FRAME_LEN {
            return Err(Error::OversizeFrame);
        }
        if buf.len() < 4 + len {
            buf.reserve(4 + len - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        if len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let mut payload = buf.split_to(len);
        let id = MessageId::from_u8(payload.get_u8())?;
        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                if payload.remaining() < 4 {
                    return Err(Error::ProtocolError("short have payload"));
                }
                Message::Have { piece_index: payload.get_u32() }
            }
            MessageId::Bitfield => {
                Message::Bitfield(Bitfield::from_vec(payload.to_vec()))
            }
            MessageId::Request => {
                if payload.remaining() < 12 {
                    return Err(Error::ProtocolError("short request payload"));
                }
                Message::Request(BlockInfo {
                    piece_index: payload.get_u32() as usize,
                    offset: payload.get_u32(),
                    len: payload.get_u32(),
                })
            }
            MessageId::Piece => {
                if payload.remaining() < 8 {
                    return Err(Error::ProtocolError("short piece payload"));
                }
                let piece_index = payload.get_u32();
                let offset = payload.get_u32();
                Message::Block {
                    piece_index,
                    offset,
                    data: payload.to_vec(),
                }
            }
            MessageId::Cancel => {
                if payload.remaining() < 12 {
                    return Err(Error::ProtocolError("short cancel payload"));
                }
                Message::Cancel(BlockInfo {
                    piece_index: payload.get_u32() as usize,
                    offset: payload.get_u32(),
                    len: payload.get_u32(),
                })
            }
            MessageId::Port => {
                if payload.remaining() < 2 {
                    return Err(Error::ProtocolError("short port payload"));
                }
                Message::Port(payload.get_u16())
            }
        };
        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trips() {
        let mut codec = HandshakeCodec;
        let handshake = Handshake::new([1; 20], [2; 20]);
        let mut buf = BytesMut::new();
        codec.encode(handshake, &mut buf).unwrap();
        assert_eq!(buf.len(), 68);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
    }

    #[test]
    fn handshake_rejects_bad_protocol_string() {
        let mut buf = BytesMut::new();
        buf.put_u8(3);
        buf.put_slice(b"xyz");
        buf.put_slice(&[0u8; 8]);
        buf.put_slice(&[0u8; 40]);
        let mut codec = HandshakeCodec;
        assert!(matches!(codec.decode(&mut buf), Err(Error::BadProtocol)));
    }

    #[test]
    fn message_sequence_round_trips() {
        let mut codec = PeerCodec;
        let mut bitfield = Bitfield::repeat(false, 8);
        bitfield.set(0, true);
        bitfield.set(7, true);
        let messages = vec![
            Message::KeepAlive,
            Message::Have { piece_index: 3 },
            Message::Bitfield(bitfield),
            Message::Request(BlockInfo { piece_index: 1, offset: 0, len: 16384 }),
            Message::Block { piece_index: 1, offset: 0, data: vec![7; 16384] },
        ];

        let mut buf = BytesMut::new();
        for msg in messages.clone() {
            codec.encode(msg, &mut buf).unwrap();
        }

        let mut decoded = Vec::new();
        while let Some(msg) = codec.decode(&mut buf).unwrap() {
            decoded.push(msg);
        }
        assert_eq!(decoded, messages);
    }

    #[test]
    fn oversize_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_LEN + 1) as u32);
        let mut codec = PeerCodec;
        assert!(matches!(codec.decode(&mut buf), Err(Error::OversizeFrame)));
    }

    #[test]
    fn zero_length_frame_is_keepalive() {
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        let mut codec = PeerCodec;
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::KeepAlive));
    }
}

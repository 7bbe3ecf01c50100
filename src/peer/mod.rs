//! The peer session (component B): owns one peer's TCP connection and drives
//! its state machine (handshake, bitfield exchange, choke/interest
//! negotiation, block request pipelining) per §4.2.
//!
//! The session pulls work directly from the shared piece/block manager
//! (`piece_picker`) rather than being pushed requests by the coordinator,
//! per the design notes in §9; it reports only coarse lifecycle events
//! upward over `events`.

pub(crate) mod codec;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, Semaphore},
    time::{timeout, Instant},
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    disk::DiskHandle, error::*, piece_picker::{DeliveryOutcome, PiecePicker},
    Bitfield, PeerId, PieceIndex, Sha1Hash,
};

use codec::{Handshake, HandshakeCodec, Message, PeerCodec};

const DIAL_TIMEOUT: Duration = Duration::from_secs(1);
const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(5);
const AVAILABILITY_EXCHANGE_WINDOW: Duration = Duration::from_secs(1);
const REQUEST_BATCH_TIMEOUT: Duration = Duration::from_secs(3);
const KEEPALIVE_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const UNCHOKE_WATCH_STEP: Duration = Duration::from_secs(5);
const UNCHOKE_WATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Requests kept outstanding at once. The teacher crate derives this from a
/// bandwidth-delay estimate that grows over the session; this crate starts
/// and stays at a fixed optimistic value, leaving that refinement for later.
const REQUEST_BATCH_LEN: usize = 4;

type Sink = SplitSink<Framed<TcpStream, PeerCodec>, Message>;
type Stream = SplitStream<Framed<TcpStream, PeerCodec>>;

/// Events a session reports to the swarm coordinator. The session drives
/// its own choke/request state machine internally and only surfaces the
/// coarse lifecycle transitions the coordinator needs for bookkeeping.
#[derive(Debug, Clone)]
pub(crate) enum SessionEvent {
    Connected(SocketAddr),
    Disconnected(SocketAddr),
    /// A piece has received all its blocks and is ready for SHA-1
    /// verification by the coordinator.
    PieceDelivered(PieceIndex),
    HandshakeFailed(SocketAddr),
    /// The peer's choke state toward us changed. The coordinator only needs
    /// this for age-and-choke-based eviction under the connection cap; it
    /// never acts on choke state otherwise.
    ChokeStateChanged(SocketAddr, bool),
    /// A write to disk failed. Per the error taxonomy this is fatal: the
    /// coordinator must abort the whole torrent rather than just drop this
    /// peer, since every other session writes into the same files.
    FatalStorageError(SocketAddr, String),
}

/// Commands the coordinator can send down to a running session.
pub(crate) enum Command {
    Shutdown,
}

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;
type CommandReceiver = mpsc::UnboundedReceiver<Command>;

/// Owns one outbound peer connection.
pub(crate) struct PeerSession {
    addr: SocketAddr,
    info_hash: Sha1Hash,
    client_id: PeerId,
    piece_count: usize,
    piece_picker: Arc<PiecePicker>,
    disk: DiskHandle,
    events: mpsc::UnboundedSender<SessionEvent>,
    reported_connected: bool,
    /// Limits how many sessions may be mid-request-batch at once, shared
    /// across every peer of this torrent.
    request_slots: Arc<Semaphore>,
    /// How often an idle connection is sent a keep-alive, taken from
    /// `TorrentConf::keepalive_tick`.
    keepalive_interval: Duration,
}

impl PeerSession {
    /// Creates a new outbound session. The caller owns the command channel
    /// and passes its receiving half to [`PeerSession::run`].
    pub fn outbound(
        addr: SocketAddr,
        info_hash: Sha1Hash,
        client_id: PeerId,
        piece_count: usize,
        piece_picker: Arc<PiecePicker>,
        disk: DiskHandle,
        events: mpsc::UnboundedSender<SessionEvent>,
        request_slots: Arc<Semaphore>,
        keepalive_interval: Duration,
    ) -> Self {
        Self {
            addr,
            info_hash,
            client_id,
            piece_count,
            piece_picker,
            disk,
            events,
            reported_connected: false,
            request_slots,
            keepalive_interval,
        }
    }

    /// Runs the session until disconnection, reporting lifecycle events to
    /// the coordinator as it goes. Never returns an error: every failure is
    /// absorbed here and reported as a `Disconnected`/`HandshakeFailed`
    /// event, per the error handling design (§7) -- transient peer errors
    /// never propagate above the coordinator.
    pub async fn run(mut self, cmd_rx: CommandReceiver) {
        let addr = self.addr;
        match self.run_inner(cmd_rx).await {
            Ok(()) => {
                log::info!("Peer {} session ended", addr);
            }
            Err(Error::PeerUnreachable) | Err(Error::Timeout) if !self.reported_connected => {
                log::info!("Peer {} handshake failed", addr);
                let _ = self.events.send(SessionEvent::HandshakeFailed(addr));
                return;
            }
            Err(e) => {
                log::info!("Peer {} session failed: {}", addr, e);
            }
        }
        let _ = self.events.send(SessionEvent::Disconnected(addr));
    }

    async fn run_inner(&mut self, mut cmd_rx: CommandReceiver) -> Result<()> {
        let (mut sink, mut stream) = self.establish().await?;
        self.reported_connected = true;
        let _ = self.events.send(SessionEvent::Connected(self.addr));

        let mut peer_choking = true;
        let mut peer_bitfield = Bitfield::repeat(false, self.piece_count);
        self.absorb_initial_messages(&mut stream, &mut peer_bitfield, &mut peer_choking)
            .await?;
        // `ConnectedPeer` starts out assuming `peer_choking == true`; only
        // report here if the availability exchange already moved us off it.
        let mut last_reported_choking = true;
        self.report_choke_state(peer_choking, &mut last_reported_choking);

        let mut last_keepalive = Instant::now();

        loop {
            if let Ok(Command::Shutdown) = cmd_rx.try_recv() {
                log::info!("Peer {} session shutting down on command", self.addr);
                return Ok(());
            }

            if peer_choking {
                self.unchoke_watch(&mut sink, &mut stream, &mut peer_choking, &mut peer_bitfield)
                    .await?;
                self.report_choke_state(peer_choking, &mut last_reported_choking);
            }

            let made_progress = self
                .request_batch(&mut sink, &mut stream, &mut peer_bitfield, &mut peer_choking)
                .await?;
            self.report_choke_state(peer_choking, &mut last_reported_choking);

            if last_keepalive.elapsed() >= self.keepalive_interval {
                timeout(KEEPALIVE_WRITE_TIMEOUT, sink.send(Message::KeepAlive))
                    .await
                    .map_err(|_| Error::Timeout)??;
                last_keepalive = Instant::now();
            }

            if !made_progress {
                // nothing to request right now (no open blocks claimed by
                // this peer); wait for the peer to say something rather
                // than busy-loop
                match timeout(Duration::from_secs(1), stream.next()).await {
                    Ok(Some(msg)) => {
                        self.handle_message(msg?, &mut sink, &mut peer_choking, &mut peer_bitfield)
                            .await?;
                        self.report_choke_state(peer_choking, &mut last_reported_choking);
                    }
                    Ok(None) => return Err(Error::PeerUnreachable),
                    Err(_) => {} // idle tick, loop back around
                }
            }
        }
    }

    /// Tells the coordinator about a choke-state transition, used only for
    /// eviction under the connection cap (§9.1). No-op if unchanged.
    fn report_choke_state(&self, peer_choking: bool, last_reported: &mut bool) {
        if peer_choking != *last_reported {
            let _ = self
                .events
                .send(SessionEvent::ChokeStateChanged(self.addr, peer_choking));
            *last_reported = peer_choking;
        }
    }

    /// Dials the peer, exchanges handshakes, and swaps to the peer message
    /// codec, matching the teacher's codec-swap-via-`FramedParts` pattern so
    /// no bytes the peer pipelined right after its handshake are lost.
    async fn establish(&self) -> Result<(Sink, Stream)> {
        log::info!("Connecting to peer {}", self.addr);
        let socket = timeout(DIAL_TIMEOUT, TcpStream::connect(self.addr))
            .await
            .map_err(|_| Error::PeerUnreachable)??;
        log::info!("Connected to peer {}", self.addr);

        let mut framed = Framed::new(socket, HandshakeCodec);
        let handshake = Handshake::new(self.info_hash, self.client_id);
        framed.send(handshake).await?;

        let peer_handshake = timeout(HANDSHAKE_READ_TIMEOUT, framed.next())
            .await
            .map_err(|_| Error::Timeout)?
            .ok_or(Error::ShortRead)??;

        if peer_handshake.info_hash != self.info_hash {
            log::info!("Peer {} advertised a mismatched info hash", self.addr);
            return Err(Error::InfoHashMismatch);
        }

        let old_parts = framed.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let framed = Framed::from_parts(new_parts);

        let (mut sink, stream) = framed.split();
        sink.send(Message::Bitfield(self.piece_picker.bitfield()))
            .await?;
        sink.send(Message::Unchoke).await?;
        sink.send(Message::Interested).await?;

        Ok((sink, stream))
    }

    /// Drains whatever the peer sends in the window right after the
    /// handshake (typically its bitfield and/or a run of `have`s), bounded
    /// by a 1 s deadline per §4.2.
    async fn absorb_initial_messages(
        &mut self,
        stream: &mut Stream,
        peer_bitfield: &mut Bitfield,
        peer_choking: &mut bool,
    ) -> Result<()> {
        let outcome = timeout(AVAILABILITY_EXCHANGE_WINDOW, async {
            loop {
                match stream.next().await {
                    Some(Ok(msg)) => {
                        if !self.apply_availability_message(msg, peer_bitfield, peer_choking) {
                            return Err(Error::InvalidBlock);
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Ok(()),
                }
            }
        })
        .await;

        match outcome {
            Ok(Ok(())) | Err(_) => Ok(()),
            Ok(Err(e)) => Err(e),
        }
    }

    /// Applies a message seen during the availability-exchange window.
    /// Returns `false` for a `Piece` delivery, which would mean the peer
    /// started sending block data before we ever requested anything --
    /// treated as a protocol violation by the caller.
    fn apply_availability_message(
        &self,
        msg: Message,
        peer_bitfield: &mut Bitfield,
        peer_choking: &mut bool,
    ) -> bool {
        match msg {
            Message::Bitfield(mut bits) => {
                bits.resize(self.piece_count, false);
                *peer_bitfield = bits;
            }
            Message::Have { piece_index } => {
                if (piece_index as usize) < peer_bitfield.len() {
                    peer_bitfield.set(piece_index as usize, true);
                }
            }
            Message::Choke => *peer_choking = true,
            Message::Unchoke => *peer_choking = false,
            Message::Block { .. } => return false,
            _ => {}
        }
        true
    }

    /// Sends a batch of requests for up to `REQUEST_BATCH_LEN` open blocks
    /// the peer has, then waits for exactly that many piece replies under a
    /// single shared 3 s deadline. Returns the number of blocks requested
    /// (zero if the peer currently has nothing open for us).
    async fn request_batch(
        &mut self,
        sink: &mut Sink,
        stream: &mut Stream,
        peer_bitfield: &mut Bitfield,
        peer_choking: &mut bool,
    ) -> Result<usize> {
        let mut pending = self
            .piece_picker
            .next_blocks(peer_bitfield, REQUEST_BATCH_LEN);
        if pending.is_empty() {
            return Ok(0);
        }
        let batch_len = pending.len();

        // Caps how many peers may be mid-request-batch at once (§9.2); held
        // for the whole round trip below, released on return.
        let _permit = self.request_slots.acquire().await;

        for (_, info) in &pending {
            sink.send(Message::Request(*info)).await?;
        }

        let read = timeout(REQUEST_BATCH_TIMEOUT, async {
            while !pending.is_empty() {
                match stream.next().await {
                    Some(Ok(Message::Block { piece_index, offset, data })) => {
                        let pos = pending.iter().position(|(_, info)| {
                            info.piece_index == piece_index as usize
                                && info.offset == offset
                        });
                        let len = data.len() as u32;
                        match self.piece_picker.mark_delivered(
                            piece_index as usize,
                            offset,
                            len,
                        ) {
                            DeliveryOutcome::Rejected => {
                                log::warn!(
                                    "Peer {} delivered an unexpected block ({}, {})",
                                    self.addr,
                                    piece_index,
                                    offset
                                );
                            }
                            DeliveryOutcome::Accepted => {
                                if let Err(e) = self
                                    .disk
                                    .write_piece(piece_index as usize, offset, data)
                                    .await
                                {
                                    let _ = self.events.send(SessionEvent::FatalStorageError(
                                        self.addr,
                                        e.to_string(),
                                    ));
                                    return Err(e);
                                }
                            }
                            DeliveryOutcome::PieceComplete(piece) => {
                                if let Err(e) = self
                                    .disk
                                    .write_piece(piece_index as usize, offset, data)
                                    .await
                                {
                                    let _ = self.events.send(SessionEvent::FatalStorageError(
                                        self.addr,
                                        e.to_string(),
                                    ));
                                    return Err(e);
                                }
                                let _ = self
                                    .events
                                    .send(SessionEvent::PieceDelivered(piece));
                            }
                        }
                        if let Some(pos) = pos {
                            pending.remove(pos);
                        }
                    }
                    Some(Ok(msg)) => {
                        let was_choking_before = *peer_choking;
                        self.handle_message(msg, sink, peer_choking, peer_bitfield)
                            .await?;
                        if !was_choking_before && *peer_choking {
                            // per §4.2, a choke aborts further reads in
                            // this batch
                            return Ok(());
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Err(Error::PeerUnreachable),
                }
            }
            Ok(())
        })
        .await;

        match read {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                for (id, _) in pending.drain(..) {
                    self.piece_picker.release(id);
                }
                return Err(e);
            }
            Err(_) => {} // 3 s deadline elapsed; whatever arrived, arrived
        }

        for (id, _) in pending.drain(..) {
            self.piece_picker.release(id);
        }

        Ok(batch_len)
    }

    /// Handles any message that isn't itself a block delivery: updates
    /// availability (`have`/`bitfield`), choke/interest state, and silently
    /// accepts everything else we don't act on since we never seed. An
    /// unsolicited `Block` is logged and dropped rather than panicking --
    /// a chatty or buggy peer is not a protocol violation worth tearing the
    /// connection down over.
    async fn handle_message(
        &mut self,
        msg: Message,
        _sink: &mut Sink,
        peer_choking: &mut bool,
        peer_bitfield: &mut Bitfield,
    ) -> Result<()> {
        match msg {
            Message::KeepAlive => {}
            Message::Choke => *peer_choking = true,
            Message::Unchoke => *peer_choking = false,
            Message::Interested | Message::NotInterested => {}
            Message::Have { piece_index } => {
                if (piece_index as usize) < peer_bitfield.len() {
                    peer_bitfield.set(piece_index as usize, true);
                }
            }
            Message::Bitfield(mut bits) => {
                bits.resize(self.piece_count, false);
                *peer_bitfield = bits;
            }
            Message::Request(_) | Message::Cancel(_) | Message::Port(_) => {
                // we never seed, so requests/cancels/ports from a peer are
                // silently accepted and otherwise ignored
            }
            Message::Block { piece_index, offset, .. } => {
                log::debug!(
                    "Peer {} sent block ({}, {}) outside a request window",
                    self.addr,
                    piece_index,
                    offset
                );
            }
        }
        Ok(())
    }

    /// Sends `interested` and waits (up to 30 s, in 5 s read increments) for
    /// the peer to unchoke us. Returns `Error::Timeout` if it never does,
    /// which the caller treats as fatal -- the peer is demoted.
    async fn unchoke_watch(
        &mut self,
        sink: &mut Sink,
        stream: &mut Stream,
        peer_choking: &mut bool,
        peer_bitfield: &mut Bitfield,
    ) -> Result<()> {
        log::debug!("Peer {} has us choked, starting unchoke watch", self.addr);
        sink.send(Message::Interested).await?;
        let start = Instant::now();
        while *peer_choking {
            if start.elapsed() >= UNCHOKE_WATCH_TIMEOUT {
                log::info!("Peer {} never unchoked us, giving up", self.addr);
                return Err(Error::Timeout);
            }
            match timeout(UNCHOKE_WATCH_STEP, stream.next()).await {
                Ok(Some(Ok(msg))) => {
                    self.handle_message(msg, sink, peer_choking, peer_bitfield).await?;
                }
                Ok(Some(Err(e))) => return Err(e),
                Ok(None) => return Err(Error::PeerUnreachable),
                Err(_) => {} // 5 s step elapsed, keep waiting within the 30 s budget
            }
        }
        Ok(())
    }
}

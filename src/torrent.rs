//! The swarm coordinator (component F): owns a single torrent's peer pool,
//! piece/block manager, and disk writer, and drives the periodic timers
//! described in §4.6.
//!
//! Per the design notes (§9), individual peer sessions pull work from the
//! shared piece/block manager and drive their own choke/request state
//! machines; the coordinator's job is connection lifecycle (dialing,
//! capping, evicting), tracker announces, SHA-1 verification dispatch, and
//! progress reporting.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};

use lru::LruCache;
use tokio::{sync::mpsc, sync::Semaphore, time::interval};

use crate::{
    conf::TorrentConf,
    counter::{fmt_elapsed, fmt_rate_kib, ThroughputCounter},
    disk::DiskHandle,
    error::Result,
    metainfo::Metainfo,
    peer::{Command, CommandSender, PeerSession, SessionEvent},
    piece_picker::PiecePicker,
    resume::ResumeStore,
    storage_info::StorageInfo,
    tracker::{self, AnnounceParams, TrackerEvent},
    PeerId, PieceIndex, Sha1Hash, TorrentId,
};

/// Parameters for adding a new torrent to the engine.
pub struct TorrentParams {
    pub metainfo: Metainfo,
    /// Overrides the engine's default torrent configuration, if given.
    pub conf: Option<TorrentConf>,
    /// An optional resume store consulted at startup and written back to as
    /// pieces verify.
    pub resume_store: Option<Arc<dyn ResumeStore>>,
}

/// Commands the engine can send down to a running torrent.
pub(crate) enum TorrentCommand {
    Shutdown,
}

struct ConnectedPeer {
    cmd_tx: CommandSender,
    connected_at: Instant,
    /// Last choke state the session reported. Starts `true`: per BEP 3 both
    /// sides begin choked, and this is also the conservative default while a
    /// fresh connection hasn't reported otherwise yet.
    peer_choking: bool,
}

/// A single torrent's swarm coordinator.
pub(crate) struct Torrent {
    id: TorrentId,
    info_hash: Sha1Hash,
    client_id: PeerId,
    listen_port: u16,
    trackers: Vec<String>,
    conf: TorrentConf,

    piece_count: usize,
    download_len: u64,
    torrent_key: String,

    piece_picker: Arc<PiecePicker>,
    disk: DiskHandle,
    resume_store: Option<Arc<dyn ResumeStore>>,

    /// Addresses learned from trackers but not necessarily dialed yet,
    /// ordered by recency of discovery.
    alive: LruCache<SocketAddr, ()>,
    connected: HashMap<SocketAddr, ConnectedPeer>,
    /// Dials in flight: spawned but not yet reported `Connected`. Kept so
    /// `top_up_connections` doesn't redial an address it's already chasing.
    pending: HashMap<SocketAddr, CommandSender>,
    /// Bounds how many sessions may be in their request-batch round trip at
    /// once, shared with every spawned [`PeerSession`].
    request_slots: Arc<Semaphore>,

    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,

    downloaded_counter: ThroughputCounter,
    last_downloaded: u64,
    uploaded: u64,
    tracker_failures: usize,
    started_at: Instant,
    /// Set once the completion announce has fired, so a piece re-verified
    /// after the torrent is already complete (e.g. a stray resume-hint
    /// check) doesn't re-announce `event=completed` every time.
    completed_announced: bool,
}

impl Torrent {
    /// Builds a new coordinator. Resume hints are consulted here, before the
    /// piece/block manager is constructed, so requests never go out for
    /// blocks already on disk.
    pub(crate) fn new(
        id: TorrentId,
        client_id: PeerId,
        listen_port: u16,
        default_conf: TorrentConf,
        params: TorrentParams,
    ) -> Result<Self> {
        let TorrentParams {
            metainfo,
            conf,
            resume_store,
        } = params;
        let conf = conf.unwrap_or(default_conf);
        let info_hash = metainfo.info_hash;
        let trackers = metainfo.trackers();

        let storage = StorageInfo::new(&metainfo, conf.download_dir.clone());
        let download_len = storage.download_len;
        let piece_count = storage.piece_count;
        let piece_lens: Vec<u32> = (0..piece_count)
            .map(|i| {
                storage
                    .piece_len(i)
                    .expect("index within piece_count is always valid")
            })
            .collect();

        let torrent_key = hex::encode(info_hash);
        let resume_hint: HashSet<usize> = resume_store
            .as_ref()
            .map(|store| store.load(&torrent_key))
            .unwrap_or_default();
        let piece_picker = Arc::new(PiecePicker::new(&piece_lens, &resume_hint));

        let disk = DiskHandle::new(storage, metainfo.info.pieces.clone())?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let request_slots = Arc::new(Semaphore::new(conf.max_active_requests));

        Ok(Self {
            id,
            info_hash,
            client_id,
            listen_port,
            trackers,
            conf,
            piece_count,
            download_len,
            torrent_key,
            piece_picker,
            disk,
            resume_store,
            alive: LruCache::unbounded(),
            connected: HashMap::new(),
            pending: HashMap::new(),
            request_slots,
            events_tx,
            events_rx,
            downloaded_counter: ThroughputCounter::new(),
            last_downloaded: 0,
            uploaded: 0,
            tracker_failures: 0,
            started_at: Instant::now(),
            completed_announced: false,
        })
    }

    /// Drives the torrent until a [`TorrentCommand::Shutdown`] is received.
    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<TorrentCommand>) {
        log::info!(
            "Torrent {} starting: {} pieces, {} bytes",
            self.id,
            self.piece_count,
            self.download_len
        );

        for piece in self.piece_picker.complete_unverified_pieces() {
            self.verify_piece(piece).await;
        }
        if self.piece_picker.is_complete() {
            log::info!("Torrent {} already complete from resume data", self.id);
        }

        self.announce(TrackerEvent::Started).await;

        let mut progress_timer = interval(self.conf.progress_tick);
        let mut reconnect_timer = interval(self.conf.reconnect_tick);
        let mut announce_timer = interval(self.conf.announce_interval);

        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(TorrentCommand::Shutdown) | None => break,
                    }
                }
                event = self.events_rx.recv() => {
                    match event {
                        Some(event) => {
                            if !self.handle_session_event(event).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = progress_timer.tick() => {
                    self.log_progress();
                }
                _ = reconnect_timer.tick() => {
                    self.top_up_connections();
                }
                _ = announce_timer.tick() => {
                    self.announce(TrackerEvent::None).await;
                }
            }
        }

        log::info!("Torrent {} shutting down", self.id);
        self.announce(TrackerEvent::Stopped).await;
        for (_, peer) in self.connected.drain() {
            let _ = peer.cmd_tx.send(Command::Shutdown);
        }
        for (_, cmd_tx) in self.pending.drain() {
            let _ = cmd_tx.send(Command::Shutdown);
        }
    }

    /// Applies one session event. Returns `false` if the torrent must stop
    /// running altogether (a fatal storage error), `true` otherwise.
    async fn handle_session_event(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Connected(addr) => {
                log::info!("Torrent {}: peer {} connected", self.id, addr);
                if let Some(cmd_tx) = self.pending.remove(&addr) {
                    self.admit_connection(addr, cmd_tx);
                }
            }
            SessionEvent::Disconnected(addr) => {
                self.pending.remove(&addr);
                self.connected.remove(&addr);
                log::info!("Torrent {}: peer {} disconnected", self.id, addr);
            }
            SessionEvent::HandshakeFailed(addr) => {
                self.pending.remove(&addr);
                self.connected.remove(&addr);
                log::debug!("Torrent {}: peer {} handshake failed", self.id, addr);
            }
            SessionEvent::ChokeStateChanged(addr, peer_choking) => {
                if let Some(peer) = self.connected.get_mut(&addr) {
                    peer.peer_choking = peer_choking;
                }
            }
            SessionEvent::PieceDelivered(piece) => {
                self.verify_piece(piece).await;
            }
            SessionEvent::FatalStorageError(addr, msg) => {
                log::error!(
                    "Torrent {}: fatal storage error from peer {}: {} -- aborting download",
                    self.id,
                    addr,
                    msg
                );
                return false;
            }
        }
        true
    }

    /// Reads the piece back off disk, verifies its SHA-1, and updates the
    /// piece/block manager (and resume store) accordingly.
    async fn verify_piece(&mut self, piece: PieceIndex) {
        match self.disk.verify(piece).await {
            Ok(true) => {
                self.piece_picker.mark_verified(piece);
                if let Some(store) = &self.resume_store {
                    for block in self.piece_picker.block_ids_for_piece(piece) {
                        store.save(&self.torrent_key, block);
                    }
                }
                log::debug!("Torrent {}: piece {} verified", self.id, piece);
                if self.piece_picker.is_complete() && !self.completed_announced {
                    log::info!("Torrent {} download complete", self.id);
                    self.completed_announced = true;
                    self.announce(TrackerEvent::Completed).await;
                }
            }
            Ok(false) => {
                log::warn!(
                    "Torrent {}: piece {} failed verification, re-downloading",
                    self.id,
                    piece
                );
                self.piece_picker.unmark_piece(piece);
            }
            Err(e) => {
                log::error!(
                    "Torrent {}: error verifying piece {}: {}",
                    self.id,
                    piece,
                    e
                );
                self.piece_picker.unmark_piece(piece);
            }
        }
    }

    /// Dials new peers from the alive set. Below `min_active_connections`
    /// every known alive address is redialed; once at or above it but still
    /// under `max_active_connections`, at most `max_new_connections_per_tick`
    /// new dials are started this tick.
    fn top_up_connections(&mut self) {
        let connected_len = self.connected.len();
        let candidates: Vec<SocketAddr> = if connected_len < self.conf.min_active_connections {
            self.alive.iter().map(|(addr, _)| *addr).collect()
        } else if connected_len < self.conf.max_active_connections {
            self.alive
                .iter()
                .map(|(addr, _)| *addr)
                .take(self.conf.max_new_connections_per_tick)
                .collect()
        } else {
            Vec::new()
        };

        for addr in candidates {
            if self.connected.contains_key(&addr) || self.pending.contains_key(&addr) {
                continue;
            }
            self.spawn_session(addr);
        }
    }

    /// Dials `addr` in the background. The dial is tracked as `pending`
    /// until the session reports back `Connected`, `Disconnected`, or
    /// `HandshakeFailed` -- admission into `connected` (and any eviction it
    /// requires) happens only once the connection has actually succeeded.
    fn spawn_session(&mut self, addr: SocketAddr) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let session = PeerSession::outbound(
            addr,
            self.info_hash,
            self.client_id,
            self.piece_count,
            Arc::clone(&self.piece_picker),
            self.disk.clone(),
            self.events_tx.clone(),
            Arc::clone(&self.request_slots),
            self.conf.keepalive_tick,
        );
        tokio::spawn(session.run(cmd_rx));
        self.pending.insert(addr, cmd_tx);
    }

    /// Admits a freshly connected peer into `connected`, evicting to make
    /// room if already at `max_active_connections`. If no connected peer is
    /// currently choking us, there is no eviction candidate and the
    /// newcomer is turned away instead.
    fn admit_connection(&mut self, addr: SocketAddr, cmd_tx: CommandSender) {
        if self.connected.len() >= self.conf.max_active_connections
            && !self.evict_oldest_choked()
        {
            log::debug!(
                "Torrent {}: at capacity with no choking peer to evict, turning away {}",
                self.id,
                addr
            );
            let _ = cmd_tx.send(Command::Shutdown);
            return;
        }
        self.connected.insert(
            addr,
            ConnectedPeer {
                cmd_tx,
                connected_at: Instant::now(),
                peer_choking: true,
            },
        );
    }

    /// Evicts the oldest connected peer that is currently choking us, in
    /// favor of a just-admitted newcomer. A freshly connected peer's
    /// `connected_at` is always later than any existing connection's, so
    /// the newcomer is always younger than whatever this evicts. Returns
    /// `false` (evicting nothing) if no connected peer is presently
    /// choking us.
    fn evict_oldest_choked(&mut self) -> bool {
        let oldest = self
            .connected
            .iter()
            .filter(|(_, peer)| peer.peer_choking)
            .min_by_key(|(_, peer)| peer.connected_at)
            .map(|(addr, _)| *addr);
        match oldest {
            Some(addr) => {
                if let Some(peer) = self.connected.remove(&addr) {
                    let _ = peer.cmd_tx.send(Command::Shutdown);
                }
                true
            }
            None => false,
        }
    }

    /// Tries each known tracker in order, stopping at the first that
    /// answers; its peers are merged into the alive set.
    async fn announce(&mut self, event: TrackerEvent) {
        if self.tracker_failures >= self.conf.tracker_error_threshold {
            return;
        }

        let downloaded = self.piece_picker.bytes_downloaded();
        let left = self.download_len.saturating_sub(downloaded);

        for url in self.trackers.clone() {
            let params = AnnounceParams {
                url: &url,
                info_hash: self.info_hash,
                peer_id: self.client_id,
                port: self.listen_port,
                uploaded: self.uploaded,
                downloaded,
                left,
                event,
                numwant: self.conf.numwant,
            };
            match tracker::announce(&params).await {
                Ok(resp) => {
                    self.tracker_failures = 0;
                    let peer_count = resp.peers.len();
                    for peer in resp.peers {
                        self.alive.put(peer.addr, ());
                    }
                    log::info!(
                        "Torrent {}: tracker {} returned {} peers",
                        self.id,
                        url,
                        peer_count
                    );
                    return;
                }
                Err(e) => {
                    self.tracker_failures += 1;
                    log::warn!("Torrent {}: tracker {} failed: {}", self.id, url, e);
                }
            }
        }
    }

    fn log_progress(&mut self) {
        let downloaded = self.piece_picker.bytes_downloaded();
        let delta = downloaded.saturating_sub(self.last_downloaded);
        self.last_downloaded = downloaded;
        self.downloaded_counter.add(delta);
        let rate = self.downloaded_counter.tick();
        log::info!(
            "Torrent {}: {}/{} bytes ({}), {} peers connected, elapsed {}",
            self.id,
            downloaded,
            self.download_len,
            fmt_rate_kib(rate),
            self.connected.len(),
            fmt_elapsed(self.started_at.elapsed()),
        );
    }
}

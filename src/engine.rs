//! The engine (component A): the library's entry point. Owns the process
//! wide configuration and the set of running torrents, and is the thing an
//! application embeds to add and remove torrents.

use std::collections::HashMap;

use rand::Rng;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    conf::Conf,
    error::Result,
    torrent::{Torrent, TorrentCommand, TorrentParams},
    PeerId, TorrentId,
};

/// The first port the engine tries to advertise to trackers. This crate
/// never actually listens for inbound connections (see the engine's
/// non-goals), so the port is nominal and only used to fill out announce
/// requests.
const FIRST_LISTEN_PORT: u16 = 6881;

struct RunningTorrent {
    commands: mpsc::UnboundedSender<TorrentCommand>,
    handle: JoinHandle<()>,
}

/// The engine: holds configuration and every torrent currently running
/// under it.
pub struct Engine {
    conf: Conf,
    client_id: PeerId,
    next_id: TorrentId,
    next_port: u16,
    torrents: HashMap<TorrentId, RunningTorrent>,
}

impl Engine {
    /// Creates a new engine with the given configuration. A peer id is
    /// generated from the client id prefix in `conf.engine.client_id`
    /// (conventionally left at its default and overwritten here with a
    /// freshly randomized one, per BEP 20).
    pub fn new(conf: Conf) -> Self {
        let client_id = generate_peer_id();
        Self {
            conf,
            client_id,
            next_id: 0,
            next_port: FIRST_LISTEN_PORT,
            torrents: HashMap::new(),
        }
    }

    /// Adds a torrent to the engine and starts running it in the
    /// background, returning an id the caller can use to address it later.
    pub fn create_torrent(&mut self, params: TorrentParams) -> Result<TorrentId> {
        let id = self.next_id;
        self.next_id += 1;
        let listen_port = self.next_port;
        self.next_port = self.next_port.wrapping_add(1);

        let torrent = Torrent::new(
            id,
            self.client_id,
            listen_port,
            self.conf.torrent.clone(),
            params,
        )?;

        let (commands, cmd_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(torrent.run(cmd_rx));
        self.torrents.insert(id, RunningTorrent { commands, handle });

        log::info!("Engine created torrent {}", id);
        Ok(id)
    }

    /// Requests the torrent to shut down. Returns `false` if no torrent
    /// with this id is running.
    pub fn shutdown_torrent(&mut self, id: TorrentId) -> bool {
        match self.torrents.remove(&id) {
            Some(torrent) => {
                let _ = torrent.commands.send(TorrentCommand::Shutdown);
                true
            }
            None => false,
        }
    }

    /// Requests every running torrent to shut down and waits for them to
    /// finish.
    pub async fn shutdown(mut self) {
        let handles: Vec<_> = self
            .torrents
            .drain()
            .map(|(_, torrent)| {
                let _ = torrent.commands.send(TorrentCommand::Shutdown);
                torrent.handle
            })
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Generates a fresh peer id per BEP 20: a two letter client identifier
/// (`YM`, for this crate), a four digit version, and enough random
/// alphanumerics to fill out the remaining bytes of the 20 byte id.
pub fn generate_peer_id() -> PeerId {
    const PREFIX: &[u8] = b"-YM0100-";
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

    let mut id = [0u8; 20];
    id[..PREFIX.len()].copy_from_slice(PREFIX);

    let mut rng = rand::thread_rng();
    for byte in &mut id[PREFIX.len()..] {
        *byte = ALPHABET[rng.gen_range(0..ALPHABET.len())];
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_peer_id_has_expected_prefix_and_length() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], b"-YM0100-");
        assert_eq!(id.len(), 20);
    }
}

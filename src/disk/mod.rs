//! The file writer (component D): owns a torrent's file handles and
//! performs the positional writes and SHA-1 verification described in
//! §4.4, dispatched to a blocking thread pool since `nix`'s positional I/O
//! is synchronous and must not block the reactor.

mod io;

use std::sync::Arc;

use tokio::task;

use crate::{
    error::Result, storage_info::StorageInfo, PieceIndex,
};

use io::FileWriter;

/// A cheaply-clonable handle to a torrent's on-disk files.
///
/// Every operation hops to [`tokio::task::spawn_blocking`] before touching
/// the file system, so callers never block the async runtime.
#[derive(Clone)]
pub(crate) struct DiskHandle {
    writer: Arc<FileWriter>,
}

impl DiskHandle {
    /// Pre-creates the torrent's on-disk layout (§6): directories for an
    /// archive download, files truncated to their declared lengths.
    pub fn new(storage: StorageInfo, piece_hashes: Vec<u8>) -> Result<Self> {
        let writer = FileWriter::new(storage, piece_hashes)?;
        Ok(Self { writer: Arc::new(writer) })
    }

    /// Writes `bytes` at `offset` within `piece`, slicing across file
    /// boundaries as needed. A failure here is fatal to the download.
    pub async fn write_piece(
        &self,
        piece: PieceIndex,
        offset: u32,
        bytes: Vec<u8>,
    ) -> Result<()> {
        let writer = Arc::clone(&self.writer);
        task::spawn_blocking(move || writer.write_piece(piece, offset, &bytes))
            .await
            .expect("disk write task panicked")
    }

    /// Reads a piece back and compares its SHA-1 against the expected hash
    /// from metainfo. Never fails on a hash mismatch -- only on I/O error.
    pub async fn verify(&self, piece: PieceIndex) -> Result<bool> {
        let writer = Arc::clone(&self.writer);
        task::spawn_blocking(move || writer.verify(piece))
            .await
            .expect("disk verify task panicked")
    }
}

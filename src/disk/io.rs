//! Positional file I/O for a single torrent's files: writing delivered
//! blocks and verifying a completed piece's SHA-1 against the expected hash
//! from metainfo.
//!
//! Writes are serialized by a single mutex per file so that a `verify` call
//! always sees a consistent image of what's been written so far (§4.4).

use std::{
    fs::{self, File, OpenOptions},
    os::unix::io::AsRawFd,
    sync::Mutex,
};

use nix::sys::uio::{pread, pwrite};
use sha1::{Digest, Sha1};

use crate::{
    error::{Error, Result},
    storage_info::StorageInfo,
    FileInfo, PieceIndex, Sha1Hash,
};

/// Scratch buffer size used when reading a piece back for verification.
const VERIFY_BUF_LEN: usize = 32 * 1024;

struct TorrentFile {
    info: FileInfo,
    handle: Mutex<File>,
}

/// Owns the open file handles for one torrent and performs the positional
/// reads and writes that back [`crate::disk::DiskHandle`].
pub(super) struct FileWriter {
    storage: StorageInfo,
    files: Vec<TorrentFile>,
    /// The concatenation of all expected piece hashes, 20 bytes each.
    piece_hashes: Vec<u8>,
}

impl FileWriter {
    /// Pre-creates parent directories and truncates every file described by
    /// `storage` to its declared length.
    pub fn new(storage: StorageInfo, piece_hashes: Vec<u8>) -> Result<Self> {
        let file_count = storage.structure.file_count();
        let mut files = Vec::with_capacity(file_count);
        for index in 0..file_count {
            let info = storage.structure.file(index).clone();
            if let Some(parent) = info.path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            let handle = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&info.path)?;
            handle.set_len(info.len)?;
            files.push(TorrentFile { info, handle: Mutex::new(handle) });
        }
        Ok(Self { storage, files, piece_hashes })
    }

    /// Maps `(piece * piece_len + offset, bytes.len())` into the
    /// concatenated file space and issues one positional write per file the
    /// slice overlaps.
    pub fn write_piece(
        &self,
        piece: PieceIndex,
        offset: u32,
        bytes: &[u8],
    ) -> Result<()> {
        let piece_len = self.storage.piece_len(piece)?;
        debug_assert!(offset + bytes.len() as u32 <= piece_len);
        let torrent_offset =
            piece as u64 * self.storage.piece_len as u64 + offset as u64;

        let mut remaining = bytes;
        let mut cursor = torrent_offset;
        let files = self.storage.structure.files_intersecting_bytes(
            torrent_offset..torrent_offset + bytes.len() as u64,
        );
        for file_index in files {
            if remaining.is_empty() {
                break;
            }
            let file = &self.files[file_index];
            let slice = file.info.get_slice(cursor, remaining.len() as u64);
            let chunk_len = slice.len as usize;
            let (chunk, rest) = remaining.split_at(chunk_len);
            let handle = file.handle.lock().unwrap();
            write_all_at(&handle, chunk, slice.offset)?;
            remaining = rest;
            cursor += chunk_len as u64;
        }
        debug_assert!(remaining.is_empty());
        Ok(())
    }

    /// Reads a piece's bytes back across however many files it spans,
    /// hashing through a fixed-size scratch buffer, and compares the result
    /// against the expected hash from metainfo.
    pub fn verify(&self, piece: PieceIndex) -> Result<bool> {
        let piece_len = self.storage.piece_len(piece)? as u64;
        let torrent_offset = piece as u64 * self.storage.piece_len as u64;
        let expected = self.expected_hash(piece)?;

        let mut hasher = Sha1::new();
        let mut buf = vec![0u8; VERIFY_BUF_LEN];
        let mut cursor = torrent_offset;
        let end = torrent_offset + piece_len;
        while cursor < end {
            let want = std::cmp::min(VERIFY_BUF_LEN as u64, end - cursor) as usize;
            let files = self
                .storage
                .structure
                .files_intersecting_bytes(cursor..cursor + want as u64);
            let mut filled = 0;
            for file_index in files {
                if filled >= want {
                    break;
                }
                let file = &self.files[file_index];
                let slice =
                    file.info.get_slice(cursor + filled as u64, (want - filled) as u64);
                let chunk_len = slice.len as usize;
                let handle = file.handle.lock().unwrap();
                read_exact_at(
                    &handle,
                    &mut buf[filled..filled + chunk_len],
                    slice.offset,
                )?;
                filled += chunk_len;
            }
            hasher.input(&buf[..filled]);
            cursor += filled as u64;
        }

        let digest = hasher.result();
        Ok(digest.as_slice() == expected)
    }

    fn expected_hash(&self, piece: PieceIndex) -> Result<Sha1Hash> {
        let start = piece * 20;
        let end = start + 20;
        if end > self.piece_hashes.len() {
            return Err(Error::InvalidPieceIndex);
        }
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&self.piece_hashes[start..end]);
        Ok(hash)
    }
}

fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> Result<()> {
    while !buf.is_empty() {
        let n = pwrite(file.as_raw_fd(), buf, offset as i64)
            .map_err(to_io_error)?;
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}

fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> Result<()> {
    while !buf.is_empty() {
        let n = pread(file.as_raw_fd(), buf, offset as i64)
            .map_err(to_io_error)?;
        if n == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "short read while verifying piece",
            )));
        }
        buf = &mut buf[n..];
        offset += n as u64;
    }
    Ok(())
}

fn to_io_error(e: nix::Error) -> Error {
    Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::Metainfo;
    use std::path::PathBuf;

    fn fixture(dir: &std::path::Path, data: &[u8], piece_len: u32) -> (StorageInfo, Vec<u8>) {
        let mut hashes = Vec::new();
        for chunk in data.chunks(piece_len as usize) {
            let digest = Sha1::digest(chunk);
            hashes.extend_from_slice(&digest);
        }
        let metainfo = Metainfo {
            announce: None,
            announce_list: None,
            info: crate::metainfo::Info {
                name: "f.bin".into(),
                pieces: hashes.clone(),
                piece_length: piece_len as u64,
                length: Some(data.len() as u64),
                files: None,
                private: None,
            },
            info_hash: [0; 20],
        };
        (StorageInfo::new(&metainfo, dir.to_path_buf()), hashes)
    }

    #[test]
    fn write_then_verify_round_trips() {
        let dir = std::env::temp_dir().join(format!(
            "leechtorrent-test-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();

        let data = b"hello leechtorrent world!".to_vec();
        let (storage, hashes) = fixture(&dir, &data, 10);
        let writer = FileWriter::new(storage, hashes).unwrap();

        for (piece_index, chunk) in data.chunks(10).enumerate() {
            writer.write_piece(piece_index, 0, chunk).unwrap();
            assert!(writer.verify(piece_index).unwrap());
        }

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn single_byte_perturbation_fails_verification() {
        let dir = std::env::temp_dir().join(format!(
            "leechtorrent-test-perturb-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();

        let data = b"0123456789".to_vec();
        let (storage, hashes) = fixture(&dir, &data, 10);
        let writer = FileWriter::new(storage, hashes).unwrap();

        let mut corrupted = data.clone();
        corrupted[3] ^= 0xFF;
        writer.write_piece(0, 0, &corrupted).unwrap();
        assert!(!writer.verify(0).unwrap());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn last_piece_shorter_than_nominal_verifies() {
        let dir = std::env::temp_dir().join(format!(
            "leechtorrent-test-last-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();

        let data = b"0123456789ab".to_vec(); // 12 bytes, piece_len 10 -> last piece 2 bytes
        let (storage, hashes) = fixture(&dir, &data, 10);
        let writer = FileWriter::new(storage, hashes).unwrap();

        writer.write_piece(0, 0, &data[0..10]).unwrap();
        writer.write_piece(1, 0, &data[10..12]).unwrap();
        assert!(writer.verify(0).unwrap());
        assert!(writer.verify(1).unwrap());

        let _ = fs::remove_dir_all(&dir);
    }
}

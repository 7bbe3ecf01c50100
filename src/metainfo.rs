//! Decoding of the `.torrent` metainfo format.
//!
//! This is deliberately thin: the bencode value model itself is an external
//! format handled by `serde_bencode`, and this module only adds the
//! `serde`-derived struct layer plus the handful of derived fields (info
//! hash, piece count, total length) the rest of the crate needs.
//!
//! The one piece of real logic here is [`info_span`]: the info hash must be
//! computed over the *original* bytes of the info dictionary as they
//! appeared in the source buffer, not over a re-encoding of the parsed
//! struct, since a re-encode can disagree with a nonstandard (but valid)
//! source encoding and silently produce the wrong info hash.

use crate::{error::Error, storage_info::FsStructure, FileInfo, Sha1Hash};
use sha1::{Digest, Sha1};
use std::path::PathBuf;

/// A decoded `.torrent` metainfo file.
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// The primary announce URL.
    pub announce: Option<String>,
    /// Additional tiers of announce URLs, per BEP 12.
    pub announce_list: Option<Vec<Vec<String>>>,
    pub info: Info,
    /// SHA-1 of the original info dictionary bytes, as extracted by
    /// [`info_span`] rather than by re-encoding `info`.
    pub info_hash: Sha1Hash,
}

#[derive(Debug, Deserialize)]
struct RawMetainfo {
    announce: Option<String>,
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
    info: Info,
}

impl Metainfo {
    /// Parses a `.torrent` file's raw bytes into a `Metainfo`.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        let raw: RawMetainfo = serde_bencode::from_bytes(buf)?;
        let span = info_span(buf)?;
        let digest = Sha1::digest(&buf[span]);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(Self {
            announce: raw.announce,
            announce_list: raw.announce_list,
            info: raw.info,
            info_hash,
        })
    }

    /// All announce URLs, primary tier first, in the order trackers should be
    /// tried.
    pub fn trackers(&self) -> Vec<String> {
        let mut urls = Vec::new();
        if let Some(announce) = &self.announce {
            urls.push(announce.clone());
        }
        if let Some(tiers) = &self.announce_list {
            for tier in tiers {
                for url in tier {
                    if !urls.contains(url) {
                        urls.push(url.clone());
                    }
                }
            }
        }
        urls
    }

    /// The torrent's name, used as the archive directory name for multi-file
    /// torrents.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// The nominal piece length, in bytes.
    pub fn piece_len(&self) -> u32 {
        self.info.piece_length as u32
    }

    /// The total length of the download, summed across all files.
    pub fn total_len(&self) -> u64 {
        match &self.info.files {
            Some(files) => files.iter().map(|f| f.length as u64).sum(),
            None => self.info.length.unwrap_or(0),
        }
    }

    /// The number of pieces, derived from the length of the pieces blob.
    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// Returns the expected SHA-1 hash of the given piece.
    pub fn piece_hash(&self, index: usize) -> Result<Sha1Hash, Error> {
        let start = index * 20;
        let end = start + 20;
        if end > self.info.pieces.len() {
            return Err(Error::InvalidPieceIndex);
        }
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.info.pieces[start..end]);
        Ok(hash)
    }

    /// Builds the on-disk file structure described by this metainfo, with
    /// paths relative to (but not including) the download directory.
    pub fn structure(&self) -> FsStructure {
        match &self.info.files {
            None => FsStructure::File(FileInfo {
                path: PathBuf::from(&self.info.name),
                len: self.info.length.unwrap_or(0),
                torrent_offset: 0,
            }),
            Some(files) => {
                let mut torrent_offset = 0;
                let files = files
                    .iter()
                    .map(|f| {
                        let len = f.length as u64;
                        let info = FileInfo {
                            path: f.path.iter().collect::<PathBuf>(),
                            len,
                            torrent_offset,
                        };
                        torrent_offset += len;
                        info
                    })
                    .collect();
                FsStructure::Archive { files }
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    pub length: Option<u64>,
    pub files: Option<Vec<File>>,
    pub private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct File {
    pub path: Vec<String>,
    pub length: i64,
}

/// Walks the top-level bencoded dictionary in `buf` to find the byte range
/// of the value mapped to the `info` key, without decoding it into any
/// intermediate value representation.
fn info_span(buf: &[u8]) -> Result<std::ops::Range<usize>, Error> {
    if buf.first() != Some(&b'd') {
        return Err(Error::InvalidMetainfo(
            "metainfo is not a bencoded dictionary".into(),
        ));
    }
    let mut pos = 1;
    loop {
        if pos >= buf.len() {
            return Err(Error::InvalidMetainfo(
                "unexpected end of input before 'info' key".into(),
            ));
        }
        if buf[pos] == b'e' {
            return Err(Error::InvalidMetainfo(
                "metainfo has no 'info' key".into(),
            ));
        }
        let (key, after_key) = read_bencode_string(buf, pos)?;
        if key == b"info" {
            let value_end = skip_bencode_value(buf, after_key)?;
            return Ok(after_key..value_end);
        }
        pos = skip_bencode_value(buf, after_key)?;
    }
}

/// Reads a bencode byte string (`<len>:<bytes>`) starting at `pos`, returning
/// the string's bytes and the position immediately after them.
fn read_bencode_string(
    buf: &[u8],
    pos: usize,
) -> Result<(&[u8], usize), Error> {
    let colon = buf[pos..]
        .iter()
        .position(|&b| b == b':')
        .ok_or_else(|| Error::InvalidMetainfo("malformed bencode string".into()))?
        + pos;
    let len: usize = std::str::from_utf8(&buf[pos..colon])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::InvalidMetainfo("malformed bencode string length".into()))?;
    let start = colon + 1;
    let end = start + len;
    if end > buf.len() {
        return Err(Error::InvalidMetainfo("bencode string overruns buffer".into()));
    }
    Ok((&buf[start..end], end))
}

/// Returns the position immediately following the bencode value (string,
/// integer, list, or dictionary) starting at `pos`.
fn skip_bencode_value(buf: &[u8], pos: usize) -> Result<usize, Error> {
    if pos >= buf.len() {
        return Err(Error::InvalidMetainfo("unexpected end of input".into()));
    }
    match buf[pos] {
        b'i' => {
            let e = buf[pos..]
                .iter()
                .position(|&b| b == b'e')
                .ok_or_else(|| Error::InvalidMetainfo("unterminated integer".into()))?;
            Ok(pos + e + 1)
        }
        b'l' => {
            let mut cur = pos + 1;
            while buf.get(cur) != Some(&b'e') {
                cur = skip_bencode_value(buf, cur)?;
            }
            Ok(cur + 1)
        }
        b'd' => {
            let mut cur = pos + 1;
            while buf.get(cur) != Some(&b'e') {
                let (_, after_key) = read_bencode_string(buf, cur)?;
                cur = skip_bencode_value(buf, after_key)?;
            }
            Ok(cur + 1)
        }
        b'0'..=b'9' => {
            let (_, after) = read_bencode_string(buf, pos)?;
            Ok(after)
        }
        _ => Err(Error::InvalidMetainfo("invalid bencode tag byte".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal single-file torrent: one 4-byte piece.
    fn single_file_fixture() -> Vec<u8> {
        b"d8:announce14:http://a.com/4:infod6:lengthi4e4:name5:a.txt12:piece lengthi4e6:pieces20:AAAAAAAAAAAAAAAAAAAAee".to_vec()
    }

    #[test]
    fn parses_announce_and_info() {
        let buf = single_file_fixture();
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.announce.as_deref(), Some("http://a.com/"));
        assert_eq!(metainfo.info.name, "a.txt");
        assert_eq!(metainfo.total_len(), 4);
        assert_eq!(metainfo.piece_len(), 4);
        assert_eq!(metainfo.piece_count(), 1);
    }

    #[test]
    fn info_hash_is_stable_regardless_of_key_order() {
        // identical info dict, but with 'info' as the *first* key in the
        // outer dictionary rather than the second: a re-encode of the parsed
        // struct would still produce the same bytes (serde_bencode sorts
        // keys), but the span-based extraction must find the correct bytes
        // in both encodings and agree with the canonical ordering.
        let reordered = b"d4:infod6:lengthi4e4:name5:a.txt12:piece lengthi4e6:pieces20:AAAAAAAAAAAAAAAAAAAAe8:announce14:http://a.com/e".to_vec();
        let canonical = single_file_fixture();
        let a = Metainfo::from_bytes(&reordered).unwrap();
        let b = Metainfo::from_bytes(&canonical).unwrap();
        assert_eq!(a.info_hash, b.info_hash);
    }

    #[test]
    fn rejects_missing_info_key() {
        let buf = b"d8:announce14:http://a.com/e".to_vec();
        assert!(Metainfo::from_bytes(&buf).is_err());
    }

    #[test]
    fn multi_file_structure_assigns_increasing_offsets() {
        let buf = b"d4:infod5:filesld6:lengthi3e4:pathl1:a1:beed6:lengthi5e4:pathl1:ceee4:name4:root12:piece lengthi8eee"
            .to_vec();
        // pieces field omitted on purpose for this structure-only check;
        // piece_count would be 0, which is fine since we don't call it here.
        let raw: RawMetainfo = serde_bencode::from_bytes(&buf).unwrap();
        let metainfo = Metainfo {
            announce: None,
            announce_list: None,
            info: raw.info,
            info_hash: [0; 20],
        };
        match metainfo.structure() {
            FsStructure::Archive { files } => {
                assert_eq!(files.len(), 2);
                assert_eq!(files[0].torrent_offset, 0);
                assert_eq!(files[1].torrent_offset, 3);
            }
            FsStructure::File(_) => panic!("expected archive structure"),
        }
    }
}

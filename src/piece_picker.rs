//! The piece/block manager (component C): the authoritative, thread-safe map
//! of what has been downloaded, what is in flight, and what remains, plus
//! the policy for handing a peer its next batch of work.
//!
//! Everything is guarded by a single [`std::sync::Mutex`] over a plain
//! struct, per the design notes: this workload doesn't justify sharding the
//! lock by piece index.

use std::{
    collections::HashSet,
    sync::Mutex,
};

use rand::seq::SliceRandom;

use crate::{
    block_count, download::PieceDownload, BlockId, Bitfield, PieceIndex,
};

/// The outcome of [`PiecePicker::mark_delivered`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeliveryOutcome {
    /// The block was accepted; its piece isn't complete yet.
    Accepted,
    /// The block was accepted and was the last missing block of its piece.
    PieceComplete(PieceIndex),
    /// The triple didn't resolve to a known, pending block.
    Rejected,
}

struct State {
    pieces: Vec<PieceDownload>,
    /// A permutation of `0..piece_count`, generated once at construction.
    /// Iterating pieces in this fixed order approximates rarest-first
    /// without tracking global rarity.
    order: Vec<PieceIndex>,
    /// `block_base[p]` is the first global `BlockId` belonging to piece `p`.
    block_base: Vec<BlockId>,
    downloaded_bytes: u64,
}

impl State {
    fn locate(&self, block_id: BlockId) -> (PieceIndex, usize) {
        // the base offsets are monotonically increasing, so the owning
        // piece is the last one whose base is <= block_id
        let piece = match self.block_base.binary_search(&block_id) {
            Ok(p) => p,
            Err(p) => p - 1,
        };
        (piece, block_id - self.block_base[piece])
    }
}

/// The piece/block manager.
pub(crate) struct PiecePicker {
    state: Mutex<State>,
}

impl PiecePicker {
    /// Builds a fresh manager for a torrent whose pieces have the given
    /// lengths, applying any resume hints (global block indices already
    /// known to be downloaded) before the first `next_blocks` call.
    pub fn new(piece_lens: &[u32], resume_hint: &HashSet<BlockId>) -> Self {
        let mut pieces = Vec::with_capacity(piece_lens.len());
        let mut block_base = Vec::with_capacity(piece_lens.len());
        let mut next_base = 0;
        for (index, &len) in piece_lens.iter().enumerate() {
            block_base.push(next_base);
            next_base += block_count(len);
            pieces.push(PieceDownload::new(index, len));
        }

        let mut order: Vec<PieceIndex> = (0..pieces.len()).collect();
        order.shuffle(&mut rand::thread_rng());

        let mut state = State {
            pieces,
            order,
            block_base,
            downloaded_bytes: 0,
        };

        for &block_id in resume_hint {
            let (piece, block_index) = state.locate(block_id);
            if let Some(p) = state.pieces.get_mut(piece) {
                let info = p.block_info(block_index);
                p.mark_pending(block_index);
                let accepted = p.accept(info.offset, info.len);
                if accepted.is_some() {
                    state.downloaded_bytes += info.len as u64;
                }
            }
        }

        Self {
            state: Mutex::new(state),
        }
    }

    /// Returns up to `max` blocks to request from a peer advertising
    /// `peer_bitfield`, marking them in-flight before releasing the lock.
    ///
    /// Prefers open blocks from pieces the peer has, visited in the fixed
    /// startup permutation. If fewer than `max` open blocks are available,
    /// relaxes I2 and additionally returns already-pending blocks
    /// (endgame duplication) to bound tail latency.
    pub fn next_blocks(
        &self,
        peer_bitfield: &Bitfield,
        max: usize,
    ) -> Vec<(BlockId, crate::BlockInfo)> {
        if max == 0 {
            return Vec::new();
        }
        let mut state_guard = self.state.lock().unwrap();
        // Reborrow as a plain `&mut State` so the field accesses below are
        // disjoint borrows the compiler can see through; through the
        // `MutexGuard`'s own `DerefMut` they'd all alias `*state_guard`.
        let state = &mut *state_guard;
        let mut out = Vec::with_capacity(max);

        let order = state.order.clone();
        for &piece_index in &order {
            if out.len() >= max {
                break;
            }
            if !peer_has(peer_bitfield, piece_index) {
                continue;
            }
            let base = state.block_base[piece_index];
            let piece = &mut state.pieces[piece_index];
            if piece.verified {
                continue;
            }
            for block_index in piece.open_block_indices() {
                if out.len() >= max {
                    break;
                }
                piece.mark_pending(block_index);
                let info = piece.block_info(block_index);
                out.push((base + block_index, info));
            }
        }

        if out.len() < max {
            for &piece_index in &order {
                if out.len() >= max {
                    break;
                }
                if !peer_has(peer_bitfield, piece_index) {
                    continue;
                }
                let piece = &state.pieces[piece_index];
                if piece.verified {
                    continue;
                }
                for block_index in piece.pending_block_indices() {
                    if out.len() >= max {
                        break;
                    }
                    let info = piece.block_info(block_index);
                    let id = state.block_base[piece_index] + block_index;
                    // avoid returning the same block twice within this one
                    // call if it was already picked above
                    if out.iter().any(|(existing, _)| *existing == id) {
                        continue;
                    }
                    out.push((id, info));
                }
            }
        }

        out
    }

    /// Pure lookup of a block's wire request triple.
    pub fn make_request(
        &self,
        block_id: BlockId,
    ) -> (PieceIndex, u32, u32) {
        let state = self.state.lock().unwrap();
        let (piece, block_index) = state.locate(block_id);
        let info = state.pieces[piece].block_info(block_index);
        (info.piece_index, info.offset, info.len)
    }

    /// Accepts or rejects a delivered block.
    pub fn mark_delivered(
        &self,
        piece: PieceIndex,
        offset: u32,
        len: u32,
    ) -> DeliveryOutcome {
        let mut state = self.state.lock().unwrap();
        let piece_download = match state.pieces.get_mut(piece) {
            Some(p) => p,
            None => return DeliveryOutcome::Rejected,
        };
        match piece_download.accept(offset, len) {
            Some(_) => {
                state.downloaded_bytes += len as u64;
                if state.pieces[piece].is_complete() {
                    DeliveryOutcome::PieceComplete(piece)
                } else {
                    DeliveryOutcome::Accepted
                }
            }
            None => DeliveryOutcome::Rejected,
        }
    }

    /// Reverses a piece's accounting and reopens all its blocks; invoked
    /// when SHA-1 verification fails.
    pub fn unmark_piece(&self, piece: PieceIndex) {
        let mut state = self.state.lock().unwrap();
        if let Some(p) = state.pieces.get_mut(piece) {
            state.downloaded_bytes =
                state.downloaded_bytes.saturating_sub(p.received_len as u64);
            p.reset();
        }
    }

    /// Marks a completed piece as SHA-1 verified, setting its client
    /// bitfield bit.
    pub fn mark_verified(&self, piece: PieceIndex) {
        let mut state = self.state.lock().unwrap();
        if let Some(p) = state.pieces.get_mut(piece) {
            p.verified = true;
        }
    }

    /// Clears a block's in-flight flag without changing its received bytes;
    /// invoked on peer timeout/disconnect.
    pub fn release(&self, block_id: BlockId) {
        let mut state = self.state.lock().unwrap();
        let (piece, block_index) = state.locate(block_id);
        if let Some(p) = state.pieces.get_mut(piece) {
            p.release(block_index);
        }
    }

    /// Sum of delivered bytes across the torrent, for progress reporting.
    pub fn bytes_downloaded(&self) -> u64 {
        self.state.lock().unwrap().downloaded_bytes
    }

    /// The global block ids belonging to `piece`, for recording into a
    /// resume store once the piece verifies.
    pub fn block_ids_for_piece(&self, piece: PieceIndex) -> Vec<BlockId> {
        let state = self.state.lock().unwrap();
        match (state.pieces.get(piece), state.block_base.get(piece)) {
            (Some(p), Some(&base)) => (base..base + p.block_count()).collect(),
            _ => Vec::new(),
        }
    }

    /// Pieces whose blocks are all received but which have not yet been
    /// SHA-1 verified -- the engine verifies these at startup to honor
    /// resume hints, and the coordinator verifies them as they complete.
    pub fn complete_unverified_pieces(&self) -> Vec<PieceIndex> {
        let state = self.state.lock().unwrap();
        state
            .pieces
            .iter()
            .filter(|p| p.is_complete() && !p.verified)
            .map(|p| p.index)
            .collect()
    }

    /// True once every piece has been SHA-1 verified.
    pub fn is_complete(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.pieces.iter().all(|p| p.verified)
    }

    /// The client bitfield: bit `k` is set iff piece `k` is verified.
    pub fn bitfield(&self) -> Bitfield {
        let state = self.state.lock().unwrap();
        let mut bitfield = Bitfield::repeat(false, state.pieces.len());
        for p in &state.pieces {
            if p.verified {
                bitfield.set(p.index, true);
            }
        }
        bitfield
    }
}

fn peer_has(peer_bitfield: &Bitfield, piece_index: PieceIndex) -> bool {
    peer_bitfield.get(piece_index).map_or(false, |b| *b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Bitfield;

    fn seed_bitfield(n: usize) -> Bitfield {
        Bitfield::repeat(true, n)
    }

    #[test]
    fn next_blocks_respects_peer_availability() {
        let picker = PiecePicker::new(&[10, 10], &HashSet::new());
        let mut has_only_first = Bitfield::repeat(false, 2);
        has_only_first.set(0, true);
        let picked = picker.next_blocks(&has_only_first, 10);
        assert!(picked.iter().all(|(_, info)| info.piece_index == 0));
    }

    #[test]
    fn mark_delivered_completes_and_rejects_duplicates() {
        let picker = PiecePicker::new(&[10], &HashSet::new());
        let bitfield = seed_bitfield(1);
        let picked = picker.next_blocks(&bitfield, 10);
        assert_eq!(picked.len(), 1);
        let (_, info) = picked[0];
        assert_eq!(
            picker.mark_delivered(info.piece_index, info.offset, info.len),
            DeliveryOutcome::PieceComplete(0)
        );
        // redelivering the same block is rejected and doesn't double count
        assert_eq!(
            picker.mark_delivered(info.piece_index, info.offset, info.len),
            DeliveryOutcome::Rejected
        );
        assert_eq!(picker.bytes_downloaded(), 10);
    }

    #[test]
    fn unmark_piece_reopens_it_for_rescheduling() {
        let picker = PiecePicker::new(&[10], &HashSet::new());
        let bitfield = seed_bitfield(1);
        let picked = picker.next_blocks(&bitfield, 10);
        let (_, info) = picked[0];
        picker.mark_delivered(info.piece_index, info.offset, info.len);
        assert_eq!(picker.bytes_downloaded(), 10);
        picker.unmark_piece(0);
        assert_eq!(picker.bytes_downloaded(), 0);
        let picked_again = picker.next_blocks(&bitfield, 10);
        assert_eq!(picked_again.len(), 1);
    }

    #[test]
    fn resume_hint_marks_block_delivered_upfront() {
        let picker = PiecePicker::new(&[crate::BLOCK_LEN * 2], &HashSet::from([0]));
        assert_eq!(picker.bytes_downloaded(), crate::BLOCK_LEN as u64);
        let bitfield = seed_bitfield(1);
        let picked = picker.next_blocks(&bitfield, 10);
        // only the second block remains open
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].1.offset, crate::BLOCK_LEN);
    }

    #[test]
    fn endgame_duplicates_in_flight_blocks_when_open_set_is_empty() {
        let picker = PiecePicker::new(&[10], &HashSet::new());
        let bitfield = seed_bitfield(1);
        // first peer takes the only block
        let first = picker.next_blocks(&bitfield, 5);
        assert_eq!(first.len(), 1);
        // a second peer, with nothing open left, is handed the same
        // in-flight block (endgame duplication)
        let second = picker.next_blocks(&bitfield, 5);
        assert_eq!(second.len(), 1);
        assert_eq!(first[0].0, second[0].0);

        let (_, info) = first[0];
        assert_eq!(
            picker.mark_delivered(info.piece_index, info.offset, info.len),
            DeliveryOutcome::PieceComplete(0)
        );
        // the duplicate delivery from the second peer is rejected without
        // side effects
        assert_eq!(
            picker.mark_delivered(info.piece_index, info.offset, info.len),
            DeliveryOutcome::Rejected
        );
        assert_eq!(picker.bytes_downloaded(), 10);
    }
}

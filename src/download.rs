//! Per-piece block bookkeeping.
//!
//! This is the leaf data model the piece/block manager (`piece_picker`)
//! builds its selection policy and accounting on top of: for a single piece,
//! which of its blocks are open, in flight, or received.

use crate::{block_count, block_len, BlockInfo, PieceIndex};

/// The status of a single block within a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockStatus {
    /// Remaining bytes > 0 and not currently requested from any peer.
    Open,
    /// Requested from a peer (or, during endgame, from more than one); not
    /// yet accepted.
    Pending,
    /// Delivered and accepted; terminal state for the block.
    Received,
}

#[derive(Debug, Clone)]
struct Block {
    status: BlockStatus,
    len: u32,
}

/// The block table for a single piece, plus the piece-level accounting
/// (bytes received, verified flag) layered on top of it.
#[derive(Debug)]
pub(crate) struct PieceDownload {
    pub index: PieceIndex,
    pub len: u32,
    blocks: Vec<Block>,
    pub received_len: u32,
    pub verified: bool,
}

impl PieceDownload {
    pub fn new(index: PieceIndex, len: u32) -> Self {
        let count = block_count(len);
        let blocks = (0..count)
            .map(|i| Block {
                status: BlockStatus::Open,
                len: block_len(len, i),
            })
            .collect();
        Self {
            index,
            len,
            blocks,
            received_len: 0,
            verified: false,
        }
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_info(&self, block_index: usize) -> BlockInfo {
        let block = &self.blocks[block_index];
        BlockInfo {
            piece_index: self.index,
            offset: block_index as u32 * crate::BLOCK_LEN,
            len: block.len,
        }
    }

    /// Every block of the piece has been delivered and accepted.
    pub fn is_complete(&self) -> bool {
        self.received_len == self.len
    }

    /// Indices of blocks that are open (neither requested nor received).
    pub fn open_block_indices(&self) -> Vec<usize> {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.status == BlockStatus::Open)
            .map(|(i, _)| i)
            .collect()
    }

    /// Indices of blocks that are pending (in flight, not yet received) --
    /// candidates for endgame duplication.
    pub fn pending_block_indices(&self) -> Vec<usize> {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.status == BlockStatus::Pending)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn mark_pending(&mut self, block_index: usize) {
        self.blocks[block_index].status = BlockStatus::Pending;
    }

    /// Releases a block back to `Open` without touching its received bytes.
    /// No-op for a block that's already `Received`.
    pub fn release(&mut self, block_index: usize) {
        let block = &mut self.blocks[block_index];
        if block.status == BlockStatus::Pending {
            block.status = BlockStatus::Open;
        }
    }

    /// Accepts a delivery for the block at `offset` iff its length matches
    /// and it was pending. Returns the block's index on acceptance.
    pub fn accept(&mut self, offset: u32, len: u32) -> Option<usize> {
        let block_index = (offset / crate::BLOCK_LEN) as usize;
        let block = self.blocks.get_mut(block_index)?;
        if block.status != BlockStatus::Pending || block.len != len {
            return None;
        }
        block.status = BlockStatus::Received;
        self.received_len += len;
        Some(block_index)
    }

    /// Resets every block to `Open` and zeroes the received counter, as
    /// happens after a failed SHA-1 verification.
    pub fn reset(&mut self) {
        for block in &mut self.blocks {
            block.status = BlockStatus::Open;
        }
        self.received_len = 0;
        self.verified = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_piece_has_all_blocks_open() {
        let piece = PieceDownload::new(0, crate::BLOCK_LEN * 2 + 100);
        assert_eq!(piece.block_count(), 3);
        assert_eq!(piece.open_block_indices(), vec![0, 1, 2]);
        assert!(!piece.is_complete());
    }

    #[test]
    fn accept_then_complete() {
        let mut piece = PieceDownload::new(0, 10);
        assert_eq!(piece.block_count(), 1);
        piece.mark_pending(0);
        assert_eq!(piece.accept(0, 10), Some(0));
        assert!(piece.is_complete());
        // a second delivery for the same (now-received) block is rejected
        assert_eq!(piece.accept(0, 10), None);
    }

    #[test]
    fn accept_rejects_unrequested_offset() {
        let mut piece = PieceDownload::new(0, crate::BLOCK_LEN * 2);
        // never marked pending -- still Open
        assert_eq!(piece.accept(crate::BLOCK_LEN, crate::BLOCK_LEN), None);
    }

    #[test]
    fn reset_reopens_every_block() {
        let mut piece = PieceDownload::new(0, 10);
        piece.mark_pending(0);
        piece.accept(0, 10);
        piece.verified = true;
        piece.reset();
        assert_eq!(piece.open_block_indices(), vec![0]);
        assert_eq!(piece.received_len, 0);
        assert!(!piece.verified);
    }
}

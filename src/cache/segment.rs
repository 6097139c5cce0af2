use crate::types::BLOCK_SIZE;
use std::time::Instant;

/// One cached, block-aligned region of the destination. Tracks which of
/// its 512-byte sub-blocks hold data read from the destination (`valid`)
/// and which have been written and need flushing (`dirty`).
pub struct Segment {
    pub index: u64,
    pub data: Vec<u8>,
    valid: Vec<bool>,
    dirty: Vec<bool>,
    pub last_access: Instant,
    /// True as long as every byte in this segment came from a non-merge
    /// (whole sub-block) write, never from a device read. A segment loaded
    /// from the backing device, even partially, is never streamed again.
    streamed: bool,
}

impl Segment {
    pub fn new(index: u64, segment_size: u64) -> Self {
        let sub_blocks = (segment_size / BLOCK_SIZE) as usize;
        Self {
            index,
            data: vec![0u8; segment_size as usize],
            valid: vec![false; sub_blocks],
            dirty: vec![false; sub_blocks],
            last_access: Instant::now(),
            streamed: true,
        }
    }

    pub fn is_streamed(&self) -> bool {
        self.streamed
    }

    pub fn mark_not_streamed(&mut self) {
        self.streamed = false;
    }

    pub fn touch(&mut self) {
        self.last_access = Instant::now();
    }

    pub fn is_valid(&self, sub_block: usize) -> bool {
        self.valid[sub_block]
    }

    pub fn is_dirty(&self, sub_block: usize) -> bool {
        self.dirty[sub_block]
    }

    pub fn mark_valid_range(&mut self, start_sub_block: usize, count: usize) {
        for b in self.valid[start_sub_block..start_sub_block + count].iter_mut() {
            *b = true;
        }
    }

    pub fn mark_dirty_range(&mut self, start_sub_block: usize, count: usize) {
        for b in self.dirty[start_sub_block..start_sub_block + count].iter_mut() {
            *b = true;
        }
        self.mark_valid_range(start_sub_block, count);
    }

    pub fn clear_dirty(&mut self) {
        for b in self.dirty.iter_mut() {
            *b = false;
        }
    }

    pub fn has_dirty(&self) -> bool {
        self.dirty.iter().any(|b| *b)
    }

    pub fn all_valid(&self) -> bool {
        self.valid.iter().all(|b| *b)
    }

    /// Sub-blocks dirty but not contiguous: the ranges needing a read to
    /// merge with on-disk content before they can be written whole.
    pub fn invalid_sub_blocks(&self) -> Vec<usize> {
        self.valid.iter().enumerate().filter(|(_, v)| !**v).map(|(i, _)| i).collect()
    }

    pub fn sub_block_count(&self) -> usize {
        self.valid.len()
    }
}

use crate::cache::BlockCache;
use crate::errors::Result;
use crate::types::BLOCK_SIZE;

const BUFFER_SIZE: usize = BLOCK_SIZE as usize;

/// Accumulates arbitrarily sized, arbitrarily offset writes into
/// block-aligned chunks before handing them to a [`BlockCache`].
///
/// Writes are expected to arrive in non-decreasing offset order, possibly
/// with gaps (sparse holes), which is all a decompressor's output stream
/// needs. It never reads from the cache: each flushed chunk is always a
/// full block the writer itself assembled.
pub struct PadToBlockWriter<'a> {
    output: &'a BlockCache,
    buffer: [u8; BUFFER_SIZE],
    index: usize,
    offset: u64,
}

impl<'a> PadToBlockWriter<'a> {
    pub fn new(output: &'a BlockCache) -> Self {
        Self { output, buffer: [0u8; BUFFER_SIZE], index: 0, offset: 0 }
    }

    pub fn pwrite(&mut self, mut buf: &[u8], mut offset: u64) -> Result<()> {
        if self.index != 0 {
            let current_index = self.offset + self.index as u64;
            let max_index = self.offset + BUFFER_SIZE as u64;
            debug_assert!(offset >= current_index, "pad writer requires non-decreasing offsets");

            let mut current_index = current_index;
            if offset > current_index && offset < max_index {
                let to_skip = (offset - current_index) as usize;
                self.buffer[self.index..self.index + to_skip].fill(0);
                current_index = offset;
                self.index += to_skip;
            }

            if current_index == offset {
                let to_copy = (BUFFER_SIZE - self.index).min(buf.len());
                self.buffer[self.index..self.index + to_copy].copy_from_slice(&buf[..to_copy]);
                buf = &buf[to_copy..];
                self.index += to_copy;
                offset += to_copy as u64;

                if self.index == BUFFER_SIZE {
                    self.output.pwrite(&self.buffer, self.offset, true)?;
                    self.index = 0;
                } else {
                    return Ok(());
                }
            } else {
                self.flush()?;
            }
        }

        let index_from_block_boundary = (offset & (BUFFER_SIZE as u64 - 1)) as usize;
        if index_from_block_boundary != 0 {
            self.buffer[..index_from_block_boundary].fill(0);
            self.index = index_from_block_boundary;
            self.offset = offset - index_from_block_boundary as u64;
            return self.pwrite(buf, offset);
        }

        if buf.len() > BUFFER_SIZE {
            let to_copy = buf.len() & !(BUFFER_SIZE - 1);
            self.output.pwrite(&buf[..to_copy], offset, true)?;
            offset += to_copy as u64;
            buf = &buf[to_copy..];
        }

        if !buf.is_empty() {
            self.buffer[..buf.len()].copy_from_slice(buf);
            self.index = buf.len();
            self.offset = offset;
        }

        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.index > 0 {
            self.buffer[self.index..].fill(0);
            self.output.pwrite(&self.buffer, self.offset, true)?;
            self.index = 0;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use std::io::Cursor;

    fn new_cache() -> BlockCache {
        let cursor: Box<dyn crate::cache::BlockDevice> = Box::new(Cursor::new(vec![0u8; 4096]));
        BlockCache::new(cursor, CacheConfig::default())
    }

    #[test]
    fn unaligned_writes_flush_full_blocks() {
        let cache = new_cache();
        {
            let mut w = PadToBlockWriter::new(&cache);
            w.pwrite(&[1u8; 300], 0).unwrap();
            w.pwrite(&[2u8; 300], 300).unwrap();
            w.flush().unwrap();
        }
        let mut out = vec![0u8; 600];
        cache.pread(&mut out, 0).unwrap();
        assert_eq!(&out[..300], &[1u8; 300][..]);
        assert_eq!(&out[300..600], &[2u8; 300][..]);
    }

    #[test]
    fn gap_is_zero_filled() {
        let cache = new_cache();
        {
            let mut w = PadToBlockWriter::new(&cache);
            w.pwrite(&[9u8; 10], 0).unwrap();
            w.pwrite(&[9u8; 10], 100).unwrap();
            w.flush().unwrap();
        }
        let mut out = vec![0u8; 512];
        cache.pread(&mut out, 0).unwrap();
        assert_eq!(&out[10..100], &vec![0u8; 90][..]);
    }
}

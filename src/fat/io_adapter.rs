use crate::cache::BlockCache;
use crate::types::BLOCK_SIZE;
use fatfs::{IoBase, IoError, Read as FatRead, Seek as FatSeek, SeekFrom as FatSeekFrom, Write as FatWrite};
use std::fmt;

#[derive(Debug)]
pub struct CacheIoError(String);

impl fmt::Display for CacheIoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for CacheIoError {}

impl IoError for CacheIoError {
    fn is_interrupted(&self) -> bool {
        false
    }

    fn new_unexpected_eof_error() -> Self {
        CacheIoError("unexpected end of FAT volume".into())
    }

    fn new_write_zero_error() -> Self {
        CacheIoError("write returned zero bytes".into())
    }
}

/// Presents a window of a [`BlockCache`] - `[block_offset, block_offset +
/// block_count)` in 512-byte blocks - as a `fatfs`-compatible random
/// access device, the way fwup mounts a FAT filesystem directly at a
/// partition's block offset rather than through a loopback device.
pub struct CacheIo<'a> {
    cache: &'a BlockCache,
    base_offset: u64,
    len: u64,
    pos: u64,
}

impl<'a> CacheIo<'a> {
    pub fn new(cache: &'a BlockCache, block_offset: u64, block_count: u64) -> Self {
        Self {
            cache,
            base_offset: block_offset * BLOCK_SIZE,
            len: block_count * BLOCK_SIZE,
            pos: 0,
        }
    }
}

impl IoBase for CacheIo<'_> {
    type Error = CacheIoError;
}

impl FatRead for CacheIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let remaining = self.len.saturating_sub(self.pos);
        let to_read = (buf.len() as u64).min(remaining) as usize;
        if to_read == 0 {
            return Ok(0);
        }
        self.cache
            .pread(&mut buf[..to_read], self.base_offset + self.pos)
            .map_err(|e| CacheIoError(e.to_string()))?;
        self.pos += to_read as u64;
        Ok(to_read)
    }
}

impl FatWrite for CacheIo<'_> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        let remaining = self.len.saturating_sub(self.pos);
        let to_write = (buf.len() as u64).min(remaining) as usize;
        if to_write == 0 {
            return Err(CacheIoError::new_write_zero_error());
        }
        self.cache
            .pwrite(&buf[..to_write], self.base_offset + self.pos, true)
            .map_err(|e| CacheIoError(e.to_string()))?;
        self.pos += to_write as u64;
        Ok(to_write)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.cache.flush().map_err(|e| CacheIoError(e.to_string()))
    }
}

impl FatSeek for CacheIo<'_> {
    fn seek(&mut self, pos: FatSeekFrom) -> Result<u64, Self::Error> {
        let new_pos = match pos {
            FatSeekFrom::Start(p) => p as i64,
            FatSeekFrom::End(p) => self.len as i64 + p,
            FatSeekFrom::Current(p) => self.pos as i64 + p,
        };
        if new_pos < 0 || new_pos as u64 > self.len {
            return Err(CacheIoError("seek out of range".into()));
        }
        self.pos = new_pos as u64;
        Ok(self.pos)
    }
}

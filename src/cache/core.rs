use crate::cache::config::{CacheConfig, VerifyWrites};
use crate::cache::metrics::CacheMetrics;
use crate::cache::segment::Segment;
use crate::errors::{FwupError, Result};
use crate::types::BLOCK_SIZE;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread::JoinHandle;

/// Anything the cache can read from and write to in block-aligned chunks.
pub trait BlockDevice: Read + Write + Seek + Send {}
impl<T: Read + Write + Seek + Send> BlockDevice for T {}

enum WriterJob {
    Write { offset: u64, data: Vec<u8> },
    Barrier(mpsc::Sender<()>),
}

/// Tracks which byte ranges of the destination have been trimmed.
/// `trimmed_remainder` governs the polarity for anything past the last
/// tracked extent: firmware images commonly trim everything first and
/// then write a handful of regions, so the common case is "everything
/// we haven't heard about is trimmed."
pub struct TrimTracker {
    ranges: Vec<(u64, u64)>,
    trimmed_remainder: bool,
}

impl TrimTracker {
    pub fn new(trimmed_remainder: bool) -> Self {
        Self { ranges: Vec::new(), trimmed_remainder }
    }

    pub fn mark(&mut self, offset: u64, len: u64) {
        self.ranges.push((offset, len));
        self.ranges.sort_unstable();
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.ranges.len());
        for (start, length) in self.ranges.drain(..) {
            if let Some(last) = merged.last_mut() {
                let last_end = last.0 + last.1;
                if start <= last_end {
                    let new_end = last_end.max(start + length);
                    last.1 = new_end - last.0;
                    continue;
                }
            }
            merged.push((start, length));
        }
        self.ranges = merged;
    }

    pub fn is_trimmed(&self, offset: u64, len: u64) -> bool {
        let end = offset + len;
        for (start, length) in &self.ranges {
            if *start <= offset && end <= start + length {
                return true;
            }
        }
        self.trimmed_remainder
    }

    /// Removes `[offset, offset+len)` from the tracked trimmed ranges,
    /// splitting any range that straddles the cleared span. Used once a
    /// streamed write populates a segment that used to read as trimmed.
    pub fn clear(&mut self, offset: u64, len: u64) {
        let end = offset + len;
        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        for (start, length) in self.ranges.drain(..) {
            let range_end = start + length;
            if end <= start || offset >= range_end {
                out.push((start, length));
                continue;
            }
            if start < offset {
                out.push((start, offset - start));
            }
            if range_end > end {
                out.push((end, range_end - end));
            }
        }
        out.sort_unstable();
        self.ranges = out;
    }
}

/// Block-aligned write-back cache in front of a destination device or file.
///
/// Reads and writes operate on the caller's thread; persisting dirty
/// segments to the backing device happens on a single background writer
/// thread so applying an update doesn't stall on destination I/O latency.
pub struct BlockCache {
    backing: Arc<parking_lot::Mutex<Box<dyn BlockDevice>>>,
    config: CacheConfig,
    segments: parking_lot::Mutex<HashMap<u64, Segment>>,
    pub metrics: Arc<CacheMetrics>,
    pub trim: parking_lot::Mutex<TrimTracker>,
    writer_tx: mpsc::Sender<WriterJob>,
    writer_handle: Option<JoinHandle<()>>,
}

impl BlockCache {
    pub fn new(backing: Box<dyn BlockDevice>, config: CacheConfig) -> Self {
        let backing = Arc::new(parking_lot::Mutex::new(backing));
        let (tx, rx) = mpsc::channel::<WriterJob>();
        let writer_backing = backing.clone();
        let metrics = Arc::new(CacheMetrics::default());
        let writer_metrics = metrics.clone();
        let writer_handle = std::thread::spawn(move || {
            for job in rx {
                match job {
                    WriterJob::Write { offset, data } => {
                        let mut dev = writer_backing.lock();
                        if dev.seek(SeekFrom::Start(offset)).is_err() {
                            continue;
                        }
                        let _ = dev.write_all(&data);
                        writer_metrics.bytes_written.fetch_add(data.len() as u64, Ordering::Relaxed);
                        writer_metrics.flushes.fetch_add(1, Ordering::Relaxed);
                    }
                    WriterJob::Barrier(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        Self {
            backing,
            segments: parking_lot::Mutex::new(HashMap::new()),
            metrics,
            trim: parking_lot::Mutex::new(TrimTracker::new(false)),
            writer_tx: tx,
            writer_handle: Some(writer_handle),
            config,
        }
    }

    fn segment_index(&self, offset: u64) -> u64 {
        offset / self.config.segment_size
    }

    fn segment_offset(&self, index: u64) -> u64 {
        index * self.config.segment_size
    }

    /// Loads a segment from the backing device, evicting the least
    /// recently used segment first if the cache is already full.
    ///
    /// A segment marked trimmed never needs a device read: its sub-blocks
    /// stay zero-filled from `Segment::new` and read back as zeros, the way
    /// an actual TRIM/discard leaves unwritten flash. Only the sub-block
    /// runs that aren't trimmed are pulled from the backing device.
    fn ensure_loaded(&self, index: u64) -> Result<()> {
        let mut segments = self.segments.lock();
        if segments.contains_key(&index) {
            self.metrics.segment_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        self.metrics.segment_misses.fetch_add(1, Ordering::Relaxed);

        if segments.len() >= self.config.max_segments {
            self.evict_one(&mut segments)?;
        }

        let mut seg = Segment::new(index, self.config.segment_size);
        seg.mark_not_streamed();
        let seg_start = self.segment_offset(index);
        let sub_block_count = seg.sub_block_count();
        let trim = self.trim.lock();

        {
            let mut dev = self.backing.lock();
            let mut sub = 0;
            while sub < sub_block_count {
                let sub_offset = seg_start + sub as u64 * BLOCK_SIZE;
                if trim.is_trimmed(sub_offset, BLOCK_SIZE) {
                    sub += 1;
                    continue;
                }
                let run_start = sub;
                while sub < sub_block_count
                    && !trim.is_trimmed(seg_start + sub as u64 * BLOCK_SIZE, BLOCK_SIZE)
                {
                    sub += 1;
                }
                let byte_start = run_start * BLOCK_SIZE as usize;
                let byte_end = sub * BLOCK_SIZE as usize;
                if dev.seek(SeekFrom::Start(seg_start + byte_start as u64)).is_ok() {
                    let _ = dev.read_exact(&mut seg.data[byte_start..byte_end]).or_else(|_| {
                        // Short read at EOF: leave the tail zeroed, still valid
                        // (growth past current device length).
                        Ok::<(), std::io::Error>(())
                    });
                }
            }
        }
        drop(trim);

        seg.mark_valid_range(0, seg.sub_block_count());
        segments.insert(index, seg);
        Ok(())
    }

    /// Total size of the backing device/file in whole 512-byte blocks.
    /// Used to size `expand`-flagged partitions against the real
    /// destination rather than the value recorded in the manifest.
    pub fn device_blocks(&self) -> Result<u64> {
        let mut dev = self.backing.lock();
        let len = dev.seek(SeekFrom::End(0))?;
        Ok(len / BLOCK_SIZE)
    }

    fn evict_one(&self, segments: &mut HashMap<u64, Segment>) -> Result<()> {
        let Some(victim_index) =
            segments.values().min_by_key(|s| s.last_access).map(|s| s.index)
        else {
            return Ok(());
        };
        if let Some(seg) = segments.remove(&victim_index) {
            if seg.has_dirty() {
                self.flush_segment(&seg)?;
            }
            self.metrics.segments_evicted.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn flush_segment(&self, seg: &Segment) -> Result<()> {
        let (done_tx, done_rx) = mpsc::channel();
        self.writer_tx
            .send(WriterJob::Write { offset: self.segment_offset(seg.index), data: seg.data.clone() })
            .map_err(|e| FwupError::Cache(e.to_string()))?;
        self.writer_tx
            .send(WriterJob::Barrier(done_tx))
            .map_err(|e| FwupError::Cache(e.to_string()))?;
        done_rx.recv().map_err(|e| FwupError::Cache(e.to_string()))?;
        Ok(())
    }

    /// Reads `count` bytes starting at `offset`, pulling segments in as
    /// needed.
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let count = buf.len() as u64;
        let mut remaining = count;
        let mut cursor = offset;
        let mut written = 0usize;
        while remaining > 0 {
            let index = self.segment_index(cursor);
            self.ensure_loaded(index)?;
            let seg_start = self.segment_offset(index);
            let within = (cursor - seg_start) as usize;
            let to_copy = (self.config.segment_size as usize - within).min(remaining as usize);

            let segments = self.segments.lock();
            let seg = segments.get(&index).expect("just loaded");
            buf[written..written + to_copy].copy_from_slice(&seg.data[within..within + to_copy]);
            drop(segments);

            cursor += to_copy as u64;
            remaining -= to_copy as u64;
            written += to_copy;
        }
        self.metrics.bytes_read.fetch_add(count, Ordering::Relaxed);

        // Touch segments' recency after releasing the lock held during copy.
        let mut cursor = offset;
        let mut remaining = count;
        while remaining > 0 {
            let index = self.segment_index(cursor);
            let seg_start = self.segment_offset(index);
            let within = cursor - seg_start;
            let to_copy = (self.config.segment_size - within).min(remaining);
            if let Some(seg) = self.segments.lock().get_mut(&index) {
                seg.touch();
            }
            cursor += to_copy;
            remaining -= to_copy;
        }
        Ok(())
    }

    /// Writes `buf` at `offset`. When `merge` is true, the write may not
    /// be sub-block aligned and the surrounding sub-blocks are read back
    /// first so the merge is correct; when false, the caller guarantees
    /// the write exactly spans whole 512-byte sub-blocks.
    pub fn pwrite(&self, buf: &[u8], offset: u64, merge: bool) -> Result<()> {
        let count = buf.len() as u64;
        let mut remaining = count;
        let mut cursor = offset;
        let mut read_pos = 0usize;
        while remaining > 0 {
            let index = self.segment_index(cursor);
            let seg_start = self.segment_offset(index);
            let within = (cursor - seg_start) as usize;
            let to_copy = (self.config.segment_size as usize - within).min(remaining as usize);

            if merge {
                self.ensure_loaded(index)?;
                self.metrics.merge_reads.fetch_add(1, Ordering::Relaxed);
            } else {
                let mut segments = self.segments.lock();
                if !segments.contains_key(&index) {
                    if segments.len() >= self.config.max_segments {
                        self.evict_one(&mut segments)?;
                    }
                    segments.insert(index, Segment::new(index, self.config.segment_size));
                }
            }

            let mut segments = self.segments.lock();
            let seg = segments.get_mut(&index).expect("just ensured");
            seg.data[within..within + to_copy].copy_from_slice(&buf[read_pos..read_pos + to_copy]);
            let start_sub = within / BLOCK_SIZE as usize;
            let sub_count = to_copy.div_ceil(BLOCK_SIZE as usize).max(1);
            seg.mark_dirty_range(start_sub, sub_count.min(seg.sub_block_count() - start_sub));
            seg.touch();

            // A segment written entirely by non-merge (streamed) writes,
            // with no sub-block ever pulled from the device, can go out to
            // the writer thread the moment it's fully populated instead of
            // waiting for eviction or an explicit flush.
            let eager_flush = !merge && seg.is_streamed() && seg.all_valid() && seg.has_dirty();
            let flush_job = if eager_flush {
                seg.clear_dirty();
                Some((self.segment_offset(index), seg.data.clone()))
            } else {
                None
            };
            drop(segments);

            if let Some((seg_offset, data)) = flush_job {
                self.writer_tx
                    .send(WriterJob::Write { offset: seg_offset, data })
                    .map_err(|e| FwupError::Cache(e.to_string()))?;
                self.trim.lock().clear(seg_offset, self.config.segment_size);
            }

            cursor += to_copy as u64;
            remaining -= to_copy as u64;
            read_pos += to_copy;
        }
        self.metrics.bytes_written.fetch_add(count, Ordering::Relaxed);

        if self.config.verify_writes == VerifyWrites::On {
            let mut check = vec![0u8; buf.len()];
            self.pread(&mut check, offset)?;
            if check != buf {
                return Err(FwupError::Cache(format!("verify-writes mismatch at offset {offset}")));
            }
        }
        Ok(())
    }

    /// Marks a byte range as trimmed. When `issue_trim` is true, this
    /// additionally drops any cached dirty content in the range, since
    /// trimmed content is don't-care.
    pub fn trim(&self, offset: u64, count: u64, issue_trim: bool) -> Result<()> {
        self.trim.lock().mark(offset, count);
        if issue_trim {
            let mut segments = self.segments.lock();
            let start_index = self.segment_index(offset);
            let end_index = self.segment_index(offset + count.saturating_sub(1));
            for index in start_index..=end_index {
                segments.remove(&index);
            }
        }
        Ok(())
    }

    /// Flushes all dirty segments to the backing device, in ascending
    /// last-access order, and waits for the writer thread to finish.
    pub fn flush(&self) -> Result<()> {
        let mut segments = self.segments.lock();
        let mut dirty: Vec<u64> =
            segments.values().filter(|s| s.has_dirty()).map(|s| s.index).collect();
        dirty.sort_by_key(|index| segments.get(index).expect("present").last_access);

        for index in dirty {
            let offset = self.segment_offset(index);
            let data = segments.get(&index).expect("present").data.clone();
            self.writer_tx
                .send(WriterJob::Write { offset, data })
                .map_err(|e| FwupError::Cache(e.to_string()))?;
            if let Some(seg) = segments.get_mut(&index) {
                seg.clear_dirty();
            }
        }
        drop(segments);

        let (done_tx, done_rx) = mpsc::channel();
        self.writer_tx.send(WriterJob::Barrier(done_tx)).map_err(|e| FwupError::Cache(e.to_string()))?;
        done_rx.recv().map_err(|e| FwupError::Cache(e.to_string()))?;
        Ok(())
    }

    /// Discards all cached state without flushing. Used on the error path:
    /// anything not already evicted to disk is abandoned.
    pub fn reset(&self) {
        self.segments.lock().clear();
    }

    /// Flushes, then joins the writer thread. The cache is unusable after
    /// this call.
    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        drop(self.writer_tx.clone());
        if let Some(handle) = self.writer_handle.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        if let Some(handle) = self.writer_handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn cache_over(data: Vec<u8>) -> BlockCache {
        let cursor: Box<dyn BlockDevice> = Box::new(Cursor::new(data));
        BlockCache::new(cursor, CacheConfig { max_segments: 2, ..Default::default() })
    }

    #[test]
    fn read_after_write_roundtrips() {
        let cache = cache_over(vec![0u8; 4096]);
        let payload = vec![0xABu8; 512];
        cache.pwrite(&payload, 512, false).unwrap();
        let mut out = vec![0u8; 512];
        cache.pread(&mut out, 512).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn eviction_flushes_dirty_segments() {
        let cache = cache_over(vec![0u8; 1024 * 1024]);
        // Each segment is 128KiB; touch three to force an eviction with
        // max_segments = 2.
        for i in 0..3u64 {
            let offset = i * 128 * 1024;
            cache.pwrite(&[0x11u8; 512], offset, false).unwrap();
        }
        assert!(cache.metrics.segments_evicted.load(Ordering::Relaxed) >= 1);
        cache.flush().unwrap();
    }

    #[test]
    fn trim_tracker_merges_ranges() {
        let mut t = TrimTracker::new(false);
        t.mark(0, 512);
        t.mark(512, 512);
        assert!(t.is_trimmed(0, 1024));
        assert!(!t.is_trimmed(0, 2048));
    }

    #[test]
    fn trim_tracker_clear_splits_a_range() {
        let mut t = TrimTracker::new(false);
        t.mark(0, 4096);
        t.clear(512, 512);
        assert!(t.is_trimmed(0, 512));
        assert!(!t.is_trimmed(0, 1024));
        assert!(t.is_trimmed(1024, 3072));
    }

    #[test]
    fn trimmed_segment_reads_zero_without_touching_stale_device_content() {
        let cache = cache_over(vec![0xABu8; 128 * 1024]);
        cache.trim(0, 128 * 1024, true).unwrap();
        let mut out = vec![0xFFu8; 512];
        cache.pread(&mut out, 0).unwrap();
        assert_eq!(out, vec![0u8; 512]);
    }

    #[test]
    fn trim_after_offset_reads_zero_past_it() {
        let cache = cache_over(vec![0x11u8; 1024]);
        cache.trim(512, 512, true).unwrap();
        let mut out = vec![0u8; 512];
        cache.pread(&mut out, 512).unwrap();
        assert_eq!(out, vec![0u8; 512]);
    }

    #[test]
    fn fully_streamed_segment_flushes_eagerly() {
        let cache = cache_over(vec![0u8; 128 * 1024]);
        cache.pwrite(&[0x22u8; 128 * 1024], 0, false).unwrap();
        assert!(cache.metrics.flushes.load(Ordering::Relaxed) >= 1);
        let segments = cache.segments.lock();
        assert!(!segments.get(&0).unwrap().has_dirty());
    }

    #[test]
    fn device_blocks_reports_backing_length() {
        let cache = cache_over(vec![0u8; 1024 * 1024]);
        assert_eq!(cache.device_blocks().unwrap(), 1024 * 1024 / BLOCK_SIZE);
    }
}

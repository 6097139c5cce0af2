use std::io::{Read, Seek, SeekFrom};

use crate::errors::Result;

/// Only support so many data/hole fragments in a file; past this, later
/// segments are merged into the last tracked one.
pub const SPARSE_FILE_MAP_MAX_LEN: usize = 256;

/// Alternating data/hole length list describing a sparse file. Entry 0 is
/// the length of the first data segment (0 if the file starts with a
/// hole), entry 1 is the following hole's length, and so on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SparseFileMap {
    pub map: Vec<u64>,
}

impl SparseFileMap {
    pub fn new() -> Self {
        Self { map: Vec::new() }
    }

    pub fn from_lengths(map: Vec<u64>) -> Self {
        Self { map }
    }

    /// A single data segment spanning the whole file, i.e. not sparse.
    pub fn whole(length: u64) -> Self {
        Self { map: vec![length] }
    }

    pub fn size(&self) -> u64 {
        self.map.iter().sum()
    }

    /// Sum of the data segments only (excludes holes).
    pub fn data_size(&self) -> u64 {
        self.map.iter().step_by(2).sum()
    }

    /// Length of a trailing hole, if the map ends on one.
    pub fn ending_hole_size(&self) -> u64 {
        if self.map.len() % 2 == 0 {
            self.map.last().copied().unwrap_or(0)
        } else {
            0
        }
    }

    fn push_segment(&mut self, len: u64) {
        if self.map.len() >= SPARSE_FILE_MAP_MAX_LEN {
            if let Some(last) = self.map.last_mut() {
                *last += len;
            }
        } else {
            self.map.push(len);
        }
    }

    /// Builds a map by scanning `reader` for runs of zero bytes at least
    /// `min_hole_size` long, which are treated as holes. Filesystems that
    /// expose `SEEK_HOLE`/`SEEK_DATA` can do this more cheaply at the OS
    /// level; this is the portable fallback used when that isn't
    /// available.
    pub fn build_from_reader<R: Read + Seek>(reader: &mut R, min_hole_size: u64) -> Result<Self> {
        reader.seek(SeekFrom::Start(0))?;
        let mut map = SparseFileMap::new();
        let mut buf = [0u8; 65536];
        let mut in_hole = false;
        let mut run_len: u64 = 0;
        let mut current_seg_len: u64 = 0;

        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            for &byte in &buf[..n] {
                let is_zero = byte == 0;
                if is_zero {
                    run_len += 1;
                } else {
                    if run_len > 0 && run_len < min_hole_size {
                        // A short zero run wasn't long enough to count as
                        // a hole; fold it back into the current segment.
                        current_seg_len += run_len;
                    }
                    run_len = 0;
                    current_seg_len += 1;
                    in_hole = false;
                }
                if is_zero && run_len == min_hole_size {
                    // Transition into a hole: flush the data segment seen
                    // so far (minus the zero run that turned out to be a
                    // hole).
                    if current_seg_len >= min_hole_size - 1 {
                        current_seg_len -= min_hole_size - 1;
                    }
                    map.push_segment(current_seg_len);
                    current_seg_len = 0;
                    in_hole = true;
                }
            }
        }

        if in_hole {
            map.push_segment(run_len);
        } else {
            current_seg_len += run_len;
            map.push_segment(current_seg_len);
        }

        if map.map.is_empty() {
            map.map.push(0);
        }
        Ok(map)
    }
}

/// Walks a [`SparseFileMap`] yielding `(offset, data)` chunks for the data
/// segments only, skipping holes entirely.
pub struct SparseFileReader<'a, R> {
    map: &'a SparseFileMap,
    reader: R,
    map_ix: usize,
    offset_in_segment: u64,
    file_offset: u64,
}

impl<'a, R: Read> SparseFileReader<'a, R> {
    pub fn new(map: &'a SparseFileMap, reader: R) -> Self {
        Self { map, reader, map_ix: 0, offset_in_segment: 0, file_offset: 0 }
    }

    /// Reads the next chunk of file data, returning `(destination_offset,
    /// bytes)`, or `None` once the map is exhausted. `destination_offset`
    /// is the position in the logical (unsparsed) file; callers use it to
    /// `pwrite` at the right spot and skip over holes.
    pub fn read_next(&mut self, max_len: usize) -> Result<Option<(u64, Vec<u8>)>> {
        while self.map_ix < self.map.map.len() {
            let is_hole = self.map_ix % 2 == 1;
            let seg_len = self.map.map[self.map_ix];
            let remaining = seg_len - self.offset_in_segment;

            if remaining == 0 {
                self.map_ix += 1;
                self.offset_in_segment = 0;
                continue;
            }

            if is_hole {
                self.file_offset += remaining;
                self.map_ix += 1;
                self.offset_in_segment = 0;
                continue;
            }

            let to_read = remaining.min(max_len as u64) as usize;
            let mut buf = vec![0u8; to_read];
            self.reader.read_exact(&mut buf)?;
            let dest = self.file_offset;
            self.file_offset += to_read as u64;
            self.offset_in_segment += to_read as u64;
            return Ok(Some((dest, buf)));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn whole_file_has_single_entry() {
        let m = SparseFileMap::whole(1024);
        assert_eq!(m.size(), 1024);
        assert_eq!(m.data_size(), 1024);
        assert_eq!(m.ending_hole_size(), 0);
    }

    #[test]
    fn ending_hole_is_detected() {
        let m = SparseFileMap::from_lengths(vec![100, 50]);
        assert_eq!(m.ending_hole_size(), 50);
        assert_eq!(m.data_size(), 100);
    }

    #[test]
    fn reader_skips_holes() {
        let map = SparseFileMap::from_lengths(vec![4, 4, 4]);
        let data = Cursor::new(vec![1, 2, 3, 4, 9, 9, 9, 9]);
        let mut r = SparseFileReader::new(&map, data);
        let (off0, chunk0) = r.read_next(1024).unwrap().unwrap();
        assert_eq!(off0, 0);
        assert_eq!(chunk0, vec![1, 2, 3, 4]);
        let (off1, chunk1) = r.read_next(1024).unwrap().unwrap();
        assert_eq!(off1, 8);
        assert_eq!(chunk1, vec![9, 9, 9, 9]);
        assert!(r.read_next(1024).unwrap().is_none());
    }

    #[test]
    fn map_caps_at_max_entries() {
        let mut m = SparseFileMap::new();
        for _ in 0..(SPARSE_FILE_MAP_MAX_LEN + 10) {
            m.push_segment(1);
        }
        assert_eq!(m.map.len(), SPARSE_FILE_MAP_MAX_LEN);
    }

    proptest::proptest! {
        /// Regardless of how zeros are distributed through a buffer, a
        /// built map's data segments concatenate back to the non-hole
        /// bytes of the original, in order.
        #[test]
        fn built_map_reconstructs_non_hole_bytes(bytes in proptest::collection::vec(0u8..=3, 0..512)) {
            let mut cursor = Cursor::new(bytes.clone());
            let map = SparseFileMap::build_from_reader(&mut cursor, 8).unwrap();
            assert_eq!(map.size(), bytes.len() as u64);

            let mut reader = SparseFileReader::new(&map, Cursor::new(&bytes));
            let mut reconstructed = vec![0u8; bytes.len()];
            while let Some((offset, chunk)) = reader.read_next(4096).unwrap() {
                reconstructed[offset as usize..offset as usize + chunk.len()].copy_from_slice(&chunk);
            }

            let mut without_long_zero_runs = bytes.clone();
            // Holes read back as zero bytes, so the only bytes this check
            // can't see are zeros that a real hole replaced; masking every
            // byte the map *didn't* supply to zero makes the comparison
            // hole-agnostic.
            let mut idx = 0usize;
            for (i, len) in map.map.iter().enumerate() {
                let len = *len as usize;
                if i % 2 == 1 {
                    for b in &mut without_long_zero_runs[idx..idx + len] {
                        *b = 0;
                    }
                }
                idx += len;
            }
            assert_eq!(reconstructed, without_long_zero_runs);
        }
    }
}

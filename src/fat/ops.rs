use crate::cache::BlockCache;
use crate::errors::{FwupError, Result};
use crate::fat::io_adapter::CacheIo;
use crate::types::BLOCK_SIZE;
use fatfs::{FileSystem, FsOptions, Read as FatRead, Seek as FatSeek, Write as FatWrite};

/// Reads the BPB's total-sectors field to recover the volume size that
/// `mkfs_fat32` wrote, the way fwup's `fatfs_*` helpers only take a
/// block offset and look the rest up from the already-formatted volume.
fn detect_total_sectors(cache: &BlockCache, block_offset: u64) -> Result<u64> {
    let mut boot = [0u8; 512];
    cache.pread(&mut boot, block_offset * BLOCK_SIZE)?;
    if boot[510] != 0x55 || boot[511] != 0xaa {
        return Err(FwupError::Fat(format!(
            "no FAT filesystem found at block {block_offset}"
        )));
    }
    let total16 = u16::from_le_bytes([boot[19], boot[20]]);
    if total16 != 0 {
        return Ok(total16 as u64);
    }
    Ok(u32::from_le_bytes([boot[32], boot[33], boot[34], boot[35]]) as u64)
}

fn mount(cache: &BlockCache, block_offset: u64) -> Result<FileSystem<CacheIo<'_>>> {
    let block_count = detect_total_sectors(cache, block_offset)?;
    let io = CacheIo::new(cache, block_offset, block_count);
    FileSystem::new(io, FsOptions::new()).map_err(|e| FwupError::Fat(e.to_string()))
}

fn split_path(path: &str) -> (Vec<&str>, &str) {
    let trimmed = path.trim_start_matches('/');
    let mut parts: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();
    let name = parts.pop().unwrap_or("");
    (parts, name)
}

fn open_dir<'a>(
    fs: &'a FileSystem<CacheIo<'a>>,
    dirs: &[&str],
    create: bool,
) -> Result<fatfs::Dir<'a, CacheIo<'a>>> {
    let mut dir = fs.root_dir();
    for part in dirs {
        dir = if create {
            dir.create_dir(part).map_err(|e| FwupError::Fat(e.to_string()))?
        } else {
            dir.open_dir(part).map_err(|e| FwupError::Fat(e.to_string()))?
        };
    }
    Ok(dir)
}

/// Creates a directory (and any missing parent directories) at `path`.
pub fn mkdir(cache: &BlockCache, block_offset: u64, path: &str) -> Result<()> {
    let fs = mount(cache, block_offset)?;
    let (parents, name) = split_path(path);
    let parent = open_dir(&fs, &parents, true)?;
    if !name.is_empty() {
        parent.create_dir(name).map_err(|e| FwupError::Fat(e.to_string()))?;
    }
    Ok(())
}

/// Writes `data` to `path`, creating or truncating the file and any
/// missing parent directories.
pub fn write_at(cache: &BlockCache, block_offset: u64, path: &str, data: &[u8]) -> Result<()> {
    let fs = mount(cache, block_offset)?;
    let (parents, name) = split_path(path);
    let parent = open_dir(&fs, &parents, true)?;
    let mut file = parent.create_file(name).map_err(|e| FwupError::Fat(e.to_string()))?;
    file.truncate().map_err(|e| FwupError::Fat(e.to_string()))?;
    file.write_all(data).map_err(|e| FwupError::Fat(e.to_string()))?;
    file.flush().map_err(|e| FwupError::Fat(e.to_string()))?;
    Ok(())
}

/// Creates an empty file at `path` if it doesn't already exist, leaving
/// its contents untouched if it does. Also used to grow a file that ends
/// in a hole, by writing at the final offset.
pub fn truncate_to(cache: &BlockCache, block_offset: u64, path: &str) -> Result<()> {
    let fs = mount(cache, block_offset)?;
    let (parents, name) = split_path(path);
    let parent = open_dir(&fs, &parents, true)?;
    let mut file = parent.create_file(name).map_err(|e| FwupError::Fat(e.to_string()))?;
    file.truncate().map_err(|e| FwupError::Fat(e.to_string()))?;
    Ok(())
}

/// Creates an empty file at `path` if it doesn't already exist, leaving
/// its contents untouched if it does.
pub fn touch(cache: &BlockCache, block_offset: u64, path: &str) -> Result<()> {
    let fs = mount(cache, block_offset)?;
    let (parents, name) = split_path(path);
    let parent = open_dir(&fs, &parents, true)?;
    if parent.open_file(name).is_err() {
        parent.create_file(name).map_err(|e| FwupError::Fat(e.to_string()))?;
    }
    Ok(())
}

/// Removes a file or empty directory at `path`. When `must_exist` is
/// false, a missing path is not an error (mirrors `fat_rm` vs `fat_rm!`).
pub fn rm(cache: &BlockCache, block_offset: u64, path: &str, must_exist: bool) -> Result<()> {
    let fs = mount(cache, block_offset)?;
    let (parents, name) = split_path(path);
    let parent = open_dir(&fs, &parents, false)?;
    match parent.remove(name) {
        Ok(()) => Ok(()),
        Err(_) if !must_exist => Ok(()),
        Err(e) => Err(FwupError::Fat(e.to_string())),
    }
}

/// Renames/moves `from` to `to` within the same volume. When `force` is
/// false, `to` must not already exist (mirrors `fat_mv` vs `fat_mv!`).
pub fn mv(cache: &BlockCache, block_offset: u64, from: &str, to: &str, force: bool) -> Result<()> {
    let fs = mount(cache, block_offset)?;
    let (from_parents, from_name) = split_path(from);
    let (to_parents, to_name) = split_path(to);
    let src_dir = open_dir(&fs, &from_parents, false)?;
    let dst_dir = open_dir(&fs, &to_parents, true)?;
    if !force && dst_dir.open_file(to_name).is_ok() {
        return Err(FwupError::Fat(format!("'{to}' already exists")));
    }
    src_dir
        .rename(from_name, &dst_dir, to_name)
        .map_err(|e| FwupError::Fat(e.to_string()))?;
    Ok(())
}

/// Copies `from` to `to`, both within the same FAT volume.
pub fn cp(cache: &BlockCache, block_offset: u64, from: &str, to: &str) -> Result<()> {
    let fs = mount(cache, block_offset)?;
    let (from_parents, from_name) = split_path(from);
    let (to_parents, to_name) = split_path(to);
    let src_dir = open_dir(&fs, &from_parents, false)?;
    let mut src = src_dir.open_file(from_name).map_err(|e| FwupError::Fat(e.to_string()))?;
    let mut buf = Vec::new();
    src.read_to_end(&mut buf).map_err(|e| FwupError::Fat(e.to_string()))?;

    let dst_dir = open_dir(&fs, &to_parents, true)?;
    let mut dst = dst_dir.create_file(to_name).map_err(|e| FwupError::Fat(e.to_string()))?;
    dst.truncate().map_err(|e| FwupError::Fat(e.to_string()))?;
    dst.write_all(&buf).map_err(|e| FwupError::Fat(e.to_string()))?;
    dst.flush().map_err(|e| FwupError::Fat(e.to_string()))?;
    Ok(())
}

/// Sets the DOS file attributes (read-only/hidden/system bits) on a
/// file, parsed from a string like `"RHS"`.
pub fn attrib(cache: &BlockCache, block_offset: u64, path: &str, flags: &str) -> Result<()> {
    let fs = mount(cache, block_offset)?;
    let (parents, name) = split_path(path);
    let parent = open_dir(&fs, &parents, false)?;
    let mut file = parent.open_file(name).map_err(|e| FwupError::Fat(e.to_string()))?;
    let mut attrs = fatfs::FileAttributes::empty();
    for c in flags.chars() {
        match c {
            'S' | 's' => attrs |= fatfs::FileAttributes::SYSTEM,
            'H' | 'h' => attrs |= fatfs::FileAttributes::HIDDEN,
            'R' | 'r' => attrs |= fatfs::FileAttributes::READ_ONLY,
            _ => return Err(FwupError::Validation("fat_attrib only supports R, H, and S attributes".into())),
        }
    }
    file.set_attributes(attrs);
    Ok(())
}

/// Sets the volume label.
pub fn setlabel(cache: &BlockCache, block_offset: u64, label: &str) -> Result<()> {
    let fs = mount(cache, block_offset)?;
    fs.set_volume_label(label).map_err(|e| FwupError::Fat(e.to_string()))
}

/// Returns whether `path` exists on the volume.
pub fn exists(cache: &BlockCache, block_offset: u64, path: &str) -> Result<bool> {
    let fs = mount(cache, block_offset)?;
    let (parents, name) = split_path(path);
    let Ok(parent) = open_dir(&fs, &parents, false) else {
        return Ok(false);
    };
    if name.is_empty() {
        return Ok(true);
    }
    Ok(parent.open_file(name).is_ok() || parent.open_dir(name).is_ok())
}

/// Compares the file at `path` against `expected` contents byte for
/// byte, used to skip no-op writes when told to.
pub fn file_matches(cache: &BlockCache, block_offset: u64, path: &str, expected: &[u8]) -> Result<bool> {
    let fs = mount(cache, block_offset)?;
    let (parents, name) = split_path(path);
    let Ok(parent) = open_dir(&fs, &parents, false) else {
        return Ok(false);
    };
    let Ok(mut file) = parent.open_file(name) else {
        return Ok(false);
    };
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).map_err(|e| FwupError::Fat(e.to_string()))?;
    Ok(buf == expected)
}

/// Writes `data` at byte `offset` within `path`, growing the file as
/// needed. Used by `fat_write` to stream a resource's sparse chunks in.
pub fn pwrite(cache: &BlockCache, block_offset: u64, path: &str, offset: u64, data: &[u8]) -> Result<()> {
    let fs = mount(cache, block_offset)?;
    let (parents, name) = split_path(path);
    let parent = open_dir(&fs, &parents, true)?;
    let mut file = parent.create_file(name).map_err(|e| FwupError::Fat(e.to_string()))?;
    file.seek(fatfs::SeekFrom::Start(offset)).map_err(|e| FwupError::Fat(e.to_string()))?;
    file.write_all(data).map_err(|e| FwupError::Fat(e.to_string()))?;
    file.flush().map_err(|e| FwupError::Fat(e.to_string()))?;
    Ok(())
}

/// Zero-fills `path` from its current length up to `final_size`. Used to
/// grow a file that ends in a hole, since writing nothing at the final
/// offset wouldn't otherwise extend it.
pub fn grow_to(cache: &BlockCache, block_offset: u64, path: &str, final_size: u64) -> Result<()> {
    let fs = mount(cache, block_offset)?;
    let (parents, name) = split_path(path);
    let parent = open_dir(&fs, &parents, true)?;
    let mut file = parent.create_file(name).map_err(|e| FwupError::Fat(e.to_string()))?;
    let current_len = file.seek(fatfs::SeekFrom::End(0)).map_err(|e| FwupError::Fat(e.to_string()))?;
    if final_size > current_len {
        let zeros = vec![0u8; (final_size - current_len) as usize];
        file.write_all(&zeros).map_err(|e| FwupError::Fat(e.to_string()))?;
    }
    file.flush().map_err(|e| FwupError::Fat(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::fat::format::mkfs_fat32;
    use std::io::Cursor;

    fn fresh_volume() -> BlockCache {
        let cursor: Box<dyn crate::cache::BlockDevice> =
            Box::new(Cursor::new(vec![0u8; 64 * 1024 * 1024]));
        let cache = BlockCache::new(cursor, CacheConfig::default());
        mkfs_fat32(&cache, 0, 131072, Some("DATA")).unwrap();
        cache
    }

    #[test]
    fn write_then_read_back() {
        let cache = fresh_volume();
        write_at(&cache, 0, "/boot/zImage", b"hello world").unwrap();
        assert!(file_matches(&cache, 0, "/boot/zImage", b"hello world").unwrap());
        assert!(exists(&cache, 0, "/boot").unwrap());
    }

    #[test]
    fn mv_and_rm_roundtrip() {
        let cache = fresh_volume();
        write_at(&cache, 0, "a.txt", b"data").unwrap();
        mv(&cache, 0, "a.txt", "b.txt", false).unwrap();
        assert!(!exists(&cache, 0, "a.txt").unwrap());
        assert!(exists(&cache, 0, "b.txt").unwrap());
        rm(&cache, 0, "b.txt", true).unwrap();
        assert!(!exists(&cache, 0, "b.txt").unwrap());
    }

    #[test]
    fn rm_without_must_exist_is_a_noop() {
        let cache = fresh_volume();
        assert!(rm(&cache, 0, "missing.txt", false).is_ok());
        assert!(rm(&cache, 0, "missing.txt", true).is_err());
    }
}

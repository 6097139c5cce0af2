use crate::cache::BlockCache;
use crate::errors::{FwupError, Result};
use crate::types::BLOCK_SIZE;

const RESERVED_SECTORS: u32 = 32;
const NUM_FATS: u32 = 2;
const ROOT_CLUSTER: u32 = 2;

fn sectors_per_cluster_for(total_sectors: u32) -> u8 {
    // Matches the clusters-per-volume-size table Microsoft's FAT32 spec
    // recommends, biased towards 4 KiB clusters for anything but very
    // small volumes.
    match total_sectors {
        0..=66_600 => 1,
        66_601..=532_480 => 1,
        532_481..=16_777_216 => 8,
        16_777_217..=33_554_432 => 16,
        _ => 32,
    }
}

fn fat_size_32(total_sectors: u32, sectors_per_cluster: u8) -> u32 {
    let tmp1 = total_sectors - RESERVED_SECTORS as u32;
    let tmp2 = (256 * sectors_per_cluster as u64 + NUM_FATS as u64) / 2;
    ((tmp1 as u64 + tmp2 - 1) / tmp2) as u32
}

/// Formats a fresh FAT32 filesystem into `[block_offset, block_offset +
/// block_count)`. Only FAT32 is implemented: small partitions that would
/// traditionally get FAT12/16 are out of scope here.
pub fn mkfs_fat32(
    cache: &BlockCache,
    block_offset: u64,
    block_count: u64,
    volume_label: Option<&str>,
) -> Result<()> {
    let total_sectors = u32::try_from(block_count)
        .map_err(|_| FwupError::Fat("FAT32 volume too large".into()))?;
    if total_sectors < RESERVED_SECTORS + 2 * 32 {
        return Err(FwupError::Fat("volume too small for FAT32".into()));
    }

    let sectors_per_cluster = sectors_per_cluster_for(total_sectors);
    let fat_size = fat_size_32(total_sectors, sectors_per_cluster);

    let mut boot = [0u8; 512];
    boot[0..3].copy_from_slice(&[0xeb, 0x58, 0x90]);
    boot[3..11].copy_from_slice(b"MSWIN4.1");
    boot[11..13].copy_from_slice(&(BLOCK_SIZE as u16).to_le_bytes());
    boot[13] = sectors_per_cluster;
    boot[14..16].copy_from_slice(&(RESERVED_SECTORS as u16).to_le_bytes());
    boot[16] = NUM_FATS as u8;
    boot[17..19].copy_from_slice(&0u16.to_le_bytes()); // root entries, 0 for FAT32
    boot[19..21].copy_from_slice(&0u16.to_le_bytes()); // total sectors16, 0 -> use 32-bit field
    boot[21] = 0xf8; // media descriptor, fixed disk
    boot[22..24].copy_from_slice(&0u16.to_le_bytes()); // fat_size_16
    boot[24..26].copy_from_slice(&63u16.to_le_bytes()); // sectors per track
    boot[26..28].copy_from_slice(&255u16.to_le_bytes()); // number of heads
    boot[28..32].copy_from_slice(&0u32.to_le_bytes()); // hidden sectors
    boot[32..36].copy_from_slice(&total_sectors.to_le_bytes());
    boot[36..40].copy_from_slice(&fat_size.to_le_bytes());
    boot[40..42].copy_from_slice(&0u16.to_le_bytes()); // ext flags
    boot[42..44].copy_from_slice(&0u16.to_le_bytes()); // fs version
    boot[44..48].copy_from_slice(&ROOT_CLUSTER.to_le_bytes());
    boot[48..50].copy_from_slice(&1u16.to_le_bytes()); // fs info sector
    boot[50..52].copy_from_slice(&6u16.to_le_bytes()); // backup boot sector
    boot[64] = 0x80; // drive number
    boot[66] = 0x29; // extended boot signature
    let volume_id: u32 = 0x1234_5678;
    boot[67..71].copy_from_slice(&volume_id.to_le_bytes());
    let mut label_bytes = [b' '; 11];
    if let Some(label) = volume_label {
        let bytes = label.as_bytes();
        let n = bytes.len().min(11);
        label_bytes[..n].copy_from_slice(&bytes[..n]);
    } else {
        label_bytes.copy_from_slice(b"NO NAME    ");
    }
    boot[71..82].copy_from_slice(&label_bytes);
    boot[82..90].copy_from_slice(b"FAT32   ");
    boot[510] = 0x55;
    boot[511] = 0xaa;

    let mut fsinfo = [0u8; 512];
    fsinfo[0..4].copy_from_slice(&0x4161_5252u32.to_le_bytes());
    fsinfo[484..488].copy_from_slice(&0x6141_7272u32.to_le_bytes());
    fsinfo[488..492].copy_from_slice(&0xffff_ffffu32.to_le_bytes()); // free count unknown
    fsinfo[492..496].copy_from_slice(&0xffff_ffffu32.to_le_bytes()); // next free unknown
    fsinfo[508] = 0x55;
    fsinfo[509] = 0xaa;

    let base = block_offset * BLOCK_SIZE;
    cache.pwrite(&boot, base, false)?;
    cache.pwrite(&fsinfo, base + BLOCK_SIZE, false)?;
    // Backup boot sector + FSInfo at sector 6/7.
    cache.pwrite(&boot, base + 6 * BLOCK_SIZE, false)?;
    cache.pwrite(&fsinfo, base + 7 * BLOCK_SIZE, false)?;

    // FAT tables: cluster 0/1 reserved entries, root dir cluster marked
    // end-of-chain, rest zeroed (free).
    let fat_bytes = fat_size as u64 * BLOCK_SIZE;
    let mut fat_head = [0u8; 12];
    fat_head[0..4].copy_from_slice(&0x0fff_fff8u32.to_le_bytes());
    fat_head[4..8].copy_from_slice(&0x0fff_ffffu32.to_le_bytes());
    fat_head[8..12].copy_from_slice(&0x0fff_ffffu32.to_le_bytes()); // root dir EOC

    for fat_index in 0..NUM_FATS as u64 {
        let fat_start = base + (RESERVED_SECTORS as u64 + fat_index * fat_size as u64) * BLOCK_SIZE;
        cache.pwrite(&fat_head, fat_start, true)?;
        let zero_block = vec![0u8; BLOCK_SIZE as usize];
        let mut written = 12u64;
        while written < fat_bytes {
            let chunk = (fat_bytes - written).min(BLOCK_SIZE);
            cache.pwrite(&zero_block[..chunk as usize], fat_start + written, false)?;
            written += chunk;
        }
    }

    // Root directory: a single, empty cluster.
    let data_start = base
        + (RESERVED_SECTORS as u64 + NUM_FATS as u64 * fat_size as u64) * BLOCK_SIZE;
    let cluster_bytes = sectors_per_cluster as u64 * BLOCK_SIZE;
    let zero_cluster = vec![0u8; cluster_bytes as usize];
    cache.pwrite(&zero_cluster, data_start, false)?;

    cache.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use std::io::Cursor;

    #[test]
    fn formats_without_error() {
        let cursor: Box<dyn crate::cache::BlockDevice> = Box::new(Cursor::new(vec![0u8; 64 * 1024 * 1024]));
        let cache = BlockCache::new(cursor, CacheConfig::default());
        mkfs_fat32(&cache, 0, 131072, Some("DATA")).unwrap();

        let mut boot = [0u8; 512];
        cache.pread(&mut boot, 0).unwrap();
        assert_eq!(&boot[510..512], &[0x55, 0xaa]);
        assert_eq!(&boot[82..90], b"FAT32   ");
    }
}

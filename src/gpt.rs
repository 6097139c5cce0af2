use crate::errors::{FwupError, Result};
use crate::types::BLOCK_SIZE;
use uuid::Uuid;

pub const GPT_MAX_PARTITIONS: usize = 16;
pub const GPT_PARTITION_TABLE_BLOCKS: u64 = 32;
pub const GPT_SIZE_BLOCKS: u64 = 1 + GPT_PARTITION_TABLE_BLOCKS;
const GPT_PARTITION_SIZE: usize = 128;
const HEADER_SIZE: usize = 92;

#[derive(Debug, Clone)]
pub struct GptPartition {
    pub valid: bool,
    pub block_offset: u32,
    pub block_count: u32,
    pub expand_flag: bool,
    pub flags: u64,
    pub partition_type: Uuid,
    pub guid: Uuid,
    pub name: String,
}

impl Default for GptPartition {
    fn default() -> Self {
        Self {
            valid: false,
            block_offset: 0,
            block_count: 0,
            expand_flag: false,
            flags: 0,
            partition_type: Uuid::nil(),
            guid: Uuid::nil(),
            name: String::new(),
        }
    }
}

pub struct GptHeader {
    pub current_lba: u64,
    pub backup_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: Uuid,
    pub partition_lba: u64,
    pub num_partitions: u32,
    pub partition_crc: u32,
}

fn name_to_utf16le(name: &str, out: &mut [u8; 72]) {
    let mut i = 0;
    for unit in name.encode_utf16() {
        if i + 2 > 72 {
            break;
        }
        out[i..i + 2].copy_from_slice(&unit.to_le_bytes());
        i += 2;
    }
}

fn utf16le_to_name(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// GUIDs in GPT on-disk structures are mixed-endian: the first three
/// fields are little-endian, the last two big-endian, as in the classic
/// Microsoft GUID wire format.
fn uuid_to_gpt_bytes(u: &Uuid) -> [u8; 16] {
    let f = u.as_fields();
    let mut out = [0u8; 16];
    out[0..4].copy_from_slice(&f.0.to_le_bytes());
    out[4..6].copy_from_slice(&f.1.to_le_bytes());
    out[6..8].copy_from_slice(&f.2.to_le_bytes());
    out[8..16].copy_from_slice(f.3);
    out
}

fn gpt_bytes_to_uuid(bytes: &[u8]) -> Uuid {
    let d1 = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let d2 = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
    let d3 = u16::from_le_bytes(bytes[6..8].try_into().unwrap());
    let mut d4 = [0u8; 8];
    d4.copy_from_slice(&bytes[8..16]);
    Uuid::from_fields(d1, d2, d3, &d4)
}

fn create_protective_mbr(num_blocks: u32) -> [u8; 512] {
    let mut out = [0u8; 512];
    out[446] = 0;
    out[446 + 2] = 0x02;
    out[446 + 4] = 0xee;
    out[446 + 5] = 0xff;
    out[446 + 6] = 0xff;
    out[446 + 7] = 0xff;
    out[446 + 8..446 + 12].copy_from_slice(&1u32.to_le_bytes());
    out[446 + 12..446 + 16].copy_from_slice(&(num_blocks - 1).to_le_bytes());
    out[510] = 0x55;
    out[511] = 0xaa;
    out
}

fn write_partition_entry(p: &GptPartition, num_blocks: u32, out: &mut [u8]) {
    if !p.valid {
        return;
    }
    let mut block_count = p.block_count;
    if p.expand_flag && num_blocks as u64 > (p.block_offset as u64 + p.block_count as u64 + GPT_SIZE_BLOCKS) {
        block_count = (num_blocks as u64 - GPT_SIZE_BLOCKS - 1 - p.block_offset as u64) as u32;
    }
    let first_lba = p.block_offset as u64;
    let last_lba = first_lba + block_count as u64 - 1;

    out[0..16].copy_from_slice(&uuid_to_gpt_bytes(&p.partition_type));
    out[16..32].copy_from_slice(&uuid_to_gpt_bytes(&p.guid));
    out[32..40].copy_from_slice(&first_lba.to_le_bytes());
    out[40..48].copy_from_slice(&last_lba.to_le_bytes());
    out[48..56].copy_from_slice(&p.flags.to_le_bytes());
    let mut name_bytes = [0u8; 72];
    name_to_utf16le(&p.name, &mut name_bytes);
    out[56..128].copy_from_slice(&name_bytes);
}

/// Encodes the partition table (32 blocks worth of 128-byte entries).
pub fn create_partition_table(partitions: &[GptPartition], num_blocks: u32) -> Vec<u8> {
    let mut out = vec![0u8; GPT_PARTITION_TABLE_BLOCKS as usize * BLOCK_SIZE as usize];
    for (i, p) in partitions.iter().enumerate().take(GPT_MAX_PARTITIONS) {
        write_partition_entry(p, num_blocks, &mut out[i * GPT_PARTITION_SIZE..(i + 1) * GPT_PARTITION_SIZE]);
    }
    out
}

fn create_gpt_header(header: &GptHeader) -> [u8; 512] {
    let mut out = [0u8; 512];
    out[0..8].copy_from_slice(b"EFI PART");
    out[8..12].copy_from_slice(&0x0001_0000u32.to_le_bytes());
    out[12..16].copy_from_slice(&(HEADER_SIZE as u32).to_le_bytes());
    out[24..32].copy_from_slice(&header.current_lba.to_le_bytes());
    out[32..40].copy_from_slice(&header.backup_lba.to_le_bytes());
    out[40..48].copy_from_slice(&header.first_usable_lba.to_le_bytes());
    out[48..56].copy_from_slice(&header.last_usable_lba.to_le_bytes());
    out[56..72].copy_from_slice(&uuid_to_gpt_bytes(&header.disk_guid));
    out[72..80].copy_from_slice(&header.partition_lba.to_le_bytes());
    out[80..84].copy_from_slice(&header.num_partitions.to_le_bytes());
    out[84..88].copy_from_slice(&(GPT_PARTITION_SIZE as u32).to_le_bytes());
    out[88..92].copy_from_slice(&header.partition_crc.to_le_bytes());

    let crc = crc32fast::hash(&out[0..HEADER_SIZE]);
    out[16..20].copy_from_slice(&crc.to_le_bytes());
    out
}

/// Builds the protective MBR, primary GPT header+table, and secondary
/// (backup) GPT header+table for a disk of `num_blocks` 512-byte blocks.
pub fn create(
    partitions: &[GptPartition],
    disk_guid: Uuid,
    num_blocks: u32,
) -> Result<(Vec<u8>, Vec<u8>)> {
    if partitions.len() > GPT_MAX_PARTITIONS {
        return Err(FwupError::Validation("too many GPT partitions (max 16)".into()));
    }
    verify_no_overlap(partitions)?;

    let table = create_partition_table(partitions, num_blocks);
    let partition_crc = crc32fast::hash(&table);

    let last_usable = num_blocks as u64 - GPT_SIZE_BLOCKS - 1;

    let primary_header = GptHeader {
        current_lba: 1,
        backup_lba: num_blocks as u64 - 1,
        first_usable_lba: GPT_SIZE_BLOCKS,
        last_usable_lba: last_usable,
        disk_guid,
        partition_lba: 2,
        num_partitions: GPT_MAX_PARTITIONS as u32,
        partition_crc,
    };

    let mut primary = Vec::with_capacity(512 + table.len());
    primary.extend_from_slice(&create_protective_mbr(num_blocks));
    primary.extend_from_slice(&create_gpt_header(&primary_header));
    primary.extend_from_slice(&table);

    let secondary_header = GptHeader {
        current_lba: num_blocks as u64 - 1,
        backup_lba: 1,
        first_usable_lba: GPT_SIZE_BLOCKS,
        last_usable_lba: last_usable,
        disk_guid,
        partition_lba: num_blocks as u64 - GPT_SIZE_BLOCKS,
        num_partitions: GPT_MAX_PARTITIONS as u32,
        partition_crc,
    };
    let mut secondary = Vec::with_capacity(table.len() + 512);
    secondary.extend_from_slice(&table);
    secondary.extend_from_slice(&create_gpt_header(&secondary_header));

    Ok((primary, secondary))
}

pub fn verify_no_overlap(partitions: &[GptPartition]) -> Result<()> {
    for i in 0..partitions.len() {
        if !partitions[i].valid {
            continue;
        }
        let a_left = partitions[i].block_offset as u64;
        let a_right = a_left + partitions[i].block_count as u64;
        for (j, other) in partitions.iter().enumerate().skip(i + 1) {
            if !other.valid {
                continue;
            }
            let b_left = other.block_offset as u64;
            let b_right = b_left + other.block_count as u64;
            if a_left < b_right && b_left < a_right {
                return Err(FwupError::Validation(format!("GPT partition {i} overlaps partition {j}")));
            }
        }
    }
    Ok(())
}

/// Decodes the partition entries out of a raw GPT partition table region.
pub fn decode_partitions(table: &[u8]) -> Vec<GptPartition> {
    let mut partitions = Vec::new();
    for chunk in table.chunks_exact(GPT_PARTITION_SIZE) {
        let partition_type = gpt_bytes_to_uuid(&chunk[0..16]);
        if partition_type.is_nil() {
            continue;
        }
        let guid = gpt_bytes_to_uuid(&chunk[16..32]);
        let first_lba = u64::from_le_bytes(chunk[32..40].try_into().unwrap());
        let last_lba = u64::from_le_bytes(chunk[40..48].try_into().unwrap());
        let flags = u64::from_le_bytes(chunk[48..56].try_into().unwrap());
        let name = utf16le_to_name(&chunk[56..128]);
        partitions.push(GptPartition {
            valid: true,
            block_offset: first_lba as u32,
            block_count: (last_lba - first_lba + 1) as u32,
            expand_flag: false,
            flags,
            partition_type,
            guid,
            name,
        });
    }
    partitions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_partition_table() {
        let partitions = vec![GptPartition {
            valid: true,
            block_offset: 34,
            block_count: 1000,
            expand_flag: false,
            flags: 0,
            partition_type: Uuid::parse_str("0fc63daf-8483-4772-8e79-3d69d8477de4").unwrap(),
            guid: Uuid::new_v4(),
            name: "rootfs".to_string(),
        }];
        let (primary, _secondary) = create(&partitions, Uuid::new_v4(), 2048).unwrap();
        let table = &primary[1024..1024 + GPT_PARTITION_TABLE_BLOCKS as usize * BLOCK_SIZE as usize];
        let decoded = decode_partitions(table);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].block_offset, 34);
        assert_eq!(decoded[0].name, "rootfs");
    }

    #[test]
    fn header_has_valid_signature() {
        let partitions = vec![];
        let (primary, _) = create(&partitions, Uuid::new_v4(), 2048).unwrap();
        assert_eq!(&primary[512..520], b"EFI PART");
    }
}

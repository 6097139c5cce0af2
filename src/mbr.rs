use crate::errors::{FwupError, Result};

const SECTORS_PER_HEAD: u32 = 63;
const HEADS_PER_CYLINDER: u32 = 255;

/// Slots 0-3 are the classic primary partitions; slot 3 may instead hold
/// an extended partition (type `0x05`/`0x0f`) whose logical partitions
/// occupy slots 4-15, each described by its own EBR sector.
pub const MBR_MAX_PARTITIONS: usize = 16;
pub const MBR_MAX_PRIMARY_PARTITIONS: usize = 4;

fn is_extended_type(partition_type: u8) -> bool {
    partition_type == 0x05 || partition_type == 0x0f
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MbrPartition {
    pub boot_flag: bool,
    pub partition_type: u8,
    pub block_offset: u32,
    pub block_count: u32,
    pub expand_flag: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Osii {
    pub os_minor: u16,
    pub os_major: u16,
    pub start_block_offset: u32,
    pub ddr_load_address: u32,
    pub entry_point: u32,
    pub image_size: u32,
    pub attribute: u8,
}

#[derive(Debug, Clone)]
pub struct OsipHeader {
    pub minor: u8,
    pub major: u8,
    pub descriptors: Vec<Osii>,
}

/// Mutually exclusive: a raw x86 bootstrap or an OSIP header, never both.
pub enum BootRegion {
    None,
    Bootstrap([u8; 440]),
    Osip(OsipHeader),
}

fn lba_to_chs(lba: u32, out: &mut [u8]) {
    if lba <= SECTORS_PER_HEAD * HEADS_PER_CYLINDER * 0x3ff {
        let cylinder = (lba / (SECTORS_PER_HEAD * HEADS_PER_CYLINDER)) as u16;
        let head = ((lba / SECTORS_PER_HEAD) % HEADS_PER_CYLINDER) as u8;
        let sector = ((lba % SECTORS_PER_HEAD) + 1) as u8;
        out[0] = head;
        out[1] = (sector & 0x3f) | (((cylinder >> 8) as u8) << 6);
        out[2] = (cylinder & 0xff) as u8;
    } else {
        // Unrepresentable in CHS: use the standard "overflow" marker.
        out[0] = 0xfe;
        out[1] = 0xff;
        out[2] = 0xff;
    }
}

fn write_partition_entry(p: &MbrPartition, out: &mut [u8]) {
    out[0] = if p.boot_flag { 0x80 } else { 0x00 };
    if p.block_count > 0 {
        lba_to_chs(p.block_offset, &mut out[1..4]);
        out[4] = p.partition_type;
        lba_to_chs(p.block_offset + p.block_count - 1, &mut out[5..8]);
    } else {
        out[4] = 0;
    }
    out[8..12].copy_from_slice(&p.block_offset.to_le_bytes());
    out[12..16].copy_from_slice(&p.block_count.to_le_bytes());
}

fn read_partition_entry(input: &[u8]) -> MbrPartition {
    MbrPartition {
        boot_flag: input[0] & 0x80 != 0,
        partition_type: input[4],
        block_offset: u32::from_le_bytes(input[8..12].try_into().unwrap()),
        block_count: u32::from_le_bytes(input[12..16].try_into().unwrap()),
        expand_flag: false,
    }
}

fn write_osip(osip: &OsipHeader, out: &mut [u8]) -> Result<()> {
    if osip.descriptors.len() > 16 {
        return Err(FwupError::Validation("too many OSII descriptors (max 16)".into()));
    }
    out[0..4].copy_from_slice(b"$OS$");
    out[4] = osip.minor;
    out[5] = osip.major;
    out[6] = osip.descriptors.len() as u8; // num_pointers
    out[7] = osip.descriptors.len() as u8; // num_images

    for (i, d) in osip.descriptors.iter().enumerate() {
        let off = 32 + i * 24;
        let entry = &mut out[off..off + 24];
        entry[0..2].copy_from_slice(&d.os_minor.to_le_bytes());
        entry[2..4].copy_from_slice(&d.os_major.to_le_bytes());
        entry[4..8].copy_from_slice(&d.start_block_offset.to_le_bytes());
        entry[8..12].copy_from_slice(&d.ddr_load_address.to_le_bytes());
        entry[12..16].copy_from_slice(&d.entry_point.to_le_bytes());
        entry[16..20].copy_from_slice(&d.image_size.to_le_bytes());
        entry[20] = d.attribute;
    }

    let sum: u8 = out[0..32].iter().fold(0u8, |acc, b| acc ^ b);
    out[31] = sum;
    Ok(())
}

/// Builds a single 512-byte MBR sector.
pub fn create(
    partitions: &[MbrPartition; 4],
    boot: &BootRegion,
    signature: u32,
) -> Result<[u8; 512]> {
    let mut output = [0u8; 512];

    match boot {
        BootRegion::None => {}
        BootRegion::Bootstrap(code) => output[0..440].copy_from_slice(code),
        BootRegion::Osip(osip) => write_osip(osip, &mut output[0..440])?,
    }

    output[440..444].copy_from_slice(&signature.to_le_bytes());

    for (i, p) in partitions.iter().enumerate() {
        let off = 446 + i * 16;
        write_partition_entry(p, &mut output[off..off + 16]);
    }

    output[510] = 0x55;
    output[511] = 0xaa;
    Ok(output)
}

/// Decodes the four primary partition entries out of a 512-byte MBR.
pub fn decode(input: &[u8; 512]) -> Result<[MbrPartition; 4]> {
    if input[510] != 0x55 || input[511] != 0xaa {
        return Err(FwupError::Validation("MBR signature missing".into()));
    }

    let mut partitions = [MbrPartition::default(); 4];
    for (i, p) in partitions.iter_mut().enumerate() {
        let off = 446 + i * 16;
        *p = read_partition_entry(&input[off..off + 16]);
    }
    Ok(partitions)
}

/// Checks that partitions don't overlap each other.
pub fn verify_no_overlap(partitions: &[MbrPartition; 4]) -> Result<()> {
    for i in 0..4 {
        if partitions[i].block_count == 0 {
            continue;
        }
        let a_start = partitions[i].block_offset as u64;
        let a_end = a_start + partitions[i].block_count as u64;
        for (j, other) in partitions.iter().enumerate().skip(i + 1) {
            if other.block_count == 0 {
                continue;
            }
            let b_start = other.block_offset as u64;
            let b_end = b_start + other.block_count as u64;
            if a_start < b_end && b_start < a_end {
                return Err(FwupError::Validation(format!(
                    "partition {i} overlaps partition {j}"
                )));
            }
        }
    }
    Ok(())
}

/// Grows every `expand_flag` partition's `block_count` up to `num_blocks`,
/// then clears the flag. `num_blocks` is first raised to whatever extent
/// the table already requires, so passing 0 (device size unknown) never
/// shrinks a partition below what's configured.
pub fn expand_partitions(partitions: &mut [MbrPartition; MBR_MAX_PARTITIONS], num_blocks: u32) {
    let mut num_blocks = num_blocks;
    for p in partitions.iter() {
        num_blocks = num_blocks.max(p.block_offset.saturating_add(p.block_count));
    }
    for p in partitions.iter_mut() {
        if p.expand_flag && num_blocks > p.block_offset.saturating_add(p.block_count) {
            p.block_count = num_blocks - p.block_offset;
        }
        p.expand_flag = false;
    }
}

/// Absolute block offset of each logical partition's EBR sector (0 if the
/// slot isn't a logical partition). EBRs are packed one block apart
/// starting at the extended partition's own `block_offset`, same as the
/// original record-offset assignment this is ported from.
fn assign_record_offsets(partitions: &[MbrPartition; MBR_MAX_PARTITIONS]) -> [u32; MBR_MAX_PARTITIONS] {
    let mut record_offsets = [0u32; MBR_MAX_PARTITIONS];
    let mut offset = partitions[3].block_offset;
    for (i, p) in partitions.iter().enumerate().skip(MBR_MAX_PRIMARY_PARTITIONS) {
        if p.partition_type == 0 {
            break;
        }
        record_offsets[i] = offset;
        offset += 1;
    }
    record_offsets
}

/// Checks that at most one partition has `expand_flag` set, and that it's
/// the last used partition in slot order. Must run before
/// [`expand_partitions`] clears every flag. The extended partition itself
/// (slot 3, type `0x05`/`0x0f`) is exempt: its `expand_flag` is implicit in
/// the type and doesn't block the logical partitions that follow it.
pub fn check_expand_is_last(partitions: &[MbrPartition; MBR_MAX_PARTITIONS]) -> Result<()> {
    let mut expanding = false;
    for (i, p) in partitions.iter().enumerate() {
        if p.partition_type == 0 {
            continue;
        }
        if p.block_count == 0 && !p.expand_flag {
            continue;
        }
        if expanding {
            return Err(FwupError::Validation(
                "a partition can't be specified after the one with expand=true".into(),
            ));
        }
        if p.expand_flag && i != 3 && !is_extended_type(p.partition_type) {
            expanding = true;
        }
    }
    Ok(())
}

/// Checks the full 16-slot table for overlap, including EBR sectors.
pub fn verify_extended(partitions: &[MbrPartition; MBR_MAX_PARTITIONS]) -> Result<()> {
    let record_offsets = assign_record_offsets(partitions);

    for i in 0..MBR_MAX_PARTITIONS {
        let p = &partitions[i];
        if p.partition_type == 0 {
            continue;
        }
        let left = p.block_offset as u64;
        let right = left + p.block_count as u64;
        if left == right {
            continue;
        }

        for j in (i + 1)..MBR_MAX_PARTITIONS {
            let q = &partitions[j];
            if q.partition_type == 0 {
                continue;
            }
            let qleft = q.block_offset as u64;
            let qright = qleft + q.block_count as u64;
            if qleft == qright {
                continue;
            }

            let overlap_required = i == 3 && is_extended_type(p.partition_type);
            let partitions_overlap = !(left >= qright || right <= qleft);
            let ebr_i_overlaps = record_offsets[i] > 0
                && (record_offsets[i] as u64) >= qleft
                && (record_offsets[i] as u64) < qright;
            let ebr_j_overlaps = record_offsets[j] > 0
                && (record_offsets[j] as u64) >= left
                && (record_offsets[j] as u64) < right;

            if partitions_overlap != overlap_required {
                return Err(FwupError::Validation(format!(
                    "partition {i} (blocks {left} to {right}) and partition {j} (blocks {qleft} to {qright}) overlap"
                )));
            }
            if ebr_j_overlaps != overlap_required {
                return Err(FwupError::Validation(format!(
                    "partition {i} (blocks {left} to {right}) overlaps the EBR at {} for partition {j}",
                    record_offsets[j]
                )));
            }
            if ebr_i_overlaps {
                return Err(FwupError::Validation(format!(
                    "partition {j} (blocks {qleft} to {qright}) overlaps the EBR at {} for partition {i}",
                    record_offsets[i]
                )));
            }
        }
    }
    Ok(())
}

/// Builds the primary MBR sector plus one EBR sector per logical
/// partition in slots 4-15, as `(absolute_block_offset, sector)` pairs
/// ready to `pwrite`. `num_blocks` is the destination's total size in
/// blocks, used to grow any `expand_flag` partition; pass 0 if unknown.
pub fn create_with_logical(
    partitions: &[MbrPartition; MBR_MAX_PARTITIONS],
    boot: &BootRegion,
    signature: u32,
    num_blocks: u32,
) -> Result<Vec<(u64, [u8; 512])>> {
    check_expand_is_last(partitions)?;
    let mut expanded = *partitions;
    expand_partitions(&mut expanded, num_blocks);
    verify_extended(&expanded)?;

    let record_offsets = assign_record_offsets(&expanded);
    let num_logical =
        record_offsets[MBR_MAX_PRIMARY_PARTITIONS..].iter().filter(|&&o| o != 0).count();

    let mut primary = [MbrPartition::default(); MBR_MAX_PRIMARY_PARTITIONS];
    primary.copy_from_slice(&expanded[0..MBR_MAX_PRIMARY_PARTITIONS]);
    let sector = create(&primary, boot, signature)?;

    let mut out = vec![(0u64, sector)];

    for slot_ix in 0..num_logical {
        let logical_ix = MBR_MAX_PRIMARY_PARTITIONS + slot_ix;
        let ebr_offset = record_offsets[logical_ix] as u64;
        let mut ebr = [0u8; 512];

        let logical = MbrPartition {
            boot_flag: false,
            expand_flag: false,
            partition_type: expanded[logical_ix].partition_type,
            block_offset: expanded[logical_ix].block_offset - ebr_offset as u32,
            block_count: expanded[logical_ix].block_count,
        };
        write_partition_entry(&logical, &mut ebr[446..462]);

        if slot_ix + 1 < num_logical {
            let next = MbrPartition {
                boot_flag: false,
                expand_flag: false,
                partition_type: 0x0f,
                block_offset: (slot_ix + 1) as u32,
                block_count: 1,
            };
            write_partition_entry(&next, &mut ebr[462..478]);
        }

        ebr[510] = 0x55;
        ebr[511] = 0xaa;
        out.push((ebr_offset, ebr));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_partition_table() {
        let partitions = [
            MbrPartition { boot_flag: true, partition_type: 0x0c, block_offset: 63, block_count: 1000, ..Default::default() },
            MbrPartition { boot_flag: false, partition_type: 0x83, block_offset: 1063, block_count: 5000, ..Default::default() },
            MbrPartition::default(),
            MbrPartition::default(),
        ];
        let sector = create(&partitions, &BootRegion::None, 0xdeadbeef).unwrap();
        let decoded = decode(&sector).unwrap();
        assert_eq!(decoded[0].block_offset, 63);
        assert_eq!(decoded[0].block_count, 1000);
        assert_eq!(decoded[0].partition_type, 0x0c);
        assert!(decoded[0].boot_flag);
        assert_eq!(decoded[1].partition_type, 0x83);
    }

    #[test]
    fn rejects_missing_signature() {
        let sector = [0u8; 512];
        assert!(decode(&sector).is_err());
    }

    #[test]
    fn detects_overlap() {
        let partitions = [
            MbrPartition { boot_flag: false, partition_type: 0x83, block_offset: 0, block_count: 100, ..Default::default() },
            MbrPartition { boot_flag: false, partition_type: 0x83, block_offset: 50, block_count: 100, ..Default::default() },
            MbrPartition::default(),
            MbrPartition::default(),
        ];
        assert!(verify_no_overlap(&partitions).is_err());
    }

    #[test]
    fn expand_grows_block_count_to_device_size() {
        let mut partitions = [MbrPartition::default(); MBR_MAX_PARTITIONS];
        partitions[0] = MbrPartition {
            block_offset: 2048,
            block_count: 1,
            partition_type: 0x83,
            expand_flag: true,
            ..Default::default()
        };
        expand_partitions(&mut partitions, 2_000_000);
        assert_eq!(partitions[0].block_count, 1_997_952);
        assert!(!partitions[0].expand_flag);
    }

    #[test]
    fn logical_partitions_get_their_own_ebr_chain() {
        let mut partitions = [MbrPartition::default(); MBR_MAX_PARTITIONS];
        partitions[0] = MbrPartition { block_offset: 63, block_count: 1000, partition_type: 0x83, ..Default::default() };
        partitions[3] = MbrPartition { block_offset: 2000, block_count: 8000, partition_type: 0x0f, ..Default::default() };
        partitions[4] = MbrPartition { block_offset: 2001, block_count: 3000, partition_type: 0x83, ..Default::default() };
        partitions[5] = MbrPartition { block_offset: 5001, block_count: 3000, partition_type: 0x83, ..Default::default() };

        let sectors = create_with_logical(&partitions, &BootRegion::None, 0, 0).unwrap();
        assert_eq!(sectors.len(), 3);
        assert_eq!(sectors[0].0, 0);
        assert_eq!(sectors[1].0, 2000);
        assert_eq!(sectors[2].0, 2001);

        let first_ebr = &sectors[1].1;
        assert_eq!(first_ebr[510], 0x55);
        assert_eq!(first_ebr[511], 0xaa);
        let logical = read_partition_entry(&first_ebr[446..462]);
        assert_eq!(logical.block_offset, 1);
        assert_eq!(logical.block_count, 3000);
        assert_eq!(logical.partition_type, 0x83);
        let next = read_partition_entry(&first_ebr[462..478]);
        assert_eq!(next.partition_type, 0x0f);
        assert_eq!(next.block_offset, 1);

        let second_ebr = &sectors[2].1;
        let next = read_partition_entry(&second_ebr[462..478]);
        assert_eq!(next.partition_type, 0);
    }

    #[test]
    fn rejects_expand_before_the_last_used_partition() {
        let mut partitions = [MbrPartition::default(); MBR_MAX_PARTITIONS];
        partitions[0] = MbrPartition { block_offset: 0, block_count: 100, partition_type: 0x83, expand_flag: true, ..Default::default() };
        partitions[1] = MbrPartition { block_offset: 200, block_count: 100, partition_type: 0x83, ..Default::default() };
        assert!(create_with_logical(&partitions, &BootRegion::None, 0, 1000).is_err());
    }
}

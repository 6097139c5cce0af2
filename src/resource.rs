use crate::errors::{FwupError, Result};
use crate::manifest::model::FileResource;
use crate::sparse_file::SparseFileReader;
use blake2::Blake2bMac;
use blake2::digest::{Mac, consts::U32};
use std::io::Read;

type Blake2b256 = Blake2bMac<U32>;

/// Expected data length for progress accounting: holes only count when
/// the destination actually needs zeros written for them (raw/path/pipe
/// writes), not when the underlying write target already reads as zero.
pub fn expected_progress_units(resource: &FileResource, count_holes: bool) -> u64 {
    if count_holes { resource.sparse_map.size() } else { resource.sparse_map.data_size() }
}

/// Streams a resource's archive data through `pwrite_callback`, verifying
/// its BLAKE2b-256 hash as it goes, and invokes `final_hole_callback` once
/// for any trailing hole implied by the sparse map (holes in the middle
/// are the callback's own responsibility via the offsets it's given).
pub fn process_resource<R: Read>(
    resource: &FileResource,
    archive_reader: R,
    mut pwrite_callback: impl FnMut(u64, &[u8]) -> Result<()>,
    mut final_hole_callback: impl FnMut(u64, u64) -> Result<()>,
) -> Result<()> {
    let expected_hash = resource
        .blake2b_256
        .as_deref()
        .ok_or_else(|| FwupError::Validation(format!("invalid blake2b hash for '{}'", resource.name)))?;
    if expected_hash.len() != 64 {
        return Err(FwupError::Validation(format!("invalid blake2b hash for '{}'", resource.name)));
    }

    let mut mac = Blake2b256::new_from_slice(&[]).expect("blake2b accepts an empty key");
    let mut reader = SparseFileReader::new(&resource.sparse_map, archive_reader);

    loop {
        match reader.read_next(65536)? {
            None => break,
            Some((offset, data)) => {
                mac.update(&data);
                pwrite_callback(offset, &data)?;
            }
        }
    }

    let digest = mac.finalize().into_bytes();
    let actual_hash = hex::encode(digest);
    if actual_hash != expected_hash.to_ascii_lowercase() {
        return Err(FwupError::Integrity(format!(
            "'{}' hash mismatch: expected {expected_hash}, got {actual_hash}",
            resource.name
        )));
    }

    let hole_size = resource.sparse_map.ending_hole_size();
    if hole_size > 0 {
        final_hole_callback(hole_size, resource.sparse_map.size())?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::blake2b_256_hex;
    use crate::manifest::model::FileResource;
    use crate::sparse_file::SparseFileMap;

    fn resource_with(data: &[u8], map: SparseFileMap) -> FileResource {
        FileResource {
            name: "r".into(),
            host_paths: vec![],
            skip_holes: true,
            sparse_map: map,
            contents: None,
            blake2b_256: Some(blake2b_256_hex(data)),
            sha256: None,
            assert_size_lte: None,
            assert_size_gte: None,
        }
    }

    #[test]
    fn streams_and_verifies_hash() {
        let data = vec![7u8; 16];
        let map = SparseFileMap::whole(16);
        let resource = resource_with(&data, map);

        let mut written = Vec::new();
        process_resource(&resource, &data[..], |off, buf| {
            written.push((off, buf.to_vec()));
            Ok(())
        }, |_, _| Ok(()))
        .unwrap();

        assert_eq!(written.len(), 1);
        assert_eq!(written[0].1, data);
    }

    #[test]
    fn hash_mismatch_is_rejected() {
        let data = vec![7u8; 16];
        let map = SparseFileMap::whole(16);
        let mut resource = resource_with(&data, map);
        resource.blake2b_256 = Some("0".repeat(64));

        let result = process_resource(&resource, &data[..], |_, _| Ok(()), |_, _| Ok(()));
        assert!(result.is_err());
    }
}

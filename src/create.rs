//! Create pipeline: computes each file-resource's sparse map and
//! BLAKE2b-256 hash, then writes `meta.conf[.ed25519]` and the resource
//! bytes into a zip archive, mirroring `fwup_create.c`'s `fwup_create`.

use crate::crypto;
use crate::errors::{FwupError, Result};
use crate::manifest::model::Manifest;
use crate::manifest::serialize::to_meta_conf;
use crate::sparse_file::SparseFileMap;
use blake2::Blake2bMac;
use blake2::digest::{Mac, consts::U32};
use ed25519_dalek::SigningKey;
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;

type Blake2b256 = Blake2bMac<U32>;

/// Below this many consecutive zero bytes, a run isn't treated as a hole
/// worth skipping - matched against a handful of filesystem blocks so
/// small incidental runs of zeros inside real data don't fragment the map.
const MIN_HOLE_SIZE: u64 = crate::types::BLOCK_SIZE * 8;

pub struct CreateOptions {
    pub signing_key: Option<SigningKey>,
    pub compression_level: i64,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self { signing_key: None, compression_level: 6 }
    }
}

/// Resolves a `;`-separated `host-path` list relative to `base_dir`,
/// matching `update_relative_path`'s handling of paths relative to the
/// config file's own directory.
fn resolve_host_paths(base_dir: &Path, host_paths: &[String]) -> Vec<PathBuf> {
    host_paths
        .iter()
        .map(|p| {
            let path = Path::new(p);
            if path.is_absolute() { path.to_path_buf() } else { base_dir.join(path) }
        })
        .collect()
}

/// Reads every host path in order and concatenates their bytes, the way
/// multiple `;`-joined host paths are treated as one logical file.
fn read_concatenated(paths: &[PathBuf]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for path in paths {
        let mut file = std::fs::File::open(path)
            .map_err(|e| FwupError::Validation(format!("can't open path '{}': {e}", path.display())))?;
        file.read_to_end(&mut buf)?;
    }
    Ok(buf)
}

/// Computes the sparse map and BLAKE2b-256 hash for every file-resource
/// that has a `host-path`, and applies any size assertions, matching
/// `compute_file_metadata` + `add_file_resources`'s assertion checks.
fn compute_file_metadata(manifest: &mut Manifest, base_dir: &Path) -> Result<()> {
    for resource in manifest.file_resources.values_mut() {
        if resource.host_paths.is_empty() {
            let contents = resource.contents.as_deref().unwrap_or("");
            resource.sparse_map = SparseFileMap::whole(contents.len() as u64);
            resource.blake2b_256 = Some(crypto::blake2b_256_hex(contents.as_bytes()));
            continue;
        }

        let paths = resolve_host_paths(base_dir, &resource.host_paths);
        let data = read_concatenated(&paths)?;

        resource.sparse_map = if resource.skip_holes {
            let mut cursor = std::io::Cursor::new(&data);
            SparseFileMap::build_from_reader(&mut cursor, MIN_HOLE_SIZE)?
        } else {
            SparseFileMap::whole(data.len() as u64)
        };

        let total_len = resource.sparse_map.size() as i64;
        if let Some(max) = resource.assert_size_lte {
            if total_len > max * crate::types::BLOCK_SIZE as i64 {
                return Err(FwupError::Validation(format!(
                    "file size assertion failed on '{}': {total_len} bytes must be <= {} blocks",
                    resource.name, max
                )));
            }
        }
        if let Some(min) = resource.assert_size_gte {
            if total_len < min * crate::types::BLOCK_SIZE as i64 {
                return Err(FwupError::Validation(format!(
                    "file size assertion failed on '{}': {total_len} bytes must be >= {} blocks",
                    resource.name, min
                )));
            }
        }

        let mut mac = Blake2b256::new_from_slice(&[]).expect("blake2b accepts an empty key");
        let mut reader = crate::sparse_file::SparseFileReader::new(&resource.sparse_map, data.as_slice());
        while let Some((_, chunk)) = reader.read_next(65536)? {
            mac.update(&chunk);
        }
        resource.blake2b_256 = Some(hex::encode(mac.finalize().into_bytes()));
    }
    Ok(())
}

fn write_resources<W: Write + Seek>(
    manifest: &Manifest,
    base_dir: &Path,
    zip: &mut zip::ZipWriter<W>,
    options: &SimpleFileOptions,
) -> Result<()> {
    let mut names: Vec<&str> = manifest.file_resources.keys().map(String::as_str).collect();
    names.sort_unstable();
    for name in names {
        let resource = &manifest.file_resources[name];
        let archive_path = crate::apply::resource_name_to_archive_path(name)?;
        zip.start_file(archive_path, *options)?;

        if resource.host_paths.is_empty() {
            let contents = resource.contents.as_deref().unwrap_or("");
            zip.write_all(contents.as_bytes())?;
        } else {
            let paths = resolve_host_paths(base_dir, &resource.host_paths);
            let data = read_concatenated(&paths)?;
            let mut reader = crate::sparse_file::SparseFileReader::new(&resource.sparse_map, data.as_slice());
            while let Some((_, chunk)) = reader.read_next(65536)? {
                zip.write_all(&chunk)?;
            }
        }
    }
    Ok(())
}

/// Builds a firmware archive from `manifest`, resolving `host-path`
/// entries relative to `base_dir`. `manifest` is mutated in place with
/// each resource's computed sparse map and hash.
pub fn create<W: Write + Seek>(
    manifest: &mut Manifest,
    base_dir: &Path,
    output: W,
    options: &CreateOptions,
) -> Result<()> {
    compute_file_metadata(manifest, base_dir)?;

    let meta_conf = to_meta_conf(manifest);
    let meta_conf_bytes = meta_conf.as_bytes();

    let mut zip = zip::ZipWriter::new(output);
    let level = options.compression_level.clamp(0, 9);
    let file_options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .compression_level(Some(level));

    if let Some(signing_key) = &options.signing_key {
        let signature = crypto::sign(signing_key, meta_conf_bytes);
        zip.start_file("meta.conf.ed25519", file_options)?;
        zip.write_all(&signature.to_bytes())?;
    }

    zip.start_file("meta.conf", file_options)?;
    zip.write_all(meta_conf_bytes)?;

    write_resources(manifest, base_dir, &mut zip, &file_options)?;

    zip.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::model::FileResource;
    use std::io::Cursor;

    fn manifest_with_string_resource() -> Manifest {
        let mut manifest = Manifest::default();
        manifest.file_resources.insert(
            "hello.txt".into(),
            FileResource {
                name: "hello.txt".into(),
                host_paths: vec![],
                skip_holes: true,
                sparse_map: SparseFileMap::new(),
                contents: Some("hello world".into()),
                blake2b_256: None,
                sha256: None,
                assert_size_lte: None,
                assert_size_gte: None,
            },
        );
        manifest
    }

    #[test]
    fn creates_archive_with_string_resource() {
        let mut manifest = manifest_with_string_resource();
        let mut buf = Vec::new();
        {
            let cursor = Cursor::new(&mut buf);
            create(&mut manifest, Path::new("."), cursor, &CreateOptions::default()).unwrap();
        }
        assert_eq!(manifest.file_resources["hello.txt"].blake2b_256.as_deref().unwrap().len(), 64);

        let mut zip = zip::ZipArchive::new(Cursor::new(buf)).unwrap();
        assert_eq!(zip.by_index(0).unwrap().name(), "meta.conf");
        let mut data = Vec::new();
        zip.by_name("data/hello.txt").unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, b"hello world");
    }

    #[test]
    fn hashes_and_packs_a_host_path_resource() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("rootfs.img"), b"firmware bytes").unwrap();

        let mut manifest = Manifest::default();
        manifest.file_resources.insert(
            "rootfs.img".into(),
            FileResource {
                name: "rootfs.img".into(),
                host_paths: vec!["rootfs.img".into()],
                skip_holes: true,
                sparse_map: SparseFileMap::new(),
                contents: None,
                blake2b_256: None,
                sha256: None,
                assert_size_lte: None,
                assert_size_gte: None,
            },
        );

        let mut buf = Vec::new();
        {
            let cursor = Cursor::new(&mut buf);
            create(&mut manifest, dir.path(), cursor, &CreateOptions::default()).unwrap();
        }
        let expected_hash = crypto::blake2b_256_hex(b"firmware bytes");
        assert_eq!(manifest.file_resources["rootfs.img"].blake2b_256.as_deref(), Some(expected_hash.as_str()));

        let mut zip = zip::ZipArchive::new(Cursor::new(buf)).unwrap();
        let mut data = Vec::new();
        zip.by_name("data/rootfs.img").unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, b"firmware bytes");
    }

    #[test]
    fn signs_when_key_supplied() {
        let mut manifest = manifest_with_string_resource();
        let (signing_key, verifying_key) = crypto::generate_signing_keypair();
        let mut buf = Vec::new();
        {
            let cursor = Cursor::new(&mut buf);
            let options = CreateOptions { signing_key: Some(signing_key), compression_level: 6 };
            create(&mut manifest, Path::new("."), cursor, &options).unwrap();
        }
        let mut zip = zip::ZipArchive::new(Cursor::new(buf)).unwrap();
        assert_eq!(zip.by_index(0).unwrap().name(), "meta.conf.ed25519");
        let (_, verified) =
            crate::manifest::read_archive_manifest(&mut zip, std::slice::from_ref(&verifying_key)).unwrap();
        assert_eq!(verified, Some(true));
    }
}

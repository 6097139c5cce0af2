pub mod model;
pub mod parser;
pub mod serialize;

pub use model::Manifest;

use crate::crypto;
use crate::errors::{FwupError, Result};
use ed25519_dalek::{Signature, VerifyingKey};
use std::io::Read;
use std::path::Path;

const MAX_SIGNATURE_SIZE: usize = 64;

/// Recursively resolves `include("path")` statements by splicing in the
/// referenced file's contents, depth-limited to guard against cycles.
pub fn preprocess_includes(source: &str, base_dir: &Path, depth: u32) -> Result<String> {
    if depth > 16 {
        return Err(FwupError::Parse("include() nesting too deep".into()));
    }
    let mut out = String::with_capacity(source.len());
    let mut rest = source;
    while let Some(pos) = rest.find("include(") {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + "include(".len()..];
        let quote_start =
            after.find('"').ok_or_else(|| FwupError::Parse("malformed include()".into()))?;
        let quote_rest = &after[quote_start + 1..];
        let quote_end =
            quote_rest.find('"').ok_or_else(|| FwupError::Parse("malformed include()".into()))?;
        let path = &quote_rest[..quote_end];
        let close = quote_rest[quote_end + 1..]
            .find(')')
            .ok_or_else(|| FwupError::Parse("malformed include()".into()))?;

        let included_path = base_dir.join(path);
        let included = std::fs::read_to_string(&included_path)
            .map_err(|e| FwupError::Parse(format!("include '{path}': {e}")))?;
        let included = preprocess_includes(&included, base_dir, depth + 1)?;
        out.push_str(&included);

        rest = &quote_rest[quote_end + 1 + close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Parses a `meta.conf` document, injecting and verifying `meta-uuid`.
///
/// The UUID is derived from the raw bytes before parsing and both
/// injected as `FWUP_META_UUID` (for `${FWUP_META_UUID}` interpolation)
/// and checked against the parsed `meta-uuid`, if the manifest set one
/// explicitly - a manifest is not allowed to claim a different UUID than
/// the one derived from its own content.
pub fn parse_meta_conf(raw: &[u8]) -> Result<Manifest> {
    if raw.len() > parser::MAX_META_CONF_SIZE {
        return Err(FwupError::Parse(format!(
            "meta.conf too large ({} bytes, max {})",
            raw.len(),
            parser::MAX_META_CONF_SIZE
        )));
    }
    let text = std::str::from_utf8(raw).map_err(|e| FwupError::Parse(e.to_string()))?;
    let expected_uuid = crypto::derive_meta_uuid(raw);

    // SAFETY for determinism: FWUP_META_UUID must reflect the bytes being
    // parsed, so it's set here rather than inherited from the caller's
    // environment.
    std::env::set_var("FWUP_META_UUID", expected_uuid.to_string());

    let doc = parser::parse(text)?;
    let manifest = Manifest::from_document(&doc)?;

    if let Some(claimed) = &manifest.meta.uuid {
        if *claimed != expected_uuid.to_string() {
            return Err(FwupError::Validation(
                "meta-uuid in manifest does not match the derived archive UUID".into(),
            ));
        }
    }

    Ok(manifest)
}

/// Reads `meta.conf` (and, if present, a leading `meta.conf.ed25519`
/// detached signature) out of a firmware archive and returns the parsed
/// manifest plus the UUID that was derived for it.
///
/// If `public_keys` is non-empty, a signature is required and must
/// verify against at least one key. If it's empty but a signature entry
/// is present, verification is skipped and a warning should be logged by
/// the caller.
pub fn read_archive_manifest<R: Read + std::io::Seek>(
    zip: &mut zip::ZipArchive<R>,
    public_keys: &[VerifyingKey],
) -> Result<(Manifest, Option<bool>)> {
    let mut signature_bytes: Option<Vec<u8>> = None;
    let mut index = 0;

    {
        let first = zip.by_index(0)?;
        if first.name() == "meta.conf.ed25519" {
            if first.size() as usize > MAX_SIGNATURE_SIZE {
                return Err(FwupError::Signature("meta.conf.ed25519 too large".into()));
            }
            let mut buf = Vec::new();
            let mut first = first;
            first.read_to_end(&mut buf)?;
            signature_bytes = Some(buf);
            index = 1;
        }
    }

    let mut meta_entry = zip.by_index(index)?;
    if meta_entry.name() != "meta.conf" {
        return Err(FwupError::Archive(zip::result::ZipError::FileNotFound));
    }
    let mut raw = Vec::new();
    meta_entry.read_to_end(&mut raw)?;
    drop(meta_entry);

    let signature_verified = match (&signature_bytes, public_keys.is_empty()) {
        (Some(sig_bytes), false) => {
            let sig = Signature::from_slice(sig_bytes)
                .map_err(|e| FwupError::Signature(e.to_string()))?;
            if !crypto::verify_any(public_keys, &raw, &sig) {
                return Err(FwupError::Signature("no trusted key verified meta.conf".into()));
            }
            Some(true)
        }
        (Some(_), true) => Some(false),
        (None, _) => None,
    };

    let manifest = parse_meta_conf(&raw)?;
    Ok((manifest, signature_verified))
}

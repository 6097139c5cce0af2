use crate::cache::VerifyWrites;
use crate::errors::{FwupError, Result};
use ed25519_dalek::VerifyingKey;
use std::path::Path;

/// Parses the `auto|on|off` tri-state used by `--verify-writes`.
pub fn parse_verify_writes(s: Option<&str>) -> VerifyWrites {
    match s.map(str::to_ascii_lowercase).as_deref() {
        Some("on") => VerifyWrites::On,
        Some("off") => VerifyWrites::Off,
        _ => VerifyWrites::Auto,
    }
}

/// Loads one 32-byte raw Ed25519 public key per `--public-key` file.
pub fn load_public_keys(paths: &[impl AsRef<Path>]) -> Result<Vec<VerifyingKey>> {
    paths
        .iter()
        .map(|p| {
            let bytes = std::fs::read(p.as_ref())?;
            let bytes: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| FwupError::Validation(format!("{}: not a 32-byte public key", p.as_ref().display())))?;
            VerifyingKey::from_bytes(&bytes).map_err(|e| FwupError::Signature(e.to_string()))
        })
        .collect()
}

use crate::errors::{FwupError, Result};
use crate::types::BLOCK_SIZE;
use std::collections::BTreeMap;

/// U-Boot environment block: CRC-32 + optional redundancy flag byte +
/// null-terminated `name=value` pairs + 0xff padding.
///
/// Licensing note: this is an independent reimplementation written
/// against the on-disk format, not a port of U-Boot's own GPL-licensed
/// environment code.
#[derive(Debug, Clone)]
pub struct UbootEnv {
    pub block_offset: u64,
    pub block_count: u32,
    pub env_size: u64,
    pub use_redundant: bool,
    pub redundant_block_offset: u64,
    pub write_primary: bool,
    pub write_secondary: bool,
    pub flags: u8,
    pub vars: BTreeMap<String, String>,
}

impl UbootEnv {
    pub fn new(block_offset: u64, block_count: u32, redundant_block_offset: Option<u64>) -> Result<Self> {
        if block_count == 0 || block_count as u64 >= u16::MAX as u64 {
            return Err(FwupError::Validation("invalid u-boot environment block count".into()));
        }
        let env_size = block_count as u64 * BLOCK_SIZE;
        match redundant_block_offset {
            Some(redundant) => Ok(Self {
                block_offset,
                block_count,
                env_size,
                use_redundant: true,
                redundant_block_offset: redundant,
                write_primary: true,
                write_secondary: true,
                flags: 0,
                vars: BTreeMap::new(),
            }),
            None => Ok(Self {
                block_offset,
                block_count,
                env_size,
                use_redundant: false,
                redundant_block_offset: block_offset,
                write_primary: true,
                write_secondary: false,
                flags: 0,
                vars: BTreeMap::new(),
            }),
        }
    }

    fn data_offset(&self) -> usize {
        if self.use_redundant { 5 } else { 4 }
    }

    pub fn setenv(&mut self, name: &str, value: &str) {
        self.vars.insert(name.to_string(), value.to_string());
    }

    pub fn unsetenv(&mut self, name: &str) {
        self.vars.remove(name);
    }

    pub fn getenv(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(|s| s.as_str())
    }

    /// Encodes the environment into a block, 0xff padded, CRC-32 prefixed.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = vec![0xffu8; self.env_size as usize];
        let data_offset = self.data_offset();
        let mut p = data_offset;
        let end = self.env_size as usize - 1;

        for (name, value) in &self.vars {
            let entry_len = name.len() + 1 + value.len() + 1;
            if p + entry_len >= end {
                return Err(FwupError::Validation("not enough room in u-boot environment".into()));
            }
            buffer[p..p + name.len()].copy_from_slice(name.as_bytes());
            p += name.len();
            buffer[p] = b'=';
            p += 1;
            buffer[p..p + value.len()].copy_from_slice(value.as_bytes());
            p += value.len();
            buffer[p] = 0;
            p += 1;
        }
        buffer[p] = 0;

        if data_offset == 5 {
            buffer[4] = self.flags;
        }

        let crc = crc32fast::hash(&buffer[data_offset..]);
        buffer[0..4].copy_from_slice(&crc.to_le_bytes());
        Ok(buffer)
    }

    /// Decodes a raw block into name/value pairs, verifying the CRC-32.
    pub fn decode(&mut self, buffer: &[u8]) -> Result<()> {
        let data_offset = self.data_offset();
        let expected_crc = u32::from_le_bytes(buffer[0..4].try_into().unwrap());
        let actual_crc = crc32fast::hash(&buffer[data_offset..self.env_size as usize]);
        if expected_crc != actual_crc {
            return Err(FwupError::Validation(format!(
                "U-boot environment (block {}) CRC32 mismatch (expected {:#010x}; got {:#010x})",
                self.block_offset, expected_crc, actual_crc
            )));
        }
        if data_offset == 5 {
            self.flags = buffer[4];
        }

        self.vars.clear();
        let end = self.env_size as usize;
        let mut pos = data_offset;
        while pos < end && buffer[pos] != 0 {
            let name_start = pos;
            while pos < end && buffer[pos] != b'=' {
                if buffer[pos] == 0 {
                    return Err(FwupError::Validation("invalid u-boot environment".into()));
                }
                pos += 1;
            }
            if pos >= end {
                return Err(FwupError::Validation("invalid u-boot environment".into()));
            }
            let name = String::from_utf8_lossy(&buffer[name_start..pos]).into_owned();
            pos += 1; // skip '='

            let value_start = pos;
            while pos < end && buffer[pos] != 0 {
                pos += 1;
            }
            if pos >= end {
                return Err(FwupError::Validation("invalid u-boot environment".into()));
            }
            let value = String::from_utf8_lossy(&buffer[value_start..pos]).into_owned();
            self.vars.insert(name, value);
            pos += 1; // skip NUL
        }
        Ok(())
    }

    /// Picks the newer of two redundant environment copies using the
    /// single-byte wraparound counter convention: the higher flag value
    /// wins, except at the 0/255 wraparound boundary, where 0 is newer.
    pub fn pick_newer<'a>(primary: &'a UbootEnv, secondary: &'a UbootEnv) -> &'a UbootEnv {
        match (primary.flags, secondary.flags) {
            (0, 255) => primary,
            (255, 0) => secondary,
            (p, s) if p >= s => primary,
            _ => secondary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_vars() {
        let mut env = UbootEnv::new(100, 2, None).unwrap();
        env.setenv("bootcount", "0");
        env.setenv("active", "a");
        let encoded = env.encode().unwrap();

        let mut decoded = UbootEnv::new(100, 2, None).unwrap();
        decoded.decode(&encoded).unwrap();
        assert_eq!(decoded.getenv("bootcount"), Some("0"));
        assert_eq!(decoded.getenv("active"), Some("a"));
    }

    #[test]
    fn detects_crc_mismatch() {
        let env = UbootEnv::new(100, 2, None).unwrap();
        let mut encoded = env.encode().unwrap();
        encoded[200] ^= 0xff;
        let mut decoded = UbootEnv::new(100, 2, None).unwrap();
        assert!(decoded.decode(&encoded).is_err());
    }

    #[test]
    fn redundant_encode_uses_five_byte_offset() {
        let mut env = UbootEnv::new(100, 2, Some(200)).unwrap();
        env.flags = 5;
        env.setenv("x", "y");
        let encoded = env.encode().unwrap();
        assert_eq!(encoded[4], 5);

        let mut decoded = UbootEnv::new(100, 2, Some(200)).unwrap();
        decoded.decode(&encoded).unwrap();
        assert_eq!(decoded.flags, 5);
        assert_eq!(decoded.getenv("x"), Some("y"));
    }

    #[test]
    fn picks_newer_copy_with_wraparound() {
        let mut a = UbootEnv::new(0, 1, Some(1)).unwrap();
        let mut b = UbootEnv::new(1, 1, Some(0)).unwrap();
        a.flags = 0;
        b.flags = 255;
        assert_eq!(UbootEnv::pick_newer(&a, &b) as *const _, &a as *const _);
        a.flags = 5;
        b.flags = 6;
        assert_eq!(UbootEnv::pick_newer(&a, &b) as *const _, &b as *const _);
    }
}

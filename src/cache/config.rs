/// Write-verification policy: read back every write and compare, `Auto`
/// enables it only when the destination looks like a regular file (where
/// the cost is cheap) and disables it for block devices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyWrites {
    On,
    Off,
    Auto,
}

/// Configuration for the block cache.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub segment_size: u64,
    pub max_segments: usize,
    pub verify_writes: VerifyWrites,
    pub enable_trim: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            segment_size: 128 * 1024,
            max_segments: 64,
            verify_writes: VerifyWrites::Auto,
            enable_trim: false,
        }
    }
}

use crate::errors::{FwupError, Result};
use crate::eval::eval_math;
use crate::fat;
use crate::mbr;
use crate::requirements::{ReqContext, Requirement};
use crate::types::BLOCK_SIZE;

pub struct RequirePartitionOffset;
impl Requirement for RequirePartitionOffset {
    fn validate(&self, args: &[String]) -> Result<()> {
        if args.len() != 2 {
            return Err(FwupError::Validation(
                "require-partition-offset requires a partition number and a block offset".into(),
            ));
        }
        let partition: i64 = args[0]
            .parse()
            .map_err(|_| FwupError::Validation("require-partition-offset requires an integer partition number".into()))?;
        if !(0..=3).contains(&partition) {
            return Err(FwupError::Validation(
                "require-partition-offset requires the partition number to be between 0, 1, 2, or 3".into(),
            ));
        }
        eval_math(&args[1])
            .map_err(|_| FwupError::Validation("require-partition-offset requires a non-negative integer block offset".into()))?;
        Ok(())
    }

    fn requirement_met(&self, ctx: &ReqContext, args: &[String]) -> Result<bool> {
        let partition: usize = args[0].parse().unwrap_or(usize::MAX);
        let block_offset = eval_math(&args[1]).unwrap_or(-1);

        let mut buffer = [0u8; 512];
        if ctx.output.pread(&mut buffer, 0).is_err() {
            return Ok(false);
        }
        let Ok(partitions) = mbr::decode(&buffer) else {
            return Ok(false);
        };
        if partition >= partitions.len() {
            return Ok(false);
        }
        Ok(partitions[partition].block_offset as i64 == block_offset)
    }
}

pub struct RequireFatFileExists;
impl Requirement for RequireFatFileExists {
    fn validate(&self, args: &[String]) -> Result<()> {
        if args.len() != 2 {
            return Err(FwupError::Validation(
                "require-fat-file-exists requires a FAT FS block offset and a filename".into(),
            ));
        }
        eval_math(&args[0])
            .map_err(|_| FwupError::Validation("require-fat-file-exists requires a non-negative integer block offset".into()))?;
        Ok(())
    }

    fn requirement_met(&self, ctx: &ReqContext, args: &[String]) -> Result<bool> {
        let block_offset = eval_math(&args[0]).unwrap_or(-1);
        if block_offset < 0 {
            return Ok(false);
        }
        let _ = BLOCK_SIZE;
        Ok(fat::exists(ctx.output, block_offset as u64, &args[1]).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{BlockCache, CacheConfig};
    use std::io::Cursor;

    fn cache_with_mbr() -> BlockCache {
        let cursor: Box<dyn crate::cache::BlockDevice> = Box::new(Cursor::new(vec![0u8; 4096]));
        let cache = BlockCache::new(cursor, CacheConfig::default());
        let partitions = [
            mbr::MbrPartition { boot_flag: false, partition_type: 0x83, block_offset: 63, block_count: 100, ..Default::default() },
            mbr::MbrPartition::default(),
            mbr::MbrPartition::default(),
            mbr::MbrPartition::default(),
        ];
        let sector = mbr::create(&partitions, &mbr::BootRegion::None, 0).unwrap();
        cache.pwrite(&sector, 0, false).unwrap();
        cache
    }

    #[test]
    fn partition_offset_matches() {
        let cache = cache_with_mbr();
        let ctx = ReqContext { output: &cache };
        let args = vec!["0".to_string(), "63".to_string()];
        assert!(RequirePartitionOffset.requirement_met(&ctx, &args).unwrap());
    }

    #[test]
    fn partition_offset_mismatch() {
        let cache = cache_with_mbr();
        let ctx = ReqContext { output: &cache };
        let args = vec!["0".to_string(), "64".to_string()];
        assert!(!RequirePartitionOffset.requirement_met(&ctx, &args).unwrap());
    }
}

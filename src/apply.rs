//! Apply pipeline: reads a firmware archive, selects a task, and streams
//! its resources to a destination, mirroring `fwup_apply.c`'s `fwup_apply`.

use crate::cache::{BlockCache, BlockDevice, CacheConfig, VerifyWrites};
use crate::errors::{FwupError, Result};
use crate::functions::{self, FunContext, ProgressCounter};
use crate::manifest;
use crate::manifest::model::{Manifest, Task};
use crate::mbr;
use crate::requirements::{self, ReqContext};
use ed25519_dalek::VerifyingKey;
use std::collections::HashSet;
use std::io::{Read, Seek};

/// Options controlling one `apply` run, the Rust equivalent of
/// `fwup_apply`'s parameter list.
pub struct ApplyOptions {
    pub task_prefix: String,
    pub public_keys: Vec<VerifyingKey>,
    pub enable_trim: bool,
    pub verify_writes: VerifyWrites,
    pub unsafe_mode: bool,
}

/// Resolves the archive path (`data/<name>` or `<name>` with its leading
/// `/` stripped) a file-resource's bytes live at, matching
/// `resource_name_to_archive_path`.
pub(crate) fn resource_name_to_archive_path(resource_name: &str) -> Result<String> {
    if resource_name.is_empty() {
        return Err(FwupError::Validation("resource name can't be empty".into()));
    }
    if resource_name.ends_with('/') {
        return Err(FwupError::Validation(format!(
            "resource name '{resource_name}' can't end in a '/'"
        )));
    }
    if let Some(rest) = resource_name.strip_prefix('/') {
        if rest.is_empty() {
            return Err(FwupError::Validation("resource name can't be the root directory".into()));
        }
        if resource_name == "/meta.conf" {
            return Err(FwupError::Validation("resources can't be named /meta.conf".into()));
        }
        if rest.starts_with("data/") || rest == "data" {
            return Err(FwupError::Validation(
                "use a normal resource name rather than specifying /data".into(),
            ));
        }
        Ok(rest.to_string())
    } else {
        Ok(format!("data/{resource_name}"))
    }
}

/// Inverse of `resource_name_to_archive_path`: translates a zip entry's
/// path back into the resource name it was stored under, matching
/// `archive_filename_to_resource`. Entries outside `data/` or `meta.conf`
/// itself resolve to an absolute resource name; `meta.conf*` entries have
/// no corresponding resource.
fn archive_filename_to_resource(filename: &str) -> Option<String> {
    if filename == "meta.conf" || filename == "meta.conf.ed25519" {
        None
    } else if let Some(rest) = filename.strip_prefix("data/") {
        if rest.is_empty() { None } else { Some(rest.to_string()) }
    } else if filename.is_empty() {
        None
    } else {
        Some(format!("/{filename}"))
    }
}

/// Legacy `require-partition1-offset` check on the task section itself,
/// evaluated before the task's own `reqlist`.
fn deprecated_task_is_applicable(task: &Task, output: &BlockCache) -> bool {
    let Some(expected) = task.require_partition1_offset else { return true };
    let mut buffer = [0u8; 512];
    if output.pread(&mut buffer, 0).is_err() {
        return false;
    }
    let Ok(partitions) = mbr::decode(&buffer) else { return false };
    partitions[1].block_offset as i64 == expected
}

/// First task whose name is prefixed by `task_prefix` and whose legacy
/// and regular requirements are both met, matching `find_task`'s prefix
/// match (not an exact match).
fn find_task<'a>(manifest: &'a Manifest, task_prefix: &str, output: &BlockCache) -> Option<&'a Task> {
    let ctx = ReqContext { output };
    manifest.tasks.iter().find(|t| {
        t.name.starts_with(task_prefix)
            && deprecated_task_is_applicable(t, output)
            && requirements::reqlist_met(&ctx, &t.reqlist)
    })
}

fn run_event(ctx: &FunContext, task: &Task, event: &str) -> Result<()> {
    let list = match event {
        "on-init" => &task.on_init,
        "on-finish" => &task.on_finish,
        "on-error" => &task.on_error,
        _ => unreachable!(),
    };
    functions::run_funlist(ctx, list)
}

fn compute_progress_event(ctx: &FunContext, task: &Task, event: &str) -> Result<()> {
    let list = match event {
        "on-init" => &task.on_init,
        "on-finish" => &task.on_finish,
        _ => unreachable!(),
    };
    functions::compute_progress_funlist(ctx, list)
}

/// Runs every function's `compute_progress` over `on-init`, each
/// `on-resource`, and `on-finish`, the way `compute_progress` does before
/// the real run so total progress units are known up front.
fn compute_progress(ctx: &FunContext, task: &Task) -> Result<()> {
    compute_progress_event(ctx, task, "on-init")?;
    for on_resource in &task.on_resource {
        if !ctx.manifest.file_resources.contains_key(&on_resource.resource_name) {
            return Err(FwupError::Validation(format!(
                "on-resource references unknown file-resource '{}'",
                on_resource.resource_name
            )));
        }
        functions::compute_progress_funlist(ctx, &on_resource.funlist)?;
    }
    compute_progress_event(ctx, task, "on-finish")
}

/// Buffers a named resource's archive bytes out of the zip, at the path
/// `resource_name_to_archive_path` computed when the archive was created.
fn read_resource_bytes<R: Read + Seek>(
    zip: &mut zip::ZipArchive<R>,
    resource_name: &str,
) -> Result<Vec<u8>> {
    let archive_path = resource_name_to_archive_path(resource_name)?;
    let mut entry = zip.by_name(&archive_path)?;
    let mut buf = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Runs the selected task's `on-resource` function list for one resource
/// that was just found in the archive.
fn run_resource_event(
    ctx: &FunContext,
    task: &Task,
    resource_name: &str,
) -> Result<()> {
    let on_resource = task
        .on_resource
        .iter()
        .find(|r| r.resource_name == resource_name)
        .ok_or_else(|| {
            FwupError::Validation(format!("no on-resource block for '{resource_name}'"))
        })?;
    functions::run_funlist(ctx, &on_resource.funlist)
}

/// Applies a firmware archive to `output`, running the first task whose
/// name is prefixed by `options.task_prefix` and whose requirements are
/// met. Mirrors `fwup_apply.c`'s `fwup_apply`.
pub fn apply<R: Read + Seek>(
    archive: R,
    output: Box<dyn BlockDevice>,
    options: &ApplyOptions,
) -> Result<()> {
    let mut zip = zip::ZipArchive::new(archive)?;
    let (manifest, signature_verified) = manifest::read_archive_manifest(&mut zip, &options.public_keys)?;
    if signature_verified == Some(false) {
        log::warn!("meta.conf.ed25519 present but no public keys supplied; skipping verification");
    }

    let cache_config = CacheConfig {
        verify_writes: options.verify_writes,
        enable_trim: options.enable_trim,
        ..CacheConfig::default()
    };
    let output = BlockCache::new(output, cache_config);

    let task = find_task(&manifest, &options.task_prefix, &output).ok_or_else(|| {
        FwupError::NoApplicableTask(options.task_prefix.clone())
    })?;
    log::info!("selected task '{}'", task.name);

    let progress = ProgressCounter::default();
    let init_ctx = FunContext {
        manifest: &manifest,
        output: &output,
        unsafe_mode: options.unsafe_mode,
        progress: &progress,
        resource: None,
    };
    compute_progress(&init_ctx, task)?;
    progress.report(0);

    let result = run_task(&manifest, task, &output, &mut zip, &progress, options);

    if result.is_err() {
        output.reset();
        let error_ctx = FunContext {
            manifest: &manifest,
            output: &output,
            unsafe_mode: options.unsafe_mode,
            progress: &progress,
            resource: None,
        };
        if run_event(&error_ctx, task, "on-error").is_err() {
            output.reset();
        }
        return result;
    }

    output.flush()?;
    log::info!("apply complete");
    Ok(())
}

fn run_task<R: Read + Seek>(
    manifest: &Manifest,
    task: &Task,
    output: &BlockCache,
    zip: &mut zip::ZipArchive<R>,
    progress: &ProgressCounter,
    options: &ApplyOptions,
) -> Result<()> {
    let init_ctx = FunContext {
        manifest,
        output,
        unsafe_mode: options.unsafe_mode,
        progress,
        resource: None,
    };
    run_event(&init_ctx, task, "on-init")?;

    let used: HashSet<&str> = task.on_resource.iter().map(|r| r.resource_name.as_str()).collect();
    let mut processed: HashSet<String> = HashSet::new();

    for i in 0..zip.len() {
        let filename = zip.by_index(i)?.name().to_string();
        let Some(resource_name) = archive_filename_to_resource(&filename) else { continue };
        if !used.contains(resource_name.as_str()) {
            continue;
        }
        if !manifest.file_resources.contains_key(&resource_name) {
            return Err(FwupError::Validation(format!(
                "resource '{resource_name}' used, but metadata is missing; archive is corrupt"
            )));
        }

        let data = read_resource_bytes(zip, &resource_name)?;
        let resource_ctx = FunContext {
            manifest,
            output,
            unsafe_mode: options.unsafe_mode,
            progress,
            resource: Some((resource_name.as_str(), &data)),
        };
        log::info!("processing resource '{resource_name}'");
        run_resource_event(&resource_ctx, task, &resource_name)?;
        processed.insert(resource_name);
    }

    for name in &used {
        if !processed.contains(*name) {
            return Err(FwupError::Validation(format!("resource {name} not found in archive")));
        }
    }

    let finish_ctx =
        FunContext { manifest, output, unsafe_mode: options.unsafe_mode, progress, resource: None };
    run_event(&finish_ctx, task, "on-finish")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_resource_name_maps_under_data() {
        assert_eq!(resource_name_to_archive_path("rootfs.img").unwrap(), "data/rootfs.img");
    }

    #[test]
    fn absolute_resource_name_strips_leading_slash() {
        assert_eq!(resource_name_to_archive_path("/boot/uEnv.txt").unwrap(), "boot/uEnv.txt");
    }

    #[test]
    fn absolute_data_path_is_rejected() {
        assert!(resource_name_to_archive_path("/data/rootfs.img").is_err());
    }

    #[test]
    fn trailing_slash_is_rejected() {
        assert!(resource_name_to_archive_path("rootfs/").is_err());
    }

    #[test]
    fn filename_round_trips_through_resource_name() {
        let name = "rootfs.img";
        let path = resource_name_to_archive_path(name).unwrap();
        assert_eq!(archive_filename_to_resource(&path).unwrap(), name);
    }

    #[test]
    fn meta_conf_has_no_resource() {
        assert_eq!(archive_filename_to_resource("meta.conf"), None);
        assert_eq!(archive_filename_to_resource("meta.conf.ed25519"), None);
    }
}

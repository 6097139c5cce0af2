//! Registry of named functions usable in `on-init`/`on-finish`/`on-error`/
//! `on-resource` sections. Each function implements a `validate`/
//! `compute_progress`/`run` triad, mirroring how the original tool's
//! function pointer table worked, except here the table is a name ->
//! trait-object map built once at startup.

mod impls;

use crate::cache::BlockCache;
use crate::errors::{FwupError, Result};
use crate::manifest::Manifest;
use std::sync::atomic::{AtomicU64, Ordering};

/// Accumulates expected vs. completed progress units across an apply run.
#[derive(Default)]
pub struct ProgressCounter {
    pub total_units: AtomicU64,
    pub completed_units: AtomicU64,
}

impl ProgressCounter {
    pub fn add_total(&self, units: u64) {
        self.total_units.fetch_add(units, Ordering::Relaxed);
    }

    pub fn report(&self, units: u64) {
        self.completed_units.fetch_add(units, Ordering::Relaxed);
    }

    pub fn percent(&self) -> u8 {
        let total = self.total_units.load(Ordering::Relaxed);
        if total == 0 {
            return 100;
        }
        let done = self.completed_units.load(Ordering::Relaxed);
        ((done.min(total) * 100) / total) as u8
    }
}

/// Everything a function needs to validate its arguments, estimate its
/// progress contribution, or actually run.
pub struct FunContext<'a> {
    pub manifest: &'a Manifest,
    pub output: &'a BlockCache,
    pub unsafe_mode: bool,
    pub progress: &'a ProgressCounter,
    /// Set when the call appears inside an `on-resource` block: the
    /// resource being processed and its fully buffered archive bytes
    /// (buffering the whole resource keeps the function implementations
    /// simple; archived resources in practice are bounded-size firmware
    /// images, not arbitrarily large streams).
    pub resource: Option<(&'a str, &'a [u8])>,
}

impl<'a> FunContext<'a> {
    fn current_resource(&self, fn_name: &str) -> Result<(&'a str, &'a [u8])> {
        self.resource
            .ok_or_else(|| FwupError::Validation(format!("{fn_name} only usable in on-resource")))
    }

    fn file_resource(&self, name: &str, fn_name: &str) -> Result<&'a crate::manifest::model::FileResource> {
        self.manifest
            .file_resources
            .get(name)
            .ok_or_else(|| FwupError::Validation(format!("{fn_name} can't find file-resource '{name}'")))
    }
}

pub trait Function: Send + Sync {
    fn validate(&self, ctx: &FunContext, args: &[String]) -> Result<()>;
    fn compute_progress(&self, ctx: &FunContext, args: &[String]) -> Result<()>;
    fn run(&self, ctx: &FunContext, args: &[String]) -> Result<()>;
}

fn table() -> Vec<(&'static str, &'static dyn Function)> {
    vec![
        ("raw_write", &impls::RawWrite),
        ("raw_memset", &impls::RawMemset),
        ("fat_attrib", &impls::FatAttrib),
        ("fat_mkfs", &impls::FatMkfs),
        ("fat_write", &impls::FatWrite),
        ("fat_mv", &impls::FatMv),
        ("fat_mv!", &impls::FatMv),
        ("fat_rm", &impls::FatRm),
        ("fat_rm!", &impls::FatRm),
        ("fat_cp", &impls::FatCp),
        ("fat_mkdir", &impls::FatMkdir),
        ("fat_setlabel", &impls::FatSetlabel),
        ("fat_touch", &impls::FatTouch),
        ("mbr_write", &impls::MbrWrite),
        ("trim", &impls::Trim),
        ("uboot_clearenv", &impls::UbootClearenv),
        ("uboot_setenv", &impls::UbootSetenv),
        ("uboot_unsetenv", &impls::UbootUnsetenv),
        ("uboot_recover", &impls::UbootRecover),
        ("error", &impls::ErrorFn),
        ("info", &impls::InfoFn),
        ("path_write", &impls::PathWrite),
        ("pipe_write", &impls::PipeWrite),
        ("execute", &impls::Execute),
    ]
}

fn lookup(name: &str) -> Result<&'static dyn Function> {
    table()
        .into_iter()
        .find(|(n, _)| *n == name)
        .map(|(_, f)| f)
        .ok_or_else(|| FwupError::UnknownFunction(name.to_string()))
}

pub fn validate(name: &str, ctx: &FunContext, args: &[String]) -> Result<()> {
    lookup(name)?.validate(ctx, args)
}

pub fn compute_progress(name: &str, ctx: &FunContext, args: &[String]) -> Result<()> {
    lookup(name)?.compute_progress(ctx, args)
}

pub fn run(name: &str, ctx: &FunContext, args: &[String]) -> Result<()> {
    lookup(name)?.run(ctx, args)
}

/// Validates, computes progress for, and runs every call in a flattened
/// call list in order, matching `fun_apply_funlist`'s single pass.
pub fn run_funlist(ctx: &FunContext, funlist: &crate::manifest::model::FlatCallList) -> Result<()> {
    for (name, args) in funlist.calls() {
        run(name, ctx, args)?;
    }
    Ok(())
}

pub fn compute_progress_funlist(
    ctx: &FunContext,
    funlist: &crate::manifest::model::FlatCallList,
) -> Result<()> {
    for (name, args) in funlist.calls() {
        compute_progress(name, ctx, args)?;
    }
    Ok(())
}

pub fn validate_funlist(ctx: &FunContext, funlist: &crate::manifest::model::FlatCallList) -> Result<()> {
    for (name, args) in funlist.calls() {
        validate(name, ctx, args)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_function_is_rejected() {
        assert!(lookup("does_not_exist").is_err());
    }

    #[test]
    fn percent_is_100_with_no_work() {
        let counter = ProgressCounter::default();
        assert_eq!(counter.percent(), 100);
    }

    #[test]
    fn percent_tracks_progress() {
        let counter = ProgressCounter::default();
        counter.add_total(200);
        counter.report(50);
        assert_eq!(counter.percent(), 25);
    }
}

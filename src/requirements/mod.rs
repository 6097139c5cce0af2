//! Requirement predicates used in a task's `reqlist` to decide whether a
//! task applies to the connected target, checked against the already
//! written-to output before any `on-init` function runs.

mod impls;

use crate::cache::BlockCache;
use crate::errors::{FwupError, Result};
use crate::manifest::model::FlatCallList;

pub struct ReqContext<'a> {
    pub output: &'a BlockCache,
}

pub trait Requirement: Send + Sync {
    fn validate(&self, args: &[String]) -> Result<()>;
    fn requirement_met(&self, ctx: &ReqContext, args: &[String]) -> Result<bool>;
}

fn table() -> Vec<(&'static str, &'static dyn Requirement)> {
    vec![
        ("require-partition-offset", &impls::RequirePartitionOffset),
        ("require-fat-file-exists", &impls::RequireFatFileExists),
    ]
}

fn lookup(name: &str) -> Result<&'static dyn Requirement> {
    table()
        .into_iter()
        .find(|(n, _)| *n == name)
        .map(|(_, r)| r)
        .ok_or_else(|| FwupError::UnknownRequirement(name.to_string()))
}

pub fn validate(name: &str, args: &[String]) -> Result<()> {
    lookup(name)?.validate(args)
}

pub fn requirement_met(name: &str, ctx: &ReqContext, args: &[String]) -> Result<bool> {
    lookup(name)?.requirement_met(ctx, args)
}

/// Validates every requirement in a reqlist, the way this is checked
/// while creating the firmware file.
pub fn validate_reqlist(reqlist: &FlatCallList) -> Result<()> {
    for (name, args) in reqlist.calls() {
        validate(name, args)?;
    }
    Ok(())
}

/// Checks every requirement in a reqlist is met, short-circuiting on the
/// first one that isn't (or doesn't exist), the way a task is selected
/// while applying firmware.
pub fn reqlist_met(ctx: &ReqContext, reqlist: &FlatCallList) -> bool {
    for (name, args) in reqlist.calls() {
        match requirement_met(name, ctx, args) {
            Ok(true) => continue,
            _ => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_requirement_is_rejected() {
        assert!(lookup("does-not-exist").is_err());
    }
}

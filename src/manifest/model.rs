use crate::errors::{FwupError, Result};
use crate::eval::eval_math;
use crate::manifest::parser::{Document, FuncCall, Section, Value};
use crate::sparse_file::SparseFileMap;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct Meta {
    pub product: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
    pub author: Option<String>,
    pub platform: Option<String>,
    pub architecture: Option<String>,
    pub creation_date: Option<String>,
    pub fwup_version: Option<String>,
    pub vcs_identifier: Option<String>,
    pub misc: Option<String>,
    pub uuid: Option<String>,
    pub require_fwup_version: String,
}

#[derive(Debug, Clone)]
pub struct FileResource {
    pub name: String,
    pub host_paths: Vec<String>,
    pub skip_holes: bool,
    pub sparse_map: SparseFileMap,
    pub contents: Option<String>,
    pub blake2b_256: Option<String>,
    pub sha256: Option<String>,
    pub assert_size_lte: Option<i64>,
    pub assert_size_gte: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct MbrPartitionCfg {
    pub index: usize,
    pub block_offset: u32,
    pub block_count: u32,
    pub partition_type: i64,
    pub boot: bool,
    pub expand: bool,
}

#[derive(Debug, Clone, Default)]
pub struct OsiiCfg {
    pub os_major: u16,
    pub os_minor: u16,
    pub start_block_offset: u32,
    pub ddr_load_address: u32,
    pub entry_point: u32,
    pub image_size_blocks: u32,
    pub attribute: u8,
}

#[derive(Debug, Clone, Default)]
pub struct MbrCfg {
    pub bootstrap_code_host_path: Option<String>,
    pub bootstrap_code: Option<String>,
    pub include_osip: bool,
    pub osip_major: i64,
    pub osip_minor: i64,
    pub osip_num_pointers: i64,
    pub signature: Option<String>,
    pub partitions: Vec<MbrPartitionCfg>,
    pub osii: Vec<OsiiCfg>,
}

#[derive(Debug, Clone, Default)]
pub struct UbootEnvironmentCfg {
    pub block_offset: i64,
    pub block_count: i64,
    pub block_offset_redund: Option<i64>,
}

/// A flattened, arity-prefixed call list: each logical entry is
/// `[argc_as_string, func_name, arg1, arg2, ...]` concatenated with the
/// next entry's own arity prefix, mirroring the on-disk encoding used for
/// `on-init`/`on-finish`/`on-error`/`on-resource` function lists and task
/// requirement lists.
#[derive(Debug, Clone, Default)]
pub struct FlatCallList {
    pub entries: Vec<String>,
}

impl FlatCallList {
    pub fn from_calls(calls: &[FuncCall]) -> Self {
        let mut entries = Vec::new();
        for call in calls {
            entries.push(call.args.len().to_string());
            entries.push(call.name.clone());
            for arg in &call.args {
                entries.push(match arg {
                    Value::Str(s) => s.clone(),
                    Value::Int(i) => i.to_string(),
                    Value::Bool(b) => b.to_string(),
                });
            }
        }
        Self { entries }
    }

    pub fn calls(&self) -> Vec<(&str, &[String])> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            let argc: usize = self.entries[i].parse().unwrap_or(0);
            let name = self.entries[i + 1].as_str();
            let args = &self.entries[i + 2..i + 2 + argc];
            out.push((name, args));
            i += 2 + argc;
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct OnResource {
    pub resource_name: String,
    pub funlist: FlatCallList,
}

#[derive(Debug, Clone, Default)]
pub struct Task {
    pub name: String,
    pub reqlist: FlatCallList,
    pub require_partition1_offset: Option<i64>,
    pub on_init: FlatCallList,
    pub on_finish: FlatCallList,
    pub on_error: FlatCallList,
    pub on_resource: Vec<OnResource>,
}

#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub meta: Meta,
    pub file_resources: HashMap<String, FileResource>,
    pub mbr: HashMap<String, MbrCfg>,
    pub uboot_environment: HashMap<String, UbootEnvironmentCfg>,
    pub tasks: Vec<Task>,
}

impl Manifest {
    pub fn from_document(doc: &Document) -> Result<Self> {
        let root = &doc.root;
        let meta = Meta {
            product: root.get_str("meta-product").map(str::to_string),
            description: root.get_str("meta-description").map(str::to_string),
            version: root.get_str("meta-version").map(str::to_string),
            author: root.get_str("meta-author").map(str::to_string),
            platform: root.get_str("meta-platform").map(str::to_string),
            architecture: root.get_str("meta-architecture").map(str::to_string),
            creation_date: root.get_str("meta-creation-date").map(str::to_string),
            fwup_version: root.get_str("meta-fwup-version").map(str::to_string),
            vcs_identifier: root.get_str("meta-vcs-identifier").map(str::to_string),
            misc: root.get_str("meta-misc").map(str::to_string),
            uuid: root.get_str("meta-uuid").map(str::to_string),
            require_fwup_version: root.get_str("require-fwup-version").unwrap_or("0").to_string(),
        };

        let mut file_resources = HashMap::new();
        if let Some(sections) = root.sections.get("file-resource") {
            for s in sections {
                let fr = parse_file_resource(s)?;
                file_resources.insert(fr.name.clone(), fr);
            }
        }

        let mut mbr = HashMap::new();
        if let Some(sections) = root.sections.get("mbr") {
            for s in sections {
                let name = s.title.clone().ok_or_else(|| FwupError::Parse("mbr missing title".into()))?;
                mbr.insert(name, parse_mbr(s)?);
            }
        }

        let mut uboot_environment = HashMap::new();
        if let Some(sections) = root.sections.get("uboot-environment") {
            for s in sections {
                let name = s
                    .title
                    .clone()
                    .ok_or_else(|| FwupError::Parse("uboot-environment missing title".into()))?;
                uboot_environment.insert(name, parse_uboot_env(s));
            }
        }

        let mut tasks = Vec::new();
        if let Some(sections) = root.sections.get("task") {
            for s in sections {
                tasks.push(parse_task(s)?);
            }
        }

        Ok(Manifest { meta, file_resources, mbr, uboot_environment, tasks })
    }

    /// Finds the first task matching `provider`, the way `fwup -a -t
    /// <task>` resolves which task to run.
    pub fn find_task<'a>(&'a self, name: &str) -> Result<&'a Task> {
        self.tasks
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| FwupError::NoApplicableTask(name.to_string()))
    }
}

fn eval_int(raw: &str) -> Result<i64> {
    eval_math(raw)
}

fn parse_file_resource(s: &Section) -> Result<FileResource> {
    let name = s.title.clone().ok_or_else(|| FwupError::Parse("file-resource missing title".into()))?;
    let host_paths = s
        .get_str("host-path")
        .map(|p| p.split(';').map(str::to_string).collect())
        .unwrap_or_default();

    let sparse_map = match s.get_list("length") {
        Some(values) => {
            let lengths: Vec<u64> = values.iter().filter_map(Value::as_int).map(|i| i as u64).collect();
            SparseFileMap::from_lengths(lengths)
        }
        None => SparseFileMap::from_lengths(vec![0]),
    };

    Ok(FileResource {
        name,
        host_paths,
        skip_holes: s.get_bool("skip-holes").unwrap_or(true),
        sparse_map,
        contents: s.get_str("contents").map(str::to_string),
        blake2b_256: s.get_str("blake2b-256").map(str::to_string),
        sha256: s.get_str("sha256").map(str::to_string),
        assert_size_lte: s.get_int("assert-size-lte"),
        assert_size_gte: s.get_int("assert-size-gte"),
    })
}

fn parse_mbr(s: &Section) -> Result<MbrCfg> {
    let mut partitions = Vec::new();
    if let Some(sections) = s.sections.get("partition") {
        for p in sections {
            let block_offset = match p.get_str("block-offset") {
                Some(raw) => eval_int(raw)? as u32,
                None => 0,
            };
            let index: usize = p
                .title
                .as_deref()
                .ok_or_else(|| FwupError::Parse("mbr partition missing index".into()))?
                .parse()
                .map_err(|_| FwupError::Parse("mbr partition index must be an integer".into()))?;
            if index >= crate::mbr::MBR_MAX_PARTITIONS {
                return Err(FwupError::Parse(format!(
                    "mbr partition index {index} out of range (max {})",
                    crate::mbr::MBR_MAX_PARTITIONS - 1
                )));
            }
            partitions.push(MbrPartitionCfg {
                index,
                block_offset,
                block_count: p.get_int("block-count").unwrap_or(i32::MAX as i64) as u32,
                partition_type: p.get_int("type").unwrap_or(-1),
                boot: p.get_bool("boot").unwrap_or(false),
                expand: p.get_bool("expand").unwrap_or(false),
            });
        }
    }

    let mut osii = Vec::new();
    if let Some(sections) = s.sections.get("osii") {
        for o in sections {
            osii.push(OsiiCfg {
                os_major: o.get_int("os-major").unwrap_or(0) as u16,
                os_minor: o.get_int("os-minor").unwrap_or(0) as u16,
                start_block_offset: o.get_int("start-block-offset").unwrap_or(0) as u32,
                ddr_load_address: o.get_int("ddr-load-address").unwrap_or(0) as u32,
                entry_point: o.get_int("entry-point").unwrap_or(0) as u32,
                image_size_blocks: o.get_int("image-size-blocks").unwrap_or(0) as u32,
                attribute: o.get_int("attribute").unwrap_or(0xf) as u8,
            });
        }
    }

    Ok(MbrCfg {
        bootstrap_code_host_path: s.get_str("bootstrap-code-host-path").map(str::to_string),
        bootstrap_code: s.get_str("bootstrap-code").map(str::to_string),
        include_osip: s.get_bool("include-osip").unwrap_or(false),
        osip_major: s.get_int("osip-major").unwrap_or(1),
        osip_minor: s.get_int("osip-minor").unwrap_or(0),
        osip_num_pointers: s.get_int("osip-num-pointers").unwrap_or(1),
        signature: s.get_str("signature").map(str::to_string),
        partitions,
        osii,
    })
}

fn parse_uboot_env(s: &Section) -> UbootEnvironmentCfg {
    UbootEnvironmentCfg {
        block_offset: s.get_int("block-offset").unwrap_or(-1),
        block_count: s.get_int("block-count").unwrap_or(i32::MAX as i64),
        block_offset_redund: s.get_int("block-offset-redund"),
    }
}

fn parse_task(s: &Section) -> Result<Task> {
    let name = s.title.clone().ok_or_else(|| FwupError::Parse("task missing title".into()))?;

    let on_init = s.sections.get("on-init").and_then(|v| v.first()).map(|sec| FlatCallList::from_calls(&sec.calls)).unwrap_or_default();
    let on_finish = s.sections.get("on-finish").and_then(|v| v.first()).map(|sec| FlatCallList::from_calls(&sec.calls)).unwrap_or_default();
    let on_error = s.sections.get("on-error").and_then(|v| v.first()).map(|sec| FlatCallList::from_calls(&sec.calls)).unwrap_or_default();

    let mut on_resource = Vec::new();
    if let Some(sections) = s.sections.get("on-resource") {
        for r in sections {
            on_resource.push(OnResource {
                resource_name: r.title.clone().unwrap_or_default(),
                funlist: FlatCallList::from_calls(&r.calls),
            });
        }
    }

    Ok(Task {
        name,
        reqlist: FlatCallList::from_calls(&s.calls),
        require_partition1_offset: s.get_int("require-partition1-offset"),
        on_init,
        on_finish,
        on_error,
        on_resource,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::parser::parse;

    #[test]
    fn builds_manifest_from_document() {
        let doc = parse(
            r#"meta-product = "widget"
require-fwup-version = "1.0.0"

file-resource "rootfs.img" {
    host-path = "rootfs.img"
    length = {1024}
}

task "complete" {
    on-resource "rootfs.img" {
        raw_write(0)
    }
}
"#,
        )
        .unwrap();

        let manifest = Manifest::from_document(&doc).unwrap();
        assert_eq!(manifest.meta.product.as_deref(), Some("widget"));
        assert!(manifest.file_resources.contains_key("rootfs.img"));

        let task = manifest.find_task("complete").unwrap();
        let calls = task.on_resource[0].funlist.calls();
        assert_eq!(calls[0].0, "raw_write");
        assert_eq!(calls[0].1, &["0".to_string()]);
    }

    #[test]
    fn missing_task_is_an_error() {
        let doc = parse("meta-product = \"x\"").unwrap();
        let manifest = Manifest::from_document(&doc).unwrap();
        assert!(manifest.find_task("complete").is_err());
    }
}

//! Canonical `meta.conf` text serializer, mirroring the archived-copy
//! rules in the original config writer: host-only attributes are
//! stripped, defaulted/empty values are omitted, and the declaration
//! order a manifest was built in is preserved.

use crate::manifest::model::{FlatCallList, Manifest, Task};

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn write_funlist(out: &mut String, indent: &str, list: &FlatCallList) {
    for (name, args) in list.calls() {
        out.push_str(indent);
        out.push_str(name);
        out.push('(');
        let rendered: Vec<String> = args
            .iter()
            .map(|a| if a.parse::<i64>().is_ok() { a.clone() } else { quote(a) })
            .collect();
        out.push_str(&rendered.join(", "));
        out.push_str(")\n");
    }
}

fn write_task(out: &mut String, task: &Task) {
    out.push_str(&format!("task {} {{\n", quote(&task.name)));
    if let Some(offset) = task.require_partition1_offset {
        out.push_str(&format!("    require-partition1-offset={offset}\n"));
    }
    write_funlist(out, "    ", &task.reqlist);
    if !task.on_init.entries.is_empty() {
        out.push_str("    on-init {\n");
        write_funlist(out, "        ", &task.on_init);
        out.push_str("    }\n");
    }
    for on_resource in &task.on_resource {
        out.push_str(&format!("    on-resource {} {{\n", quote(&on_resource.resource_name)));
        write_funlist(out, "        ", &on_resource.funlist);
        out.push_str("    }\n");
    }
    if !task.on_finish.entries.is_empty() {
        out.push_str("    on-finish {\n");
        write_funlist(out, "        ", &task.on_finish);
        out.push_str("    }\n");
    }
    if !task.on_error.entries.is_empty() {
        out.push_str("    on-error {\n");
        write_funlist(out, "        ", &task.on_error);
        out.push_str("    }\n");
    }
    out.push_str("}\n\n");
}

/// Renders `manifest` back to `meta.conf` text, stripping host-only
/// attributes (`host-path`, `contents`, `skip-holes`, `assert-size-*`,
/// `meta-creation-date`) so the archived copy is reproducible and
/// independent of the host that created it.
pub fn to_meta_conf(manifest: &Manifest) -> String {
    let mut out = String::new();

    let meta = &manifest.meta;
    if let Some(v) = &meta.product {
        out.push_str(&format!("meta-product = {}\n", quote(v)));
    }
    if let Some(v) = &meta.description {
        out.push_str(&format!("meta-description = {}\n", quote(v)));
    }
    if let Some(v) = &meta.version {
        out.push_str(&format!("meta-version = {}\n", quote(v)));
    }
    if let Some(v) = &meta.author {
        out.push_str(&format!("meta-author = {}\n", quote(v)));
    }
    if let Some(v) = &meta.platform {
        out.push_str(&format!("meta-platform = {}\n", quote(v)));
    }
    if let Some(v) = &meta.architecture {
        out.push_str(&format!("meta-architecture = {}\n", quote(v)));
    }
    if let Some(v) = &meta.fwup_version {
        out.push_str(&format!("meta-fwup-version = {}\n", quote(v)));
    }
    if let Some(v) = &meta.vcs_identifier {
        out.push_str(&format!("meta-vcs-identifier = {}\n", quote(v)));
    }
    if let Some(v) = &meta.misc {
        out.push_str(&format!("meta-misc = {}\n", quote(v)));
    }
    if meta.require_fwup_version != "0" {
        out.push_str(&format!("require-fwup-version = {}\n", quote(&meta.require_fwup_version)));
    }
    out.push('\n');

    let mut resources: Vec<&str> = manifest.file_resources.keys().map(String::as_str).collect();
    resources.sort_unstable();
    for name in resources {
        let fr = &manifest.file_resources[name];
        out.push_str(&format!("file-resource {} {{\n", quote(&fr.name)));
        let lengths: Vec<String> = fr.sparse_map.map.iter().map(u64::to_string).collect();
        out.push_str(&format!("    length = {{{}}}\n", lengths.join(", ")));
        if let Some(hash) = &fr.blake2b_256 {
            out.push_str(&format!("    blake2b-256 = {}\n", quote(hash)));
        }
        if let Some(hash) = &fr.sha256 {
            out.push_str(&format!("    sha256 = {}\n", quote(hash)));
        }
        out.push_str("}\n\n");
    }

    let mut mbrs: Vec<&str> = manifest.mbr.keys().map(String::as_str).collect();
    mbrs.sort_unstable();
    for name in mbrs {
        let cfg = &manifest.mbr[name];
        out.push_str(&format!("mbr {} {{\n", quote(name)));
        if let Some(sig) = &cfg.signature {
            out.push_str(&format!("    signature = {}\n", quote(sig)));
        }
        for p in &cfg.partitions {
            out.push_str(&format!("    partition {} {{\n", quote(&p.index.to_string())));
            out.push_str(&format!("        block-offset = {}\n", p.block_offset));
            out.push_str(&format!("        block-count = {}\n", p.block_count));
            out.push_str(&format!("        type = {}\n", p.partition_type));
            out.push_str(&format!("        boot = {}\n", p.boot));
            out.push_str(&format!("        expand = {}\n", p.expand));
            out.push_str("    }\n");
        }
        out.push_str("}\n\n");
    }

    let mut envs: Vec<&str> = manifest.uboot_environment.keys().map(String::as_str).collect();
    envs.sort_unstable();
    for name in envs {
        let cfg = &manifest.uboot_environment[name];
        out.push_str(&format!("uboot-environment {} {{\n", quote(name)));
        out.push_str(&format!("    block-offset = {}\n", cfg.block_offset));
        out.push_str(&format!("    block-count = {}\n", cfg.block_count));
        if let Some(redund) = cfg.block_offset_redund {
            out.push_str(&format!("    block-offset-redund = {redund}\n"));
        }
        out.push_str("}\n\n");
    }

    for task in &manifest.tasks {
        write_task(&mut out, task);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::model::{FileResource, Meta};
    use crate::sparse_file::SparseFileMap;

    #[test]
    fn strips_host_only_attributes() {
        let mut manifest = Manifest { meta: Meta::default(), ..Default::default() };
        manifest.file_resources.insert(
            "rootfs.img".into(),
            FileResource {
                name: "rootfs.img".into(),
                host_paths: vec!["/tmp/rootfs.img".into()],
                skip_holes: true,
                sparse_map: SparseFileMap::whole(1024),
                contents: None,
                blake2b_256: Some("a".repeat(64)),
                sha256: None,
                assert_size_lte: None,
                assert_size_gte: None,
            },
        );
        let text = to_meta_conf(&manifest);
        assert!(!text.contains("host-path"));
        assert!(text.contains("blake2b-256"));
    }
}

use crate::apply::{self, ApplyOptions};
use crate::cli::command::Command;
use crate::cli::util::{load_public_keys, parse_verify_writes};
use crate::create::{self, CreateOptions};
use crate::crypto;
use crate::errors::{FwupError, Result};
use crate::manifest;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Plain human-readable text, or the `OK`/`ER`/`PR` framed record
/// protocol used when fwup is driven by another process over a pipe.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Text,
    Framed,
}

fn emit_ok(mode: OutputMode, out: &mut impl Write) {
    if mode == OutputMode::Framed {
        let _ = writeln!(out, "OK 0");
    }
}

fn emit_error(mode: OutputMode, out: &mut impl Write, message: &str) {
    match mode {
        OutputMode::Framed => {
            let _ = writeln!(out, "ER -1 {message}");
        }
        OutputMode::Text => log::error!("{message}"),
    }
}

fn emit_progress(mode: OutputMode, out: &mut impl Write, percent: u8) {
    if mode == OutputMode::Framed {
        let _ = writeln!(out, "PR {percent}");
    }
}

pub fn run(command: Command) -> Result<()> {
    run_with_format(command, OutputMode::Text)
}

/// Dispatches a parsed `Command`, writing framed `OK`/`ER`/`PR` records to
/// stdout when `mode` is `Framed` and plain log output otherwise.
pub fn run_with_format(command: Command, mode: OutputMode) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    let result = match command {
        Command::Apply {
            input,
            task,
            output,
            public_key_files,
            enable_trim,
            verify_writes,
            minimize_writes,
            unsafe_mode,
        } => {
            let _ = minimize_writes;
            run_apply(
                &input,
                &task,
                &output,
                &public_key_files,
                enable_trim,
                verify_writes.as_deref(),
                unsafe_mode,
                mode,
                &mut out,
            )
        }
        Command::Create { config, output, signing_key_file, key_passphrase, compression_level } => {
            run_create(&config, &output, signing_key_file.as_deref(), key_passphrase.as_deref(), compression_level)
        }
        Command::List { input, public_key_files } => run_list(&input, &public_key_files),
        Command::Metadata { input, public_key_files } => run_metadata(&input, &public_key_files),
        Command::GenKeys { output_dir, passphrase } => run_genkeys(&output_dir, passphrase.as_deref()),
        Command::Sign { input, output, signing_key_file, key_passphrase } => {
            run_sign(&input, &output, &signing_key_file, key_passphrase.as_deref())
        }
        Command::Verify { input, public_key_files } => run_verify(&input, &public_key_files),
    };

    match &result {
        Ok(()) => emit_ok(mode, &mut out),
        Err(e) => emit_error(mode, &mut out, &e.to_string()),
    }
    result
}

#[allow(clippy::too_many_arguments)]
fn run_apply(
    input: &Path,
    task: &str,
    output: &Path,
    public_key_files: &[std::path::PathBuf],
    enable_trim: bool,
    verify_writes: Option<&str>,
    unsafe_mode: bool,
    mode: OutputMode,
    out: &mut impl Write,
) -> Result<()> {
    let public_keys = load_public_keys(public_key_files)?;
    let archive = File::open(input)?;
    let destination = File::options().read(true).write(true).open(output)?;

    emit_progress(mode, out, 0);
    let options = ApplyOptions {
        task_prefix: task.to_string(),
        public_keys,
        enable_trim,
        verify_writes: parse_verify_writes(verify_writes),
        unsafe_mode,
    };
    apply::apply(archive, Box::new(destination), &options)?;
    emit_progress(mode, out, 100);
    Ok(())
}

fn run_create(
    config_path: &Path,
    output: &Path,
    signing_key_file: Option<&Path>,
    key_passphrase: Option<&str>,
    compression_level: i64,
) -> Result<()> {
    let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    let raw = std::fs::read_to_string(config_path)?;
    let preprocessed = manifest::preprocess_includes(&raw, base_dir, 0)?;
    let mut parsed = manifest::parse_meta_conf(preprocessed.as_bytes())?;

    let signing_key = match (signing_key_file, key_passphrase) {
        (Some(path), Some(pass)) => {
            let bytes = std::fs::read(path)?;
            Some(crypto::load_encrypted_private_key(bytes.as_slice(), pass)?)
        }
        (Some(_), None) => {
            return Err(FwupError::Validation("a signing key file requires a passphrase".into()));
        }
        (None, _) => None,
    };

    let out_file = File::create(output)?;
    let options = CreateOptions { signing_key, compression_level };
    create::create(&mut parsed, base_dir, out_file, &options)
}

fn open_manifest(
    input: &Path,
    public_key_files: &[std::path::PathBuf],
) -> Result<(manifest::Manifest, Option<bool>)> {
    let public_keys = load_public_keys(public_key_files)?;
    let file = File::open(input)?;
    let mut zip = zip::ZipArchive::new(file)?;
    manifest::read_archive_manifest(&mut zip, &public_keys)
}

fn run_list(input: &Path, public_key_files: &[std::path::PathBuf]) -> Result<()> {
    let (manifest, _) = open_manifest(input, public_key_files)?;
    println!("tasks:");
    for task in &manifest.tasks {
        println!("  {}", task.name);
    }
    println!("resources:");
    let mut names: Vec<&str> = manifest.file_resources.keys().map(String::as_str).collect();
    names.sort_unstable();
    for name in names {
        println!("  {name}");
    }
    Ok(())
}

fn run_metadata(input: &Path, public_key_files: &[std::path::PathBuf]) -> Result<()> {
    let (manifest, _) = open_manifest(input, public_key_files)?;
    let meta = &manifest.meta;
    macro_rules! print_if_some {
        ($label:literal, $field:expr) => {
            if let Some(v) = &$field {
                println!("{} = \"{}\"", $label, v);
            }
        };
    }
    print_if_some!("meta-product", meta.product);
    print_if_some!("meta-description", meta.description);
    print_if_some!("meta-version", meta.version);
    print_if_some!("meta-author", meta.author);
    print_if_some!("meta-platform", meta.platform);
    print_if_some!("meta-architecture", meta.architecture);
    print_if_some!("meta-vcs-identifier", meta.vcs_identifier);
    print_if_some!("meta-misc", meta.misc);
    print_if_some!("meta-uuid", meta.uuid);
    Ok(())
}

fn run_genkeys(output_dir: &Path, passphrase: Option<&str>) -> Result<()> {
    std::fs::create_dir_all(output_dir)?;
    let (signing_key, verifying_key) = crypto::generate_signing_keypair();

    let public_path = output_dir.join("fwup-key.pub");
    std::fs::write(&public_path, verifying_key.to_bytes())?;

    let private_path = output_dir.join("fwup-key.priv");
    match passphrase {
        Some(pass) => {
            let mut f = File::create(&private_path)?;
            crypto::save_encrypted_private_key(&mut f, &signing_key, pass)?;
        }
        None => std::fs::write(&private_path, signing_key.to_bytes())?,
    }
    println!("wrote {}", public_path.display());
    println!("wrote {}", private_path.display());
    Ok(())
}

/// Re-signs an archive: the existing `meta.conf` is carried over verbatim
/// (so its derived `meta-uuid` doesn't change), and every other entry is
/// copied through unmodified.
fn run_sign(
    input: &Path,
    output: &Path,
    signing_key_file: &Path,
    key_passphrase: Option<&str>,
) -> Result<()> {
    let key_bytes = std::fs::read(signing_key_file)?;
    let signing_key = match key_passphrase {
        Some(pass) => crypto::load_encrypted_private_key(key_bytes.as_slice(), pass)?,
        None => {
            let bytes: [u8; 32] = key_bytes
                .as_slice()
                .try_into()
                .map_err(|_| FwupError::Validation("not a 32-byte raw signing key".into()))?;
            ed25519_dalek::SigningKey::from_bytes(&bytes)
        }
    };

    let input_file = File::open(input)?;
    let mut zip = zip::ZipArchive::new(input_file)?;
    let mut meta_conf = Vec::new();
    {
        let mut entry = zip.by_name("meta.conf")?;
        std::io::Read::read_to_end(&mut entry, &mut meta_conf)?;
    }
    let signature = crypto::sign(&signing_key, &meta_conf);

    let out_file = File::create(output)?;
    let mut writer = zip::ZipWriter::new(out_file);
    let options =
        zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    writer.start_file("meta.conf.ed25519", options)?;
    writer.write_all(&signature.to_bytes())?;
    writer.start_file("meta.conf", options)?;
    writer.write_all(&meta_conf)?;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        if entry.name() == "meta.conf" || entry.name() == "meta.conf.ed25519" {
            continue;
        }
        let name = entry.name().to_string();
        writer.start_file(name, options)?;
        std::io::copy(&mut entry, &mut writer)?;
    }
    writer.finish()?;
    Ok(())
}

fn run_verify(input: &Path, public_key_files: &[std::path::PathBuf]) -> Result<()> {
    let (_, signature_verified) = open_manifest(input, public_key_files)?;
    match signature_verified {
        Some(true) => {
            println!("signature verified");
            Ok(())
        }
        Some(false) => Err(FwupError::Signature(
            "meta.conf.ed25519 present but no public keys supplied".into(),
        )),
        None => Err(FwupError::Signature("archive is not signed".into())),
    }
}

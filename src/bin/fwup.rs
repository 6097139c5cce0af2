//! Command-line entry point: parses flags in the spirit of fwup's
//! traditional `-a`/`-c`/`-i`/`-t`/`-o` flag set, plus a handful of
//! subcommands for key management and archive inspection.

use clap::{Parser, Subcommand};
use fwup_core::cli::{self, Command, OutputMode};
use fwup_core::config;
use fwup_core::logger;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "fwup", about = "Create and apply firmware update archives")]
struct Cli {
    /// Apply a firmware archive to a destination.
    #[arg(short = 'a', long, requires_all = ["input", "output"])]
    apply: bool,

    /// Create a firmware archive from a `meta.conf`-style config.
    #[arg(short = 'c', long, requires_all = ["input", "output"])]
    create: bool,

    /// Archive, or config file when creating.
    #[arg(short = 'i', long, global = true)]
    input: Option<PathBuf>,

    /// Task name prefix to select when applying.
    #[arg(short = 't', long, default_value = "complete")]
    task: String,

    /// Destination block device or file, or archive path when creating.
    #[arg(short = 'o', long = "output", alias = "device", global = true)]
    output: Option<PathBuf>,

    /// Trusted public key file; may be repeated.
    #[arg(long = "public-key", global = true)]
    public_key: Vec<PathBuf>,

    /// Issue a TRIM/discard before writing each segment.
    #[arg(long, global = true)]
    enable_trim: bool,

    /// Verify every write by reading it back: auto|on|off.
    #[arg(long, global = true)]
    verify_writes: Option<String>,

    /// Skip writes whose bytes already read back the same on disk.
    #[arg(long, global = true)]
    minimize_writes: bool,

    /// Disable destination safety checks (mounted filesystem guard, etc).
    #[arg(long, global = true)]
    unsafe_mode: bool,

    /// Path to a signing key, private or with `--public-key` public.
    #[arg(long, global = true)]
    signing_key: Option<PathBuf>,

    /// Passphrase protecting `--signing-key`'s private key file.
    #[arg(long, global = true)]
    key_passphrase: Option<String>,

    /// zlib compression level used when creating, 0-9.
    #[arg(long, default_value_t = 6, global = true)]
    compression_level: i64,

    /// Emit `OK`/`ER`/`PR` framed records on stdout instead of log lines.
    #[arg(long, global = true)]
    framed: bool,

    /// Explicit config file, overriding the usual search path.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    subcommand: Option<Subcmd>,
}

#[derive(Subcommand)]
enum Subcmd {
    /// Apply a firmware archive to a destination.
    Apply {
        #[arg(short = 'i', long)]
        input: PathBuf,
        #[arg(short = 't', long, default_value = "complete")]
        task: String,
        #[arg(short = 'o', long = "output", alias = "device")]
        output: PathBuf,
        #[arg(long = "public-key")]
        public_key: Vec<PathBuf>,
        #[arg(long)]
        enable_trim: bool,
        #[arg(long)]
        verify_writes: Option<String>,
        #[arg(long)]
        minimize_writes: bool,
        #[arg(long)]
        unsafe_mode: bool,
    },
    /// Create a firmware archive from a `meta.conf`-style config.
    Create {
        #[arg(short = 'i', long)]
        config: PathBuf,
        #[arg(short = 'o', long)]
        output: PathBuf,
        #[arg(long)]
        signing_key: Option<PathBuf>,
        #[arg(long)]
        key_passphrase: Option<String>,
        #[arg(long, default_value_t = 6)]
        compression_level: i64,
    },
    /// List an archive's tasks and file-resources.
    List {
        #[arg(short = 'i', long)]
        input: PathBuf,
        #[arg(long = "public-key")]
        public_key: Vec<PathBuf>,
    },
    /// Print an archive's `meta-*` fields.
    Metadata {
        #[arg(short = 'i', long)]
        input: PathBuf,
        #[arg(long = "public-key")]
        public_key: Vec<PathBuf>,
    },
    /// Generate an Ed25519 signing keypair.
    Genkeys {
        #[arg(short = 'o', long = "output")]
        output_dir: PathBuf,
        #[arg(long)]
        passphrase: Option<String>,
    },
    /// Sign (or re-sign) an archive's `meta.conf` in place.
    Sign {
        #[arg(short = 'i', long)]
        input: PathBuf,
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        #[arg(long)]
        signing_key: PathBuf,
        #[arg(long)]
        key_passphrase: Option<String>,
    },
    /// Verify an archive's signature against one or more public keys.
    Verify {
        #[arg(short = 'i', long)]
        input: PathBuf,
        #[arg(long = "public-key")]
        public_key: Vec<PathBuf>,
    },
}

fn build_command(cli: &Cli) -> Option<Command> {
    if let Some(sub) = &cli.subcommand {
        return Some(match sub {
            Subcmd::Apply { input, task, output, public_key, enable_trim, verify_writes, minimize_writes, unsafe_mode } => {
                Command::Apply {
                    input: input.clone(),
                    task: task.clone(),
                    output: output.clone(),
                    public_key_files: public_key.clone(),
                    enable_trim: *enable_trim,
                    verify_writes: verify_writes.clone(),
                    minimize_writes: *minimize_writes,
                    unsafe_mode: *unsafe_mode,
                }
            }
            Subcmd::Create { config, output, signing_key, key_passphrase, compression_level } => Command::Create {
                config: config.clone(),
                output: output.clone(),
                signing_key_file: signing_key.clone(),
                key_passphrase: key_passphrase.clone(),
                compression_level: *compression_level,
            },
            Subcmd::List { input, public_key } => {
                Command::List { input: input.clone(), public_key_files: public_key.clone() }
            }
            Subcmd::Metadata { input, public_key } => {
                Command::Metadata { input: input.clone(), public_key_files: public_key.clone() }
            }
            Subcmd::Genkeys { output_dir, passphrase } => {
                Command::GenKeys { output_dir: output_dir.clone(), passphrase: passphrase.clone() }
            }
            Subcmd::Sign { input, output, signing_key, key_passphrase } => Command::Sign {
                input: input.clone(),
                output: output.clone(),
                signing_key_file: signing_key.clone(),
                key_passphrase: key_passphrase.clone(),
            },
            Subcmd::Verify { input, public_key } => {
                Command::Verify { input: input.clone(), public_key_files: public_key.clone() }
            }
        });
    }

    if cli.apply {
        return Some(Command::Apply {
            input: cli.input.clone()?,
            task: cli.task.clone(),
            output: cli.output.clone()?,
            public_key_files: cli.public_key.clone(),
            enable_trim: cli.enable_trim,
            verify_writes: cli.verify_writes.clone(),
            minimize_writes: cli.minimize_writes,
            unsafe_mode: cli.unsafe_mode,
        });
    }
    if cli.create {
        return Some(Command::Create {
            config: cli.input.clone()?,
            output: cli.output.clone()?,
            signing_key_file: cli.signing_key.clone(),
            key_passphrase: cli.key_passphrase.clone(),
            compression_level: cli.compression_level,
        });
    }
    None
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = config::load_config(cli.config.as_deref());
    logger::init().ok();
    logger::configure_logging(config.log_dir.as_deref(), config.log_level.as_deref(), None);

    let mode = if cli.framed { OutputMode::Framed } else { OutputMode::Text };

    let Some(command) = build_command(&cli) else {
        eprintln!("no command given; pass -a/-c with -i/-o, or use a subcommand");
        return ExitCode::FAILURE;
    };

    match cli::run_with_format(command, mode) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if !cli.framed {
                eprintln!("fwup: {e}");
            }
            ExitCode::FAILURE
        }
    }
}

use std::path::PathBuf;

/// Flags that the core honors via its options struct, matching the
/// flag set in `fwup`'s original `-a`/`-c`/`-i`/`-t`/`-o` usage.
pub enum Command {
    Apply {
        input: PathBuf,
        task: String,
        output: PathBuf,
        public_key_files: Vec<PathBuf>,
        enable_trim: bool,
        verify_writes: Option<String>,
        minimize_writes: bool,
        unsafe_mode: bool,
    },
    Create {
        config: PathBuf,
        output: PathBuf,
        signing_key_file: Option<PathBuf>,
        key_passphrase: Option<String>,
        compression_level: i64,
    },
    List {
        input: PathBuf,
        public_key_files: Vec<PathBuf>,
    },
    Metadata {
        input: PathBuf,
        public_key_files: Vec<PathBuf>,
    },
    GenKeys {
        output_dir: PathBuf,
        passphrase: Option<String>,
    },
    Sign {
        input: PathBuf,
        output: PathBuf,
        signing_key_file: PathBuf,
        key_passphrase: Option<String>,
    },
    Verify {
        input: PathBuf,
        public_key_files: Vec<PathBuf>,
    },
}

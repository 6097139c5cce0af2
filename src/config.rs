//! Ambient CLI configuration, separate from an archive's own `meta.conf`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub public_key_file: Option<PathBuf>,
    pub verify_writes: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub unsafe_mode: Option<bool>,
}

/// Loads config with precedence: explicit CLI path > `FWUP_CONFIG` env >
/// `./fwup.toml` > `~/.config/fwup.toml` > defaults.
pub fn load_config(cli_path: Option<&Path>) -> AppConfig {
    for candidate in find_config_paths(cli_path) {
        if let Ok(text) = std::fs::read_to_string(&candidate)
            && let Ok(cfg) = toml::from_str::<AppConfig>(&text)
        {
            return cfg;
        }
    }
    AppConfig::default()
}

fn find_config_paths(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(p) = cli_path {
        paths.push(p.to_path_buf());
    }
    if let Ok(p) = std::env::var("FWUP_CONFIG") {
        paths.push(PathBuf::from(p));
    }
    paths.push(PathBuf::from("./fwup.toml"));
    if let Some(home) = std::env::var_os("HOME") {
        paths.push(PathBuf::from(home).join(".config/fwup.toml"));
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_nothing_found() {
        let cfg = load_config(Some(Path::new("/nonexistent/fwup.toml")));
        assert!(cfg.public_key_file.is_none());
    }
}

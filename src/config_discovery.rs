use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::StrataConfig;
use crate::xdg;

pub const CONFIG_FILE_NAME: &str = "strata.toml";

/// Discovers configuration by traversing up the directory tree,
/// falling back to the global XDG config file
pub fn discover_config(start_dir: &Path) -> Option<PathBuf> {
    let mut current = Some(start_dir);

    while let Some(dir) = current {
        let config_path = dir.join(CONFIG_FILE_NAME);
        if config_path.is_file() {
            return Some(config_path);
        }
        current = dir.parent();
    }

    let global = xdg::global_config_file();
    global.is_file().then_some(global)
}

/// Loads configuration with auto-discovery support
///
/// An explicit path must exist. Otherwise the directory tree is searched from
/// the current directory; `Ok(None)` means no config file was found.
pub fn load_config_with_discovery(explicit_path: Option<&str>) -> Result<Option<StrataConfig>> {
    if let Some(config_path) = explicit_path {
        return Ok(Some(StrataConfig::from_file(config_path)?));
    }

    let current_dir =
        std::env::current_dir().context("Failed to get current directory for config discovery")?;

    match discover_config(&current_dir) {
        Some(path) => {
            debug!(config = %path.display(), "using discovered config");
            Ok(Some(StrataConfig::from_file(&path)?))
        }
        None => Ok(None),
    }
}

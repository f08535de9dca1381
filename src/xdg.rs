//! XDG Base Directory support
//!
//! - `$XDG_CONFIG_HOME/strata/` (default: `~/.config/strata/`) - Global config file
//! - `$XDG_CACHE_HOME/strata/` (default: platform cache dir) - Step cache
//!
//! The XDG variables are only read here. Step processes inherit them untouched.

use std::path::PathBuf;

/// Names of the XDG variables steps commonly rely on
pub const XDG_VARS: [&str; 3] = ["XDG_CONFIG_HOME", "XDG_DATA_HOME", "XDG_CACHE_HOME"];

/// Strata config directory
pub fn config_dir() -> PathBuf {
    if let Some(xdg_config) = non_empty_var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config).join("strata")
    } else if let Some(home) = dirs::home_dir() {
        home.join(".config").join("strata")
    } else {
        PathBuf::from(".strata-config")
    }
}

/// Global config file path (may not exist)
pub fn global_config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Default step cache directory
pub fn cache_dir() -> PathBuf {
    if let Some(xdg_cache) = non_empty_var("XDG_CACHE_HOME") {
        PathBuf::from(xdg_cache).join("strata")
    } else if let Some(cache) = dirs::cache_dir() {
        cache.join("strata")
    } else if let Some(home) = dirs::home_dir() {
        home.join(".cache").join("strata")
    } else {
        PathBuf::from(".strata-cache")
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

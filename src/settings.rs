//! Persisted instrument settings using dconf
//!
//! Settings are stored in dconf under `/com/avycal/instrument/` and layered
//! over the built-in defaults; command-line flags override both.

use crate::models::{valid_chunk_size, EngineConfig};
use log::error;
use std::path::PathBuf;

const DCONF_PATH: &str = "/com/avycal/instrument/";

/// Keys for dconf settings
mod keys {
    pub const CHUNK_SIZE: &str = "chunk-size";
    pub const CACHE_DIR: &str = "cache-dir";
    pub const SWEEP_PATH: &str = "sweep-path";
}

fn key(name: &str) -> String {
    format!("{}{}", DCONF_PATH, name)
}

fn get_non_empty(name: &str) -> Option<String> {
    dconf_rs::get_string(&key(name))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn set(name: &str, value: &str) {
    if let Err(e) = dconf_rs::set_string(&key(name), value) {
        error!("Failed to save {} to dconf: {}", name, e);
    }
}

/// Get the analysis chunk size from dconf
pub fn get_chunk_size() -> Option<usize> {
    get_non_empty(keys::CHUNK_SIZE).and_then(|s| parse_chunk_size(&s))
}

/// Set the analysis chunk size in dconf
pub fn set_chunk_size(chunk_size: usize) {
    set(keys::CHUNK_SIZE, &chunk_size.to_string());
}

/// Get the cache directory override from dconf
pub fn get_cache_dir() -> Option<PathBuf> {
    get_non_empty(keys::CACHE_DIR).map(PathBuf::from)
}

/// Set the cache directory override in dconf
pub fn set_cache_dir(dir: &str) {
    set(keys::CACHE_DIR, dir);
}

/// Get the sweep file override from dconf
pub fn get_sweep_path() -> Option<PathBuf> {
    get_non_empty(keys::SWEEP_PATH).map(PathBuf::from)
}

/// Set the sweep file override in dconf; an empty value restores the bundled sweep
pub fn set_sweep_path(path: &str) {
    set(keys::SWEEP_PATH, path);
}

fn parse_chunk_size(value: &str) -> Option<usize> {
    match value.parse::<usize>() {
        Ok(n) if valid_chunk_size(n) => Some(n),
        _ => {
            error!("Ignoring invalid chunk size '{}' in dconf", value);
            None
        }
    }
}

/// Apply stored settings on top of `config`
pub fn apply(mut config: EngineConfig) -> EngineConfig {
    if let Some(chunk_size) = get_chunk_size() {
        config.chunk_size = chunk_size;
    }
    if let Some(dir) = get_cache_dir() {
        config.cache_dir = dir;
    }
    if let Some(path) = get_sweep_path() {
        config.sweep_path = Some(path);
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_size_parsing() {
        assert_eq!(parse_chunk_size("1024"), Some(1024));
        assert_eq!(parse_chunk_size("0"), None);
        assert_eq!(parse_chunk_size("1048576"), Some(1 << 20));
        assert_eq!(parse_chunk_size("1048577"), None);
        assert_eq!(parse_chunk_size("9223372036854775807"), None);
        assert_eq!(parse_chunk_size("lots"), None);
    }

    #[test]
    fn test_keys_live_under_instrument_path() {
        assert_eq!(key(keys::CHUNK_SIZE), "/com/avycal/instrument/chunk-size");
    }
}

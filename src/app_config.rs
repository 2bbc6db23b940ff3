//! Config file discovery for the CLI.

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use objstore_core::ClientConfig;
use tracing::debug;

/// Loaded config metadata.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Path that was consulted, if one could be resolved.
    pub path: Option<PathBuf>,
    /// Effective configuration.
    pub config: ClientConfig,
    /// Whether `config` came from a file.
    pub loaded_from_file: bool,
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/objstore/config.toml`
/// 2. `$HOME/.config/objstore/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    resolve_config_path_from(
        env_var_non_empty_os("XDG_CONFIG_HOME"),
        env_var_non_empty_os("HOME"),
    )
}

fn resolve_config_path_from(
    xdg_config_home: Option<OsString>,
    home: Option<OsString>,
) -> Option<PathBuf> {
    if let Some(xdg_config_home) = xdg_config_home {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("objstore")
                .join("config.toml"),
        );
    }
    let home = home?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("objstore")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads `explicit` if given (it must exist), otherwise the default path if
/// present, otherwise built-in defaults.
pub fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    if let Some(path) = explicit {
        let config = read_config(path)?;
        return Ok(LoadedConfig {
            path: Some(path.to_path_buf()),
            config,
            loaded_from_file: true,
        });
    }

    let path = resolve_default_config_path();
    match path.as_deref() {
        Some(default_path) if default_path.exists() => {
            let config = read_config(default_path)?;
            Ok(LoadedConfig {
                path,
                config,
                loaded_from_file: true,
            })
        }
        _ => {
            debug!(path = ?path, "no config file, using defaults");
            Ok(LoadedConfig {
                path,
                config: ClientConfig::default(),
                loaded_from_file: false,
            })
        }
    }
}

fn read_config(path: &Path) -> Result<ClientConfig> {
    ClientConfig::load(path)
        .with_context(|| format!("Failed to load config file '{}'", path.display()))
}

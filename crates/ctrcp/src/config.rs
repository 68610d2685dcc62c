//! Configuration for ctrcp.
//!
//! Configuration is optional; every setting has a default. The file is TOML:
//!
//! ```toml
//! [store]
//! root = "/var/lib/ctrcp"
//!
//! [copy]
//! max_symlinks = 40
//! preserve_permissions = true
//! preserve_ownership = false
//! preserve_mtime = true
//! ```
//!
//! # Locations
//!
//! The first existing file wins:
//! - `$CTRCP_CONFIG`
//! - `$XDG_CONFIG_HOME/ctrcp/ctrcp.toml`, else `~/.config/ctrcp/ctrcp.toml`
//! - `/etc/ctrcp/ctrcp.toml`
//!
//! The store root is taken from, in order: an explicit path (`--root`),
//! `$CTRCP_STORE_ROOT`, `store.root` from the file, the rootless location
//! `$XDG_DATA_HOME/ctrcp` (or `~/.local/share/ctrcp`) if it exists, and
//! finally `/var/lib/ctrcp`.

use std::env;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{CopyError, Result};
use crate::extract::ExtractionOptions;
use crate::resolve::DEFAULT_MAX_SYMLINKS;
use crate::transfer::TransferOptions;

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "CTRCP_CONFIG";
/// Environment variable naming the store root.
pub const STORE_ROOT_ENV: &str = "CTRCP_STORE_ROOT";
/// System-wide store root.
pub const SYSTEM_STORE_ROOT: &str = "/var/lib/ctrcp";
/// System-wide config file.
pub const SYSTEM_CONFIG: &str = "/etc/ctrcp/ctrcp.toml";

/// Parsed configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CopyConfig {
    /// Store location.
    #[serde(default)]
    pub store: StoreSection,
    /// Copy behavior.
    #[serde(default)]
    pub copy: CopySection,
}

/// The `[store]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreSection {
    /// Store root directory.
    #[serde(default)]
    pub root: Option<PathBuf>,
}

/// The `[copy]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CopySection {
    /// Symlinks followed per resolution before failing.
    pub max_symlinks: usize,
    /// Apply archived mode bits when extracting.
    pub preserve_permissions: bool,
    /// Apply archived uid/gid when extracting.
    pub preserve_ownership: bool,
    /// Apply archived modification times when extracting.
    pub preserve_mtime: bool,
}

impl Default for CopySection {
    fn default() -> Self {
        let extraction = ExtractionOptions::default();
        Self {
            max_symlinks: DEFAULT_MAX_SYMLINKS,
            preserve_permissions: extraction.preserve_permissions,
            preserve_ownership: extraction.preserve_ownership,
            preserve_mtime: extraction.preserve_mtime,
        }
    }
}

impl CopyConfig {
    /// Parse configuration from TOML content.
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Read and parse one file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CopyError::from_io(e, path))?;
        Self::from_toml(&content)
    }

    /// Load the first config file found in the standard locations, or the
    /// defaults if there is none.
    ///
    /// An explicit `path` must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        for candidate in Self::search_paths() {
            if candidate.is_file() {
                tracing::debug!("using config {}", candidate.display());
                return Self::from_file(&candidate);
            }
        }
        Ok(Self::default())
    }

    /// Config file locations, highest priority first.
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Ok(path) = env::var(CONFIG_ENV) {
            paths.push(PathBuf::from(path));
        }

        if let Ok(xdg_config) = env::var("XDG_CONFIG_HOME") {
            paths.push(PathBuf::from(xdg_config).join("ctrcp/ctrcp.toml"));
        } else if let Ok(home) = env::var("HOME") {
            paths.push(PathBuf::from(home).join(".config/ctrcp/ctrcp.toml"));
        }

        paths.push(PathBuf::from(SYSTEM_CONFIG));
        paths
    }

    /// Pick the store root.
    pub fn store_root(&self, explicit: Option<&Path>) -> PathBuf {
        let env_root = env::var_os(STORE_ROOT_ENV).map(PathBuf::from);
        choose_store_root(
            explicit,
            env_root.as_deref(),
            self.store.root.as_deref(),
            &rootless_store_roots(),
        )
    }

    /// Transfer options from the `[copy]` table.
    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            max_symlinks: self.copy.max_symlinks,
            extraction: ExtractionOptions {
                preserve_permissions: self.copy.preserve_permissions,
                preserve_ownership: self.copy.preserve_ownership,
                preserve_mtime: self.copy.preserve_mtime,
            },
        }
    }
}

/// Rootless store candidates, used only if they exist.
fn rootless_store_roots() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(xdg_data) = env::var("XDG_DATA_HOME") {
        paths.push(PathBuf::from(xdg_data).join("ctrcp"));
    }
    if let Ok(home) = env::var("HOME") {
        paths.push(PathBuf::from(home).join(".local/share/ctrcp"));
    }
    paths
}

fn choose_store_root(
    explicit: Option<&Path>,
    env_root: Option<&Path>,
    config_root: Option<&Path>,
    rootless: &[PathBuf],
) -> PathBuf {
    explicit
        .or(env_root)
        .or(config_root)
        .map(Path::to_path_buf)
        .or_else(|| rootless.iter().find(|p| p.is_dir()).cloned())
        .unwrap_or_else(|| PathBuf::from(SYSTEM_STORE_ROOT))
}

//! Directory layout for macos-virt.
//!
//! Provides a single `VirtPaths` struct that resolves every standard location
//! once at start-up and is passed to the controller explicitly:
//!
//! - Config:     `~/.config/macos-virt/`            (settings, identity keys)
//! - VMs:        `~/.config/macos-virt/vms/<name>/` (one directory per VM)
//! - Base files: `~/.config/macos-virt/base-files/<profile>/`
//! - Logs:       `~/Library/Logs/macos-virt/`       (macOS) or XDG data dir
//!
//! `XDG_CONFIG_HOME` is honoured on every platform.

use std::path::{Path, PathBuf};
use tracing::debug;

const APP_NAME: &str = "macos-virt";

/// File name of the host identity private key inside the config directory.
pub const IDENTITY_FILENAME: &str = "macos-virt-identity";

/// All resolved application directory paths.
#[derive(Debug, Clone)]
pub struct VirtPaths {
    /// Settings and identity material: `~/.config/macos-virt/`
    pub config: PathBuf,
    /// Per-VM directories
    pub vms: PathBuf,
    /// Downloaded kernel/initrd/disk per profile
    pub base_files: PathBuf,
    /// Application logs
    pub logs: PathBuf,
}

impl VirtPaths {
    /// Resolve all paths from the user's home directory.
    /// Does not create any directories — call `ensure()` for that.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;
        Some(Self::under(resolve_config_dir(&home), resolve_log_dir(&home)))
    }

    /// Lay out every path beneath an explicit config root.
    pub fn under(config: PathBuf, logs: PathBuf) -> Self {
        Self {
            vms: config.join("vms"),
            base_files: config.join("base-files"),
            config,
            logs,
        }
    }

    /// Create all directories that don't already exist.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.config, &self.vms, &self.base_files, &self.logs] {
            std::fs::create_dir_all(dir)?;
            debug!("ensured directory: {}", dir.display());
        }
        Ok(())
    }

    /// `config.toml` inside the config directory.
    pub fn settings_file(&self) -> PathBuf {
        self.config.join("config.toml")
    }

    /// Host identity private key; the public half sits beside it with `.pub`.
    pub fn identity_key(&self) -> PathBuf {
        self.config.join(IDENTITY_FILENAME)
    }

    /// Cache directory for one profile's base files.
    pub fn profile_cache(&self, profile_id: &str) -> PathBuf {
        self.base_files.join(profile_id)
    }
}

// ---------------------------------------------------------------------------
// Platform-specific path resolution
// ---------------------------------------------------------------------------

fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME).join("logs")
    } else {
        home.join(".local").join("share").join(APP_NAME).join("logs")
    }
}

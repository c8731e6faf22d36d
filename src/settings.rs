//! User-tunable settings, read from `~/.config/macos-virt/config.toml`.
//!
//! Every field has a default so a partial (or absent) file is valid. The
//! settings are loaded once in `main` and handed to the controller.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Runner binary looked up on `$PATH` when `runner` is not set.
pub const DEFAULT_RUNNER: &str = "macos-virt-runner";

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Explicit path to the hypervisor runner binary.
    pub runner: Option<PathBuf>,

    /// Textual prefix identifying the guest's address on the host NAT network.
    pub nat_prefix: String,

    /// How long to wait for the runner to expose the control device.
    pub control_device_timeout_secs: u64,

    /// Maximum silence tolerated on the control channel.
    pub channel_read_timeout_secs: u64,

    /// How long a graceful stop waits for the runner to exit.
    pub stop_timeout_secs: u64,

    /// Interval between pid-file liveness probes.
    pub liveness_poll_ms: u64,

    /// ISO writer to use instead of auto-detection (`hdiutil`, `mkisofs`,
    /// `genisoimage` or `xorriso`).
    pub iso_tool: Option<String>,

    /// Guest login used by `shell`/`cp`; defaults to the invoking user.
    pub ssh_user: Option<String>,

    /// Start a detached `screen` session on the guest console after boot.
    pub attach_console: bool,

    /// Size of the boot volume created at provision time.
    pub boot_volume_mib: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            runner: None,
            nat_prefix: "192.168.".to_string(),
            control_device_timeout_secs: 10,
            channel_read_timeout_secs: 300,
            stop_timeout_secs: 60,
            liveness_poll_ms: 500,
            iso_tool: None,
            ssh_user: None,
            attach_console: true,
            boot_volume_mib: 256,
        }
    }
}

impl Settings {
    pub fn from_toml(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn control_device_timeout(&self) -> Duration {
        Duration::from_secs(self.control_device_timeout_secs)
    }

    pub fn channel_read_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_read_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn liveness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_poll_ms)
    }
}

//! Guest control protocol types.
//!
//! Messages travel as one JSON object per line over the VM's control serial
//! device. The guest agent terminates lines with `\r\n`; the host writes `\n`.
//!
//! Host → guest messages are tagged by `message_type`; guest → host messages
//! are tagged by `status`. Heartbeat fields are all optional on the wire so
//! an older agent that omits some of them still decodes.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Host → guest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum HostMessage {
    /// Ask the guest to power off.
    Poweroff,
    /// Set the guest clock to `time` (seconds since the Unix epoch).
    TimeUpdate { time: i64 },
    /// Ask the guest for an immediate heartbeat.
    Status,
}

impl HostMessage {
    /// A `time_update` carrying the host's current clock.
    pub fn time_update_now() -> Self {
        HostMessage::TimeUpdate { time: chrono::Utc::now().timestamp() }
    }
}

// ---------------------------------------------------------------------------
// Guest → host
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GuestMessage {
    /// The agent is up and first-boot provisioning is in progress.
    Initializing,
    /// First-boot provisioning finished successfully.
    InitializationComplete,
    /// First-boot provisioning failed inside the guest.
    InitializationError,
    /// Periodic (or requested) resource report.
    #[serde(rename = "running")]
    Heartbeat(Heartbeat),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(default)]
    pub cpu_count: u32,
    /// Percent.
    #[serde(default)]
    pub cpu_usage: f64,
    /// Percent.
    #[serde(default)]
    pub memory_usage: f64,
    /// Percent.
    #[serde(default)]
    pub root_fs_usage: f64,
    #[serde(default)]
    pub processes: u64,
    /// Seconds since guest boot.
    #[serde(default)]
    pub uptime: u64,
    /// Raw `/proc/mounts` content.
    #[serde(default)]
    pub mounts: String,
    /// `(address, netmask)` pairs of the guest's primary interface.
    #[serde(default)]
    pub network_addresses: Vec<(String, String)>,
}

impl Heartbeat {
    /// The first reported address whose text starts with `prefix`.
    ///
    /// This is deliberately narrow: it only recognises the host NAT network
    /// by its textual prefix and ignores every other interface address.
    pub fn primary_address(&self, prefix: &str) -> Option<Ipv4Addr> {
        self.network_addresses
            .iter()
            .filter(|(addr, _)| addr.starts_with(prefix))
            .find_map(|(addr, _)| addr.parse().ok())
    }
}

//! The persisted per-VM record (`vm.json`).

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, VirtError};

/// Longest accepted VM name.
pub const MAX_NAME_LEN: usize = 64;

/// Lifecycle status as persisted in the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    Uninitialized,
    Provisioning,
    Initializing,
    Initialized,
    Running,
    Stopped,
    Error,
}

impl VmStatus {
    /// True once boot media exists and first boot has been attempted.
    pub fn is_provisioned(self) -> bool {
        !matches!(self, VmStatus::Uninitialized | VmStatus::Provisioning)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VmStatus::Uninitialized => "uninitialized",
            VmStatus::Provisioning => "provisioning",
            VmStatus::Initializing => "initializing",
            VmStatus::Initialized => "initialized",
            VmStatus::Running => "running",
            VmStatus::Stopped => "stopped",
            VmStatus::Error => "error",
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A locally administered unicast MAC address in the `52:54:00` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn generate() -> Self {
        let random = uuid::Uuid::new_v4();
        let bytes = random.as_bytes();
        Self([0x52, 0x54, 0x00, bytes[0], bytes[1], bytes[2]])
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddress {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.split(':');
        for slot in out.iter_mut() {
            let part = parts.next().ok_or_else(|| format!("too few octets in {s:?}"))?;
            if part.len() != 2 {
                return Err(format!("bad octet {part:?} in {s:?}"));
            }
            *slot = u8::from_str_radix(part, 16).map_err(|e| format!("bad octet {part:?}: {e}"))?;
        }
        if parts.next().is_some() {
            return Err(format!("too many octets in {s:?}"));
        }
        Ok(Self(out))
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Configuration and status of one VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRecord {
    pub name: String,
    pub profile: String,
    pub memory_mb: u32,
    pub cpu_count: u32,
    pub disk_size_mb: u64,
    pub mac_address: MacAddress,
    #[serde(default)]
    pub ip_address: Option<Ipv4Addr>,
    pub status: VmStatus,
    /// Set once the guest reports `initialization_complete`; later boots,
    /// including re-drives, skip the provisioning volume.
    #[serde(default)]
    pub first_boot_complete: bool,
    #[serde(default)]
    pub mount_home_directory: bool,
    pub created_at: DateTime<Utc>,
}

impl VmRecord {
    /// A fresh `uninitialized` record with a newly generated MAC address.
    pub fn new(
        name: &str,
        profile: &str,
        memory_mb: u32,
        cpu_count: u32,
        disk_size_mb: u64,
        mount_home_directory: bool,
    ) -> Result<Self> {
        validate_name(name)?;
        if memory_mb == 0 || cpu_count == 0 || disk_size_mb == 0 {
            return Err(VirtError::Config(
                "memory, cpu count and disk size must be positive".to_string(),
            ));
        }
        Ok(Self {
            name: name.to_string(),
            profile: profile.to_string(),
            memory_mb,
            cpu_count,
            disk_size_mb,
            mac_address: MacAddress::generate(),
            ip_address: None,
            status: VmStatus::Uninitialized,
            first_boot_complete: false,
            mount_home_directory,
            created_at: Utc::now(),
        })
    }
}

/// Reject names that are unsafe as a single path component.
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid { Ok(()) } else { Err(VirtError::InvalidName(name.to_string())) }
}

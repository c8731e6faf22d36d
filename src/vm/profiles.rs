//! Guest image profiles.
//!
//! A profile is plain data: where its kernel, initrd and root disk come
//! from, how the downloaded disk is unpacked, how later boots find their
//! kernel, and what it adds to the first-boot cloud-config. The registry is
//! built once per invocation and can be extended with custom profiles.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Result, VirtError};

pub const DEFAULT_PROFILE: &str = "ubuntu-20.04";

/// Kernel command line shared by the built-in profiles.
pub const DEFAULT_CMDLINE: &str = "console=hvc0 irqfixup quiet root=/dev/vda";

pub const KERNEL_FILENAME: &str = "kernel";
pub const INITRD_FILENAME: &str = "initrd";
pub const DISK_FILENAME: &str = "disk.img";

/// How the downloaded disk artifact becomes a raw image.
#[derive(Debug, Clone, PartialEq)]
pub enum DiskTransform {
    /// The download is already a raw disk image.
    Raw,
    /// The download is a `.tar.gz`; the image is the member called `member`.
    UntarMember { member: String },
}

/// Where non-first boots get their kernel and initrd.
#[derive(Debug, Clone, PartialEq)]
pub enum BootSource {
    /// Read from the FAT boot volume that the guest populated on first
    /// boot. The newest (lexically last) root entry containing each pattern
    /// is used.
    BootVolume { kernel_pattern: String, initrd_pattern: String },
    /// Reuse the kernel and initrd copied into the VM directory at
    /// provision time.
    BaseFiles,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub id: String,
    pub description: String,
    pub kernel_url: Option<String>,
    pub initrd_url: Option<String>,
    pub disk_url: Option<String>,
    pub disk_transform: DiskTransform,
    pub boot_source: BootSource,
    pub cmdline: String,
    /// Extra `runcmd` entries appended to the generated cloud-config.
    pub runcmd: Vec<String>,
}

/// Cached artifacts of one profile.
#[derive(Debug, Clone, PartialEq)]
pub struct BaseFiles {
    pub kernel: PathBuf,
    pub initrd: PathBuf,
    pub disk: PathBuf,
}

impl BaseFiles {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            kernel: dir.join(KERNEL_FILENAME),
            initrd: dir.join(INITRD_FILENAME),
            disk: dir.join(DISK_FILENAME),
        }
    }

    pub fn all_present(&self) -> bool {
        [&self.kernel, &self.initrd, &self.disk].iter().all(|p| p.is_file())
    }
}

/// Debian-style name of the host CPU architecture.
pub fn host_arch() -> &'static str {
    if cfg!(target_arch = "x86_64") { "amd64" } else { "arm64" }
}

struct UbuntuRelease {
    version: &'static str,
    codename: &'static str,
    /// Release directory under `releases/<codename>/` holding the disk.
    disk_release: &'static str,
    /// Release directory holding the unpacked kernel and initrd.
    unpacked_release: &'static str,
}

const UBUNTU_RELEASES: &[UbuntuRelease] = &[
    UbuntuRelease {
        version: "20.04",
        codename: "focal",
        disk_release: "release-20220302",
        unpacked_release: "release-20220302",
    },
    UbuntuRelease {
        version: "21.04",
        codename: "hirsute",
        disk_release: "release",
        unpacked_release: "release",
    },
    UbuntuRelease {
        version: "21.10",
        codename: "impish",
        disk_release: "release-20220118",
        unpacked_release: "release",
    },
];

fn ubuntu_profile(release: &UbuntuRelease, arch: &str) -> Profile {
    let base = format!("https://cloud-images.ubuntu.com/releases/{}", release.codename);
    let unpacked = format!(
        "{base}/{}/unpacked/ubuntu-{}-server-cloudimg-{arch}",
        release.unpacked_release, release.version
    );
    Profile {
        id: format!("ubuntu-{}", release.version),
        description: format!("Ubuntu {} ({}) server cloud image", release.version, release.codename),
        kernel_url: Some(format!("{unpacked}-vmlinuz-generic")),
        initrd_url: Some(format!("{unpacked}-initrd-generic")),
        disk_url: Some(format!(
            "{base}/{}/ubuntu-{}-server-cloudimg-{arch}.tar.gz",
            release.disk_release, release.version
        )),
        disk_transform: DiskTransform::UntarMember {
            member: format!("{}-server-cloudimg-{arch}.img", release.codename),
        },
        boot_source: BootSource::BootVolume {
            kernel_pattern: "vmlinuz".to_string(),
            initrd_pattern: "initrd".to_string(),
        },
        cmdline: DEFAULT_CMDLINE.to_string(),
        runcmd: vec!["systemctl mask --now unattended-upgrades.service".to_string()],
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
    profiles: BTreeMap<String, Profile>,
}

impl ProfileRegistry {
    /// The built-in Ubuntu profiles for the host architecture.
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        for release in UBUNTU_RELEASES {
            registry.register(ubuntu_profile(release, host_arch()));
        }
        registry
    }

    /// Add or replace a profile.
    pub fn register(&mut self, profile: Profile) {
        self.profiles.insert(profile.id.clone(), profile);
    }

    pub fn get(&self, id: &str) -> Result<&Profile> {
        self.profiles.get(id).ok_or_else(|| VirtError::UnknownProfile(id.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Profile> {
        self.profiles.values()
    }
}

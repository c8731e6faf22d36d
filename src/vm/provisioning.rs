//! Boot media assembly for a VM's first boot.
//!
//! [`BootMediaBuilder::provision`] lays out everything the runner needs in
//! the VM directory:
//!
//! ```text
//! root.img       clone of the profile disk, grown to the requested size
//! boot.img       zeros (256 MiB by default); the guest formats it on first boot
//! kernel/initrd  VM-local copies of the profile's boot files
//! cloudinit.iso  `cidata` volume with meta-data + user-data
//! ```
//!
//! The builder is synchronous; the controller runs it on the blocking pool.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use crate::error::{Result, VirtError};
use crate::vm::codecs::MediaTools;
use crate::vm::filesystem::{self, MIB};
use crate::vm::profiles::{BaseFiles, BootSource, Profile};
use crate::vm::record::VmRecord;
use crate::vm::supervisor::{BOOT_VOLUME, CONFIG_VOLUME, HOME_SHARE_TAG, ROOT_DISK};

pub const BOOT_VOLUME_MIB: u64 = 256;
pub const CONFIG_VOLUME_ID: &str = "cidata";
pub const BOOT_FILES_DIR: &str = "boot-files";

/// Where the guest sees the shared host home directory.
pub const HOME_MOUNT_POINT: &str = "/mnt/user-home";

const AGENT_SCRIPT: &str = include_str!("../../assets/guest/macos-virt-agent.sh");
const AGENT_UNIT: &str = include_str!("../../assets/guest/macos-virt-agent.service");
const BOOT_INSTALLER: &str = include_str!("../../assets/guest/install-boot-files.sh");

const AGENT_PATH: &str = "/usr/local/sbin/macos-virt-agent";
const AGENT_UNIT_PATH: &str = "/etc/systemd/system/macos-virt-agent.service";
const BOOT_INSTALLER_PATH: &str = "/usr/local/sbin/macos-virt-install-boot";

/// Media files of one VM.
#[derive(Debug, Clone, PartialEq)]
pub struct BootMedia {
    pub root_disk: PathBuf,
    pub boot_volume: PathBuf,
    pub config_volume: PathBuf,
    pub kernel: PathBuf,
    pub initrd: PathBuf,
}

impl BootMedia {
    pub fn in_dir(vm_dir: &Path) -> Self {
        Self {
            root_disk: vm_dir.join(ROOT_DISK),
            boot_volume: vm_dir.join(BOOT_VOLUME),
            config_volume: vm_dir.join(CONFIG_VOLUME),
            kernel: vm_dir.join("kernel"),
            initrd: vm_dir.join("initrd"),
        }
    }

    /// True when every file from a completed provision is on disk.
    pub fn is_complete(&self) -> bool {
        [&self.root_disk, &self.boot_volume, &self.config_volume, &self.kernel, &self.initrd]
            .iter()
            .all(|p| p.is_file())
    }
}

/// Guest login created by cloud-init.
#[derive(Debug, Clone)]
pub struct GuestUser {
    pub name: String,
    pub public_key: String,
}

pub struct BootMediaBuilder<'a> {
    tools: &'a dyn MediaTools,
    boot_volume_mib: u64,
}

impl<'a> BootMediaBuilder<'a> {
    pub fn new(tools: &'a dyn MediaTools) -> Self {
        Self { tools, boot_volume_mib: BOOT_VOLUME_MIB }
    }

    pub fn boot_volume_mib(mut self, size: u64) -> Self {
        self.boot_volume_mib = size;
        self
    }

    /// Build all boot media for `record` in `vm_dir`.
    ///
    /// Refuses records past provisioning, and disks smaller than the base
    /// image; both checks happen before anything is written.
    pub fn provision(
        &self,
        record: &VmRecord,
        profile: &Profile,
        base: &BaseFiles,
        vm_dir: &Path,
        user: &GuestUser,
    ) -> Result<BootMedia> {
        if record.status.is_provisioned() {
            return Err(VirtError::AlreadyProvisioned(record.name.clone()));
        }
        let base_bytes = std::fs::metadata(&base.disk)?.len();
        let capacity = record.disk_size_mb * MIB;
        if base_bytes > capacity {
            return Err(VirtError::DiskTooSmall { requested_mb: record.disk_size_mb, base_bytes });
        }

        std::fs::create_dir_all(vm_dir)?;
        let media = BootMedia::in_dir(vm_dir);

        info!(vm = %record.name, "cloning root disk");
        filesystem::clone_disk(&base.disk, &media.root_disk)?;
        let blocks = filesystem::pad_to_capacity(&media.root_disk, capacity)?;
        info!(vm = %record.name, blocks, "root disk expanded");

        filesystem::create_zero_volume(&media.boot_volume, self.boot_volume_mib)?;
        filesystem::install_kernel(&base.kernel, &media.kernel)?;
        std::fs::copy(&base.initrd, &media.initrd)?;

        let meta_data = render_meta_data(record);
        let user_data = render_user_data(record, profile, user)?;
        self.tools.write_config_volume(
            &media.config_volume,
            CONFIG_VOLUME_ID,
            &[("meta-data", meta_data.as_bytes()), ("user-data", user_data.as_bytes())],
        )?;
        info!(vm = %record.name, "boot media ready");

        Ok(media)
    }

    /// Kernel and initrd for a boot that does not attach the provisioning
    /// volume.
    pub fn boot_files(&self, profile: &Profile, vm_dir: &Path) -> Result<(PathBuf, PathBuf)> {
        let media = BootMedia::in_dir(vm_dir);
        match &profile.boot_source {
            BootSource::BaseFiles => {
                for path in [&media.kernel, &media.initrd] {
                    if !path.is_file() {
                        return Err(VirtError::CorruptState {
                            path: path.clone(),
                            reason: "boot file missing".to_string(),
                        });
                    }
                }
                Ok((media.kernel, media.initrd))
            }
            BootSource::BootVolume { kernel_pattern, initrd_pattern } => {
                let names = self.tools.list_boot_volume(&media.boot_volume)?;
                let (kernel_name, initrd_name) =
                    select_boot_files(&names, kernel_pattern, initrd_pattern).ok_or_else(|| {
                        VirtError::CorruptState {
                            path: media.boot_volume.clone(),
                            reason: format!(
                                "no entries matching {kernel_pattern:?} and {initrd_pattern:?}"
                            ),
                        }
                    })?;

                let out = vm_dir.join(BOOT_FILES_DIR);
                std::fs::create_dir_all(&out)?;
                let raw_kernel = out.join(&kernel_name);
                let kernel = out.join("kernel");
                let initrd = out.join("initrd");
                self.tools.read_boot_file(&media.boot_volume, &kernel_name, &raw_kernel)?;
                self.tools.read_boot_file(&media.boot_volume, &initrd_name, &initrd)?;
                filesystem::install_kernel(&raw_kernel, &kernel)?;
                std::fs::remove_file(&raw_kernel)?;
                info!(kernel = %kernel_name, initrd = %initrd_name, "boot files read from boot volume");
                Ok((kernel, initrd))
            }
        }
    }
}

/// The lexically last entries containing each pattern.
pub fn select_boot_files(
    names: &[String],
    kernel_pattern: &str,
    initrd_pattern: &str,
) -> Option<(String, String)> {
    let newest = |pattern: &str| names.iter().filter(|n| n.contains(pattern)).max().cloned();
    Some((newest(kernel_pattern)?, newest(initrd_pattern)?))
}

// ---------------------------------------------------------------------------
// cloud-init payload
// ---------------------------------------------------------------------------

pub fn render_meta_data(record: &VmRecord) -> String {
    format!(
        "instance-id: {}-{}\nlocal-hostname: {}\n",
        record.name,
        uuid::Uuid::new_v4().simple(),
        record.name
    )
}

#[derive(Debug, Serialize)]
struct CloudConfig {
    users: Vec<CloudUser>,
    write_files: Vec<WriteFile>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    mounts: Vec<[String; 6]>,
    runcmd: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum CloudUser {
    Default(&'static str),
    Login {
        name: String,
        gecos: String,
        sudo: String,
        shell: String,
        ssh_authorized_keys: Vec<String>,
    },
}

#[derive(Debug, Serialize)]
struct WriteFile {
    path: String,
    permissions: String,
    content: String,
}

impl WriteFile {
    fn new(path: &str, permissions: &str, content: &str) -> Self {
        Self { path: path.to_string(), permissions: permissions.to_string(), content: content.to_string() }
    }
}

pub fn render_user_data(record: &VmRecord, profile: &Profile, user: &GuestUser) -> Result<String> {
    let mut runcmd = vec![
        BOOT_INSTALLER_PATH.to_string(),
        "systemctl daemon-reload".to_string(),
        "systemctl enable --now --no-block macos-virt-agent.service".to_string(),
    ];
    runcmd.extend(profile.runcmd.iter().cloned());

    let mounts = if record.mount_home_directory {
        vec![[
            HOME_SHARE_TAG.to_string(),
            HOME_MOUNT_POINT.to_string(),
            "virtiofs".to_string(),
            "defaults,nofail".to_string(),
            "0".to_string(),
            "0".to_string(),
        ]]
    } else {
        vec![]
    };

    let config = CloudConfig {
        users: vec![
            CloudUser::Default("default"),
            CloudUser::Login {
                name: user.name.clone(),
                gecos: user.name.clone(),
                sudo: "ALL=(ALL) NOPASSWD:ALL".to_string(),
                shell: "/bin/bash".to_string(),
                ssh_authorized_keys: vec![user.public_key.clone()],
            },
        ],
        write_files: vec![
            WriteFile::new(AGENT_PATH, "0755", AGENT_SCRIPT),
            WriteFile::new(AGENT_UNIT_PATH, "0644", AGENT_UNIT),
            WriteFile::new(BOOT_INSTALLER_PATH, "0755", BOOT_INSTALLER),
        ],
        mounts,
        runcmd,
    };
    Ok(format!("#cloud-config\n{}", serde_yaml_ng::to_string(&config)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::profiles::{DEFAULT_PROFILE, DiskTransform, ProfileRegistry};
    use crate::vm::record::VmStatus;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Records written volumes in memory and serves a fixed boot volume.
    #[derive(Default)]
    struct FakeTools {
        written: Mutex<BTreeMap<String, Vec<u8>>>,
        boot_entries: BTreeMap<String, Vec<u8>>,
    }

    impl MediaTools for FakeTools {
        fn write_config_volume(&self, dest: &Path, volume_id: &str, entries: &[(&str, &[u8])]) -> Result<()> {
            assert_eq!(volume_id, CONFIG_VOLUME_ID);
            std::fs::write(dest, b"iso")?;
            let mut written = self.written.lock().unwrap();
            for (name, data) in entries {
                written.insert(name.to_string(), data.to_vec());
            }
            Ok(())
        }

        fn list_boot_volume(&self, _volume: &Path) -> Result<Vec<String>> {
            Ok(self.boot_entries.keys().cloned().collect())
        }

        fn read_boot_file(&self, _volume: &Path, name: &str, dest: &Path) -> Result<()> {
            std::fs::write(dest, &self.boot_entries[name])?;
            Ok(())
        }
    }

    fn base_files(dir: &Path, disk_bytes: usize) -> BaseFiles {
        let files = BaseFiles::in_dir(dir);
        std::fs::write(&files.kernel, b"kernel").unwrap();
        std::fs::write(&files.initrd, b"initrd").unwrap();
        std::fs::write(&files.disk, vec![1u8; disk_bytes]).unwrap();
        files
    }

    fn mkdir(path: PathBuf) -> PathBuf {
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    fn user() -> GuestUser {
        GuestUser { name: "alice".to_string(), public_key: "ssh-ed25519 AAAAC3 alice@host".to_string() }
    }

    fn profile() -> Profile {
        ProfileRegistry::builtin().get(DEFAULT_PROFILE).unwrap().clone()
    }

    #[test]
    fn provision_lays_out_all_media() {
        let tmp = tempfile::tempdir().unwrap();
        let base = base_files(&mkdir(tmp.path().join("base")), (MIB + 5) as usize);
        let vm_dir = tmp.path().join("vm");
        let record = VmRecord::new("default", DEFAULT_PROFILE, 1024, 1, 3, false).unwrap();
        let tools = FakeTools::default();

        let media = BootMediaBuilder::new(&tools)
            .boot_volume_mib(2)
            .provision(&record, &profile(), &base, &vm_dir, &user())
            .unwrap();

        assert!(media.is_complete());
        assert_eq!(std::fs::metadata(&media.root_disk).unwrap().len(), MIB + 5 + 2 * MIB);
        assert_eq!(std::fs::metadata(&media.boot_volume).unwrap().len(), 2 * MIB);
        assert_eq!(std::fs::read(&media.kernel).unwrap(), b"kernel");

        let written = tools.written.lock().unwrap();
        assert_eq!(written.keys().collect::<Vec<_>>(), vec!["meta-data", "user-data"]);
        let meta = String::from_utf8(written["meta-data"].clone()).unwrap();
        assert!(meta.contains("local-hostname: default\n"));
    }

    #[test]
    fn disk_smaller_than_base_is_rejected_before_writing() {
        let tmp = tempfile::tempdir().unwrap();
        let base = base_files(&mkdir(tmp.path().join("base")), (2 * MIB + 1) as usize);
        let vm_dir = tmp.path().join("vm");
        let record = VmRecord::new("default", DEFAULT_PROFILE, 1024, 1, 2, false).unwrap();

        let err = BootMediaBuilder::new(&FakeTools::default())
            .provision(&record, &profile(), &base, &vm_dir, &user())
            .unwrap_err();
        assert!(matches!(err, VirtError::DiskTooSmall { requested_mb: 2, .. }));
        assert!(!vm_dir.exists());
    }

    #[test]
    fn provisioned_record_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let base = base_files(tmp.path(), 10);
        let mut record = VmRecord::new("default", DEFAULT_PROFILE, 1024, 1, 5, false).unwrap();
        for status in [VmStatus::Initializing, VmStatus::Running, VmStatus::Stopped, VmStatus::Error] {
            record.status = status;
            let err = BootMediaBuilder::new(&FakeTools::default())
                .provision(&record, &profile(), &base, &tmp.path().join("vm"), &user())
                .unwrap_err();
            assert!(matches!(err, VirtError::AlreadyProvisioned(_)));
        }
    }

    #[test]
    fn user_data_is_cloud_config_with_login_and_agent() {
        let record = VmRecord::new("default", DEFAULT_PROFILE, 1024, 1, 5, false).unwrap();
        let text = render_user_data(&record, &profile(), &user()).unwrap();

        assert!(text.starts_with("#cloud-config\n"));
        let doc: serde_yaml_ng::Value = serde_yaml_ng::from_str(&text).unwrap();
        assert_eq!(doc["users"][0], serde_yaml_ng::Value::from("default"));
        assert_eq!(doc["users"][1]["name"], serde_yaml_ng::Value::from("alice"));
        assert_eq!(
            doc["users"][1]["ssh_authorized_keys"][0],
            serde_yaml_ng::Value::from("ssh-ed25519 AAAAC3 alice@host")
        );
        let paths: Vec<_> = doc["write_files"]
            .as_sequence()
            .unwrap()
            .iter()
            .map(|f| f["path"].as_str().unwrap().to_string())
            .collect();
        assert!(paths.contains(&AGENT_PATH.to_string()));
        assert!(doc.get("mounts").is_none());
        let runcmd = doc["runcmd"].as_sequence().unwrap();
        assert_eq!(runcmd[0], serde_yaml_ng::Value::from(BOOT_INSTALLER_PATH));
        assert_eq!(runcmd.last().unwrap(), &serde_yaml_ng::Value::from(profile().runcmd[0].as_str()));
    }

    #[test]
    fn home_share_adds_virtiofs_mount() {
        let record = VmRecord::new("default", DEFAULT_PROFILE, 1024, 1, 5, true).unwrap();
        let text = render_user_data(&record, &profile(), &user()).unwrap();
        let doc: serde_yaml_ng::Value = serde_yaml_ng::from_str(&text).unwrap();
        assert_eq!(doc["mounts"][0][0], serde_yaml_ng::Value::from(HOME_SHARE_TAG));
        assert_eq!(doc["mounts"][0][2], serde_yaml_ng::Value::from("virtiofs"));
    }

    #[test]
    fn newest_boot_files_are_selected() {
        let names: Vec<String> = [
            "vmlinuz-5.4.0-100-generic",
            "vmlinuz-5.4.0-104-generic",
            "initrd.img-5.4.0-100-generic",
            "initrd.img-5.4.0-104-generic",
            "README",
        ]
        .map(String::from)
        .to_vec();
        assert_eq!(
            select_boot_files(&names, "vmlinuz", "initrd"),
            Some(("vmlinuz-5.4.0-104-generic".to_string(), "initrd.img-5.4.0-104-generic".to_string()))
        );
        assert_eq!(select_boot_files(&names[..2], "vmlinuz", "initrd"), None);
    }

    #[test]
    fn boot_files_from_boot_volume_are_extracted() {
        let tmp = tempfile::tempdir().unwrap();
        let mut tools = FakeTools::default();
        tools.boot_entries.insert("vmlinuz-5.4.0-104-generic".into(), b"K".to_vec());
        tools.boot_entries.insert("initrd.img-5.4.0-104-generic".into(), b"I".to_vec());

        let (kernel, initrd) = BootMediaBuilder::new(&tools).boot_files(&profile(), tmp.path()).unwrap();
        assert_eq!(kernel, tmp.path().join(BOOT_FILES_DIR).join("kernel"));
        assert_eq!(std::fs::read(&kernel).unwrap(), b"K");
        assert_eq!(std::fs::read(&initrd).unwrap(), b"I");
    }

    #[test]
    fn empty_boot_volume_is_corrupt_state() {
        let tmp = tempfile::tempdir().unwrap();
        let err = BootMediaBuilder::new(&FakeTools::default())
            .boot_files(&profile(), tmp.path())
            .unwrap_err();
        assert!(matches!(err, VirtError::CorruptState { .. }));
    }

    #[test]
    fn base_file_profiles_boot_from_local_copies() {
        let tmp = tempfile::tempdir().unwrap();
        let mut p = profile();
        p.boot_source = BootSource::BaseFiles;
        p.disk_transform = DiskTransform::Raw;
        let builder_tools = FakeTools::default();
        let builder = BootMediaBuilder::new(&builder_tools);

        assert!(matches!(builder.boot_files(&p, tmp.path()), Err(VirtError::CorruptState { .. })));

        std::fs::write(tmp.path().join("kernel"), b"k").unwrap();
        std::fs::write(tmp.path().join("initrd"), b"i").unwrap();
        let (kernel, _) = builder.boot_files(&p, tmp.path()).unwrap();
        assert_eq!(kernel, tmp.path().join("kernel"));
    }
}

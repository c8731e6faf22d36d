//! VM lifecycle controller.
//!
//! ## Architecture
//!
//! ```text
//! VmController::start(name)
//!     ├─► RecordStore        load / persist every status change
//!     ├─► BootMediaBuilder   first boot only (blocking pool)
//!     ├─► Supervisor         launch runner, wait for control device
//!     └─► select! {
//!             ControlChannel::receive_loop   guest status → state machine
//!             watch_liveness                 runner gone → VmStartFailure
//!             ctrl_c                         detach, VM keeps running
//!         }
//! ```
//!
//! The statig machine decides every transition; the controller persists the
//! resulting status before acting on it.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use statig::prelude::*;
use tracing::{debug, info, warn};

use crate::error::{Result, VirtError};
use crate::paths::VirtPaths;
use crate::protocol::{GuestMessage, Heartbeat, HostMessage};
use crate::settings::Settings;
use crate::state_machine::{LifecycleEvent, LifecycleMachine};
use crate::vm::channel::{ControlChannel, Flow};
use crate::vm::codecs::MediaTools;
use crate::vm::download;
use crate::vm::filesystem;
use crate::vm::identity;
use crate::vm::profiles::{Profile, ProfileRegistry};
use crate::vm::provisioning::{BootMedia, BootMediaBuilder, GuestUser};
use crate::vm::record::{VmRecord, VmStatus};
use crate::vm::remote::{self, Target};
use crate::vm::store::RecordStore;
use crate::vm::supervisor::{self, LaunchSpec, Supervisor};

type Machine = StateMachine<LifecycleMachine>;

/// Result of a controller operation that completed normally.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The VM reached `running`.
    Started { name: String, ip_address: Option<Ipv4Addr> },
    Stopped { name: String },
    Deleted { name: String },
    Updated { name: String },
    /// The operator detached; the VM keeps running.
    Interrupted { name: String },
    /// A child (`ssh`/`scp`) finished with this exit code.
    Exited { code: i32 },
    Done,
}

/// Parameters of `create`.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub name: String,
    pub profile: String,
    pub memory_mb: u32,
    pub cpu_count: u32,
    pub disk_size_mb: u64,
    pub mount_home_directory: bool,
}

/// Mutable VM settings; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub memory_mb: Option<u32>,
    pub cpu_count: Option<u32>,
    pub mount_home_directory: Option<bool>,
}

/// One row of `ls`.
#[derive(Debug, Clone)]
pub struct VmSummary {
    pub record: VmRecord,
    pub running: bool,
}

pub struct VmController {
    paths: VirtPaths,
    settings: Settings,
    registry: ProfileRegistry,
    store: RecordStore,
    tools: Arc<dyn MediaTools>,
    supervisor: Supervisor,
}

impl VmController {
    pub fn new(
        paths: VirtPaths,
        settings: Settings,
        registry: ProfileRegistry,
        tools: Arc<dyn MediaTools>,
        supervisor: Supervisor,
    ) -> Self {
        let store = RecordStore::new(paths.vms.clone());
        Self { paths, settings, registry, store, tools, supervisor }
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn registry(&self) -> &ProfileRegistry {
        &self.registry
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Create the record and provision the VM through to `running`.
    pub async fn create(&self, options: CreateOptions) -> Result<Outcome> {
        self.registry.get(&options.profile)?;
        let record = VmRecord::new(
            &options.name,
            &options.profile,
            options.memory_mb,
            options.cpu_count,
            options.disk_size_mb,
            options.mount_home_directory,
        )?;
        self.store.create(&record)?;
        info!(vm = %record.name, mac = %record.mac_address, "VM created");
        self.start(&record.name).await
    }

    /// Boot the VM, re-driving an interrupted provision when needed.
    pub async fn start(&self, name: &str) -> Result<Outcome> {
        let mut record = self.store.load(name)?;
        let vm_dir = self.store.vm_dir(name);
        if supervisor::is_alive(&vm_dir)? {
            return Err(VirtError::AlreadyRunning(name.to_string()));
        }
        let profile = self.registry.get(&record.profile)?.clone();

        let mut sm = restore(&record);
        self.reconcile_exited(&mut sm, &mut record)?;

        let spec = match record.status {
            VmStatus::Uninitialized | VmStatus::Provisioning => {
                self.apply(&mut sm, &mut record, &LifecycleEvent::BeginProvisioning, None)?;
                let media = self.provision(&record, &profile, &vm_dir).await?;
                self.first_boot_spec(&record, &profile, &media)
            }
            VmStatus::Initializing | VmStatus::Initialized if !record.first_boot_complete => {
                let media = BootMedia::in_dir(&vm_dir);
                if !media.is_complete() {
                    return Err(VirtError::CorruptState {
                        path: vm_dir,
                        reason: format!("boot media incomplete for a VM in {}", record.status),
                    });
                }
                info!(vm = %name, status = %record.status, "repeating first boot");
                self.first_boot_spec(&record, &profile, &media)
            }
            VmStatus::Initializing | VmStatus::Initialized | VmStatus::Stopped | VmStatus::Running => {
                self.restart_spec(&record, &profile, &vm_dir).await?
            }
            VmStatus::Error => return Err(VirtError::InitializationFailed(name.to_string())),
        };

        let running = self.supervisor.launch(name, &vm_dir, &spec).await?;
        self.apply(&mut sm, &mut record, &LifecycleEvent::ControlDeviceReady, None)?;
        let mut channel = ControlChannel::open(&running.control, self.settings.channel_read_timeout())?;

        tokio::select! {
            res = self.follow_boot(&mut sm, &mut record, &mut channel) => {
                res?;
                if let Err(e) = channel.send(&HostMessage::time_update_now()).await {
                    warn!(vm = %name, error = %e, "initial time sync failed");
                }
                Ok(Outcome::Started { name: name.to_string(), ip_address: record.ip_address })
            }
            res = supervisor::watch_liveness(&vm_dir, self.settings.liveness_poll_interval()) => {
                res?;
                warn!(vm = %name, "runner exited while booting");
                Err(VirtError::VmStartFailure { exit_code: None })
            }
            _ = tokio::signal::ctrl_c() => {
                info!(vm = %name, "detached, VM left running");
                Ok(Outcome::Interrupted { name: name.to_string() })
            }
        }
    }

    /// Stop the VM. Graceful stops ask the guest to power off and wait for
    /// the runner to exit; forced stops signal the runner directly.
    pub async fn stop(&self, name: &str, force: bool) -> Result<Outcome> {
        let mut record = self.store.load(name)?;
        let vm_dir = self.store.vm_dir(name);
        let mut sm = restore(&record);

        if force {
            if !supervisor::terminate(&vm_dir)? {
                return Err(VirtError::NotRunning(name.to_string()));
            }
        } else {
            if !supervisor::is_alive(&vm_dir)? {
                return Err(VirtError::NotRunning(name.to_string()));
            }
            let control = vm_dir.join(supervisor::CONTROL_LINK);
            let mut channel = ControlChannel::open(&control, self.settings.channel_read_timeout())?;
            channel.send(&HostMessage::Poweroff).await?;
            info!(vm = %name, "poweroff sent");

            let exited = supervisor::wait_for_exit(
                &vm_dir,
                self.settings.stop_timeout(),
                self.settings.liveness_poll_interval(),
            )
            .await?;
            if !exited {
                warn!(vm = %name, timeout = ?self.settings.stop_timeout(), "guest did not power off, use --force");
                return Err(VirtError::StillRunning(name.to_string()));
            }
        }

        self.apply(&mut sm, &mut record, &LifecycleEvent::ProcessExited, None)?;
        info!(vm = %name, force, "VM stopped");
        Ok(Outcome::Stopped { name: name.to_string() })
    }

    /// Remove a VM that is not running. A stale `running` record is marked
    /// stopped first; a corrupt record does not block deletion.
    pub fn delete(&self, name: &str) -> Result<Outcome> {
        let vm_dir = self.store.vm_dir(name);
        if !self.store.exists(name) {
            return Err(VirtError::NotFound(name.to_string()));
        }
        if supervisor::is_alive(&vm_dir)? {
            return Err(VirtError::StillRunning(name.to_string()));
        }
        match self.store.load(name) {
            Ok(mut record) => {
                let mut sm = restore(&record);
                self.reconcile_exited(&mut sm, &mut record)?;
            }
            Err(e @ VirtError::CorruptState { .. }) => warn!(vm = %name, error = %e, "deleting corrupt VM"),
            Err(e) => return Err(e),
        }
        self.store.delete(name)?;
        info!(vm = %name, "VM deleted");
        Ok(Outcome::Deleted { name: name.to_string() })
    }

    /// Change CPU, memory or the home share of a stopped VM.
    pub fn update(&self, name: &str, options: UpdateOptions) -> Result<Outcome> {
        let mut record = self.store.load(name)?;
        if supervisor::is_alive(&self.store.vm_dir(name))? {
            return Err(VirtError::StillRunning(name.to_string()));
        }
        if options.memory_mb == Some(0) || options.cpu_count == Some(0) {
            return Err(VirtError::Config("memory and cpu count must be positive".to_string()));
        }
        if let Some(memory_mb) = options.memory_mb {
            record.memory_mb = memory_mb;
        }
        if let Some(cpu_count) = options.cpu_count {
            record.cpu_count = cpu_count;
        }
        if let Some(mount) = options.mount_home_directory {
            if mount != record.mount_home_directory && record.status.is_provisioned() {
                warn!(vm = %name, "home share change takes effect in the guest only after re-provisioning");
            }
            record.mount_home_directory = mount;
        }
        self.store.save(&record)?;
        Ok(Outcome::Updated { name: name.to_string() })
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn list(&self) -> Result<Vec<VmSummary>> {
        let mut out = Vec::new();
        for name in self.store.list()? {
            match self.store.load(&name) {
                Ok(record) => {
                    let running = supervisor::is_alive(&self.store.vm_dir(&name))?;
                    out.push(VmSummary { record, running });
                }
                Err(e) => warn!(vm = %name, error = %e, "skipping unreadable record"),
            }
        }
        Ok(out)
    }

    pub fn is_running(&self, name: &str) -> Result<bool> {
        if !self.store.exists(name) {
            return Err(VirtError::NotFound(name.to_string()));
        }
        supervisor::is_alive(&self.store.vm_dir(name))
    }

    /// Ask the guest for one heartbeat.
    pub async fn status(&self, name: &str) -> Result<Heartbeat> {
        let mut channel = self.open_channel(name)?;
        channel.send(&HostMessage::Status).await?;
        loop {
            match channel.next_message().await? {
                Some(GuestMessage::Heartbeat(heartbeat)) => return Ok(heartbeat),
                Some(other) => debug!(vm = %name, ?other, "ignoring non-heartbeat message"),
                None => return Err(VirtError::Channel("control channel closed by guest".to_string())),
            }
        }
    }

    /// Stream heartbeats to `on_heartbeat` until Ctrl-C or channel closure.
    pub async fn watch<F>(&self, name: &str, mut on_heartbeat: F) -> Result<Outcome>
    where
        F: FnMut(&Heartbeat),
    {
        let mut channel = self.open_channel(name)?;
        channel.send(&HostMessage::Status).await?;
        let receive = channel.receive_loop(|message| {
            if let GuestMessage::Heartbeat(heartbeat) = &message {
                on_heartbeat(heartbeat);
            }
            Ok(Flow::Continue)
        });

        tokio::select! {
            res = receive => res.map(|()| Outcome::Done),
            _ = tokio::signal::ctrl_c() => Ok(Outcome::Interrupted { name: name.to_string() }),
        }
    }

    pub async fn sync_time(&self, name: &str) -> Result<Outcome> {
        let mut channel = self.open_channel(name)?;
        let message = HostMessage::time_update_now();
        channel.send(&message).await?;
        info!(vm = %name, ?message, "guest clock updated");
        Ok(Outcome::Done)
    }

    // ------------------------------------------------------------------
    // Remote access
    // ------------------------------------------------------------------

    pub async fn shell(&self, name: &str, command: &[String]) -> Result<Outcome> {
        let target = self.target(name)?;
        let code = remote::shell(&target, command).await?;
        Ok(Outcome::Exited { code })
    }

    pub async fn copy(&self, name: &str, source: &str, dest: &str, recursive: bool) -> Result<Outcome> {
        let (source, dest) = remote::parse_copy(source, dest)?;
        let target = self.target(name)?;
        let code = remote::copy(&target, &source, &dest, recursive).await?;
        Ok(Outcome::Exited { code })
    }

    fn target(&self, name: &str) -> Result<Target> {
        let record = self.store.load(name)?;
        if !supervisor::is_alive(&self.store.vm_dir(name))? {
            return Err(VirtError::NotRunning(name.to_string()));
        }
        let address = record.ip_address.ok_or_else(|| VirtError::NoAddress(name.to_string()))?;
        Ok(Target {
            user: remote::guest_user(self.settings.ssh_user.as_deref()),
            address,
            identity: self.paths.identity_key(),
        })
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn open_channel(&self, name: &str) -> Result<ControlChannel<tokio::fs::File, tokio::fs::File>> {
        if !self.is_running(name)? {
            return Err(VirtError::NotRunning(name.to_string()));
        }
        let control = self.store.vm_dir(name).join(supervisor::CONTROL_LINK);
        ControlChannel::open(&control, self.settings.channel_read_timeout())
    }

    /// Mark a `running` record whose runner is gone as stopped. Callers
    /// have already checked liveness.
    fn reconcile_exited(&self, sm: &mut Machine, record: &mut VmRecord) -> Result<()> {
        if record.status == VmStatus::Running {
            info!(vm = %record.name, "runner gone for running VM, marking stopped");
            self.apply(sm, record, &LifecycleEvent::ProcessExited, None)?;
        }
        Ok(())
    }

    /// Feed `event` to the machine and persist the status if it changed.
    /// `address` is recorded when the machine enters `running`.
    fn apply(
        &self,
        sm: &mut Machine,
        record: &mut VmRecord,
        event: &LifecycleEvent,
        address: Option<Ipv4Addr>,
    ) -> Result<VmStatus> {
        sm.handle(event);
        let Some(status) = LifecycleMachine::status(sm.state()) else {
            return Ok(record.status);
        };
        if status != record.status {
            debug!(vm = %record.name, from = %record.status, to = %status, "status change");
            record.status = status;
            match status {
                VmStatus::Running => record.ip_address = address,
                VmStatus::Provisioning => {
                    record.ip_address = None;
                    record.first_boot_complete = false;
                }
                VmStatus::Initialized => record.first_boot_complete = true,
                _ => {}
            }
            self.store.save(record)?;
        }
        Ok(status)
    }

    async fn follow_boot(
        &self,
        sm: &mut Machine,
        record: &mut VmRecord,
        channel: &mut ControlChannel<tokio::fs::File, tokio::fs::File>,
    ) -> Result<()> {
        let prefix = self.settings.nat_prefix.clone();
        channel
            .receive_loop(|message| {
                let (event, address) = match &message {
                    GuestMessage::Initializing => (LifecycleEvent::GuestInitializing, None),
                    GuestMessage::InitializationComplete => (LifecycleEvent::GuestInitialized, None),
                    GuestMessage::InitializationError => (LifecycleEvent::GuestFailed, None),
                    GuestMessage::Heartbeat(heartbeat) => {
                        let address = heartbeat.primary_address(&prefix);
                        (LifecycleEvent::Heartbeat { address }, address)
                    }
                };
                debug!(vm = %record.name, ?event, "guest message");

                match self.apply(sm, record, &event, address)? {
                    VmStatus::Running => {
                        info!(vm = %record.name, ip = ?record.ip_address, "VM running");
                        Ok(Flow::Stop)
                    }
                    VmStatus::Error => Err(VirtError::InitializationFailed(record.name.clone())),
                    _ if matches!(message, GuestMessage::Heartbeat(_)) && address.is_none() => {
                        debug!(vm = %record.name, "heartbeat without NAT address, asking again");
                        Ok(Flow::Reply(HostMessage::Status))
                    }
                    _ => Ok(Flow::Continue),
                }
            })
            .await
    }

    async fn provision(&self, record: &VmRecord, profile: &Profile, vm_dir: &Path) -> Result<BootMedia> {
        let public_key = identity::ensure_identity(&self.paths.identity_key()).await?;
        let base = download::ensure_base_files(profile, &self.paths.profile_cache(&profile.id)).await?;
        let user = GuestUser {
            name: remote::guest_user(self.settings.ssh_user.as_deref()),
            public_key,
        };

        let tools = Arc::clone(&self.tools);
        let boot_volume_mib = self.settings.boot_volume_mib;
        let (record, profile, vm_dir) = (record.clone(), profile.clone(), vm_dir.to_path_buf());
        tokio::task::spawn_blocking(move || {
            BootMediaBuilder::new(tools.as_ref())
                .boot_volume_mib(boot_volume_mib)
                .provision(&record, &profile, &base, &vm_dir, &user)
        })
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?
    }

    fn first_boot_spec(&self, record: &VmRecord, profile: &Profile, media: &BootMedia) -> LaunchSpec {
        self.launch_spec(record, profile, media.kernel.clone(), media.initrd.clone(), Some(media.config_volume.clone()))
    }

    async fn restart_spec(&self, record: &VmRecord, profile: &Profile, vm_dir: &Path) -> Result<LaunchSpec> {
        let tools = Arc::clone(&self.tools);
        let (boot_profile, dir) = (profile.clone(), vm_dir.to_path_buf());
        let (kernel, initrd) = tokio::task::spawn_blocking(move || {
            BootMediaBuilder::new(tools.as_ref()).boot_files(&boot_profile, &dir)
        })
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))??;
        Ok(self.launch_spec(record, profile, kernel, initrd, None))
    }

    fn launch_spec(
        &self,
        record: &VmRecord,
        profile: &Profile,
        kernel: PathBuf,
        initrd: PathBuf,
        cdrom: Option<PathBuf>,
    ) -> LaunchSpec {
        let home_share = if record.mount_home_directory { filesystem::home_directory() } else { None };
        if record.mount_home_directory && home_share.is_none() {
            warn!(vm = %record.name, "home directory not found, share disabled");
        }
        LaunchSpec {
            kernel,
            initrd,
            cmdline: profile.cmdline.clone(),
            cdrom,
            mac_address: record.mac_address,
            cpu_count: record.cpu_count,
            memory_mb: record.memory_mb,
            home_share,
        }
    }
}

fn restore(record: &VmRecord) -> Machine {
    let mut sm = LifecycleMachine::new(&record.name).state_machine();
    sm.handle(&LifecycleEvent::Restore(record.status));
    sm
}

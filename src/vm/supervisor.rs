//! Hypervisor runner supervision.
//!
//! ## Architecture
//!
//! ```text
//! launch(LaunchSpec)
//!     └─► tokio::process::Command  →  runner (own process group, cwd = VM dir)
//!             ├─► writes ./pidfile
//!             ├─► links ./console  (guest console pty)
//!             └─► links ./control  (guest control pty)
//! ```
//!
//! The pid file is the only "is running" signal once `launch` returns: later
//! invocations of the CLI have no child handle and probe the pid instead.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Result, VirtError};
use crate::settings::{DEFAULT_RUNNER, Settings};
use crate::vm::record::MacAddress;

pub const PIDFILE: &str = "pidfile";
pub const CONSOLE_LINK: &str = "console";
pub const CONTROL_LINK: &str = "control";
pub const ROOT_DISK: &str = "root.img";
pub const BOOT_VOLUME: &str = "boot.img";
pub const CONFIG_VOLUME: &str = "cloudinit.iso";

/// virtio-fs tag under which the host home directory is shared.
pub const HOME_SHARE_TAG: &str = "user-home";

const DEVICE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Everything the runner needs for one boot.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub kernel: PathBuf,
    pub initrd: PathBuf,
    pub cmdline: String,
    /// Provisioning volume; attached on first boot only.
    pub cdrom: Option<PathBuf>,
    pub mac_address: MacAddress,
    pub cpu_count: u32,
    pub memory_mb: u32,
    /// Host directory shared as [`HOME_SHARE_TAG`].
    pub home_share: Option<PathBuf>,
}

/// Runner command line. Paths to the disks and the runner's own outputs are
/// relative to the VM directory, which is the runner's working directory.
pub fn build_runner_args(spec: &LaunchSpec) -> Vec<String> {
    let mut args = vec![
        format!("--pidfile=./{PIDFILE}"),
        format!("--kernel={}", spec.kernel.display()),
        format!("--cmdline={}", spec.cmdline),
        format!("--initrd={}", spec.initrd.display()),
    ];
    if let Some(cdrom) = &spec.cdrom {
        args.push(format!("--cdrom={}", cdrom.display()));
    }
    args.extend([
        format!("--disk={ROOT_DISK}"),
        format!("--disk={BOOT_VOLUME}"),
        format!("--network={}@nat", spec.mac_address),
        format!("--cpu-count={}", spec.cpu_count),
        format!("--memory-size={}", spec.memory_mb),
        format!("--console-symlink={CONSOLE_LINK}"),
        format!("--control-symlink={CONTROL_LINK}"),
    ]);
    if let Some(home) = &spec.home_share {
        args.push(format!("--share={}@{HOME_SHARE_TAG}", home.display()));
    }
    args
}

/// A runner that came up far enough to expose its control device.
#[derive(Debug, Clone)]
pub struct RunningVm {
    pub pid: Option<u32>,
    pub control: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Supervisor {
    runner: PathBuf,
    device_timeout: Duration,
    attach_console: bool,
}

impl Supervisor {
    pub fn new(runner: PathBuf, device_timeout: Duration) -> Self {
        Self { runner, device_timeout, attach_console: true }
    }

    /// Build from settings, locating the runner on `$PATH` when no explicit
    /// path is configured. A missing runner surfaces at launch.
    pub fn from_settings(settings: &Settings) -> Self {
        let runner = settings.runner.clone().unwrap_or_else(|| {
            which::which(DEFAULT_RUNNER).unwrap_or_else(|_| PathBuf::from(DEFAULT_RUNNER))
        });
        let mut supervisor = Self::new(runner, settings.control_device_timeout());
        supervisor.attach_console = settings.attach_console;
        supervisor
    }

    pub fn runner(&self) -> &Path {
        &self.runner
    }

    /// Start the runner for the VM in `vm_dir` and wait for its control
    /// device and pid file. The runner may publish either one first.
    ///
    /// Fails with `VmStartFailure` if the runner exits first or the device
    /// does not appear in time; in the latter case the runner is killed and
    /// reaped before returning.
    pub async fn launch(&self, name: &str, vm_dir: &Path, spec: &LaunchSpec) -> Result<RunningVm> {
        for stale in [PIDFILE, CONTROL_LINK, CONSOLE_LINK] {
            remove_if_present(&vm_dir.join(stale))?;
        }

        let args = build_runner_args(spec);
        debug!(vm = %name, runner = %self.runner.display(), ?args, "launching runner");

        let mut cmd = Command::new(&self.runner);
        cmd.args(&args)
            .current_dir(vm_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| VirtError::Tool {
            tool: self.runner.display().to_string(),
            message: format!("{e}; set `runner` in config.toml"),
        })?;
        let pid = child.id();

        let control = vm_dir.join(CONTROL_LINK);
        let deadline = tokio::time::Instant::now() + self.device_timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                warn!(vm = %name, ?status, "runner exited before exposing its control device and pid file");
                return Err(VirtError::VmStartFailure { exit_code: status.code() });
            }

            if std::fs::File::open(&control).is_ok() && read_pid(vm_dir)?.is_some() {
                info!(vm = %name, pid, "runner started");
                if self.attach_console {
                    attach_console(name, vm_dir).await;
                }
                return Ok(RunningVm { pid, control });
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(vm = %name, timeout = ?self.device_timeout, "control device or pid file did not appear, killing runner");
                if let Err(e) = child.kill().await {
                    warn!(vm = %name, error = %e, "failed to kill runner");
                }
                let exit_code = child.wait().await.ok().and_then(|s| s.code());
                return Err(VirtError::VmStartFailure { exit_code });
            }

            tokio::time::sleep(DEVICE_POLL_INTERVAL).await;
        }
    }
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Pid recorded by the runner, if any. A malformed pid file counts as absent.
pub fn read_pid(vm_dir: &Path) -> Result<Option<i32>> {
    let path = vm_dir.join(PIDFILE);
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match content.trim().parse::<i32>() {
        Ok(pid) if pid > 0 => Ok(Some(pid)),
        _ => {
            warn!(path = %path.display(), content = %content.trim(), "ignoring malformed pid file");
            Ok(None)
        }
    }
}

/// Liveness probe: `kill(pid, 0)`. Only `ESRCH` means gone; any other
/// error (e.g. `EPERM`) means some process still holds the pid.
pub fn is_alive(vm_dir: &Path) -> Result<bool> {
    let Some(pid) = read_pid(vm_dir)? else {
        return Ok(false);
    };
    Ok(match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    })
}

/// Send `SIGTERM` to the runner and drop its pid file.
///
/// Returns `false` when there was no pid file to act on.
pub fn terminate(vm_dir: &Path) -> Result<bool> {
    let Some(pid) = read_pid(vm_dir)? else {
        return Ok(false);
    };
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, error = %e, "SIGTERM to runner failed"),
    }
    remove_if_present(&vm_dir.join(PIDFILE))?;
    info!(pid, "runner terminated");
    Ok(true)
}

/// Poll liveness until the runner is gone or `timeout` elapses.
/// Returns whether the runner exited.
pub async fn wait_for_exit(vm_dir: &Path, timeout: Duration, poll: Duration) -> Result<bool> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !is_alive(vm_dir)? {
            return Ok(true);
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(poll).await;
    }
}

/// Resolve once the runner is gone, polling every `poll`.
pub async fn watch_liveness(vm_dir: &Path, poll: Duration) -> Result<()> {
    loop {
        if !is_alive(vm_dir)? {
            return Ok(());
        }
        tokio::time::sleep(poll).await;
    }
}

/// Attach a detached `screen` session to the guest console. Best effort.
async fn attach_console(name: &str, vm_dir: &Path) {
    let Ok(screen) = which::which("screen") else {
        debug!(vm = %name, "screen not installed, no console session");
        return;
    };
    let session = format!("console-{name}");
    let status = Command::new(screen)
        .args(["-dm", "-S", &session])
        .arg(vm_dir.join(CONSOLE_LINK))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match status {
        Ok(s) if s.success() => info!(vm = %name, %session, "console session attached"),
        Ok(s) => warn!(vm = %name, status = ?s, "screen session failed"),
        Err(e) => warn!(vm = %name, error = %e, "could not run screen"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> LaunchSpec {
        LaunchSpec {
            kernel: PathBuf::from("/vm/kernel"),
            initrd: PathBuf::from("/vm/initrd"),
            cmdline: "console=hvc0 irqfixup quiet root=/dev/vda".to_string(),
            cdrom: Some(PathBuf::from(CONFIG_VOLUME)),
            mac_address: "52:54:00:12:34:56".parse().unwrap(),
            cpu_count: 2,
            memory_mb: 2048,
            home_share: None,
        }
    }

    #[test]
    fn runner_args_follow_contract_order() {
        let args = build_runner_args(&spec());
        assert_eq!(
            args,
            vec![
                "--pidfile=./pidfile",
                "--kernel=/vm/kernel",
                "--cmdline=console=hvc0 irqfixup quiet root=/dev/vda",
                "--initrd=/vm/initrd",
                "--cdrom=cloudinit.iso",
                "--disk=root.img",
                "--disk=boot.img",
                "--network=52:54:00:12:34:56@nat",
                "--cpu-count=2",
                "--memory-size=2048",
                "--console-symlink=console",
                "--control-symlink=control",
            ]
        );
    }

    #[test]
    fn plain_boot_omits_cdrom_and_share_goes_last() {
        let mut spec = spec();
        spec.cdrom = None;
        spec.home_share = Some(PathBuf::from("/Users/someone"));
        let args = build_runner_args(&spec);

        assert!(args.iter().all(|a| !a.starts_with("--cdrom")));
        assert_eq!(args.last().unwrap(), "--share=/Users/someone@user-home");
    }

    #[test]
    fn missing_or_malformed_pidfile_is_not_running() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!is_alive(tmp.path()).unwrap());

        std::fs::write(tmp.path().join(PIDFILE), "not-a-pid").unwrap();
        assert!(!is_alive(tmp.path()).unwrap());
        assert_eq!(read_pid(tmp.path()).unwrap(), None);
    }

    #[test]
    fn live_pid_is_running_and_dead_pid_is_not() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(PIDFILE), format!("{}\n", std::process::id())).unwrap();
        assert!(is_alive(tmp.path()).unwrap());

        // Above any configurable pid_max, so never allocated.
        std::fs::write(tmp.path().join(PIDFILE), "999999999").unwrap();
        assert!(!is_alive(tmp.path()).unwrap());
    }

    #[test]
    fn terminate_without_pidfile_reports_nothing_to_do() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!terminate(tmp.path()).unwrap());
    }

    #[tokio::test]
    async fn wait_for_exit_returns_once_pid_is_gone() {
        let tmp = tempfile::tempdir().unwrap();
        let exited = wait_for_exit(tmp.path(), Duration::from_secs(1), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(exited);

        std::fs::write(tmp.path().join(PIDFILE), std::process::id().to_string()).unwrap();
        let exited = wait_for_exit(tmp.path(), Duration::from_millis(50), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(!exited);
    }

    #[cfg(unix)]
    mod launch {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn script(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("runner.sh");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn supervisor(runner: PathBuf, timeout: Duration) -> Supervisor {
            let mut s = Supervisor::new(runner, timeout);
            s.attach_console = false;
            s
        }

        #[tokio::test]
        async fn launch_succeeds_once_control_device_exists() {
            let tools = tempfile::tempdir().unwrap();
            let vm_dir = tempfile::tempdir().unwrap();
            let runner = script(
                tools.path(),
                "echo $$ > pidfile\nprintf '%s\\n' \"$@\" > args.txt\n: > control\nsleep 5",
            );

            let running = supervisor(runner, Duration::from_secs(5))
                .launch("t", vm_dir.path(), &spec())
                .await
                .unwrap();
            assert_eq!(running.control, vm_dir.path().join(CONTROL_LINK));
            assert!(is_alive(vm_dir.path()).unwrap());

            let args = std::fs::read_to_string(vm_dir.path().join("args.txt")).unwrap();
            assert!(args.starts_with("--pidfile=./pidfile\n"));

            assert!(terminate(vm_dir.path()).unwrap());
            assert!(!vm_dir.path().join(PIDFILE).exists());
        }

        #[tokio::test]
        async fn launch_waits_for_pidfile_written_after_control_device() {
            let tools = tempfile::tempdir().unwrap();
            let vm_dir = tempfile::tempdir().unwrap();
            let runner = script(tools.path(), ": > control\nsleep 0.3\necho $$ > pidfile\nsleep 5");

            let running = supervisor(runner, Duration::from_secs(5))
                .launch("t", vm_dir.path(), &spec())
                .await
                .unwrap();
            assert!(vm_dir.path().join(CONTROL_LINK).exists());
            assert_eq!(read_pid(vm_dir.path()).unwrap().map(|p| p as u32), running.pid);
            assert!(is_alive(vm_dir.path()).unwrap());

            assert!(terminate(vm_dir.path()).unwrap());
        }

        #[tokio::test]
        async fn control_device_without_pidfile_times_out() {
            let tools = tempfile::tempdir().unwrap();
            let vm_dir = tempfile::tempdir().unwrap();
            let runner = script(tools.path(), ": > control\nsleep 30");

            let err = supervisor(runner, Duration::from_millis(300))
                .launch("t", vm_dir.path(), &spec())
                .await
                .unwrap_err();
            assert!(matches!(err, VirtError::VmStartFailure { .. }), "got {err:?}");
        }

        #[tokio::test]
        async fn early_exit_reports_exit_code() {
            let tools = tempfile::tempdir().unwrap();
            let vm_dir = tempfile::tempdir().unwrap();
            let runner = script(tools.path(), "exit 3");

            let err = supervisor(runner, Duration::from_secs(5))
                .launch("t", vm_dir.path(), &spec())
                .await
                .unwrap_err();
            assert!(matches!(err, VirtError::VmStartFailure { exit_code: Some(3) }), "got {err:?}");
        }

        #[tokio::test]
        async fn missing_device_times_out_and_kills_runner() {
            let tools = tempfile::tempdir().unwrap();
            let vm_dir = tempfile::tempdir().unwrap();
            let runner = script(tools.path(), "sleep 30");

            let started = std::time::Instant::now();
            let err = supervisor(runner, Duration::from_millis(300))
                .launch("t", vm_dir.path(), &spec())
                .await
                .unwrap_err();
            assert!(matches!(err, VirtError::VmStartFailure { .. }));
            assert!(started.elapsed() < Duration::from_secs(10));
        }

        #[tokio::test]
        async fn stale_control_link_is_removed_before_launch() {
            let tools = tempfile::tempdir().unwrap();
            let vm_dir = tempfile::tempdir().unwrap();
            std::fs::write(vm_dir.path().join(CONTROL_LINK), b"stale").unwrap();
            let runner = script(tools.path(), "exit 4");

            let err = supervisor(runner, Duration::from_secs(5))
                .launch("t", vm_dir.path(), &spec())
                .await
                .unwrap_err();
            assert!(matches!(err, VirtError::VmStartFailure { exit_code: Some(4) }));
            assert!(!vm_dir.path().join(CONTROL_LINK).exists());
        }
    }
}

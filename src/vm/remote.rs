//! `ssh` / `scp` wrappers for shell access and file copies.
//!
//! Both run as children with inherited stdio; the caller exits with the
//! child's status.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, VirtError};

/// Prefix marking a guest-side path in `cp` arguments.
pub const GUEST_PREFIX: &str = "vm:";

/// Options shared by every ssh/scp invocation.
///
/// Guest host keys change on every provision, so they are neither checked
/// nor recorded.
const SSH_OPTS: &[&str] = &[
    "-o", "StrictHostKeyChecking=no",
    "-o", "UserKnownHostsFile=/dev/null",
    "-o", "LogLevel=ERROR",
];

/// Connection parameters for one guest.
#[derive(Debug, Clone)]
pub struct Target {
    pub user: String,
    pub address: Ipv4Addr,
    pub identity: PathBuf,
}

impl Target {
    fn login(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }

    fn common_args(&self) -> Vec<String> {
        let mut args: Vec<String> = SSH_OPTS.iter().map(|s| s.to_string()).collect();
        args.push("-i".to_string());
        args.push(self.identity.display().to_string());
        args
    }
}

/// Guest login name: the configured user, or the invoking user.
pub fn guest_user(configured: Option<&str>) -> String {
    configured
        .map(str::to_string)
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "ubuntu".to_string())
}

/// One side of a copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyPath {
    Host(PathBuf),
    Guest(String),
}

impl CopyPath {
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix(GUEST_PREFIX) {
            Some(rest) => CopyPath::Guest(rest.to_string()),
            None => CopyPath::Host(PathBuf::from(raw)),
        }
    }

    fn render(&self, target: &Target) -> String {
        match self {
            CopyPath::Host(p) => p.display().to_string(),
            CopyPath::Guest(p) => format!("{}:{}", target.login(), p),
        }
    }
}

/// Validate that exactly one side of a copy is a guest path.
pub fn parse_copy(source: &str, dest: &str) -> Result<(CopyPath, CopyPath)> {
    let (source, dest) = (CopyPath::parse(source), CopyPath::parse(dest));
    match (&source, &dest) {
        (CopyPath::Guest(_), CopyPath::Host(_)) | (CopyPath::Host(_), CopyPath::Guest(_)) => {
            Ok((source, dest))
        }
        (CopyPath::Guest(_), CopyPath::Guest(_)) => Err(VirtError::InvalidCopyPath(
            "both paths are guest paths; prefix exactly one with vm:".to_string(),
        )),
        (CopyPath::Host(_), CopyPath::Host(_)) => Err(VirtError::InvalidCopyPath(
            "neither path is a guest path; prefix exactly one with vm:".to_string(),
        )),
    }
}

pub fn ssh_args(target: &Target, command: &[String]) -> Vec<String> {
    let mut args = target.common_args();
    if command.is_empty() {
        args.push("-t".to_string());
    }
    args.push(target.login());
    args.extend(command.iter().cloned());
    args
}

pub fn scp_args(target: &Target, source: &CopyPath, dest: &CopyPath, recursive: bool) -> Vec<String> {
    let mut args = target.common_args();
    if recursive {
        args.push("-r".to_string());
    }
    args.push(source.render(target));
    args.push(dest.render(target));
    args
}

/// Interactive shell, or `command` when given. Returns the child's exit code.
pub async fn shell(target: &Target, command: &[String]) -> Result<i32> {
    run("ssh", ssh_args(target, command)).await
}

pub async fn copy(target: &Target, source: &CopyPath, dest: &CopyPath, recursive: bool) -> Result<i32> {
    run("scp", scp_args(target, source, dest, recursive)).await
}

async fn run(tool: &str, args: Vec<String>) -> Result<i32> {
    let program = which::which(tool).map_err(|e| VirtError::Tool {
        tool: tool.to_string(),
        message: e.to_string(),
    })?;
    debug!(%tool, ?args, "running");
    let status = Command::new(&program).args(&args).status().await?;
    // Killed by a signal: report the shell convention 128 + n where known.
    Ok(status.code().unwrap_or_else(|| signal_code(&status)))
}

#[cfg(unix)]
fn signal_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|s| 128 + s).unwrap_or(1)
}

#[cfg(not(unix))]
fn signal_code(_status: &std::process::ExitStatus) -> i32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> Target {
        Target {
            user: "alice".to_string(),
            address: Ipv4Addr::new(192, 168, 64, 5),
            identity: PathBuf::from("/cfg/macos-virt-identity"),
        }
    }

    #[test]
    fn guest_prefix_marks_guest_paths() {
        assert_eq!(CopyPath::parse("vm:/etc/hosts"), CopyPath::Guest("/etc/hosts".to_string()));
        assert_eq!(CopyPath::parse("./notes.txt"), CopyPath::Host(PathBuf::from("./notes.txt")));
    }

    #[test]
    fn exactly_one_side_must_be_guest() {
        assert!(parse_copy("vm:/a", "b").is_ok());
        assert!(parse_copy("a", "vm:/b").is_ok());
        assert!(matches!(parse_copy("a", "b"), Err(VirtError::InvalidCopyPath(_))));
        assert!(matches!(parse_copy("vm:/a", "vm:/b"), Err(VirtError::InvalidCopyPath(_))));
    }

    #[test]
    fn interactive_shell_requests_a_tty() {
        let args = ssh_args(&target(), &[]);
        assert_eq!(&args[..6], SSH_OPTS.iter().map(|s| s.to_string()).collect::<Vec<_>>().as_slice());
        assert_eq!(&args[6..], ["-i", "/cfg/macos-virt-identity", "-t", "alice@192.168.64.5"]);
    }

    #[test]
    fn remote_command_is_appended() {
        let args = ssh_args(&target(), &["uname".to_string(), "-a".to_string()]);
        assert!(!args.contains(&"-t".to_string()));
        assert_eq!(&args[args.len() - 3..], ["alice@192.168.64.5", "uname", "-a"]);
    }

    #[test]
    fn scp_renders_guest_side_with_login() {
        let (src, dst) = parse_copy("notes.txt", "vm:/tmp/").unwrap();
        let args = scp_args(&target(), &src, &dst, true);
        assert_eq!(&args[args.len() - 3..], ["-r", "notes.txt", "alice@192.168.64.5:/tmp/"]);
    }

    #[test]
    fn configured_user_wins() {
        assert_eq!(guest_user(Some("ubuntu")), "ubuntu");
    }
}

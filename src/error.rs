//! Error taxonomy for VM operations.
//!
//! Every variant maps to a distinct process exit status through
//! [`VirtError::exit_code`]; the binary performs that mapping at its single
//! outermost boundary.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VirtError {
    #[error("VM {0} does not exist")]
    NotFound(String),

    #[error("VM {0} already exists")]
    AlreadyExists(String),

    #[error("VM {0} is already running")]
    AlreadyRunning(String),

    #[error("VM {0} has already been provisioned")]
    AlreadyProvisioned(String),

    #[error("VM {0} is not running")]
    NotRunning(String),

    #[error("VM {0} is running, stop it first")]
    StillRunning(String),

    #[error("corrupt VM record at {path}: {reason}")]
    CorruptState { path: PathBuf, reason: String },

    #[error("requested disk size {requested_mb} MB is smaller than the base image ({base_bytes} bytes)")]
    DiskTooSmall { requested_mb: u64, base_bytes: u64 },

    #[error("VM failed to start (runner exit code {})", describe_exit_code(.exit_code))]
    VmStartFailure { exit_code: Option<i32> },

    #[error("control channel error: {0}")]
    Channel(String),

    #[error("invalid VM name {0:?}: use 1-64 characters from [A-Za-z0-9._-], not starting with '.'")]
    InvalidName(String),

    #[error("unknown profile {0}")]
    UnknownProfile(String),

    #[error("VM {0} reported an initialization error; delete and recreate it")]
    InitializationFailed(String),

    #[error("VM {0} has no assigned IP address")]
    NoAddress(String),

    #[error("invalid copy paths: {0}")]
    InvalidCopyPath(String),

    #[error("`{tool}` failed: {message}")]
    Tool { tool: String, message: String },

    #[error("download of {url} failed: {message}")]
    Download { url: String, message: String },

    #[error("invalid settings: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),
}

impl From<toml::de::Error> for VirtError {
    fn from(e: toml::de::Error) -> Self {
        VirtError::Config(e.to_string())
    }
}

impl From<reqwest::Error> for VirtError {
    fn from(e: reqwest::Error) -> Self {
        VirtError::Download {
            url: e.url().map(|u| u.to_string()).unwrap_or_default(),
            message: e.to_string(),
        }
    }
}

impl VirtError {
    /// Process exit status for this error. Never 0.
    pub fn exit_code(&self) -> u8 {
        match self {
            VirtError::NotFound(_) => 2,
            VirtError::AlreadyExists(_) => 3,
            VirtError::AlreadyRunning(_) => 4,
            VirtError::AlreadyProvisioned(_) => 5,
            VirtError::NotRunning(_) => 6,
            VirtError::StillRunning(_) => 7,
            VirtError::CorruptState { .. } => 8,
            VirtError::DiskTooSmall { .. } => 9,
            VirtError::VmStartFailure { .. } => 10,
            VirtError::Channel(_) => 11,
            VirtError::InvalidName(_) => 12,
            VirtError::UnknownProfile(_) => 13,
            VirtError::InitializationFailed(_) => 14,
            VirtError::NoAddress(_) => 15,
            VirtError::InvalidCopyPath(_) => 16,
            VirtError::Tool { .. } => 17,
            VirtError::Download { .. } => 18,
            VirtError::Config(_) => 19,
            VirtError::Io(_) | VirtError::Json(_) | VirtError::Yaml(_) => 1,
        }
    }
}

fn describe_exit_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string())
}

pub type Result<T, E = VirtError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_and_non_zero() {
        let errors = vec![
            VirtError::NotFound("a".into()),
            VirtError::AlreadyExists("a".into()),
            VirtError::AlreadyRunning("a".into()),
            VirtError::AlreadyProvisioned("a".into()),
            VirtError::NotRunning("a".into()),
            VirtError::StillRunning("a".into()),
            VirtError::CorruptState { path: PathBuf::from("/x"), reason: "bad".into() },
            VirtError::DiskTooSmall { requested_mb: 1, base_bytes: 2 },
            VirtError::VmStartFailure { exit_code: Some(1) },
            VirtError::Channel("closed".into()),
            VirtError::InvalidName("../x".into()),
            VirtError::UnknownProfile("nope".into()),
            VirtError::InitializationFailed("a".into()),
            VirtError::NoAddress("a".into()),
            VirtError::InvalidCopyPath("x".into()),
            VirtError::Tool { tool: "t".into(), message: "m".into() },
            VirtError::Download { url: "u".into(), message: "m".into() },
            VirtError::Config("c".into()),
        ];

        let mut codes: Vec<u8> = errors.iter().map(|e| e.exit_code()).collect();
        assert!(codes.iter().all(|&c| c != 0));
        let before = codes.len();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), before, "exit codes must be unique per variant");
    }

    #[test]
    fn start_failure_message_includes_exit_code() {
        let msg = VirtError::VmStartFailure { exit_code: Some(3) }.to_string();
        assert!(msg.contains("exit code 3"), "got: {msg}");

        let msg = VirtError::VmStartFailure { exit_code: None }.to_string();
        assert!(msg.contains("unknown"), "got: {msg}");
    }
}

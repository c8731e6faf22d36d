//! Host SSH identity shared by every VM.
//!
//! The public half is injected into each provisioning volume; the private
//! half authenticates `shell` and `cp`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::info;

use crate::error::{Result, VirtError};

pub fn public_key_path(private_key: &Path) -> PathBuf {
    let mut name = private_key.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".pub");
    private_key.with_file_name(name)
}

/// Return the public key, generating the key pair on first use.
pub async fn ensure_identity(private_key: &Path) -> Result<String> {
    let public_key = public_key_path(private_key);
    if !private_key.is_file() || !public_key.is_file() {
        generate(private_key).await?;
    }
    let key = tokio::fs::read_to_string(&public_key).await?;
    Ok(key.trim().to_string())
}

async fn generate(private_key: &Path) -> Result<()> {
    if let Some(dir) = private_key.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    for stale in [private_key.to_path_buf(), public_key_path(private_key)] {
        if stale.exists() {
            tokio::fs::remove_file(&stale).await?;
        }
    }

    let keygen = which::which("ssh-keygen").map_err(|e| VirtError::Tool {
        tool: "ssh-keygen".to_string(),
        message: e.to_string(),
    })?;
    let output = Command::new(keygen)
        .args(["-q", "-t", "ed25519", "-N", "", "-C", "macos-virt", "-f"])
        .arg(private_key)
        .stdin(Stdio::null())
        .output()
        .await?;
    if !output.status.success() {
        return Err(VirtError::Tool {
            tool: "ssh-keygen".to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    info!(key = %private_key.display(), "generated host identity");
    Ok(())
}

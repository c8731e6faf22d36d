//! ISO-9660 and FAT access through external tools.
//!
//! Writing the provisioning ISO prefers `mkisofs`, `xorriso` or
//! `genisoimage`, which add Rock Ridge extensions. `hdiutil` is the last
//! resort on a bare macOS host and writes ISO-9660 + Joliet only. Reading kernels
//! back out of the FAT boot volume uses `mtools` (`mdir`, `mcopy`).
//! The [`MediaTools`] trait is the seam; tests substitute an in-memory fake.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, warn};

use crate::error::{Result, VirtError};

pub trait MediaTools: Send + Sync {
    /// Write an ISO-9660 volume (Joliet + Rock Ridge where the tool supports
    /// it) labelled `volume_id` holding exactly `entries` at its root.
    fn write_config_volume(&self, dest: &Path, volume_id: &str, entries: &[(&str, &[u8])])
    -> Result<()>;

    /// File names in the root directory of a FAT volume.
    fn list_boot_volume(&self, volume: &Path) -> Result<Vec<String>>;

    /// Copy `name` out of the FAT volume's root directory to `dest`.
    fn read_boot_file(&self, volume: &Path, name: &str, dest: &Path) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IsoTool {
    Hdiutil,
    Mkisofs,
    Genisoimage,
    Xorriso,
}

impl IsoTool {
    const SEARCH_ORDER: [IsoTool; 4] =
        [IsoTool::Mkisofs, IsoTool::Xorriso, IsoTool::Genisoimage, IsoTool::Hdiutil];

    fn binary(self) -> &'static str {
        match self {
            IsoTool::Hdiutil => "hdiutil",
            IsoTool::Mkisofs => "mkisofs",
            IsoTool::Genisoimage => "genisoimage",
            IsoTool::Xorriso => "xorriso",
        }
    }

    fn rock_ridge(self) -> bool {
        !matches!(self, IsoTool::Hdiutil)
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::SEARCH_ORDER.into_iter().find(|t| t.binary() == name)
    }

    fn args(self, dest: &Path, volume_id: &str, staging: &Path) -> Vec<String> {
        let dest = dest.display().to_string();
        let staging = staging.display().to_string();
        let mkisofs = |prefix: &[&str]| {
            let mut v: Vec<String> = prefix.iter().map(|s| s.to_string()).collect();
            v.extend(
                ["-output", dest.as_str(), "-volid", volume_id, "-joliet", "-rock", staging.as_str()]
                    .map(str::to_string),
            );
            v
        };
        match self {
            IsoTool::Hdiutil => [
                "makehybrid",
                "-quiet",
                "-iso",
                "-joliet",
                "-default-volume-name",
                volume_id,
                "-o",
                dest.as_str(),
                staging.as_str(),
            ]
            .map(str::to_string)
            .to_vec(),
            IsoTool::Mkisofs | IsoTool::Genisoimage => mkisofs(&[]),
            IsoTool::Xorriso => mkisofs(&["-as", "mkisofs"]),
        }
    }
}

/// [`MediaTools`] backed by the host's installed tools.
#[derive(Debug, Clone, Default)]
pub struct SystemMediaTools {
    iso_tool: Option<String>,
}

impl SystemMediaTools {
    /// `iso_tool` pins the ISO writer; `None` picks the first one found.
    pub fn new(iso_tool: Option<String>) -> Self {
        Self { iso_tool }
    }

    fn resolve_iso_tool(&self) -> Result<(IsoTool, PathBuf)> {
        if let Some(name) = &self.iso_tool {
            let tool = IsoTool::from_name(name).ok_or_else(|| {
                VirtError::Config(format!("unsupported iso_tool {name:?}"))
            })?;
            let path = which::which(tool.binary()).map_err(|e| tool_error(tool.binary(), e))?;
            return Ok((tool, path));
        }
        IsoTool::SEARCH_ORDER
            .into_iter()
            .find_map(|tool| which::which(tool.binary()).ok().map(|p| (tool, p)))
            .ok_or_else(|| VirtError::Tool {
                tool: "mkisofs".to_string(),
                message: "no ISO writer found (install cdrtools, genisoimage or xorriso)"
                    .to_string(),
            })
    }
}

impl MediaTools for SystemMediaTools {
    fn write_config_volume(
        &self,
        dest: &Path,
        volume_id: &str,
        entries: &[(&str, &[u8])],
    ) -> Result<()> {
        let (tool, binary) = self.resolve_iso_tool()?;
        if !tool.rock_ridge() {
            warn!(tool = tool.binary(), "writing config volume without Rock Ridge; install cdrtools or xorriso");
        }
        let staging = tempfile::tempdir()?;
        for (name, contents) in entries {
            std::fs::write(staging.path().join(name), contents)?;
        }
        if dest.exists() {
            std::fs::remove_file(dest)?;
        }

        run(Command::new(&binary).args(tool.args(dest, volume_id, staging.path())), tool.binary())?;
        debug!(tool = tool.binary(), dest = %dest.display(), "wrote config volume");
        Ok(())
    }

    fn list_boot_volume(&self, volume: &Path) -> Result<Vec<String>> {
        let mdir = which::which("mdir").map_err(|e| tool_error("mdir", e))?;
        let stdout = run(Command::new(mdir).arg("-b").arg("-i").arg(volume).arg("::/"), "mdir")?;
        Ok(parse_mdir_bare(&stdout))
    }

    fn read_boot_file(&self, volume: &Path, name: &str, dest: &Path) -> Result<()> {
        let mcopy = which::which("mcopy").map_err(|e| tool_error("mcopy", e))?;
        run(
            Command::new(mcopy)
                .arg("-n")
                .arg("-o")
                .arg("-i")
                .arg(volume)
                .arg(format!("::/{name}"))
                .arg(dest),
            "mcopy",
        )?;
        Ok(())
    }
}

fn tool_error(tool: &str, e: which::Error) -> VirtError {
    VirtError::Tool { tool: tool.to_string(), message: e.to_string() }
}

fn run(cmd: &mut Command, tool: &str) -> Result<String> {
    let output = cmd.output().map_err(|e| VirtError::Tool {
        tool: tool.to_string(),
        message: e.to_string(),
    })?;
    if !output.status.success() {
        return Err(VirtError::Tool {
            tool: tool.to_string(),
            message: format!(
                "exit {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// `mdir -b` prints one `::/NAME` per line; directories end with `/`.
fn parse_mdir_bare(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter_map(|l| l.strip_prefix("::/").or(Some(l)))
        .filter(|l| !l.is_empty() && !l.ends_with('/') && !l.contains('/'))
        .map(str::to_string)
        .collect()
}

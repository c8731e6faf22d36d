//! Disk image helpers for boot media assembly.
//!
//! ## Design
//!
//! The root disk is a clone of the profile's base image, grown in place to
//! the requested capacity by appending zero-filled 1 MiB blocks:
//!
//! ```text
//! base image (S bytes) ──clone──► root.img ──append zeros──► S + ceil((C−S)/MiB)·MiB
//! ```
//!
//! On macOS the clone uses `cp -c` (APFS clonefile), so it is instant and
//! shares blocks with the cached base image until the guest writes to them.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::{debug, info};

use crate::error::Result;

pub const MIB: u64 = 1024 * 1024;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Number of 1 MiB zero blocks that grow `current` bytes to at least
/// `capacity` bytes. Zero when the image is already large enough.
pub fn padding_blocks(current: u64, capacity: u64) -> u64 {
    capacity.saturating_sub(current).div_ceil(MIB)
}

/// Copy `src` to `dst`, sharing blocks with the source where possible.
#[cfg(target_os = "macos")]
pub fn clone_disk(src: &Path, dst: &Path) -> Result<()> {
    use std::process::Command;

    let output = Command::new("cp").arg("-c").arg(src).arg(dst).output()?;
    if output.status.success() {
        debug!(src = %src.display(), dst = %dst.display(), "cloned disk with clonefile");
        return Ok(());
    }

    // Not on APFS (or across volumes): fall back to a byte copy.
    debug!(
        stderr = %String::from_utf8_lossy(&output.stderr).trim(),
        "cp -c failed, copying disk"
    );
    std::fs::copy(src, dst)?;
    Ok(())
}

/// Copy `src` to `dst`. Non-macOS hosts have no clonefile; plain byte copy.
#[cfg(not(target_os = "macos"))]
pub fn clone_disk(src: &Path, dst: &Path) -> Result<()> {
    std::fs::copy(src, dst)?;
    debug!(src = %src.display(), dst = %dst.display(), "copied disk");
    Ok(())
}

/// Append zero blocks to `path` until it holds at least `capacity` bytes.
/// Returns the number of blocks written.
pub fn pad_to_capacity(path: &Path, capacity: u64) -> Result<u64> {
    let current = std::fs::metadata(path)?.len();
    let blocks = padding_blocks(current, capacity);
    if blocks == 0 {
        return Ok(0);
    }

    let file = OpenOptions::new().append(true).open(path)?;
    write_zero_blocks(file, blocks, path)?;
    Ok(blocks)
}

/// Create (or truncate) `path` as `size_mib` MiB of zeros.
pub fn create_zero_volume(path: &Path, size_mib: u64) -> Result<()> {
    let file = File::create(path)?;
    write_zero_blocks(file, size_mib, path)
}

fn write_zero_blocks(file: File, blocks: u64, path: &Path) -> Result<()> {
    let zeros = vec![0u8; MIB as usize];
    let mut writer = BufWriter::with_capacity(MIB as usize, file);
    let step = (blocks / 10).max(1);

    for written in 0..blocks {
        writer.write_all(&zeros)?;
        if (written + 1) % step == 0 {
            info!(
                file = %path.display(),
                progress = format!("{}/{} MiB", written + 1, blocks),
                "writing image"
            );
        }
    }
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

/// Copy a kernel image, decompressing it if it is gzip-compressed.
pub fn install_kernel(src: &Path, dst: &Path) -> Result<()> {
    let mut magic = [0u8; 2];
    let compressed = {
        let mut f = File::open(src)?;
        f.read_exact(&mut magic).is_ok() && magic == GZIP_MAGIC
    };

    if compressed {
        let mut decoder = GzDecoder::new(File::open(src)?);
        let mut out = BufWriter::new(File::create(dst)?);
        std::io::copy(&mut decoder, &mut out)?;
        out.flush()?;
        debug!(src = %src.display(), "decompressed kernel");
    } else {
        std::fs::copy(src, dst)?;
    }
    Ok(())
}

/// The invoking user's home directory, shared into the guest on request.
pub fn home_directory() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from).filter(|p| p.is_dir())
}

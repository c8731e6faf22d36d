//! Base file acquisition for a profile.
//!
//! Missing artifacts are streamed to `<name>.part` and renamed into place
//! only once complete, so an interrupted download is retried from scratch
//! on the next invocation instead of being mistaken for a finished file.

use std::fs::File;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{Result, VirtError};
use crate::vm::profiles::{BaseFiles, DiskTransform, Profile};

const DISK_ARCHIVE_FILENAME: &str = "disk.download";

/// Make sure the profile's kernel, initrd and disk are cached in
/// `cache_dir`, downloading whatever is missing.
pub async fn ensure_base_files(profile: &Profile, cache_dir: &Path) -> Result<BaseFiles> {
    let files = BaseFiles::in_dir(cache_dir);
    if files.all_present() {
        debug!(profile = %profile.id, "base files cached");
        return Ok(files);
    }
    tokio::fs::create_dir_all(cache_dir).await?;
    info!(profile = %profile.id, dir = %cache_dir.display(), "fetching base files");

    let client = reqwest::Client::builder().build()?;
    let disk_download = match profile.disk_transform {
        DiskTransform::Raw => files.disk.clone(),
        DiskTransform::UntarMember { .. } => cache_dir.join(DISK_ARCHIVE_FILENAME),
    };

    tokio::try_join!(
        fetch_if_missing(&client, profile, profile.kernel_url.as_deref(), &files.kernel),
        fetch_if_missing(&client, profile, profile.initrd_url.as_deref(), &files.initrd),
        async {
            if files.disk.is_file() {
                return Ok(());
            }
            fetch_if_missing(&client, profile, profile.disk_url.as_deref(), &disk_download).await
        },
    )?;

    if let DiskTransform::UntarMember { member } = &profile.disk_transform {
        if files.disk.is_file() {
            return Ok(files);
        }
        let archive = disk_download.clone();
        let dest = files.disk.clone();
        let member = member.clone();
        tokio::task::spawn_blocking(move || extract_tar_member(&archive, &member, &dest))
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))??;
        tokio::fs::remove_file(&disk_download).await?;
        info!(profile = %profile.id, "disk image extracted");
    }

    Ok(files)
}

async fn fetch_if_missing(
    client: &reqwest::Client,
    profile: &Profile,
    url: Option<&str>,
    dest: &Path,
) -> Result<()> {
    if dest.is_file() {
        return Ok(());
    }
    let Some(url) = url else {
        return Err(VirtError::Download {
            url: String::new(),
            message: format!(
                "profile {} has no source for missing {}",
                profile.id,
                dest.display()
            ),
        });
    };
    download(client, url, dest).await
}

/// Stream `url` to `dest` via a `.part` file.
pub async fn download(client: &reqwest::Client, url: &str, dest: &Path) -> Result<()> {
    let part = part_path(dest);
    let mut response = client.get(url).send().await?.error_for_status()?;
    let total = response.content_length();
    info!(%url, bytes = ?total, "downloading");

    let mut file = tokio::fs::File::create(&part).await?;
    let mut received: u64 = 0;
    let mut next_report: u64 = 10;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        received += chunk.len() as u64;
        if let Some(total) = total.filter(|t| *t > 0) {
            let percent = received * 100 / total;
            if percent >= next_report {
                info!(%url, percent, "download progress");
                next_report = percent - percent % 10 + 10;
            }
        }
    }
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    if let Some(total) = total.filter(|t| *t != received) {
        return Err(VirtError::Download {
            url: url.to_string(),
            message: format!("received {received} of {total} bytes"),
        });
    }

    tokio::fs::rename(&part, dest).await?;
    info!(%url, dest = %dest.display(), bytes = received, "download complete");
    Ok(())
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

/// Unpack the member of a `.tar.gz` whose file name is `member` to `dest`.
pub fn extract_tar_member(archive: &Path, member: &str, dest: &Path) -> Result<()> {
    let mut tar = Archive::new(GzDecoder::new(File::open(archive)?));
    for entry in tar.entries()? {
        let mut entry = entry?;
        let matches = entry.path()?.file_name().is_some_and(|n| n == member);
        if matches && entry.header().entry_type().is_file() {
            let part = part_path(dest);
            let mut out = File::create(&part)?;
            std::io::copy(&mut entry, &mut out)?;
            out.sync_all()?;
            std::fs::rename(&part, dest)?;
            return Ok(());
        }
    }
    Err(VirtError::Download {
        url: archive.display().to_string(),
        message: format!("archive has no member named {member}"),
    })
}

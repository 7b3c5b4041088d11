use anyhow::{Context, Result, bail};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sysinfo::Disks;
use tokio::fs;
use tracing::{debug, info};

use chatvault_types::FileRef;

use crate::error::DownloadError;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "tiff", "bmp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Images,
    Files,
}

impl Category {
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Images => "images",
            Self::Files => "files",
        }
    }

    pub fn for_extension(ext: &str) -> Self {
        if IMAGE_EXTENSIONS.contains(&ext) {
            Self::Images
        } else {
            Self::Files
        }
    }
}

/// How a target path was populated from existing bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    HardLink,
    /// Source and target live on different volumes.
    Copy,
}

/// Free-space source for the capacity check.
pub trait DiskSpace: Send + Sync {
    /// Free bytes on the volume holding `path`, if it can be determined.
    fn available(&self, path: &Path) -> Option<u64>;
}

/// Reads mounted volumes through `sysinfo`.
pub struct SystemDiskSpace;

impl DiskSpace for SystemDiskSpace {
    fn available(&self, path: &Path) -> Option<u64> {
        let path = std::fs::canonicalize(path).ok()?;
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|d| path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| d.available_space())
    }
}

/// Manages the on-disk attachment tree.
///
/// Files live at `{root}/{images|files}/{channel}/{YYYY-MM}/{file_id}.{ext}`.
/// Identical content referenced from several messages shares one inode.
pub struct Storage {
    root: PathBuf,
    disk: Arc<dyn DiskSpace>,
}

impl Storage {
    pub async fn new(root: PathBuf) -> Result<Self> {
        Self::with_disk_space(root, Arc::new(SystemDiskSpace)).await
    }

    pub async fn with_disk_space(root: PathBuf, disk: Arc<dyn DiskSpace>) -> Result<Self> {
        for category in [Category::Images, Category::Files] {
            let dir = root.join(category.dir_name());
            fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        info!("File storage root: {}", root.display());
        Ok(Self { root, disk })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic target path for an attachment.
    pub fn file_path(&self, file: &FileRef) -> PathBuf {
        let ext = extension(&file.name, &file.file_type);
        self.root
            .join(Category::for_extension(&ext).dir_name())
            .join(path_component(&file.channel_id))
            .join(file.uploaded_at.format("%Y-%m").to_string())
            .join(format!("{}.{}", path_component(&file.id), ext))
    }

    /// Free bytes on the volume holding the storage root, if it can be
    /// determined.
    pub fn available_space(&self) -> Option<u64> {
        self.disk.available(&self.root)
    }

    pub fn ensure_capacity(&self, needed: u64) -> Result<(), DownloadError> {
        let available = self.available_space();
        if available.is_none() {
            debug!("Free space for {} unknown, skipping capacity check", self.root.display());
        }
        check_capacity(needed, available)
    }

    /// Populate `target` with the bytes at `source`: a hard link where
    /// possible, otherwise a copy. Whatever was at `target` is replaced.
    pub async fn link_or_copy(&self, source: &Path, target: &Path) -> Result<LinkKind> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        remove_if_exists(target).await?;

        let linked = fs::hard_link(source, target).await;
        complete_link(source, target, linked).await
    }

    /// Delete a stored file. Returns `false` when it was already gone.
    pub async fn delete_file(&self, path: &Path) -> Result<bool> {
        if !path.starts_with(&self.root) {
            bail!("refusing to delete {} outside storage root", path.display());
        }
        remove_if_exists(path).await
    }

    /// Remove `dir` and its ancestors while they are empty, never touching
    /// the storage root itself. Returns how many directories were removed.
    pub async fn prune_empty_dirs(&self, dir: &Path) -> Result<usize> {
        let mut removed = 0;
        let mut current = dir.to_path_buf();

        while current.starts_with(&self.root) && current != self.root {
            match fs::remove_dir(&current).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) if e.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to remove {}", current.display()));
                }
            }
            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => break,
            }
        }

        Ok(removed)
    }
}

/// Settle a hard-link attempt. Where the volume cannot link at all the
/// bytes are copied through a `.part` sibling and renamed into place.
async fn complete_link(source: &Path, target: &Path, linked: io::Result<()>) -> Result<LinkKind> {
    match linked {
        Ok(()) => Ok(LinkKind::HardLink),
        Err(e)
            if matches!(
                e.kind(),
                ErrorKind::CrossesDevices | ErrorKind::PermissionDenied | ErrorKind::Unsupported
            ) =>
        {
            debug!("Hard link {} -> {} failed ({}), copying", source.display(), target.display(), e);
            let part = part_path(target);
            fs::copy(source, &part)
                .await
                .with_context(|| format!("failed to copy {} to {}", source.display(), part.display()))?;
            fs::rename(&part, target)
                .await
                .with_context(|| format!("failed to move {} into place", part.display()))?;
            Ok(LinkKind::Copy)
        }
        Err(e) => Err(e).with_context(|| format!("failed to link {} to {}", source.display(), target.display())),
    }
}

/// Capacity rule on its own: unknown free space does not block a download.
pub fn check_capacity(needed: u64, available: Option<u64>) -> Result<(), DownloadError> {
    match available {
        Some(available) if available < needed => Err(DownloadError::InsufficientSpace { needed, available }),
        _ => Ok(()),
    }
}

/// Temporary sibling used while a file is being written.
pub fn part_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.part", name))
}

async fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
}

/// Lowercase extension from the file name, falling back to the declared type.
fn extension(name: &str, file_type: &str) -> String {
    let from_name = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| valid_extension(e));
    let from_type = Some(file_type).filter(|t| valid_extension(t));

    from_name
        .or(from_type)
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| "bin".to_string())
}

fn valid_extension(ext: &str) -> bool {
    !ext.is_empty() && ext.len() <= 10 && ext.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Remote ids become directory and file names; keep them to one component.
fn path_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() { "_".to_string() } else { cleaned }
}

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Disk,
    Partition,
    Loop,
    Optical,
    Ram,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockDevice {
    pub path: PathBuf,
    /// Total size in bytes
    pub size: u64,
    pub kind: DeviceKind,
    /// Whole-disk device a partition belongs to
    pub parent: Option<PathBuf>,
    /// Filesystem signature as reported by the inventory (`ext4`, `xfs`, ...)
    pub filesystem: Option<String>,
    /// `st_rdev` of the device node, when known
    pub devnum: Option<u64>,
    pub removable: bool,
}

impl BlockDevice {
    /// A whole disk eligible for auto-detection.
    pub fn is_whole_disk(&self) -> bool {
        self.kind == DeviceKind::Disk
    }

    pub fn filesystem_kind(&self) -> FilesystemKind {
        self.filesystem
            .as_deref()
            .map(FilesystemKind::from_str)
            .unwrap_or(FilesystemKind::Unknown)
    }
}

/// Filesystem kinds the imaging strategy cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemKind {
    Ext2,
    Ext3,
    Ext4,
    Other(String),
    Unknown,
}

impl FilesystemKind {
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "ext2" => Self::Ext2,
            "ext3" => Self::Ext3,
            "ext4" | "ext4dev" => Self::Ext4,
            "" => Self::Unknown,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_ext_family(&self) -> bool {
        matches!(self, Self::Ext2 | Self::Ext3 | Self::Ext4)
    }
}

impl fmt::Display for FilesystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ext2 => f.write_str("ext2"),
            Self::Ext3 => f.write_str("ext3"),
            Self::Ext4 => f.write_str("ext4"),
            Self::Other(s) => f.write_str(s),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// One line of the kernel mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: PathBuf,
    pub fstype: String,
}

pub trait HardwareAdapter: Send + Sync {
    /// Every block device the system knows about, disks and partitions, in
    /// enumeration order.
    fn list_devices(&self) -> Result<Vec<BlockDevice>>;

    /// Currently active mounts, in mount-table order.
    fn list_mounts(&self) -> Result<Vec<MountEntry>>;

    /// Fail with `ExportError::NotPrivileged` when the process cannot read raw
    /// devices or freeze filesystems.
    fn check_privileges(&self) -> Result<()>;

    /// Whether filesystem write suspension is available at all.
    fn supports_freeze(&self) -> bool;

    /// Suspend writes on the filesystem mounted at `mount`.
    /// NOTE: blocking; the kernel waits for in-flight writes to drain.
    fn freeze(&self, mount: &Path) -> Result<()>;

    /// Resume writes on the filesystem mounted at `mount`.
    fn thaw(&self, mount: &Path) -> Result<()>;

    /// Device number of the filesystem holding `path`.
    fn device_of(&self, path: &Path) -> Result<Option<u64>> {
        let st = nix::sys::stat::stat(path)
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        Ok(Some(st.st_dev as u64))
    }

    /// Bytes available to unprivileged writers at `path`.
    fn available_space(&self, path: &Path) -> Result<u64> {
        let vfs = nix::sys::statvfs::statvfs(path)
            .with_context(|| format!("Failed to statvfs {}", path.display()))?;
        Ok(vfs.blocks_available() as u64 * vfs.fragment_size() as u64)
    }
}

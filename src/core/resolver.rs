//! Device and partition resolution.
//!
//! Both lookups are pure functions of the adapter's inventory, so the same
//! inventory always yields the same device and target.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::hardware::{BlockDevice, FilesystemKind, HardwareAdapter};
use crate::error::ExportError;

/// The device or partition that is actually read during capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ImageTarget {
    Device {
        path: PathBuf,
        size: u64,
    },
    Partition {
        path: PathBuf,
        size: u64,
        filesystem: FilesystemKind,
    },
}

impl ImageTarget {
    pub fn path(&self) -> &Path {
        match self {
            Self::Device { path, .. } | Self::Partition { path, .. } => path,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            Self::Device { size, .. } | Self::Partition { size, .. } => *size,
        }
    }

    pub fn filesystem(&self) -> FilesystemKind {
        match self {
            Self::Device { .. } => FilesystemKind::Unknown,
            Self::Partition { filesystem, .. } => filesystem.clone(),
        }
    }
}

impl fmt::Display for ImageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device { path, .. } => write!(f, "device {}", path.display()),
            Self::Partition {
                path, filesystem, ..
            } => write!(f, "{} partition {}", filesystem, path.display()),
        }
    }
}

/// Validate an explicit device, or pick the first whole disk in enumeration
/// order.
pub fn resolve_device(
    adapter: &dyn HardwareAdapter,
    explicit: Option<&Path>,
) -> Result<BlockDevice> {
    let devices = adapter.list_devices()?;

    if let Some(path) = explicit {
        let wanted = canonical(path);
        return devices
            .into_iter()
            .find(|d| canonical(&d.path) == wanted)
            .inspect(|d| info!(device = %d.path.display(), size = d.size, "Using configured device"))
            .ok_or_else(|| ExportError::InvalidDevice(path.to_path_buf()).into());
    }

    let device = devices
        .into_iter()
        .find(|d| d.is_whole_disk())
        .ok_or(ExportError::NoDeviceFound)?;

    info!(device = %device.path.display(), size = device.size, "Auto-detected device");
    Ok(device)
}

/// Partitions of `device`, in enumeration order.
pub fn partitions_of(adapter: &dyn HardwareAdapter, device: &BlockDevice) -> Result<Vec<BlockDevice>> {
    let wanted = canonical(&device.path);
    Ok(adapter
        .list_devices()?
        .into_iter()
        .filter(|d| d.parent.as_deref().map(canonical).as_ref() == Some(&wanted))
        .collect())
}

/// First ext2/3/4 partition, falling back to the whole device.
pub fn resolve_target(device: &BlockDevice, partitions: &[BlockDevice]) -> ImageTarget {
    for part in partitions {
        let filesystem = part.filesystem_kind();
        debug!(partition = %part.path.display(), filesystem = %filesystem, "Inspecting partition");
        if filesystem.is_ext_family() {
            info!(partition = %part.path.display(), filesystem = %filesystem, "Selected partition");
            return ImageTarget::Partition {
                path: part.path.clone(),
                size: part.size,
                filesystem,
            };
        }
    }

    warn!(
        device = %device.path.display(),
        "No ext2/3/4 partition found, imaging the whole device"
    );
    ImageTarget::Device {
        path: device.path.clone(),
        size: device.size,
    }
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SimulatedAdapter;
    use crate::error::export_error;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn auto_detect_skips_loop_and_optical() {
        let adapter = SimulatedAdapter::new()
            .with_loop("/dev/loop0", GIB)
            .with_optical("/dev/sr0", GIB)
            .with_disk("/dev/sda", 10 * GIB)
            .with_disk("/dev/sdb", 20 * GIB);

        let device = resolve_device(&adapter, None).unwrap();
        assert_eq!(device.path, PathBuf::from("/dev/sda"));
        assert_eq!(device.size, 10 * GIB);
    }

    #[test]
    fn no_whole_disk_is_an_error() {
        let adapter = SimulatedAdapter::new().with_loop("/dev/loop0", GIB);
        let err = resolve_device(&adapter, None).unwrap_err();
        assert!(matches!(export_error(&err), Some(ExportError::NoDeviceFound)));
    }

    #[test]
    fn explicit_device_must_exist_in_inventory() {
        let adapter = SimulatedAdapter::new().with_disk("/dev/sda", GIB);

        let err = resolve_device(&adapter, Some(Path::new("/dev/sdz"))).unwrap_err();
        assert!(matches!(
            export_error(&err),
            Some(ExportError::InvalidDevice(p)) if p == Path::new("/dev/sdz")
        ));

        let ok = resolve_device(&adapter, Some(Path::new("/dev/sda"))).unwrap();
        assert_eq!(ok.path, PathBuf::from("/dev/sda"));
    }

    #[test]
    fn first_ext_partition_wins() {
        let adapter = SimulatedAdapter::new()
            .with_disk("/dev/sda", 10 * GIB)
            .with_partition("/dev/sda1", "/dev/sda", GIB, Some("vfat"))
            .with_partition("/dev/sda2", "/dev/sda", 4 * GIB, Some("ext3"))
            .with_partition("/dev/sda3", "/dev/sda", 5 * GIB, Some("ext4"));

        let device = resolve_device(&adapter, None).unwrap();
        let partitions = partitions_of(&adapter, &device).unwrap();
        assert_eq!(partitions.len(), 3);

        let target = resolve_target(&device, &partitions);
        assert_eq!(
            target,
            ImageTarget::Partition {
                path: PathBuf::from("/dev/sda2"),
                size: 4 * GIB,
                filesystem: FilesystemKind::Ext3,
            }
        );
    }

    #[test]
    fn falls_back_to_whole_device() {
        let adapter = SimulatedAdapter::new()
            .with_disk("/dev/sda", 10 * GIB)
            .with_partition("/dev/sda1", "/dev/sda", GIB, Some("xfs"));

        let device = resolve_device(&adapter, None).unwrap();
        let partitions = partitions_of(&adapter, &device).unwrap();
        let target = resolve_target(&device, &partitions);

        assert_eq!(target.path(), Path::new("/dev/sda"));
        assert_eq!(target.size(), 10 * GIB);
        assert_eq!(target.filesystem(), FilesystemKind::Unknown);
    }
}

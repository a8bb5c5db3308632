use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use nix::unistd::Uid;
use tracing::debug;

use crate::core::hardware::{BlockDevice, DeviceKind, HardwareAdapter, MountEntry};
use crate::core::mounts::parse_mount_table;
use crate::error::ExportError;

const MOUNT_TABLE: &str = "/proc/self/mounts";
const SECTOR_SIZE: u64 = 512;

// <linux/fs.h>: FIFREEZE _IOWR('X', 119, int), FITHAW _IOWR('X', 120, int)
nix::ioctl_readwrite!(fifreeze, b'X', 119, libc::c_int);
nix::ioctl_readwrite!(fithaw, b'X', 120, libc::c_int);

/// Hardware adapter backed by udev, procfs and the FIFREEZE/FITHAW ioctls.
#[derive(Debug, Default)]
pub struct LinuxAdapter;

impl LinuxAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl HardwareAdapter for LinuxAdapter {
    fn list_devices(&self) -> Result<Vec<BlockDevice>> {
        let mut enumerator = udev::Enumerator::new().context("Failed to create udev enumerator")?;
        enumerator
            .match_subsystem("block")
            .context("Failed to filter udev devices")?;

        let mut devices = Vec::new();
        for dev in enumerator
            .scan_devices()
            .context("Failed to scan block devices")?
        {
            let Some(node) = dev.devnode() else {
                continue;
            };

            let sysname = dev.sysname().to_string_lossy().into_owned();
            let devtype = dev
                .devtype()
                .map(|t| t.to_string_lossy().into_owned())
                .unwrap_or_default();

            let kind = classify(&sysname, &devtype, dev.property_value("ID_CDROM").is_some());

            let size = dev
                .attribute_value("size")
                .and_then(|v| v.to_str())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(0)
                * SECTOR_SIZE;

            let parent = if kind == DeviceKind::Partition {
                dev.parent_with_subsystem_devtype("block", "disk")
                    .ok()
                    .flatten()
                    .and_then(|p| p.devnode().map(Path::to_path_buf))
            } else {
                None
            };

            let removable = dev
                .attribute_value("removable")
                .map(|v| v == "1")
                .unwrap_or(false);

            let device = BlockDevice {
                path: node.to_path_buf(),
                size,
                kind,
                parent,
                filesystem: dev
                    .property_value("ID_FS_TYPE")
                    .map(|v| v.to_string_lossy().into_owned()),
                devnum: dev.devnum().map(|n| n as u64),
                removable,
            };

            debug!(
                device = %device.path.display(),
                kind = ?device.kind,
                size = device.size,
                filesystem = device.filesystem.as_deref().unwrap_or("-"),
                "Found block device"
            );
            devices.push(device);
        }

        Ok(devices)
    }

    fn list_mounts(&self) -> Result<Vec<MountEntry>> {
        let content = std::fs::read_to_string(MOUNT_TABLE)
            .with_context(|| format!("Failed to read {}", MOUNT_TABLE))?;
        Ok(parse_mount_table(&content))
    }

    fn check_privileges(&self) -> Result<()> {
        if Uid::effective().is_root() {
            Ok(())
        } else {
            Err(ExportError::NotPrivileged.into())
        }
    }

    fn supports_freeze(&self) -> bool {
        // FIFREEZE needs CAP_SYS_ADMIN
        Uid::effective().is_root()
    }

    fn freeze(&self, mount: &Path) -> Result<()> {
        let dir = open_mount(mount)?;
        let mut arg: libc::c_int = 0;
        // SAFETY: `dir` is an open descriptor for the lifetime of the call and
        // FIFREEZE ignores its argument.
        unsafe { fifreeze(dir.as_raw_fd(), &mut arg) }
            .map_err(|e| anyhow!("FIFREEZE {}: {}", mount.display(), e))?;
        Ok(())
    }

    fn thaw(&self, mount: &Path) -> Result<()> {
        let dir = open_mount(mount)?;
        let mut arg: libc::c_int = 0;
        // SAFETY: as in `freeze`.
        unsafe { fithaw(dir.as_raw_fd(), &mut arg) }
            .map_err(|e| anyhow!("FITHAW {}: {}", mount.display(), e))?;
        Ok(())
    }
}

fn open_mount(mount: &Path) -> Result<File> {
    File::open(mount).with_context(|| format!("Failed to open mount point {}", mount.display()))
}

fn classify(sysname: &str, devtype: &str, is_cdrom: bool) -> DeviceKind {
    if devtype == "partition" {
        DeviceKind::Partition
    } else if sysname.starts_with("loop") {
        DeviceKind::Loop
    } else if is_cdrom || sysname.starts_with("sr") {
        DeviceKind::Optical
    } else if sysname.starts_with("ram") || sysname.starts_with("zram") {
        DeviceKind::Ram
    } else {
        DeviceKind::Disk
    }
}
